//! Filesystem path confinement.

use std::path::{Path, PathBuf};

use crate::error::SecurityError;

/// Resolves and validates paths against a single root directory.
///
/// Symlinks are fully dereferenced before the containment check, so a link
/// inside the root pointing outside it is rejected.
#[derive(Debug)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    /// Canonicalize `root` and require it to be an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SecurityError> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            SecurityError::SandboxInit(format!("cannot resolve root {}: {e}", root.display()))
        })?;
        if !canonical.is_dir() {
            return Err(SecurityError::SandboxInit(format!(
                "sandbox root is not a directory: {}",
                canonical.display()
            )));
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` to its canonical form and verify containment.
    ///
    /// Relative paths are taken relative to the root. A path that does not
    /// exist yet is accepted when its parent resolves inside the root.
    pub fn validate(&self, requested: impl AsRef<Path>) -> Result<PathBuf, SecurityError> {
        let requested = requested.as_ref();
        let absolute = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let resolved = match absolute.canonicalize() {
            Ok(p) => p,
            // Not on disk yet: resolve the parent and re-attach the leaf.
            Err(_) => {
                let parent = absolute.parent().ok_or_else(|| {
                    SecurityError::PathOutsideSandbox(requested.display().to_string())
                })?;
                let name = absolute.file_name().ok_or_else(|| {
                    SecurityError::PathOutsideSandbox(requested.display().to_string())
                })?;
                let parent = parent.canonicalize().map_err(|_| {
                    SecurityError::PathOutsideSandbox(requested.display().to_string())
                })?;
                parent.join(name)
            }
        };

        if resolved == self.root || resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            tracing::warn!(
                requested = %requested.display(),
                resolved = %resolved.display(),
                root = %self.root.display(),
                "path escapes sandbox"
            );
            Err(SecurityError::PathOutsideSandbox(
                requested.display().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, PathSandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = PathSandbox::new(dir.path()).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn new_rejects_missing_root() {
        let err = PathSandbox::new("/definitely/not/a/real/dir").unwrap_err();
        assert!(matches!(err, SecurityError::SandboxInit(_)));
    }

    #[test]
    fn new_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        let err = PathSandbox::new(&file).unwrap_err();
        assert!(matches!(err, SecurityError::SandboxInit(_)));
    }

    #[test]
    fn accepts_root_itself() {
        let (_dir, sandbox) = sandbox();
        let validated = sandbox.validate(sandbox.root().to_path_buf()).unwrap();
        assert_eq!(validated, sandbox.root());
    }

    #[test]
    fn accepts_relative_child() {
        let (_dir, sandbox) = sandbox();
        std::fs::create_dir(sandbox.root().join("sub")).unwrap();
        let validated = sandbox.validate("sub").unwrap();
        assert!(validated.starts_with(sandbox.root()));
    }

    #[test]
    fn accepts_nonexistent_leaf_with_valid_parent() {
        let (_dir, sandbox) = sandbox();
        let validated = sandbox.validate("new-file.txt").unwrap();
        assert_eq!(validated, sandbox.root().join("new-file.txt"));
    }

    #[test]
    fn rejects_dotdot_escape() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox.validate("../outside").unwrap_err();
        assert!(matches!(err, SecurityError::PathOutsideSandbox(_)));
    }

    #[test]
    fn rejects_absolute_outside() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox.validate("/etc/passwd").unwrap_err();
        assert!(matches!(err, SecurityError::PathOutsideSandbox(_)));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escaping_root() {
        let (_dir, sandbox) = sandbox();
        let outside = tempfile::tempdir().unwrap();
        let link = sandbox.root().join("escape");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let err = sandbox.validate("escape").unwrap_err();
        assert!(matches!(err, SecurityError::PathOutsideSandbox(_)));
    }

    #[cfg(unix)]
    #[test]
    fn accepts_symlink_staying_inside() {
        let (_dir, sandbox) = sandbox();
        let target = sandbox.root().join("target");
        std::fs::create_dir(&target).unwrap();
        let link = sandbox.root().join("alias");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let validated = sandbox.validate("alias").unwrap();
        assert!(validated.starts_with(sandbox.root()));
    }
}
