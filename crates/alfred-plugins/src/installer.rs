//! Download, verify, and extract plugin archives.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::EntryType;

use crate::error::PluginError;
use crate::manifest::{MANIFEST_FILE, PluginManifest};
use crate::registry::Registry;

/// Cap on a single extracted file; defends against decompression bombs.
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Installs registry plugins into the local plugin directory.
pub struct Installer {
    registry: Arc<Registry>,
    install_dir: PathBuf,
    http: reqwest::Client,
}

impl Installer {
    pub fn new(registry: Arc<Registry>, install_dir: impl AsRef<Path>) -> Self {
        Self {
            registry,
            install_dir: install_dir.as_ref().to_path_buf(),
            http: reqwest::Client::new(),
        }
    }

    fn dest_for(&self, name: &str) -> PathBuf {
        self.install_dir.join(name)
    }

    /// Install a plugin by registry name. The destination directory must
    /// not exist yet.
    pub async fn install(&self, name: &str) -> Result<PathBuf, PluginError> {
        let entry = self.registry.find(name).await?;
        let dest = self.dest_for(name);
        if dest.exists() {
            return Err(PluginError::Duplicate(format!(
                "{name} already installed at {}",
                dest.display()
            )));
        }
        self.fetch_and_extract(name, &entry.download_url, &entry.checksum, &dest)
            .await?;
        tracing::info!(plugin = %name, dest = %dest.display(), "plugin installed");
        Ok(dest)
    }

    /// Replace an installed plugin with the current registry version.
    pub async fn update(&self, name: &str) -> Result<PathBuf, PluginError> {
        let dest = self.dest_for(name);
        if !dest.exists() {
            return Err(PluginError::NotFound(format!(
                "{name} is not installed; nothing to update"
            )));
        }
        let entry = self.registry.find(name).await?;
        std::fs::remove_dir_all(&dest)?;
        self.fetch_and_extract(name, &entry.download_url, &entry.checksum, &dest)
            .await?;
        tracing::info!(plugin = %name, "plugin updated");
        Ok(dest)
    }

    /// Recursively delete an installed plugin.
    pub async fn remove(&self, name: &str) -> Result<(), PluginError> {
        let dest = self.dest_for(name);
        if !dest.exists() {
            return Err(PluginError::NotFound(name.to_string()));
        }
        std::fs::remove_dir_all(&dest)?;
        tracing::info!(plugin = %name, "plugin removed");
        Ok(())
    }

    async fn fetch_and_extract(
        &self,
        name: &str,
        download_url: &str,
        checksum: &str,
        dest: &Path,
    ) -> Result<(), PluginError> {
        if download_url.is_empty() {
            return Err(PluginError::Install(format!("{name}: no download URL")));
        }

        tracing::debug!(plugin = %name, url = %download_url, "downloading plugin archive");
        let bytes = self
            .http
            .get(download_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        if !checksum.is_empty() {
            let actual = hex::encode(Sha256::digest(&bytes));
            if actual != checksum.to_lowercase() {
                return Err(PluginError::ChecksumMismatch {
                    name: name.to_string(),
                    expected: checksum.to_lowercase(),
                    actual,
                });
            }
        }

        let result = extract_archive(&bytes, dest).and_then(|()| verify_manifest(dest, name));
        if let Err(e) = result {
            // Leave no partial state behind.
            let _ = std::fs::remove_dir_all(dest);
            return Err(e);
        }
        Ok(())
    }
}

/// Extract a gzipped tar archive into `dest`.
///
/// Every entry's cleaned target must be `dest` itself or a descendant.
/// Regular files are capped at [`MAX_FILE_SIZE`]; entry types other than
/// files and directories are ignored.
pub fn extract_archive(archive: &[u8], dest: &Path) -> Result<(), PluginError> {
    std::fs::create_dir_all(dest)?;
    let mut tar = tar::Archive::new(GzDecoder::new(archive));

    for entry in tar.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.to_path_buf();
        let target = safe_join(dest, &raw_path)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = std::fs::File::create(&target)?;
                let mut limited = (&mut entry).take(MAX_FILE_SIZE);
                std::io::copy(&mut limited, &mut out)?;
            }
            other => {
                tracing::debug!(
                    entry = %raw_path.display(),
                    kind = ?other,
                    "skipping non-regular archive entry"
                );
            }
        }
    }
    Ok(())
}

/// Lexically join an archive entry path onto `dest`, rejecting anything
/// that would land outside it.
fn safe_join(dest: &Path, entry_path: &Path) -> Result<PathBuf, PluginError> {
    let mut target = dest.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PluginError::PathTraversal(
                    entry_path.display().to_string(),
                ));
            }
        }
    }
    if target != dest && !target.starts_with(dest) {
        return Err(PluginError::PathTraversal(
            entry_path.display().to_string(),
        ));
    }
    Ok(target)
}

/// Post-extraction check: the destination must now hold a valid manifest
/// for the expected plugin name. Anything else is a hard failure.
fn verify_manifest(dest: &Path, expected_name: &str) -> Result<(), PluginError> {
    let manifest_path = dest.join(MANIFEST_FILE);
    let manifest = PluginManifest::from_file(&manifest_path).map_err(|e| {
        PluginError::Install(format!(
            "{expected_name}: archive has no valid manifest: {e}"
        ))
    })?;
    if manifest.name != expected_name {
        return Err(PluginError::Install(format!(
            "archive manifest names {:?}, expected {expected_name:?}",
            manifest.name
        )));
    }
    Ok(())
}
