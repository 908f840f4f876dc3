//! Manifest permission policy enforcement.

use crate::error::PluginError;
use crate::manifest::PluginManifest;

/// Validates a manifest's requested permissions against the host policy.
///
/// Deny dominates allow: a permission on both lists is rejected. A
/// non-empty allow list acts as a whitelist; an empty one allows anything
/// not denied.
pub struct PermissionGate;

impl PermissionGate {
    pub fn validate(
        manifest: &PluginManifest,
        allow: &[String],
        deny: &[String],
    ) -> Result<(), PluginError> {
        for permission in &manifest.permissions {
            if deny.iter().any(|d| d == permission) {
                return Err(PluginError::PermissionDenied {
                    plugin: manifest.name.clone(),
                    permission: permission.clone(),
                });
            }
            if !allow.is_empty() && !allow.iter().any(|a| a == permission) {
                return Err(PluginError::PermissionDenied {
                    plugin: manifest.name.clone(),
                    permission: permission.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(permissions: &[&str]) -> PluginManifest {
        PluginManifest {
            name: "sample".into(),
            version: "1.0.0".into(),
            description: String::new(),
            author: String::new(),
            types: vec![],
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            wasm: None,
        }
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_policy_allows_everything() {
        let m = manifest(&["memory:read", "network:http"]);
        PermissionGate::validate(&m, &[], &[]).unwrap();
    }

    #[test]
    fn denied_permission_rejected() {
        let m = manifest(&["shell:exec"]);
        let err = PermissionGate::validate(&m, &[], &list(&["shell:exec"])).unwrap_err();
        match err {
            PluginError::PermissionDenied { plugin, permission } => {
                assert_eq!(plugin, "sample");
                assert_eq!(permission, "shell:exec");
            }
            other => panic!("expected PermissionDenied, got {other:?}"),
        }
    }

    #[test]
    fn allowlist_rejects_unlisted() {
        let m = manifest(&["memory:read", "network:http"]);
        let err =
            PermissionGate::validate(&m, &list(&["memory:read"]), &[]).unwrap_err();
        assert!(matches!(
            err,
            PluginError::PermissionDenied { permission, .. } if permission == "network:http"
        ));
    }

    #[test]
    fn deny_dominates_allow() {
        let m = manifest(&["memory:read"]);
        let err = PermissionGate::validate(
            &m,
            &list(&["memory:read"]),
            &list(&["memory:read"]),
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
    }

    #[test]
    fn no_permissions_always_passes() {
        let m = manifest(&[]);
        PermissionGate::validate(&m, &list(&["x"]), &list(&["y"])).unwrap();
    }
}
