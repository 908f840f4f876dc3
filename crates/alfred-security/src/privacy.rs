//! Consent, export, and deletion of subject data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use alfred_core::audit::{AuditEvent, AuditLogger, kinds};
use alfred_core::traits::MemoryProvider;

use crate::error::SecurityError;

const CONSENT_FILE: &str = "consent.json";

/// Persisted consent state for the data subject.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsentRecord {
    #[serde(default)]
    pub granted: bool,
    #[serde(default)]
    pub granted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Exported data document shape.
#[derive(Debug, Serialize)]
struct ExportDocument {
    user_id: String,
    exported_at: DateTime<Utc>,
    memory: Vec<alfred_core::MemoryEntry>,
}

/// GDPR-facing operations over the injected memory provider.
pub struct PrivacyHandler {
    data_dir: PathBuf,
    user_id: String,
    memory: Arc<dyn MemoryProvider>,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl PrivacyHandler {
    pub fn new(
        data_dir: impl AsRef<Path>,
        user_id: impl Into<String>,
        memory: Arc<dyn MemoryProvider>,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> Result<Self, SecurityError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            user_id: user_id.into(),
            memory,
            audit,
        })
    }

    fn consent_path(&self) -> PathBuf {
        self.data_dir.join(CONSENT_FILE)
    }

    pub fn load_consent(&self) -> Result<ConsentRecord, SecurityError> {
        match std::fs::read_to_string(self.consent_path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConsentRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_consent(&self, record: &ConsentRecord) -> Result<(), SecurityError> {
        let json = serde_json::to_string_pretty(record)?;
        write_owner_only(&self.consent_path(), json.as_bytes())?;
        Ok(())
    }

    /// True until consent has been granted and not subsequently revoked.
    pub fn needs_consent(&self) -> Result<bool, SecurityError> {
        let record = self.load_consent()?;
        Ok(!record.granted || record.revoked_at.is_some())
    }

    pub fn grant_consent(&self) -> Result<(), SecurityError> {
        let record = ConsentRecord {
            granted: true,
            granted_at: Some(Utc::now()),
            revoked_at: None,
        };
        self.save_consent(&record)?;
        self.audit_event(
            AuditEvent::new(kinds::DATA_EVENT)
                .actor(&self.user_id)
                .action("consent_granted")
                .outcome("success"),
        );
        Ok(())
    }

    pub fn revoke_consent(&self) -> Result<(), SecurityError> {
        let mut record = self.load_consent()?;
        record.revoked_at = Some(Utc::now());
        self.save_consent(&record)?;
        self.audit_event(
            AuditEvent::new(kinds::DATA_EVENT)
                .actor(&self.user_id)
                .action("consent_revoked")
                .outcome("success"),
        );
        Ok(())
    }

    /// Write every memory entry for the subject to `output_path` as an
    /// indented JSON document.
    pub async fn export(&self, output_path: &Path) -> Result<usize, SecurityError> {
        let entries = self
            .memory
            .query("", usize::MAX)
            .await
            .map_err(|e| SecurityError::Consent(format!("export query failed: {e}")))?;

        let document = ExportDocument {
            user_id: self.user_id.clone(),
            exported_at: Utc::now(),
            memory: entries,
        };
        let json = serde_json::to_string_pretty(&document)?;
        write_owner_only(output_path, json.as_bytes())?;

        let count = document.memory.len();
        self.audit_event(
            AuditEvent::new(kinds::GDPR_EXPORT)
                .actor(&self.user_id)
                .resource(output_path.display().to_string())
                .outcome("success")
                .detail("entries", count.to_string()),
        );
        tracing::info!(entries = count, path = %output_path.display(), "subject data exported");
        Ok(count)
    }

    /// Delete a single entry by id.
    pub async fn delete_entry(&self, id: &str) -> Result<(), SecurityError> {
        self.memory
            .delete(id)
            .await
            .map_err(|e| SecurityError::Consent(format!("delete failed: {e}")))?;
        self.audit_event(
            AuditEvent::new(kinds::GDPR_DELETE)
                .actor(&self.user_id)
                .resource(id)
                .outcome("success"),
        );
        Ok(())
    }

    /// Delete every entry for the subject. The first failure aborts the
    /// sweep and propagates; there is no best-effort partial deletion.
    pub async fn delete_all(&self) -> Result<usize, SecurityError> {
        let entries = self
            .memory
            .query("", usize::MAX)
            .await
            .map_err(|e| SecurityError::Consent(format!("delete query failed: {e}")))?;

        let mut deleted = 0usize;
        for entry in &entries {
            self.memory
                .delete(&entry.id)
                .await
                .map_err(|e| SecurityError::Consent(format!("delete {} failed: {e}", entry.id)))?;
            deleted += 1;
        }

        self.audit_event(
            AuditEvent::new(kinds::GDPR_DELETE)
                .actor(&self.user_id)
                .outcome("success")
                .detail("entries", deleted.to_string()),
        );
        tracing::info!(entries = deleted, "subject data deleted");
        Ok(deleted)
    }

    fn audit_event(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log(event) {
                tracing::warn!(error = %e, "privacy audit event not recorded");
            }
        }
    }
}

fn write_owner_only(path: &Path, content: &[u8]) -> Result<(), SecurityError> {
    use std::io::Write as _;
    let mut options = std::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    Ok(())
}
