//! JSON-lines audit sink with retention.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use alfred_core::audit::{AuditError, AuditEvent, AuditLogger, kinds};

use crate::error::SecurityError;

/// Age- and size-based trimming limits. Zero/absent means "no limit".
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_size: Option<u64>,
}

/// Parse a human size like `10MB`, `512kb`, or a bare byte count.
pub fn parse_retention_max_size(raw: &str) -> Result<u64, SecurityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SecurityError::InvalidInput("empty size".into()));
    }
    let upper = trimmed.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = upper.strip_suffix("GB") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, 1024)
    } else if let Some(d) = upper.strip_suffix("B") {
        (d, 1)
    } else {
        (upper.as_str(), 1)
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| SecurityError::InvalidInput(format!("invalid size {raw:?}")))?;
    Ok(value * multiplier)
}

/// Append-only audit log: one JSON event per line, owner-only permissions.
pub struct AuditSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl AuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SecurityError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Missing timestamps are filled with UTC now; the
    /// event is also mirrored to the `audit` tracing target so active
    /// spans pick it up.
    pub fn log_event(&self, mut event: AuditEvent) -> Result<(), SecurityError> {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        let line = serde_json::to_string(&event)?;

        {
            let mut guard = self.file.lock().unwrap();
            let file = guard
                .as_mut()
                .ok_or_else(|| SecurityError::AuditWrite("sink is closed".into()))?;
            writeln!(file, "{line}")
                .map_err(|e| SecurityError::AuditWrite(e.to_string()))?;
        }

        tracing::debug!(
            target: "audit",
            kind = %event.kind,
            actor = %event.actor,
            resource = %event.resource,
            action = %event.action,
            outcome = %event.outcome,
            detail = ?event.detail,
            "audit event"
        );
        Ok(())
    }

    /// Record a resource access.
    pub fn log_access(
        &self,
        actor: &str,
        resource: &str,
        action: &str,
        outcome: &str,
    ) -> Result<(), SecurityError> {
        self.log_event(
            AuditEvent::new(kinds::ACCESS_LOG)
                .actor(actor)
                .resource(resource)
                .action(action)
                .outcome(outcome),
        )
    }

    /// Record a data lifecycle event under the given kind.
    pub fn log_data_event(
        &self,
        kind: &str,
        actor: &str,
        detail: &[(&str, &str)],
    ) -> Result<(), SecurityError> {
        let mut event = AuditEvent::new(kind).actor(actor).outcome("success");
        for (k, v) in detail {
            event = event.detail(*k, *v);
        }
        self.log_event(event)
    }

    /// Rewrite the log file applying `policy`, then reopen for append.
    ///
    /// Concurrent `log_event` callers block on the mutex for the duration;
    /// whatever happens mid-rewrite, the append handle is restored before
    /// returning so later writes succeed.
    pub fn enforce_retention(&self, policy: RetentionPolicy) -> Result<(), SecurityError> {
        let mut guard = self.file.lock().unwrap();
        // Close the append handle while the file is rewritten in place.
        guard.take();

        let result = rewrite_with_policy(&self.path, policy);

        match open_append(&self.path) {
            Ok(file) => *guard = Some(file),
            Err(reopen) => {
                // Surfacing the original failure matters more, but the
                // sink must not stay closed silently.
                tracing::error!(error = %reopen, "audit sink could not reopen after retention");
                return Err(result.err().unwrap_or(reopen));
            }
        }
        result
    }

    pub fn close(&self) {
        self.file.lock().unwrap().take();
    }
}

impl AuditLogger for AuditSink {
    fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.log_event(event)
            .map_err(|e| AuditError::Write(e.to_string()))
    }

    fn close(&self) {
        AuditSink::close(self);
    }
}

fn open_append(path: &Path) -> Result<File, SecurityError> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path)?;
    // An existing file keeps its old mode; tighten it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(file)
}

#[derive(Deserialize)]
struct TimestampOnly {
    timestamp: Option<DateTime<Utc>>,
}

fn rewrite_with_policy(path: &Path, policy: RetentionPolicy) -> Result<(), SecurityError> {
    let source = match File::open(path) {
        Ok(f) => f,
        // Nothing on disk yet: nothing to trim.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let cutoff = policy.max_age.map(|age| {
        Utc::now() - chrono::TimeDelta::from_std(age).unwrap_or(chrono::TimeDelta::zero())
    });

    // Pass 1: age filter, parsing only the timestamp field. Lines without
    // a parseable timestamp are kept: dropping them would let corruption
    // erase history.
    let mut survivors: Vec<String> = Vec::new();
    for line in BufReader::new(source).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let keep = match (cutoff, serde_json::from_str::<TimestampOnly>(&line)) {
            (Some(cutoff), Ok(TimestampOnly { timestamp: Some(ts) })) => ts >= cutoff,
            _ => true,
        };
        if keep {
            survivors.push(line);
        }
    }

    // Pass 2: size cap, dropping the oldest remaining lines first.
    if let Some(max_size) = policy.max_size {
        if max_size > 0 {
            let line_size = |l: &String| l.len() as u64 + 1;
            let mut total: u64 = survivors.iter().map(line_size).sum();
            let mut drop_front = 0;
            while total > max_size && drop_front < survivors.len() {
                total -= line_size(&survivors[drop_front]);
                drop_front += 1;
            }
            survivors.drain(..drop_front);
        }
    }

    let tmp_path = path.with_extension("jsonl.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for line in &survivors {
            writeln!(tmp, "{line}")?;
        }
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    tracing::info!(
        path = %path.display(),
        kept = survivors.len(),
        "audit retention enforced"
    );
    Ok(())
}

/// Wrapper that fills compliance-mandated fields before delegating.
///
/// Actor defaults to `"system"`, Action to the event kind, Outcome to
/// `"success"`, and the timestamp to UTC now.
pub struct ComplianceAudit {
    inner: Arc<dyn AuditLogger>,
}

impl ComplianceAudit {
    pub fn new(inner: Arc<dyn AuditLogger>) -> Self {
        Self { inner }
    }

    fn normalize(mut event: AuditEvent) -> AuditEvent {
        if event.actor.is_empty() {
            event.actor = "system".into();
        }
        if event.action.is_empty() {
            event.action = event.kind.clone();
        }
        if event.outcome.is_empty() {
            event.outcome = "success".into();
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        event
    }
}

impl AuditLogger for ComplianceAudit {
    fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.inner.log(Self::normalize(event))
    }

    fn close(&self) {
        self.inner.close();
    }
}
