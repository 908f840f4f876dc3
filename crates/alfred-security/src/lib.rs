//! Security core for the Alfred agent runtime.
//!
//! Four enforcement surfaces, consulted at every boundary crossing:
//!
//! - [`PathSandbox`]: canonical path validation against a single root.
//! - [`NetworkSandbox`]: SSRF protection, with forbidden CIDR checks at URL
//!   validation time and again at dial time via [`SafeResolver`].
//! - [`ContentCipher`]: authenticated encryption of at-rest content with
//!   passphrase-derived keys and background rotation.
//! - [`AuditSink`]: tamper-resistant JSON-lines audit log with age- and
//!   size-based retention.
//!
//! [`PrivacyHandler`] builds on the memory provider contract to implement
//! consent, export, and deletion of subject data.

pub mod audit;
pub mod cipher;
pub mod error;
pub mod network;
pub mod paths;
pub mod privacy;

pub use audit::{AuditSink, ComplianceAudit, RetentionPolicy, parse_retention_max_size};
pub use cipher::{ContentCipher, KeyRotator};
pub use error::SecurityError;
pub use network::{NetworkSandbox, SafeResolver};
pub use paths::PathSandbox;
pub use privacy::{ConsentRecord, PrivacyHandler};
