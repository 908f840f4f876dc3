//! Core contracts for the Alfred agent runtime.
//!
//! This crate defines the seams the rest of the workspace plugs into: the
//! process-wide [`EventBus`], the audit event model consumed by
//! [`AuditLogger`] implementations, the collaborator traits for memory,
//! tools, and command execution, and the host configuration loaded from
//! `alfred.toml`.
//!
//! Nothing here performs side effects beyond the in-process
//! [`BroadcastBus`]; concrete sandboxes, stores, and runtimes live in the
//! sibling crates.

pub mod audit;
pub mod config;
pub mod events;
pub mod memory;
pub mod stubs;
pub mod traits;

pub use audit::{AuditError, AuditEvent, AuditLogger};
pub use config::AlfredConfig;
pub use events::{BroadcastBus, BusEvent, EventBus, Subscription};
pub use memory::{MemoryEntry, MemoryError};
pub use traits::{
    CommandExecutor, CommandOutput, ExecError, MemoryProvider, Tool, ToolError, ToolExecutor,
    ToolResult, ToolSchema,
};
