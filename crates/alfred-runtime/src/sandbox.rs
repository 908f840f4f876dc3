//! Per-guest resource and capability bounds.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RuntimeError;

/// A named slice of the host ABI a guest may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    Log,
    Config,
    EventBus,
    Tool,
}

impl Capability {
    /// Capabilities every guest receives without asking.
    pub const ALWAYS_GRANTED: [Capability; 2] = [Capability::Log, Capability::Config];

    /// Host function names this capability unlocks.
    pub fn host_functions(self) -> &'static [&'static str] {
        match self {
            Capability::Log => &["log"],
            Capability::Config => &["get_config"],
            Capability::EventBus => &["emit_event"],
            Capability::Tool => &["tool_result"],
        }
    }
}

impl FromStr for Capability {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(Capability::Log),
            "config" => Ok(Capability::Config),
            "event_bus" => Ok(Capability::EventBus),
            "tool" => Ok(Capability::Tool),
            other => Err(RuntimeError::PermissionDenied(format!(
                "unknown capability {other:?}"
            ))),
        }
    }
}

const DEFAULT_MEMORY_MB: u64 = 64;
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource and capability bounds for one guest, derived from its manifest.
#[derive(Debug, Clone)]
pub struct GuestSandbox {
    pub memory_mb: u64,
    pub exec_timeout: Duration,
    granted: BTreeSet<Capability>,
}

impl GuestSandbox {
    /// Build a sandbox. Unknown capability strings are rejected, so a
    /// manifest typo cannot silently grant nothing.
    pub fn new(
        memory_mb: Option<u64>,
        exec_timeout: Option<Duration>,
        requested: &[String],
    ) -> Result<Self, RuntimeError> {
        let mut granted: BTreeSet<Capability> = Capability::ALWAYS_GRANTED.into_iter().collect();
        for name in requested {
            granted.insert(name.parse()?);
        }
        Ok(Self {
            memory_mb: memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
            exec_timeout: exec_timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT),
            granted,
        })
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    pub fn granted(&self) -> impl Iterator<Item = Capability> + '_ {
        self.granted.iter().copied()
    }

    /// Linear memory ceiling in bytes (whole 64 KiB pages).
    pub fn memory_bytes(&self) -> usize {
        (self.memory_mb as usize) * 1024 * 1024
    }

    /// True when `function` in the `alfred_v1` namespace is callable.
    pub fn allows_host_function(&self, function: &str) -> bool {
        self.granted
            .iter()
            .any(|cap| cap.host_functions().contains(&function))
    }
}

impl Default for GuestSandbox {
    fn default() -> Self {
        Self::new(None, None, &[]).expect("defaults are valid")
    }
}
