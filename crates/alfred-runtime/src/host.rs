//! The `alfred_v1` host ABI.
//!
//! Thin adapters from guest linear memory to host services. Only the
//! functions unlocked by the guest's granted capabilities are linked; an
//! import of anything else fails the module at load time, which is where
//! capability enforcement lives.
//!
//! | Function | Signature | Capability |
//! |---|---|---|
//! | `log` | `(i32, i32, i32) -> ()` | `log` |
//! | `get_config` | `(i32, i32) -> (i32, i32)` | `config` |
//! | `emit_event` | `(i32, i32, i32, i32) -> ()` | `event_bus` |
//! | `tool_result` | `(i32, i32) -> ()` | `tool` |

use std::sync::Arc;

use anyhow::{Context, anyhow};
use wasmtime::{Caller, Engine, Linker, StoreLimits, StoreLimitsBuilder};

use alfred_core::events::{BusEvent, EventBus};

use crate::sandbox::{Capability, GuestSandbox};

/// Host ABI namespace. Stable; bump only with a new namespace.
pub const HOST_MODULE: &str = "alfred_v1";

/// Per-invocation host-side state, fresh for every guest call.
pub struct HostState {
    pub(crate) plugin: String,
    pub(crate) config_json: String,
    pub(crate) bus: Option<Arc<dyn EventBus>>,
    /// Result blob the guest recorded through `tool_result`, if any.
    pub(crate) tool_result: Option<Vec<u8>>,
    pub(crate) limits: StoreLimits,
}

impl HostState {
    pub fn new(
        plugin: &str,
        sandbox: &GuestSandbox,
        config_json: Option<&str>,
        bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            config_json: config_json.unwrap_or_default().to_string(),
            bus,
            tool_result: None,
            limits: StoreLimitsBuilder::new()
                .memory_size(sandbox.memory_bytes())
                .build(),
        }
    }
}

/// Bounds-checked read from the guest's exported linear memory.
fn read_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Vec<u8>> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow!("guest exports no memory"))?;

    let start = usize::try_from(ptr).map_err(|_| anyhow!("negative guest pointer"))?;
    let len = usize::try_from(len).map_err(|_| anyhow!("negative guest length"))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| anyhow!("guest pointer overflow"))?;

    let data = memory.data(&caller);
    let slice = data
        .get(start..end)
        .ok_or_else(|| anyhow!("guest memory read out of range: {start}..{end}"))?;
    Ok(slice.to_vec())
}

fn read_guest_string(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<String> {
    let bytes = read_guest_bytes(caller, ptr, len)?;
    String::from_utf8(bytes).context("guest sent invalid UTF-8")
}

/// Build a linker exposing exactly the host functions `sandbox` grants.
pub fn build_linker(
    engine: &Engine,
    sandbox: &GuestSandbox,
) -> anyhow::Result<Linker<HostState>> {
    let mut linker: Linker<HostState> = Linker::new(engine);

    if sandbox.grants(Capability::Log) {
        linker.func_wrap(
            HOST_MODULE,
            "log",
            |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                let message = read_guest_string(&mut caller, ptr, len)?;
                let plugin = caller.data().plugin.clone();
                match level {
                    i32::MIN..=0 => tracing::debug!(target: "guest", plugin = %plugin, "{message}"),
                    1 => tracing::info!(target: "guest", plugin = %plugin, "{message}"),
                    2 => tracing::warn!(target: "guest", plugin = %plugin, "{message}"),
                    _ => tracing::error!(target: "guest", plugin = %plugin, "{message}"),
                }
                Ok(())
            },
        )?;
    }

    if sandbox.grants(Capability::Config) {
        // The key argument is read but currently unused: the full config
        // document is returned regardless. The signature reserves room for
        // per-key lookup without an ABI break.
        linker.func_wrap_async(
            HOST_MODULE,
            "get_config",
            |mut caller: Caller<'_, HostState>, (kptr, klen): (i32, i32)| {
                Box::new(async move {
                    let _key = read_guest_string(&mut caller, kptr, klen)?;
                    let config = caller.data().config_json.clone();
                    write_to_guest(&mut caller, config.as_bytes()).await
                })
            },
        )?;
    }

    if sandbox.grants(Capability::EventBus) {
        linker.func_wrap(
            HOST_MODULE,
            "emit_event",
            |mut caller: Caller<'_, HostState>, tp: i32, tl: i32, pp: i32, pl: i32| {
                let kind = read_guest_string(&mut caller, tp, tl)?;
                let raw = read_guest_bytes(&mut caller, pp, pl)?;
                let payload = serde_json::from_slice(&raw).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&raw).into_owned())
                });

                let state = caller.data();
                match &state.bus {
                    Some(bus) => {
                        tracing::debug!(plugin = %state.plugin, kind = %kind, "guest event");
                        bus.publish(BusEvent::new(kind, payload));
                    }
                    None => {
                        tracing::warn!(plugin = %state.plugin, kind = %kind, "guest event dropped: no bus wired");
                    }
                }
                Ok(())
            },
        )?;
    }

    if sandbox.grants(Capability::Tool) {
        linker.func_wrap(
            HOST_MODULE,
            "tool_result",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                let bytes = read_guest_bytes(&mut caller, ptr, len)?;
                caller.data_mut().tool_result = Some(bytes);
                Ok(())
            },
        )?;
    }

    Ok(linker)
}

/// Allocate in the guest via its `malloc` export, copy `bytes` in, and
/// return the `(ptr, len)` pair. A zero-length payload is a no-op `(0, 0)`.
pub(crate) async fn write_to_guest(
    caller: &mut Caller<'_, HostState>,
    bytes: &[u8],
) -> anyhow::Result<(i32, i32)> {
    if bytes.is_empty() {
        return Ok((0, 0));
    }

    let malloc = caller
        .get_export("malloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| anyhow!("guest exports no malloc"))?
        .typed::<i32, i32>(&*caller)?;

    let len = i32::try_from(bytes.len()).map_err(|_| anyhow!("payload too large for guest"))?;
    let ptr = malloc.call_async(&mut *caller, len).await?;
    if ptr == 0 {
        return Err(anyhow!("guest malloc returned null"));
    }

    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow!("guest exports no memory"))?;
    memory.write(&mut *caller, ptr as usize, bytes)?;
    Ok((ptr, len))
}
