//! Guest module loading and invocation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use wasmtime::{Instance, InstancePre, Module, Store, Trap};

use alfred_core::events::EventBus;
use alfred_core::traits::ToolResult;

use crate::context::RuntimeContext;
use crate::error::RuntimeError;
use crate::host::{HOST_MODULE, HostState, build_linker};
use crate::sandbox::GuestSandbox;

/// Exports whose presence marks a guest as a hook provider.
pub const HOOK_EXPORTS: [&str; 4] = [
    "on_message_received",
    "on_before_tool_exec",
    "on_after_tool_exec",
    "on_response_ready",
];

const TOOL_EXECUTE: &str = "tool_execute";
const TOOL_SCHEMA: &str = "tool_schema";
const INIT_EXPORT: &str = "_init";
const CLOSE_EXPORT: &str = "_close";

/// Everything needed to load one guest.
pub struct GuestSpec {
    pub name: String,
    pub wasm: Vec<u8>,
    pub sandbox: GuestSandbox,
    /// Injected configuration returned verbatim by `get_config`.
    pub config_json: Option<String>,
    pub bus: Option<Arc<dyn EventBus>>,
}

/// A compiled, pre-instantiated guest.
pub struct GuestModule {
    pub name: String,
    instance_pre: InstancePre<HostState>,
    sandbox: GuestSandbox,
    config_json: Option<String>,
    bus: Option<Arc<dyn EventBus>>,
    exports: BTreeSet<String>,
    /// Set at load time by probing exports; no reflection at call time.
    pub is_hook_provider: bool,
    pub is_tool_provider: bool,
}

impl std::fmt::Debug for GuestModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestModule")
            .field("name", &self.name)
            .field("is_hook_provider", &self.is_hook_provider)
            .field("is_tool_provider", &self.is_tool_provider)
            .finish_non_exhaustive()
    }
}

impl GuestModule {
    pub fn has_export(&self, name: &str) -> bool {
        self.exports.contains(name)
    }

    pub fn sandbox(&self) -> &GuestSandbox {
        &self.sandbox
    }
}

/// The process-wide guest runtime.
///
/// Owns the Wasmtime engine and the name → module registry. Multiple
/// concurrent invocations are supported; each creates its own `Store` so
/// guests never share state across calls.
pub struct GuestRuntime {
    ctx: Arc<RuntimeContext>,
    modules: RwLock<HashMap<String, Arc<GuestModule>>>,
}

impl GuestRuntime {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            ctx: Arc::new(RuntimeContext::new()?),
            modules: RwLock::new(HashMap::new()),
        })
    }

    /// Compile and register a guest module.
    ///
    /// Fails when the binary does not compile, omits the `malloc`/`free`
    /// allocator exports, or imports host functions outside its granted
    /// capabilities.
    pub async fn load(&self, spec: GuestSpec) -> Result<Arc<GuestModule>, RuntimeError> {
        let name = spec.name.clone();

        {
            let modules = self.modules.read().await;
            if let Some(existing) = modules.get(&name) {
                tracing::debug!(module = %name, "guest already loaded");
                return Ok(Arc::clone(existing));
            }
        }

        tracing::info!(module = %name, bytes = spec.wasm.len(), "loading guest module");

        // `Module::new` accepts both the binary format and WAT text, which
        // keeps test guests readable.
        let module = Module::new(&self.ctx.engine, &spec.wasm)
            .map_err(|e| RuntimeError::CompilationFailed(format!("{name}: {e}")))?;

        let exports: BTreeSet<String> =
            module.exports().map(|e| e.name().to_string()).collect();
        for required in ["memory", "malloc", "free"] {
            if !exports.contains(required) {
                return Err(RuntimeError::InvalidModule(format!(
                    "{name}: missing required export {required:?}"
                )));
            }
        }

        // Capability enforcement happens here: only granted host functions
        // exist in the linker, so an ungranted import cannot resolve.
        for import in module.imports() {
            if import.module() != HOST_MODULE {
                return Err(RuntimeError::InstantiationFailed(format!(
                    "{name}: unresolved import {}::{}",
                    import.module(),
                    import.name()
                )));
            }
            if !spec.sandbox.allows_host_function(import.name()) {
                return Err(RuntimeError::PermissionDenied(format!(
                    "{name}: host function {:?} requires an ungranted capability",
                    import.name()
                )));
            }
        }

        let linker = build_linker(&self.ctx.engine, &spec.sandbox)?;
        let instance_pre = linker
            .instantiate_pre(&module)
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{name}: {e}")))?;

        let is_hook_provider = HOOK_EXPORTS.iter().any(|h| exports.contains(*h));
        let is_tool_provider = exports.contains(TOOL_EXECUTE);

        let loaded = Arc::new(GuestModule {
            name: name.clone(),
            instance_pre,
            sandbox: spec.sandbox,
            config_json: spec.config_json,
            bus: spec.bus,
            exports,
            is_hook_provider,
            is_tool_provider,
        });

        self.modules
            .write()
            .await
            .insert(name.clone(), Arc::clone(&loaded));

        tracing::info!(
            module = %name,
            hooks = is_hook_provider,
            tool = is_tool_provider,
            "guest module ready"
        );
        Ok(loaded)
    }

    pub async fn unload(&self, name: &str) -> Result<(), RuntimeError> {
        self.modules
            .write()
            .await
            .remove(name)
            .map(|_| tracing::info!(module = %name, "guest module unloaded"))
            .ok_or_else(|| RuntimeError::ModuleNotFound(name.to_string()))
    }

    pub async fn module(&self, name: &str) -> Option<Arc<GuestModule>> {
        self.modules.read().await.get(name).cloned()
    }

    /// Tear down all guests and stop the engine. Single-step shutdown.
    pub async fn close(&self) {
        self.modules.write().await.clear();
        self.ctx.close();
    }

    async fn get_module(&self, name: &str) -> Result<Arc<GuestModule>, RuntimeError> {
        self.module(name)
            .await
            .ok_or_else(|| RuntimeError::ModuleNotFound(name.to_string()))
    }

    /// Invoke a fire-and-forget hook such as `on_message_received`.
    /// A guest without the export is a no-op.
    pub async fn invoke_hook(
        &self,
        name: &str,
        hook: &str,
        payload: &[u8],
    ) -> Result<(), RuntimeError> {
        let guest = self.get_module(name).await?;
        if !guest.has_export(hook) {
            return Ok(());
        }
        self.call(&guest, hook, payload, CallKind::Notify)
            .await
            .map(|_| ())
    }

    /// Invoke a string-transforming hook (`on_response_ready`).
    /// A guest that returns `(0, 0)` keeps the original string.
    pub async fn invoke_transform(
        &self,
        name: &str,
        hook: &str,
        input: &str,
    ) -> Result<String, RuntimeError> {
        let guest = self.get_module(name).await?;
        if !guest.has_export(hook) {
            return Ok(input.to_string());
        }
        let outcome = self
            .call(&guest, hook, input.as_bytes(), CallKind::Transform)
            .await?;
        match outcome.returned {
            Some(bytes) => String::from_utf8(bytes).map_err(|e| {
                RuntimeError::ToolFailure(format!("{name}: {hook} returned invalid UTF-8: {e}"))
            }),
            None => Ok(input.to_string()),
        }
    }

    /// Invoke the guest's `tool_execute` entry point with JSON parameters.
    ///
    /// The result is whatever the guest recorded through the `tool_result`
    /// host call: parsed as a structured [`ToolResult`] when possible,
    /// wrapped as raw content otherwise, and synthesized as `ok` when the
    /// guest recorded nothing.
    pub async fn invoke_tool(
        &self,
        name: &str,
        params: &[u8],
    ) -> Result<ToolResult, RuntimeError> {
        let guest = self.get_module(name).await?;
        if !guest.is_tool_provider {
            return Err(RuntimeError::ToolFailure(format!(
                "{name} exports no {TOOL_EXECUTE}"
            )));
        }
        let outcome = self
            .call(&guest, TOOL_EXECUTE, params, CallKind::Notify)
            .await?;

        Ok(match outcome.tool_result {
            Some(bytes) => match serde_json::from_slice::<ToolResult>(&bytes) {
                Ok(result) => result,
                Err(_) => ToolResult::ok(String::from_utf8_lossy(&bytes).into_owned()),
            },
            None => ToolResult::ok("ok"),
        })
    }

    /// Fetch the guest's declared tool schema, when it exports one.
    pub async fn tool_schema(
        &self,
        name: &str,
    ) -> Result<Option<serde_json::Value>, RuntimeError> {
        let guest = self.get_module(name).await?;
        if !guest.has_export(TOOL_SCHEMA) {
            return Ok(None);
        }
        let outcome = self.call(&guest, TOOL_SCHEMA, &[], CallKind::Produce).await?;
        match outcome.returned {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                RuntimeError::ToolFailure(format!("{name}: invalid tool schema: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Run one entry point in a fresh store under the guest's sandbox.
    async fn call(
        &self,
        guest: &GuestModule,
        export: &str,
        payload: &[u8],
        kind: CallKind,
    ) -> Result<CallOutcome, RuntimeError> {
        let timeout = guest.sandbox.exec_timeout;
        let future = self.call_inner(guest, export, payload, kind);

        match tokio::time::timeout(timeout + Duration::from_secs(1), future).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(format!(
                "{}: {export} exceeded {timeout:?}",
                guest.name
            ))),
        }
    }

    async fn call_inner(
        &self,
        guest: &GuestModule,
        export: &str,
        payload: &[u8],
        kind: CallKind,
    ) -> Result<CallOutcome, RuntimeError> {
        let state = HostState::new(
            &guest.name,
            &guest.sandbox,
            guest.config_json.as_deref(),
            guest.bus.clone(),
        );
        let mut store = Store::new(&self.ctx.engine, state);
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(RuntimeContext::deadline_ticks(guest.sandbox.exec_timeout));

        let instance = guest
            .instance_pre
            .instantiate_async(&mut store)
            .await
            .map_err(|e| {
                RuntimeError::InstantiationFailed(format!("{}: {e}", guest.name))
            })?;

        if guest.has_export(INIT_EXPORT) {
            let init = instance
                .get_typed_func::<(), ()>(&mut store, INIT_EXPORT)
                .map_err(|e| map_guest_error(&guest.name, export, e))?;
            init.call_async(&mut store, ())
                .await
                .map_err(|e| map_guest_error(&guest.name, export, e))?;
        }

        let (ptr, len) = marshal_in(&mut store, &instance, payload)
            .await
            .map_err(|e| map_guest_error(&guest.name, export, e))?;

        let returned = match kind {
            CallKind::Notify => {
                let func = instance
                    .get_typed_func::<(i32, i32), ()>(&mut store, export)
                    .map_err(|e| map_guest_error(&guest.name, export, e))?;
                func.call_async(&mut store, (ptr, len))
                    .await
                    .map_err(|e| map_guest_error(&guest.name, export, e))?;
                None
            }
            CallKind::Transform => {
                let func = instance
                    .get_typed_func::<(i32, i32), (i32, i32)>(&mut store, export)
                    .map_err(|e| map_guest_error(&guest.name, export, e))?;
                let (out_ptr, out_len) = func
                    .call_async(&mut store, (ptr, len))
                    .await
                    .map_err(|e| map_guest_error(&guest.name, export, e))?;
                read_and_free(&mut store, &instance, out_ptr, out_len)
                    .await
                    .map_err(|e| map_guest_error(&guest.name, export, e))?
            }
            CallKind::Produce => {
                let func = instance
                    .get_typed_func::<(), (i32, i32)>(&mut store, export)
                    .map_err(|e| map_guest_error(&guest.name, export, e))?;
                let (out_ptr, out_len) = func
                    .call_async(&mut store, ())
                    .await
                    .map_err(|e| map_guest_error(&guest.name, export, e))?;
                read_and_free(&mut store, &instance, out_ptr, out_len)
                    .await
                    .map_err(|e| map_guest_error(&guest.name, export, e))?
            }
        };

        free_guest(&mut store, &instance, ptr, len).await;

        if guest.has_export(CLOSE_EXPORT) {
            if let Ok(close) = instance.get_typed_func::<(), ()>(&mut store, CLOSE_EXPORT) {
                if let Err(e) = close.call_async(&mut store, ()).await {
                    tracing::warn!(module = %guest.name, error = %e, "guest _close failed");
                }
            }
        }

        let tool_result = store.data_mut().tool_result.take();
        Ok(CallOutcome {
            returned,
            tool_result,
        })
    }
}

enum CallKind {
    /// `(ptr, len) -> ()`
    Notify,
    /// `(ptr, len) -> (ptr, len)`
    Transform,
    /// `() -> (ptr, len)`
    Produce,
}

struct CallOutcome {
    /// Bytes the entry point returned, `None` for `(0, 0)`.
    returned: Option<Vec<u8>>,
    /// Blob recorded via the `tool_result` host function.
    tool_result: Option<Vec<u8>>,
}

/// Copy `payload` into the guest through its allocator.
async fn marshal_in(
    store: &mut Store<HostState>,
    instance: &Instance,
    payload: &[u8],
) -> anyhow::Result<(i32, i32)> {
    if payload.is_empty() {
        return Ok((0, 0));
    }
    let malloc = instance.get_typed_func::<i32, i32>(&mut *store, "malloc")?;
    let len = i32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("payload too large for guest"))?;
    let ptr = malloc.call_async(&mut *store, len).await?;
    if ptr == 0 {
        anyhow::bail!("guest malloc returned null");
    }
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| anyhow::anyhow!("guest exports no memory"))?;
    memory.write(&mut *store, ptr as usize, payload)?;
    Ok((ptr, len))
}

/// Read `(ptr, len)` out of the guest, then release the buffer.
async fn read_and_free(
    store: &mut Store<HostState>,
    instance: &Instance,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Option<Vec<u8>>> {
    if ptr == 0 && len == 0 {
        return Ok(None);
    }
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| anyhow::anyhow!("guest exports no memory"))?;
    let start = usize::try_from(ptr).map_err(|_| anyhow::anyhow!("negative guest pointer"))?;
    let length = usize::try_from(len).map_err(|_| anyhow::anyhow!("negative guest length"))?;
    let end = start
        .checked_add(length)
        .ok_or_else(|| anyhow::anyhow!("guest pointer overflow"))?;
    let bytes = memory
        .data(&*store)
        .get(start..end)
        .ok_or_else(|| anyhow::anyhow!("guest memory read out of range: {start}..{end}"))?
        .to_vec();

    free_guest(store, instance, ptr, len).await;
    Ok(Some(bytes))
}

/// Best-effort release of a guest buffer.
async fn free_guest(store: &mut Store<HostState>, instance: &Instance, ptr: i32, len: i32) {
    if ptr == 0 {
        return;
    }
    if let Ok(free) = instance.get_typed_func::<(i32, i32), ()>(&mut *store, "free") {
        if let Err(e) = free.call_async(&mut *store, (ptr, len)).await {
            tracing::debug!(error = %e, "guest free failed");
        }
    }
}

/// Epoch-deadline traps are timeouts; everything else the guest does wrong
/// is a tool failure.
fn map_guest_error(module: &str, export: &str, error: anyhow::Error) -> RuntimeError {
    if let Some(trap) = error.downcast_ref::<Trap>() {
        if *trap == Trap::Interrupt {
            return RuntimeError::Timeout(format!("{module}: {export} hit its deadline"));
        }
    }
    RuntimeError::ToolFailure(format!("{module}: {export}: {error}"))
}
