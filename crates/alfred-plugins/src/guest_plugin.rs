//! Adapter exposing a loaded guest module as a [`Plugin`].

use std::sync::Arc;

use async_trait::async_trait;

use alfred_core::traits::{Tool, ToolError, ToolResult};
use alfred_runtime::{GuestRuntime, GuestSandbox, GuestSpec, RuntimeError};

use crate::error::PluginError;
use crate::manager::{HookHandler, Plugin, PluginDeps};
use crate::manifest::PluginManifest;

/// A plugin whose behavior lives in a WASM guest module.
///
/// Construction loads the binary into the shared [`GuestRuntime`]; hook and
/// tool provision are read off the module's exports at that point.
pub struct GuestPlugin {
    manifest: PluginManifest,
    runtime: Arc<GuestRuntime>,
    is_hook_provider: bool,
    is_tool_provider: bool,
}

impl std::fmt::Debug for GuestPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestPlugin")
            .field("manifest", &self.manifest)
            .field("is_hook_provider", &self.is_hook_provider)
            .field("is_tool_provider", &self.is_tool_provider)
            .finish_non_exhaustive()
    }
}

impl GuestPlugin {
    /// Load the manifest's declared binary under its sandbox settings.
    pub async fn load(
        manifest: PluginManifest,
        manifest_dir: &std::path::Path,
        runtime: Arc<GuestRuntime>,
        deps: &PluginDeps,
    ) -> Result<Arc<Self>, PluginError> {
        let wasm_config = manifest.wasm.clone().ok_or_else(|| {
            PluginError::InvalidManifest(format!("{}: no wasm section", manifest.name))
        })?;

        let sandbox = GuestSandbox::new(
            wasm_config.max_memory_mb,
            wasm_config.exec_timeout,
            &wasm_config.capabilities,
        )
        .map_err(|e| match e {
            RuntimeError::PermissionDenied(m) => PluginError::PermissionDenied {
                plugin: manifest.name.clone(),
                permission: m,
            },
            other => PluginError::Runtime(other),
        })?;

        let binary_path = manifest_dir.join(&wasm_config.binary);
        let wasm = std::fs::read(&binary_path).map_err(|e| {
            PluginError::Install(format!(
                "{}: cannot read wasm binary {}: {e}",
                manifest.name,
                binary_path.display()
            ))
        })?;

        let config_json = deps
            .config
            .as_ref()
            .map(|c| serde_json::to_string(c))
            .transpose()?;

        let module = runtime
            .load(GuestSpec {
                name: manifest.name.clone(),
                wasm,
                sandbox,
                config_json,
                bus: Some(Arc::clone(&deps.bus)),
            })
            .await?;

        Ok(Arc::new(Self {
            manifest,
            runtime,
            is_hook_provider: module.is_hook_provider,
            is_tool_provider: module.is_tool_provider,
        }))
    }
}

#[async_trait]
impl Plugin for GuestPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn init(&self, _deps: PluginDeps) -> Result<(), PluginError> {
        // The module is loaded and its `_init` export runs per invocation;
        // nothing to do beyond confirming the module is present.
        if self.runtime.module(&self.manifest.name).await.is_none() {
            return Err(PluginError::NotFound(self.manifest.name.clone()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PluginError> {
        match self.runtime.unload(&self.manifest.name).await {
            Ok(()) | Err(RuntimeError::ModuleNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn hooks(&self) -> Option<Arc<dyn HookHandler>> {
        if self.is_hook_provider {
            Some(Arc::new(GuestHooks {
                name: self.manifest.name.clone(),
                runtime: Arc::clone(&self.runtime),
            }))
        } else {
            None
        }
    }

    fn tool(&self) -> Option<Arc<dyn Tool>> {
        if self.is_tool_provider {
            Some(Arc::new(GuestTool {
                name: self.manifest.name.clone(),
                description: self.manifest.description.clone(),
                runtime: Arc::clone(&self.runtime),
            }))
        } else {
            None
        }
    }
}

struct GuestHooks {
    name: String,
    runtime: Arc<GuestRuntime>,
}

#[async_trait]
impl HookHandler for GuestHooks {
    async fn on_message_received(&self, message: &str) -> Result<(), PluginError> {
        self.runtime
            .invoke_hook(&self.name, "on_message_received", message.as_bytes())
            .await
            .map_err(Into::into)
    }

    async fn on_before_tool_exec(&self, payload: &str) -> Result<(), PluginError> {
        self.runtime
            .invoke_hook(&self.name, "on_before_tool_exec", payload.as_bytes())
            .await
            .map_err(Into::into)
    }

    async fn on_after_tool_exec(&self, payload: &str) -> Result<(), PluginError> {
        self.runtime
            .invoke_hook(&self.name, "on_after_tool_exec", payload.as_bytes())
            .await
            .map_err(Into::into)
    }

    async fn on_response_ready(&self, response: String) -> Result<String, PluginError> {
        self.runtime
            .invoke_transform(&self.name, "on_response_ready", &response)
            .await
            .map_err(Into::into)
    }
}

struct GuestTool {
    name: String,
    description: String,
    runtime: Arc<GuestRuntime>,
}

#[async_trait]
impl Tool for GuestTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolResult, ToolError> {
        let bytes = serde_json::to_vec(&params)
            .map_err(|e| ToolError::Failure(format!("{}: {e}", self.name)))?;
        match self.runtime.invoke_tool(&self.name, &bytes).await {
            Ok(result) => Ok(result),
            Err(RuntimeError::Timeout(m)) => Err(ToolError::Timeout(m)),
            Err(e) => Err(ToolError::Failure(e.to_string())),
        }
    }
}
