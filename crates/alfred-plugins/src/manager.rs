//! Plugin lifecycle and hook registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use alfred_core::events::{BusEvent, EventBus, kinds};
use alfred_core::traits::Tool;
use alfred_runtime::GuestRuntime;

use crate::error::PluginError;
use crate::gate::PermissionGate;
use crate::manifest::PluginManifest;

/// Deadline for a plugin's `init`.
const INIT_DEADLINE: Duration = Duration::from_secs(10);

/// Dependencies injected into every plugin at init.
#[derive(Clone)]
pub struct PluginDeps {
    pub bus: Arc<dyn EventBus>,
    /// Plugin-specific configuration, when the host has any.
    pub config: Option<serde_json::Value>,
}

/// Chat-lifecycle hooks a plugin may provide. Defaults are pass-through,
/// so implementors override only what they handle.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn on_message_received(&self, _message: &str) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_before_tool_exec(&self, _payload: &str) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_after_tool_exec(&self, _payload: &str) -> Result<(), PluginError> {
        Ok(())
    }

    /// May rewrite the outgoing response; returning the input unchanged is
    /// the identity transform.
    async fn on_response_ready(&self, response: String) -> Result<String, PluginError> {
        Ok(response)
    }
}

/// A loadable plugin. Hook and tool faces are probed once at load time.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    async fn init(&self, deps: PluginDeps) -> Result<(), PluginError>;

    async fn close(&self) -> Result<(), PluginError>;

    fn hooks(&self) -> Option<Arc<dyn HookHandler>> {
        None
    }

    fn tool(&self) -> Option<Arc<dyn Tool>> {
        None
    }
}

/// Owns loaded plugins, their manifests, and the hook list.
///
/// Maps are behind an `RwLock`; the duplicate check runs once under a read
/// lock before the (slow) init and again under the write lock at
/// registration, closing the window where two loads of the same name race.
pub struct PluginManager {
    bus: Arc<dyn EventBus>,
    runtime: Option<Arc<GuestRuntime>>,
    allow: Vec<String>,
    deny: Vec<String>,
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    manifests: RwLock<HashMap<String, PluginManifest>>,
    hooks: RwLock<Vec<(String, Arc<dyn HookHandler>)>>,
}

impl PluginManager {
    pub fn new(
        bus: Arc<dyn EventBus>,
        runtime: Option<Arc<GuestRuntime>>,
        allow: Vec<String>,
        deny: Vec<String>,
    ) -> Self {
        Self {
            bus,
            runtime,
            allow,
            deny,
            plugins: RwLock::new(HashMap::new()),
            manifests: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Validate, initialize, and register a plugin.
    pub async fn load(
        &self,
        plugin: Arc<dyn Plugin>,
        config: Option<serde_json::Value>,
    ) -> Result<(), PluginError> {
        let manifest = plugin.manifest().clone();
        let name = manifest.name.clone();

        PermissionGate::validate(&manifest, &self.allow, &self.deny)?;

        {
            let plugins = self.plugins.read().await;
            if plugins.contains_key(&name) {
                return Err(PluginError::Duplicate(name));
            }
        }

        tracing::info!(plugin = %name, version = %manifest.version, "initializing plugin");
        let deps = PluginDeps {
            bus: Arc::clone(&self.bus),
            config,
        };
        match tokio::time::timeout(INIT_DEADLINE, plugin.init(deps)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PluginError::InitFailed(format!("{name}: {e}"))),
            Err(_) => {
                return Err(PluginError::Timeout(format!(
                    "{name}: init exceeded {INIT_DEADLINE:?}"
                )));
            }
        }

        {
            let mut plugins = self.plugins.write().await;
            // Re-check under the write lock: a second load may have won the
            // race while this one was initializing.
            if plugins.contains_key(&name) {
                drop(plugins);
                if let Err(e) = plugin.close().await {
                    tracing::warn!(plugin = %name, error = %e, "close after duplicate load failed");
                }
                return Err(PluginError::Duplicate(name));
            }

            plugins.insert(name.clone(), Arc::clone(&plugin));
            self.manifests
                .write()
                .await
                .insert(name.clone(), manifest.clone());
            if let Some(hooks) = plugin.hooks() {
                self.hooks.write().await.push((name.clone(), hooks));
            }
        }

        self.bus.publish(BusEvent::new(
            kinds::PLUGIN_LOADED,
            serde_json::json!({ "name": name, "version": manifest.version }),
        ));
        tracing::info!(plugin = %name, "plugin loaded");
        Ok(())
    }

    /// Remove a plugin. Close errors are logged, never returned.
    pub async fn unload(&self, name: &str) -> Result<(), PluginError> {
        let plugin = {
            let mut plugins = self.plugins.write().await;
            let plugin = plugins
                .remove(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            self.manifests.write().await.remove(name);

            // Drop every hook the departing plugin registered.
            let mut hooks = self.hooks.write().await;
            hooks.retain(|(owner, _)| owner != name);
            plugin
        };

        if let Err(e) = plugin.close().await {
            tracing::warn!(plugin = %name, error = %e, "plugin close failed");
        }

        self.bus.publish(BusEvent::new(
            kinds::PLUGIN_UNLOADED,
            serde_json::json!({ "name": name }),
        ));
        tracing::info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Close every plugin, then tear down the guest runtime.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<dyn Plugin>)> = {
            let mut plugins = self.plugins.write().await;
            self.manifests.write().await.clear();
            self.hooks.write().await.clear();
            plugins.drain().collect()
        };

        for (name, plugin) in drained {
            if let Err(e) = plugin.close().await {
                tracing::warn!(plugin = %name, error = %e, "plugin close failed during shutdown");
            }
        }

        if let Some(runtime) = &self.runtime {
            runtime.close().await;
        }
        tracing::info!("plugin manager shut down");
    }

    /// Snapshot of loaded manifests. A defensive copy: mutating it cannot
    /// touch manager state.
    pub async fn list(&self) -> Vec<PluginManifest> {
        self.manifests.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().await.get(name).cloned()
    }

    /// Snapshot of registered hook handlers, in load order.
    pub async fn get_hooks(&self) -> Vec<Arc<dyn HookHandler>> {
        self.hooks
            .read()
            .await
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }

    /// Tool face of a loaded plugin, when it provides one.
    pub async fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.plugins.read().await.get(name).and_then(|p| p.tool())
    }
}
