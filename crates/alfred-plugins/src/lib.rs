//! Plugin system for the Alfred agent runtime.
//!
//! Plugins are directories holding a `plugin.yaml` manifest plus artefacts;
//! guest-module plugins additionally ship a WASM binary executed by
//! `alfred-runtime`. The [`PluginManager`] owns the loaded set and the hook
//! registry; the [`Registry`] and [`Installer`] fetch, verify, and extract
//! signed plugin archives.

pub mod error;
pub mod gate;
pub mod guest_plugin;
pub mod installer;
pub mod manager;
pub mod manifest;
pub mod registry;

pub use error::PluginError;
pub use gate::PermissionGate;
pub use guest_plugin::GuestPlugin;
pub use installer::Installer;
pub use manager::{HookHandler, Plugin, PluginDeps, PluginManager};
pub use manifest::{PluginManifest, WasmConfig, discover_plugins};
pub use registry::{Registry, RegistryEntry};
