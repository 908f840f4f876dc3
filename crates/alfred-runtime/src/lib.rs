//! Embedded WASM guest runtime for Alfred.
//!
//! Loads untrusted guest modules, instantiates them against the
//! capability-scoped `alfred_v1` host ABI, and invokes their exported entry
//! points under memory and time bounds. One [`GuestRuntime`] exists per
//! process; every invocation gets its own `Store`, so guests are stateless
//! across calls.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use alfred_runtime::{GuestRuntime, GuestSandbox, GuestSpec};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let runtime = GuestRuntime::new()?;
//!
//! let wasm = std::fs::read("/path/to/plugin.wasm")?;
//! runtime
//!     .load(GuestSpec {
//!         name: "greeter".into(),
//!         wasm,
//!         sandbox: GuestSandbox::new(None, None, &["tool".into()])?,
//!         config_json: Some(r#"{"lang":"en"}"#.into()),
//!         bus: None,
//!     })
//!     .await?;
//!
//! let result = runtime.invoke_tool("greeter", br#"{"name":"ada"}"#).await?;
//! println!("{}", result.content);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod host;
pub mod runtime;
pub mod sandbox;

pub use context::RuntimeContext;
pub use error::RuntimeError;
pub use runtime::{GuestModule, GuestRuntime, GuestSpec};
pub use sandbox::{Capability, GuestSandbox};
