//! Shared Wasmtime engine with epoch-based interruption.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use wasmtime::{Config, Engine};

/// How often the ticker thread advances the engine epoch. Guest deadlines
/// are expressed in ticks of this interval.
pub const EPOCH_TICK: Duration = Duration::from_millis(20);

/// Shared Wasmtime engine.
///
/// Constructed once and shared across all module loads and invocations.
/// A background thread advances the epoch so per-call deadlines set via
/// `Store::set_epoch_deadline` interrupt runaway guests. `close` stops the
/// ticker and is the single teardown step for the whole runtime.
pub struct RuntimeContext {
    pub engine: Engine,
    shutdown: Arc<AtomicBool>,
    ticker: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RuntimeContext {
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);

        let engine = Engine::new(&config)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let ticker_engine = engine.clone();
        let ticker_shutdown = Arc::clone(&shutdown);
        let ticker = std::thread::Builder::new()
            .name("alfred-epoch-ticker".into())
            .spawn(move || {
                while !ticker_shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    ticker_engine.increment_epoch();
                }
            })?;

        tracing::debug!("runtime context initialized (async + epoch interruption)");

        Ok(Self {
            engine,
            shutdown,
            ticker: std::sync::Mutex::new(Some(ticker)),
        })
    }

    /// Number of epoch ticks covering `timeout`, rounded up, at least one.
    pub fn deadline_ticks(timeout: Duration) -> u64 {
        let tick_ms = EPOCH_TICK.as_millis().max(1);
        ((timeout.as_millis() + tick_ms - 1) / tick_ms).max(1) as u64
    }

    /// Stop the epoch ticker. Idempotent.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_ticks_rounds_up() {
        assert_eq!(RuntimeContext::deadline_ticks(Duration::from_millis(1)), 1);
        assert_eq!(RuntimeContext::deadline_ticks(Duration::from_millis(20)), 1);
        assert_eq!(RuntimeContext::deadline_ticks(Duration::from_millis(21)), 2);
        assert_eq!(
            RuntimeContext::deadline_ticks(Duration::from_secs(30)),
            1500
        );
    }

    #[test]
    fn close_is_idempotent() {
        let ctx = RuntimeContext::new().unwrap();
        ctx.close();
        ctx.close();
    }
}
