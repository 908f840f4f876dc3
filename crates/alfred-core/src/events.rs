//! Process-wide event fan-out.
//!
//! Components publish typed [`BusEvent`]s (plugin lifecycle, workflow
//! transitions) and subscribers register handlers for a single kind or for
//! everything. Delivery within `publish` is synchronous and in registration
//! order, so an event published while registering a component is observed
//! before anything that component emits afterwards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Dotted kind tag, e.g. `workflow.paused` or `plugin.loaded`.
    pub kind: String,
    /// Structured payload; shape depends on the kind.
    pub payload: serde_json::Value,
    /// Publication instant (UTC).
    pub ts: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            ts: Utc::now(),
        }
    }
}

/// Well-known event kinds published by the core.
pub mod kinds {
    pub const PLUGIN_LOADED: &str = "plugin.loaded";
    pub const PLUGIN_UNLOADED: &str = "plugin.unloaded";
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_PAUSED: &str = "workflow.paused";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
}

pub type EventHandler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Fan-out of typed events to registered handlers.
pub trait EventBus: Send + Sync {
    /// Deliver an event to every matching subscriber.
    fn publish(&self, event: BusEvent);

    /// Register a handler for one event kind. Dropping the returned
    /// [`Subscription`] unregisters it.
    fn subscribe(&self, kind: &str, handler: EventHandler) -> Subscription;

    /// Register a handler for every event kind.
    fn subscribe_all(&self, handler: EventHandler) -> Subscription;

    /// Stop delivery; subsequent publishes are dropped.
    fn close(&self);
}

/// Handle to an active subscription. Cancels on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Explicitly unregister the handler.
    pub fn cancel(mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

struct SinkEntry {
    id: u64,
    /// `None` subscribes to every kind.
    kind: Option<String>,
    handler: EventHandler,
}

/// In-process [`EventBus`] backed by a registered sink list.
///
/// Handlers run on the publisher's task, in registration order. Handlers
/// must not publish re-entrantly from within themselves while holding
/// references into the bus; publishing new events from a handler is fine.
pub struct BroadcastBus {
    sinks: Arc<Mutex<Vec<SinkEntry>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self {
            sinks: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn register(&self, kind: Option<String>, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut sinks = self.sinks.lock().unwrap();
            sinks.push(SinkEntry { id, kind, handler });
        }
        let weak: Weak<Mutex<Vec<SinkEntry>>> = Arc::downgrade(&self.sinks);
        Subscription::new(move || {
            if let Some(sinks) = weak.upgrade() {
                let mut sinks = sinks.lock().unwrap();
                sinks.retain(|s| s.id != id);
            }
        })
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: BusEvent) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(kind = %event.kind, "event dropped: bus closed");
            return;
        }
        // Snapshot under the lock, dispatch outside it so handlers may
        // subscribe or publish without deadlocking.
        let handlers: Vec<EventHandler> = {
            let sinks = self.sinks.lock().unwrap();
            sinks
                .iter()
                .filter(|s| s.kind.as_deref().is_none_or(|k| k == event.kind))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        tracing::trace!(kind = %event.kind, subscribers = handlers.len(), "publishing event");
        for handler in handlers {
            handler(&event);
        }
    }

    fn subscribe(&self, kind: &str, handler: EventHandler) -> Subscription {
        self.register(Some(kind.to_string()), handler)
    }

    fn subscribe_all(&self, handler: EventHandler) -> Subscription {
        self.register(None, handler)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sinks.lock().unwrap().clear();
    }
}

/// Capture sink for tests and diagnostics: records every event it sees.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<BusEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach to a bus, recording all events until the subscription drops.
    pub fn attach(self: &Arc<Self>, bus: &dyn EventBus) -> Subscription {
        let recorder = Arc::clone(self);
        bus.subscribe_all(Arc::new(move |event| {
            recorder.events.lock().unwrap().push(event.clone());
        }))
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }

    /// Count of recorded events per kind.
    pub fn kind_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for event in self.events.lock().unwrap().iter() {
            *counts.entry(event.kind.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_kind_subscriber() {
        let bus = BroadcastBus::new();
        let recorder = EventRecorder::new();
        let rec = Arc::clone(&recorder);
        let _sub = bus.subscribe(
            kinds::WORKFLOW_STARTED,
            Arc::new(move |e| rec.events.lock().unwrap().push(e.clone())),
        );

        bus.publish(BusEvent::new(kinds::WORKFLOW_STARTED, serde_json::json!({"run": "r1"})));
        bus.publish(BusEvent::new(kinds::WORKFLOW_FAILED, serde_json::json!({})));

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, kinds::WORKFLOW_STARTED);
        assert_eq!(events[0].payload["run"], "r1");
    }

    #[test]
    fn subscribe_all_sees_every_kind() {
        let bus = BroadcastBus::new();
        let recorder = EventRecorder::new();
        let _sub = recorder.attach(&bus);

        bus.publish(BusEvent::new(kinds::PLUGIN_LOADED, serde_json::json!({})));
        bus.publish(BusEvent::new(kinds::PLUGIN_UNLOADED, serde_json::json!({})));

        assert_eq!(
            recorder.kinds(),
            vec![kinds::PLUGIN_LOADED, kinds::PLUGIN_UNLOADED]
        );
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let bus = BroadcastBus::new();
        let recorder = EventRecorder::new();
        let sub = recorder.attach(&bus);

        bus.publish(BusEvent::new("a", serde_json::json!({})));
        sub.cancel();
        bus.publish(BusEvent::new("b", serde_json::json!({})));

        assert_eq!(recorder.kinds(), vec!["a"]);
    }

    #[test]
    fn close_drops_subsequent_events() {
        let bus = BroadcastBus::new();
        let recorder = EventRecorder::new();
        let _sub = recorder.attach(&bus);

        bus.publish(BusEvent::new("a", serde_json::json!({})));
        bus.close();
        bus.publish(BusEvent::new("b", serde_json::json!({})));

        assert_eq!(recorder.kinds(), vec!["a"]);
    }

    #[test]
    fn handler_may_publish_from_within() {
        let bus = Arc::new(BroadcastBus::new());
        let recorder = EventRecorder::new();
        let _all = recorder.attach(bus.as_ref());

        let inner = Arc::clone(&bus);
        let _sub = bus.subscribe(
            "outer",
            Arc::new(move |_| {
                inner.publish(BusEvent::new("inner", serde_json::json!({})));
            }),
        );

        bus.publish(BusEvent::new("outer", serde_json::json!({})));
        assert_eq!(recorder.kinds(), vec!["outer", "inner"]);
    }
}
