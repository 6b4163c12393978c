//! Internal event bus — observability events flowing out of the kernel.
//!
//! Distinct from [`super::queue::MessageBus`]: that one carries user-facing
//! inbound/outbound chat traffic, this one carries internal signals like
//! `tool.before_execute` or `security.blocked` for metrics, audit mirrors,
//! and debugging. Subscribers are isolated from each other — a panicking
//! synchronous subscriber is caught and logged, never allowed to unwind
//! into the emitter — and a bounded replay buffer lets a late subscriber
//! (e.g. a freshly opened admin console) see recent history.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

/// Default number of recent events retained for [`EventBus::replay`].
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_000;

/// An internal observability event.
///
/// `topic` is a dotted name (`"tool.before_execute"`, `"security.blocked"`);
/// `payload` is a free-form JSON blob so producers don't need a shared enum.
#[derive(Clone, Debug)]
pub struct AppEvent {
    pub topic: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl AppEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }

    /// Whether `pattern` matches this event's topic.
    ///
    /// `"*"` matches everything; `"tool.*"` matches any topic starting with
    /// `"tool."`; anything else must match the topic exactly.
    fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            true
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            self.topic == prefix || self.topic.starts_with(&format!("{prefix}."))
        } else {
            self.topic == pattern
        }
    }
}

type SyncSubscriber = Box<dyn Fn(&AppEvent) + Send + Sync>;

struct AsyncSubscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<AppEvent>,
}

/// Process-wide (but injectable — the Gateway constructs one and hands it to
/// components, never a `static`) internal event bus.
pub struct EventBus {
    sync_subscribers: RwLock<Vec<(String, SyncSubscriber)>>,
    async_subscribers: RwLock<Vec<AsyncSubscriber>>,
    replay: Mutex<VecDeque<AppEvent>>,
    replay_capacity: usize,
}

impl EventBus {
    /// Create an event bus with the default replay buffer size.
    pub fn new() -> Self {
        Self::with_replay_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Create an event bus with a custom replay buffer size.
    pub fn with_replay_capacity(replay_capacity: usize) -> Self {
        Self {
            sync_subscribers: RwLock::new(Vec::new()),
            async_subscribers: RwLock::new(Vec::new()),
            replay: Mutex::new(VecDeque::with_capacity(replay_capacity.min(4096))),
            replay_capacity,
        }
    }

    /// Register a synchronous subscriber invoked inline during [`EventBus::emit`].
    ///
    /// `pattern` follows [`AppEvent::matches`]. The callback must not block
    /// or panic-propagate; panics are caught and logged, never re-raised.
    pub fn subscribe_sync(&self, pattern: impl Into<String>, callback: impl Fn(&AppEvent) + Send + Sync + 'static) {
        let mut subs = self.sync_subscribers.write().unwrap();
        subs.push((pattern.into(), Box::new(callback)));
    }

    /// Register an asynchronous subscriber and return its receive end.
    ///
    /// Events matching `pattern` are pushed onto the returned channel; if the
    /// receiver is dropped, future sends for that subscriber are silently
    /// ignored (the stale entry is pruned on next emit).
    pub fn subscribe(&self, pattern: impl Into<String>) -> mpsc::UnboundedReceiver<AppEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.async_subscribers.write().unwrap();
        subs.push(AsyncSubscriber {
            pattern: pattern.into(),
            tx,
        });
        rx
    }

    /// Emit an event synchronously: every matching sync subscriber runs
    /// inline (panic-isolated), every matching async subscriber gets the
    /// event pushed to its channel, and the event is appended to the replay
    /// buffer.
    pub fn emit(&self, event: AppEvent) {
        self.push_replay(event.clone());

        {
            let subs = self.sync_subscribers.read().unwrap();
            for (pattern, callback) in subs.iter() {
                if !event.matches(pattern) {
                    continue;
                }
                let result = catch_unwind(AssertUnwindSafe(|| callback(&event)));
                if result.is_err() {
                    error!(topic = %event.topic, "event subscriber panicked; isolated");
                }
            }
        }

        {
            let mut subs = self.async_subscribers.write().unwrap();
            subs.retain(|s| {
                if !event.matches(&s.pattern) {
                    return true;
                }
                match s.tx.send(event.clone()) {
                    Ok(()) => true,
                    Err(_) => false, // receiver dropped, prune
                }
            });
        }
    }

    /// Emit an event from a non-async context, or when the caller does not
    /// want emission (subscriber dispatch) to share its call stack. Spawns
    /// a task that calls [`EventBus::emit`].
    pub fn emit_async(self: &Arc<Self>, event: AppEvent) {
        let bus = self.clone();
        tokio::spawn(async move {
            bus.emit(event);
        });
    }

    /// Snapshot of retained events matching `pattern`, oldest first.
    pub fn replay(&self, pattern: &str) -> Vec<AppEvent> {
        let buf = self.replay.lock().unwrap();
        buf.iter().filter(|e| e.matches(pattern)).cloned().collect()
    }

    fn push_replay(&self, event: AppEvent) {
        let mut buf = self.replay.lock().unwrap();
        if buf.len() >= self.replay_capacity {
            buf.pop_front();
        }
        buf.push_back(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn sync_subscriber_receives_matching_topic() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_sync("tool.before_execute", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AppEvent::new("tool.before_execute", serde_json::json!({"tool": "exec"})));
        bus.emit(AppEvent::new("security.blocked", serde_json::json!({})));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_pattern_matches_all() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_sync("*", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AppEvent::new("tool.before_execute", Value::Null));
        bus.emit(AppEvent::new("security.blocked", Value::Null));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prefix_wildcard_matches_namespace() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_sync("tool.*", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AppEvent::new("tool.before_execute", Value::Null));
        bus.emit(AppEvent::new("tool.after_execute", Value::Null));
        bus.emit(AppEvent::new("security.blocked", Value::Null));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_subscriber_does_not_crash_emitter() {
        let bus = EventBus::new();
        bus.subscribe_sync("*", |_| panic!("boom"));

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_sync("*", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AppEvent::new("anything", Value::Null));
        // Second subscriber still ran despite the first panicking.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("security.*");

        bus.emit(AppEvent::new("security.blocked", serde_json::json!({"tool": "exec"})));

        let event = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "security.blocked");
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_without_error() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe("*");
        } // dropped immediately

        // Should not panic even though the receiver is gone.
        bus.emit(AppEvent::new("x", Value::Null));
        assert_eq!(bus.async_subscribers.read().unwrap().len(), 0);
    }

    #[test]
    fn replay_buffer_bounded_and_filterable() {
        let bus = EventBus::with_replay_capacity(2);
        bus.emit(AppEvent::new("a", Value::Null));
        bus.emit(AppEvent::new("b", Value::Null));
        bus.emit(AppEvent::new("c", Value::Null));

        let all = bus.replay("*");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].topic, "b");
        assert_eq!(all[1].topic, "c");
    }

    #[tokio::test]
    async fn emit_async_dispatches_off_caller_stack() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe("*");

        bus.emit_async(AppEvent::new("x", Value::Null));

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "x");
    }
}
