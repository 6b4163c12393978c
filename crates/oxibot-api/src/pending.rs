//! Pending-response slot map — lets a synchronous HTTP handler wait for the
//! `done` stream event that the agent loop eventually publishes back onto
//! the bus for a given `chat_id`.
//!
//! At most one slot is kept per `chat_id`. A new request for the same
//! `chat_id` closes out the previous slot with a "superseded" error so the
//! earlier caller gets a clean response instead of hanging until its own
//! deadline.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// The terminal result delivered to a waiting HTTP handler.
#[derive(Clone)]
pub enum SlotResult {
    /// The turn completed; carries the `done` event's content.
    Done(String),
    /// The turn ended in an error; carries the error's user-safe message.
    Error(String),
    /// A newer request for the same `chat_id` replaced this one before it
    /// completed.
    Superseded,
}

struct Slot {
    tx: oneshot::Sender<SlotResult>,
}

/// Tracks one in-flight response slot per `chat_id` for transports (the
/// OpenAI-compatible API, in practice) that must block on the bus's
/// asynchronous reply.
#[derive(Default)]
pub struct PendingResponses {
    slots: Mutex<HashMap<String, Slot>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    /// Register a new slot for `chat_id`, superseding and closing out any
    /// slot already pending for it. Returns the receiver to await.
    pub fn register(&self, chat_id: &str) -> oneshot::Receiver<SlotResult> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap();
        if let Some(previous) = slots.remove(chat_id) {
            let _ = previous.tx.send(SlotResult::Superseded);
        }
        slots.insert(chat_id.to_string(), Slot { tx });
        rx
    }

    /// Complete the slot for `chat_id`, if one is still pending. A no-op if
    /// nothing is waiting (e.g. the request already timed out and dropped
    /// its receiver).
    pub fn complete(&self, chat_id: &str, result: SlotResult) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.remove(chat_id) {
            let _ = slot.tx.send(result);
        }
    }

    /// Drop the slot for `chat_id` without completing it (used after a
    /// handler gives up waiting, so a late reply doesn't leak the entry).
    pub fn cancel(&self, chat_id: &str) {
        self.slots.lock().unwrap().remove(chat_id);
    }
}


impl std::fmt::Debug for SlotResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotResult::Done(s) => write!(f, "Done({s:?})"),
            SlotResult::Error(s) => write!(f, "Error({s:?})"),
            SlotResult::Superseded => write!(f, "Superseded"),
        }
    }
}
