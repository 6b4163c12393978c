//! Async message bus — the central nervous system of Oxibot.
//!
//! Uses tokio::sync::mpsc for inbound delivery and a channel-name → handler
//! map for outbound delivery.
//!
//! Outbound dispatch is synchronous: `send_outbound` awaits the registered
//! handler directly on the caller's task instead of going through a second
//! queue. This preserves per-`chat_id` ordering — the agent loop's own task
//! is the one that calls the channel's `send()`, so two outbound messages
//! for the same conversation can never race each other through an
//! intermediate dispatcher task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::types::{InboundMessage, OutboundMessage};

/// How long `publish_inbound` waits for room in the queue before dropping
/// the message.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// A synchronous-looking outbound handler. Returns a boxed future so it can
/// wrap an async `Channel::send` call.
pub type OutboundHandler = Arc<
    dyn Fn(OutboundMessage) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// The message bus connecting channels ↔ agent loop.
///
/// - Channels publish to `inbound` (user messages arriving)
/// - Agent loop consumes from `inbound`, processes, and calls `send_outbound`
/// - `send_outbound` looks up the handler registered for the target channel
///   and invokes it directly — no intermediate queue or dispatcher task
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    handlers: RwLock<HashMap<String, OutboundHandler>>,
    closed: AtomicBool,
}

impl MessageBus {
    /// Create a new message bus with the given buffer capacity.
    pub fn new(buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);

        MessageBus {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            handlers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish a message from a channel to the agent (inbound).
    ///
    /// Waits up to 10s for room in the queue; if the queue stays full that
    /// long, the message is dropped and logged rather than blocking the
    /// calling channel's listener indefinitely. A no-op (with a debug log)
    /// once the bus has been closed.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            debug!("bus closed, dropping inbound publish");
            return Ok(());
        }

        match tokio::time::timeout(PUBLISH_TIMEOUT, self.inbound_tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(error = %e, "inbound channel closed");
                Ok(())
            }
            Err(_) => {
                warn!("inbound queue full for 10s, dropping message");
                Ok(())
            }
        }
    }

    /// Consume the next inbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    /// Register a handler invoked whenever `send_outbound` targets
    /// `channel_name`. Overwrites any previously registered handler for that
    /// channel.
    pub async fn on_outbound(&self, channel_name: impl Into<String>, handler: OutboundHandler) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(channel_name.into(), handler);
    }

    /// Deregister the handler for a channel, if any.
    pub async fn remove_outbound_handler(&self, channel_name: &str) {
        let mut handlers = self.handlers.write().await;
        handlers.remove(channel_name);
    }

    /// Deliver an outbound message by invoking the handler registered for
    /// its target channel, synchronously, on the caller's task.
    ///
    /// Logs and drops the message if no handler is registered.
    pub async fn send_outbound(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&msg.channel).cloned()
        };

        match handler {
            Some(h) => h(msg).await,
            None => {
                warn!(channel = %msg.channel, "no outbound handler registered, dropping message");
                Ok(())
            }
        }
    }

    /// Alias for [`MessageBus::send_outbound`] — the agent loop and cron
    /// service call outbound delivery "publishing" to mirror
    /// `publish_inbound`, even though dispatch itself is synchronous.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        self.send_outbound(msg).await
    }

    /// Get a clone of the inbound sender (for channels to use).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Close the bus: inbound publishes become no-ops. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the bus has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> OutboundHandler {
        Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_inbound_message_flow() {
        let bus = MessageBus::new(10);

        let msg = InboundMessage::new("telegram", "user_1", "chat_1", "Hello!");
        bus.publish_inbound(msg).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "telegram");
        assert_eq!(received.content, "Hello!");
    }

    #[tokio::test]
    async fn test_outbound_handler_dispatch() {
        let bus = MessageBus::new(10);
        let count = Arc::new(AtomicUsize::new(0));
        bus.on_outbound("discord", counting_handler(count.clone())).await;

        bus.send_outbound(OutboundMessage::new("discord", "channel_42", "Response here"))
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outbound_unknown_channel_is_dropped_not_error() {
        let bus = MessageBus::new(10);
        let result = bus
            .send_outbound(OutboundMessage::new("unknown", "chat", "msg"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_outbound_routes_by_channel_name() {
        let bus = MessageBus::new(10);
        let tg_count = Arc::new(AtomicUsize::new(0));
        let dc_count = Arc::new(AtomicUsize::new(0));
        bus.on_outbound("telegram", counting_handler(tg_count.clone())).await;
        bus.on_outbound("discord", counting_handler(dc_count.clone())).await;

        bus.send_outbound(OutboundMessage::new("telegram", "c1", "a")).await.unwrap();
        bus.send_outbound(OutboundMessage::new("telegram", "c2", "b")).await.unwrap();
        bus.send_outbound(OutboundMessage::new("discord", "g1", "c")).await.unwrap();

        assert_eq!(tg_count.load(Ordering::SeqCst), 2);
        assert_eq!(dc_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_message_ordering() {
        let bus = MessageBus::new(10);

        for i in 1..=3 {
            let msg = InboundMessage::new("cli", "local", "default", format!("msg-{}", i));
            bus.publish_inbound(msg).await.unwrap();
        }

        let m1 = bus.consume_inbound().await.unwrap();
        let m2 = bus.consume_inbound().await.unwrap();
        let m3 = bus.consume_inbound().await.unwrap();

        assert_eq!(m1.content, "msg-1");
        assert_eq!(m2.content, "msg-2");
        assert_eq!(m3.content, "msg-3");
    }

    #[tokio::test]
    async fn test_sender_clone_works() {
        let bus = MessageBus::new(10);
        let sender = bus.inbound_sender();

        let msg = InboundMessage::new("slack", "user_x", "channel_y", "From clone");
        sender.send(msg).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "slack");
        assert_eq!(received.content, "From clone");
    }

    #[tokio::test]
    async fn test_multiple_producers() {
        let bus = std::sync::Arc::new(MessageBus::new(10));

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let h1 = tokio::spawn(async move {
            let msg = InboundMessage::new("telegram", "u1", "c1", "from telegram");
            bus1.publish_inbound(msg).await.unwrap();
        });

        let h2 = tokio::spawn(async move {
            let msg = InboundMessage::new("discord", "u2", "c2", "from discord");
            bus2.publish_inbound(msg).await.unwrap();
        });

        h1.await.unwrap();
        h2.await.unwrap();

        let r1 = bus.consume_inbound().await.unwrap();
        let r2 = bus.consume_inbound().await.unwrap();

        let channels: Vec<&str> = vec![r1.channel.as_str(), r2.channel.as_str()];
        assert!(channels.contains(&"telegram"));
        assert!(channels.contains(&"discord"));
    }

    #[tokio::test]
    async fn test_full_round_trip() {
        // Simulate: channel → bus → agent → bus → channel
        let bus = std::sync::Arc::new(MessageBus::new(10));
        let received_content = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));

        let store = received_content.clone();
        bus.on_outbound(
            "telegram",
            Arc::new(move |msg: OutboundMessage| {
                let store = store.clone();
                Box::pin(async move {
                    store.lock().await.push(msg.content);
                    Ok(())
                })
            }),
        )
        .await;

        let inbound = InboundMessage::new("telegram", "user_42", "chat_99", "What is 2+2?");
        bus.publish_inbound(inbound).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.content, "What is 2+2?");

        bus.send_outbound(OutboundMessage::new(
            received.channel.clone(),
            received.chat_id.clone(),
            "The answer is 4.",
        ))
        .await
        .unwrap();

        let got = received_content.lock().await;
        assert_eq!(got.as_slice(), ["The answer is 4.".to_string()]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_publishes() {
        let bus = MessageBus::new(10);
        bus.close();
        bus.close(); // idempotent, no panic

        bus.publish_inbound(InboundMessage::new("cli", "u", "c", "after close"))
            .await
            .unwrap();

        // No message should have been queued.
        let result = tokio::time::timeout(Duration::from_millis(50), bus.consume_inbound()).await;
        assert!(result.is_err(), "expected consume_inbound to time out, nothing published");
    }
}
