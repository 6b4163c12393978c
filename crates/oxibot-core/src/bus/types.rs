//! Bus event types — messages flowing between channels and the agent loop.
//!

use crate::types::MediaAttachment;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// An inbound message from a channel to the agent.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Channel name (e.g. "telegram", "discord", "cli").
    pub channel: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Chat/conversation identifier.
    pub chat_id: String,
    /// Text content of the message.
    pub content: String,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Attached media (photos, voice, documents).
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata (e.g. message_id, username).
    pub metadata: HashMap<String, String>,
    /// Text already extracted from an attachment (e.g. a transcribed voice
    /// note, or OCR'd image text) that should be folded into the prompt
    /// alongside `content` without re-running extraction.
    pub attachment_content: Option<String>,
    /// Provider that should serve this turn, overriding the agent default.
    /// Set by transports that pin a conversation to a specific model.
    pub provider: Option<String>,
}

impl InboundMessage {
    /// Create a new inbound message with minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
            attachment_content: None,
            provider: None,
        }
    }

    /// Session key combining channel and chat_id (e.g. "telegram:123456").
    ///
    /// Used as the key for session persistence and history lookup.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// A single streaming event attached to an outbound message.
///
/// The agent loop emits one of these per protocol step (see the gateway's
/// per-turn protocol). Transports that can't stream only ever see the
/// `done` variant; streaming transports (the CLI's REPL, the OpenAI-compatible
/// API in SSE mode) see the full sequence.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEventKind {
    /// The model is reasoning before producing visible output.
    Thinking,
    /// A token of assistant text.
    Token,
    /// A tool call is about to execute.
    ToolStart,
    /// A tool call finished.
    ToolEnd,
    /// Terminal event for a turn — carries the final answer.
    Done,
    /// The turn failed.
    Error,
    /// A plain chat message unrelated to streaming (e.g. heartbeat replies).
    Message,
    /// Transport-level connection acknowledgement.
    Connected,
}

/// A streaming event, optionally carrying tool identity.
#[derive(Clone, Debug)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    /// Free-form payload: token text, tool name, or error message depending
    /// on `kind`.
    pub content: Option<String>,
    /// Tool name, set for `ToolStart`/`ToolEnd`.
    pub tool: Option<String>,
    /// Tool call id, set for `ToolStart`/`ToolEnd`.
    pub tool_id: Option<String>,
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind) -> Self {
        Self {
            kind,
            content: None,
            tool: None,
            tool_id: None,
        }
    }

    pub fn with_content(kind: StreamEventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: Some(content.into()),
            tool: None,
            tool_id: None,
        }
    }

    pub fn tool_start(tool: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::ToolStart,
            content: None,
            tool: Some(tool.into()),
            tool_id: Some(tool_id.into()),
        }
    }

    pub fn tool_end(tool: impl Into<String>, tool_id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::ToolEnd,
            content: Some(result.into()),
            tool: Some(tool.into()),
            tool_id: Some(tool_id.into()),
        }
    }
}

/// An outbound message from the agent to a channel.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Text content to send.
    pub content: String,
    /// Optional message ID to reply to.
    pub reply_to: Option<String>,
    /// Attached media to send.
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata.
    pub metadata: HashMap<String, String>,
    /// Streaming event this message represents, if the producing transport
    /// supports incremental delivery.
    pub stream_event: Option<StreamEvent>,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        OutboundMessage {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
            stream_event: None,
        }
    }

    /// Attach a stream event (builder style).
    pub fn with_stream_event(mut self, event: StreamEvent) -> Self {
        self.stream_event = Some(event);
        self
    }
}
