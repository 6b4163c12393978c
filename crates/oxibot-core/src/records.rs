//! Persisted record types — the durable data model shared by the
//! Conversation Store, the Security Engine's audit trail, and anything
//! that reads them back (the CLI's `status`/history views, the agent's
//! memory surfacing).
//!
//! These are plain data types; the Store crate is the only thing that
//! knows how to read and write them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation, identified by the transport `chat_id` that created it so
/// a transport session resumes the same conversation across process
/// restarts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub channel: String,
    pub title: Option<String>,
    pub last_provider: Option<String>,
    pub last_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, channel: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            channel: channel.into(),
            title: None,
            last_provider: None,
            last_model: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The role of a persisted message, mirroring the OpenAI chat-completions
/// roles used on the wire (see [`crate::types::Message`]).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// One durable row in a conversation's append-only message log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Opaque serialized `Vec<ToolCall>` JSON, present on assistant turns
    /// that requested tools.
    pub tool_calls: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A new message to append; `id` and `created_at` are assigned by the store.
#[derive(Clone, Debug, Default)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub latency_ms: Option<i64>,
}

impl Default for MessageRole {
    fn default() -> Self {
        MessageRole::User
    }
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Default::default()
        }
    }
}

/// A long-lived extracted fact surfaced into future prompts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: i64,
    pub category: String,
    pub content: String,
    pub source: String,
    pub importance: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A new memory entry to save; `id` and `created_at` are assigned by the store.
#[derive(Clone, Debug)]
pub struct NewMemory {
    pub category: String,
    pub content: String,
    pub source: String,
    pub importance: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The outcome of a security decision or tool execution, for the audit log.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Allowed,
    Blocked,
    Confirmed,
    Denied,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Allowed => "allowed",
            AuditResult::Blocked => "blocked",
            AuditResult::Confirmed => "confirmed",
            AuditResult::Denied => "denied",
        }
    }
}

/// One durable row in the security audit log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub tool_name: Option<String>,
    pub command: Option<String>,
    pub result: AuditResult,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A new audit row to log; `id` and `created_at` are assigned by the store.
#[derive(Clone, Debug)]
pub struct NewAuditEntry {
    pub action: String,
    pub tool_name: Option<String>,
    pub command: Option<String>,
    pub result: AuditResult,
    pub details: Option<String>,
}

impl NewAuditEntry {
    pub fn new(action: impl Into<String>, result: AuditResult) -> Self {
        Self {
            action: action.into(),
            tool_name: None,
            command: None,
            result,
            details: None,
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// A `(channel, user_id)` pair that has completed the pairing handshake and
/// is authorized to interact.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PairedUser {
    pub channel: String,
    pub user_id: String,
    pub paired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PairedUser {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// Aggregate token-usage counters, surfaced by `oxibot status`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub conversations: i64,
    pub messages: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    #[serde(default)]
    pub by_provider: HashMap<String, i64>,
}
