//! The conversation store: conversations, messages, memories, audit log,
//! and paired users, backed by an embedded SQLite database.
//!
//! Single-writer, multi-reader: one connection serializes all writes (to
//! match SQLite's locking model), while a small pool of read-only
//! connections lets concurrent reads proceed without waiting on the
//! writer. Every operation runs on a blocking-task pool via
//! `tokio::task::spawn_blocking` since `rusqlite` is synchronous.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oxibot_core::records::{
    AuditEntry, Conversation, MemoryEntry, MessageRecord, MessageRole, NewAuditEntry, NewMemory, NewMessage,
    UsageCounters,
};
use oxibot_security::audit::AuditSink;
use oxibot_security::pairing::PairingPersistence;
use rusqlite::{Connection, OpenFlags};
use tracing::{error, warn};

use crate::error::StoreError;
use crate::migrations::{self, MIGRATIONS};

const DEFAULT_READER_POOL_SIZE: usize = 4;

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub struct Store {
    writer: Arc<std::sync::Mutex<Connection>>,
    readers: Vec<Arc<std::sync::Mutex<Connection>>>,
    next_reader: AtomicUsize,
}

impl Store {
    /// Open (creating if absent) the database at `path`, running pending
    /// migrations, and start a small read-only connection pool alongside
    /// the single writer connection.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let write_path = path.clone();
        let mut writer_conn = tokio::task::spawn_blocking(move || {
            Connection::open(&write_path).map_err(|source| StoreError::Open {
                path: write_path.display().to_string(),
                source,
            })
        })
        .await??;

        migrations::apply_migrations(&mut writer_conn, MIGRATIONS)?;

        let mut readers = Vec::with_capacity(DEFAULT_READER_POOL_SIZE);
        for _ in 0..DEFAULT_READER_POOL_SIZE {
            let reader_path = path.clone();
            let conn = tokio::task::spawn_blocking(move || {
                Connection::open_with_flags(
                    &reader_path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|source| StoreError::Open {
                    path: reader_path.display().to_string(),
                    source,
                })
            })
            .await??;
            readers.push(Arc::new(std::sync::Mutex::new(conn)));
        }

        Ok(Self {
            writer: Arc::new(std::sync::Mutex::new(writer_conn)),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    /// An in-memory store, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        migrations::apply_migrations(&mut conn, MIGRATIONS)?;
        Ok(Self {
            writer: Arc::new(std::sync::Mutex::new(conn)),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        })
    }

    fn pick_reader(&self) -> Arc<std::sync::Mutex<Connection>> {
        if self.readers.is_empty() {
            return Arc::clone(&self.writer);
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        Arc::clone(&self.readers[idx])
    }

    async fn with_writer<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.writer);
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&guard)
        })
        .await?;
        Ok(result?)
    }

    async fn with_reader<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pick_reader();
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&guard)
        })
        .await?;
        Ok(result?)
    }

    /// Insert a conversation if it doesn't already exist; otherwise return
    /// the existing row untouched.
    pub async fn create_conversation(&self, id: &str, channel: &str) -> Result<Conversation, StoreError> {
        let id = id.to_string();
        let channel = channel.to_string();
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, channel, title, last_provider, last_model, created_at, updated_at)
                 VALUES (?1, ?2, NULL, NULL, NULL, ?3, ?3)",
                rusqlite::params![id, channel, now],
            )?;
            conn.query_row(
                "SELECT id, channel, title, last_provider, last_model, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                rusqlite::params![id],
                row_to_conversation,
            )
        })
        .await
    }

    /// Append a message, touching the conversation's `updated_at`.
    pub async fn add_message(&self, conversation_id: &str, message: NewMessage) -> Result<MessageRecord, StoreError> {
        let conversation_id = conversation_id.to_string();
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, tool_calls, tool_call_id, tool_name,
                                       tokens_in, tokens_out, provider, model, latency_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    conversation_id,
                    message.role.as_str(),
                    message.content,
                    message.tool_calls,
                    message.tool_call_id,
                    message.tool_name,
                    message.tokens_in,
                    message.tokens_out,
                    message.provider,
                    message.model,
                    message.latency_ms,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();

            conn.execute(
                "UPDATE conversations SET updated_at = ?1,
                    last_provider = COALESCE(?2, last_provider),
                    last_model = COALESCE(?3, last_model)
                 WHERE id = ?4",
                rusqlite::params![now, message.provider, message.model, conversation_id],
            )?;

            conn.query_row(
                "SELECT id, conversation_id, role, content, tool_calls, tool_call_id, tool_name,
                        tokens_in, tokens_out, provider, model, latency_ms, created_at
                 FROM messages WHERE id = ?1",
                rusqlite::params![id],
                row_to_message,
            )
        })
        .await
    }

    /// Messages for a conversation in chronological order, most recent
    /// `limit` kept.
    pub async fn get_messages(&self, conversation_id: &str, limit: i64) -> Result<Vec<MessageRecord>, StoreError> {
        let conversation_id = conversation_id.to_string();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, tool_calls, tool_call_id, tool_name,
                        tokens_in, tokens_out, provider, model, latency_ms, created_at
                 FROM (
                    SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2
                 ) ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Conversations newest-first.
    pub async fn list_conversations(&self, limit: i64) -> Result<Vec<Conversation>, StoreError> {
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel, title, last_provider, last_model, created_at, updated_at
                 FROM conversations ORDER BY updated_at DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![limit], row_to_conversation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn save_memory(&self, memory: NewMemory) -> Result<MemoryEntry, StoreError> {
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            let expires_at = memory.expires_at.map(|e| e.to_rfc3339());
            conn.execute(
                "INSERT INTO memories (category, content, source, importance, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![memory.category, memory.content, memory.source, memory.importance, now, expires_at],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                "SELECT id, category, content, source, importance, created_at, expires_at
                 FROM memories WHERE id = ?1",
                rusqlite::params![id],
                row_to_memory,
            )
        })
        .await
    }

    /// Non-expired memories whose content contains `query` (case-insensitive),
    /// ordered by importance desc then recency desc.
    pub async fn search_memories(&self, query: &str, limit: i64) -> Result<Vec<MemoryEntry>, StoreError> {
        let pattern = format!("%{}%", query.to_lowercase());
        let now = Utc::now().to_rfc3339();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category, content, source, importance, created_at, expires_at
                 FROM memories
                 WHERE lower(content) LIKE ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY importance DESC, created_at DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![pattern, now, limit], row_to_memory)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Most recent non-expired memories, for prompt surfacing when no query
    /// term is available.
    pub async fn get_recent_memories(&self, limit: i64) -> Result<Vec<MemoryEntry>, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category, content, source, importance, created_at, expires_at
                 FROM memories
                 WHERE expires_at IS NULL OR expires_at > ?1
                 ORDER BY importance DESC, created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![now, limit], row_to_memory)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Lower the importance of memories older than `older_than_days` by 1,
    /// clamped at 1. Intended to run as a daily maintenance sweep scheduled
    /// by the gateway, independent of the agent loop's read path.
    pub async fn decay_memory_importance(&self, older_than_days: i64) -> Result<u64, StoreError> {
        self.with_writer(move |conn| {
            let cutoff = (Utc::now() - Duration::days(older_than_days)).to_rfc3339();
            let affected = conn.execute(
                "UPDATE memories SET importance = MAX(importance - 1, 1)
                 WHERE created_at < ?1 AND importance > 1",
                rusqlite::params![cutoff],
            )?;
            Ok(affected as u64)
        })
        .await
    }

    pub async fn log_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO audit_log (action, tool_name, command, result, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![entry.action, entry.tool_name, entry.command, entry.result.as_str(), entry.details, now],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                "SELECT id, action, tool_name, command, result, details, created_at FROM audit_log WHERE id = ?1",
                rusqlite::params![id],
                row_to_audit,
            )
        })
        .await
    }

    pub async fn get_paired_user(&self, channel: &str, user_id: &str) -> Result<Option<oxibot_core::records::PairedUser>, StoreError> {
        let channel = channel.to_string();
        let user_id = user_id.to_string();
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT channel, user_id, paired_at, expires_at FROM paired_users WHERE channel = ?1 AND user_id = ?2",
                rusqlite::params![channel, user_id],
                row_to_paired_user,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
        .await
    }

    pub async fn persist_paired_user(&self, channel: &str, user_id: &str, ttl_days: Option<i64>) -> Result<(), StoreError> {
        let channel = channel.to_string();
        let user_id = user_id.to_string();
        self.with_writer(move |conn| {
            let now = Utc::now();
            let expires_at = ttl_days.map(|d| (now + Duration::days(d)).to_rfc3339());
            conn.execute(
                "INSERT OR REPLACE INTO paired_users (channel, user_id, paired_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![channel, user_id, now.to_rfc3339(), expires_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn usage_counters(&self) -> Result<UsageCounters, StoreError> {
        self.with_reader(move |conn| {
            let conversations: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", (), |r| r.get(0))?;
            let messages: i64 = conn.query_row("SELECT COUNT(*) FROM messages", (), |r| r.get(0))?;
            let tokens_in: i64 = conn.query_row(
                "SELECT COALESCE(SUM(tokens_in), 0) FROM messages",
                (),
                |r| r.get(0),
            )?;
            let tokens_out: i64 = conn.query_row(
                "SELECT COALESCE(SUM(tokens_out), 0) FROM messages",
                (),
                |r| r.get(0),
            )?;

            let mut by_provider = std::collections::HashMap::new();
            let mut stmt = conn.prepare(
                "SELECT provider, COUNT(*) FROM messages WHERE provider IS NOT NULL GROUP BY provider",
            )?;
            let provider_rows = stmt.query_map((), |row| {
                let provider: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((provider, count))
            })?;
            for row in provider_rows {
                let (provider, count) = row?;
                by_provider.insert(provider, count);
            }

            Ok(UsageCounters {
                conversations,
                messages,
                tokens_in,
                tokens_out,
                by_provider,
            })
        })
        .await
    }
}

#[async_trait]
impl AuditSink for Store {
    async fn log_audit(&self, entry: NewAuditEntry) {
        if let Err(err) = Store::log_audit(self, entry).await {
            error!(error = %err, "failed to persist audit entry");
        }
    }
}

#[async_trait]
impl PairingPersistence for Store {
    async fn is_paired(&self, channel: &str, user_id: &str) -> bool {
        match self.get_paired_user(channel, user_id).await {
            Ok(Some(paired)) => !paired.is_expired(Utc::now()),
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "pairing lookup failed; treating as unpaired");
                false
            }
        }
    }

    async fn persist_pair(&self, channel: &str, user_id: &str, ttl_days: Option<i64>) {
        if let Err(err) = self.persist_paired_user(channel, user_id, ttl_days).await {
            error!(error = %err, "failed to persist pairing");
        }
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        channel: row.get(1)?,
        title: row.get(2)?,
        last_provider: row.get(3)?,
        last_model: row.get(4)?,
        created_at: parse_ts(&row.get::<_, String>(5)?),
        updated_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role_str: String = row.get(2)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: role_str.parse().unwrap_or(MessageRole::User),
        content: row.get(3)?,
        tool_calls: row.get(4)?,
        tool_call_id: row.get(5)?,
        tool_name: row.get(6)?,
        tokens_in: row.get(7)?,
        tokens_out: row.get(8)?,
        provider: row.get(9)?,
        model: row.get(10)?,
        latency_ms: row.get(11)?,
        created_at: parse_ts(&row.get::<_, String>(12)?),
    })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let expires_at: Option<String> = row.get(6)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        category: row.get(1)?,
        content: row.get(2)?,
        source: row.get(3)?,
        importance: row.get(4)?,
        created_at: parse_ts(&row.get::<_, String>(5)?),
        expires_at: expires_at.map(|s| parse_ts(&s)),
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let result_str: String = row.get(4)?;
    let result = match result_str.as_str() {
        "allowed" => oxibot_core::records::AuditResult::Allowed,
        "blocked" => oxibot_core::records::AuditResult::Blocked,
        "confirmed" => oxibot_core::records::AuditResult::Confirmed,
        _ => oxibot_core::records::AuditResult::Denied,
    };
    Ok(AuditEntry {
        id: row.get(0)?,
        action: row.get(1)?,
        tool_name: row.get(2)?,
        command: row.get(3)?,
        result,
        details: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

fn row_to_paired_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<oxibot_core::records::PairedUser> {
    let expires_at: Option<String> = row.get(3)?;
    Ok(oxibot_core::records::PairedUser {
        channel: row.get(0)?,
        user_id: row.get(1)?,
        paired_at: parse_ts(&row.get::<_, String>(2)?),
        expires_at: expires_at.map(|s| parse_ts(&s)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxibot_core::records::AuditResult;

    #[tokio::test]
    async fn create_conversation_is_insert_if_absent() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store.create_conversation("chat-1", "cli").await.unwrap();
        let second = store.create_conversation("chat-1", "cli").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn add_message_touches_conversation_and_persists_row() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_conversation("chat-1", "cli").await.unwrap();

        let saved = store
            .add_message("chat-1", NewMessage::user("hello"))
            .await
            .unwrap();
        assert_eq!(saved.role, MessageRole::User);
        assert_eq!(saved.content, "hello");

        let messages = store.get_messages("chat-1", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn get_messages_returns_chronological_order() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_conversation("chat-1", "cli").await.unwrap();
        store.add_message("chat-1", NewMessage::user("first")).await.unwrap();
        store.add_message("chat-1", NewMessage::assistant("second")).await.unwrap();

        let messages = store.get_messages("chat-1", 10).await.unwrap();
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "second");
    }

    #[tokio::test]
    async fn list_conversations_is_newest_first() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_conversation("a", "cli").await.unwrap();
        store.add_message("a", NewMessage::user("x")).await.unwrap();
        store.create_conversation("b", "cli").await.unwrap();
        store.add_message("b", NewMessage::user("y")).await.unwrap();

        let convos = store.list_conversations(10).await.unwrap();
        assert_eq!(convos[0].id, "b");
    }

    #[tokio::test]
    async fn search_memories_orders_by_importance_then_recency() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .save_memory(NewMemory {
                category: "preference".into(),
                content: "likes dark mode".into(),
                source: "chat-1".into(),
                importance: 3,
                expires_at: None,
            })
            .await
            .unwrap();
        store
            .save_memory(NewMemory {
                category: "preference".into(),
                content: "likes dark roast coffee".into(),
                source: "chat-1".into(),
                importance: 8,
                expires_at: None,
            })
            .await
            .unwrap();

        let results = store.search_memories("dark", 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].importance, 8);
    }

    #[tokio::test]
    async fn expired_memories_are_excluded_from_search() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .save_memory(NewMemory {
                category: "fact".into(),
                content: "temporary detail".into(),
                source: "chat-1".into(),
                importance: 5,
                expires_at: Some(Utc::now() - Duration::seconds(1)),
            })
            .await
            .unwrap();

        let results = store.search_memories("temporary", 10).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn decay_lowers_importance_but_clamps_at_one() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .save_memory(NewMemory {
                category: "fact".into(),
                content: "old fact".into(),
                source: "chat-1".into(),
                importance: 1,
                expires_at: None,
            })
            .await
            .unwrap();

        // Not old enough yet (created just now, cutoff is 0 days ago == now).
        let affected = store.decay_memory_importance(-1).await.unwrap();
        assert_eq!(affected, 0, "importance already at floor of 1, nothing to decay");
    }

    #[tokio::test]
    async fn audit_log_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let entry = store
            .log_audit(NewAuditEntry::new("command_blocked", AuditResult::Blocked).with_tool("exec"))
            .await
            .unwrap();
        assert_eq!(entry.result, AuditResult::Blocked);
    }

    #[tokio::test]
    async fn pairing_persistence_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(!PairingPersistence::is_paired(&store, "telegram", "u1").await);

        store.persist_paired_user("telegram", "u1", Some(30)).await.unwrap();
        assert!(PairingPersistence::is_paired(&store, "telegram", "u1").await);
    }

    #[tokio::test]
    async fn usage_counters_reflect_written_messages() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_conversation("a", "cli").await.unwrap();
        let mut msg = NewMessage::assistant("hi");
        msg.tokens_in = Some(10);
        msg.tokens_out = Some(5);
        msg.provider = Some("openai".into());
        store.add_message("a", msg).await.unwrap();

        let counters = store.usage_counters().await.unwrap();
        assert_eq!(counters.conversations, 1);
        assert_eq!(counters.messages, 1);
        assert_eq!(counters.tokens_in, 10);
        assert_eq!(counters.tokens_out, 5);
        assert_eq!(counters.by_provider.get("openai"), Some(&1));
    }
}
