//! Audit sink trait — lets the Security Engine log every decision without
//! depending on the Conversation Store crate directly. `oxibot-store`
//! implements this trait for its `Store` type; tests use an in-memory one.

use async_trait::async_trait;
use oxibot_core::records::NewAuditEntry;

/// Receives audit rows emitted by the Security Engine.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_audit(&self, entry: NewAuditEntry);
}

/// An audit sink that drops every entry, for callers that don't need
/// persistence (unit tests, a dry-run CLI invocation).
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn log_audit(&self, _entry: NewAuditEntry) {}
}
