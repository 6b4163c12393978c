//! Store error kinds.
//!
//! Per the kernel's error-handling design, store failures are logged and
//! degrade gracefully at the call site (writes fall back to in-memory,
//! reads return empty) rather than aborting the agent loop — callers match
//! on this enum only to decide how to log, not to recover structurally.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store task panicked or was cancelled")]
    TaskJoin(#[from] tokio::task::JoinError),
}
