//! Oxibot Store — the durable conversation store.
//!
//! Owns every persisted row the kernel cares about: conversations, their
//! messages, long-lived memory entries, the security audit log, and paired
//! users. Backed by an embedded SQLite database (`rusqlite`, bundled), with
//! a single writer connection and a small read-only pool.

pub mod error;
pub mod migrations;
pub mod store;

pub use error::StoreError;
pub use store::Store;
