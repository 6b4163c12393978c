//! Oxibot Security — the tool-use policy gate, confirmation handshake, and
//! user pairing that sit in front of every tool call the agent loop wants to
//! make.
//!
//! This crate implements one capability set (see the Provider/Tool/Transport/
//! Store split): the Security Engine never executes a tool itself, it only
//! classifies a proposed `(tool, command)` as [`Decision::Allow`],
//! [`Decision::Confirm`], or [`Decision::Block`], and gates the pairing
//! handshake that transports must satisfy before a user's traffic flows at
//! all. A tool-specific guard (e.g. the shell tool's own workspace and
//! path-traversal checks) may layer stricter rules on top, but never in
//! place of, this classification.

pub mod audit;
pub mod engine;
pub mod pairing;
pub mod patterns;

pub use audit::AuditSink;
pub use engine::{Decision, DefaultPolicy, SecurityEngine, SecurityEngineConfig};
pub use pairing::{PairingOutcome, PairingStore};
