//! Oxibot Core — shared types, the message bus, config, and session storage.
//!
//! This crate contains the pieces every other Oxibot crate depends on:
//! - **types**: OpenAI-wire-format message/tool types shared by providers and the agent loop
//! - **bus**: the inbound/outbound message bus and the internal event bus
//! - **config**: the typed configuration schema, loader, and env var overrides
//! - **session**: JSONL-backed conversation session persistence
//! - **heartbeat**: the periodic agent wake-up service
//! - **records**: the durable data model persisted by the conversation store

pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod records;
pub mod session;
pub mod types;
pub mod utils;

pub use bus::queue::MessageBus;
pub use config::Config;
