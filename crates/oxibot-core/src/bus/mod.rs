//! Message bus — inbound/outbound routing plus an internal event bus.
//!
//! # Usage
//! ```no_run
//! use oxibot_core::bus::queue::MessageBus;
//!
//! let bus = MessageBus::new(100);
//! ```

pub mod events;
pub mod queue;
pub mod types;

pub use events::EventBus;
pub use queue::MessageBus;
pub use types::{InboundMessage, OutboundMessage, StreamEvent, StreamEventKind};
