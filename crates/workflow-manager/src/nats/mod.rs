//! Message bus integration.
//!
//! Envelopes travel over NATS JetStream: [`NatsPublisher`] for outbound
//! messages and [`NatsSubscriber`] for durable inbound consumers.

pub mod memory;
pub mod message;
pub mod publisher;
pub mod subscriber;

pub use memory::MemoryPublisher;
pub use message::Message;
pub use publisher::{MessagePublisher, NatsError, NatsPublisher};
pub use subscriber::{MessageHandler, MessageOutcome, NatsSubscriber, Subscription};
