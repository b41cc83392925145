//! pixflow Broker Abstraction
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Stages never talk to a message broker directly. They publish and consume
//! through the [`Broker`] and [`Subscription`] traits, which model an
//! ordered-partition pub/sub log with at-least-once delivery:
//!
//! - every message carries a key; messages sharing a key land on the same
//!   partition and are delivered in publish order
//! - a consumer group resumes from its last committed offset per partition
//! - nothing is removed from a topic when it is consumed
//!
//! Two backends are provided:
//!
//! - [`MemoryBroker`]: an in-process log used by the single-process pipeline
//!   and by tests. Topics can be closed so consumers observe end-of-stream.
//! - `KafkaBroker` (feature `kafka`): backed by `rdkafka`.

pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod message;

pub use error::{BrokerError, Result};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaConfig};
pub use memory::MemoryBroker;
pub use message::{partition_for, Delivery, Message};

use async_trait::async_trait;

/// Publishing side of a broker plus the factory for subscriptions
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to `topic`; the message key selects the partition
    async fn publish(&self, topic: &str, message: Message) -> Result<()>;

    /// Join consumer group `group` on `topic`
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>>;

    /// Declare that no further messages will be published to `topic`.
    ///
    /// Backends without an end-of-stream notion treat this as a no-op.
    async fn close_topic(&self, topic: &str) -> Result<()>;

    /// Wait until every published message has been handed to the backend
    async fn flush(&self) -> Result<()>;
}

/// Consuming side of one consumer-group member
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Next delivery, or `None` once the topic is closed and fully consumed.
    ///
    /// Cancel-safe: dropping the future before it resolves loses no message.
    async fn next(&self) -> Result<Option<Delivery>>;

    /// Mark `delivery` and everything before it on the same partition as processed
    async fn commit(&self, delivery: &Delivery) -> Result<()>;
}
