//! Broker error types

use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Publish to topic '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Topic '{0}' is closed")]
    TopicClosed(String),

    #[error("Invalid broker configuration: {0}")]
    Config(String),
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        BrokerError::Connection(err.to_string())
    }
}
