//! Broker error types

use thiserror::Error;

/// Transport and source errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Delivery to {topic} failed: {reason}")]
    Delivery { topic: String, reason: String },

    #[error("Unknown partition {partition} for topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("Offset {offset} out of range for {topic}[{partition}]")]
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Kafka(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
