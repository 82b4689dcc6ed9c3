//! # Broker Configuration
//!
//! Environment-based configuration shared by the simulator and the pipeline.

use std::env;
use std::time::Duration;

/// Broker connection configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Kafka bootstrap servers, comma separated
    pub bootstrap_servers: String,

    /// Partitions per topic for the in-memory broker
    pub partitions: i32,

    /// Producer delivery timeout
    pub message_timeout: Duration,

    /// Consumer group used by the ingestion source
    pub group_id: String,

    /// How long a fetch waits for the next message
    pub poll_timeout: Duration,
}

impl BrokerConfig {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::defaults();
        Self {
            bootstrap_servers: env::var("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or(defaults.bootstrap_servers),

            partitions: env::var("BROKER_PARTITIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|p| *p > 0)
                .unwrap_or(defaults.partitions),

            message_timeout: env::var("KAFKA_MESSAGE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(defaults.message_timeout, Duration::from_millis),

            group_id: env::var("KAFKA_GROUP_ID").unwrap_or(defaults.group_id),

            poll_timeout: env::var("KAFKA_POLL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(defaults.poll_timeout, Duration::from_millis),
        }
    }

    fn defaults() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            partitions: 3,
            message_timeout: Duration::from_secs(5),
            group_id: "smart-city-streaming".to_string(),
            poll_timeout: Duration::from_millis(500),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::defaults()
    }
}
