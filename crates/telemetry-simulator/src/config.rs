//! # Simulator Configuration
//!
//! Environment-based configuration for the simulation loop.

use std::env;
use std::time::Duration;

use telemetry_broker::BrokerConfig;

/// What the loop does when a bundle cannot be serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationPolicy {
    /// Stop the simulation with a fatal error
    #[default]
    Abort,
    /// Drop the bundle and keep ticking
    SkipTick,
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Wall-clock pause between ticks
    pub tick_interval: Duration,

    /// Seed for clock, tracker and field fillers
    pub seed: Option<u64>,

    /// Stop after this many ticks even if the destination is not reached
    pub max_ticks: Option<u64>,

    /// Vehicle identity
    pub vehicle_id: String,

    /// Serialization failure handling
    pub serialization_policy: SerializationPolicy,

    /// Upper bound for the final transport flush
    pub flush_timeout: Duration,

    /// Logging level
    pub log_level: String,

    /// Broker connection
    pub broker: BrokerConfig,
}

impl SimulatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            tick_interval: env::var("TICK_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(Duration::from_secs(5), Duration::from_millis),

            seed: env::var("SIMULATION_SEED").ok().and_then(|v| v.parse().ok()),

            max_ticks: env::var("MAX_TICKS").ok().and_then(|v| v.parse().ok()),

            vehicle_id: env::var("VEHICLE_ID").unwrap_or_else(|_| "Vehicle-IoT-Data".to_string()),

            serialization_policy: match env::var("SERIALIZATION_POLICY").as_deref() {
                Ok("skip") | Ok("skip-tick") => SerializationPolicy::SkipTick,
                _ => SerializationPolicy::Abort,
            },

            flush_timeout: Duration::from_secs(10),

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            broker: BrokerConfig::from_env(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            seed: None,
            max_ticks: None,
            vehicle_id: "Vehicle-IoT-Data".to_string(),
            serialization_policy: SerializationPolicy::Abort,
            flush_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
            broker: BrokerConfig::default(),
        }
    }
}
