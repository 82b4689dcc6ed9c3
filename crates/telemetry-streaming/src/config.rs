//! # Streaming Configuration
//!
//! Environment-based configuration for the ingestion pipeline.

use std::env;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use telemetry_broker::BrokerConfig;
use telemetry_domain::Topic;

use crate::error::StreamingError;
use crate::watermark::DEFAULT_LATENESS;

/// Where a query without a checkpoint starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartingOffsets {
    /// From the beginning of every partition
    #[default]
    Earliest,
    /// From the current end of every partition
    Latest,
}

impl FromStr for StartingOffsets {
    type Err = StreamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(StreamingError::Config(format!(
                "unknown starting offsets {other:?}, expected earliest or latest"
            ))),
        }
    }
}

impl fmt::Display for StartingOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => f.write_str("earliest"),
            Self::Latest => f.write_str("latest"),
        }
    }
}

/// Streaming pipeline configuration
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Root of the per-topic Parquet datasets
    pub output_root: PathBuf,

    /// Root of the per-topic checkpoint directories
    pub checkpoint_root: PathBuf,

    /// Pause between micro-batch triggers
    pub trigger_interval: Duration,

    /// Upper bound on records read per trigger, across partitions
    pub max_records_per_trigger: usize,

    /// Allowed event-time lateness
    pub lateness: TimeDelta,

    /// Start position for topics without a checkpoint
    pub starting_offsets: StartingOffsets,

    /// Topics to ingest
    pub topics: Vec<Topic>,

    /// Logging level
    pub log_level: String,

    /// Broker connection
    pub broker: BrokerConfig,
}

impl StreamingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            output_root: env::var("OUTPUT_ROOT").map_or(defaults.output_root, PathBuf::from),

            checkpoint_root: env::var("CHECKPOINT_ROOT")
                .map_or(defaults.checkpoint_root, PathBuf::from),

            trigger_interval: env::var("TRIGGER_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(defaults.trigger_interval, Duration::from_millis),

            max_records_per_trigger: env::var("MAX_RECORDS_PER_TRIGGER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_records_per_trigger),

            lateness: env::var("LATENESS_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(defaults.lateness),

            starting_offsets: env::var("STARTING_OFFSETS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.starting_offsets),

            topics: defaults.topics,

            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),

            broker: BrokerConfig::from_env(),
        }
    }

    /// Reject settings no query could run with.
    pub fn validate(&self) -> Result<(), StreamingError> {
        let output = normalize(&self.output_root);
        let checkpoints = normalize(&self.checkpoint_root);
        if output.starts_with(&checkpoints) || checkpoints.starts_with(&output) {
            return Err(StreamingError::Config(format!(
                "output root {} and checkpoint root {} must be separate directories",
                self.output_root.display(),
                self.checkpoint_root.display()
            )));
        }
        if self.max_records_per_trigger == 0 {
            return Err(StreamingError::Config(
                "max_records_per_trigger must be positive".to_string(),
            ));
        }
        if self.lateness < TimeDelta::zero() {
            return Err(StreamingError::Config("lateness must not be negative".to_string()));
        }
        if self.topics.is_empty() {
            return Err(StreamingError::Config("no topics configured".to_string()));
        }
        Ok(())
    }
}

/// Absolute, lexically normalized form of `path`. Symlinks are not followed
/// and the path need not exist.
fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("data/output"),
            checkpoint_root: PathBuf::from("data/checkpoints"),
            trigger_interval: Duration::from_secs(1),
            max_records_per_trigger: 1000,
            lateness: DEFAULT_LATENESS,
            starting_offsets: StartingOffsets::Earliest,
            topics: Topic::ALL.to_vec(),
            log_level: "info".to_string(),
            broker: BrokerConfig::default(),
        }
    }
}
