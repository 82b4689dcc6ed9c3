//! Ingestion error types

use std::path::PathBuf;

use thiserror::Error;

use telemetry_broker::BrokerError;
use telemetry_domain::Topic;

/// A payload that does not match its topic schema. The record is dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Field {field}: expected {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Field {field}: {value:?} is not one of {allowed:?}")]
    UnknownCategory {
        field: &'static str,
        value: String,
        allowed: &'static [&'static str],
    },

    #[error("Missing event time field {0}")]
    MissingEventTime(&'static str),

    #[error("Field {field}: unparseable timestamp {value:?}")]
    BadTimestamp { field: &'static str, value: String },
}

/// Storage-level failures. The checkpoint is never advanced past a batch
/// that failed with one of these.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Corrupt checkpoint file {path}: {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Batch {got} out of order, expected {expected}")]
    BatchOutOfOrder { expected: u64, got: u64 },

    #[error("Writer task failed: {0}")]
    WriterTask(String),
}

impl SinkError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Query and pipeline errors
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Replay of batch {batch_id} on {topic}[{partition}] stopped at offset {reached}, expected {expected}")]
    IncompleteReplay {
        topic: Topic,
        batch_id: u64,
        partition: i32,
        reached: i64,
        expected: i64,
    },

    #[error("No running query for {0}")]
    UnknownQuery(Topic),

    #[error("Query for {topic} panicked: {reason}")]
    QueryPanicked { topic: Topic, reason: String },

    #[error("No query could be started")]
    NoQueries,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StreamingError>;
