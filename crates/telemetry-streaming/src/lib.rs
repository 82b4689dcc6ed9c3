//! # Telemetry Streaming
//!
//! Ingests the five telemetry topics into append-only Parquet datasets,
//! one independent micro-batch query per topic.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   fetch    ┌───────────────┐  decode   ┌────────────────┐
//! │ StreamSource │ ─────────▶ │ StreamingQuery│ ────────▶ │ StreamDecoder  │
//! │ (per topic)  │            │  (per topic)  │           └────────────────┘
//! └──────────────┘            │               │  admit    ┌────────────────┐
//!                             │               │ ────────▶ │ WatermarkPolicy│
//!                             │               │           └────────────────┘
//!                             │               │  append   ┌────────────────┐
//!                             │               │ ────────▶ │CheckpointedSink│──▶ Parquet + checkpoint
//!                             └───────────────┘           └────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Per-topic watermark (`max event time - lateness`) never moves backwards
//! - A batch is committed only after its data file is durable
//! - Restarting never rewrites a committed batch; an interrupted batch is
//!   re-run over the same offsets

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod error;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod sink;
pub mod watermark;

pub use checkpoint::{CheckpointStore, CommitEntry, OffsetEntry, PartitionRange, Recovery};
pub use config::{StartingOffsets, StreamingConfig};
pub use decoder::{DecodedRecord, FieldValue, StreamDecoder};
pub use error::{DecodeError, Result, SinkError, StreamingError};
pub use pipeline::{IngestionPipeline, QueryOutcomes};
pub use query::{QueryProgress, StreamingQuery};
pub use schema::{DataType, Field, TopicSchema};
pub use sink::{CheckpointedSink, CommitResult, SinkBatch};
pub use watermark::{Admission, WatermarkPolicy};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
