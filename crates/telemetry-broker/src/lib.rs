//! # Telemetry Broker
//!
//! Transport seam between the vehicle simulator and the ingestion pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐                    ┌──────────────────────┐
//! │  FanoutPublisher     │                    │  StreamingQuery      │
//! │  (telemetry-sim)     │                    │  (telemetry-stream)  │
//! └──────────────────────┘                    └──────────────────────┘
//!            │ Transport                                 ▲ StreamSource
//!            ▼                                           │
//! ┌────────────────────────────────────────────────────────────────────┐
//! │            MemoryBroker  |  KafkaTransport / KafkaSource           │
//! │        (partitioned append-only log per topic, offsets)            │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - `kafka`: Enable the rdkafka-backed transport and source

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod traits;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaSource, KafkaTransport};
pub use memory::MemoryBroker;
pub use traits::{RecordMetadata, SharedSource, SharedTransport, StreamMessage, StreamSource, Transport};
