//! # Transport Traits
//!
//! Abstract produce/consume interfaces. Implementations can be swapped for
//! different backends (in-memory log, Kafka).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Where a produced message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A message read back from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// Broker append time, milliseconds since the epoch, when known
    pub timestamp_ms: Option<i64>,
}

// =============================================================================
// PRODUCE SIDE
// =============================================================================

/// Publishes keyed payloads to named topics.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message and resolve once the broker acknowledges (or rejects) it.
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<RecordMetadata>;

    /// Wait for transport-level buffers to drain.
    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

pub type SharedTransport = Arc<dyn Transport>;

// =============================================================================
// CONSUME SIDE
// =============================================================================

/// Offset-addressed reads from topic partitions.
///
/// Offsets are the next offset to read; `end_offsets` returns, per partition,
/// the offset one past the last stored message.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Number of partitions of `topic`
    async fn partition_count(&self, topic: &str) -> Result<i32>;

    /// Next-to-be-written offset for every partition, indexed by partition
    async fn end_offsets(&self, topic: &str) -> Result<Vec<i64>>;

    /// Read up to `max` messages from `partition` starting at `offset`
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max: usize,
    ) -> Result<Vec<StreamMessage>>;
}

pub type SharedSource = Arc<dyn StreamSource>;
