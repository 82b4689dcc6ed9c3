//! In-process partitioned log implementing both [`Transport`] and [`StreamSource`].
//!
//! Topics are created on first use with a fixed partition count. Each
//! partition is an append-only vector; a message's offset is its index.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{BrokerError, Result};
use crate::traits::{RecordMetadata, StreamMessage, StreamSource, Transport};

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Vec<u8>,
    payload: Vec<u8>,
    timestamp_ms: i64,
}

/// In-memory broker.
#[derive(Debug)]
pub struct MemoryBroker {
    partitions: i32,
    topics: RwLock<HashMap<String, Vec<Vec<StoredMessage>>>>,
    failing: RwLock<HashMap<String, String>>,
}

impl MemoryBroker {
    /// Create a broker whose topics all have `partitions` partitions.
    #[must_use]
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashMap::new()),
        }
    }

    /// Reject every subsequent send to `topic` with `reason`.
    pub async fn fail_topic(&self, topic: &str, reason: &str) {
        self.failing
            .write()
            .await
            .insert(topic.to_string(), reason.to_string());
    }

    /// Undo [`Self::fail_topic`].
    pub async fn heal_topic(&self, topic: &str) {
        self.failing.write().await.remove(topic);
    }

    /// Total messages stored for `topic` across partitions.
    pub async fn message_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |parts| parts.iter().map(Vec::len).sum())
    }

    /// Append a raw payload, bypassing the failure switch. Returns its metadata.
    pub async fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> RecordMetadata {
        let partition = self.partition_for(key);
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        self.store(topic, partition, key, payload, timestamp_ms).await
    }

    /// Append to an explicit partition with an explicit broker timestamp.
    pub async fn append_at(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        payload: Vec<u8>,
        timestamp_ms: i64,
    ) -> Result<RecordMetadata> {
        if partition < 0 || partition >= self.partitions {
            return Err(BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            });
        }
        Ok(self.store(topic, partition, key, payload, timestamp_ms).await)
    }

    async fn store(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        payload: Vec<u8>,
        timestamp_ms: i64,
    ) -> RecordMetadata {
        let mut topics = self.topics.write().await;
        let parts = topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partition_slots()]);
        let log = &mut parts[partition_index(partition)];
        log.push(StoredMessage {
            key: key.as_bytes().to_vec(),
            payload,
            timestamp_ms,
        });

        RecordMetadata {
            topic: topic.to_string(),
            partition,
            offset: offset_of(log.len() - 1),
        }
    }

    fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let slot = hasher.finish() % u64::from(self.partitions.unsigned_abs());
        i32::try_from(slot).unwrap_or(0)
    }

    fn partition_slots(&self) -> usize {
        partition_index(self.partitions)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

fn partition_index(partition: i32) -> usize {
    usize::try_from(partition).unwrap_or(0)
}

fn offset_of(index: usize) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<RecordMetadata> {
        if let Some(reason) = self.failing.read().await.get(topic) {
            return Err(BrokerError::Delivery {
                topic: topic.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(self.append(topic, key, payload).await)
    }
}

#[async_trait]
impl StreamSource for MemoryBroker {
    async fn partition_count(&self, _topic: &str) -> Result<i32> {
        Ok(self.partitions)
    }

    async fn end_offsets(&self, topic: &str) -> Result<Vec<i64>> {
        let topics = self.topics.read().await;
        Ok(topics.get(topic).map_or_else(
            || vec![0; self.partition_slots()],
            |parts| parts.iter().map(|log| offset_of(log.len())).collect(),
        ))
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max: usize,
    ) -> Result<Vec<StreamMessage>> {
        if partition < 0 || partition >= self.partitions {
            return Err(BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            });
        }
        let start = usize::try_from(offset).map_err(|_| BrokerError::OffsetOutOfRange {
            topic: topic.to_string(),
            partition,
            offset,
        })?;

        let topics = self.topics.read().await;
        let Some(log) = topics.get(topic).map(|parts| &parts[partition_index(partition)]) else {
            return Ok(Vec::new());
        };

        Ok(log
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(idx, m)| StreamMessage {
                topic: topic.to_string(),
                partition,
                offset: offset_of(idx),
                key: Some(m.key.clone()),
                payload: m.payload.clone(),
                timestamp_ms: Some(m.timestamp_ms),
            })
            .collect())
    }
}
