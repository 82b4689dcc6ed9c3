//! Kafka backend built on rdkafka.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::sync::Mutex;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::traits::{RecordMetadata, StreamMessage, StreamSource, Transport};

// =============================================================================
// PRODUCER
// =============================================================================

/// Kafka producer transport.
pub struct KafkaTransport {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaTransport {
    /// Create a producer against `config.bootstrap_servers`.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()?;

        tracing::info!(servers = %config.bootstrap_servers, "Kafka producer created");
        Ok(Self {
            producer,
            message_timeout: config.message_timeout,
        })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<RecordMetadata> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);
        match self
            .producer
            .send(record, Timeout::After(self.message_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset,
            }),
            Err((err, _)) => Err(BrokerError::Delivery {
                topic: topic.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        run_blocking(move || Ok(producer.flush(Timeout::After(timeout))?)).await
    }
}

// =============================================================================
// CONSUMER
// =============================================================================

/// Kafka source reading explicit offsets. Offsets are tracked by the
/// pipeline's checkpoints, never committed to the consumer group.
pub struct KafkaSource {
    config: BrokerConfig,
    consumers: Mutex<HashMap<String, Arc<StreamConsumer>>>,
}

impl KafkaSource {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// One consumer per topic so queries never reassign each other's partitions.
    async fn consumer(&self, topic: &str) -> Result<Arc<StreamConsumer>> {
        let mut consumers = self.consumers.lock().await;
        if let Some(existing) = consumers.get(topic) {
            return Ok(Arc::clone(existing));
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", format!("{}-{topic}", self.config.group_id))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()?;
        let consumer = Arc::new(consumer);
        consumers.insert(topic.to_string(), Arc::clone(&consumer));
        Ok(consumer)
    }

    fn timeout(&self) -> Timeout {
        Timeout::After(self.config.poll_timeout)
    }

    /// High watermark of one partition, read off the runtime.
    async fn high_watermark(&self, consumer: &Arc<StreamConsumer>, topic: &str, partition: i32) -> Result<i64> {
        let consumer = Arc::clone(consumer);
        let topic = topic.to_string();
        let timeout = self.timeout();
        run_blocking(move || {
            let (_, high) = consumer.fetch_watermarks(&topic, partition, timeout)?;
            Ok(high)
        })
        .await
    }
}

#[async_trait]
impl StreamSource for KafkaSource {
    async fn partition_count(&self, topic: &str) -> Result<i32> {
        let consumer = self.consumer(topic).await?;
        let name = topic.to_string();
        let timeout = self.timeout();
        let count = run_blocking(move || {
            let metadata = consumer.fetch_metadata(Some(name.as_str()), timeout)?;
            Ok(metadata
                .topics()
                .iter()
                .find(|t| t.name() == name)
                .map_or(0, |t| t.partitions().len()))
        })
        .await?;
        i32::try_from(count).map_err(|_| BrokerError::Config(format!("too many partitions: {count}")))
    }

    async fn end_offsets(&self, topic: &str) -> Result<Vec<i64>> {
        let consumer = self.consumer(topic).await?;
        let partitions = self.partition_count(topic).await?;
        let mut ends = Vec::with_capacity(usize::try_from(partitions).unwrap_or(0));
        for partition in 0..partitions {
            ends.push(self.high_watermark(&consumer, topic, partition).await?);
        }
        Ok(ends)
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max: usize,
    ) -> Result<Vec<StreamMessage>> {
        let consumer = self.consumer(topic).await?;
        let high = self.high_watermark(&consumer, topic, partition).await?;
        let available = usize::try_from(high.saturating_sub(offset)).unwrap_or(0);
        let wanted = available.min(max);
        if wanted == 0 {
            return Ok(Vec::new());
        }

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, Offset::Offset(offset))?;
        consumer.assign(&assignment)?;

        let mut messages = Vec::with_capacity(wanted);
        let mut next = offset;
        while messages.len() < wanted {
            let Ok(received) = tokio::time::timeout(self.config.poll_timeout, consumer.recv()).await
            else {
                tracing::debug!(topic, partition, "Fetch timed out before reaching target count");
                break;
            };
            let msg = received?;
            if !continues_range(msg.partition(), msg.offset(), partition, next) {
                tracing::debug!(
                    topic,
                    partition = msg.partition(),
                    offset = msg.offset(),
                    expected_partition = partition,
                    expected_offset = next,
                    "Skipping message outside the requested range"
                );
                continue;
            }
            next = msg.offset() + 1;
            messages.push(StreamMessage {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                timestamp_ms: msg.timestamp().to_millis(),
            });
        }
        Ok(messages)
    }
}

/// A received message belongs to the read when it is on the assigned
/// partition and not behind the next expected offset. Leftovers of an
/// earlier assignment fail this.
fn continues_range(partition: i32, offset: i64, assigned: i32, next: i64) -> bool {
    partition == assigned && offset >= next
}

/// Run a blocking librdkafka call on the blocking pool so it never stalls
/// the runtime workers other queries run on.
async fn run_blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| BrokerError::Kafka(format!("blocking client call failed: {e}")))?
}
