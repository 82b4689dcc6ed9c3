//! Fan-out publishing with per-message delivery acknowledgment.
//!
//! `publish` never blocks on the broker: every message is delivered by its own
//! task. `flush` collects the outcome of every outstanding delivery, in
//! submission order. Failed deliveries are reported, never retried.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use telemetry_broker::{RecordMetadata, SharedTransport};
use telemetry_domain::TelemetryRecord;

use crate::error::Result;

/// Outcome of one publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAck {
    Delivered {
        key: String,
        metadata: RecordMetadata,
    },
    Failed {
        topic: String,
        key: String,
        reason: String,
    },
}

impl DeliveryAck {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::Delivered { metadata, .. } => &metadata.topic,
            Self::Failed { topic, .. } => topic,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Delivered { key, .. } | Self::Failed { key, .. } => key,
        }
    }
}

/// Acknowledgments collected by one flush.
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    pub acks: Vec<DeliveryAck>,
}

impl FlushReport {
    pub fn delivered(&self) -> usize {
        self.acks.iter().filter(|a| a.is_delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.acks.len() - self.delivered()
    }
}

struct PendingDelivery {
    topic: String,
    key: String,
    handle: JoinHandle<DeliveryAck>,
}

/// Publishes records to their topics over a shared transport.
pub struct FanoutPublisher {
    transport: SharedTransport,
    in_flight: VecDeque<PendingDelivery>,
    listener: Option<mpsc::UnboundedSender<DeliveryAck>>,
    submitted: u64,
    delivered: usize,
    failed: usize,
}

impl FanoutPublisher {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            in_flight: VecDeque::new(),
            listener: None,
            submitted: 0,
            delivered: 0,
            failed: 0,
        }
    }

    /// Also forward every ack to `listener` as soon as its delivery resolves.
    #[must_use]
    pub fn with_ack_listener(mut self, listener: mpsc::UnboundedSender<DeliveryAck>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Submit one message. Returns immediately.
    pub fn publish(&mut self, topic: &str, key: String, payload: Vec<u8>) {
        let transport = self.transport.clone();
        let listener = self.listener.clone();
        let task_topic = topic.to_string();
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let ack = match transport.send(&task_topic, &task_key, payload).await {
                Ok(metadata) => {
                    tracing::info!(
                        topic = %metadata.topic,
                        partition = metadata.partition,
                        offset = metadata.offset,
                        "Message delivered"
                    );
                    DeliveryAck::Delivered {
                        key: task_key,
                        metadata,
                    }
                }
                Err(e) => {
                    tracing::warn!(topic = %task_topic, key = %task_key, error = %e, "Message delivery failed");
                    DeliveryAck::Failed {
                        topic: task_topic,
                        key: task_key,
                        reason: e.to_string(),
                    }
                }
            };
            if let Some(tx) = listener {
                let _ = tx.send(ack.clone());
            }
            ack
        });

        self.submitted += 1;
        self.in_flight.push_back(PendingDelivery {
            topic: topic.to_string(),
            key,
            handle,
        });
    }

    /// Serialize and submit a record keyed by its own id. Nothing is submitted
    /// if encoding fails.
    pub fn publish_record(&mut self, record: &TelemetryRecord) -> Result<()> {
        let payload = record.to_json()?;
        self.publish(record.topic().as_str(), record.key(), payload);
        Ok(())
    }

    /// Deliveries submitted but not yet collected.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Acks collected so far, across all flushes.
    pub fn acknowledged(&self) -> usize {
        self.delivered + self.failed
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Wait for every outstanding delivery and return their acks.
    ///
    /// Cancel safe: a delivery leaves the queue only together with its ack,
    /// and the running totals are updated at that moment, so a dropped flush
    /// loses no ack from [`Self::delivered`] / [`Self::failed`].
    pub async fn flush(&mut self) -> FlushReport {
        let mut report = FlushReport::default();

        while let Some(front) = self.in_flight.front_mut() {
            let outcome = (&mut front.handle).await;
            let Some(pending) = self.in_flight.pop_front() else {
                break;
            };

            let ack = match outcome {
                Ok(ack) => ack,
                Err(join_err) => {
                    tracing::error!(topic = %pending.topic, error = %join_err, "Delivery task aborted");
                    let ack = DeliveryAck::Failed {
                        topic: pending.topic,
                        key: pending.key,
                        reason: join_err.to_string(),
                    };
                    // The task never reached its own listener send.
                    if let Some(tx) = &self.listener {
                        let _ = tx.send(ack.clone());
                    }
                    ack
                }
            };
            if ack.is_delivered() {
                self.delivered += 1;
            } else {
                self.failed += 1;
            }
            report.acks.push(ack);
        }

        report
    }

    /// Flush acks, then give the transport `timeout` to drain its own buffers.
    pub async fn close(&mut self, timeout: std::time::Duration) -> Result<FlushReport> {
        let report = self.flush().await;
        self.transport.flush(timeout).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use async_trait::async_trait;
    use telemetry_broker::{MemoryBroker, RecordMetadata, StreamSource, Transport};
    use tokio_test::assert_ok;

    /// Panics inside `send` for one topic, delegates the rest.
    struct PanickingTransport {
        topic: &'static str,
        inner: MemoryBroker,
    }

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn send(
            &self,
            topic: &str,
            key: &str,
            payload: Vec<u8>,
        ) -> telemetry_broker::Result<RecordMetadata> {
            assert_ne!(topic, self.topic, "client library crashed");
            self.inner.send(topic, key, payload).await
        }
    }

    #[tokio::test]
    async fn test_one_ack_per_publish() {
        let broker = Arc::new(MemoryBroker::new(2));
        let mut publisher = FanoutPublisher::new(broker.clone());

        for i in 0..10 {
            publisher.publish("vehicle_data", format!("key-{i}"), b"{}".to_vec());
        }
        assert_eq!(publisher.submitted(), 10);

        let report = publisher.flush().await;
        assert_eq!(report.acks.len(), 10);
        assert_eq!(report.delivered(), 10);
        assert_eq!(publisher.pending(), 0);
        assert_eq!(publisher.acknowledged(), 10);
        assert_eq!(broker.message_count("vehicle_data").await, 10);

        let keys: Vec<&str> = report.acks.iter().map(DeliveryAck::key).collect();
        assert_eq!(keys[0], "key-0");
        assert_eq!(keys[9], "key-9");
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_retried() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.fail_topic("gps_data", "broker down").await;
        let mut publisher = FanoutPublisher::new(broker.clone());

        publisher.publish("gps_data", "a".into(), b"{}".to_vec());
        publisher.publish("weather_data", "b".into(), b"{}".to_vec());

        let report = publisher.flush().await;
        assert_eq!(report.delivered(), 1);
        assert_eq!(report.failed(), 1);
        assert!(matches!(
            &report.acks[0],
            DeliveryAck::Failed { topic, reason, .. } if topic == "gps_data" && reason.contains("broker down")
        ));
        assert_eq!(broker.message_count("gps_data").await, 0);
        assert_eq!(broker.end_offsets("weather_data").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_listener_sees_every_ack() {
        let broker = Arc::new(MemoryBroker::new(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut publisher = FanoutPublisher::new(broker).with_ack_listener(tx);

        publisher.publish("traffic_data", "x".into(), Vec::new());
        publisher.publish("traffic_data", "y".into(), Vec::new());
        publisher.flush().await;

        let mut seen = Vec::new();
        while let Ok(ack) = rx.try_recv() {
            seen.push(ack.key().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending() {
        let mut publisher = FanoutPublisher::new(Arc::new(MemoryBroker::default()));
        let report = publisher.flush().await;
        assert!(report.acks.is_empty());

        let closed = assert_ok!(publisher.close(std::time::Duration::from_millis(10)).await);
        assert!(closed.acks.is_empty());
    }

    #[tokio::test]
    async fn test_panicked_delivery_yields_one_failed_ack() {
        let transport = Arc::new(PanickingTransport {
            topic: "traffic_data",
            inner: MemoryBroker::new(1),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut publisher = FanoutPublisher::new(transport).with_ack_listener(tx);

        publisher.publish("traffic_data", "cam-1".into(), b"{}".to_vec());
        publisher.publish("gps_data", "gps-1".into(), b"{}".to_vec());

        let report = publisher.flush().await;
        assert_eq!(report.acks.len(), 2);
        assert_eq!(report.failed(), 1);
        assert!(matches!(
            &report.acks[0],
            DeliveryAck::Failed { topic, key, .. } if topic == "traffic_data" && key == "cam-1"
        ));
        assert!(report.acks[1].is_delivered());
        assert_eq!(publisher.failed(), 1);

        let mut forwarded = Vec::new();
        while let Ok(ack) = rx.try_recv() {
            forwarded.push(ack);
        }
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded.iter().filter(|a| !a.is_delivered()).count(), 1);
    }
}
