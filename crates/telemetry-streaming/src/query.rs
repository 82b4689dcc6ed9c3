//! # Streaming Query
//!
//! One micro-batch query per topic: fetch, decode, apply the watermark,
//! append to the checkpointed sink.
//!
//! ```text
//!   trigger ─▶ plan offsets ─▶ offsets/<N>.json ─▶ decode + watermark ─▶ Parquet ─▶ commits/<N>.json
//! ```
//!
//! A query owns all of its state; queries of different topics share nothing
//! but the source.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use telemetry_broker::{SharedSource, StreamMessage};
use telemetry_domain::{SimTime, Topic};

use crate::checkpoint::{OffsetEntry, PartitionRange};
use crate::config::{StartingOffsets, StreamingConfig};
use crate::decoder::StreamDecoder;
use crate::error::{Result, StreamingError};
use crate::sink::{CheckpointedSink, CommitResult, SinkBatch};
use crate::watermark::{Admission, WatermarkPolicy};

/// Running totals of one query, published after every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryProgress {
    pub topic: Topic,
    pub batches_committed: u64,
    pub batches_replayed: u64,
    pub rows_written: u64,
    pub late_dropped: u64,
    pub decode_failures: u64,
    pub watermark: Option<SimTime>,
    pub last_batch_id: Option<u64>,
    /// Next offset to read, by partition
    pub offsets: Vec<i64>,
}

impl QueryProgress {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            batches_committed: 0,
            batches_replayed: 0,
            rows_written: 0,
            late_dropped: 0,
            decode_failures: 0,
            watermark: None,
            last_batch_id: None,
            offsets: Vec::new(),
        }
    }

    /// `true` once every partition has been read up to `end_offsets`.
    #[must_use]
    pub fn is_caught_up(&self, end_offsets: &[i64]) -> bool {
        end_offsets
            .iter()
            .enumerate()
            .all(|(p, end)| self.offsets.get(p).copied().unwrap_or(0) >= *end)
    }
}

/// Per-topic micro-batch query
pub struct StreamingQuery {
    topic: Topic,
    source: SharedSource,
    decoder: StreamDecoder,
    watermark: WatermarkPolicy,
    sink: CheckpointedSink,
    trigger_interval: Duration,
    max_records_per_trigger: usize,
    next_batch_id: u64,
    offsets: Vec<i64>,
    pending: Option<OffsetEntry>,
    progress: QueryProgress,
    progress_tx: watch::Sender<QueryProgress>,
}

impl StreamingQuery {
    /// Open the topic's sink and resume from its checkpoint, or from
    /// `config.starting_offsets` when there is none.
    pub async fn open(topic: Topic, source: SharedSource, config: &StreamingConfig) -> Result<Self> {
        let sink = CheckpointedSink::open(topic, &config.output_root, &config.checkpoint_root).await?;
        let recovery = sink.checkpoints().recover().await?;

        let mut watermark = WatermarkPolicy::new(config.lateness);
        watermark.restore(recovery.max_event_time);

        let offsets = match recovery.committed_offsets {
            Some(offsets) => offsets,
            None => match config.starting_offsets {
                StartingOffsets::Earliest => Vec::new(),
                StartingOffsets::Latest => source.end_offsets(topic.as_str()).await?,
            },
        };

        let mut progress = QueryProgress::new(topic);
        progress.offsets.clone_from(&offsets);
        progress.watermark = watermark.watermark();
        progress.last_batch_id = sink.last_committed();
        let (progress_tx, _) = watch::channel(progress.clone());

        if let Some(pending) = &recovery.pending {
            tracing::info!(
                %topic,
                batch_id = pending.batch_id,
                "Uncommitted batch found, it will be re-run"
            );
        }
        tracing::info!(
            %topic,
            next_batch_id = recovery.next_batch_id,
            offsets = ?offsets,
            watermark = ?progress.watermark,
            "Query opened"
        );

        Ok(Self {
            topic,
            source,
            decoder: StreamDecoder::new(topic),
            watermark,
            sink,
            trigger_interval: config.trigger_interval,
            max_records_per_trigger: config.max_records_per_trigger,
            next_batch_id: recovery.next_batch_id,
            offsets,
            pending: recovery.pending,
            progress,
            progress_tx,
        })
    }

    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }

    /// Subscribe to progress updates
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<QueryProgress> {
        self.progress_tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> &QueryProgress {
        &self.progress
    }

    /// Trigger until cancelled. A batch in progress always finishes first.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<QueryProgress> {
        let mut ticker = tokio::time::interval(self.trigger_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(topic = %self.topic, "Query started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.trigger().await?;
        }

        tracing::info!(
            topic = %self.topic,
            batches = self.progress.batches_committed,
            rows = self.progress.rows_written,
            "Query stopped"
        );
        Ok(self.progress)
    }

    /// Run one micro-batch. An uncommitted batch from a previous run goes
    /// first. Returns `None` when there was nothing new to read.
    pub async fn trigger(&mut self) -> Result<Option<CommitResult>> {
        if let Some(entry) = self.pending.take() {
            let messages = self.refetch(&entry).await?;
            self.progress.batches_replayed += 1;
            tracing::info!(
                topic = %self.topic,
                batch_id = entry.batch_id,
                messages = messages.len(),
                "Re-running uncommitted batch"
            );
            return self.execute(entry, &messages).await.map(Some);
        }

        let (ranges, messages) = self.fetch_new().await?;
        if messages.is_empty() {
            return Ok(None);
        }

        let entry = OffsetEntry {
            batch_id: self.next_batch_id,
            ranges,
            max_event_time: self.watermark.max_event_time(),
            planned_at: Utc::now(),
        };
        self.sink.checkpoints().write_offsets(&entry).await?;
        self.execute(entry, &messages).await.map(Some)
    }

    /// Read up to `max_records_per_trigger` new messages in arrival order
    /// across partitions.
    ///
    /// Partition heads are merged by [`arrival_key`], so a batch never takes a
    /// message while an earlier arrival of another partition is left behind.
    /// Every partition gets a range, empty ones included, so a planned batch
    /// records the full position of the query.
    async fn fetch_new(&mut self) -> Result<(Vec<PartitionRange>, Vec<StreamMessage>)> {
        let topic = self.topic.as_str();
        let partitions = self.source.partition_count(topic).await?;
        let partition_slots = usize::try_from(partitions).unwrap_or(0);
        if self.offsets.len() < partition_slots {
            self.offsets.resize(partition_slots, 0);
        }

        let budget = self.max_records_per_trigger;
        let mut heads = Vec::with_capacity(partition_slots);
        let mut ranges = Vec::with_capacity(partition_slots);
        for (slot, partition) in (0..partitions).enumerate() {
            let start = self.offsets[slot];
            let fetched = self.source.fetch(topic, partition, start, budget).await?;
            heads.push(VecDeque::from(fetched));
            ranges.push(PartitionRange {
                partition,
                start,
                end: start,
            });
        }

        let mut messages = Vec::new();
        while messages.len() < budget {
            let earliest = heads
                .iter()
                .enumerate()
                .filter_map(|(slot, head)| head.front().map(|m| (arrival_key(m), slot)))
                .min()
                .map(|(_, slot)| slot);
            let Some(slot) = earliest else {
                break;
            };
            let Some(message) = heads[slot].pop_front() else {
                break;
            };
            ranges[slot].end = message.offset + 1;
            messages.push(message);
        }

        Ok((ranges, messages))
    }

    /// Read back exactly the ranges of a planned batch.
    async fn refetch(&self, entry: &OffsetEntry) -> Result<Vec<StreamMessage>> {
        let topic = self.topic.as_str();
        let capacity = entry.ranges.iter().map(PartitionRange::len).sum::<i64>();
        let mut messages = Vec::with_capacity(usize::try_from(capacity).unwrap_or(0));

        for range in entry.ranges.iter().filter(|r| !r.is_empty()) {
            let mut next = range.start;
            while next < range.end {
                let want = usize::try_from(range.end - next).unwrap_or(0);
                let fetched = self.source.fetch(topic, range.partition, next, want).await?;
                let Some(last) = fetched.last().map(|m| m.offset) else {
                    return Err(StreamingError::IncompleteReplay {
                        topic: self.topic,
                        batch_id: entry.batch_id,
                        partition: range.partition,
                        reached: next,
                        expected: range.end,
                    });
                };
                next = last + 1;
                messages.extend(fetched.into_iter().filter(|m| m.offset < range.end));
            }
        }
        Ok(messages)
    }

    /// Decode, apply the watermark and commit one planned batch.
    async fn execute(&mut self, entry: OffsetEntry, messages: &[StreamMessage]) -> Result<CommitResult> {
        self.watermark.restore(entry.max_event_time);

        let mut records = Vec::with_capacity(messages.len());
        let mut late_dropped = 0;
        let mut decode_failures = 0;

        // Arrival order across partitions, then log order.
        let mut arrivals: Vec<&StreamMessage> = messages.iter().collect();
        arrivals.sort_by_key(|m| arrival_key(m));

        for message in arrivals {
            let record = match self.decoder.decode(&message.payload) {
                Ok(record) => record,
                Err(e) => {
                    decode_failures += 1;
                    tracing::warn!(
                        topic = %self.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Dropping undecodable record"
                    );
                    continue;
                }
            };

            match self.watermark.observe(record.event_time) {
                Admission::Admitted => records.push(record),
                Admission::Late { watermark } => {
                    late_dropped += 1;
                    tracing::warn!(
                        topic = %self.topic,
                        event_time = %record.event_time,
                        %watermark,
                        "Dropping late record"
                    );
                }
            }
        }

        let batch = SinkBatch {
            batch_id: entry.batch_id,
            records,
            late_dropped,
            decode_failures,
            max_event_time: self.watermark.max_event_time(),
        };

        let result = match self.sink.append(batch).await {
            Ok(result) => result,
            Err(e) => {
                // Leave everything as it was before the batch so it can be re-run.
                self.watermark.restore(entry.max_event_time);
                self.pending = Some(entry);
                return Err(e.into());
            }
        };

        for range in &entry.ranges {
            if let Ok(slot) = usize::try_from(range.partition) {
                if self.offsets.len() <= slot {
                    self.offsets.resize(slot + 1, 0);
                }
                self.offsets[slot] = range.end;
            }
        }
        self.next_batch_id = entry.batch_id + 1;

        if let CommitResult::Committed { batch_id, rows, .. } = &result {
            self.progress.batches_committed += 1;
            self.progress.rows_written += rows;
            self.progress.late_dropped += late_dropped;
            self.progress.decode_failures += decode_failures;
            tracing::debug!(
                topic = %self.topic,
                batch_id,
                rows,
                late_dropped,
                decode_failures,
                watermark = ?self.watermark.watermark(),
                "Micro-batch committed"
            );
        }
        self.progress.watermark = self.watermark.watermark();
        self.progress.last_batch_id = Some(entry.batch_id);
        self.progress.offsets.clone_from(&self.offsets);
        self.progress_tx.send_replace(self.progress.clone());

        Ok(result)
    }
}

/// Broker arrival order: append time, then partition, then log position.
fn arrival_key(message: &StreamMessage) -> (Option<i64>, i32, i64) {
    (message.timestamp_ms, message.partition, message.offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeDelta, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;

    use telemetry_broker::MemoryBroker;

    use crate::checkpoint::CheckpointStore;

    fn t0() -> SimTime {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn gps(secs: i64) -> Vec<u8> {
        json!({
            "id": format!("gps-{secs}"),
            "vehicle_id": "Vehicle-IoT-Data",
            "timestamp": (t0() + TimeDelta::seconds(secs)).to_rfc3339(),
            "speed": 12.0,
            "direction": "North-East",
            "vehicleType": "private"
        })
        .to_string()
        .into_bytes()
    }

    fn config(dir: &TempDir) -> StreamingConfig {
        StreamingConfig {
            output_root: dir.path().join("data"),
            checkpoint_root: dir.path().join("checkpoints"),
            trigger_interval: Duration::from_millis(5),
            ..StreamingConfig::default()
        }
    }

    async fn broker_with(partitions: i32, events: &[i64]) -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new(partitions));
        for secs in events {
            broker.append("gps_data", &format!("k{secs}"), gps(*secs)).await;
        }
        broker
    }

    #[tokio::test]
    async fn test_empty_trigger_creates_no_batch() {
        let dir = TempDir::new().unwrap();
        let broker = broker_with(2, &[]).await;
        let mut query = StreamingQuery::open(Topic::Gps, broker, &config(&dir)).await.unwrap();

        assert!(query.trigger().await.unwrap().is_none());
        let store = CheckpointStore::open(dir.path().join("checkpoints/gps_data")).await.unwrap();
        assert!(store.latest_offsets().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trigger_commits_admitted_records() {
        let dir = TempDir::new().unwrap();
        let broker = broker_with(2, &[0, 30, 75, 120]).await;
        let mut query = StreamingQuery::open(Topic::Gps, broker.clone(), &config(&dir)).await.unwrap();

        let result = query.trigger().await.unwrap().unwrap();
        assert!(matches!(result, CommitResult::Committed { batch_id: 0, rows: 4, .. }));
        assert_eq!(query.snapshot().offsets.iter().sum::<i64>(), 4);
        assert_eq!(query.snapshot().watermark, Some(t0()));

        assert!(query.trigger().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_late_and_malformed_records_are_dropped() {
        let dir = TempDir::new().unwrap();
        let broker = broker_with(1, &[600, 0, 590]).await;
        broker.append("gps_data", "bad", b"{\"timestamp\": 7}".to_vec()).await;
        let mut query = StreamingQuery::open(Topic::Gps, broker, &config(&dir)).await.unwrap();

        let result = query.trigger().await.unwrap().unwrap();
        assert!(matches!(result, CommitResult::Committed { rows: 2, .. }));

        let progress = query.snapshot();
        assert_eq!(progress.late_dropped, 1);
        assert_eq!(progress.decode_failures, 1);
        assert_eq!(progress.offsets, vec![4]);
    }

    #[tokio::test]
    async fn test_max_records_per_trigger_bounds_batches() {
        let dir = TempDir::new().unwrap();
        let broker = broker_with(1, &[0, 10, 20, 30, 40]).await;
        let config = StreamingConfig {
            max_records_per_trigger: 2,
            ..config(&dir)
        };
        let mut query = StreamingQuery::open(Topic::Gps, broker, &config).await.unwrap();

        let mut batches = 0;
        while let Some(result) = query.trigger().await.unwrap() {
            assert!(matches!(result, CommitResult::Committed { rows, .. } if rows <= 2));
            batches += 1;
        }
        assert_eq!(batches, 3);
        assert_eq!(query.snapshot().rows_written, 5);
        assert_eq!(query.snapshot().last_batch_id, Some(2));
    }

    #[tokio::test]
    async fn test_restart_resumes_after_committed_batches() {
        let dir = TempDir::new().unwrap();
        let broker = broker_with(1, &[0, 30]).await;

        let mut first = StreamingQuery::open(Topic::Gps, broker.clone(), &config(&dir)).await.unwrap();
        first.trigger().await.unwrap();
        drop(first);

        broker.append("gps_data", "k60", gps(60)).await;
        let mut second = StreamingQuery::open(Topic::Gps, broker, &config(&dir)).await.unwrap();
        assert_eq!(second.snapshot().offsets, vec![2]);
        assert_eq!(second.snapshot().watermark, Some(t0() + TimeDelta::seconds(30) - TimeDelta::minutes(2)));

        let result = second.trigger().await.unwrap().unwrap();
        assert!(matches!(result, CommitResult::Committed { batch_id: 1, rows: 1, .. }));
        assert!(dir.path().join("data/gps_data/batch_id=0").is_dir());
        assert!(dir.path().join("data/gps_data/batch_id=1").is_dir());
        assert!(!dir.path().join("data/gps_data/batch_id=2").exists());
    }

    #[tokio::test]
    async fn test_skewed_partitions_are_read_in_arrival_order() {
        let dir = TempDir::new().unwrap();
        let broker = Arc::new(MemoryBroker::new(2));
        // A long backlog on partition 0, then newer events on partition 1.
        let arrivals = [(0, 0), (0, 30), (0, 60), (0, 90), (0, 120), (0, 150), (1, 300), (1, 330)];
        for (ts, (partition, secs)) in (1_000_i64..).zip(arrivals) {
            broker
                .append_at("gps_data", partition, &format!("k{secs}"), gps(secs), ts)
                .await
                .unwrap();
        }
        let config = StreamingConfig {
            max_records_per_trigger: 4,
            ..config(&dir)
        };
        let mut query = StreamingQuery::open(Topic::Gps, broker, &config).await.unwrap();

        let mut batches = 0;
        while query.trigger().await.unwrap().is_some() {
            batches += 1;
        }
        assert_eq!(batches, 2);
        assert_eq!(query.snapshot().rows_written, 8);
        assert_eq!(query.snapshot().late_dropped, 0);
        assert_eq!(query.snapshot().offsets, vec![6, 2]);

        let store = CheckpointStore::open(dir.path().join("checkpoints/gps_data")).await.unwrap();
        let first = store.offsets(0).await.unwrap().unwrap();
        assert_eq!(first.end_offsets(), vec![4, 0]);
    }

    #[tokio::test]
    async fn test_uncommitted_batch_is_replayed_with_same_range() {
        let dir = TempDir::new().unwrap();
        let broker = broker_with(1, &[0, 30, 60]).await;

        // A crash after planning batch 0 but before committing it.
        let store = CheckpointStore::open(dir.path().join("checkpoints/gps_data")).await.unwrap();
        store
            .write_offsets(&OffsetEntry {
                batch_id: 0,
                ranges: vec![PartitionRange {
                    partition: 0,
                    start: 0,
                    end: 2,
                }],
                max_event_time: None,
                planned_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut query = StreamingQuery::open(Topic::Gps, broker, &config(&dir)).await.unwrap();
        let replayed = query.trigger().await.unwrap().unwrap();
        assert!(matches!(replayed, CommitResult::Committed { batch_id: 0, rows: 2, .. }));
        assert_eq!(query.snapshot().batches_replayed, 1);

        let next = query.trigger().await.unwrap().unwrap();
        assert!(matches!(next, CommitResult::Committed { batch_id: 1, rows: 1, .. }));
        assert_eq!(query.snapshot().offsets, vec![3]);
    }

    #[tokio::test]
    async fn test_latest_skips_existing_messages() {
        let dir = TempDir::new().unwrap();
        let broker = broker_with(1, &[0, 30]).await;
        let config = StreamingConfig {
            starting_offsets: StartingOffsets::Latest,
            ..config(&dir)
        };

        let mut query = StreamingQuery::open(Topic::Gps, broker.clone(), &config).await.unwrap();
        assert!(query.trigger().await.unwrap().is_none());

        broker.append("gps_data", "k90", gps(90)).await;
        let result = query.trigger().await.unwrap().unwrap();
        assert!(matches!(result, CommitResult::Committed { rows: 1, .. }));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let broker = broker_with(1, &[0, 30, 60]).await;
        let query = StreamingQuery::open(Topic::Gps, broker, &config(&dir)).await.unwrap();
        let mut progress = query.progress();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(query.run(cancel.clone()));

        progress
            .wait_for(|p| p.rows_written == 3)
            .await
            .unwrap();
        cancel.cancel();

        let final_progress = task.await.unwrap().unwrap();
        assert_eq!(final_progress.rows_written, 3);
        assert_eq!(final_progress.batches_committed, 1);
    }
}
