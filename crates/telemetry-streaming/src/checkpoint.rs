//! # Checkpoint Store
//!
//! Per-topic write-ahead log of micro-batches.
//!
//! ```text
//! <checkpoint_root>/<topic>/
//! ├── offsets/<batch_id>.json   planned before the batch is processed
//! └── commits/<batch_id>.json   written once the batch's data is durable
//! ```
//!
//! A batch with an offsets entry but no commit was interrupted and is
//! re-executed with exactly the same offset ranges and starting watermark.
//! Every file is written to a hidden temp name, synced and renamed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use telemetry_domain::SimTime;

use crate::error::SinkError;

type SinkResult<T> = std::result::Result<T, SinkError>;

const OFFSETS_DIR: &str = "offsets";
const COMMITS_DIR: &str = "commits";

/// Half-open offset range `[start, end)` read from one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    pub partition: i32,
    pub start: i64,
    pub end: i64,
}

impl PartitionRange {
    #[must_use]
    pub const fn len(&self) -> i64 {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Planned batch, persisted before processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetEntry {
    pub batch_id: u64,
    pub ranges: Vec<PartitionRange>,
    /// Watermark state the batch starts from
    pub max_event_time: Option<SimTime>,
    pub planned_at: DateTime<Utc>,
}

impl OffsetEntry {
    /// Offsets to continue from once this batch is committed, by partition
    #[must_use]
    pub fn end_offsets(&self) -> Vec<i64> {
        let partitions = self
            .ranges
            .iter()
            .map(|r| r.partition + 1)
            .max()
            .unwrap_or(0);
        let mut ends = vec![0; usize::try_from(partitions).unwrap_or(0)];
        for range in &self.ranges {
            if let Ok(p) = usize::try_from(range.partition) {
                ends[p] = range.end;
            }
        }
        ends
    }
}

/// Outcome of a committed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub batch_id: u64,
    pub rows_written: u64,
    pub late_dropped: u64,
    pub decode_failures: u64,
    /// Watermark state after the batch
    pub max_event_time: Option<SimTime>,
    pub committed_at: DateTime<Utc>,
}

/// What a restarting query resumes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Id of the next batch to plan (the pending batch's id if there is one)
    pub next_batch_id: u64,
    /// Planned but uncommitted batch to re-run first
    pub pending: Option<OffsetEntry>,
    /// Offsets after the last committed batch; `None` on a fresh checkpoint
    pub committed_offsets: Option<Vec<i64>>,
    /// Watermark state to restore
    pub max_event_time: Option<SimTime>,
}

/// Offsets and commit log of one topic
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if needed) the checkpoint directory at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> SinkResult<Self> {
        let root = root.into();
        for dir in [OFFSETS_DIR, COMMITS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| SinkError::io(&path, e))?;
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write_offsets(&self, entry: &OffsetEntry) -> SinkResult<()> {
        self.write_entry(OFFSETS_DIR, entry.batch_id, entry).await
    }

    pub async fn write_commit(&self, entry: &CommitEntry) -> SinkResult<()> {
        self.write_entry(COMMITS_DIR, entry.batch_id, entry).await
    }

    pub async fn offsets(&self, batch_id: u64) -> SinkResult<Option<OffsetEntry>> {
        self.read_entry(OFFSETS_DIR, batch_id).await
    }

    pub async fn commit(&self, batch_id: u64) -> SinkResult<Option<CommitEntry>> {
        self.read_entry(COMMITS_DIR, batch_id).await
    }

    pub async fn is_committed(&self, batch_id: u64) -> bool {
        fs::try_exists(self.entry_path(COMMITS_DIR, batch_id))
            .await
            .unwrap_or(false)
    }

    pub async fn latest_offsets(&self) -> SinkResult<Option<OffsetEntry>> {
        match self.latest_id(OFFSETS_DIR).await? {
            Some(id) => self.offsets(id).await,
            None => Ok(None),
        }
    }

    pub async fn latest_commit(&self) -> SinkResult<Option<CommitEntry>> {
        match self.latest_id(COMMITS_DIR).await? {
            Some(id) => self.commit(id).await,
            None => Ok(None),
        }
    }

    /// Work out where a restarting query picks up.
    pub async fn recover(&self) -> SinkResult<Recovery> {
        let last_commit = self.latest_commit().await?;
        let last_offsets = self.latest_offsets().await?;
        let committed_id = last_commit.as_ref().map(|c| c.batch_id);

        let pending = last_offsets
            .clone()
            .filter(|o| committed_id.is_none_or(|id| o.batch_id > id));

        let committed_offsets = match committed_id {
            Some(id) => self.offsets(id).await?.map(|o| o.end_offsets()),
            None => None,
        };

        let recovery = match pending {
            Some(entry) => Recovery {
                next_batch_id: entry.batch_id,
                max_event_time: entry.max_event_time,
                pending: Some(entry),
                committed_offsets,
            },
            None => Recovery {
                next_batch_id: committed_id.map_or(0, |id| id + 1),
                max_event_time: last_commit.and_then(|c| c.max_event_time),
                pending: None,
                committed_offsets,
            },
        };
        Ok(recovery)
    }

    fn entry_path(&self, dir: &str, batch_id: u64) -> PathBuf {
        self.root.join(dir).join(format!("{batch_id}.json"))
    }

    async fn write_entry<T: Serialize>(&self, dir: &str, batch_id: u64, entry: &T) -> SinkResult<()> {
        let path = self.entry_path(dir, batch_id);
        let tmp = self.root.join(dir).join(format!(".{batch_id}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(entry).map_err(|e| SinkError::CorruptCheckpoint {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| SinkError::io(&tmp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| SinkError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| SinkError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SinkError::io(&path, e))
    }

    async fn read_entry<T: DeserializeOwned>(&self, dir: &str, batch_id: u64) -> SinkResult<Option<T>> {
        let path = self.entry_path(dir, batch_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SinkError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SinkError::CorruptCheckpoint {
                path,
                reason: e.to_string(),
            })
    }

    async fn latest_id(&self, dir: &str) -> SinkResult<Option<u64>> {
        let path = self.root.join(dir);
        let mut entries = fs::read_dir(&path)
            .await
            .map_err(|e| SinkError::io(&path, e))?;

        let mut latest = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SinkError::io(&path, e))?
        {
            let name = entry.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(id) = id {
                latest = latest.max(Some(id));
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn offsets(batch_id: u64, ranges: &[(i32, i64, i64)]) -> OffsetEntry {
        OffsetEntry {
            batch_id,
            ranges: ranges
                .iter()
                .map(|&(partition, start, end)| PartitionRange {
                    partition,
                    start,
                    end,
                })
                .collect(),
            max_event_time: None,
            planned_at: Utc::now(),
        }
    }

    fn commit(batch_id: u64, max_event_time: Option<SimTime>) -> CommitEntry {
        CommitEntry {
            batch_id,
            rows_written: 3,
            late_dropped: 0,
            decode_failures: 0,
            max_event_time,
            committed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fresh_store_recovers_to_zero() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("gps_data")).await.unwrap();

        assert_eq!(store.recover().await.unwrap(), Recovery::default());
        assert!(dir.path().join("gps_data/offsets").is_dir());
        assert!(dir.path().join("gps_data/commits").is_dir());
    }

    #[tokio::test]
    async fn test_committed_batches_advance_recovery() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 9, 10, 0).unwrap();

        store.write_offsets(&offsets(0, &[(0, 0, 4), (1, 0, 2)])).await.unwrap();
        store.write_commit(&commit(0, Some(t))).await.unwrap();
        store.write_offsets(&offsets(1, &[(0, 4, 9), (1, 2, 2)])).await.unwrap();
        store.write_commit(&commit(1, Some(t))).await.unwrap();

        let recovery = store.recover().await.unwrap();
        assert_eq!(recovery.next_batch_id, 2);
        assert!(recovery.pending.is_none());
        assert_eq!(recovery.committed_offsets, Some(vec![9, 2]));
        assert_eq!(recovery.max_event_time, Some(t));
        assert!(store.is_committed(1).await);
        assert!(!store.is_committed(2).await);
    }

    #[tokio::test]
    async fn test_uncommitted_offsets_are_pending() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 9, 10, 0).unwrap();

        store.write_offsets(&offsets(0, &[(0, 0, 4)])).await.unwrap();
        store.write_commit(&commit(0, Some(t))).await.unwrap();
        let mut planned = offsets(1, &[(0, 4, 7)]);
        planned.max_event_time = Some(t);
        store.write_offsets(&planned).await.unwrap();

        let recovery = store.recover().await.unwrap();
        assert_eq!(recovery.next_batch_id, 1);
        assert_eq!(recovery.pending, Some(planned));
        assert_eq!(recovery.committed_offsets, Some(vec![4]));
        assert_eq!(recovery.max_event_time, Some(t));
    }

    #[tokio::test]
    async fn test_temp_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        store.write_offsets(&offsets(0, &[(0, 0, 1)])).await.unwrap();
        std::fs::write(dir.path().join("offsets/.1.json.tmp"), b"{").unwrap();

        assert_eq!(store.latest_offsets().await.unwrap().unwrap().batch_id, 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("commits/0.json"), b"{\"batch_id\":").unwrap();

        assert!(matches!(
            store.latest_commit().await,
            Err(SinkError::CorruptCheckpoint { .. })
        ));
    }
}
