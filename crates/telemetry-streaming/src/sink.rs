//! # Checkpointed Parquet Sink
//!
//! Append-only, one directory per micro-batch:
//!
//! ```text
//! <output_root>/<topic>/batch_id=<N>/part-00000.parquet
//! ```
//!
//! A batch's file is written to a temp name, synced and renamed before the
//! batch is committed in the [`CheckpointStore`]. Committed batches are
//! never written again.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, FixedSizeListArray, Float64Builder, Int32Builder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow::datatypes::{Float64Type, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use telemetry_domain::{SimTime, Topic};

use crate::checkpoint::{CheckpointStore, CommitEntry};
use crate::decoder::{DecodedRecord, FieldValue};
use crate::error::SinkError;
use crate::schema::{DataType, TopicSchema};

type SinkResult<T> = std::result::Result<T, SinkError>;

/// Name of the single data file inside a batch directory.
pub const PART_FILE: &str = "part-00000.parquet";

/// Admitted records of one micro-batch plus its bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SinkBatch {
    pub batch_id: u64,
    pub records: Vec<DecodedRecord>,
    pub late_dropped: u64,
    pub decode_failures: u64,
    /// Watermark state after the batch
    pub max_event_time: Option<SimTime>,
}

/// Result of [`CheckpointedSink::append`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Committed {
        batch_id: u64,
        rows: u64,
        /// `None` when every record of the batch was dropped
        path: Option<PathBuf>,
    },
    /// The batch was committed before; nothing was written.
    AlreadyCommitted { batch_id: u64 },
}

/// Parquet dataset plus checkpoint of one topic
pub struct CheckpointedSink {
    schema: TopicSchema,
    arrow_schema: SchemaRef,
    data_dir: PathBuf,
    checkpoints: CheckpointStore,
    last_committed: Option<u64>,
}

impl CheckpointedSink {
    /// Open the topic's data and checkpoint locations. The two paths must
    /// be distinct.
    pub async fn open(
        topic: Topic,
        output_root: &Path,
        checkpoint_root: &Path,
    ) -> SinkResult<Self> {
        let data_dir = output_root.join(topic.as_str());
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| SinkError::io(&data_dir, e))?;

        let checkpoints = CheckpointStore::open(checkpoint_root.join(topic.as_str())).await?;
        let last_committed = checkpoints.latest_commit().await?.map(|c| c.batch_id);
        let schema = TopicSchema::for_topic(topic);

        Ok(Self {
            schema,
            arrow_schema: schema.arrow_schema(),
            data_dir,
            checkpoints,
            last_committed,
        })
    }

    #[must_use]
    pub const fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub const fn last_committed(&self) -> Option<u64> {
        self.last_committed
    }

    /// Durably write `batch` and commit it.
    ///
    /// Batches must arrive in id order. On error nothing is committed and
    /// partial output is removed, so the batch can be re-run.
    pub async fn append(&mut self, batch: SinkBatch) -> SinkResult<CommitResult> {
        let batch_id = batch.batch_id;
        if self.last_committed.is_some_and(|last| batch_id <= last)
            || self.checkpoints.is_committed(batch_id).await
        {
            tracing::debug!(topic = %self.schema.topic(), batch_id, "Batch already committed, skipping");
            return Ok(CommitResult::AlreadyCommitted { batch_id });
        }

        let expected = self.last_committed.map_or(0, |last| last + 1);
        if batch_id != expected {
            return Err(SinkError::BatchOutOfOrder {
                expected,
                got: batch_id,
            });
        }

        let rows = batch.records.len() as u64;
        let path = if batch.records.is_empty() {
            None
        } else {
            let dir = self.data_dir.join(format!("batch_id={batch_id}"));
            let schema = self.schema;
            let arrow_schema = Arc::clone(&self.arrow_schema);
            let records = batch.records;

            let written = tokio::task::spawn_blocking(move || {
                write_parquet(&dir, &schema, arrow_schema, &records)
            })
            .await
            .map_err(|e| SinkError::WriterTask(e.to_string()))??;
            Some(written)
        };

        self.checkpoints
            .write_commit(&CommitEntry {
                batch_id,
                rows_written: rows,
                late_dropped: batch.late_dropped,
                decode_failures: batch.decode_failures,
                max_event_time: batch.max_event_time,
                committed_at: Utc::now(),
            })
            .await?;
        self.last_committed = Some(batch_id);

        tracing::debug!(topic = %self.schema.topic(), batch_id, rows, "Batch committed");
        Ok(CommitResult::Committed {
            batch_id,
            rows,
            path,
        })
    }
}

fn writer_props() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Write `records` to `dir/part-00000.parquet` via a temp file.
fn write_parquet(
    dir: &Path,
    schema: &TopicSchema,
    arrow_schema: SchemaRef,
    records: &[DecodedRecord],
) -> SinkResult<PathBuf> {
    let batch = to_record_batch(schema, arrow_schema, records)?;

    std::fs::create_dir_all(dir).map_err(|e| SinkError::io(dir, e))?;
    let tmp = dir.join(format!(".{PART_FILE}.tmp"));
    let path = dir.join(PART_FILE);

    let result = write_file(&tmp, &batch).and_then(|()| {
        std::fs::rename(&tmp, &path).map_err(|e| SinkError::io(&path, e))
    });
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        let _ = std::fs::remove_dir(dir);
        return Err(e);
    }
    Ok(path)
}

fn write_file(path: &Path, batch: &RecordBatch) -> SinkResult<()> {
    let file = File::create(path).map_err(|e| SinkError::io(path, e))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_props()))?;
    writer.write(batch)?;
    let file = writer.into_inner()?;
    file.sync_all().map_err(|e| SinkError::io(path, e))
}

enum ColumnBuilder {
    Utf8(StringBuilder),
    Float64(Float64Builder),
    Int32(Int32Builder),
    Timestamp(TimestampMicrosecondBuilder),
    Location(Vec<Option<[Option<f64>; 2]>>),
}

impl ColumnBuilder {
    fn new(data_type: DataType, capacity: usize) -> Self {
        match data_type {
            DataType::Utf8 | DataType::Category(_) => {
                Self::Utf8(StringBuilder::with_capacity(capacity, capacity * 16))
            }
            DataType::Float64 => Self::Float64(Float64Builder::with_capacity(capacity)),
            DataType::Int32 => Self::Int32(Int32Builder::with_capacity(capacity)),
            DataType::Timestamp => Self::Timestamp(
                TimestampMicrosecondBuilder::with_capacity(capacity).with_timezone("UTC"),
            ),
            DataType::Location => Self::Location(Vec::with_capacity(capacity)),
        }
    }

    /// Values that do not fit the column become nulls.
    fn append(&mut self, value: &FieldValue) {
        match (self, value) {
            (Self::Utf8(b), FieldValue::Utf8(s)) => b.append_value(s),
            (Self::Utf8(b), _) => b.append_null(),
            (Self::Float64(b), FieldValue::Float64(v)) => b.append_value(*v),
            (Self::Float64(b), _) => b.append_null(),
            (Self::Int32(b), FieldValue::Int32(v)) => b.append_value(*v),
            (Self::Int32(b), _) => b.append_null(),
            (Self::Timestamp(b), FieldValue::Timestamp(ts)) => b.append_value(ts.timestamp_micros()),
            (Self::Timestamp(b), _) => b.append_null(),
            (Self::Location(v), FieldValue::Location(p)) => {
                v.push(Some([Some(p.latitude), Some(p.longitude)]));
            }
            (Self::Location(v), _) => v.push(None),
        }
    }

    fn finish(self) -> ArrayRef {
        match self {
            Self::Utf8(mut b) => Arc::new(b.finish()),
            Self::Float64(mut b) => Arc::new(b.finish()),
            Self::Int32(mut b) => Arc::new(b.finish()),
            Self::Timestamp(mut b) => Arc::new(b.finish()),
            Self::Location(v) => Arc::new(FixedSizeListArray::from_iter_primitive::<
                Float64Type,
                _,
                _,
            >(v, 2)),
        }
    }
}

/// Columnar view of decoded records, following the topic schema.
pub fn to_record_batch(
    schema: &TopicSchema,
    arrow_schema: SchemaRef,
    records: &[DecodedRecord],
) -> SinkResult<RecordBatch> {
    let mut columns: Vec<ColumnBuilder> = schema
        .fields()
        .iter()
        .map(|f| ColumnBuilder::new(f.data_type, records.len()))
        .collect();

    for record in records {
        for (column, value) in columns.iter_mut().zip(&record.values) {
            column.append(value);
        }
    }

    let arrays: Vec<ArrayRef> = columns.into_iter().map(ColumnBuilder::finish).collect();
    Ok(RecordBatch::try_new(arrow_schema, arrays)?)
}
