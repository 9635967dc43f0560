//! Parquet labeled-event tables.
//!
//! Schema (looked up by name on read):
//!
//! ```text
//! ts: u64 | date: u32 | mid: f64 | mid_next: f64 | spread: f64
//!         | imbalance: f64 | age_diff_ms: f64 | last_move: f64
//!         | y: f64 | tau_ms: f64
//! ```
//!
//! Batches flush every [`EVENT_BATCH_ROWS`] rows.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float64Array, Float64Builder, UInt32Array, UInt32Builder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::error::{PipelineError, Result};
use crate::events::LabeledEvent;

/// Rows buffered per record batch on write.
pub const EVENT_BATCH_ROWS: usize = 1_000_000;

fn event_schema() -> Schema {
    Schema::new(vec![
        Field::new("ts", DataType::UInt64, false),
        Field::new("date", DataType::UInt32, false),
        Field::new("mid", DataType::Float64, false),
        Field::new("mid_next", DataType::Float64, false),
        Field::new("spread", DataType::Float64, false),
        Field::new("imbalance", DataType::Float64, false),
        Field::new("age_diff_ms", DataType::Float64, false),
        Field::new("last_move", DataType::Float64, false),
        Field::new("y", DataType::Float64, false),
        Field::new("tau_ms", DataType::Float64, false),
    ])
}

/// Buffered parquet writer for one event table.
pub struct EventTableWriter {
    schema: Arc<Schema>,
    writer: ArrowWriter<File>,

    ts: UInt64Builder,
    date: UInt32Builder,
    mid: Float64Builder,
    mid_next: Float64Builder,
    spread: Float64Builder,
    imbalance: Float64Builder,
    age_diff_ms: Float64Builder,
    last_move: Float64Builder,
    y: Float64Builder,
    tau_ms: Float64Builder,

    batch_rows: usize,
    total_rows: u64,
}

impl EventTableWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let schema = Arc::new(event_schema());
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer =
            ArrowWriter::try_new(File::create(path.as_ref())?, schema.clone(), Some(props))?;

        Ok(Self {
            schema,
            writer,
            ts: UInt64Builder::new(),
            date: UInt32Builder::new(),
            mid: Float64Builder::new(),
            mid_next: Float64Builder::new(),
            spread: Float64Builder::new(),
            imbalance: Float64Builder::new(),
            age_diff_ms: Float64Builder::new(),
            last_move: Float64Builder::new(),
            y: Float64Builder::new(),
            tau_ms: Float64Builder::new(),
            batch_rows: 0,
            total_rows: 0,
        })
    }

    pub fn append(&mut self, e: &LabeledEvent) -> Result<()> {
        self.ts.append_value(e.ts);
        self.date.append_value(e.day);
        self.mid.append_value(e.mid);
        self.mid_next.append_value(e.mid_next);
        self.spread.append_value(e.spread);
        self.imbalance.append_value(e.imbalance);
        self.age_diff_ms.append_value(e.age_diff_ms);
        self.last_move.append_value(e.last_move);
        self.y.append_value(e.y);
        self.tau_ms.append_value(e.tau_ms);

        self.batch_rows += 1;
        if self.batch_rows >= EVENT_BATCH_ROWS {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.batch_rows == 0 {
            return Ok(());
        }
        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.ts.finish()),
            Arc::new(self.date.finish()),
            Arc::new(self.mid.finish()),
            Arc::new(self.mid_next.finish()),
            Arc::new(self.spread.finish()),
            Arc::new(self.imbalance.finish()),
            Arc::new(self.age_diff_ms.finish()),
            Arc::new(self.last_move.finish()),
            Arc::new(self.y.finish()),
            Arc::new(self.tau_ms.finish()),
        ];
        let batch = RecordBatch::try_new(self.schema.clone(), columns)?;
        self.writer.write(&batch)?;
        self.total_rows += self.batch_rows as u64;
        self.batch_rows = 0;
        Ok(())
    }

    /// Flush and close, returning the total row count.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_batch()?;
        self.writer.close()?;
        Ok(self.total_rows)
    }
}

/// Streaming reader over one event table.
pub struct EventTableReader {
    path: PathBuf,
    reader: ParquetRecordBatchReader,
    current: Option<EventBatch>,
}

struct EventBatch {
    ts: UInt64Array,
    date: UInt32Array,
    mid: Float64Array,
    mid_next: Float64Array,
    spread: Float64Array,
    imbalance: Float64Array,
    age_diff_ms: Float64Array,
    last_move: Float64Array,
    y: Float64Array,
    tau_ms: Float64Array,
    row: usize,
    len: usize,
}

fn column<'a>(batch: &'a RecordBatch, name: &'static str, path: &Path) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::MissingColumn {
            column: name,
            path: path.to_path_buf(),
        })
}

fn f64_column(batch: &RecordBatch, name: &'static str, path: &Path) -> Result<Float64Array> {
    let col = column(batch, name, path)?;
    col.as_any()
        .downcast_ref::<Float64Array>()
        .cloned()
        .ok_or_else(|| PipelineError::ColumnType {
            column: name,
            actual: col.data_type().to_string(),
        })
}

impl EventTableReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
            .with_batch_size(65_536)
            .build()?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            reader,
            current: None,
        })
    }

    /// Read the whole table into memory, in file order.
    pub fn read_all<P: AsRef<Path>>(path: P) -> Result<Vec<LabeledEvent>> {
        let mut reader = Self::open(path)?;
        let mut out = Vec::new();
        while let Some(e) = reader.next_event()? {
            out.push(e);
        }
        Ok(out)
    }

    fn load_next_batch(&mut self) -> Result<bool> {
        loop {
            match self.reader.next() {
                None => return Ok(false),
                Some(batch) => {
                    let batch = batch?;
                    if batch.num_rows() == 0 {
                        continue;
                    }

                    let ts_col = column(&batch, "ts", &self.path)?;
                    let ts = ts_col
                        .as_any()
                        .downcast_ref::<UInt64Array>()
                        .cloned()
                        .ok_or_else(|| PipelineError::ColumnType {
                            column: "ts",
                            actual: ts_col.data_type().to_string(),
                        })?;
                    let date_col = column(&batch, "date", &self.path)?;
                    let date = date_col
                        .as_any()
                        .downcast_ref::<UInt32Array>()
                        .cloned()
                        .ok_or_else(|| PipelineError::ColumnType {
                            column: "date",
                            actual: date_col.data_type().to_string(),
                        })?;

                    self.current = Some(EventBatch {
                        ts,
                        date,
                        mid: f64_column(&batch, "mid", &self.path)?,
                        mid_next: f64_column(&batch, "mid_next", &self.path)?,
                        spread: f64_column(&batch, "spread", &self.path)?,
                        imbalance: f64_column(&batch, "imbalance", &self.path)?,
                        age_diff_ms: f64_column(&batch, "age_diff_ms", &self.path)?,
                        last_move: f64_column(&batch, "last_move", &self.path)?,
                        y: f64_column(&batch, "y", &self.path)?,
                        tau_ms: f64_column(&batch, "tau_ms", &self.path)?,
                        row: 0,
                        len: batch.num_rows(),
                    });
                    return Ok(true);
                }
            }
        }
    }

    /// Read the next event; `Ok(None)` at end of file.
    pub fn next_event(&mut self) -> Result<Option<LabeledEvent>> {
        loop {
            if let Some(batch) = &mut self.current {
                if batch.row < batch.len {
                    let i = batch.row;
                    batch.row += 1;
                    return Ok(Some(LabeledEvent {
                        ts: batch.ts.value(i),
                        day: batch.date.value(i),
                        mid: batch.mid.value(i),
                        mid_next: batch.mid_next.value(i),
                        spread: batch.spread.value(i),
                        imbalance: batch.imbalance.value(i),
                        age_diff_ms: batch.age_diff_ms.value(i),
                        last_move: batch.last_move.value(i),
                        y: batch.y.value(i),
                        tau_ms: batch.tau_ms.value(i),
                    }));
                }
                self.current = None;
            }
            if !self.load_next_batch()? {
                return Ok(None);
            }
        }
    }
}

impl Iterator for EventTableReader {
    type Item = Result<LabeledEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::make_ts;

    fn event(ts: u64, day: u32, y: f64) -> LabeledEvent {
        LabeledEvent {
            ts,
            day,
            mid: 100.0,
            mid_next: 100.05,
            spread: 0.01,
            imbalance: 0.25,
            age_diff_ms: -60.0,
            last_move: 1.0,
            y,
            tau_ms: 7.0,
        }
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY_2020_events.parquet");

        let mut w = EventTableWriter::create(&path).unwrap();
        w.append(&event(make_ts(20200102, 9, 30, 0, 0), 20200102, 1.0))
            .unwrap();
        w.append(&event(make_ts(20200102, 9, 30, 0, 7), 20200102, -1.0))
            .unwrap();
        assert_eq!(w.finish().unwrap(), 2);

        let events = EventTableReader::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], event(make_ts(20200102, 9, 30, 0, 0), 20200102, 1.0));
        assert_eq!(events[1].y, -1.0);
    }

    #[test]
    fn empty_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty_events.parquet");

        let w = EventTableWriter::create(&path).unwrap();
        assert_eq!(w.finish().unwrap(), 0);

        let events = EventTableReader::read_all(&path).unwrap();
        assert!(events.is_empty());
    }
}
