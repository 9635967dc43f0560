//! Parquet tick tables: the partitioned per-year store.
//!
//! Schema (columns are looked up by name on read):
//!
//! | column     | type          |
//! |------------|---------------|
//! | ts         | u64           |
//! | mid        | f32           |
//! | log_return | f32, nullable |
//! | bid_size   | f32           |
//! | ask_size   | f32           |
//! | spread     | f32           |
//! | bid        | f32           |
//! | ask        | f32           |
//!
//! Writers buffer rows into Arrow builders and flush a record batch every
//! [`TICK_BATCH_ROWS`] rows. [`PartitionedTickWriter`] routes each tick to a
//! per-year file keyed by the year embedded in its timestamp; writers open
//! lazily on first row and each is closed exactly once at end of stream.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float32Array, Float32Builder, UInt64Array, UInt64Builder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::aggregator::Tick;
use crate::error::{PipelineError, Result};
use crate::time::year_from_ts;

/// Rows buffered per record batch on write.
pub const TICK_BATCH_ROWS: usize = 2_000_000;

fn tick_schema() -> Schema {
    Schema::new(vec![
        Field::new("ts", DataType::UInt64, false),
        Field::new("mid", DataType::Float32, false),
        Field::new("log_return", DataType::Float32, true),
        Field::new("bid_size", DataType::Float32, false),
        Field::new("ask_size", DataType::Float32, false),
        Field::new("spread", DataType::Float32, false),
        Field::new("bid", DataType::Float32, false),
        Field::new("ask", DataType::Float32, false),
    ])
}

/// Buffered parquet writer for one tick file.
pub struct TickTableWriter {
    schema: Arc<Schema>,
    writer: ArrowWriter<File>,

    ts: UInt64Builder,
    mid: Float32Builder,
    log_return: Float32Builder,
    bid_size: Float32Builder,
    ask_size: Float32Builder,
    spread: Float32Builder,
    bid: Float32Builder,
    ask: Float32Builder,

    batch_rows: usize,
    total_rows: u64,
}

impl TickTableWriter {
    /// Create (truncate) a tick table at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let schema = Arc::new(tick_schema());
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(File::create(path.as_ref())?, schema.clone(), Some(props))?;

        Ok(Self {
            schema,
            writer,
            ts: UInt64Builder::new(),
            mid: Float32Builder::new(),
            log_return: Float32Builder::new(),
            bid_size: Float32Builder::new(),
            ask_size: Float32Builder::new(),
            spread: Float32Builder::new(),
            bid: Float32Builder::new(),
            ask: Float32Builder::new(),
            batch_rows: 0,
            total_rows: 0,
        })
    }

    /// Append one tick. NaN log-returns become nulls.
    pub fn append(&mut self, t: &Tick) -> Result<()> {
        self.ts.append_value(t.ts);
        self.mid.append_value(t.mid);
        if t.log_return.is_finite() {
            self.log_return.append_value(t.log_return);
        } else {
            self.log_return.append_null();
        }
        self.bid_size.append_value(t.bid_size);
        self.ask_size.append_value(t.ask_size);
        self.spread.append_value(t.spread);
        self.bid.append_value(t.bid);
        self.ask.append_value(t.ask);

        self.batch_rows += 1;
        if self.batch_rows >= TICK_BATCH_ROWS {
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
            Arc::new(self.mid.finish()),
            Arc::new(self.log_return.finish()),
            Arc::new(self.bid_size.finish()),
            Arc::new(self.ask_size.finish()),
            Arc::new(self.spread.finish()),
            Arc::new(self.bid.finish()),
            Arc::new(self.ask.finish()),
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

/// Per-year partitioned tick writer.
///
/// Files are `<dir>/<symbol>_<year>.parquet`. A single input shard may span
/// a year boundary, so several writers can be open at once; each is owned
/// exclusively by this struct and closed exactly once by
/// [`finish`](Self::finish).
pub struct PartitionedTickWriter {
    dir: PathBuf,
    symbol: String,
    writers: BTreeMap<i32, TickTableWriter>,
}

impl PartitionedTickWriter {
    pub fn new<P: AsRef<Path>>(dir: P, symbol: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            symbol: symbol.into(),
            writers: BTreeMap::new(),
        })
    }

    /// Path of one year's partition file.
    pub fn partition_path(&self, year: i32) -> PathBuf {
        self.dir.join(format!("{}_{}.parquet", self.symbol, year))
    }

    /// Route one tick to its year partition, opening the writer lazily.
    pub fn append(&mut self, t: &Tick) -> Result<()> {
        let year = year_from_ts(t.ts);
        if !self.writers.contains_key(&year) {
            let path = self.partition_path(year);
            log::info!("opening tick partition year={year} -> {}", path.display());
            self.writers.insert(year, TickTableWriter::create(path)?);
        }
        // lookup cannot fail after the insert above
        self.writers
            .get_mut(&year)
            .ok_or_else(|| PipelineError::Invariant("partition writer vanished".into()))?
            .append(t)
    }

    /// Close every open partition exactly once (consuming the writer map);
    /// returns `(year, rows)` pairs.
    pub fn finish(mut self) -> Result<Vec<(i32, u64)>> {
        let mut out = Vec::with_capacity(self.writers.len());
        for (year, writer) in std::mem::take(&mut self.writers) {
            let rows = writer.finish()?;
            log::info!("closed tick partition year={year} rows={rows}");
            out.push((year, rows));
        }
        Ok(out)
    }

    /// Years with an open writer (ascending).
    pub fn open_years(&self) -> Vec<i32> {
        self.writers.keys().copied().collect()
    }
}

/// Streaming reader over one tick table.
///
/// Iterates ticks in file order; missing columns are fatal schema errors.
pub struct TickTableReader {
    path: PathBuf,
    reader: ParquetRecordBatchReader,
    current: Option<TickBatch>,
}

struct TickBatch {
    ts: UInt64Array,
    mid: Float32Array,
    log_return: Float32Array,
    bid_size: Float32Array,
    ask_size: Float32Array,
    spread: Float32Array,
    bid: Float32Array,
    ask: Float32Array,
    row: usize,
    len: usize,
}

fn f32_column(batch: &RecordBatch, name: &'static str, path: &Path) -> Result<Float32Array> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::MissingColumn {
            column: name,
            path: path.to_path_buf(),
        })?;
    col.as_any()
        .downcast_ref::<Float32Array>()
        .cloned()
        .ok_or_else(|| PipelineError::ColumnType {
            column: name,
            actual: col.data_type().to_string(),
        })
}

fn u64_column(batch: &RecordBatch, name: &'static str, path: &Path) -> Result<UInt64Array> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::MissingColumn {
            column: name,
            path: path.to_path_buf(),
        })?;
    col.as_any()
        .downcast_ref::<UInt64Array>()
        .cloned()
        .ok_or_else(|| PipelineError::ColumnType {
            column: name,
            actual: col.data_type().to_string(),
        })
}

impl TickTableReader {
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

    fn load_next_batch(&mut self) -> Result<bool> {
        loop {
            match self.reader.next() {
                None => return Ok(false),
                Some(batch) => {
                    let batch = batch?;
                    if batch.num_rows() == 0 {
                        continue;
                    }
                    self.current = Some(TickBatch {
                        ts: u64_column(&batch, "ts", &self.path)?,
                        mid: f32_column(&batch, "mid", &self.path)?,
                        log_return: f32_column(&batch, "log_return", &self.path)?,
                        bid_size: f32_column(&batch, "bid_size", &self.path)?,
                        ask_size: f32_column(&batch, "ask_size", &self.path)?,
                        spread: f32_column(&batch, "spread", &self.path)?,
                        bid: f32_column(&batch, "bid", &self.path)?,
                        ask: f32_column(&batch, "ask", &self.path)?,
                        row: 0,
                        len: batch.num_rows(),
                    });
                    return Ok(true);
                }
            }
        }
    }

    /// Read the next tick; `Ok(None)` at end of file.
    pub fn next_tick(&mut self) -> Result<Option<Tick>> {
        loop {
            if let Some(batch) = &mut self.current {
                if batch.row < batch.len {
                    let i = batch.row;
                    batch.row += 1;
                    let log_return = if batch.log_return.is_null(i) {
                        f32::NAN
                    } else {
                        batch.log_return.value(i)
                    };
                    return Ok(Some(Tick {
                        ts: batch.ts.value(i),
                        mid: batch.mid.value(i),
                        log_return,
                        bid_size: batch.bid_size.value(i),
                        ask_size: batch.ask_size.value(i),
                        spread: batch.spread.value(i),
                        bid: batch.bid.value(i),
                        ask: batch.ask.value(i),
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

impl Iterator for TickTableReader {
    type Item = Result<Tick>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_tick().transpose()
    }
}
