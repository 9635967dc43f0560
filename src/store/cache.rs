//! Fixed-width binary tick cache.
//!
//! One 40-byte little-endian record per tick, in stream order:
//!
//! ```text
//! ts: u64 | mid: f32 | log_return: f32 | bid_size: f32 | ask_size: f32
//!         | spread: f32 | bid: f32 | ask: f32
//! ```
//!
//! `log_return` stores NaN for null. The cache exists so that downstream
//! passes over a shard never re-parse raw CSV; it is an internal format,
//! rewritten wholesale whenever stage A re-runs.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::aggregator::Tick;
use crate::error::{PipelineError, Result};

/// Bytes per cached tick record.
pub const RECORD_BYTES: usize = 40;

/// Sequential writer for one shard's cache file.
pub struct TickCacheWriter {
    out: BufWriter<File>,
    rows: u64,
}

impl TickCacheWriter {
    /// Create (truncate) the cache file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            out: BufWriter::with_capacity(1 << 20, File::create(path.as_ref())?),
            rows: 0,
        })
    }

    /// Append one tick.
    pub fn append(&mut self, t: &Tick) -> Result<()> {
        let mut rec = [0u8; RECORD_BYTES];
        rec[0..8].copy_from_slice(&t.ts.to_le_bytes());
        rec[8..12].copy_from_slice(&t.mid.to_le_bytes());
        rec[12..16].copy_from_slice(&t.log_return.to_le_bytes());
        rec[16..20].copy_from_slice(&t.bid_size.to_le_bytes());
        rec[20..24].copy_from_slice(&t.ask_size.to_le_bytes());
        rec[24..28].copy_from_slice(&t.spread.to_le_bytes());
        rec[28..32].copy_from_slice(&t.bid.to_le_bytes());
        rec[32..36].copy_from_slice(&t.ask.to_le_bytes());
        // trailing pad keeps the record a multiple of 8 bytes
        self.out.write_all(&rec)?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and close, returning the row count.
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        Ok(self.rows)
    }
}

/// Sequential reader over one shard's cache file.
pub struct TickCacheReader {
    input: BufReader<File>,
}

impl TickCacheReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            input: BufReader::with_capacity(1 << 20, File::open(path.as_ref())?),
        })
    }

    /// Read the next tick; `Ok(None)` at end of file.
    ///
    /// A trailing partial record means the cache is malformed and fails.
    pub fn next_tick(&mut self) -> Result<Option<Tick>> {
        let mut rec = [0u8; RECORD_BYTES];
        let mut filled = 0;
        while filled < RECORD_BYTES {
            let n = match self.input.read(&mut rec[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(PipelineError::Io(e)),
            };
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(PipelineError::Invariant(format!(
                    "truncated tick cache record ({filled} of {RECORD_BYTES} bytes)"
                )));
            }
            filled += n;
        }

        let f32_at = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&rec[i..i + 4]);
            f32::from_le_bytes(b)
        };
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&rec[0..8]);
        Ok(Some(Tick {
            ts: u64::from_le_bytes(ts_bytes),
            mid: f32_at(8),
            log_return: f32_at(12),
            bid_size: f32_at(16),
            ask_size: f32_at(20),
            spread: f32_at(24),
            bid: f32_at(28),
            ask: f32_at(32),
        }))
    }
}

impl Iterator for TickCacheReader {
    type Item = Result<Tick>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_tick().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64) -> Tick {
        Tick {
            ts,
            mid: 100.015,
            log_return: f32::NAN,
            bid_size: 5.0,
            ask_size: 7.0,
            spread: 0.01,
            bid: 100.01,
            ask: 100.02,
        }
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY2020_01.msbin");

        let mut w = TickCacheWriter::create(&path).unwrap();
        let mut t1 = sample(20200102093000000);
        w.append(&t1).unwrap();
        t1.ts = 20200102093000001;
        t1.log_return = 1.5e-4;
        w.append(&t1).unwrap();
        assert_eq!(w.finish().unwrap(), 2);

        let ticks: Vec<Tick> = TickCacheReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].ts, 20200102093000000);
        assert!(ticks[0].log_return.is_nan());
        assert_eq!(ticks[1].log_return, 1.5e-4);
        assert_eq!(ticks[1].bid, 100.01);
        assert_eq!(ticks[1].ask_size, 7.0);
    }

    #[test]
    fn empty_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.msbin");
        let w = TickCacheWriter::create(&path).unwrap();
        assert_eq!(w.finish().unwrap(), 0);

        let mut r = TickCacheReader::open(&path).unwrap();
        assert!(r.next_tick().unwrap().is_none());
    }
}
