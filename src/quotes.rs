//! Raw quote records and input parsing primitives.
//!
//! Input shards are gzip-compressed CSV with at least 8 comma-separated
//! fields per line:
//!
//! ```text
//! date,time,venue,bid,bid_size,ask,ask_size,quote_condition,...
//! ```
//!
//! `date` is `YYYYMMDD`, `time` is `HH:MM:SS.mmm`, `venue` is a single byte,
//! and trailing fields are ignored. A header row is present and discarded by
//! the reader's caller.
//!
//! Parsing here is strict: a field either parses completely or the line is
//! rejected. Rejections are recoverable data, counted upstream, never errors.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::Result;
use crate::time::make_ts;

/// Maximum number of leading CSV fields we ever look at.
pub const MAX_FIELDS: usize = 14;

/// A raw exchange quote, already timestamp-encoded.
///
/// Constructed from one accepted input line and consumed immediately by the
/// per-ms bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawQuote {
    /// Integer-encoded timestamp `YYYYMMDDHHMMSSmmm`.
    pub ts: u64,

    /// Venue tag (single byte).
    pub venue: char,

    pub bid: f32,
    pub ask: f32,
    pub bid_size: i32,
    pub ask_size: i32,
}

/// Wall-clock time of day parsed from the `HH:MM:SS.mmm` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub millis: u32,
}

impl TimeOfDay {
    /// Combine with a `YYYYMMDD` date into the integer timestamp encoding.
    #[inline]
    pub fn to_ts(self, date: u32) -> u64 {
        make_ts(date, self.hour, self.minute, self.second, self.millis)
    }
}

/// Split a CSV line into up to [`MAX_FIELDS`] leading fields.
///
/// Returns the number of fields written into `out`. Splitting stops once the
/// slot budget is exhausted; everything past the last tracked comma lands in
/// the final slot.
#[inline]
pub fn split_fields<'a>(line: &'a str, out: &mut [&'a str; MAX_FIELDS]) -> usize {
    let mut n = 0;
    let mut rest = line;
    while n + 1 < MAX_FIELDS {
        match rest.find(',') {
            Some(pos) => {
                out[n] = &rest[..pos];
                n += 1;
                rest = &rest[pos + 1..];
            }
            None => break,
        }
    }
    out[n] = rest;
    n + 1
}

/// Parse `HH:MM:SS` (first 8 bytes) plus an optional `.mmm` suffix.
///
/// Returns `None` on any malformed component.
pub fn parse_time_of_day(s: &str) -> Option<TimeOfDay> {
    let b = s.as_bytes();
    if b.len() < 8 || b[2] != b':' || b[5] != b':' {
        return None;
    }

    let two = |i: usize| -> Option<u32> {
        let (d0, d1) = (b[i], b[i + 1]);
        if d0.is_ascii_digit() && d1.is_ascii_digit() {
            Some(((d0 - b'0') as u32) * 10 + (d1 - b'0') as u32)
        } else {
            None
        }
    };

    let hour = two(0)?;
    let minute = two(3)?;
    let second = two(6)?;

    // Millisecond suffix is optional; malformed digits count as absent.
    let millis = if b.len() >= 12 && b[8] == b'.' {
        s[9..12].parse::<u32>().ok().unwrap_or(0)
    } else {
        0
    };

    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }

    Some(TimeOfDay {
        hour,
        minute,
        second,
        millis,
    })
}

/// Strict finite float parse: the whole field must be consumed and the value
/// must be finite.
#[inline]
pub fn parse_f32(s: &str) -> Option<f32> {
    match s.parse::<f32>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

/// Strict integer parse.
#[inline]
pub fn parse_i32(s: &str) -> Option<i32> {
    s.parse::<i32>().ok()
}

/// Strict unsigned parse (used for the YYYYMMDD date field).
#[inline]
pub fn parse_u32(s: &str) -> Option<u32> {
    s.parse::<u32>().ok()
}

/// Buffered line reader over a gzip-compressed text file.
///
/// The internal line buffer is reused across calls; the hot loop performs no
/// per-line allocation beyond growth of that buffer.
pub struct GzLineReader {
    inner: BufReader<GzDecoder<File>>,
    buf: String,
}

impl GzLineReader {
    /// Open a `.csv.gz` shard for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            inner: BufReader::with_capacity(1 << 20, GzDecoder::new(file)),
            buf: String::with_capacity(256),
        })
    }

    /// Read the next line, without its terminator.
    ///
    /// Returns `Ok(None)` at end of stream.
    pub fn next_line(&mut self) -> Result<Option<&str>> {
        self.buf.clear();
        let n = self.inner.read_line(&mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        while self.buf.ends_with('\n') || self.buf.ends_with('\r') {
            self.buf.pop();
        }
        Ok(Some(self.buf.as_str()))
    }
}
