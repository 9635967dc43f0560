//! NBBO aggregation: raw quote lines to per-ms ticks.
//!
//! This is the front of the pipeline. A [`TickAggregator`] consumes raw CSV
//! lines in arrival order, applies the session/venue/quality filters, reduces
//! accepted quotes into per-millisecond NBBO buckets, and emits one [`Tick`]
//! per finalized bucket (the event grid).
//!
//! The clock grid is the event grid passed through [`ForwardFill`], a pure
//! streaming transform that fills bounded intraday gaps. Both the direct
//! CSV-to-clock path and the cached event-to-clock synthesis call the same
//! routine, so the two are observationally identical.
//!
//! # Filter order
//!
//! 1. Quote condition must be exactly `R`
//! 2. Venue tag must be in the allow-set
//! 3. Regular trading hours, half-open window
//! 4. bid/ask/sizes parse as finite and strictly positive (`nonpos_field`)
//! 5. At bucket level: non-positive prices (`nonpos_price`) and
//!    locked/crossed quotes (`locked_crossed`)
//!
//! Malformed lines and filtered rows are recoverable data: counted, dropped,
//! never fatal.

use crate::config::PipelineConfig;
use crate::glitch::{category, GlitchCounts};
use crate::quotes::{
    parse_f32, parse_i32, parse_time_of_day, parse_u32, split_fields, RawQuote, MAX_FIELDS,
};
use crate::time::{day_from_ts, ms_since_midnight, same_day};

/// One per-ms NBBO snapshot.
///
/// `log_return` uses NaN as the null encoding in memory and in the binary
/// cache; the parquet store maps it to a null cell.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// Integer-encoded timestamp `YYYYMMDDHHMMSSmmm`.
    pub ts: u64,
    pub mid: f32,
    pub log_return: f32,
    pub bid_size: f32,
    pub ask_size: f32,
    pub spread: f32,
    pub bid: f32,
    pub ask: f32,
}

impl Tick {
    /// Log-return as an option (`None` encodes the first tick of a day or a
    /// reset fill baseline).
    #[inline]
    pub fn log_return_opt(&self) -> Option<f32> {
        if self.log_return.is_finite() {
            Some(self.log_return)
        } else {
            None
        }
    }
}

/// Per-ms reduction bucket.
///
/// Best bid rises via `max`, best ask falls via `min`; the corresponding
/// size is replaced only on strict price improvement.
#[derive(Debug)]
pub struct NbboBucket {
    ts: u64,
    best_bid: f32,
    best_ask: f32,
    bid_size: i32,
    ask_size: i32,
    any: bool,
}

impl NbboBucket {
    pub fn new() -> Self {
        Self {
            ts: 0,
            best_bid: 0.0,
            best_ask: f32::INFINITY,
            bid_size: 0,
            ask_size: 0,
            any: false,
        }
    }

    /// The millisecond this bucket is accumulating, 0 when idle.
    #[inline]
    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Clear the bucket and key it to a new millisecond.
    pub fn reset(&mut self, ts: u64) {
        self.ts = ts;
        self.best_bid = 0.0;
        self.best_ask = f32::INFINITY;
        self.bid_size = 0;
        self.ask_size = 0;
        self.any = false;
    }

    /// Fold one quote into the bucket, counting bucket-level rejections.
    pub fn update(&mut self, q: &RawQuote, glitches: &mut GlitchCounts, hour: u32) {
        if q.bid <= 0.0 || q.ask <= 0.0 {
            glitches.bump(category::NONPOS_PRICE, hour);
            return;
        }
        if q.ask <= q.bid {
            glitches.bump(category::LOCKED_CROSSED, hour);
            return;
        }
        if q.bid > self.best_bid {
            self.best_bid = q.bid;
            self.bid_size = q.bid_size;
            self.any = true;
        }
        if q.ask < self.best_ask {
            self.best_ask = q.ask;
            self.ask_size = q.ask_size;
            self.any = true;
        }
    }

    /// Finalize into a tick. `prev_mid` must be the previous *kept* mid on
    /// the same day, or `None` to emit a null log-return.
    pub fn finalize(&self, prev_mid: Option<f32>) -> Option<Tick> {
        if !self.any {
            return None;
        }
        let mid = 0.5 * (self.best_bid + self.best_ask);
        let log_return = match prev_mid {
            Some(pm) if pm > 0.0 && mid > 0.0 => (mid / pm).ln(),
            _ => f32::NAN,
        };
        Some(Tick {
            ts: self.ts,
            mid,
            log_return,
            bid_size: self.bid_size as f32,
            ask_size: self.ask_size as f32,
            spread: self.best_ask - self.best_bid,
            bid: self.best_bid,
            ask: self.best_ask,
        })
    }
}

impl Default for NbboBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters reported by one aggregation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregatorStats {
    /// Input lines seen (excluding the header).
    pub lines_in: u64,

    /// Quotes that survived all pre-bucket filters.
    pub quotes_accepted: u64,

    /// Event-grid ticks emitted.
    pub ticks_out: u64,
}

/// Streaming NBBO aggregator for one input shard.
///
/// Feed lines in arrival order with [`accept_line`](Self::accept_line);
/// each call emits at most one finalized tick (the bucket that just closed).
/// Call [`finish`](Self::finish) once at end of stream for the last bucket.
pub struct TickAggregator<'a> {
    config: &'a PipelineConfig,
    glitches: GlitchCounts,
    stats: AggregatorStats,
    bucket: NbboBucket,

    prev_mid: f32,
    prev_day: u32,
    have_prev: bool,
}

impl<'a> TickAggregator<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            glitches: GlitchCounts::new(),
            stats: AggregatorStats::default(),
            bucket: NbboBucket::new(),
            prev_mid: 0.0,
            prev_day: 0,
            have_prev: false,
        }
    }

    pub fn glitches(&self) -> &GlitchCounts {
        &self.glitches
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Consume the aggregator, yielding its glitch counters for the merge.
    pub fn into_glitches(self) -> GlitchCounts {
        self.glitches
    }

    /// Process one raw CSV line. Returns the tick finalized by this line, if
    /// the line rolled the bucket to a new millisecond.
    pub fn accept_line(&mut self, line: &str) -> Option<Tick> {
        self.stats.lines_in += 1;

        let quote = self.filter_line(line)?;
        self.stats.quotes_accepted += 1;

        let hour = crate::time::hour(quote.ts);
        let mut emitted = None;

        if self.bucket.ts() == 0 {
            self.bucket.reset(quote.ts);
        } else if quote.ts != self.bucket.ts() {
            emitted = self.close_bucket();
            self.bucket.reset(quote.ts);
        }

        self.bucket.update(&quote, &mut self.glitches, hour);
        emitted
    }

    /// Finalize the trailing bucket at end of stream.
    pub fn finish(&mut self) -> Option<Tick> {
        if self.bucket.ts() == 0 {
            return None;
        }
        let tick = self.close_bucket();
        self.bucket.reset(0);
        tick
    }

    fn close_bucket(&mut self) -> Option<Tick> {
        let day = day_from_ts(self.bucket.ts());
        let prev_mid = if self.have_prev && day == self.prev_day {
            Some(self.prev_mid)
        } else {
            None
        };
        let tick = self.bucket.finalize(prev_mid)?;

        self.prev_mid = tick.mid;
        self.prev_day = day;
        self.have_prev = true;
        self.stats.ticks_out += 1;
        Some(tick)
    }

    /// Apply the pre-bucket filter cascade to one line.
    fn filter_line(&mut self, line: &str) -> Option<RawQuote> {
        let mut fields = [""; MAX_FIELDS];
        let n = split_fields(line, &mut fields);
        if n < 8 {
            return None;
        }

        let (date_s, time_s, venue_s) = (fields[0], fields[1], fields[2]);
        let (bid_s, bid_size_s, ask_s, ask_size_s, qc) =
            (fields[3], fields[4], fields[5], fields[6], fields[7]);

        if qc != "R" {
            return None;
        }

        let venue = {
            let mut chars = venue_s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return None,
            }
        };
        if !self.config.venue_allowed(venue) {
            return None;
        }

        let tod = parse_time_of_day(time_s)?;
        if !self.config.rth.contains(tod.hour, tod.minute) {
            return None;
        }

        let parsed = (
            parse_f32(bid_s),
            parse_f32(ask_s),
            parse_i32(bid_size_s),
            parse_i32(ask_size_s),
        );
        let (bid, ask, bid_size, ask_size) = match parsed {
            (Some(b), Some(a), Some(bs), Some(asz)) => (b, a, bs, asz),
            _ => {
                self.glitches.bump(category::PARSE_FAIL, tod.hour);
                return None;
            }
        };
        if bid <= 0.0 || ask <= 0.0 || bid_size <= 0 || ask_size <= 0 {
            self.glitches.bump(category::NONPOS_FIELD, tod.hour);
            return None;
        }

        let date = parse_u32(date_s)?;
        Some(RawQuote {
            ts: tod.to_ts(date),
            venue,
            bid,
            ask,
            bid_size,
            ask_size,
        })
    }
}

/// Bounded forward-fill: the event-to-clock transform.
///
/// For consecutive ticks on the same day with an intraday gap of `G` ms,
/// `0 < G <= max_gap_ms` emits `G` synthetic copies of the previous tick
/// (timestamps advanced one ms each, `log_return = 0`). A larger gap emits
/// nothing and nulls the following real tick's log-return, so the next
/// return baseline restarts. Fills never cross a day boundary.
#[derive(Debug)]
pub struct ForwardFill {
    max_gap_ms: i64,
    prev: Option<Tick>,
}

impl ForwardFill {
    pub fn new(max_gap_ms: i64) -> Self {
        Self {
            max_gap_ms,
            prev: None,
        }
    }

    /// Push the next event-grid tick; `emit` receives the clock-grid stream.
    pub fn push(&mut self, mut tick: Tick, emit: &mut impl FnMut(Tick)) {
        if let Some(prev) = self.prev {
            if same_day(prev.ts, tick.ts) {
                let gap = ms_since_midnight(tick.ts) - ms_since_midnight(prev.ts) - 1;
                if gap > 0 && gap <= self.max_gap_ms {
                    let mut t = prev.ts;
                    for _ in 0..gap {
                        t = crate::time::inc_ms(t);
                        emit(Tick {
                            ts: t,
                            log_return: 0.0,
                            ..prev
                        });
                    }
                } else if gap > self.max_gap_ms {
                    tick.log_return = f32::NAN;
                }
            }
        }
        emit(tick);
        self.prev = Some(tick);
    }

    /// Reset the fill baseline (between independent shards).
    pub fn reset(&mut self) {
        self.prev = None;
    }
}
