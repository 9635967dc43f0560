//! Mid-change event construction and labeling.
//!
//! Transforms a cleaned event-grid tick stream into [`LabeledEvent`] rows.
//! A tick marks an event iff its log-return is finite and non-zero (the mid
//! moved). Each event is labeled by the *next* same-day event: the next mid,
//! the sign of the move, and the waiting time to it. The last event of a day
//! therefore never emits, and neither does an event whose next move jumps
//! more than `threshold_next` dollars.
//!
//! Per-day state tracks how long the current best bid/ask price has been
//! standing on each side; the bid-minus-ask age difference is one of the
//! four model features.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = EventBuilder::new(EventBuilderConfig::default());
//! for tick in ticks {
//!     if let Some(labeled) = builder.on_tick(&tick) {
//!         writer.append(&labeled)?;
//!     }
//! }
//! builder.finish();
//! println!("{:?}", builder.stats());
//! ```

use serde::{Deserialize, Serialize};

use crate::aggregator::Tick;
use crate::error::Result;
use crate::store::{EventTableWriter, TickTableReader};
use crate::time::{day_from_ts, ms_since_midnight};

/// One labeled mid-change event.
///
/// Numeric fields are f64 to match the on-disk event schema; `last_move` and
/// `y` carry the sign values −1/0/+1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabeledEvent {
    /// Integer-encoded timestamp of the mid change.
    pub ts: u64,

    /// Trading day `YYYYMMDD`.
    pub day: u32,

    /// Mid-price at event time.
    pub mid: f64,

    /// Mid-price at the next same-day mid change.
    pub mid_next: f64,

    /// Best ask minus best bid at event time.
    pub spread: f64,

    /// `(bid_size - ask_size) / (bid_size + ask_size)`, in [-1, 1].
    pub imbalance: f64,

    /// Bid quote age minus ask quote age, in ms.
    pub age_diff_ms: f64,

    /// Sign of the previous same-day mid move (0 for the first).
    pub last_move: f64,

    /// Sign of `mid_next - mid`.
    pub y: f64,

    /// Waiting time to the next mid change, in ms. Always positive.
    pub tau_ms: f64,
}

/// Event-builder knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EventBuilderConfig {
    /// Drop an event when the next same-day mid jumps more than this many
    /// dollars (outlier guard on the label).
    pub threshold_next: f64,
}

impl Default for EventBuilderConfig {
    fn default() -> Self {
        Self { threshold_next: 1.0 }
    }
}

/// Counters reported by one event-building pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventBuilderStats {
    pub ticks_total: u64,
    pub events_detected: u64,
    pub events_written: u64,
    pub events_dropped_bigmove: u64,
    pub events_dropped_boundary: u64,
}

/// Streaming event builder over one cleaned tick stream.
pub struct EventBuilder {
    config: EventBuilderConfig,
    stats: EventBuilderStats,

    curr_day: u32,
    have_day: bool,

    last_bid_price: f64,
    last_ask_price: f64,
    bid_origin_ms: i64,
    ask_origin_ms: i64,

    last_move_sign: f64,
    prev_event: Option<LabeledEvent>,
}

impl EventBuilder {
    pub fn new(config: EventBuilderConfig) -> Self {
        Self {
            config,
            stats: EventBuilderStats::default(),
            curr_day: 0,
            have_day: false,
            last_bid_price: 0.0,
            last_ask_price: 0.0,
            bid_origin_ms: 0,
            ask_origin_ms: 0,
            last_move_sign: 0.0,
            prev_event: None,
        }
    }

    pub fn stats(&self) -> EventBuilderStats {
        self.stats
    }

    /// Process one tick; returns the *previous* event once the current tick
    /// supplies its label.
    pub fn on_tick(&mut self, t: &Tick) -> Option<LabeledEvent> {
        self.stats.ticks_total += 1;

        let day = day_from_ts(t.ts);
        let ms = ms_since_midnight(t.ts);

        if !self.have_day || day != self.curr_day {
            self.start_new_day(day, ms, t.bid as f64, t.ask as f64);
        }

        let (age_bid_ms, age_ask_ms) = self.update_quote_ages(ms, t.bid as f64, t.ask as f64);
        let age_diff_ms = age_bid_ms - age_ask_ms;
        let imbalance = imbalance(t.bid_size as f64, t.ask_size as f64);

        // Only a finite non-zero log-return marks a mid change.
        let lr = t.log_return;
        if !lr.is_finite() || lr == 0.0 {
            return None;
        }
        self.stats.events_detected += 1;

        let event = LabeledEvent {
            ts: t.ts,
            day,
            mid: t.mid as f64,
            mid_next: 0.0,
            spread: t.spread as f64,
            imbalance,
            age_diff_ms,
            last_move: self.last_move_sign,
            y: 0.0,
            tau_ms: 0.0,
        };

        let labeled = self.label_prev(&event, ms);

        self.last_move_sign = if lr > 0.0 { 1.0 } else { -1.0 };
        self.prev_event = Some(event);

        labeled
    }

    /// Drop any pending event at end of stream.
    pub fn finish(&mut self) {
        if self.prev_event.take().is_some() {
            self.stats.events_dropped_boundary += 1;
        }
    }

    fn start_new_day(&mut self, day: u32, ms: i64, bid: f64, ask: f64) {
        self.curr_day = day;
        self.have_day = true;

        self.last_bid_price = bid;
        self.last_ask_price = ask;
        self.bid_origin_ms = ms;
        self.ask_origin_ms = ms;
        self.last_move_sign = 0.0;

        // leftover event from the prior day has no same-day "next"
        if self.prev_event.take().is_some() {
            self.stats.events_dropped_boundary += 1;
        }
    }

    fn update_quote_ages(&mut self, ms: i64, bid: f64, ask: f64) -> (f64, f64) {
        if bid != self.last_bid_price {
            self.last_bid_price = bid;
            self.bid_origin_ms = ms;
        }
        if ask != self.last_ask_price {
            self.last_ask_price = ask;
            self.ask_origin_ms = ms;
        }
        (
            (ms - self.bid_origin_ms) as f64,
            (ms - self.ask_origin_ms) as f64,
        )
    }

    fn label_prev(&mut self, event: &LabeledEvent, ms_curr: i64) -> Option<LabeledEvent> {
        let prev = self.prev_event.as_ref()?;
        if prev.day != event.day {
            return None;
        }

        let dmid = event.mid - prev.mid;
        if dmid.abs() > self.config.threshold_next {
            self.stats.events_dropped_bigmove += 1;
            return None;
        }

        let mut labeled = *prev;
        labeled.mid_next = event.mid;
        labeled.y = if dmid > 0.0 {
            1.0
        } else if dmid < 0.0 {
            -1.0
        } else {
            0.0
        };
        labeled.tau_ms = (ms_curr - ms_since_midnight(prev.ts)) as f64;

        self.stats.events_written += 1;
        Some(labeled)
    }
}

/// Signed volume skew with a zero-denominator guard.
#[inline]
pub fn imbalance(bid_size: f64, ask_size: f64) -> f64 {
    let denom = bid_size + ask_size;
    if denom == 0.0 {
        0.0
    } else {
        (bid_size - ask_size) / denom
    }
}

/// Progress log cadence for the file driver.
const PROGRESS_EVERY: u64 = 10_000_000;

/// Build one year's event table from its cleaned tick table.
pub fn build_events_file(
    in_path: impl AsRef<std::path::Path>,
    out_path: impl AsRef<std::path::Path>,
    config: EventBuilderConfig,
) -> Result<EventBuilderStats> {
    let mut reader = TickTableReader::open(in_path.as_ref())?;
    let mut writer = EventTableWriter::create(out_path.as_ref())?;
    let mut builder = EventBuilder::new(config);

    while let Some(tick) = reader.next_tick()? {
        if let Some(event) = builder.on_tick(&tick) {
            writer.append(&event)?;
        }
        let n = builder.stats().ticks_total;
        if n % PROGRESS_EVERY == 0 {
            log::info!(
                "build_events: ticks={} events_written={}",
                n,
                builder.stats().events_written
            );
        }
    }
    builder.finish();
    writer.finish()?;

    let stats = builder.stats();
    log::info!(
        "build_events done: ticks={} detected={} written={} dropped_bigmove={} dropped_boundary={}",
        stats.ticks_total,
        stats.events_detected,
        stats.events_written,
        stats.events_dropped_bigmove,
        stats.events_dropped_boundary
    );
    Ok(stats)
}
