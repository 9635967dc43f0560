//! Per-day streaming spike removal.
//!
//! Removes implausible mid ticks from an event-grid stream using two
//! asymmetric rules against a running "last kept" baseline:
//!
//! - **Level**: a mid above `mid_max` is never kept (strictly greater; a
//!   mid exactly at the limit passes).
//! - **Delta**: within a day, a jump `|mid - mid_last_kept| >= threshold`
//!   versus the last *kept* tick is dropped, baseline unchanged.
//!
//! The first tick of each day is tested against the level rule only, and a
//! day crossing resets the baseline, so inter-day jumps always pass. A
//! level-rejected first-of-day tick does not install a baseline; the next
//! passing tick becomes first-of-day.
//!
//! The report keeps per-day kept/removed counts, the removal-reason split,
//! and up to `max_examples` sample spike pairs for human inspection.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::aggregator::Tick;
use crate::error::Result;
use crate::store::{TickTableReader, TickTableWriter};
use crate::time::{day_from_ts, day_to_string};

/// Denoiser thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DenoiseConfig {
    /// Drop a same-day jump of at least this many dollars.
    pub threshold: f64,

    /// Drop any mid strictly above this level.
    pub mid_max: f64,

    /// Cap on retained spike examples.
    pub max_examples: usize,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            threshold: 100.0,
            mid_max: 1000.0,
            max_examples: 10,
        }
    }
}

/// One recorded delta-rule removal, for the report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeExample {
    pub day: u32,
    pub ts_prev: u64,
    pub ts_curr: u64,
    pub mid_prev: f64,
    pub mid_curr: f64,
    pub delta: f64,
}

/// Counters and samples from one denoising pass.
#[derive(Debug, Default, Clone)]
pub struct DenoiseReport {
    pub rows_in: u64,
    pub rows_kept: u64,
    pub removed_by_delta: u64,
    pub removed_by_level: u64,
    pub removed_null: u64,
    pub kept_per_day: AHashMap<u32, u64>,
    pub removed_per_day: AHashMap<u32, u64>,
    pub examples: Vec<SpikeExample>,
}

impl DenoiseReport {
    pub fn rows_removed(&self) -> u64 {
        self.rows_in - self.rows_kept
    }

    /// Human-readable summary: per-day removals (days with removals only),
    /// sample spike pairs, then totals.
    pub fn render_summary(&self, threshold: f64) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();

        let mut days: Vec<u32> = self
            .kept_per_day
            .keys()
            .chain(self.removed_per_day.keys())
            .copied()
            .collect();
        days.sort_unstable();
        days.dedup();

        out.push_str("per-day removed counts:\n");
        for d in days {
            let removed = self.removed_per_day.get(&d).copied().unwrap_or(0);
            if removed > 0 {
                let kept = self.kept_per_day.get(&d).copied().unwrap_or(0);
                let _ = writeln!(out, "  {} removed={removed} kept={kept}", day_to_string(d));
            }
        }

        let _ = writeln!(out, "sample big-delta pairs (|dmid| >= {threshold}):");
        if self.examples.is_empty() {
            out.push_str("  none\n");
        } else {
            for ex in &self.examples {
                let _ = writeln!(
                    out,
                    "  day={} ts_prev={} ts_curr={} mid_prev={} mid_curr={} |dmid|={}",
                    day_to_string(ex.day),
                    ex.ts_prev,
                    ex.ts_curr,
                    ex.mid_prev,
                    ex.mid_curr,
                    ex.delta
                );
            }
        }

        let kept_ratio = if self.rows_in > 0 {
            self.rows_kept as f64 / self.rows_in as f64
        } else {
            1.0
        };
        let _ = writeln!(
            out,
            "in_rows={} out_rows={} removed={} kept_ratio={kept_ratio}",
            self.rows_in,
            self.rows_kept,
            self.rows_removed()
        );
        let _ = writeln!(
            out,
            "removed_by_delta={} removed_by_level={}",
            self.removed_by_delta, self.removed_by_level
        );
        out
    }
}

/// Streaming spike filter with per-day baseline state.
pub struct SpikeDenoiser {
    config: DenoiseConfig,
    report: DenoiseReport,

    last_day: u32,
    last_ts: u64,
    last_mid: f64,
    have_last: bool,
}

impl SpikeDenoiser {
    pub fn new(config: DenoiseConfig) -> Self {
        Self {
            config,
            report: DenoiseReport::default(),
            last_day: 0,
            last_ts: 0,
            last_mid: 0.0,
            have_last: false,
        }
    }

    pub fn report(&self) -> &DenoiseReport {
        &self.report
    }

    pub fn into_report(self) -> DenoiseReport {
        self.report
    }

    /// Current baseline as `(ts, mid)`, if any.
    pub fn baseline(&self) -> Option<(u64, f64)> {
        self.have_last.then_some((self.last_ts, self.last_mid))
    }

    /// Decide one tick. NaN mids count as null and are dropped.
    pub fn keep_tick(&mut self, t: &Tick) -> bool {
        self.report.rows_in += 1;

        let mid = t.mid as f64;
        if !mid.is_finite() {
            self.report.removed_null += 1;
            return false;
        }
        self.decide(t.ts, mid)
    }

    fn decide(&mut self, ts: u64, mid: f64) -> bool {
        let day = day_from_ts(ts);
        let big_level = mid > self.config.mid_max;

        if !self.have_last || day != self.last_day {
            // New day or no baseline: level rule only, no delta.
            if big_level {
                self.remove_level(day);
                // next passing tick becomes first-of-day
                self.have_last = false;
                return false;
            }
            self.keep(day, ts, mid);
            return true;
        }

        let delta = (mid - self.last_mid).abs();
        if delta >= self.config.threshold {
            self.report.removed_by_delta += 1;
            *self.report.removed_per_day.entry(day).or_insert(0) += 1;
            if self.report.examples.len() < self.config.max_examples {
                self.report.examples.push(SpikeExample {
                    day,
                    ts_prev: self.last_ts,
                    ts_curr: ts,
                    mid_prev: self.last_mid,
                    mid_curr: mid,
                    delta,
                });
            }
            // baseline stays at the last kept tick
            return false;
        }
        if big_level {
            self.remove_level(day);
            return false;
        }

        self.keep(day, ts, mid);
        true
    }

    fn keep(&mut self, day: u32, ts: u64, mid: f64) {
        self.report.rows_kept += 1;
        *self.report.kept_per_day.entry(day).or_insert(0) += 1;
        self.last_day = day;
        self.last_ts = ts;
        self.last_mid = mid;
        self.have_last = true;
    }

    fn remove_level(&mut self, day: u32) {
        self.report.removed_by_level += 1;
        *self.report.removed_per_day.entry(day).or_insert(0) += 1;
    }
}

/// Progress log cadence for the file driver.
const PROGRESS_EVERY: u64 = 10_000_000;

/// Denoise one per-year tick table into a cleaned copy.
pub fn denoise_file(
    in_path: impl AsRef<std::path::Path>,
    out_path: impl AsRef<std::path::Path>,
    config: DenoiseConfig,
) -> Result<DenoiseReport> {
    let mut reader = TickTableReader::open(in_path.as_ref())?;
    let mut writer = TickTableWriter::create(out_path.as_ref())?;
    let mut denoiser = SpikeDenoiser::new(config);

    while let Some(tick) = reader.next_tick()? {
        if denoiser.keep_tick(&tick) {
            writer.append(&tick)?;
        }
        let r = &denoiser.report;
        if r.rows_in % PROGRESS_EVERY == 0 {
            log::info!(
                "denoise: rows={} kept={} removed={}",
                r.rows_in,
                r.rows_kept,
                r.rows_removed()
            );
        }
    }
    writer.finish()?;

    let report = denoiser.into_report();
    log::info!(
        "denoise done: in={} kept={} by_delta={} by_level={}",
        report.rows_in,
        report.rows_kept,
        report.removed_by_delta,
        report.removed_by_level
    );
    Ok(report)
}
