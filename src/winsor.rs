//! Parallel extreme-tail quantile estimation over log-return streams.
//!
//! Exact selection with bounded memory: over its shard subset, each worker
//! keeps a max-heap of the smallest values seen, a min-heap of the largest,
//! and a finite-sample count. Worker sketches merge into a
//! global two-sided sketch under a single lock, then the cutoffs are read
//! off the sorted heap contents by rank.
//!
//! With heap capacity `L >= ceil(max(q_lo, 1 - q_hi) * N) + margin` the
//! result is exact. When the requested rank falls outside the captured
//! tail, the outermost captured value is returned, the result is flagged
//! inexact, and a warning is logged; the caller may treat it as a bound.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::config::{WinsorConfig, WinsorMode};
use crate::error::{PipelineError, Result, StageContext};
use crate::store::TickCacheReader;

/// Finite f32 with a total order, usable as a heap key.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrdF32(f32);

impl Eq for OrdF32 {}

impl PartialOrd for OrdF32 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF32 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Two-sided bounded tail sketch.
#[derive(Debug)]
pub struct TailSketch {
    capacity: usize,

    /// Max-heap holding the smallest `capacity` values.
    lows: BinaryHeap<OrdF32>,

    /// Min-heap holding the largest `capacity` values.
    highs: BinaryHeap<Reverse<OrdF32>>,

    /// Finite samples observed.
    n_finite: u64,
}

impl TailSketch {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lows: BinaryHeap::with_capacity(capacity + 1),
            highs: BinaryHeap::with_capacity(capacity + 1),
            n_finite: 0,
        }
    }

    /// Observe one sample. Non-finite values are ignored.
    #[inline]
    pub fn observe(&mut self, v: f32) {
        if !v.is_finite() {
            return;
        }
        self.n_finite += 1;

        if self.lows.len() < self.capacity {
            self.lows.push(OrdF32(v));
        } else if let Some(top) = self.lows.peek() {
            if v < top.0 {
                self.lows.pop();
                self.lows.push(OrdF32(v));
            }
        }

        if self.highs.len() < self.capacity {
            self.highs.push(Reverse(OrdF32(v)));
        } else if let Some(Reverse(top)) = self.highs.peek() {
            if v > top.0 {
                self.highs.pop();
                self.highs.push(Reverse(OrdF32(v)));
            }
        }
    }

    /// Finite samples observed so far.
    pub fn count(&self) -> u64 {
        self.n_finite
    }

    /// Fold a worker sketch into this one.
    pub fn merge(&mut self, other: TailSketch) {
        self.n_finite += other.n_finite;
        for OrdF32(v) in other.lows.into_vec() {
            if self.lows.len() < self.capacity {
                self.lows.push(OrdF32(v));
            } else if let Some(top) = self.lows.peek() {
                if v < top.0 {
                    self.lows.pop();
                    self.lows.push(OrdF32(v));
                }
            }
        }
        for Reverse(OrdF32(v)) in other.highs.into_vec() {
            if self.highs.len() < self.capacity {
                self.highs.push(Reverse(OrdF32(v)));
            } else if let Some(Reverse(top)) = self.highs.peek() {
                if v > top.0 {
                    self.highs.pop();
                    self.highs.push(Reverse(OrdF32(v)));
                }
            }
        }
    }

    /// Read the cutoffs off the sketch by rank.
    pub fn finalize(self, q_lo: f64, q_hi: f64) -> TailCutoffs {
        let n = self.n_finite;
        if n == 0 {
            return TailCutoffs {
                lo: f64::NAN,
                hi: f64::NAN,
                n: 0,
                lo_exact: false,
                hi_exact: false,
            };
        }

        let mut lows: Vec<f32> = self.lows.into_vec().into_iter().map(|v| v.0).collect();
        lows.sort_by(f32::total_cmp);
        let mut highs: Vec<f32> = self
            .highs
            .into_vec()
            .into_iter()
            .map(|Reverse(v)| v.0)
            .collect();
        highs.sort_by(f32::total_cmp);

        let r_lo = (q_lo * n as f64).floor() as u64;
        let r_hi = (q_hi * n as f64).floor() as u64;

        // lower tail: global rank r is inside `lows` iff r < |lows|
        let lo_exact = (r_lo as usize) < lows.len();
        let idx_lo = if lo_exact {
            r_lo as usize
        } else {
            lows.len() - 1
        };

        // upper tail: sorted `highs` holds global ranks [n - |highs|, n)
        let base = n.saturating_sub(highs.len() as u64);
        let hi_exact = r_hi >= base;
        let idx_hi = if r_hi <= base {
            0
        } else {
            ((r_hi - base) as usize).min(highs.len() - 1)
        };

        if !lo_exact || !hi_exact {
            log::warn!(
                "tail sketch capacity too small for requested quantiles \
                 (n={n}, r_lo={r_lo}, r_hi={r_hi}, captured lo={}, hi={}); \
                 returning heap boundaries",
                lows.len(),
                highs.len()
            );
        }

        TailCutoffs {
            lo: lows[idx_lo] as f64,
            hi: highs[idx_hi] as f64,
            n,
            lo_exact,
            hi_exact,
        }
    }
}

/// Result of the tail-quantile pass.
#[derive(Debug, Clone, Copy)]
pub struct TailCutoffs {
    /// Lower cutoff (value at rank `floor(q_lo * n)`), NaN when `n == 0`.
    pub lo: f64,

    /// Upper cutoff (value at rank `floor(q_hi * n)`), NaN when `n == 0`.
    pub hi: f64,

    /// Finite samples observed.
    pub n: u64,

    /// False when the lower rank fell outside the captured tail.
    pub lo_exact: bool,

    /// False when the upper rank fell outside the captured tail.
    pub hi_exact: bool,
}

impl TailCutoffs {
    /// True when winsorization can be applied at all.
    pub fn usable(&self) -> bool {
        self.n > 0 && self.lo.is_finite() && self.hi.is_finite()
    }
}

/// Apply a winsor policy to one log-return.
///
/// `None` means the row is excluded (drop mode); non-finite inputs pass
/// through untouched, since null returns carry day-boundary information.
#[inline]
pub fn winsorize(log_return: f32, cutoffs: &TailCutoffs, mode: WinsorMode) -> Option<f32> {
    if !log_return.is_finite() {
        return Some(log_return);
    }
    let lr = log_return as f64;
    match mode {
        WinsorMode::Clip => {
            if lr < cutoffs.lo {
                Some(cutoffs.lo as f32)
            } else if lr > cutoffs.hi {
                Some(cutoffs.hi as f32)
            } else {
                Some(log_return)
            }
        }
        WinsorMode::Drop => {
            if lr < cutoffs.lo || lr > cutoffs.hi {
                None
            } else {
                Some(log_return)
            }
        }
    }
}

const STAGE: &str = "tail-quantiles";

/// Run the parallel tail pass over cached tick shards.
pub fn compute_tail_cutoffs(
    shards: &[PathBuf],
    config: &WinsorConfig,
    workers: Option<usize>,
) -> Result<TailCutoffs> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(w) = workers {
        builder = builder.num_threads(w);
    }
    let pool = builder
        .build()
        .map_err(|e| PipelineError::Config(format!("thread pool build failed: {e}")))?;

    let global = Mutex::new(TailSketch::new(config.heap_capacity));

    pool.install(|| {
        shards.par_iter().try_for_each(|path| -> Result<()> {
            let mut local = TailSketch::new(config.heap_capacity);
            let mut reader =
                TickCacheReader::open(path).stage(STAGE, path.display().to_string())?;
            loop {
                match reader.next_tick().stage(STAGE, path.display().to_string())? {
                    Some(tick) => local.observe(tick.log_return),
                    None => break,
                }
            }
            log::debug!(
                "tail pass: {} contributed {} finite returns",
                path.display(),
                local.count()
            );
            global.lock().merge(local);
            Ok(())
        })
    })?;

    let cutoffs = global.into_inner().finalize(config.q_lo, config.q_hi);
    log::info!(
        "tail pass: n={} q_lo={} -> {} q_hi={} -> {}",
        cutoffs.n,
        config.q_lo,
        cutoffs.lo,
        config.q_hi,
        cutoffs.hi
    );
    Ok(cutoffs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch_over(values: impl IntoIterator<Item = f32>, capacity: usize) -> TailSketch {
        let mut s = TailSketch::new(capacity);
        for v in values {
            s.observe(v);
        }
        s
    }

    #[test]
    fn exact_selection_when_capacity_covers_rank() {
        // 0.0, 1.0, ..., 999.0; q_lo=0.01 -> rank 10 -> value 10.0
        let s = sketch_over((0..1000).map(|i| i as f32), 100);
        let c = s.finalize(0.01, 0.99);
        assert_eq!(c.n, 1000);
        assert!(c.lo_exact && c.hi_exact);
        assert_eq!(c.lo, 10.0);
        // r_hi = floor(0.99 * 1000) = 990 -> value 990.0
        assert_eq!(c.hi, 990.0);
    }

    #[test]
    fn non_finite_samples_are_ignored() {
        let mut s = sketch_over([1.0, 2.0, 3.0], 10);
        s.observe(f32::NAN);
        s.observe(f32::INFINITY);
        assert_eq!(s.count(), 3);
    }

    #[test]
    fn empty_input_yields_nan() {
        let s = TailSketch::new(10);
        let c = s.finalize(1e-5, 1.0 - 1e-5);
        assert_eq!(c.n, 0);
        assert!(c.lo.is_nan() && c.hi.is_nan());
        assert!(!c.usable());
    }

    #[test]
    fn undersized_capacity_returns_boundary_and_flags() {
        // rank 50 of 1000 with capacity 10: outside the captured low tail
        let s = sketch_over((0..1000).map(|i| i as f32), 10);
        let c = s.finalize(0.05, 0.5);
        assert!(!c.lo_exact);
        assert_eq!(c.lo, 9.0); // outermost captured low
        assert!(!c.hi_exact); // rank 500 below the captured high range
        assert_eq!(c.hi, 990.0); // innermost captured high
    }

    #[test]
    fn merge_equals_single_pass() {
        let values: Vec<f32> = (0..500).map(|i| (i as f32) * 0.25 - 40.0).collect();

        let mut split_a = sketch_over(values[..200].iter().copied(), 50);
        let split_b = sketch_over(values[200..].iter().copied(), 50);
        split_a.merge(split_b);
        let merged = split_a.finalize(0.02, 0.98);

        let single = sketch_over(values.iter().copied(), 50).finalize(0.02, 0.98);
        assert_eq!(merged.n, single.n);
        assert_eq!(merged.lo, single.lo);
        assert_eq!(merged.hi, single.hi);
    }

    #[test]
    fn clip_and_drop_policies() {
        let cutoffs = TailCutoffs {
            lo: -0.5,
            hi: 0.5,
            n: 100,
            lo_exact: true,
            hi_exact: true,
        };

        assert_eq!(winsorize(-0.9, &cutoffs, WinsorMode::Clip), Some(-0.5));
        assert_eq!(winsorize(0.9, &cutoffs, WinsorMode::Clip), Some(0.5));
        assert_eq!(winsorize(0.1, &cutoffs, WinsorMode::Clip), Some(0.1));

        assert_eq!(winsorize(-0.9, &cutoffs, WinsorMode::Drop), None);
        assert_eq!(winsorize(0.9, &cutoffs, WinsorMode::Drop), None);
        assert_eq!(winsorize(0.1, &cutoffs, WinsorMode::Drop), Some(0.1));

        // null log-returns are never touched
        let kept = winsorize(f32::NAN, &cutoffs, WinsorMode::Drop).unwrap();
        assert!(kept.is_nan());
    }

    #[test]
    fn parallel_pass_over_cache_shards() {
        use crate::aggregator::Tick;
        use crate::store::TickCacheWriter;

        let dir = tempfile::tempdir().unwrap();
        let mut shards = Vec::new();
        let mut next_val = 0f32;
        for s in 0..4 {
            let path = dir.path().join(format!("shard{s}.msbin"));
            let mut w = TickCacheWriter::create(&path).unwrap();
            for i in 0..250 {
                let lr = if i % 10 == 0 { f32::NAN } else { next_val };
                next_val += 1.0;
                w.append(&Tick {
                    ts: 20200102093000000 + i,
                    mid: 100.0,
                    log_return: lr,
                    bid_size: 1.0,
                    ask_size: 1.0,
                    spread: 0.01,
                    bid: 100.0,
                    ask: 100.01,
                })
                .unwrap();
            }
            w.finish().unwrap();
            shards.push(path);
        }

        let config = WinsorConfig {
            q_lo: 0.01,
            q_hi: 0.99,
            heap_capacity: 50,
            mode: WinsorMode::Clip,
        };
        let cutoffs = compute_tail_cutoffs(&shards, &config, Some(2)).unwrap();
        assert_eq!(cutoffs.n, 900); // 4 * 250 minus the NaNs
        assert!(cutoffs.lo_exact && cutoffs.hi_exact);
        assert!(cutoffs.lo < cutoffs.hi);
    }
}
