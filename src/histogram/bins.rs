//! Bin definitions for the 4-D state grid.
//!
//! The grid axes and their default edges:
//!
//! | axis        | bins | edges |
//! |-------------|------|-------|
//! | imbalance   | 6    | `[-1,-0.7) [-0.7,-0.3) [-0.3,-0.1) [-0.1,0.1] (0.1,0.3] (0.3,1]` |
//! | spread      | 3    | tick count `k = round(spread/0.01)`: `k<=1`, `k=2`, `k>=3` |
//! | age_diff_ms | 5    | `(-inf,-200) [-200,-50) [-50,50] (50,200] (200,inf)` |
//! | last_move   | 3    | `L < -0.5`, `|L| <= 0.5`, `L > 0.5` |
//!
//! Bin *values* can be overridden from a persisted model file; the interval
//! convention is fixed: imbalance brackets come from the interval notation,
//! age bins below the center are right-open and the center onward are
//! right-closed, spread bins are inclusive integer ranges.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const N_IMB: usize = 6;
pub const N_SPR: usize = 3;
pub const N_AGE: usize = 5;
pub const N_LAST: usize = 3;
pub const N_CELLS: usize = N_IMB * N_SPR * N_AGE * N_LAST;

/// Price increment defining one spread tick.
pub const SPREAD_TICK: f64 = 0.01;

/// Last-move classification cuts.
pub const LAST_DOWN_CUT: f64 = -0.5;
pub const LAST_UP_CUT: f64 = 0.5;

/// One imbalance bin with its bracket notation, e.g. `"[-0.7, -0.3)"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceBin {
    pub idx: usize,
    pub lo: f64,
    pub hi: f64,
    pub interval: String,
}

impl ImbalanceBin {
    fn lo_inclusive(&self) -> bool {
        self.interval.starts_with('[')
    }

    fn hi_inclusive(&self) -> bool {
        self.interval.ends_with(']')
    }

    fn contains(&self, v: f64) -> bool {
        let above = if self.lo_inclusive() {
            v >= self.lo
        } else {
            v > self.lo
        };
        let below = if self.hi_inclusive() {
            v <= self.hi
        } else {
            v < self.hi
        };
        above && below
    }
}

/// One spread bin as an inclusive tick-count range; `ticks_max: None` is
/// unbounded above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadBin {
    pub idx: usize,
    pub ticks_min: i64,
    pub ticks_max: Option<i64>,
}

/// One age-difference bin; `None` edges are infinite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeBin {
    pub idx: usize,
    pub lo: Option<f64>,
    pub hi: Option<f64>,
}

/// One last-move bin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMoveBin {
    pub idx: usize,
    #[serde(rename = "L")]
    pub l: i32,
}

/// The full 4-axis bin specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinSpec {
    pub imbalance_bins: Vec<ImbalanceBin>,
    pub spread_bins: Vec<SpreadBin>,
    pub age_diff_ms_bins: Vec<AgeBin>,
    pub last_move_bins: Vec<LastMoveBin>,
}

impl Default for BinSpec {
    fn default() -> Self {
        let intervals = [
            (-1.0, -0.7, "[-1.0, -0.7)"),
            (-0.7, -0.3, "[-0.7, -0.3)"),
            (-0.3, -0.1, "[-0.3, -0.1)"),
            (-0.1, 0.1, "[-0.1, 0.1]"),
            (0.1, 0.3, "(0.1, 0.3]"),
            (0.3, 1.0, "(0.3, 1.0]"),
        ];
        let imbalance_bins = intervals
            .iter()
            .enumerate()
            .map(|(idx, (lo, hi, interval))| ImbalanceBin {
                idx,
                lo: *lo,
                hi: *hi,
                interval: (*interval).to_string(),
            })
            .collect();

        let spread_bins = vec![
            SpreadBin { idx: 0, ticks_min: 0, ticks_max: Some(1) },
            SpreadBin { idx: 1, ticks_min: 2, ticks_max: Some(2) },
            SpreadBin { idx: 2, ticks_min: 3, ticks_max: None },
        ];

        let age_diff_ms_bins = vec![
            AgeBin { idx: 0, lo: None, hi: Some(-200.0) },
            AgeBin { idx: 1, lo: Some(-200.0), hi: Some(-50.0) },
            AgeBin { idx: 2, lo: Some(-50.0), hi: Some(50.0) },
            AgeBin { idx: 3, lo: Some(50.0), hi: Some(200.0) },
            AgeBin { idx: 4, lo: Some(200.0), hi: None },
        ];

        let last_move_bins = vec![
            LastMoveBin { idx: 0, l: -1 },
            LastMoveBin { idx: 1, l: 0 },
            LastMoveBin { idx: 2, l: 1 },
        ];

        Self {
            imbalance_bins,
            spread_bins,
            age_diff_ms_bins,
            last_move_bins,
        }
    }
}

impl BinSpec {
    /// Check axis sizes; a persisted spec of the wrong shape is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.imbalance_bins.len() != N_IMB {
            return Err(PipelineError::Config(format!(
                "imbalance_bins has {} entries, expected {N_IMB}",
                self.imbalance_bins.len()
            )));
        }
        if self.spread_bins.len() != N_SPR {
            return Err(PipelineError::Config(format!(
                "spread_bins has {} entries, expected {N_SPR}",
                self.spread_bins.len()
            )));
        }
        if self.age_diff_ms_bins.len() != N_AGE {
            return Err(PipelineError::Config(format!(
                "age_diff_ms_bins has {} entries, expected {N_AGE}",
                self.age_diff_ms_bins.len()
            )));
        }
        if self.last_move_bins.len() != N_LAST {
            return Err(PipelineError::Config(format!(
                "last_move_bins has {} entries, expected {N_LAST}",
                self.last_move_bins.len()
            )));
        }
        Ok(())
    }

    /// Imbalance bin, clamping to `[-1, 1]` first.
    pub fn imb_bin(&self, imbalance: f64) -> usize {
        let v = imbalance.clamp(-1.0, 1.0);
        for (idx, bin) in self.imbalance_bins.iter().enumerate() {
            if bin.contains(v) {
                return idx;
            }
        }
        // only reachable on a degenerate override; clamp to the outer bins
        if v < self.imbalance_bins[0].lo {
            0
        } else {
            N_IMB - 1
        }
    }

    /// Spread bin keyed by tick count `k = round(spread / 0.01)`.
    /// Non-positive or non-finite spreads map to bin 0.
    pub fn spr_bin(&self, spread: f64) -> usize {
        if spread <= 0.0 || !spread.is_finite() {
            return 0;
        }
        let k = (spread / SPREAD_TICK).round() as i64;
        for (idx, bin) in self.spread_bins.iter().enumerate() {
            if k >= bin.ticks_min && bin.ticks_max.map_or(true, |hi| k <= hi) {
                return idx;
            }
        }
        if k < self.spread_bins[0].ticks_min {
            0
        } else {
            N_SPR - 1
        }
    }

    /// Age-difference bin. Bins below the center are right-open, the center
    /// and above are right-closed.
    pub fn age_bin(&self, age_diff_ms: f64) -> usize {
        let center = N_AGE / 2;
        for (idx, bin) in self.age_diff_ms_bins.iter().enumerate() {
            if let Some(hi) = bin.hi {
                let inside = if idx < center {
                    age_diff_ms < hi
                } else {
                    age_diff_ms <= hi
                };
                if inside {
                    return idx;
                }
            }
        }
        N_AGE - 1
    }

    /// Last-move bin over the −1/0/+1 sign.
    pub fn last_bin(&self, last_move: f64) -> usize {
        if last_move < LAST_DOWN_CUT {
            0
        } else if last_move > LAST_UP_CUT {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_is_valid() {
        let spec = BinSpec::default();
        assert!(spec.validate().is_ok());
        assert_eq!(N_CELLS, 270);
    }

    #[test]
    fn imbalance_edges() {
        let spec = BinSpec::default();
        assert_eq!(spec.imb_bin(-1.0), 0);
        assert_eq!(spec.imb_bin(-0.7), 1); // left-closed second bin
        assert_eq!(spec.imb_bin(-0.3), 2);
        assert_eq!(spec.imb_bin(-0.1), 3);
        assert_eq!(spec.imb_bin(0.1), 3); // center bin right-closed
        assert_eq!(spec.imb_bin(0.100001), 4);
        assert_eq!(spec.imb_bin(0.3), 4);
        assert_eq!(spec.imb_bin(1.0), 5);
        // clamped out-of-range inputs
        assert_eq!(spec.imb_bin(-1.5), 0);
        assert_eq!(spec.imb_bin(1.5), 5);
    }

    #[test]
    fn spread_tick_rounding() {
        let spec = BinSpec::default();
        // spreads arrive as widened f32 tick values;
        // round(1.4) = 1 -> bin 0; round(1.5) = 2 -> bin 1; round(2.5) = 3 -> bin 2
        assert_eq!(spec.spr_bin(0.014f32 as f64), 0);
        assert_eq!(spec.spr_bin(0.015f32 as f64), 1);
        assert_eq!(spec.spr_bin(0.025f32 as f64), 2);
        assert_eq!(spec.spr_bin(0.01), 0);
        assert_eq!(spec.spr_bin(0.50), 2);
        // non-positive / non-finite
        assert_eq!(spec.spr_bin(0.0), 0);
        assert_eq!(spec.spr_bin(-0.01), 0);
        assert_eq!(spec.spr_bin(f64::NAN), 0);
    }

    #[test]
    fn age_edges() {
        let spec = BinSpec::default();
        assert_eq!(spec.age_bin(-201.0), 0);
        assert_eq!(spec.age_bin(-200.0), 1); // [-200, -50)
        assert_eq!(spec.age_bin(-50.0), 2); // [-50, 50]
        assert_eq!(spec.age_bin(0.0), 2);
        assert_eq!(spec.age_bin(50.0), 2);
        assert_eq!(spec.age_bin(50.1), 3);
        assert_eq!(spec.age_bin(200.0), 3);
        assert_eq!(spec.age_bin(200.1), 4);
    }

    #[test]
    fn last_move_cuts() {
        let spec = BinSpec::default();
        assert_eq!(spec.last_bin(-1.0), 0);
        assert_eq!(spec.last_bin(-0.5), 1);
        assert_eq!(spec.last_bin(0.0), 1);
        assert_eq!(spec.last_bin(0.5), 1);
        assert_eq!(spec.last_bin(1.0), 2);
    }

    #[test]
    fn wrong_axis_size_is_rejected() {
        let mut spec = BinSpec::default();
        spec.spread_bins.pop();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let spec = BinSpec::default();
        let json = serde_json::to_string(&spec).unwrap();
        let back: BinSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert!(json.contains("\"ticks_max\":null"));
    }
}
