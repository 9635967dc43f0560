//! The histogram model: per-cell statistics and derived quantities.
//!
//! A cell accumulates `n` (all labeled events), `n_up`/`n_down` (signed
//! moves; flat moves count toward `n` only), and the summed waiting time.
//! Derived quantities use Laplace smoothing with `alpha`:
//!
//! ```text
//! p_up(k) = (n_up + alpha) / (n_up + n_down + 2 alpha)     (0.5 when empty)
//! D(k)    = 2 p_up(k) - 1
//! mean_tau_ms(k) = sum_tau_ms / n                          (NaN when empty)
//! ```
//!
//! The persisted JSON carries the bin spec (so consumers can validate), the
//! 270 cell records with their derived values, and a conservative
//! `2 x global mean tau` sentinel in place of NaN for empty cells. Loading
//! takes the raw counts and recomputes derived values; a file whose cell
//! array is not exactly 270 entries is a fatal schema error.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::bins::{BinSpec, N_AGE, N_CELLS, N_LAST, N_SPR};
use crate::error::{PipelineError, Result};

/// Accumulated statistics for one cell of the 4-D grid.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CellStats {
    pub n: u64,
    pub n_up: u64,
    pub n_down: u64,
    pub sum_tau_ms: f64,
}

/// State vector `(I, s, age_diff, L)` of one event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickState {
    pub imbalance: f64,
    pub spread: f64,
    pub age_diff_ms: f64,
    pub last_move: f64,
}

/// Provenance carried by a persisted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub symbol: String,
    pub year_lo: i32,
    pub year_hi: i32,
}

/// The 4-D categorical model.
#[derive(Debug, Clone)]
pub struct HistogramModel {
    pub alpha: f64,
    pub bins: BinSpec,
    cells: Vec<CellStats>,
}

impl HistogramModel {
    /// Fresh model with zeroed cells and the default bin spec.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            bins: BinSpec::default(),
            cells: vec![CellStats::default(); N_CELLS],
        }
    }

    pub fn cells(&self) -> &[CellStats] {
        &self.cells
    }

    pub fn cell(&self, k: usize) -> &CellStats {
        &self.cells[k]
    }

    /// Linear cell index of a state.
    pub fn cell_index(&self, x: &TickState) -> usize {
        let b_imb = self.bins.imb_bin(x.imbalance);
        let b_spr = self.bins.spr_bin(x.spread);
        let b_age = self.bins.age_bin(x.age_diff_ms);
        let b_last = self.bins.last_bin(x.last_move);
        ((b_imb * N_SPR + b_spr) * N_AGE + b_age) * N_LAST + b_last
    }

    /// Fold one labeled event into its cell.
    pub fn accumulate(&mut self, x: &TickState, y: f64, tau_ms: f64) {
        let k = self.cell_index(x);
        let cell = &mut self.cells[k];
        cell.n += 1;
        if y > 0.0 {
            cell.n_up += 1;
        } else if y < 0.0 {
            cell.n_down += 1;
        }
        cell.sum_tau_ms += tau_ms;
    }

    /// Smoothed up-probability; 0.5 for a cell with no signed moves.
    pub fn p_up(&self, k: usize) -> f64 {
        let c = &self.cells[k];
        let n_signed = (c.n_up + c.n_down) as f64;
        if n_signed <= 0.0 {
            return 0.5;
        }
        (c.n_up as f64 + self.alpha) / (n_signed + 2.0 * self.alpha)
    }

    pub fn p_down(&self, k: usize) -> f64 {
        1.0 - self.p_up(k)
    }

    /// Signed predictive edge `D(k) = 2 p_up(k) - 1`.
    pub fn direction_score(&self, k: usize) -> f64 {
        2.0 * self.p_up(k) - 1.0
    }

    /// Expected waiting time; NaN for an empty cell.
    pub fn mean_tau_ms(&self, k: usize) -> f64 {
        let c = &self.cells[k];
        if c.n == 0 {
            return f64::NAN;
        }
        c.sum_tau_ms / c.n as f64
    }

    /// Direction score looked up by state.
    pub fn direction_score_for(&self, x: &TickState) -> f64 {
        self.direction_score(self.cell_index(x))
    }

    /// Expected waiting time looked up by state.
    pub fn mean_tau_ms_for(&self, x: &TickState) -> f64 {
        self.mean_tau_ms(self.cell_index(x))
    }

    /// Mean waiting time over all cells, used as the empty-cell sentinel
    /// base when persisting.
    pub fn global_mean_tau_ms(&self) -> f64 {
        let (sum, n) = self
            .cells
            .iter()
            .fold((0.0f64, 0u64), |(s, n), c| (s + c.sum_tau_ms, n + c.n));
        if n > 0 {
            sum / n as f64
        } else {
            0.0
        }
    }

    /// Persist the model as JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P, meta: &ModelMeta) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let tau_fallback = 2.0 * self.global_mean_tau_ms();

        let cells = (0..N_CELLS)
            .map(|k| {
                // decode (b_imb, b_spr, b_age, b_last) from the linear index
                let mut tmp = k;
                let b_last = tmp % N_LAST;
                tmp /= N_LAST;
                let b_age = tmp % N_AGE;
                tmp /= N_AGE;
                let b_spr = tmp % N_SPR;
                let b_imb = tmp / N_SPR;

                let mean_tau = self.mean_tau_ms(k);
                let c = &self.cells[k];
                CellRecord {
                    idx: k,
                    b_imb,
                    b_spr,
                    b_age,
                    b_last,
                    n: c.n,
                    n_up: c.n_up,
                    n_down: c.n_down,
                    sum_tau_ms: c.sum_tau_ms,
                    p_up: self.p_up(k),
                    p_down: self.p_down(k),
                    d: self.direction_score(k),
                    mean_tau_ms: if mean_tau.is_finite() {
                        mean_tau
                    } else {
                        tau_fallback
                    },
                }
            })
            .collect();

        let file = ModelFile {
            symbol: meta.symbol.clone(),
            year_lo: meta.year_lo,
            year_hi: meta.year_hi,
            alpha: self.alpha,
            imbalance_bins: Some(self.bins.imbalance_bins.clone()),
            spread_bins: Some(self.bins.spread_bins.clone()),
            age_diff_ms_bins: Some(self.bins.age_diff_ms_bins.clone()),
            last_move_bins: Some(self.bins.last_move_bins.clone()),
            cells,
        };

        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Load a model from JSON.
    ///
    /// `alpha` defaults to 1.0 when absent. Bin arrays present in the file
    /// override the default spec; the cell array must hold exactly
    /// [`N_CELLS`] records.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<(Self, ModelMeta)> {
        let contents = fs::read_to_string(path.as_ref())?;
        let file: ModelFile = serde_json::from_str(&contents)?;

        if file.cells.len() != N_CELLS {
            return Err(PipelineError::Config(format!(
                "model {}: cells has {} entries, expected {N_CELLS}",
                path.as_ref().display(),
                file.cells.len()
            )));
        }

        // axes present in the file override the default spec
        let mut bins = BinSpec::default();
        if let Some(b) = file.imbalance_bins {
            bins.imbalance_bins = b;
        }
        if let Some(b) = file.spread_bins {
            bins.spread_bins = b;
        }
        if let Some(b) = file.age_diff_ms_bins {
            bins.age_diff_ms_bins = b;
        }
        if let Some(b) = file.last_move_bins {
            bins.last_move_bins = b;
        }
        bins.validate()?;

        let mut model = HistogramModel::new(file.alpha);
        model.bins = bins;
        for rec in &file.cells {
            if rec.idx >= N_CELLS {
                return Err(PipelineError::Config(format!(
                    "model cell idx {} out of range",
                    rec.idx
                )));
            }
            model.cells[rec.idx] = CellStats {
                n: rec.n,
                n_up: rec.n_up,
                n_down: rec.n_down,
                sum_tau_ms: rec.sum_tau_ms,
            };
        }

        Ok((
            model,
            ModelMeta {
                symbol: file.symbol,
                year_lo: file.year_lo,
                year_hi: file.year_hi,
            },
        ))
    }
}

/// One serialized cell with its derived values.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CellRecord {
    idx: usize,
    b_imb: usize,
    b_spr: usize,
    b_age: usize,
    b_last: usize,
    n: u64,
    n_up: u64,
    n_down: u64,
    sum_tau_ms: f64,
    p_up: f64,
    p_down: f64,
    #[serde(rename = "D")]
    d: f64,
    mean_tau_ms: f64,
}

fn default_alpha() -> f64 {
    1.0
}

/// On-disk layout of the model file. Field order is the serialized order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelFile {
    symbol: String,
    year_lo: i32,
    year_hi: i32,
    #[serde(default = "default_alpha")]
    alpha: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    imbalance_bins: Option<Vec<super::bins::ImbalanceBin>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spread_bins: Option<Vec<super::bins::SpreadBin>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    age_diff_ms_bins: Option<Vec<super::bins::AgeBin>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_move_bins: Option<Vec<super::bins::LastMoveBin>>,
    cells: Vec<CellRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(imbalance: f64, spread: f64, age_diff_ms: f64, last_move: f64) -> TickState {
        TickState {
            imbalance,
            spread,
            age_diff_ms,
            last_move,
        }
    }

    #[test]
    fn cell_index_layout() {
        let model = HistogramModel::new(1.0);
        // all-zero bins land in cell ((0*3+0)*5+0)*3+0 = 0
        assert_eq!(model.cell_index(&state(-1.0, 0.01, -300.0, -1.0)), 0);
        // last axis is fastest
        assert_eq!(model.cell_index(&state(-1.0, 0.01, -300.0, 0.0)), 1);
        // max bins land in the last cell
        assert_eq!(model.cell_index(&state(1.0, 0.50, 300.0, 1.0)), N_CELLS - 1);
    }

    #[test]
    fn accumulate_and_derive() {
        // n_up=3, n_down=1, sum_tau=40, alpha=1
        let mut model = HistogramModel::new(1.0);
        let x = state(0.0, 0.01, 0.0, 0.0);
        for _ in 0..3 {
            model.accumulate(&x, 1.0, 10.0);
        }
        model.accumulate(&x, -1.0, 10.0);

        let k = model.cell_index(&x);
        assert_eq!(model.cell(k).n, 4);
        assert_eq!(model.cell(k).n_up, 3);
        assert_eq!(model.cell(k).n_down, 1);
        assert!((model.p_up(k) - 4.0 / 6.0).abs() < 1e-12);
        assert!((model.direction_score(k) - 1.0 / 3.0).abs() < 1e-12);
        assert!((model.mean_tau_ms(k) - 10.0).abs() < 1e-12);
        assert!((model.p_up(k) + model.p_down(k) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn flat_moves_count_toward_n_only() {
        let mut model = HistogramModel::new(1.0);
        let x = state(0.0, 0.01, 0.0, 0.0);
        model.accumulate(&x, 0.0, 5.0);

        let k = model.cell_index(&x);
        assert_eq!(model.cell(k).n, 1);
        assert_eq!(model.cell(k).n_up + model.cell(k).n_down, 0);
        assert_eq!(model.p_up(k), 0.5); // no signed moves: symmetric prior
        assert!((model.mean_tau_ms(k) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn empty_cell_fallbacks() {
        let model = HistogramModel::new(1.0);
        assert_eq!(model.p_up(0), 0.5);
        assert_eq!(model.direction_score(0), 0.0);
        assert!(model.mean_tau_ms(0).is_nan());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY_histogram.json");

        let mut model = HistogramModel::new(0.5);
        model.accumulate(&state(0.2, 0.012, -30.0, 1.0), 1.0, 12.0);
        model.accumulate(&state(0.2, 0.012, -30.0, 1.0), -1.0, 8.0);
        model.accumulate(&state(-0.8, 0.03, 250.0, -1.0), 1.0, 100.0);

        let meta = ModelMeta {
            symbol: "SPY".into(),
            year_lo: 2018,
            year_hi: 2022,
        };
        model.save_json(&path, &meta).unwrap();

        let (loaded, loaded_meta) = HistogramModel::load_json(&path).unwrap();
        assert_eq!(loaded_meta, meta);
        assert_eq!(loaded.alpha, 0.5);
        assert_eq!(loaded.cells(), model.cells());
        assert_eq!(loaded.bins, model.bins);

        // persist -> load -> persist is identity
        let path2 = dir.path().join("again.json");
        loaded.save_json(&path2, &loaded_meta).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            fs::read_to_string(&path2).unwrap()
        );
    }

    #[test]
    fn persisted_empty_cells_use_tau_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let mut model = HistogramModel::new(1.0);
        model.accumulate(&state(0.0, 0.01, 0.0, 0.0), 1.0, 20.0);
        let meta = ModelMeta {
            symbol: "SPY".into(),
            year_lo: 2020,
            year_hi: 2020,
        };
        model.save_json(&path, &meta).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let cells = raw["cells"].as_array().unwrap();
        assert_eq!(cells.len(), N_CELLS);

        // global mean tau is 20 -> sentinel 40 on every empty cell
        let empty = cells.iter().find(|c| c["n"] == 0).unwrap();
        assert_eq!(empty["mean_tau_ms"], 40.0);
        // the populated cell keeps its true mean
        let filled = cells.iter().find(|c| c["n"] == 1).unwrap();
        assert_eq!(filled["mean_tau_ms"], 20.0);
    }

    #[test]
    fn load_rejects_wrong_cell_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(
            &path,
            r#"{"symbol":"SPY","year_lo":2020,"year_hi":2020,"alpha":1.0,"cells":[]}"#,
        )
        .unwrap();
        assert!(HistogramModel::load_json(&path).is_err());
    }

    #[test]
    fn load_defaults_alpha_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let model = HistogramModel::new(2.0);
        let meta = ModelMeta {
            symbol: "SPY".into(),
            year_lo: 2020,
            year_hi: 2020,
        };
        model.save_json(&path, &meta).unwrap();

        // strip the alpha key
        let mut raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        raw.as_object_mut().unwrap().remove("alpha");
        fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        let (loaded, _) = HistogramModel::load_json(&path).unwrap();
        assert_eq!(loaded.alpha, 1.0);
    }
}
