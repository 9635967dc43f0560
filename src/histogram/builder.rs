//! Histogram accumulation over per-year event tables.
//!
//! Streams every labeled event of the year range into the cell grid and
//! persists the finished model as JSON. Rows with a non-finite required
//! field are skipped and counted.

use std::path::{Path, PathBuf};

use crate::error::{Result, StageContext};
use crate::histogram::model::{HistogramModel, ModelMeta, TickState};
use crate::store::EventTableReader;

/// Counters from one accumulation run.
#[derive(Debug, Default, Clone, Copy)]
pub struct HistogramBuilderStats {
    pub events_seen: u64,
    pub events_accumulated: u64,
    pub rows_skipped_null: u64,
}

/// Accumulates labeled events into a [`HistogramModel`].
pub struct HistogramBuilder {
    model: HistogramModel,
    stats: HistogramBuilderStats,
}

impl HistogramBuilder {
    pub fn new(alpha: f64) -> Self {
        Self {
            model: HistogramModel::new(alpha),
            stats: HistogramBuilderStats::default(),
        }
    }

    pub fn stats(&self) -> HistogramBuilderStats {
        self.stats
    }

    pub fn model(&self) -> &HistogramModel {
        &self.model
    }

    pub fn into_model(self) -> HistogramModel {
        self.model
    }

    /// Stream one event table into the grid.
    pub fn accumulate_file(&mut self, path: &Path) -> Result<()> {
        let mut reader = EventTableReader::open(path)?;
        while let Some(e) = reader.next_event()? {
            self.stats.events_seen += 1;

            let required = [
                e.imbalance,
                e.spread,
                e.age_diff_ms,
                e.last_move,
                e.y,
                e.tau_ms,
            ];
            if required.iter().any(|v| !v.is_finite()) {
                self.stats.rows_skipped_null += 1;
                continue;
            }

            self.model.accumulate(
                &TickState {
                    imbalance: e.imbalance,
                    spread: e.spread,
                    age_diff_ms: e.age_diff_ms,
                    last_move: e.last_move,
                },
                e.y,
                e.tau_ms,
            );
            self.stats.events_accumulated += 1;
        }
        Ok(())
    }
}

const STAGE: &str = "build-histogram";

/// Event-table path for one year: `<root>/<symbol>_<year>_events.parquet`.
pub fn events_path(events_root: &Path, symbol: &str, year: i32) -> PathBuf {
    events_root.join(format!("{symbol}_{year}_events.parquet"))
}

/// Build the model over `[year_lo, year_hi]` and persist it.
pub fn build_histogram(
    events_root: &Path,
    symbol: &str,
    year_lo: i32,
    year_hi: i32,
    alpha: f64,
    out_path: &Path,
) -> Result<HistogramBuilderStats> {
    if year_hi < year_lo {
        return Err(crate::error::PipelineError::Config(format!(
            "year_hi {year_hi} < year_lo {year_lo}"
        )));
    }

    log::info!(
        "build_histogram: symbol={symbol} years={year_lo}:{year_hi} alpha={alpha} -> {}",
        out_path.display()
    );

    let mut builder = HistogramBuilder::new(alpha);
    for year in year_lo..=year_hi {
        let path = events_path(events_root, symbol, year);
        log::info!("[year {year}] reading {}", path.display());
        builder
            .accumulate_file(&path)
            .stage(STAGE, path.display().to_string())?;
    }

    let stats = builder.stats();
    let model = builder.into_model();
    model.save_json(
        out_path,
        &ModelMeta {
            symbol: symbol.to_string(),
            year_lo,
            year_hi,
        },
    )?;

    log::info!(
        "build_histogram done: seen={} accumulated={} skipped_null={}",
        stats.events_seen,
        stats.events_accumulated,
        stats.rows_skipped_null
    );
    Ok(stats)
}
