//! 4-D discretized predictive model over microstructure features.
//!
//! Events are bucketed on `(imbalance, spread, age_diff_ms, last_move)`
//! into a 6 x 3 x 5 x 3 grid (270 cells). Each cell accumulates move
//! counts and waiting times; the model exposes Laplace-smoothed direction
//! probabilities and expected waiting times per cell.

pub mod bins;
pub mod builder;
pub mod model;

pub use bins::{BinSpec, N_AGE, N_CELLS, N_IMB, N_LAST, N_SPR};
pub use builder::{build_histogram, HistogramBuilder, HistogramBuilderStats};
pub use model::{CellStats, HistogramModel, ModelMeta, TickState};
