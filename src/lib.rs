//! NBBO Research Pipeline
//!
//! Transforms raw exchange Level-1 quote files for a single symbol into a
//! cleaned per-millisecond NBBO series, a labeled dataset of mid-change
//! events, a discretized 4-D predictive model, and a backtest of a
//! state-conditioned single-step strategy.
//!
//! # Architecture
//!
//! ```text
//! raw .csv.gz ──► aggregator ──► per-ms ticks (event / clock grid)
//!                                   │
//!                                   ├──► winsor (tail cutoffs) ──► per-year parquet
//!                                   │
//!                per-year ticks ──► denoise ──► cleaned ticks
//!                                                  │
//!                                   events ◄───────┘
//!                                     │
//!                histogram ◄── labeled events (all years)
//!                                     │
//!                backtest ◄── events + model ──► trades + daily PnL
//! ```
//!
//! Module map:
//!
//! | module       | stage | role |
//! |--------------|-------|------|
//! | `quotes`     | A     | raw record parsing, gz line reading |
//! | `aggregator` | A     | per-ms NBBO reduction, bounded forward-fill |
//! | `glitch`     | A     | recoverable-data counters and report |
//! | `pipeline`   | A     | shard orchestration, caches, partitioned write |
//! | `winsor`     | B     | parallel extreme-tail quantile sketch |
//! | `denoise`    | C     | per-day spike removal |
//! | `events`     | D     | mid-change event construction and labeling |
//! | `histogram`  | E     | 4-D cell grid, model persistence |
//! | `backtest`   | F     | strategy config, decision pipeline, PnL |
//! | `store`      | all   | binary shard cache, parquet tick/event tables |
//!
//! # Example
//!
//! ```ignore
//! use nbbo_pipeline::config::{GridMode, PipelineConfig, WinsorConfig};
//! use nbbo_pipeline::pipeline::{RunPaths, TickPipeline};
//!
//! let config = PipelineConfig::default()
//!     .with_grid(GridMode::Clock)
//!     .with_winsor(WinsorConfig::default())
//!     .with_years(2018, 2023);
//!
//! let pipeline = TickPipeline::new(config)?;
//! let summary = pipeline.run(&RunPaths {
//!     in_dir: "data/raw".into(),
//!     cache_dir: "data/cache".into(),
//!     out_root: "data/out".into(),
//!     report_path: Some("data/out/glitches.txt".into()),
//! })?;
//! println!("{} partitions", summary.partitions.len());
//! ```

pub mod aggregator;
pub mod backtest;
pub mod config;
pub mod denoise;
pub mod error;
pub mod events;
pub mod glitch;
pub mod histogram;
pub mod pipeline;
pub mod quotes;
pub mod store;
pub mod time;
pub mod timing;
pub mod winsor;

// Re-exports - Core types
pub use aggregator::{ForwardFill, NbboBucket, Tick, TickAggregator};
pub use error::{PipelineError, Result};
pub use events::{EventBuilder, EventBuilderConfig, LabeledEvent};

// Re-exports - Configuration
pub use config::{GridMode, PipelineConfig, RthWindow, WinsorConfig, WinsorMode};

// Re-exports - Stages
pub use backtest::{Backtester, EdgeMode, PnlAggregator, StrategyConfig, TradeRecord};
pub use denoise::{denoise_file, DenoiseConfig, DenoiseReport, SpikeDenoiser};
pub use histogram::{build_histogram, BinSpec, HistogramBuilder, HistogramModel, TickState};
pub use pipeline::{RunPaths, RunSummary, TickPipeline};
pub use winsor::{compute_tail_cutoffs, TailCutoffs, TailSketch};
