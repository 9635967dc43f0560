//! State-conditioned single-step backtesting.
//!
//! Streams labeled events in timestamp order, pairs each event with the
//! next one on the same day, gates entries on the histogram signal and a
//! configurable cost model, and rolls realized one-step returns into
//! per-day PnL rows.

pub mod engine;
pub mod pnl;
pub mod strategy;
pub mod summary;

pub use engine::Backtester;
pub use pnl::{DailyPnlRow, PnlAggregator, TradeRecord};
pub use strategy::{EdgeMode, StrategyConfig};
pub use summary::{render_summary_table, summarize_year, YearTradeStats};
