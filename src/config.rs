//! Pipeline configuration.
//!
//! This module provides the configuration for the quote-aggregation stage
//! and its winsorization pass, with serialization support so runs are
//! reproducible from a checked-in file.
//!
//! # Features
//!
//! - **Defaults**: regular-hours SPY setup matching the research runs
//! - **Serialization**: save/load as TOML or JSON
//! - **Validation**: reject inconsistent settings before any file is touched
//!
//! # Example
//!
//! ```ignore
//! use nbbo_pipeline::config::{GridMode, PipelineConfig, WinsorConfig};
//!
//! let config = PipelineConfig::default()
//!     .with_grid(GridMode::Clock)
//!     .with_winsor(WinsorConfig::default());
//! config.validate()?;
//! config.save_toml("configs/spy_clock.toml")?;
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Output grid policy for the aggregation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridMode {
    /// One tick per per-ms bucket that produced at least one accepted quote.
    Event,

    /// Event grid plus bounded forward-fill of intraday gaps.
    Clock,
}

/// Regular-trading-hours window, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RthWindow {
    pub start_hour: u32,
    pub start_minute: u32,
    pub end_hour: u32,
    pub end_minute: u32,
}

impl Default for RthWindow {
    fn default() -> Self {
        Self {
            start_hour: 9,
            start_minute: 30,
            end_hour: 16,
            end_minute: 0,
        }
    }
}

impl RthWindow {
    /// True when the wall-clock time `(h, m)` falls inside the window.
    ///
    /// The end bound is exclusive: with the default window, 15:59 is in
    /// session and 16:00 is not.
    #[inline]
    pub fn contains(&self, h: u32, m: u32) -> bool {
        let t = h * 60 + m;
        t >= self.start_hour * 60 + self.start_minute && t < self.end_hour * 60 + self.end_minute
    }

    fn validate(&self) -> Result<()> {
        if self.start_hour > 23
            || self.end_hour > 24
            || self.start_minute > 59
            || self.end_minute > 59
        {
            return Err(PipelineError::Config("RTH window fields out of range".into()));
        }
        let start = self.start_hour * 60 + self.start_minute;
        let end = self.end_hour * 60 + self.end_minute;
        if start >= end {
            return Err(PipelineError::Config(format!(
                "RTH window start {:02}:{:02} must precede end {:02}:{:02}",
                self.start_hour, self.start_minute, self.end_hour, self.end_minute
            )));
        }
        Ok(())
    }
}

/// What to do with log-returns beyond the tail cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WinsorMode {
    /// Replace out-of-range values with the cutoff.
    Clip,

    /// Exclude the whole row from output.
    Drop,
}

/// Tail-winsorization settings (stage B).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WinsorConfig {
    /// Policy applied once the cutoffs are known.
    pub mode: WinsorMode,

    /// Lower tail quantile.
    pub q_lo: f64,

    /// Upper tail quantile.
    pub q_hi: f64,

    /// Per-worker bounded heap capacity. Selection is exact when the
    /// captured tail covers the requested rank.
    pub heap_capacity: usize,
}

impl Default for WinsorConfig {
    fn default() -> Self {
        Self {
            mode: WinsorMode::Clip,
            q_lo: 1e-5,
            q_hi: 1.0 - 1e-5,
            heap_capacity: 200_000,
        }
    }
}

impl WinsorConfig {
    fn validate(&self) -> Result<()> {
        if !(self.q_lo > 0.0 && self.q_lo < 1.0) || !(self.q_hi > 0.0 && self.q_hi < 1.0) {
            return Err(PipelineError::Config(
                "winsor quantiles must lie strictly inside (0, 1)".into(),
            ));
        }
        if self.q_lo >= self.q_hi {
            return Err(PipelineError::Config("winsor q_lo must be < q_hi".into()));
        }
        if self.heap_capacity == 0 {
            return Err(PipelineError::Config("winsor heap_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for the NBBO aggregation stage and its downstream
/// partitioned write. Scalar fields come before the table-valued ones so
/// the TOML rendering stays flat at the top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Output grid policy.
    pub grid: GridMode,

    /// Largest intraday gap (ms) that the clock grid forward-fills.
    /// A gap of exactly this size fills; one ms more does not.
    pub max_ffill_gap_ms: i64,

    /// Symbol root used in shard and partition file names.
    pub symbol_root: String,

    /// Inclusive year filter on input shards; `None` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_lo: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_hi: Option<i32>,

    /// Worker thread count. `None` uses the rayon default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Emit a progress log line every N input rows.
    pub log_every_in: u64,

    /// Emit a progress log line every N output rows.
    pub log_every_out: u64,

    /// Venue allow-set (single-byte exchange tags).
    pub venues: Vec<char>,

    /// Regular trading hours filter.
    pub rth: RthWindow,

    /// Winsorization pass; `None` writes raw log-returns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winsor: Option<WinsorConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            grid: GridMode::Event,
            max_ffill_gap_ms: 250,
            symbol_root: "SPY".to_string(),
            year_lo: None,
            year_hi: None,
            workers: None,
            log_every_in: 5_000_000,
            log_every_out: 1_000_000,
            venues: vec!['P', 'T', 'Q', 'Z', 'Y', 'J', 'K'],
            rth: RthWindow::default(),
            winsor: None,
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output grid policy.
    pub fn with_grid(mut self, grid: GridMode) -> Self {
        self.grid = grid;
        self
    }

    /// Set the forward-fill gap cap (ms).
    pub fn with_max_ffill_gap_ms(mut self, cap: i64) -> Self {
        self.max_ffill_gap_ms = cap;
        self
    }

    /// Enable winsorization.
    pub fn with_winsor(mut self, winsor: WinsorConfig) -> Self {
        self.winsor = Some(winsor);
        self
    }

    /// Set the symbol root used in file names.
    pub fn with_symbol_root(mut self, symbol: impl Into<String>) -> Self {
        self.symbol_root = symbol.into();
        self
    }

    /// Restrict input shards to an inclusive year range.
    pub fn with_years(mut self, lo: i32, hi: i32) -> Self {
        self.year_lo = Some(lo);
        self.year_hi = Some(hi);
        self
    }

    /// Set the worker thread count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// True when the venue tag is in the allow-set.
    #[inline]
    pub fn venue_allowed(&self, venue: char) -> bool {
        self.venues.contains(&venue)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.rth.validate()?;

        if self.max_ffill_gap_ms < 0 {
            return Err(PipelineError::Config("max_ffill_gap_ms must be >= 0".into()));
        }
        if self.venues.is_empty() {
            return Err(PipelineError::Config("venue allow-set must not be empty".into()));
        }
        if self.symbol_root.is_empty() {
            return Err(PipelineError::Config("symbol_root must not be empty".into()));
        }
        if let (Some(lo), Some(hi)) = (self.year_lo, self.year_hi) {
            if lo > hi {
                return Err(PipelineError::Config(format!("year_lo {lo} > year_hi {hi}")));
            }
        }
        if self.workers == Some(0) {
            return Err(PipelineError::Config("workers must be > 0".into()));
        }
        if self.log_every_in == 0 || self.log_every_out == 0 {
            return Err(PipelineError::Config("log cadences must be > 0".into()));
        }
        if let Some(w) = &self.winsor {
            w.validate()?;
        }
        Ok(())
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("TOML serialize failed: {e}")))?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    /// Load configuration from a TOML file and validate it.
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json_string = serde_json::to_string_pretty(self)?;
        fs::write(path, json_string)?;
        Ok(())
    }

    /// Load configuration from a JSON file and validate it.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grid, GridMode::Event);
        assert_eq!(config.max_ffill_gap_ms, 250);
        assert_eq!(config.symbol_root, "SPY");
    }

    #[test]
    fn rth_window_is_half_open() {
        let rth = RthWindow::default();
        assert!(rth.contains(9, 30));
        assert!(rth.contains(15, 59));
        assert!(!rth.contains(16, 0));
        assert!(!rth.contains(9, 29));
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = PipelineConfig::default();
        config.max_ffill_gap_ms = -1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.venues.clear();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default().with_years(2023, 2018);
        assert!(config.validate().is_err());
        config.year_lo = Some(2018);
        assert!(config.validate().is_ok());

        let mut config = PipelineConfig::default();
        config.rth.start_hour = 16;
        config.rth.end_hour = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn winsor_quantile_validation() {
        let mut w = WinsorConfig::default();
        assert!(w.validate().is_ok());

        w.q_lo = 0.5;
        w.q_hi = 0.4;
        assert!(w.validate().is_err());

        w = WinsorConfig::default();
        w.q_lo = 0.0;
        assert!(w.validate().is_err());
    }

    #[test]
    fn save_load_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");

        let config = PipelineConfig::default()
            .with_grid(GridMode::Clock)
            .with_winsor(WinsorConfig {
                mode: WinsorMode::Drop,
                ..WinsorConfig::default()
            })
            .with_years(2018, 2023);

        config.save_toml(&path).unwrap();
        let loaded = PipelineConfig::load_toml(&path).unwrap();

        assert_eq!(loaded.grid, GridMode::Clock);
        assert_eq!(loaded.winsor.unwrap().mode, WinsorMode::Drop);
        assert_eq!(loaded.year_lo, Some(2018));
        assert_eq!(loaded.venues, config.venues);
    }

    #[test]
    fn save_load_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");

        let config = PipelineConfig::default().with_symbol_root("QQQ");
        config.save_json(&path).unwrap();

        let loaded = PipelineConfig::load_json(&path).unwrap();
        assert_eq!(loaded.symbol_root, "QQQ");
        assert_eq!(loaded.grid, GridMode::Event);
    }
}
