//! Strategy configuration.
//!
//! Loaded from a flat JSON object with all-optional keys. The edge-mode
//! selector is a closed three-variant tag; the `legacy_mode` alias is
//! honored for backwards compatibility and wins over `edge_mode` when
//! present and non-zero.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{PipelineError, Result};

/// Cost/edge-gate policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeMode {
    /// No costs; trade iff the expected edge is positive.
    Legacy,

    /// Full cost model, no expected-edge gate.
    CostTradeAll,

    /// Full cost model; when `min_expected_edge_bps > 0`, require
    /// `|EE|` to clear fees, slippage and the margin. Default.
    CostWithGate,
}

impl EdgeMode {
    fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(EdgeMode::Legacy),
            1 => Ok(EdgeMode::CostTradeAll),
            2 => Ok(EdgeMode::CostWithGate),
            other => Err(PipelineError::Config(format!(
                "edge_mode {other} is not one of 0 (legacy), 1 (cost/trade-all), 2 (cost with gate)"
            ))),
        }
    }
}

/// High-level strategy knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyConfig {
    /// Per-leg fee in price units; a roundtrip charges twice this.
    pub fee_price: f64,

    /// Slippage cushion in price units, charged once per roundtrip.
    pub slip_price: f64,

    /// Minimum `|D(k)|` to consider a trade; 0 disables the gate.
    pub min_abs_direction_score: f64,

    /// Expected-edge margin in basis points; 0 disables the gate.
    pub min_expected_edge_bps: f64,

    /// Skip states whose expected waiting time exceeds this; 0 disables.
    pub max_mean_wait_ms: f64,

    /// Cost/edge policy.
    pub edge_mode: EdgeMode,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fee_price: 0.03,
            slip_price: 0.02,
            min_abs_direction_score: 0.0,
            min_expected_edge_bps: 0.0,
            max_mean_wait_ms: 0.0,
            edge_mode: EdgeMode::CostWithGate,
        }
    }
}

/// Raw file shape: every key optional, numeric edge-mode codes.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawStrategyFile {
    fee_price: f64,
    slip_price: f64,
    min_abs_direction_score: f64,
    min_expected_edge_bps: f64,
    max_mean_wait_ms: f64,
    edge_mode: f64,
    legacy_mode: f64,
}

impl Default for RawStrategyFile {
    fn default() -> Self {
        let d = StrategyConfig::default();
        Self {
            fee_price: d.fee_price,
            slip_price: d.slip_price,
            min_abs_direction_score: d.min_abs_direction_score,
            min_expected_edge_bps: d.min_expected_edge_bps,
            max_mean_wait_ms: d.max_mean_wait_ms,
            edge_mode: 2.0,
            legacy_mode: 0.0,
        }
    }
}

impl StrategyConfig {
    /// Load from a flat JSON file. Missing keys take their defaults;
    /// a non-zero `legacy_mode` forces `edge_mode = Legacy`.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let raw: RawStrategyFile = serde_json::from_str(&contents)?;

        let edge_mode = if raw.legacy_mode != 0.0 {
            EdgeMode::Legacy
        } else {
            EdgeMode::from_code(raw.edge_mode as i64)?
        };

        Ok(Self {
            fee_price: raw.fee_price,
            slip_price: raw.slip_price,
            min_abs_direction_score: raw.min_abs_direction_score,
            min_expected_edge_bps: raw.min_expected_edge_bps,
            max_mean_wait_ms: raw.max_mean_wait_ms,
            edge_mode,
        })
    }
}
