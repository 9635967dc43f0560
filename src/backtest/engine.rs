//! The backtest engine: per-event decision pipeline and year runner.
//!
//! Events are paired with one-event lookahead: the current event is a
//! potential entry, the next same-day event supplies the exit mid and
//! timestamp. The decision pipeline, in order: validity guards, signal
//! magnitude gate, expected edge, cost model per edge mode, mean-wait
//! gate, then realization.

use std::path::Path;

use crate::backtest::pnl::{PnlAggregator, TradeRecord};
use crate::backtest::strategy::{EdgeMode, StrategyConfig};
use crate::error::{Result, StageContext};
use crate::events::LabeledEvent;
use crate::histogram::{HistogramModel, TickState};
use crate::store::EventTableReader;

const STAGE: &str = "backtest";

/// Backtests one year of labeled events against a trained model.
pub struct Backtester {
    model: HistogramModel,
    config: StrategyConfig,
    pnl: PnlAggregator,
}

impl Backtester {
    pub fn new(model: HistogramModel, config: StrategyConfig, pnl: PnlAggregator) -> Self {
        Self { model, config, pnl }
    }

    pub fn pnl(&self) -> &PnlAggregator {
        &self.pnl
    }

    /// Run one calendar year from its event table, writing the trades and
    /// daily CSVs on completion.
    pub fn run_for_year(&mut self, year: u32, events_path: &Path) -> Result<()> {
        let events = EventTableReader::read_all(events_path)
            .stage(STAGE, events_path.display().to_string())?;
        log::info!("backtest year {year}: {} events", events.len());

        self.pnl.start_year(year);
        for pair in events.windows(2) {
            let (ev, next) = (&pair[0], &pair[1]);
            // a day-boundary pair has no same-day exit
            if next.day != ev.day {
                continue;
            }
            if let Some(trade) = decide(&self.model, &self.config, ev, next) {
                self.pnl.on_trade(&trade)?;
            }
        }
        // the final event of the year has no exit and cannot enter
        self.pnl.finalize_year()?;

        log::info!(
            "backtest year {year}: trades={} days={} cumulative_net={}",
            self.pnl.trades().len(),
            self.pnl.daily_rows().len(),
            self.pnl.cumulative_net()
        );
        Ok(())
    }
}

/// The per-event decision pipeline. Returns the trade to take, if any.
pub fn decide(
    model: &HistogramModel,
    config: &StrategyConfig,
    ev: &LabeledEvent,
    next: &LabeledEvent,
) -> Option<TradeRecord> {
    if ev.mid <= 0.0 || ev.spread <= 0.0 {
        return None;
    }

    let state = TickState {
        imbalance: ev.imbalance,
        spread: ev.spread,
        age_diff_ms: ev.age_diff_ms,
        last_move: ev.last_move,
    };
    let direction_score = model.direction_score_for(&state);

    if config.min_abs_direction_score > 0.0
        && direction_score.abs() < config.min_abs_direction_score
    {
        return None;
    }

    // one-tick move approximation
    let delta_m = 0.5 * ev.spread;
    let expected_edge_ret = direction_score * delta_m / ev.mid;

    let full_cost = ev.spread / ev.mid
        + 2.0 * config.fee_price / ev.mid
        + config.slip_price / ev.mid;

    let cost_ret = match config.edge_mode {
        EdgeMode::Legacy => {
            if expected_edge_ret <= 0.0 {
                return None;
            }
            0.0
        }
        EdgeMode::CostTradeAll => full_cost,
        EdgeMode::CostWithGate => {
            if config.min_expected_edge_bps > 0.0 {
                let gate = (2.0 * config.fee_price + config.slip_price) / ev.mid
                    + config.min_expected_edge_bps * 1e-4;
                if expected_edge_ret.abs() <= gate {
                    return None;
                }
            }
            full_cost
        }
    };

    if config.max_mean_wait_ms > 0.0 {
        let mean_tau = model.mean_tau_ms_for(&state);
        if mean_tau > config.max_mean_wait_ms {
            return None;
        }
    }

    let side = if direction_score > 0.0 { 1 } else { -1 };
    let gross_ret = side as f64 * (next.mid - ev.mid) / ev.mid;
    let net_ret = gross_ret - cost_ret;

    Some(TradeRecord {
        ts_in: ev.ts,
        ts_out: next.ts,
        day: ev.day,
        mid_in: ev.mid,
        mid_out: next.mid,
        spread_in: ev.spread,
        direction_score,
        expected_edge_ret,
        cost_ret,
        gross_ret,
        net_ret,
        side,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::make_ts;

    /// Model whose single relevant cell has the requested up-bias.
    fn biased_model(state: &TickState, n_up: u64, n_down: u64, tau_each: f64) -> HistogramModel {
        let mut model = HistogramModel::new(1.0);
        for _ in 0..n_up {
            model.accumulate(state, 1.0, tau_each);
        }
        for _ in 0..n_down {
            model.accumulate(state, -1.0, tau_each);
        }
        model
    }

    fn base_state() -> TickState {
        TickState {
            imbalance: 0.0,
            spread: 0.02,
            age_diff_ms: 0.0,
            last_move: 0.0,
        }
    }

    fn base_event(ts: u64, mid: f64) -> LabeledEvent {
        LabeledEvent {
            ts,
            day: 20200102,
            mid,
            mid_next: 0.0,
            spread: 0.02,
            imbalance: 0.0,
            age_diff_ms: 0.0,
            last_move: 0.0,
            y: 1.0,
            tau_ms: 7.0,
        }
    }

    /// Spec scenario S6: D = +0.4, mid = 100, spread = 0.02, exit at 100.01.
    fn s6_setup() -> (HistogramModel, LabeledEvent, LabeledEvent) {
        // p_up = (6+1)/(8+2) = 0.7 -> D = 0.4
        let model = biased_model(&base_state(), 6, 2, 10.0);
        let ev = base_event(make_ts(20200102, 9, 30, 0, 0), 100.0);
        let next = base_event(make_ts(20200102, 9, 30, 0, 7), 100.01);
        (model, ev, next)
    }

    #[test]
    fn legacy_trades_on_positive_edge() {
        let (model, ev, next) = s6_setup();
        let config = StrategyConfig {
            edge_mode: EdgeMode::Legacy,
            ..StrategyConfig::default()
        };

        let trade = decide(&model, &config, &ev, &next).expect("legacy takes the trade");
        assert!((trade.direction_score - 0.4).abs() < 1e-12);
        assert!((trade.expected_edge_ret - 4e-5).abs() < 1e-12);
        assert_eq!(trade.cost_ret, 0.0);
        assert!((trade.gross_ret - 1e-4).abs() < 1e-12);
        assert_eq!(trade.net_ret, trade.gross_ret);
        assert_eq!(trade.side, 1);
    }

    #[test]
    fn cost_with_gate_skips_thin_edge() {
        let (model, ev, next) = s6_setup();
        let config = StrategyConfig {
            edge_mode: EdgeMode::CostWithGate,
            min_expected_edge_bps: 1.0,
            ..StrategyConfig::default()
        };
        // |EE| = 4e-5 < (2*0.03 + 0.02)/100 + 1e-4 = 9e-4
        assert!(decide(&model, &config, &ev, &next).is_none());
    }

    #[test]
    fn cost_with_gate_disabled_trades_all_with_costs() {
        let (model, ev, next) = s6_setup();
        let config = StrategyConfig {
            edge_mode: EdgeMode::CostWithGate,
            min_expected_edge_bps: 0.0,
            ..StrategyConfig::default()
        };

        let trade = decide(&model, &config, &ev, &next).expect("gate disabled trades all");
        // cost = spread/mid + 2 fee/mid + slip/mid = 2e-4 + 6e-4 + 2e-4 = 1e-3
        assert!((trade.cost_ret - 1e-3).abs() < 1e-12);
        assert!((trade.net_ret - (1e-4 - 1e-3)).abs() < 1e-12);
    }

    #[test]
    fn cost_trade_all_never_gates_on_edge() {
        let (model, ev, next) = s6_setup();
        let config = StrategyConfig {
            edge_mode: EdgeMode::CostTradeAll,
            min_expected_edge_bps: 5.0, // ignored in this mode
            ..StrategyConfig::default()
        };
        assert!(decide(&model, &config, &ev, &next).is_some());
    }

    #[test]
    fn magnitude_gate_zero_disables() {
        let (model, ev, next) = s6_setup();

        let mut config = StrategyConfig {
            edge_mode: EdgeMode::CostTradeAll,
            min_abs_direction_score: 0.5, // above |D| = 0.4
            ..StrategyConfig::default()
        };
        assert!(decide(&model, &config, &ev, &next).is_none());

        config.min_abs_direction_score = 0.0;
        assert!(decide(&model, &config, &ev, &next).is_some());
    }

    #[test]
    fn wait_gate_skips_slow_states() {
        let state = base_state();
        let (_, ev, next) = s6_setup();
        let model = biased_model(&state, 6, 2, 900.0); // mean tau 900 ms

        let config = StrategyConfig {
            edge_mode: EdgeMode::CostTradeAll,
            max_mean_wait_ms: 500.0,
            ..StrategyConfig::default()
        };
        assert!(decide(&model, &config, &ev, &next).is_none());

        let fast = biased_model(&state, 6, 2, 100.0);
        assert!(decide(&fast, &config, &ev, &next).is_some());
    }

    #[test]
    fn down_bias_goes_short() {
        let model = biased_model(&base_state(), 2, 6, 10.0); // D = -0.4
        let ev = base_event(make_ts(20200102, 9, 30, 0, 0), 100.0);
        let next = base_event(make_ts(20200102, 9, 30, 0, 7), 99.99);

        let config = StrategyConfig {
            edge_mode: EdgeMode::CostTradeAll,
            ..StrategyConfig::default()
        };
        let trade = decide(&model, &config, &ev, &next).unwrap();
        assert_eq!(trade.side, -1);
        // short profits from the down move
        assert!((trade.gross_ret - 1e-4).abs() < 1e-10);
    }

    #[test]
    fn validity_guards_reject_degenerate_events() {
        let (model, mut ev, next) = s6_setup();
        let config = StrategyConfig::default();

        ev.spread = 0.0;
        assert!(decide(&model, &config, &ev, &next).is_none());
        ev.spread = 0.02;
        ev.mid = 0.0;
        assert!(decide(&model, &config, &ev, &next).is_none());
    }

    #[test]
    fn full_year_run_writes_tables() {
        use crate::store::EventTableWriter;

        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("SPY_2020_events.parquet");

        let mut w = EventTableWriter::create(&events_path).unwrap();
        // three same-day events -> two candidate pairs
        for (ms, mid) in [(0, 100.0), (7, 100.01), (20, 100.02)] {
            w.append(&base_event(make_ts(20200102, 9, 30, 0, ms), mid))
                .unwrap();
        }
        // a next-day singleton: pairs across the boundary are skipped
        let mut other_day = base_event(make_ts(20200103, 9, 30, 0, 0), 100.0);
        other_day.day = 20200103;
        w.append(&other_day).unwrap();
        w.finish().unwrap();

        let model = biased_model(&base_state(), 6, 2, 10.0);
        let pnl = PnlAggregator::new(dir.path().join("trades"), dir.path().join("pnl"), "SPY");
        let config = StrategyConfig {
            edge_mode: EdgeMode::Legacy,
            ..StrategyConfig::default()
        };

        let mut bt = Backtester::new(model, config, pnl);
        bt.run_for_year(2020, &events_path).unwrap();

        assert_eq!(bt.pnl().trades().len(), 2);
        assert_eq!(bt.pnl().daily_rows().len(), 1);
        assert!(bt.pnl().trades_path(2020).exists());
        assert!(bt.pnl().daily_path(2020).exists());
    }
}
