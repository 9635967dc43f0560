//! Trade records, daily PnL rows, and the per-year aggregator.
//!
//! The aggregator keeps one open day. A trade on a new day flushes the
//! open day into a [`DailyPnlRow`]; `finalize_year` flushes the last day
//! and writes the two CSV tables. Daily rows are strictly increasing in
//! day and `cumulative_net_ret` is the running sum of per-trade net
//! returns since the start of the year; a day-order regression in the
//! trade stream is a fatal invariant violation, not data.

use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::error::{PipelineError, Result};

/// One executed single-step trade. Created on entry, never mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeRecord {
    pub ts_in: u64,
    pub ts_out: u64,

    /// Trading day `YYYYMMDD`.
    pub day: u32,

    pub mid_in: f64,
    pub mid_out: f64,
    pub spread_in: f64,

    /// Histogram signal `D(k)` at entry.
    pub direction_score: f64,

    /// Signed expected one-step return per unit notional.
    pub expected_edge_ret: f64,

    /// Roundtrip cost in return space.
    pub cost_ret: f64,

    /// Realized one-step return in the trade direction.
    pub gross_ret: f64,

    /// `gross_ret - cost_ret`.
    pub net_ret: f64,

    /// +1 long, -1 short.
    pub side: i32,
}

/// One closed trading day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyPnlRow {
    pub day: u32,
    pub num_trades: u64,
    pub gross_ret_sum: f64,
    pub net_ret_sum: f64,
    pub gross_ret_mean: f64,
    pub net_ret_mean: f64,
    pub cumulative_net_ret: f64,
}

/// Aggregates trades into daily rows and writes the per-year CSV tables.
pub struct PnlAggregator {
    trades_out_dir: PathBuf,
    daily_out_dir: PathBuf,
    symbol: String,

    year: u32,
    trades: Vec<TradeRecord>,
    daily_rows: Vec<DailyPnlRow>,

    current_day: u32,
    day_trade_count: u64,
    day_gross_sum: f64,
    day_net_sum: f64,
    cumulative_net: f64,
}

impl PnlAggregator {
    pub fn new(
        trades_out_dir: impl Into<PathBuf>,
        daily_out_dir: impl Into<PathBuf>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            trades_out_dir: trades_out_dir.into(),
            daily_out_dir: daily_out_dir.into(),
            symbol: symbol.into(),
            year: 0,
            trades: Vec::new(),
            daily_rows: Vec::new(),
            current_day: 0,
            day_trade_count: 0,
            day_gross_sum: 0.0,
            day_net_sum: 0.0,
            cumulative_net: 0.0,
        }
    }

    /// Reset all per-year state.
    pub fn start_year(&mut self, year: u32) {
        self.year = year;
        self.trades.clear();
        self.daily_rows.clear();
        self.current_day = 0;
        self.day_trade_count = 0;
        self.day_gross_sum = 0.0;
        self.day_net_sum = 0.0;
        self.cumulative_net = 0.0;
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn daily_rows(&self) -> &[DailyPnlRow] {
        &self.daily_rows
    }

    pub fn cumulative_net(&self) -> f64 {
        self.cumulative_net
    }

    /// Consume one trade, rolling days as the stream advances.
    pub fn on_trade(&mut self, trade: &TradeRecord) -> Result<()> {
        if trade.day == 0 {
            // trades without a calendar day are never counted
            return Ok(());
        }

        if self.current_day == 0 {
            self.current_day = trade.day;
        } else if trade.day != self.current_day {
            if trade.day < self.current_day {
                return Err(PipelineError::Invariant(format!(
                    "trade day {} regressed behind open day {}",
                    trade.day, self.current_day
                )));
            }
            self.flush_current_day();
            self.current_day = trade.day;
        }

        self.trades.push(*trade);
        self.day_trade_count += 1;
        self.day_gross_sum += trade.gross_ret;
        self.day_net_sum += trade.net_ret;
        self.cumulative_net += trade.net_ret;
        Ok(())
    }

    fn flush_current_day(&mut self) {
        if self.current_day == 0 || self.day_trade_count == 0 {
            return;
        }

        self.daily_rows.push(DailyPnlRow {
            day: self.current_day,
            num_trades: self.day_trade_count,
            gross_ret_sum: self.day_gross_sum,
            net_ret_sum: self.day_net_sum,
            gross_ret_mean: self.day_gross_sum / self.day_trade_count as f64,
            net_ret_mean: self.day_net_sum / self.day_trade_count as f64,
            cumulative_net_ret: self.cumulative_net,
        });

        self.day_trade_count = 0;
        self.day_gross_sum = 0.0;
        self.day_net_sum = 0.0;
    }

    /// Flush the last open day and write both CSV tables.
    pub fn finalize_year(&mut self) -> Result<()> {
        self.flush_current_day();
        if self.year == 0 {
            return Ok(());
        }
        self.write_trades_csv()?;
        self.write_daily_csv()?;
        Ok(())
    }

    /// Path of the per-year trades table.
    pub fn trades_path(&self, year: u32) -> PathBuf {
        self.trades_out_dir
            .join(format!("{}_{year}_trades.csv", self.symbol))
    }

    /// Path of the per-year daily table.
    pub fn daily_path(&self, year: u32) -> PathBuf {
        self.daily_out_dir
            .join(format!("{}_{year}_daily.csv", self.symbol))
    }

    fn write_trades_csv(&self) -> Result<()> {
        fs::create_dir_all(&self.trades_out_dir)?;
        let path = self.trades_path(self.year);
        let mut out = BufWriter::new(File::create(&path)?);

        writeln!(
            out,
            "ts_in,ts_out,day,mid_in,mid_out,spread_in,\
             direction_score,expected_edge_ret,cost_ret,gross_ret,net_ret,side"
        )?;
        for t in &self.trades {
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{},{}",
                t.ts_in,
                t.ts_out,
                t.day,
                t.mid_in,
                t.mid_out,
                t.spread_in,
                t.direction_score,
                t.expected_edge_ret,
                t.cost_ret,
                t.gross_ret,
                t.net_ret,
                t.side
            )?;
        }
        out.flush()?;
        log::info!("wrote {} trades -> {}", self.trades.len(), path.display());
        Ok(())
    }

    fn write_daily_csv(&self) -> Result<()> {
        fs::create_dir_all(&self.daily_out_dir)?;
        let path = self.daily_path(self.year);
        let mut out = BufWriter::new(File::create(&path)?);

        writeln!(
            out,
            "day,num_trades,gross_ret_sum,net_ret_sum,\
             gross_ret_mean,net_ret_mean,cumulative_net_ret"
        )?;
        for row in &self.daily_rows {
            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                row.day,
                row.num_trades,
                row.gross_ret_sum,
                row.net_ret_sum,
                row.gross_ret_mean,
                row.net_ret_mean,
                row.cumulative_net_ret
            )?;
        }
        out.flush()?;
        log::info!(
            "wrote {} daily rows -> {}",
            self.daily_rows.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn trade(day: u32, net: f64) -> TradeRecord {
        TradeRecord {
            ts_in: day as u64 * 1_000_000_000 + 93_000_000,
            ts_out: day as u64 * 1_000_000_000 + 93_000_007,
            day,
            mid_in: 100.0,
            mid_out: 100.0 + net * 100.0,
            spread_in: 0.01,
            direction_score: 0.4,
            expected_edge_ret: 4e-5,
            cost_ret: 0.0,
            gross_ret: net,
            net_ret: net,
            side: 1,
        }
    }

    fn agg(dir: &Path) -> PnlAggregator {
        PnlAggregator::new(dir.join("trades"), dir.join("pnl"), "SPY")
    }

    #[test]
    fn day_rollover_and_cumulative_net() {
        let dir = tempfile::tempdir().unwrap();
        let mut pnl = agg(dir.path());
        pnl.start_year(2020);

        pnl.on_trade(&trade(20200102, 1e-4)).unwrap();
        pnl.on_trade(&trade(20200102, -2e-4)).unwrap();
        pnl.on_trade(&trade(20200103, 3e-4)).unwrap();
        pnl.finalize_year().unwrap();

        let rows = pnl.daily_rows();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].day, 20200102);
        assert_eq!(rows[0].num_trades, 2);
        assert!((rows[0].net_ret_sum - (-1e-4)).abs() < 1e-15);
        assert!((rows[0].net_ret_mean - (-5e-5)).abs() < 1e-15);
        assert!((rows[0].cumulative_net_ret - (-1e-4)).abs() < 1e-15);

        assert_eq!(rows[1].day, 20200103);
        assert!((rows[1].cumulative_net_ret - 2e-4).abs() < 1e-15);

        // strictly increasing days
        assert!(rows[0].day < rows[1].day);
    }

    #[test]
    fn day_zero_trades_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut pnl = agg(dir.path());
        pnl.start_year(2020);

        pnl.on_trade(&trade(0, 1.0)).unwrap();
        pnl.finalize_year().unwrap();
        assert!(pnl.trades().is_empty());
        assert!(pnl.daily_rows().is_empty());
    }

    #[test]
    fn day_regression_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut pnl = agg(dir.path());
        pnl.start_year(2020);

        pnl.on_trade(&trade(20200103, 1e-4)).unwrap();
        let err = pnl.on_trade(&trade(20200102, 1e-4)).unwrap_err();
        assert!(matches!(err, PipelineError::Invariant(_)));
    }

    #[test]
    fn csv_outputs_have_expected_headers() {
        let dir = tempfile::tempdir().unwrap();
        let mut pnl = agg(dir.path());
        pnl.start_year(2020);
        pnl.on_trade(&trade(20200102, 1e-4)).unwrap();
        pnl.finalize_year().unwrap();

        let trades_text = fs::read_to_string(pnl.trades_path(2020)).unwrap();
        assert!(trades_text.starts_with(
            "ts_in,ts_out,day,mid_in,mid_out,spread_in,direction_score,\
             expected_edge_ret,cost_ret,gross_ret,net_ret,side\n"
        ));
        assert_eq!(trades_text.lines().count(), 2);

        let daily_text = fs::read_to_string(pnl.daily_path(2020)).unwrap();
        assert!(daily_text.starts_with(
            "day,num_trades,gross_ret_sum,net_ret_sum,gross_ret_mean,\
             net_ret_mean,cumulative_net_ret\n"
        ));
        assert!(daily_text.contains("20200102,1,"));
    }

    #[test]
    fn start_year_resets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut pnl = agg(dir.path());
        pnl.start_year(2020);
        pnl.on_trade(&trade(20200102, 1e-4)).unwrap();

        pnl.start_year(2021);
        assert!(pnl.trades().is_empty());
        assert!(pnl.daily_rows().is_empty());
        assert_eq!(pnl.cumulative_net(), 0.0);
    }
}
