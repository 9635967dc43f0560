//! Per-year trade summaries over the written trades tables.
//!
//! Reads `<symbol>_<year>_trades.csv` files back and aggregates net-return
//! statistics: totals, win/loss split, average and extreme trades. The
//! output is an aligned text table, one row per year.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::Result;

/// Zero-based CSV column of `net_ret` in the trades table.
const NET_RET_FIELD: usize = 10;

/// Net-return aggregates for one year of trades.
#[derive(Debug, Default, Clone, Copy)]
pub struct YearTradeStats {
    pub total_net_ret: f64,
    pub num_trades: u64,
    pub num_wins: u64,
    pub num_losses: u64,
    pub num_flat: u64,
    pub sum_win_net: f64,
    pub sum_loss_net: f64,
    pub max_gain: f64,
    pub max_loss: f64,
}

impl YearTradeStats {
    fn observe(&mut self, net_ret: f64) {
        self.num_trades += 1;
        self.total_net_ret += net_ret;

        if net_ret > 0.0 {
            self.num_wins += 1;
            self.sum_win_net += net_ret;
            self.max_gain = self.max_gain.max(net_ret);
        } else if net_ret < 0.0 {
            self.num_losses += 1;
            self.sum_loss_net += net_ret;
            self.max_loss = self.max_loss.min(net_ret);
        } else {
            self.num_flat += 1;
        }
    }

    pub fn win_pct(&self) -> f64 {
        if self.num_trades == 0 {
            0.0
        } else {
            100.0 * self.num_wins as f64 / self.num_trades as f64
        }
    }

    pub fn loss_pct(&self) -> f64 {
        if self.num_trades == 0 {
            0.0
        } else {
            100.0 * self.num_losses as f64 / self.num_trades as f64
        }
    }

    pub fn avg_win(&self) -> f64 {
        if self.num_wins == 0 {
            0.0
        } else {
            self.sum_win_net / self.num_wins as f64
        }
    }

    pub fn avg_loss(&self) -> f64 {
        if self.num_losses == 0 {
            0.0
        } else {
            self.sum_loss_net / self.num_losses as f64
        }
    }
}

/// Pull `net_ret` out of one trades-CSV line; `None` for malformed lines.
fn extract_net_ret(line: &str) -> Option<f64> {
    line.split(',').nth(NET_RET_FIELD)?.parse().ok()
}

/// Summarize one year's trades table.
///
/// Malformed data lines are skipped; a missing file is an error.
pub fn summarize_year(trades_dir: &Path, symbol: &str, year: i32) -> Result<YearTradeStats> {
    let path = trades_dir.join(format!("{symbol}_{year}_trades.csv"));
    let reader = BufReader::new(File::open(&path)?);

    let mut stats = YearTradeStats::default();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if i == 0 || line.is_empty() {
            continue; // header
        }
        if let Some(net_ret) = extract_net_ret(&line) {
            stats.observe(net_ret);
        }
    }
    Ok(stats)
}

/// Render an aligned per-year summary table.
pub fn render_summary_table(years: &[(i32, YearTradeStats)]) -> String {
    use std::fmt::Write as _;

    let header = format!(
        "{:>6}  {:>15}  {:>20}  {:>10}  {:>6}  {:>6}  {:>10}  {:>10}  {:>10}  {:>10}",
        "Year",
        "Total Net Ret",
        "Total Net Ret (bps)",
        "# Trades",
        "Win%",
        "Loss%",
        "Avg Win",
        "Avg Loss",
        "Max Gain",
        "Max Loss"
    );
    let mut out = String::new();
    let _ = writeln!(out, "{header}");
    let _ = writeln!(out, "{}", "-".repeat(header.len()));

    for (year, s) in years {
        let max_gain = if s.num_wins > 0 { s.max_gain } else { 0.0 };
        let max_loss = if s.num_losses > 0 { s.max_loss } else { 0.0 };
        let _ = writeln!(
            out,
            "{:>6}  {:>15.8}  {:>20.4}  {:>10}  {:>6.2}  {:>6.2}  {:>10.6}  {:>10.6}  {:>10.6}  {:>10.6}",
            year,
            s.total_net_ret,
            s.total_net_ret * 1e4,
            s.num_trades,
            s.win_pct(),
            s.loss_pct(),
            s.avg_win(),
            s.avg_loss(),
            max_gain,
            max_loss
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_trades(dir: &Path, year: i32, nets: &[f64]) {
        let path = dir.join(format!("SPY_{year}_trades.csv"));
        let mut f = File::create(path).unwrap();
        writeln!(
            f,
            "ts_in,ts_out,day,mid_in,mid_out,spread_in,direction_score,\
             expected_edge_ret,cost_ret,gross_ret,net_ret,side"
        )
        .unwrap();
        for net in nets {
            writeln!(
                f,
                "1,2,20200102,100,100.01,0.02,0.4,4e-05,0,0.0001,{net},1"
            )
            .unwrap();
        }
    }

    #[test]
    fn aggregates_wins_losses_and_extremes() {
        let dir = tempfile::tempdir().unwrap();
        write_trades(dir.path(), 2020, &[1e-4, -2e-4, 3e-4, 0.0, -1e-5]);

        let s = summarize_year(dir.path(), "SPY", 2020).unwrap();
        assert_eq!(s.num_trades, 5);
        assert_eq!(s.num_wins, 2);
        assert_eq!(s.num_losses, 2);
        assert_eq!(s.num_flat, 1);
        assert!((s.total_net_ret - (1e-4 - 2e-4 + 3e-4 - 1e-5)).abs() < 1e-15);
        assert_eq!(s.max_gain, 3e-4);
        assert_eq!(s.max_loss, -2e-4);
        assert_eq!(s.win_pct(), 40.0);
        assert!((s.avg_loss() - (-1.05e-4)).abs() < 1e-15);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY_2020_trades.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "header").unwrap();
        writeln!(f, "1,2,3").unwrap(); // too few fields
        writeln!(f, "1,2,20200102,100,100.01,0.02,0.4,4e-05,0,0.0001,5e-05,1").unwrap();

        let s = summarize_year(dir.path(), "SPY", 2020).unwrap();
        assert_eq!(s.num_trades, 1);
        assert_eq!(s.total_net_ret, 5e-5);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(summarize_year(dir.path(), "SPY", 1999).is_err());
    }

    #[test]
    fn table_contains_each_year_row() {
        let dir = tempfile::tempdir().unwrap();
        write_trades(dir.path(), 2020, &[1e-4]);
        write_trades(dir.path(), 2021, &[-1e-4]);

        let rows = vec![
            (2020, summarize_year(dir.path(), "SPY", 2020).unwrap()),
            (2021, summarize_year(dir.path(), "SPY", 2021).unwrap()),
        ];
        let table = render_summary_table(&rows);
        assert!(table.contains("2020"));
        assert!(table.contains("2021"));
        assert!(table.lines().count() >= 4);
    }
}
