//! Recoverable-data glitch counters and reporting.
//!
//! Stage A never fails on bad input rows; it counts them. Counters are
//! indexed by `(category, hour-of-day)` so the report shows both totals and
//! an intraday profile across the regular session.
//!
//! Each worker owns a private `GlitchCounts` and merges it into the shared
//! one exactly once at end of shard, so the hot loop takes no lock.

use std::fmt::Write as _;

use ahash::AHashMap;

/// Glitch categories tracked by the aggregation stage.
pub mod category {
    pub const PARSE_FAIL: &str = "parse_fail";
    pub const NONPOS_FIELD: &str = "nonpos_field";
    pub const NONPOS_PRICE: &str = "nonpos_price";
    pub const LOCKED_CROSSED: &str = "locked_crossed";
}

/// Counter map for recoverable input glitches.
#[derive(Debug, Default, Clone)]
pub struct GlitchCounts {
    total: AHashMap<&'static str, u64>,
    by_hour: AHashMap<&'static str, AHashMap<u32, u64>>,
}

impl GlitchCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one glitch of `cat` seen during hour `hour`.
    #[inline]
    pub fn bump(&mut self, cat: &'static str, hour: u32) {
        *self.total.entry(cat).or_insert(0) += 1;
        *self.by_hour.entry(cat).or_default().entry(hour).or_insert(0) += 1;
    }

    /// Fold another counter set into this one (worker merge).
    pub fn merge(&mut self, other: &GlitchCounts) {
        for (cat, n) in &other.total {
            *self.total.entry(cat).or_insert(0) += n;
        }
        for (cat, hours) in &other.by_hour {
            let dst = self.by_hour.entry(cat).or_default();
            for (h, n) in hours {
                *dst.entry(*h).or_insert(0) += n;
            }
        }
    }

    /// Total count for one category.
    pub fn total(&self, cat: &str) -> u64 {
        self.total.get(cat).copied().unwrap_or(0)
    }

    /// Count for one category in one hour.
    pub fn by_hour(&self, cat: &str, hour: u32) -> u64 {
        self.by_hour
            .get(cat)
            .and_then(|m| m.get(&hour))
            .copied()
            .unwrap_or(0)
    }

    /// Sum over all categories.
    pub fn grand_total(&self) -> u64 {
        self.total.values().sum()
    }

    /// Render the human-readable report: totals first, then per-hour
    /// (09-15 inclusive) counts per category.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("NBBO pipeline glitch report\n\nTotals:\n");

        let mut cats: Vec<&&str> = self.total.keys().collect();
        cats.sort();
        for cat in &cats {
            let _ = writeln!(out, "{:<22} : {}", cat, self.total[*cat]);
        }

        out.push_str("\nBy hour (RTH):\n");
        let mut cats: Vec<&&str> = self.by_hour.keys().collect();
        cats.sort();
        for cat in cats {
            let _ = writeln!(out, "\n[{cat}]");
            for h in 9..=15 {
                let _ = writeln!(out, "  {h}:00 - {}", self.by_hour(cat, h));
            }
        }
        out
    }
}
