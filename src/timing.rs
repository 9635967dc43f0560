//! Per-run stage timings.
//!
//! A [`RunTimings`] is created by the driver, threaded through the run, and
//! reported at the end; lifecycle is bounded by the run, with no
//! process-wide registry.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Ordered stage label -> elapsed pairs for one run.
#[derive(Debug, Default, Clone)]
pub struct RunTimings {
    entries: Vec<(String, Duration)>,
}

impl RunTimings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an elapsed duration under a stage label.
    pub fn record(&mut self, label: impl Into<String>, elapsed: Duration) {
        self.entries.push((label.into(), elapsed));
    }

    /// Time a closure and record it.
    pub fn time<T>(&mut self, label: impl Into<String>, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(label, start.elapsed());
        out
    }

    pub fn entries(&self) -> &[(String, Duration)] {
        &self.entries
    }

    pub fn total(&self) -> Duration {
        self.entries.iter().map(|(_, d)| *d).sum()
    }

    /// One line per stage plus a total.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (label, elapsed) in &self.entries {
            let _ = writeln!(out, "{:<24} {:.3}s", label, elapsed.as_secs_f64());
        }
        let _ = writeln!(out, "{:<24} {:.3}s", "total", self.total().as_secs_f64());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut t = RunTimings::new();
        t.record("stage-a", Duration::from_millis(120));
        t.record("stage-b", Duration::from_millis(30));

        assert_eq!(t.entries().len(), 2);
        assert_eq!(t.entries()[0].0, "stage-a");
        assert_eq!(t.total(), Duration::from_millis(150));

        let text = t.render();
        assert!(text.contains("stage-a"));
        assert!(text.contains("total"));
    }

    #[test]
    fn time_returns_the_closure_value() {
        let mut t = RunTimings::new();
        let v = t.time("work", || 42);
        assert_eq!(v, 42);
        assert_eq!(t.entries().len(), 1);
    }
}
