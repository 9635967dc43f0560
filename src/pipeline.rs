//! Stage-A driver: raw shards to per-year tick partitions.
//!
//! Orchestrates the front of the pipeline for one run:
//!
//! 1. **Shard discovery**: `.csv.gz` files under the input directory whose
//!    names start with the symbol root and carry a parseable year, filtered
//!    by the configured year range and processed in chronological order.
//! 2. **Aggregation**: shards are aggregated to per-shard binary caches in
//!    parallel (one worker per shard, no shared mutable state beyond the
//!    end-of-shard glitch merge). Cache hits skip this entirely, so a run
//!    can start from cache with no raw input at all.
//! 3. **Clock synthesis fallback**: in clock mode with no clock cache, an
//!    existing event cache is forward-filled into the clock cache without
//!    re-parsing raw quotes.
//! 4. **Tail pass**: optional winsor cutoffs over all cached shards.
//! 5. **Partitioned write**: a sequential pass over the shards applies the
//!    winsor policy and splits rows into per-year parquet partitions.
//!
//! Every stage either completes (writers closed, counters merged) or the
//! run fails with a stage-tagged error; a later stage never reads a failed
//! stage's partial output.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::aggregator::{ForwardFill, TickAggregator};
use crate::config::{GridMode, PipelineConfig, WinsorMode};
use crate::error::{PipelineError, Result, StageContext};
use crate::glitch::GlitchCounts;
use crate::quotes::GzLineReader;
use crate::store::{PartitionedTickWriter, TickCacheReader, TickCacheWriter};
use crate::timing::RunTimings;
use crate::winsor::{compute_tail_cutoffs, winsorize, TailCutoffs};

/// Filesystem layout of one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    /// Directory of raw `.csv.gz` shards; may be empty or missing when the
    /// cache is already built.
    pub in_dir: PathBuf,

    /// Cache root; per-grid caches live in `ms_event/` and `ms_clock/`.
    pub cache_dir: PathBuf,

    /// Output root; partitions land in `<out_root>/<mode>/`.
    pub out_root: PathBuf,

    /// Glitch report destination, if wanted.
    pub report_path: Option<PathBuf>,
}

/// What one run produced.
#[derive(Debug)]
pub struct RunSummary {
    /// Cached shards consumed by the write pass, in chronological order.
    pub shards: Vec<PathBuf>,

    /// `(year, rows)` per written partition.
    pub partitions: Vec<(i32, u64)>,

    /// Tail cutoffs, when winsorization ran.
    pub cutoffs: Option<TailCutoffs>,

    /// Merged glitch counters (empty on a full cache hit).
    pub glitches: GlitchCounts,

    /// True when stage A was skipped because the cache was complete.
    pub cache_hit: bool,

    /// Stage timings for this run.
    pub timings: RunTimings,
}

/// The stage-A pipeline, configured once and run against a directory layout.
pub struct TickPipeline {
    config: PipelineConfig,
}

impl TickPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Cache subdirectory for the configured grid.
    pub fn cache_subdir(&self, paths: &RunPaths) -> PathBuf {
        let sub = match self.config.grid {
            GridMode::Event => "ms_event",
            GridMode::Clock => "ms_clock",
        };
        paths.cache_dir.join(sub)
    }

    /// Output directory name for the configured grid and winsor mode.
    pub fn out_mode_dirname(&self) -> &'static str {
        match (self.config.grid, self.config.winsor.is_some()) {
            (GridMode::Event, false) => "event",
            (GridMode::Event, true) => "event_winsor",
            (GridMode::Clock, false) => "clock",
            (GridMode::Clock, true) => "clock_winsor",
        }
    }

    /// Run the full stage-A flow.
    pub fn run(&self, paths: &RunPaths) -> Result<RunSummary> {
        let mut timings = RunTimings::new();
        let glitches = Mutex::new(GlitchCounts::new());

        std::fs::create_dir_all(paths.cache_dir.join("ms_event"))?;
        std::fs::create_dir_all(paths.cache_dir.join("ms_clock"))?;

        log::info!(
            "run: grid={:?} winsor={} symbol={} years={:?}..{:?}",
            self.config.grid,
            self.config
                .winsor
                .map(|w| format!("{:?}", w.mode))
                .unwrap_or_else(|| "off".into()),
            self.config.symbol_root,
            self.config.year_lo,
            self.config.year_hi
        );

        let csv_files = self.list_csv_shards(&paths.in_dir)?;

        // Prefer the cache that matches the CSV listing, then a cache-only
        // scan, then the clock-from-event fallback, then a fresh build.
        let mut cache_hit = true;
        let mut shards = self
            .cached_shards_for(&csv_files, paths)
            .or_else(|| self.scan_cache(&self.cache_subdir(paths)));

        if shards.is_none() && self.config.grid == GridMode::Clock {
            if let Some(event_shards) = self.scan_cache(&paths.cache_dir.join("ms_event")) {
                log::info!(
                    "clock cache missing; synthesizing from {} event shards (gap<={}ms)",
                    event_shards.len(),
                    self.config.max_ffill_gap_ms
                );
                let produced = timings.time("clock-synthesis", || {
                    self.event_to_clock_parallel(&event_shards, paths)
                })?;
                shards = Some(produced);
            }
        }

        let shards = match shards {
            Some(s) => {
                log::info!("stage A skipped: {} cached shards", s.len());
                s
            }
            None => {
                if csv_files.is_empty() {
                    return Err(PipelineError::Config(format!(
                        "no CSV shards in {} and no cache in {}",
                        paths.in_dir.display(),
                        self.cache_subdir(paths).display()
                    )));
                }
                cache_hit = false;
                log::info!("stage A: aggregating {} CSV shards", csv_files.len());
                timings.time("aggregate", || {
                    self.aggregate_parallel(&csv_files, paths, &glitches)
                })?;
                self.cached_shards_for(&csv_files, paths)
                    .or_else(|| self.scan_cache(&self.cache_subdir(paths)))
                    .ok_or_else(|| {
                        PipelineError::Invariant(format!(
                            "stage A produced no usable cache in {}",
                            self.cache_subdir(paths).display()
                        ))
                    })?
            }
        };

        let cutoffs = match &self.config.winsor {
            Some(w) => Some(timings.time("tail-quantiles", || {
                compute_tail_cutoffs(&shards, w, self.config.workers)
            })?),
            None => None,
        };

        let partitions = timings.time("partitioned-write", || {
            self.write_partitions(&shards, paths, cutoffs.as_ref())
        })?;

        let glitches = glitches.into_inner();
        if let Some(report_path) = &paths.report_path {
            if let Some(parent) = report_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(report_path, glitches.render_report())?;
            log::info!("glitch report -> {}", report_path.display());
        }

        log::info!("run complete:\n{}", timings.render());
        Ok(RunSummary {
            shards,
            partitions,
            cutoffs,
            glitches,
            cache_hit,
            timings,
        })
    }

    /// List raw shards for this symbol/year range, sorted by file name.
    fn list_csv_shards(&self, in_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        if !in_dir.is_dir() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(in_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".csv.gz") {
                continue;
            }
            if !name.starts_with(&self.config.symbol_root) {
                continue;
            }
            match extract_shard_year(&name, &self.config.symbol_root) {
                Some(year) if self.year_in_range(year) => out.push(entry.path()),
                _ => {}
            }
        }
        out.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
        Ok(out)
    }

    fn year_in_range(&self, year: i32) -> bool {
        self.config.year_lo.map_or(true, |lo| year >= lo)
            && self.config.year_hi.map_or(true, |hi| year <= hi)
    }

    /// Cache path of one CSV shard.
    fn cache_path_for_csv(&self, csv: &Path, paths: &RunPaths) -> PathBuf {
        let name = csv.file_name().map(|n| n.to_string_lossy().into_owned());
        let base = name
            .as_deref()
            .and_then(|n| n.strip_suffix(".csv.gz"))
            .unwrap_or("shard")
            .to_string();
        self.cache_subdir(paths).join(format!("{base}.msbin"))
    }

    /// Cache files for every listed CSV, iff all exist.
    fn cached_shards_for(&self, csv_files: &[PathBuf], paths: &RunPaths) -> Option<Vec<PathBuf>> {
        if csv_files.is_empty() {
            return None;
        }
        let mut out = Vec::with_capacity(csv_files.len());
        for csv in csv_files {
            let cached = self.cache_path_for_csv(csv, paths);
            if !cached.is_file() {
                return None;
            }
            out.push(cached);
        }
        self.sort_chronologically(&mut out);
        Some(out)
    }

    /// Scan one cache directory for this symbol's shards.
    fn scan_cache(&self, dir: &Path) -> Option<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir).ok()?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "msbin") {
                continue;
            }
            let name = path.file_name()?.to_string_lossy().into_owned();
            if !name.starts_with(&self.config.symbol_root) {
                continue;
            }
            match extract_shard_year(&name, &self.config.symbol_root) {
                Some(year) if self.year_in_range(year) => out.push(path),
                _ => {}
            }
        }
        if out.is_empty() {
            return None;
        }
        self.sort_chronologically(&mut out);
        Some(out)
    }

    /// Order shards by embedded year, then name, so partition contents
    /// follow shard chronology deterministically.
    fn sort_chronologically(&self, shards: &mut [PathBuf]) {
        let sym = &self.config.symbol_root;
        shards.sort_by_key(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (extract_shard_year(&name, sym).unwrap_or(i32::MAX), name)
        });
    }

    /// Aggregate every CSV shard into its cache file, in parallel.
    fn aggregate_parallel(
        &self,
        csv_files: &[PathBuf],
        paths: &RunPaths,
        glitches: &Mutex<GlitchCounts>,
    ) -> Result<()> {
        let pool = self.build_pool()?;
        pool.install(|| {
            csv_files.par_iter().try_for_each(|csv| {
                let shard = csv.display().to_string();
                let out = self.cache_path_for_csv(csv, paths);
                log::info!("[aggregate] {} -> {}", shard, out.display());
                self.aggregate_one(csv, &out, glitches)
                    .stage("aggregate", shard)
            })
        })
    }

    /// Aggregate one CSV shard into one cache file.
    fn aggregate_one(
        &self,
        csv: &Path,
        out: &Path,
        glitches: &Mutex<GlitchCounts>,
    ) -> Result<()> {
        let mut reader = GzLineReader::open(csv)?;
        let mut writer = TickCacheWriter::create(out)?;
        let mut agg = TickAggregator::new(&self.config);
        let mut fill = ForwardFill::new(self.config.max_ffill_gap_ms);
        let clock = self.config.grid == GridMode::Clock;

        reader.next_line()?; // header

        let mut write_err: Option<PipelineError> = None;
        let mut rows_out: u64 = 0;
        {
            let mut sink = |tick| {
                if write_err.is_none() {
                    if let Err(e) = writer.append(&tick) {
                        write_err = Some(e);
                    } else {
                        rows_out += 1;
                        if rows_out % self.config.log_every_out == 0 {
                            log::info!("[aggregate] {} out={rows_out}", csv.display());
                        }
                    }
                }
            };

            while let Some(line) = reader.next_line()? {
                let emitted = agg.accept_line(line);
                if let Some(tick) = emitted {
                    if clock {
                        fill.push(tick, &mut sink);
                    } else {
                        sink(tick);
                    }
                }
                if agg.stats().lines_in % self.config.log_every_in == 0 {
                    log::info!(
                        "[aggregate] {} in={}",
                        csv.display(),
                        agg.stats().lines_in
                    );
                }
            }
            if let Some(tick) = agg.finish() {
                if clock {
                    fill.push(tick, &mut sink);
                } else {
                    sink(tick);
                }
            }
        }
        if let Some(e) = write_err {
            return Err(e);
        }
        writer.finish()?;

        glitches.lock().merge(agg.glitches());
        Ok(())
    }

    /// Forward-fill cached event shards into the clock cache.
    fn event_to_clock_parallel(
        &self,
        event_shards: &[PathBuf],
        paths: &RunPaths,
    ) -> Result<Vec<PathBuf>> {
        let outdir = paths.cache_dir.join("ms_clock");
        std::fs::create_dir_all(&outdir)?;

        let pool = self.build_pool()?;
        let mut produced: Vec<PathBuf> = pool.install(|| {
            event_shards
                .par_iter()
                .map(|in_path| {
                    let shard = in_path.display().to_string();
                    let name = in_path
                        .file_name()
                        .ok_or_else(|| {
                            PipelineError::Invariant(format!("shard without file name: {shard}"))
                        })
                        .stage("clock-synthesis", shard.clone())?;
                    let out_path = outdir.join(name);
                    self.fill_one(in_path, &out_path)
                        .stage("clock-synthesis", shard)?;
                    Ok(out_path)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        self.sort_chronologically(&mut produced);
        Ok(produced)
    }

    /// Apply the bounded-fill rule to one cached event shard.
    fn fill_one(&self, in_path: &Path, out_path: &Path) -> Result<()> {
        let mut reader = TickCacheReader::open(in_path)?;
        let mut writer = TickCacheWriter::create(out_path)?;
        let mut fill = ForwardFill::new(self.config.max_ffill_gap_ms);

        let mut write_err: Option<PipelineError> = None;
        while let Some(tick) = reader.next_tick()? {
            fill.push(tick, &mut |t| {
                if write_err.is_none() {
                    if let Err(e) = writer.append(&t) {
                        write_err = Some(e);
                    }
                }
            });
            if let Some(e) = write_err.take() {
                return Err(e);
            }
        }
        writer.finish()?;
        Ok(())
    }

    /// Sequential winsor + per-year partitioned parquet write.
    fn write_partitions(
        &self,
        shards: &[PathBuf],
        paths: &RunPaths,
        cutoffs: Option<&TailCutoffs>,
    ) -> Result<Vec<(i32, u64)>> {
        let out_dir = paths.out_root.join(self.out_mode_dirname());
        let mut writer = PartitionedTickWriter::new(&out_dir, self.config.symbol_root.as_str())?;

        // unusable cutoffs (no finite returns seen) disable the policy
        let policy: Option<(&TailCutoffs, WinsorMode)> = match (cutoffs, &self.config.winsor) {
            (Some(c), Some(w)) if c.usable() => Some((c, w.mode)),
            (Some(c), Some(_)) if !c.usable() => {
                log::warn!("winsor requested but no finite returns; writing raw");
                None
            }
            _ => None,
        };

        let mut rows: u64 = 0;
        for (i, shard) in shards.iter().enumerate() {
            log::info!(
                "[write] {}/{} {}",
                i + 1,
                shards.len(),
                shard.display()
            );
            let mut reader = TickCacheReader::open(shard)
                .stage("partitioned-write", shard.display().to_string())?;
            loop {
                let tick = reader
                    .next_tick()
                    .stage("partitioned-write", shard.display().to_string())?;
                let Some(mut tick) = tick else { break };

                if let Some((c, mode)) = policy {
                    match winsorize(tick.log_return, c, mode) {
                        Some(lr) => tick.log_return = lr,
                        None => continue, // dropped row
                    }
                }

                writer.append(&tick)?;
                rows += 1;
                if rows % self.config.log_every_out == 0 {
                    log::info!("[write] total={rows}");
                }
            }
        }

        let partitions = writer.finish()?;
        log::info!(
            "[write] complete: {} partitions under {}",
            partitions.len(),
            out_dir.display()
        );
        Ok(partitions)
    }

    fn build_pool(&self) -> Result<rayon::ThreadPool> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(w) = self.config.workers {
            builder = builder.num_threads(w);
        }
        builder
            .build()
            .map_err(|e| PipelineError::Config(format!("thread pool build failed: {e}")))
    }
}

/// Year embedded in a shard file name, right after the symbol root
/// (`SPY2020_03.csv.gz` -> 2020).
pub fn extract_shard_year(file_name: &str, symbol_root: &str) -> Option<i32> {
    let rest = file_name.strip_prefix(symbol_root)?;
    let digits = rest.as_bytes().get(..4)?;
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_year_extraction() {
        assert_eq!(extract_shard_year("SPY2020_03.csv.gz", "SPY"), Some(2020));
        assert_eq!(extract_shard_year("SPY2023.msbin", "SPY"), Some(2023));
        assert_eq!(extract_shard_year("SPY_2020.csv.gz", "SPY"), None);
        assert_eq!(extract_shard_year("QQQ2020.csv.gz", "SPY"), None);
        assert_eq!(extract_shard_year("SPY20.csv.gz", "SPY"), None);
    }

    #[test]
    fn out_mode_dirnames() {
        use crate::config::WinsorConfig;

        let p = TickPipeline::new(PipelineConfig::default()).unwrap();
        assert_eq!(p.out_mode_dirname(), "event");

        let p = TickPipeline::new(
            PipelineConfig::default()
                .with_grid(GridMode::Clock)
                .with_winsor(WinsorConfig::default()),
        )
        .unwrap();
        assert_eq!(p.out_mode_dirname(), "clock_winsor");
    }
}
