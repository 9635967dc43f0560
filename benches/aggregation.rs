//! Hot-path micro-benchmarks: per-ms bucket reduction and cell indexing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nbbo_pipeline::config::PipelineConfig;
use nbbo_pipeline::histogram::{HistogramModel, TickState};
use nbbo_pipeline::TickAggregator;

fn bench_aggregate_lines(c: &mut Criterion) {
    let config = PipelineConfig::default();

    // one synthetic trading burst: 512 quotes across ~100 ms
    let lines: Vec<String> = (0..512)
        .map(|i| {
            let ms = (i * 100) / 512;
            let bid = 100.0 + (i % 7) as f64 * 0.01;
            format!(
                "20200102,09:30:00.{ms:03},P,{bid:.2},{},{:.2},{},R",
                5 + i % 13,
                bid + 0.01 + (i % 3) as f64 * 0.01,
                4 + i % 11,
            )
        })
        .collect();

    c.bench_function("aggregate_512_quotes", |b| {
        b.iter(|| {
            let mut agg = TickAggregator::new(&config);
            let mut ticks = 0usize;
            for line in &lines {
                if agg.accept_line(black_box(line)).is_some() {
                    ticks += 1;
                }
            }
            if agg.finish().is_some() {
                ticks += 1;
            }
            black_box(ticks)
        })
    });
}

fn bench_cell_index(c: &mut Criterion) {
    let model = HistogramModel::new(1.0);
    let states: Vec<TickState> = (0..256)
        .map(|i| TickState {
            imbalance: (i as f64 / 128.0) - 1.0,
            spread: 0.01 + (i % 4) as f64 * 0.005,
            age_diff_ms: (i as f64) * 3.0 - 384.0,
            last_move: ((i % 3) as f64) - 1.0,
        })
        .collect();

    c.bench_function("cell_index_256_states", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            for s in &states {
                acc += model.cell_index(black_box(s));
            }
            black_box(acc)
        })
    });
}

criterion_group!(benches, bench_aggregate_lines, bench_cell_index);
criterion_main!(benches);
