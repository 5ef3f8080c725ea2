#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::time::Instant;

use cardinality_aggregator::record::{Event, PartialSummary};
use cardinality_aggregator::{
    Aggregator, DistinctSketch, Granularity, HllSketch, MergePolicy, Merger, WatermarkPolicy,
};
use criterion::measurement::WallTime;
use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkGroup, BenchmarkId, Criterion, Throughput,
};
use pprof::criterion::{Output, PProfProfiler};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tabled::settings::{Settings, Style};
use tabled::{Table, Tabled};

/// Events per benchmark iteration range from 1 to `DEFAULT_MAX_EVENTS` or environment
/// variable `N` (if defined), multiplied by 16 with every step.
const DEFAULT_MAX_EVENTS: usize = 1 << 16;

/// Distinct identifiers drawn from for generated events.
const IDENTIFIER_SPACE: u64 = 50_000;

criterion_group! {
    name = benches;
    config = Criterion::default().with_profiler(PProfProfiler::new(100, Output::Protobuf));
    targets = benchmark
}
criterion_main!(benches);

fn benchmark(c: &mut Criterion) {
    let bench_results_path = std::env::var("BENCH_RESULTS_PATH")
        .unwrap_or_else(|_| format!("{}/target", env!("CARGO_MANIFEST_DIR")));
    let max_events = std::env::var("N")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_EVENTS);

    let sizes: Vec<usize> = (0..)
        .map(|c| 1 << (4 * c))
        .take_while(|&n| n <= max_events)
        .collect();

    let mut group = c.benchmark_group("aggregate");
    for &events in &sizes {
        group.throughput(Throughput::Elements(events as u64));
        for granularity in [Granularity::Second, Granularity::Minute, Granularity::Hour] {
            bench_aggregate(&mut group, granularity, events);
        }
    }
    group.finish();

    let mut group = c.benchmark_group("merge");
    for partitions in [2u32, 8, 32] {
        group.throughput(Throughput::Elements(u64::from(partitions)));
        bench_merge(&mut group, partitions);
    }
    group.finish();

    let results: Vec<StatRecord> = sizes
        .iter()
        .map(|&events| StatRecord {
            events,
            allocations: measure_allocations(events),
            relative_error: measure_error(events),
        })
        .collect();
    let table_config = Settings::default().with(Style::markdown());
    std::fs::write(
        format!("{}/aggregation.md", bench_results_path),
        Table::new(results).with(table_config).to_string(),
    )
    .unwrap();
}

/// One event per 100ms starting at the epoch, identifiers drawn uniformly.
fn generate_events(count: usize, seed: u64) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let identifier = format!("user-{}", rng.gen_range(0..IDENTIFIER_SPACE));
            Event::new((i / 10) as i64, identifier)
        })
        .collect()
}

fn bench_aggregate(group: &mut BenchmarkGroup<WallTime>, granularity: Granularity, events: usize) {
    let input = generate_events(events, 42);
    group.bench_with_input(BenchmarkId::new(granularity.name(), events), &input, |b, input| {
        b.iter(|| {
            let mut aggregator =
                Aggregator::<HllSketch>::new(granularity, WatermarkPolicy::default());
            let mut closed = 0;
            for event in input {
                closed += aggregator.handle_event(black_box(event)).closed.len();
            }
            closed + aggregator.flush().len()
        });
    });
}

fn bench_merge(group: &mut BenchmarkGroup<WallTime>, partitions: u32) {
    let partials: Vec<PartialSummary> = (0..partitions)
        .map(|partition| {
            let mut sketch = HllSketch::empty();
            for event in generate_events(10_000, u64::from(partition)) {
                sketch.add(&event.identifier);
            }
            PartialSummary {
                date: "Jan  1 2021".to_string(),
                encoded_hll: sketch.encode().unwrap(),
                partition: Some(partition),
                bucket: Some(18_628),
            }
        })
        .collect();
    group.bench_with_input(BenchmarkId::new("partials", partitions), &partials, |b, partials| {
        b.iter(|| {
            let mut merger = Merger::<HllSketch>::new(MergePolicy::new(partitions));
            let now = Instant::now();
            let last = partials
                .iter()
                .map(|partial| merger.handle_partial(black_box(partial), now).unwrap())
                .last();
            last
        });
    });
}

fn measure_allocations(events: usize) -> String {
    let input = generate_events(events, 42);
    let _profiler = dhat::Profiler::builder().testing().build();
    let mut aggregator =
        Aggregator::<HllSketch>::new(Granularity::Minute, WatermarkPolicy::default());
    for event in &input {
        aggregator.handle_event(event);
    }
    let stats = dhat::HeapStats::get();
    format!("{} / {} / {}", stats.max_bytes, stats.total_bytes, stats.total_blocks)
}

fn measure_error(events: usize) -> String {
    let input = generate_events(events, 7);
    let mut aggregator =
        Aggregator::<HllSketch>::new(Granularity::Year, WatermarkPolicy::default());
    let exact: std::collections::HashSet<&str> =
        input.iter().map(|e| e.identifier.as_str()).collect();
    for event in &input {
        aggregator.handle_event(event);
    }
    let estimate: u64 = aggregator.flush().iter().map(|b| b.sketch.cardinality()).sum();
    let relative_error = (estimate as f64 - exact.len() as f64).abs() / exact.len().max(1) as f64;
    format!("{:.4}", relative_error)
}

#[derive(Tabled)]
struct StatRecord {
    events: usize,
    allocations: String,
    relative_error: String,
}
