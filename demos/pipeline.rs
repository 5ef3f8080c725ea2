//! Two partition aggregators feeding one merger, all in memory.
//!
//! ```text
//! cargo run --example pipeline
//! ```

use std::sync::atomic::AtomicBool;

use cardinality_aggregator::record::{Event, FinalSummary};
use cardinality_aggregator::runtime::{
    init_tracing, run_aggregator, run_merger, OutputMode, RunOptions, RuntimeError,
};
use cardinality_aggregator::transport::{MemorySink, MemorySource};
use cardinality_aggregator::{
    Aggregator, Granularity, HllSketch, MergePolicy, Merger, WatermarkPolicy,
};

const PARTITIONS: u32 = 2;

fn main() -> Result<(), RuntimeError> {
    init_tracing("info");
    let stop = AtomicBool::new(false);

    // Ten minutes of traffic, one event per second, users cycling through 0..500.
    let mut streams = vec![Vec::new(); PARTITIONS as usize];
    for second in 0..600i64 {
        let event = Event::new(1_609_459_200 + second, format!("user-{}", (second * 7) % 500));
        let partition = (second % i64::from(PARTITIONS)) as usize;
        streams[partition].push(serde_json::to_vec(&event).unwrap_or_default());
    }

    let mut partials = Vec::new();
    for (partition, stream) in streams.into_iter().enumerate() {
        let mut aggregator =
            Aggregator::<HllSketch>::new(Granularity::Minute, WatermarkPolicy::default());
        let mut sink = MemorySink::new();
        let options = RunOptions {
            partition: Some(partition as u32),
            ..RunOptions::default()
        };
        run_aggregator(
            &mut aggregator,
            &mut MemorySource::new(stream),
            &mut sink,
            OutputMode::Partial,
            options,
            &stop,
        )?;
        partials.extend(sink.into_records());
    }

    let mut merger = Merger::<HllSketch>::new(MergePolicy::new(PARTITIONS));
    let mut sink = MemorySink::new();
    run_merger(
        &mut merger,
        &mut MemorySource::new(partials),
        &mut sink,
        RunOptions::default(),
        &stop,
    )?;

    for record in sink.records() {
        if let Ok(summary) = FinalSummary::from_slice(record) {
            println!("{:>20}  {:>4}", summary.date, summary.count);
        }
    }
    Ok(())
}
