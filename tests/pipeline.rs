use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use cardinality_aggregator::record::{Event, FinalSummary};
use cardinality_aggregator::runtime::{
    run_aggregator, run_merger, OutputMode, RunOptions, RuntimeError,
};
use cardinality_aggregator::transport::{
    LineSource, MemorySink, MemorySource, OutputSink, RecordSink, RetryPolicy, TransportError,
};
use cardinality_aggregator::{
    Aggregator, Granularity, HllSketch, MergePolicy, Merger, WatermarkPolicy,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const START: i64 = 1_609_459_200;

fn options(partition: Option<u32>) -> RunOptions {
    RunOptions {
        read_timeout: Duration::from_millis(10),
        retry: RetryPolicy {
            max_attempts: 2,
            backoff: Duration::ZERO,
        },
        partition,
    }
}

fn encode(events: &[Event]) -> Vec<Vec<u8>> {
    events.iter().map(|e| serde_json::to_vec(e).unwrap()).collect()
}

/// Runs one aggregator per partition and returns every partial summary in emission order.
fn aggregate(partitions: &[Vec<Event>], granularity: Granularity) -> Vec<Vec<u8>> {
    let stop = AtomicBool::new(false);
    let mut partials = Vec::new();
    for (partition, events) in partitions.iter().enumerate() {
        let mut aggregator = Aggregator::<HllSketch>::new(granularity, WatermarkPolicy::default());
        let mut sink = MemorySink::new();
        run_aggregator(
            &mut aggregator,
            &mut MemorySource::new(encode(events)),
            &mut sink,
            OutputMode::Partial,
            options(Some(partition as u32)),
            &stop,
        )
        .unwrap();
        partials.extend(sink.into_records());
    }
    partials
}

fn merge(partials: Vec<Vec<u8>>, expected_partitions: u32) -> Vec<FinalSummary> {
    let mut merger = Merger::<HllSketch>::new(MergePolicy::new(expected_partitions));
    let mut sink = MemorySink::new();
    run_merger(
        &mut merger,
        &mut MemorySource::new(partials),
        &mut sink,
        options(None),
        &AtomicBool::new(false),
    )
    .unwrap();
    sink.records()
        .iter()
        .map(|record| FinalSummary::from_slice(record).unwrap())
        .collect()
}

#[test]
fn test_two_partitions_merge_to_union() {
    let partitions = vec![
        vec![Event::new(START, "a"), Event::new(START + 1, "b"), Event::new(START + 61, "a")],
        vec![Event::new(START + 2, "b"), Event::new(START + 3, "c"), Event::new(START + 62, "d")],
    ];
    let finals = merge(aggregate(&partitions, Granularity::Minute), 2);

    let counts: Vec<(&str, u64, bool)> = finals
        .iter()
        .map(|s| (s.date.as_str(), s.count, s.degraded))
        .collect();
    assert_eq!(
        counts,
        vec![("Jan  1 00:00 2021", 3, false), ("Jan  1 00:01 2021", 2, false)]
    );
}

#[test]
fn test_redelivered_partials_do_not_inflate_counts() {
    let partitions = vec![
        vec![Event::new(START, "a"), Event::new(START, "b")],
        vec![Event::new(START, "c")],
    ];
    let partials = aggregate(&partitions, Granularity::Hour);
    let mut redelivered = partials.clone();
    redelivered.insert(1, partials[0].clone());

    let finals = merge(redelivered, 2);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].count, 3);
    assert!(!finals[0].degraded);
}

#[test]
fn test_missing_partition_yields_degraded_summary() {
    let partitions = vec![vec![Event::new(START, "a"), Event::new(START, "b")]];
    let finals = merge(aggregate(&partitions, Granularity::Day), 3);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].date, "Jan  1 2021");
    assert_eq!(finals[0].count, 2);
    assert!(finals[0].degraded);
    assert_eq!((finals[0].reports, finals[0].expected), (Some(1), Some(3)));
}

#[test]
fn test_large_random_stream_is_within_error_bound() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut partitions: Vec<Vec<Event>> = vec![Vec::new(); 4];
    let mut truth: BTreeMap<i64, HashSet<String>> = BTreeMap::new();
    // Four hours, timestamps increasing with a little jitter inside each partition.
    for second in 0..(4 * 3_600) {
        for _ in 0..3 {
            let uid = format!("user-{}", rng.gen_range(0..20_000));
            let ts = START + second;
            truth.entry(ts.div_euclid(3_600)).or_default().insert(uid.clone());
            partitions[rng.gen_range(0..4)].push(Event::new(ts, uid));
        }
    }

    let finals = merge(aggregate(&partitions, Granularity::Hour), 4);
    assert_eq!(finals.len(), truth.len());
    for (summary, exact) in finals.iter().zip(truth.values()) {
        let exact = exact.len() as f64;
        let error = (summary.count as f64 - exact).abs() / exact;
        assert!(error < 0.081, "{}: {} vs {exact}", summary.date, summary.count);
        assert!(!summary.degraded);
    }
}

#[test]
fn test_json_lines_files_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("events.jsonl");
    let output = dir.path().join("counts.jsonl");
    let lines = [
        r#"{"ts":1609459200,"uid":"u1"}"#,
        r#"{"ts":1609459200,"uid":"u2"}"#,
        "",
        "not json",
        r#"{"ts":1609459260,"uid":"u1"}"#,
    ];
    std::fs::write(&input, lines.join("\n")).unwrap();

    let mut source = LineSource::open(input.to_str().unwrap()).unwrap();
    let mut sink = OutputSink::open(output.to_str().unwrap()).unwrap();
    let mut aggregator =
        Aggregator::<HllSketch>::new(Granularity::Minute, WatermarkPolicy::default());
    let stats = run_aggregator(
        &mut aggregator,
        &mut source,
        &mut sink,
        OutputMode::Final,
        options(None),
        &AtomicBool::new(false),
    )
    .unwrap();
    drop(sink);

    assert_eq!(stats.malformed, 1);
    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(
        written,
        concat!(
            r#"{"Date":"Jan  1 00:00 2021","Count":2,"Degraded":false}"#,
            "\n",
            r#"{"Date":"Jan  1 00:01 2021","Count":1,"Degraded":false}"#,
            "\n",
        )
    );
}

/// Sink whose downstream is gone.
struct Unreachable;

impl RecordSink for Unreachable {
    fn send(&mut self, _payload: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Rejected("broker unreachable".to_string()))
    }
}

#[test]
fn test_exhausted_retries_abort_the_merger() {
    let partials = aggregate(&[vec![Event::new(START, "a")]], Granularity::Minute);
    let mut merger = Merger::<HllSketch>::new(MergePolicy::new(1));
    let err = run_merger(
        &mut merger,
        &mut MemorySource::new(partials),
        &mut Unreachable,
        options(None),
        &AtomicBool::new(false),
    )
    .unwrap_err();
    match err {
        RuntimeError::Send { date, source } => {
            assert_eq!(date, "Jan  1 00:00 2021");
            assert!(matches!(source, TransportError::RetriesExhausted { attempts: 2, .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
}
