#![no_main]

use std::time::Instant;

use cardinality_aggregator::{HllSketch, MergePolicy, Merger};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut merger = Merger::<HllSketch>::new(MergePolicy::new(2));
    let now = Instant::now();
    for line in data.split(|&b| b == b'\n') {
        let before = (merger.stats().partials, merger.pending_buckets());
        if merger.handle_record(line, now).is_err() {
            // Rejected partials never touch merge state.
            assert_eq!((merger.stats().partials, merger.pending_buckets()), before);
        }
    }
    for summary in merger.flush() {
        assert!(summary.degraded);
    }
});
