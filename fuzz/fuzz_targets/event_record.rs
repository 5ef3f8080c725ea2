#![no_main]

use cardinality_aggregator::{Aggregator, Granularity, HllSketch, WatermarkPolicy};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for granularity in Granularity::ALL {
        let mut aggregator = Aggregator::<HllSketch>::new(granularity, WatermarkPolicy::default());
        for line in data.split(|&b| b == b'\n') {
            aggregator.handle_record(line);
        }
        let stats = aggregator.stats();
        assert!(aggregator.open_buckets() <= WatermarkPolicy::default().max_open_buckets);
        let flushed = aggregator.flush();
        assert_eq!(stats.buckets_opened, stats.buckets_closed + flushed.len() as u64);
    }
});
