//! `cardinality-aggregator` counts distinct identifiers per time bucket over an unbounded,
//! partitioned event stream.
//!
//! One [`Aggregator`] per partition keeps a HyperLogLog sketch per open bucket and closes
//! buckets with a watermark. A [`Merger`] unions the partial sketches of every partition into
//! one final count per bucket.
pub mod aggregator;
pub mod bucket;
pub mod config;
pub mod merger;
pub mod record;
pub mod runtime;
pub mod sketch;
pub mod store;
pub mod transport;

pub use aggregator::{Aggregator, WatermarkPolicy};
pub use bucket::{BucketKey, Granularity};
pub use merger::{MergePolicy, Merger};
pub use record::{Event, FinalSummary, PartialSummary};
pub use sketch::{DistinctSketch, HllSketch};
