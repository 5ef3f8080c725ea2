//! # Aggregator
//!
//! Consumes the events of one stream partition, keeps one sketch per open time bucket and
//! decides when a bucket is complete.
//!
//! ## Admission
//! An event for an open bucket is always folded in. An event for a bucket that is not open is
//! only admitted when its key is not earlier than the oldest open key and later than every
//! key this aggregator has already closed; anything else belongs to a closed bucket and is
//! dropped. Closed buckets are never reopened, so very late data is a bounded under-count.
//!
//! ## Watermark
//! After every event, while more than `open_threshold` buckets are open and the two oldest
//! buckets' latest event timestamps are less than `lateness_secs` apart, the oldest bucket is
//! closed. Independently, the oldest bucket is force-closed while more than
//! `max_open_buckets` are open, which bounds memory when the lateness test keeps failing.

use tracing::{debug, info, warn};

use crate::bucket::{BucketKey, Granularity};
use crate::record::{Event, RecordError};
use crate::sketch::DistinctSketch;
use crate::store::{BucketState, BucketStore};

pub const DEFAULT_OPEN_THRESHOLD: usize = 2;
pub const DEFAULT_LATENESS_SECS: i64 = 5;
pub const DEFAULT_MAX_OPEN_BUCKETS: usize = 16;

/// Closure policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkPolicy {
    /// Buckets allowed to stay open before the lateness test is applied.
    pub open_threshold: usize,
    /// The oldest bucket closes once its latest timestamp is within this many seconds of the
    /// next bucket's latest timestamp.
    pub lateness_secs: i64,
    /// Hard limit on open buckets.
    pub max_open_buckets: usize,
}

impl Default for WatermarkPolicy {
    fn default() -> Self {
        Self {
            open_threshold: DEFAULT_OPEN_THRESHOLD,
            lateness_secs: DEFAULT_LATENESS_SECS,
            max_open_buckets: DEFAULT_MAX_OPEN_BUCKETS,
        }
    }
}

/// Counters kept over the aggregator's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub events: u64,
    pub late_dropped: u64,
    pub malformed: u64,
    pub buckets_opened: u64,
    pub buckets_closed: u64,
    pub forced_closures: u64,
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Folded into an already open bucket.
    Updated,
    /// Opened a new bucket.
    Opened,
    /// Belonged to a closed bucket and was dropped.
    Late,
    /// Could not be placed on the calendar and was dropped.
    Rejected,
}

/// Bucket removed from the aggregator, ready to be emitted.
#[derive(Debug)]
pub struct ClosedBucket<S> {
    pub key: BucketKey,
    /// `Date` label of the bucket.
    pub label: String,
    pub sketch: S,
    pub last_event_ts: i64,
    pub events: u64,
}

/// Result of handling one event.
#[derive(Debug)]
pub struct EventOutcome<S> {
    pub admission: Admission,
    /// Buckets closed by the watermark after this event, oldest first.
    pub closed: Vec<ClosedBucket<S>>,
}

/// Per-partition bucketing and watermark engine.
#[derive(Debug)]
pub struct Aggregator<S> {
    granularity: Granularity,
    policy: WatermarkPolicy,
    store: BucketStore<S>,
    /// Latest key closed so far.
    horizon: Option<BucketKey>,
    stats: AggregatorStats,
}

impl<S: DistinctSketch> Aggregator<S> {
    pub fn new(granularity: Granularity, policy: WatermarkPolicy) -> Self {
        Self {
            granularity,
            policy,
            store: BucketStore::new(),
            horizon: None,
            stats: AggregatorStats::default(),
        }
    }

    #[inline]
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    #[inline]
    pub fn policy(&self) -> WatermarkPolicy {
        self.policy
    }

    #[inline]
    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Number of open buckets.
    #[inline]
    pub fn open_buckets(&self) -> usize {
        self.store.len()
    }

    /// Open bucket keys in chronological order.
    pub fn open_keys(&self) -> Vec<BucketKey> {
        self.store.keys().collect()
    }

    /// Decode and handle one raw event payload.
    ///
    /// Malformed payloads are counted, logged and skipped; the stream keeps flowing.
    pub fn handle_record(&mut self, payload: &[u8]) -> Vec<ClosedBucket<S>> {
        match Event::from_slice(payload) {
            Ok(event) => self.handle_event(&event).closed,
            Err(err) => {
                self.reject(&err);
                Vec::new()
            }
        }
    }

    /// Fold `event` into its bucket and close every bucket the watermark allows.
    pub fn handle_event(&mut self, event: &Event) -> EventOutcome<S> {
        let Some(key) = self.granularity.bucket_key(event.timestamp) else {
            self.reject(&RecordError::TimestampOutOfRange(event.timestamp));
            return EventOutcome {
                admission: Admission::Rejected,
                closed: Vec::new(),
            };
        };

        let admission = if let Some(state) = self.store.get_mut(key) {
            state.observe(event.timestamp, &event.identifier);
            Admission::Updated
        } else if self.is_late(key) {
            self.stats.late_dropped += 1;
            debug!(
                bucket = %self.granularity.label(key),
                timestamp = event.timestamp,
                "dropping event for closed bucket"
            );
            Admission::Late
        } else {
            self.store
                .open(key, event.timestamp)
                .observe(event.timestamp, &event.identifier);
            self.stats.buckets_opened += 1;
            Admission::Opened
        };

        if matches!(admission, Admission::Updated | Admission::Opened) {
            self.stats.events += 1;
        }

        EventOutcome {
            admission,
            closed: self.close_ready(),
        }
    }

    /// Close every open bucket in chronological order. Used on stream end and on stop.
    pub fn flush(&mut self) -> Vec<ClosedBucket<S>> {
        let mut closed = Vec::with_capacity(self.store.len());
        while let Some(state) = self.store.pop_oldest() {
            closed.push(self.close(state));
        }
        if !closed.is_empty() {
            info!(buckets = closed.len(), "flushed open buckets");
        }
        closed
    }

    fn is_late(&self, key: BucketKey) -> bool {
        self.horizon.is_some_and(|horizon| key <= horizon)
            || self.store.oldest_key().is_some_and(|oldest| key < oldest)
    }

    fn close_ready(&mut self) -> Vec<ClosedBucket<S>> {
        let mut closed = Vec::new();
        loop {
            let forced = self.store.len() > self.policy.max_open_buckets;
            if !forced && !self.watermark_passed() {
                break;
            }
            let Some(state) = self.store.pop_oldest() else {
                break;
            };
            if forced {
                self.stats.forced_closures += 1;
                warn!(
                    bucket = %self.granularity.label(state.key),
                    open = self.store.len() + 1,
                    limit = self.policy.max_open_buckets,
                    "closing bucket at open bucket limit"
                );
            }
            closed.push(self.close(state));
        }
        closed
    }

    fn watermark_passed(&self) -> bool {
        if self.store.len() <= self.policy.open_threshold {
            return false;
        }
        let tolerance = self.policy.lateness_secs.unsigned_abs();
        self.store.oldest_pair().is_some_and(|(oldest, next)| {
            oldest.last_event_ts.abs_diff(next.last_event_ts) < tolerance
        })
    }

    fn close(&mut self, state: BucketState<S>) -> ClosedBucket<S> {
        self.horizon = Some(self.horizon.map_or(state.key, |h| h.max(state.key)));
        self.stats.buckets_closed += 1;
        let label = self.granularity.label(state.key);
        debug!(bucket = %label, events = state.events, "closing bucket");
        ClosedBucket {
            key: state.key,
            label,
            sketch: state.sketch,
            last_event_ts: state.last_event_ts,
            events: state.events,
        }
    }

    fn reject(&mut self, err: &RecordError) {
        self.stats.malformed += 1;
        warn!(error = %err, malformed = self.stats.malformed, "skipping malformed event");
    }
}
