//! # Merger
//!
//! Reconciles partial summaries produced by independent aggregators. Every bucket is merged
//! exactly once per contributing partition: the merger tracks which partitions already
//! reported for a bucket, so a redelivered partial is a no-op. Once the expected number of
//! partitions reported, the union estimate is emitted and the bucket state is dropped.
//!
//! Buckets that never collect every report are not kept forever. A bucket idle for longer
//! than the idle timeout, and every bucket still open at shutdown, is emitted with the
//! `degraded` marker so downstream consumers can tell it may under-count.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bucket::shard_for;
use crate::record::{FinalSummary, PartialSummary, RecordError};
use crate::sketch::{DistinctSketch, SketchError};
use crate::store::{MergeState, MergeStore, RecentlyClosed};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CLOSED_KEY_MEMORY: usize = 1024;

/// Slice of the bucket key space owned by one merger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardAssignment {
    pub index: u32,
    pub count: u32,
}

impl ShardAssignment {
    #[inline]
    pub fn owns(&self, date: &str) -> bool {
        shard_for(date, self.count) == self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// Partitions expected to report for every bucket.
    pub expected_partitions: u32,
    /// Buckets without a new report for this long are emitted as degraded.
    pub idle_timeout: Duration,
    /// Number of emitted bucket labels remembered to reject stale partials.
    pub closed_key_memory: usize,
    pub shard: Option<ShardAssignment>,
}

impl MergePolicy {
    pub fn new(expected_partitions: u32) -> Self {
        Self {
            expected_partitions,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            closed_key_memory: DEFAULT_CLOSED_KEY_MEMORY,
            shard: None,
        }
    }
}

/// Merge failure confined to a single partial; merge state is left untouched.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Malformed(#[from] RecordError),
    /// Without a partition id a redelivery cannot be told apart from a new report.
    #[error("partial summary for bucket '{date}' has no partition")]
    MissingPartition { date: String },
    #[error("corrupt sketch for bucket '{date}'")]
    CorruptSketch {
        date: String,
        #[source]
        source: SketchError,
    },
}

/// What happened to one partial summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Applied; the bucket is still waiting for more reports.
    Pending { reports: u32, expected: u32 },
    /// Applied and the bucket is complete.
    Completed(FinalSummary),
    /// Partition already reported for this bucket.
    Duplicate,
    /// Bucket was already emitted.
    AlreadyClosed,
    /// Bucket belongs to another merger shard.
    NotOwned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergerStats {
    pub partials: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub corrupt: u64,
    pub malformed: u64,
    pub not_owned: u64,
    pub completed: u64,
    pub degraded: u64,
}

/// Partial-summary reconciliation engine.
#[derive(Debug)]
pub struct Merger<S> {
    policy: MergePolicy,
    store: MergeStore<S>,
    closed: RecentlyClosed,
    stats: MergerStats,
}

impl<S: DistinctSketch> Merger<S> {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            closed: RecentlyClosed::new(policy.closed_key_memory),
            policy,
            store: MergeStore::new(),
            stats: MergerStats::default(),
        }
    }

    #[inline]
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    #[inline]
    pub fn stats(&self) -> MergerStats {
        self.stats
    }

    /// Number of buckets still waiting for reports.
    #[inline]
    pub fn pending_buckets(&self) -> usize {
        self.store.len()
    }

    /// Reports applied so far to the bucket labelled `date`.
    pub fn reports(&self, date: &str) -> Option<u32> {
        self.store.get(date).map(MergeState::reports)
    }

    /// Current union estimate of the pending bucket labelled `date`.
    pub fn estimate(&self, date: &str) -> Option<u64> {
        self.store.get(date).map(|state| state.sketch.cardinality())
    }

    /// Decode and handle one raw partial summary payload.
    pub fn handle_record(
        &mut self,
        payload: &[u8],
        now: Instant,
    ) -> Result<MergeOutcome, MergeError> {
        let summary = PartialSummary::from_slice(payload).map_err(|err| {
            self.stats.malformed += 1;
            MergeError::from(err)
        })?;
        self.handle_partial(&summary, now)
    }

    /// Apply one partial summary.
    pub fn handle_partial(
        &mut self,
        summary: &PartialSummary,
        now: Instant,
    ) -> Result<MergeOutcome, MergeError> {
        let Some(partition) = summary.partition else {
            self.stats.malformed += 1;
            return Err(MergeError::MissingPartition {
                date: summary.date.clone(),
            });
        };
        if let Some(shard) = self.policy.shard.filter(|shard| !shard.owns(&summary.date)) {
            self.stats.not_owned += 1;
            debug!(
                bucket = %summary.date,
                shard = shard.index,
                "skipping partial owned by another shard"
            );
            return Ok(MergeOutcome::NotOwned);
        }
        if self.closed.contains(&summary.date) {
            self.stats.stale += 1;
            debug!(bucket = %summary.date, partition, "skipping partial for emitted bucket");
            return Ok(MergeOutcome::AlreadyClosed);
        }

        if self
            .store
            .get(&summary.date)
            .is_some_and(|state| state.contributors.contains(&partition))
        {
            self.stats.duplicates += 1;
            debug!(bucket = %summary.date, partition, "ignoring redelivered partial");
            return Ok(MergeOutcome::Duplicate);
        }

        let sketch = S::decode(&summary.encoded_hll).map_err(|source| {
            self.stats.corrupt += 1;
            MergeError::CorruptSketch {
                date: summary.date.clone(),
                source,
            }
        })?;
        self.stats.partials += 1;

        let reports = match self.store.get_mut(&summary.date) {
            Some(state) => {
                state.apply(partition, &sketch, now);
                if summary.bucket.is_some() {
                    state.bucket = summary.bucket;
                }
                state.reports()
            }
            None => self
                .store
                .insert(summary.date.clone(), summary.bucket, partition, sketch, now)
                .reports(),
        };

        let expected = self.policy.expected_partitions;
        if reports < expected {
            return Ok(MergeOutcome::Pending { reports, expected });
        }
        match self.store.remove(&summary.date) {
            Some(state) => Ok(MergeOutcome::Completed(self.emit(state, false))),
            None => Ok(MergeOutcome::Pending { reports, expected }),
        }
    }

    /// Emit every bucket that has not received a report for the idle timeout.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<FinalSummary> {
        let mut idle: Vec<MergeState<S>> = self
            .store
            .idle_since(now, self.policy.idle_timeout)
            .iter()
            .filter_map(|date| self.store.remove(date))
            .collect();
        idle.sort_by(|a, b| (a.bucket, &a.date).cmp(&(b.bucket, &b.date)));
        idle.into_iter().map(|state| self.emit(state, true)).collect()
    }

    /// Emit every pending bucket. Used on stream end and on stop.
    pub fn flush(&mut self) -> Vec<FinalSummary> {
        let summaries: Vec<FinalSummary> = self
            .store
            .drain_ordered()
            .into_iter()
            .map(|state| {
                let degraded = state.reports() < self.policy.expected_partitions;
                self.emit(state, degraded)
            })
            .collect();
        if !summaries.is_empty() {
            info!(buckets = summaries.len(), "flushed pending buckets");
        }
        summaries
    }

    fn emit(&mut self, state: MergeState<S>, degraded: bool) -> FinalSummary {
        let reports = state.reports();
        let expected = self.policy.expected_partitions;
        let count = state.sketch.cardinality();
        if degraded {
            self.stats.degraded += 1;
            warn!(bucket = %state.date, reports, expected, count, "emitting degraded summary");
        } else {
            self.stats.completed += 1;
            debug!(bucket = %state.date, reports, count, "bucket complete");
        }
        self.closed.insert(state.date.clone());
        FinalSummary {
            date: state.date,
            count,
            degraded,
            reports: Some(reports),
            expected: Some(expected),
        }
    }
}
