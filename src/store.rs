//! In-memory state stores owned by a single aggregator or merger instance.
//!
//! State lifecycle is explicit: an entry is inserted on the first contribution to a bucket and
//! removed when the bucket closes. Nothing here is shared between instances.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::bucket::BucketKey;
use crate::sketch::DistinctSketch;

/// Open bucket tracked by an aggregator.
#[derive(Debug)]
pub struct BucketState<S> {
    pub key: BucketKey,
    pub sketch: S,
    /// Largest event timestamp seen for this bucket.
    pub last_event_ts: i64,
    pub events: u64,
}

impl<S: DistinctSketch> BucketState<S> {
    fn open(key: BucketKey, timestamp: i64) -> Self {
        Self {
            key,
            sketch: S::empty(),
            last_event_ts: timestamp,
            events: 0,
        }
    }

    /// Fold one identifier into the bucket.
    pub fn observe(&mut self, timestamp: i64, identifier: &str) {
        self.sketch.add(identifier);
        self.events += 1;
        if timestamp > self.last_event_ts {
            self.last_event_ts = timestamp;
        }
    }
}

/// Open buckets of one aggregator, ordered chronologically by key.
#[derive(Debug)]
pub struct BucketStore<S> {
    open: BTreeMap<BucketKey, BucketState<S>>,
}

impl<S> Default for BucketStore<S> {
    fn default() -> Self {
        Self {
            open: BTreeMap::new(),
        }
    }
}

impl<S: DistinctSketch> BucketStore<S> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn get_mut(&mut self, key: BucketKey) -> Option<&mut BucketState<S>> {
        self.open.get_mut(&key)
    }

    /// Start tracking `key`. An already open bucket is returned unchanged.
    pub fn open(&mut self, key: BucketKey, timestamp: i64) -> &mut BucketState<S> {
        self.open
            .entry(key)
            .or_insert_with(|| BucketState::open(key, timestamp))
    }

    /// Chronologically earliest open key.
    pub fn oldest_key(&self) -> Option<BucketKey> {
        self.open.keys().next().copied()
    }

    /// The two chronologically earliest open buckets.
    pub fn oldest_pair(&self) -> Option<(&BucketState<S>, &BucketState<S>)> {
        let mut states = self.open.values();
        Some((states.next()?, states.next()?))
    }

    pub fn pop_oldest(&mut self) -> Option<BucketState<S>> {
        self.open.pop_first().map(|(_, state)| state)
    }

    /// Open keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = BucketKey> + '_ {
        self.open.keys().copied()
    }
}

/// Bucket being reconciled by a merger.
#[derive(Debug)]
pub struct MergeState<S> {
    pub date: String,
    pub bucket: Option<i64>,
    pub sketch: S,
    /// Partitions already applied.
    pub contributors: BTreeSet<u32>,
    pub last_update: Instant,
}

impl<S: DistinctSketch> MergeState<S> {
    #[inline]
    pub fn reports(&self) -> u32 {
        self.contributors.len() as u32
    }

    /// Union `sketch` into the bucket. Returns `false` when `partition` was already applied.
    pub fn apply(&mut self, partition: u32, sketch: &S, now: Instant) -> bool {
        if !self.contributors.insert(partition) {
            return false;
        }
        self.sketch.union(sketch);
        self.last_update = now;
        true
    }
}

/// Buckets currently being merged, keyed by their `Date` label.
#[derive(Debug)]
pub struct MergeStore<S> {
    states: HashMap<String, MergeState<S>>,
}

impl<S> Default for MergeStore<S> {
    fn default() -> Self {
        Self {
            states: HashMap::new(),
        }
    }
}

impl<S: DistinctSketch> MergeStore<S> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, date: &str) -> Option<&MergeState<S>> {
        self.states.get(date)
    }

    pub fn get_mut(&mut self, date: &str) -> Option<&mut MergeState<S>> {
        self.states.get_mut(date)
    }

    /// Start tracking a bucket from its first contribution.
    pub fn insert(
        &mut self,
        date: String,
        bucket: Option<i64>,
        partition: u32,
        sketch: S,
        now: Instant,
    ) -> &mut MergeState<S> {
        self.states.entry(date.clone()).or_insert(MergeState {
            date,
            bucket,
            sketch,
            contributors: BTreeSet::from([partition]),
            last_update: now,
        })
    }

    pub fn remove(&mut self, date: &str) -> Option<MergeState<S>> {
        self.states.remove(date)
    }

    /// Labels of buckets not updated for at least `timeout`.
    pub fn idle_since(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.states
            .values()
            .filter(|state| now.saturating_duration_since(state.last_update) >= timeout)
            .map(|state| state.date.clone())
            .collect()
    }

    /// Remove every bucket, chronologically where ordinals are known, then by label.
    pub fn drain_ordered(&mut self) -> Vec<MergeState<S>> {
        let mut states: Vec<MergeState<S>> = self.states.drain().map(|(_, state)| state).collect();
        states.sort_by(|a, b| (a.bucket, &a.date).cmp(&(b.bucket, &b.date)));
        states
    }
}

/// Bounded memory of recently closed bucket labels, oldest forgotten first.
#[derive(Debug)]
pub struct RecentlyClosed {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentlyClosed {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, date: &str) -> bool {
        self.members.contains(date)
    }

    pub fn insert(&mut self, date: String) {
        if self.capacity == 0 || self.members.contains(&date) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.members.insert(date.clone());
        self.order.push_back(date);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
