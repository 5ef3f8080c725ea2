//! Processing loops driving an [`Aggregator`] or a [`Merger`] from a record source to a sink.
//!
//! Both loops stop when the source closes or the stop flag is raised, then flush every bucket
//! still held in memory before returning.

use std::error::Error as StdError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::aggregator::{Aggregator, AggregatorStats, ClosedBucket};
use crate::merger::{MergeOutcome, Merger, MergerStats};
use crate::record::{FinalSummary, PartialSummary, RecordError};
use crate::sketch::{DistinctSketch, SketchError};
use crate::transport::{
    send_with_retry, Polled, RecordSink, RecordSource, RetryPolicy, TransportError,
};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// What an aggregator emits for a closed bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Serialized sketch for a downstream merger.
    #[default]
    Partial,
    /// Final count; the aggregator owns the whole stream.
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub read_timeout: Duration,
    pub retry: RetryPolicy,
    /// Partition stamped on emitted partial summaries.
    pub partition: Option<u32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            retry: RetryPolicy::default(),
            partition: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to open stream")]
    Open(#[from] io::Error),
    #[error("failed to read from source")]
    Source(#[source] TransportError),
    #[error("failed to deliver summary for bucket '{date}'")]
    Send {
        date: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to encode sketch for bucket '{date}'")]
    EncodeSketch {
        date: String,
        #[source]
        source: SketchError,
    },
    #[error("failed to encode summary for bucket '{date}'")]
    EncodeSummary {
        date: String,
        #[source]
        source: RecordError,
    },
}

/// Run `aggregator` until the source closes or `stop` is raised.
pub fn run_aggregator<S, Src, Snk>(
    aggregator: &mut Aggregator<S>,
    source: &mut Src,
    sink: &mut Snk,
    mode: OutputMode,
    options: RunOptions,
    stop: &AtomicBool,
) -> Result<AggregatorStats, RuntimeError>
where
    S: DistinctSketch,
    Src: RecordSource + ?Sized,
    Snk: RecordSink + ?Sized,
{
    while !stop.load(Ordering::Relaxed) {
        match source.poll(options.read_timeout).map_err(RuntimeError::Source)? {
            Polled::Record(payload) => {
                for bucket in aggregator.handle_record(&payload) {
                    emit_bucket(sink, bucket, mode, options)?;
                }
            }
            Polled::Idle => continue,
            Polled::Closed => {
                debug!("event stream closed");
                break;
            }
        }
    }

    for bucket in aggregator.flush() {
        emit_bucket(sink, bucket, mode, options)?;
    }
    let stats = aggregator.stats();
    info!(
        events = stats.events,
        late_dropped = stats.late_dropped,
        malformed = stats.malformed,
        buckets_opened = stats.buckets_opened,
        buckets_closed = stats.buckets_closed,
        forced_closures = stats.forced_closures,
        "aggregator stopped"
    );
    Ok(stats)
}

fn emit_bucket<S, Snk>(
    sink: &mut Snk,
    bucket: ClosedBucket<S>,
    mode: OutputMode,
    options: RunOptions,
) -> Result<(), RuntimeError>
where
    S: DistinctSketch,
    Snk: RecordSink + ?Sized,
{
    let payload = match mode {
        OutputMode::Partial => {
            let encoded_hll =
                bucket.sketch.encode().map_err(|source| RuntimeError::EncodeSketch {
                    date: bucket.label.clone(),
                    source,
                })?;
            PartialSummary {
                date: bucket.label.clone(),
                encoded_hll,
                partition: options.partition,
                bucket: Some(bucket.key.ordinal()),
            }
            .to_vec()
        }
        OutputMode::Final => {
            FinalSummary::standalone(bucket.label.clone(), bucket.sketch.cardinality()).to_vec()
        }
    }
    .map_err(|source| RuntimeError::EncodeSummary {
        date: bucket.label.clone(),
        source,
    })?;

    send_with_retry(sink, &payload, options.retry).map_err(|source| RuntimeError::Send {
        date: bucket.label,
        source,
    })
}

/// Run `merger` until the source closes or `stop` is raised.
///
/// Idle buckets are evicted after every record and on every read timeout.
pub fn run_merger<S, Src, Snk>(
    merger: &mut Merger<S>,
    source: &mut Src,
    sink: &mut Snk,
    options: RunOptions,
    stop: &AtomicBool,
) -> Result<MergerStats, RuntimeError>
where
    S: DistinctSketch,
    Src: RecordSource + ?Sized,
    Snk: RecordSink + ?Sized,
{
    while !stop.load(Ordering::Relaxed) {
        match source.poll(options.read_timeout).map_err(RuntimeError::Source)? {
            Polled::Record(payload) => match merger.handle_record(&payload, Instant::now()) {
                Ok(MergeOutcome::Completed(summary)) => {
                    emit_summary(sink, &summary, options.retry)?
                }
                Ok(_) => {}
                Err(err) => warn!(error = %error_chain(&err), "skipping partial"),
            },
            Polled::Idle => {}
            Polled::Closed => {
                debug!("partial stream closed");
                break;
            }
        }
        for summary in merger.evict_idle(Instant::now()) {
            emit_summary(sink, &summary, options.retry)?;
        }
    }

    for summary in merger.flush() {
        emit_summary(sink, &summary, options.retry)?;
    }
    let stats = merger.stats();
    info!(
        partials = stats.partials,
        completed = stats.completed,
        degraded = stats.degraded,
        duplicates = stats.duplicates,
        stale = stats.stale,
        corrupt = stats.corrupt,
        malformed = stats.malformed,
        not_owned = stats.not_owned,
        "merger stopped"
    );
    Ok(stats)
}

fn emit_summary<Snk>(
    sink: &mut Snk,
    summary: &FinalSummary,
    retry: RetryPolicy,
) -> Result<(), RuntimeError>
where
    Snk: RecordSink + ?Sized,
{
    let payload = summary.to_vec().map_err(|source| RuntimeError::EncodeSummary {
        date: summary.date.clone(),
        source,
    })?;
    send_with_retry(sink, &payload, retry).map_err(|source| RuntimeError::Send {
        date: summary.date.clone(),
        source,
    })
}

/// Render `err` followed by every source not already contained in the message.
pub fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_message = cause.to_string();
        if !message.contains(&cause_message) {
            message.push_str(": ");
            message.push_str(&cause_message);
        }
        source = cause.source();
    }
    message
}

/// Install the stderr log subscriber used by the binaries; stdout carries records.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

/// Raise the returned flag on the first Ctrl-C.
///
/// The signal is awaited on a current-thread tokio runtime owned by a helper thread; the
/// processing loops observe the flag between reads.
pub fn stop_on_ctrl_c() -> io::Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let flag = Arc::clone(&stop);
    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("received Ctrl-C, flushing and shutting down");
                        flag.store(true, Ordering::Relaxed);
                    }
                    Err(err) => warn!(error = %err, "failed to listen for Ctrl-C"),
                }
            })
        })?;
    Ok(stop)
}
