//! Per-partition aggregator: reads JSON-lines events, writes one summary per closed bucket.

use std::path::PathBuf;
use std::process::ExitCode;

use cardinality_aggregator::config::{AggregatorConfig, AggregatorSettings, ConfigError};
use cardinality_aggregator::runtime::{
    error_chain, init_tracing, run_aggregator, stop_on_ctrl_c, RuntimeError,
};
use cardinality_aggregator::transport::{LineSource, OutputSink};
use cardinality_aggregator::{Aggregator, HllSketch};
use clap::Parser;
use tracing::{error, info};

/// Streaming distinct-count aggregator
#[derive(Parser, Debug)]
#[command(name = "aggregator", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Event stream, `-` for stdin. Overrides `inputTopic`.
    #[arg(long)]
    input: Option<String>,

    /// Summary stream, `-` for stdout. Overrides `outputTopic`.
    #[arg(long)]
    output: Option<String>,

    /// Partition stamped on partial summaries. Overrides `partition`.
    #[arg(long)]
    partition: Option<u32>,

    /// Log level filter, `RUST_LOG` wins when set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load(args: &Args) -> Result<AggregatorSettings, ConfigError> {
    let mut config = AggregatorConfig::from_file(&args.config)?;
    if args.partition.is_some() {
        config.partition = args.partition;
    }
    info!(
        config = %args.config.display(),
        bootstrap_servers = config.stream.bootstrap_servers.as_deref().unwrap_or("-"),
        group_id = config.stream.group_id.as_deref().unwrap_or("-"),
        auto_offset_reset = %config.stream.auto_offset_reset,
        "loaded configuration"
    );
    let mut settings = config.validate()?;
    if let Some(input) = &args.input {
        settings.input.clone_from(input);
    }
    if let Some(output) = &args.output {
        settings.output.clone_from(output);
    }
    Ok(settings)
}

fn run(settings: AggregatorSettings) -> Result<(), RuntimeError> {
    info!(
        interval = %settings.granularity,
        mode = ?settings.mode,
        partition = ?settings.run.partition,
        open_threshold = settings.watermark.open_threshold,
        lateness_secs = settings.watermark.lateness_secs,
        max_open_buckets = settings.watermark.max_open_buckets,
        input = %settings.input,
        output = %settings.output,
        "starting aggregator"
    );
    let stop = stop_on_ctrl_c()?;
    let mut source = LineSource::open(&settings.input)?;
    let mut sink = OutputSink::open(&settings.output)?;
    let mut aggregator = Aggregator::<HllSketch>::new(settings.granularity, settings.watermark);
    run_aggregator(
        &mut aggregator,
        &mut source,
        &mut sink,
        settings.mode,
        settings.run,
        &stop,
    )?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let settings = match load(&args) {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %error_chain(&err), "invalid configuration");
            return ExitCode::from(2);
        }
    };
    match run(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %error_chain(&err), "aggregator failed");
            ExitCode::FAILURE
        }
    }
}
