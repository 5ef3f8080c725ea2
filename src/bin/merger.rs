//! Merger: unions partial summaries from every partition into final per-bucket counts.

use std::path::PathBuf;
use std::process::ExitCode;

use cardinality_aggregator::config::{ConfigError, MergerConfig, MergerSettings};
use cardinality_aggregator::runtime::{
    error_chain, init_tracing, run_merger, stop_on_ctrl_c, RuntimeError,
};
use cardinality_aggregator::transport::{LineSource, OutputSink};
use cardinality_aggregator::{HllSketch, Merger};
use clap::Parser;
use tracing::{error, info};

/// Partial summary merger
#[derive(Parser, Debug)]
#[command(name = "merger", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "configMerger.yml")]
    config: PathBuf,

    /// Partial summary stream, `-` for stdin. Overrides `inputTopic`.
    #[arg(long)]
    input: Option<String>,

    /// Final summary stream, `-` for stdout. Overrides `outputTopic`.
    #[arg(long)]
    output: Option<String>,

    /// Log level filter, `RUST_LOG` wins when set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load(args: &Args) -> Result<MergerSettings, ConfigError> {
    let config = MergerConfig::from_file(&args.config)?;
    info!(
        config = %args.config.display(),
        bootstrap_servers = config.stream.bootstrap_servers.as_deref().unwrap_or("-"),
        group_id = config.stream.group_id.as_deref().unwrap_or("-"),
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

fn run(settings: MergerSettings) -> Result<(), RuntimeError> {
    let policy = settings.policy;
    info!(
        expected_partitions = policy.expected_partitions,
        idle_timeout_secs = policy.idle_timeout.as_secs(),
        closed_key_memory = policy.closed_key_memory,
        shard = ?policy.shard,
        input = %settings.input,
        output = %settings.output,
        "starting merger"
    );
    let stop = stop_on_ctrl_c()?;
    let mut source = LineSource::open(&settings.input)?;
    let mut sink = OutputSink::open(&settings.output)?;
    let mut merger = Merger::<HllSketch>::new(policy);
    run_merger(&mut merger, &mut source, &mut sink, settings.run, &stop)?;
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
            error!(error = %error_chain(&err), "merger failed");
            ExitCode::FAILURE
        }
    }
}
