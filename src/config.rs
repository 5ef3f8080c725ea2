//! YAML configuration of the `aggregator` and `merger` binaries.
//!
//! Both files share the stream keys (`inputTopic`, `outputTopic`, `readTimeout`, `interval`,
//! `bootstrapServers`, `groupID`, `autoOffsetReset`). Parsing is lenient; [`validate`] turns a
//! parsed file into typed settings and is the only place invalid values are rejected.
//!
//! [`validate`]: AggregatorConfig::validate

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::{
    WatermarkPolicy, DEFAULT_LATENESS_SECS, DEFAULT_MAX_OPEN_BUCKETS, DEFAULT_OPEN_THRESHOLD,
};
use crate::bucket::{Granularity, UnknownGranularity};
use crate::merger::{MergePolicy, ShardAssignment, DEFAULT_CLOSED_KEY_MEMORY};
use crate::runtime::{OutputMode, RunOptions};
use crate::transport::{RetryPolicy, DEFAULT_RETRY_BACKOFF, DEFAULT_SEND_RETRIES, STDIO};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    UnknownGranularity(#[from] UnknownGranularity),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn default_read_timeout() -> u64 {
    1
}

fn default_offset_reset() -> String {
    "earliest".to_string()
}

fn default_send_retries() -> u32 {
    DEFAULT_SEND_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF.as_millis() as u64
}

/// Keys shared by both services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Input stream; `-` is stdin.
    #[serde(default)]
    pub input_topic: Option<String>,
    /// Output stream; `-` is stdout.
    #[serde(default)]
    pub output_topic: Option<String>,
    /// Seconds to wait for a record before treating the stream as idle.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub bootstrap_servers: Option<String>,
    #[serde(rename = "groupID", default)]
    pub group_id: Option<String>,
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: String,
}

impl StreamConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout == 0 {
            return Err(invalid("readTimeout", "must be at least one second"));
        }
        match self.auto_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(invalid(
                    "autoOffsetReset",
                    format!("expected earliest or latest, got '{other}'"),
                ))
            }
        }
        let topics = [("inputTopic", &self.input_topic), ("outputTopic", &self.output_topic)];
        for (field, value) in topics {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(invalid(field, "must not be empty"));
            }
        }
        Ok(())
    }

    fn retry(
        field: &'static str,
        send_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<RetryPolicy, ConfigError> {
        if send_retries == 0 {
            return Err(invalid(field, "at least one attempt is required"));
        }
        Ok(RetryPolicy {
            max_attempts: send_retries,
            backoff: Duration::from_millis(retry_backoff_ms),
        })
    }

    fn target(value: &Option<String>) -> String {
        value.clone().unwrap_or_else(|| STDIO.to_string())
    }
}

/// Contents of `config.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorConfig {
    #[serde(flatten)]
    pub stream: StreamConfig,
    /// Partition this instance consumes, stamped on partial summaries. Required when `emit` is
    /// `partial`.
    #[serde(default)]
    pub partition: Option<u32>,
    #[serde(default)]
    pub emit: OutputMode,
    #[serde(default)]
    pub open_threshold: Option<usize>,
    /// Seconds.
    #[serde(default)]
    pub lateness_tolerance: Option<i64>,
    #[serde(default)]
    pub max_open_buckets: Option<usize>,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Validated aggregator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorSettings {
    pub input: String,
    pub output: String,
    pub granularity: Granularity,
    pub watermark: WatermarkPolicy,
    pub mode: OutputMode,
    pub run: RunOptions,
}

impl AggregatorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<AggregatorSettings, ConfigError> {
        self.stream.validate()?;
        let granularity: Granularity = self
            .stream
            .interval
            .as_deref()
            .ok_or_else(|| invalid("interval", "is required"))?
            .parse()?;

        let watermark = WatermarkPolicy {
            open_threshold: self.open_threshold.unwrap_or(DEFAULT_OPEN_THRESHOLD),
            lateness_secs: self.lateness_tolerance.unwrap_or(DEFAULT_LATENESS_SECS),
            max_open_buckets: self.max_open_buckets.unwrap_or(DEFAULT_MAX_OPEN_BUCKETS),
        };
        if watermark.open_threshold == 0 {
            return Err(invalid("openThreshold", "must be at least 1"));
        }
        if watermark.lateness_secs <= 0 {
            return Err(invalid("latenessTolerance", "must be a positive number of seconds"));
        }
        if watermark.max_open_buckets <= watermark.open_threshold {
            return Err(invalid(
                "maxOpenBuckets",
                format!("must exceed openThreshold ({})", watermark.open_threshold),
            ));
        }

        let retry = StreamConfig::retry("sendRetries", self.send_retries, self.retry_backoff_ms)?;
        if self.emit == OutputMode::Partial && self.partition.is_none() {
            return Err(invalid("partition", "is required when emit is partial"));
        }

        Ok(AggregatorSettings {
            input: StreamConfig::target(&self.stream.input_topic),
            output: StreamConfig::target(&self.stream.output_topic),
            granularity,
            watermark,
            mode: self.emit,
            run: RunOptions {
                read_timeout: Duration::from_secs(self.stream.read_timeout),
                retry,
                partition: self.partition,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub index: u32,
    pub count: u32,
}

/// Contents of `configMerger.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergerConfig {
    #[serde(flatten)]
    pub stream: StreamConfig,
    #[serde(default, alias = "consumers")]
    pub expected_partitions: Option<u32>,
    /// Seconds.
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    #[serde(default)]
    pub closed_key_memory: Option<usize>,
    #[serde(default)]
    pub shard: Option<ShardConfig>,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Validated merger settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergerSettings {
    pub input: String,
    pub output: String,
    pub policy: MergePolicy,
    pub run: RunOptions,
}

impl MergerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<MergerSettings, ConfigError> {
        self.stream.validate()?;
        let expected_partitions = self
            .expected_partitions
            .ok_or_else(|| invalid("expectedPartitions", "is required"))?;
        if expected_partitions == 0 {
            return Err(invalid("expectedPartitions", "must be at least 1"));
        }

        let mut policy = MergePolicy::new(expected_partitions);
        if let Some(secs) = self.idle_timeout {
            if secs == 0 {
                return Err(invalid("idleTimeout", "must be at least one second"));
            }
            policy.idle_timeout = Duration::from_secs(secs);
        }
        policy.closed_key_memory = self.closed_key_memory.unwrap_or(DEFAULT_CLOSED_KEY_MEMORY);
        if let Some(ShardConfig { index, count }) = self.shard {
            if count == 0 || index >= count {
                return Err(invalid("shard", format!("index {index} is not below count {count}")));
            }
            policy.shard = Some(ShardAssignment { index, count });
        }

        let retry = StreamConfig::retry("sendRetries", self.send_retries, self.retry_backoff_ms)?;
        Ok(MergerSettings {
            input: StreamConfig::target(&self.stream.input_topic),
            output: StreamConfig::target(&self.stream.output_topic),
            policy,
            run: RunOptions {
                read_timeout: Duration::from_secs(self.stream.read_timeout),
                retry,
                partition: None,
            },
        })
    }
}
