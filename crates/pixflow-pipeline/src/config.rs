//! Configuration management
//!
//! Values come from the environment (optionally seeded by a `.env` file) with
//! the defaults below; the CLI applies its overrides on top and calls
//! [`PipelineConfig::validate`] once everything is merged.

use crate::storage::config::StorageConfig;
use anyhow::Context;
use pixflow_common::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default directory for downloaded and converted files.
pub const DEFAULT_OUTPUT_DIR: &str = "./data";

/// Default number of download retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first download retry, in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

/// Default growth factor between consecutive retry delays.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Default ceiling for a single retry delay, in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default number of worker lanes per stage.
pub const DEFAULT_WORKERS: usize = 4;

/// Default partition count for in-memory topics.
pub const DEFAULT_PARTITIONS: u32 = 4;

/// Default metrics/health port (0 disables the endpoint).
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Default number of report rows between forced flushes.
pub const DEFAULT_FLUSH_EVERY: usize = 10;

/// Default interval between periodic report flushes, in seconds.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

/// Default prefix for consumer group names.
pub const DEFAULT_GROUP_PREFIX: &str = "pixflow";

/// Default grayscale program (ImageMagick).
pub const DEFAULT_TRANSFORM_PROGRAM: &str = "convert";

/// Default grayscale program arguments.
pub const DEFAULT_TRANSFORM_ARGS: &str = "{input} -colorspace Gray {output}";

/// Transform program name selecting the pure-Rust grayscale implementation.
pub const BUILTIN_TRANSFORM: &str = "builtin";

/// Broker implementation backing the topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Memory,
    Kafka,
}

impl FromStr for BrokerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(BrokerBackend::Memory),
            "kafka" => Ok(BrokerBackend::Kafka),
            _ => Err(anyhow::anyhow!("Invalid broker backend: {}", s)),
        }
    }
}

impl std::fmt::Display for BrokerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerBackend::Memory => write!(f, "memory"),
            BrokerBackend::Kafka => write!(f, "kafka"),
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// Bootstrap endpoints (Kafka backend)
    pub brokers: Vec<String>,
    pub group_prefix: String,
    pub partitions: u32,
}

impl BrokerConfig {
    /// Consumer group used by a stage
    pub fn group_for(&self, stage: Stage) -> String {
        format!("{}-{}", self.group_prefix, stage)
    }
}

/// Logical topic names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicConfig {
    pub ingest: String,
    pub downloaded: String,
    pub converted: String,
    pub uploaded: String,
    pub errors: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            ingest: "ingest".to_string(),
            downloaded: "downloaded".to_string(),
            converted: "converted".to_string(),
            uploaded: "uploaded".to_string(),
            errors: "errors".to_string(),
        }
    }
}

impl TopicConfig {
    pub fn all(&self) -> [&str; 5] {
        [
            &self.ingest,
            &self.downloaded,
            &self.converted,
            &self.uploaded,
            &self.errors,
        ]
    }
}

/// Download retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

/// External grayscale command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformConfig {
    /// Program to run, or [`BUILTIN_TRANSFORM`]
    pub program: String,
    /// Arguments; `{input}` and `{output}` are substituted per item
    pub args: Vec<String>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_TRANSFORM_PROGRAM.to_string(),
            args: split_args(DEFAULT_TRANSFORM_ARGS),
        }
    }
}

impl TransformConfig {
    pub fn is_builtin(&self) -> bool {
        self.program == BUILTIN_TRANSFORM
    }
}

fn split_args(args: &str) -> Vec<String> {
    args.split_whitespace().map(str::to_string).collect()
}

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub output_dir: PathBuf,
    pub retry: RetryConfig,
    pub http_timeout_secs: u64,
    pub workers: usize,
    pub metrics_port: u16,
    pub flush_every: usize,
    pub flush_interval_secs: u64,
    pub transform: TransformConfig,
    pub storage: StorageConfig,
    /// Persist seen URLs here to suppress duplicates across Reader restarts
    pub dedup_store: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                backend: BrokerBackend::Memory,
                brokers: vec!["localhost:9092".to_string()],
                group_prefix: DEFAULT_GROUP_PREFIX.to_string(),
                partitions: DEFAULT_PARTITIONS,
            },
            topics: TopicConfig::default(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            retry: RetryConfig::default(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            workers: DEFAULT_WORKERS,
            metrics_port: DEFAULT_METRICS_PORT,
            flush_every: DEFAULT_FLUSH_EVERY,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            transform: TransformConfig::default(),
            storage: StorageConfig::default(),
            dedup_store: None,
        }
    }
}

/// Parse an environment variable, keeping `default` when it is unset
fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", raw, key, e)),
        Err(_) => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl PipelineConfig {
    /// Load configuration from `.env`, environment and defaults, then validate
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from the environment without validating it
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let topics = TopicConfig::default();

        Ok(Self {
            broker: BrokerConfig {
                backend: env_parse("PIXFLOW_BROKER_BACKEND", defaults.broker.backend)?,
                brokers: std::env::var("PIXFLOW_BROKERS")
                    .map(|list| parse_list(&list))
                    .unwrap_or(defaults.broker.brokers),
                group_prefix: env_string("PIXFLOW_GROUP_PREFIX", DEFAULT_GROUP_PREFIX),
                partitions: env_parse("PIXFLOW_PARTITIONS", DEFAULT_PARTITIONS)?,
            },
            topics: TopicConfig {
                ingest: env_string("PIXFLOW_TOPIC_INGEST", &topics.ingest),
                downloaded: env_string("PIXFLOW_TOPIC_DOWNLOADED", &topics.downloaded),
                converted: env_string("PIXFLOW_TOPIC_CONVERTED", &topics.converted),
                uploaded: env_string("PIXFLOW_TOPIC_UPLOADED", &topics.uploaded),
                errors: env_string("PIXFLOW_TOPIC_ERRORS", &topics.errors),
            },
            output_dir: PathBuf::from(env_string("PIXFLOW_OUTPUT_DIR", DEFAULT_OUTPUT_DIR)),
            retry: RetryConfig {
                max_retries: env_parse("PIXFLOW_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
                base_delay_ms: env_parse("PIXFLOW_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?,
                multiplier: env_parse("PIXFLOW_RETRY_MULTIPLIER", DEFAULT_RETRY_MULTIPLIER)?,
                max_delay_ms: env_parse("PIXFLOW_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS)?,
            },
            http_timeout_secs: env_parse("PIXFLOW_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?,
            workers: env_parse("PIXFLOW_WORKERS", DEFAULT_WORKERS)?,
            metrics_port: env_parse("PIXFLOW_METRICS_PORT", DEFAULT_METRICS_PORT)?,
            flush_every: env_parse("PIXFLOW_FLUSH_EVERY", DEFAULT_FLUSH_EVERY)?,
            flush_interval_secs: env_parse("PIXFLOW_FLUSH_INTERVAL_SECS", DEFAULT_FLUSH_INTERVAL_SECS)?,
            transform: TransformConfig {
                program: env_string("PIXFLOW_TRANSFORM_PROGRAM", DEFAULT_TRANSFORM_PROGRAM),
                args: split_args(&env_string("PIXFLOW_TRANSFORM_ARGS", DEFAULT_TRANSFORM_ARGS)),
            },
            storage: StorageConfig::from_env().context("Failed to load storage configuration")?,
            dedup_store: std::env::var("PIXFLOW_DEDUP_STORE").ok().map(PathBuf::from),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("Worker count must be greater than 0");
        }

        if self.broker.partitions == 0 {
            anyhow::bail!("Partition count must be greater than 0");
        }

        if self.broker.backend == BrokerBackend::Kafka && self.broker.brokers.is_empty() {
            anyhow::bail!("Kafka backend requires at least one broker endpoint");
        }

        if self.broker.group_prefix.is_empty() {
            anyhow::bail!("Consumer group prefix cannot be empty");
        }

        let names = self.topics.all();
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                anyhow::bail!("Topic names cannot be empty");
            }
            if names[..i].contains(name) {
                anyhow::bail!("Topic '{}' is configured for more than one stream", name);
            }
        }

        if !(self.retry.multiplier >= 1.0) {
            anyhow::bail!(
                "Retry multiplier must be at least 1.0 (got {})",
                self.retry.multiplier
            );
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!(
                "Retry max delay ({}ms) cannot be smaller than the base delay ({}ms)",
                self.retry.max_delay_ms,
                self.retry.base_delay_ms
            );
        }

        if self.http_timeout_secs == 0 {
            anyhow::bail!("HTTP timeout must be greater than 0");
        }

        if self.flush_every == 0 {
            anyhow::bail!("Flush row count must be greater than 0");
        }

        if self.transform.program.trim().is_empty() {
            anyhow::bail!("Transform program cannot be empty");
        }

        self.storage.validate()?;

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.transform.args, vec!["{input}", "-colorspace", "Gray", "{output}"]);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = PipelineConfig {
            workers: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_topics() {
        let mut config = PipelineConfig::default();
        config.topics.errors = config.topics.uploaded.clone();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than one stream"));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let mut config = PipelineConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        config.retry.multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_kafka_brokers() {
        let mut config = PipelineConfig::default();
        config.broker.backend = BrokerBackend::Kafka;
        config.broker.brokers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_group_names() {
        let config = PipelineConfig::default();
        assert_eq!(config.broker.group_for(Stage::Downloader), "pixflow-downloader");
    }

    #[test]
    fn test_broker_backend_from_str() {
        assert_eq!("Kafka".parse::<BrokerBackend>().unwrap(), BrokerBackend::Kafka);
        assert_eq!("memory".parse::<BrokerBackend>().unwrap(), BrokerBackend::Memory);
        assert!("redis".parse::<BrokerBackend>().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("PIXFLOW_MAX_RETRIES", "5");
        std::env::set_var("PIXFLOW_BROKERS", "kafka-1:9092, kafka-2:9092");
        std::env::set_var("PIXFLOW_TOPIC_ERRORS", "dead-letters");

        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.broker.brokers, vec!["kafka-1:9092", "kafka-2:9092"]);
        assert_eq!(config.topics.errors, "dead-letters");

        std::env::remove_var("PIXFLOW_MAX_RETRIES");
        std::env::remove_var("PIXFLOW_BROKERS");
        std::env::remove_var("PIXFLOW_TOPIC_ERRORS");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage_numbers() {
        std::env::set_var("PIXFLOW_WORKERS", "many");
        let result = PipelineConfig::from_env();
        std::env::remove_var("PIXFLOW_WORKERS");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("PIXFLOW_WORKERS"));
    }
}
