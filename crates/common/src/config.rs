//! Configuration structures for RingBatch
//!
//! This module defines the immutable configuration handed to every scheduler
//! component at construction. Configurations are loaded from YAML files and
//! can be overridden by `RINGBATCH__SECTION__KEY` environment variables.

use crate::error::{RingBatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "RINGBATCH";

/// Separator between prefix, section and key in environment overrides
pub const ENV_SEPARATOR: &str = "__";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RingBatchConfig {
    /// Batching and queue routing
    pub scheduler: SchedulerConfig,

    /// Admission limits
    pub admission: AdmissionConfig,

    /// Worker shard pool
    pub workers: WorkerPoolConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Batch assembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Token budget per batch; the primary batching constraint
    pub max_batch_tokens: usize,

    /// Member cap per batch; secondary to the token budget
    pub max_batch_size: usize,

    /// Number of ring shards (independent priority queues)
    pub num_shards: usize,

    /// Initial idle backoff of an assembler loop
    pub backoff_ms: u64,

    /// Ceiling for the idle backoff
    pub max_backoff_ms: u64,

    /// How a request's cost against the token budget is computed
    pub cost_model: CostModel,

    /// What a request is hashed on to pick its ring shard
    pub shard_key: ShardKeyPolicy,
}

/// Cost of a request against the batch token budget
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CostModel {
    /// Prompt length only
    PromptOnly,

    /// Prompt length plus `max_tokens`
    PromptPlusGeneration,
}

impl Default for CostModel {
    fn default() -> Self {
        CostModel::PromptPlusGeneration
    }
}

/// Shard routing key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShardKeyPolicy {
    /// Spread requests by id
    RequestId,

    /// Co-locate requests with identical sampling settings
    SamplingParams,
}

impl Default for ShardKeyPolicy {
    fn default() -> Self {
        ShardKeyPolicy::RequestId
    }
}

/// Admission-time limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Prompt length plus `max_tokens` may not exceed this
    pub max_seq_len: usize,

    /// Maximum completions per request
    pub max_n: u32,

    /// Per-shard queue depth ceiling (None = unbounded)
    pub max_queue_depth: Option<usize>,
}

/// Worker shard pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker shards executing batches
    pub num_workers: usize,

    /// Model-parallel degree inside each worker shard
    pub model_parallel: usize,

    /// Per-token latency of the simulated backend
    pub simulated_ms_per_token: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Emit JSON log lines
    #[serde(default = "default_structured_logging")]
    pub structured_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_tokens: 4096,
            max_batch_size: 2048,
            num_shards: 4,
            backoff_ms: 20,
            max_backoff_ms: 100,
            cost_model: CostModel::default(),
            shard_key: ShardKeyPolicy::default(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_seq_len: 2048,
            max_n: 16,
            max_queue_depth: Some(4096),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            model_parallel: 1,
            simulated_ms_per_token: 0,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: default_structured_logging(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

fn default_structured_logging() -> bool {
    false
}

impl SchedulerConfig {
    /// Initial assembler backoff as Duration
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Assembler backoff ceiling as Duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl RingBatchConfig {
    /// Load configuration from a YAML file, with environment overrides on top
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path.to_str().ok_or_else(|| {
            RingBatchError::config(format!("Config path is not UTF-8: {}", path.display()))
        })?;

        let config: RingBatchConfig = config::Config::builder()
            .add_source(config::File::new(name, config::FileFormat::Yaml))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults and environment variables
    pub fn from_env() -> Result<Self> {
        let config: RingBatchConfig = config::Config::builder()
            .add_source(env_source())
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: RingBatchConfig = serde_yaml::from_str(content)
            .map_err(|e| RingBatchError::config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.max_batch_tokens == 0 {
            return Err(RingBatchError::config("max_batch_tokens must be positive"));
        }
        if scheduler.max_batch_size == 0 {
            return Err(RingBatchError::config("max_batch_size must be positive"));
        }
        if scheduler.num_shards == 0 {
            return Err(RingBatchError::config("num_shards must be positive"));
        }
        if scheduler.backoff_ms == 0 || scheduler.backoff_ms > scheduler.max_backoff_ms {
            return Err(RingBatchError::config(format!(
                "backoff_ms ({}) must be positive and at most max_backoff_ms ({})",
                scheduler.backoff_ms, scheduler.max_backoff_ms
            )));
        }
        if self.workers.num_workers == 0 {
            return Err(RingBatchError::config("num_workers must be positive"));
        }
        if self.admission.max_n == 0 {
            return Err(RingBatchError::config("max_n must be positive"));
        }
        if self.admission.max_queue_depth == Some(0) {
            return Err(RingBatchError::config(
                "max_queue_depth must be positive when set",
            ));
        }
        Ok(())
    }

    /// Observability settings, falling back to defaults
    pub fn observability(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = RingBatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.max_batch_tokens, 4096);
        assert_eq!(config.scheduler.max_batch_size, 2048);
        assert_eq!(config.admission.max_seq_len, 2048);
        assert_eq!(config.admission.max_n, 16);
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = RingBatchConfig::from_yaml_str(
            r#"
scheduler:
  max_batch_tokens: 10
  max_batch_size: 3
  num_shards: 1
  cost_model: prompt_only
  shard_key: sampling_params
workers:
  num_workers: 8
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_batch_tokens, 10);
        assert_eq!(config.scheduler.max_batch_size, 3);
        assert_eq!(config.scheduler.cost_model, CostModel::PromptOnly);
        assert_eq!(config.scheduler.shard_key, ShardKeyPolicy::SamplingParams);
        assert_eq!(config.scheduler.backoff_ms, 20);
        assert_eq!(config.workers.num_workers, 8);
        assert_eq!(config.admission.max_queue_depth, Some(4096));
    }

    #[test]
    fn test_config_validation() {
        let mut config = RingBatchConfig::default();
        config.scheduler.num_shards = 0;
        assert!(config.validate().is_err());

        let mut config = RingBatchConfig::default();
        config.scheduler.backoff_ms = 500;
        assert!(config.validate().is_err());

        let mut config = RingBatchConfig::default();
        config.workers.num_workers = 0;
        assert!(config.validate().is_err());

        let mut config = RingBatchConfig::default();
        config.admission.max_queue_depth = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "scheduler:\n  max_batch_tokens: 64\n  num_shards: 2\nadmission:\n  max_seq_len: 512"
        )
        .unwrap();

        std::env::set_var("RINGBATCH__ADMISSION__MAX_N", "4");
        let config = RingBatchConfig::from_file(file.path()).unwrap();
        std::env::remove_var("RINGBATCH__ADMISSION__MAX_N");

        assert_eq!(config.scheduler.max_batch_tokens, 64);
        assert_eq!(config.scheduler.num_shards, 2);
        assert_eq!(config.admission.max_seq_len, 512);
        assert_eq!(config.admission.max_n, 4);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(RingBatchConfig::from_file("/nonexistent/ringbatch.yaml").is_err());
    }
}
