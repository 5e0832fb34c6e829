use std::time::Duration;

use serde::Deserialize;

use crate::services::detector::{ModelCatalog, RetryPolicy};
use crate::services::gateway::DEFAULT_MAX_UPLOAD_BYTES;
use crate::services::maintenance::ScalingThresholds;
use crate::services::queue::QueueSettings;
use crate::services::worker::PoolSettings;

/// Which collaborator implementations a process wires up.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Postgres, Redis and S3-compatible object storage.
    #[default]
    Remote,
    /// Everything in process. The gateway runs the worker pool itself.
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub storage_backend: StorageBackend,

    /// PostgreSQL connection string
    pub database_url: Option<String>,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Redis connection string for the work queue and job update channel
    pub redis_url: Option<String>,

    pub s3_bucket: Option<String>,
    pub s3_endpoint: Option<String>,
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,

    /// OpenAI-compatible API root, e.g. `https://openrouter.ai/api/v1`
    #[serde(default = "default_detector_base_url")]
    pub detector_base_url: String,
    pub detector_api_key: Option<String>,

    /// Comma-separated model names. The first is the default.
    #[serde(default = "default_detector_models")]
    pub detector_models: String,

    #[serde(default = "default_worker_min")]
    pub worker_min: usize,
    #[serde(default = "default_worker_max")]
    pub worker_max: usize,

    #[serde(default = "default_soft_deadline_secs")]
    pub soft_deadline_secs: u64,
    #[serde(default = "default_hard_deadline_secs")]
    pub hard_deadline_secs: u64,
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: u64,
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_detector_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_detector_models() -> String {
    "openai/gpt-4o".to_string()
}

fn default_worker_min() -> usize {
    2
}

fn default_worker_max() -> usize {
    20
}

fn default_soft_deadline_secs() -> u64 {
    240
}

fn default_hard_deadline_secs() -> u64 {
    300
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_retention_days() -> i64 {
    7
}

fn default_sweep_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_scale_up_threshold() -> u64 {
    100
}

fn default_scale_down_threshold() -> u64 {
    10
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_max_upload_bytes() -> usize {
    DEFAULT_MAX_UPLOAD_BYTES
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Soft and hard execution limits. The soft one is checked by the worker,
/// the hard one by the queue lease reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub soft: Duration,
    pub hard: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.soft_deadline_secs >= self.hard_deadline_secs {
            return Err(ConfigError::Invalid(format!(
                "SOFT_DEADLINE_SECS ({}) must be below HARD_DEADLINE_SECS ({})",
                self.soft_deadline_secs, self.hard_deadline_secs
            )));
        }
        if self.worker_min == 0 || self.worker_min > self.worker_max {
            return Err(ConfigError::Invalid(format!(
                "WORKER_MIN ({}) must be between 1 and WORKER_MAX ({})",
                self.worker_min, self.worker_max
            )));
        }
        if self.scale_down_threshold > self.scale_up_threshold {
            return Err(ConfigError::Invalid(
                "SCALE_DOWN_THRESHOLD must not exceed SCALE_UP_THRESHOLD".to_string(),
            ));
        }
        if self.model_catalog().default_model().is_none() {
            return Err(ConfigError::Missing("DETECTOR_MODELS"));
        }
        if self.database_max_connections == 0 {
            return Err(ConfigError::Invalid(
                "DATABASE_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        if self.max_deliveries == 0 {
            return Err(ConfigError::Invalid("MAX_DELIVERIES must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Fetch an optional setting that the current backend needs.
    pub fn require<'a>(
        &self,
        value: &'a Option<String>,
        name: &'static str,
    ) -> Result<&'a str, ConfigError> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(name))
    }

    pub fn model_catalog(&self) -> ModelCatalog {
        ModelCatalog::new(self.detector_models.split(','))
    }

    pub fn deadlines(&self) -> Deadlines {
        Deadlines {
            soft: Duration::from_secs(self.soft_deadline_secs),
            hard: Duration::from_secs(self.hard_deadline_secs),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            hard_deadline: self.deadlines().hard,
            max_deliveries: self.max_deliveries,
        }
    }

    /// Each worker process runs `WORKER_MIN` concurrent executions; scaling
    /// beyond that is done by adding processes.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            concurrency: self.worker_min,
            soft_deadline: self.deadlines().soft,
            retry: RetryPolicy::default(),
            ..PoolSettings::default()
        }
    }

    pub fn scaling_thresholds(&self) -> ScalingThresholds {
        ScalingThresholds {
            scale_up_depth: self.scale_up_threshold,
            scale_down_depth: self.scale_down_threshold,
            min_workers: self.worker_min,
            max_workers: self.worker_max,
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}
