//! Application settings and configuration management

use crate::error::{AdmissionError, Result};
use crate::limiter::TierLimits;
use crate::queue::{BackoffPolicy, QueueConfig, WorkerPoolConfig};
use crate::router::{BackendInstance, RouterConfig};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub limiter: LimiterSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub backoff: BackoffSettings,
    #[serde(default)]
    pub router: RouterSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Load monitor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorSettings {
    /// When disabled, components see a fixed zero load
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Load above which new work should be deferred
    #[serde(default = "default_throttle_threshold")]
    pub throttle_threshold: f64,
}

fn default_throttle_threshold() -> f64 {
    0.8
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            throttle_threshold: default_throttle_threshold(),
        }
    }
}

/// Per-tier rate limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierSettings {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    pub queue_priority: u8,
    pub grace_requests: u32,
}

impl From<&TierSettings> for TierLimits {
    fn from(value: &TierSettings) -> Self {
        TierLimits {
            per_minute: value.per_minute,
            per_hour: value.per_hour,
            per_day: value.per_day,
            queue_priority: value.queue_priority,
            grace_requests: value.grace_requests,
        }
    }
}

impl From<TierLimits> for TierSettings {
    fn from(value: TierLimits) -> Self {
        Self {
            per_minute: value.per_minute,
            per_hour: value.per_hour,
            per_day: value.per_day,
            queue_priority: value.queue_priority,
            grace_requests: value.grace_requests,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterSettings {
    #[serde(default = "default_anonymous_tier")]
    pub anonymous: TierSettings,
    #[serde(default = "default_registered_tier")]
    pub registered: TierSettings,
    #[serde(default = "default_donor_tier")]
    pub donor: TierSettings,
    /// Idle identities are evicted after this many hours
    #[serde(default = "default_bucket_retention")]
    pub bucket_retention_hours: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_anonymous_tier() -> TierSettings {
    TierLimits::anonymous().into()
}

fn default_registered_tier() -> TierSettings {
    TierLimits::registered().into()
}

fn default_donor_tier() -> TierSettings {
    TierLimits::donor().into()
}

fn default_bucket_retention() -> u64 {
    24
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            anonymous: default_anonymous_tier(),
            registered: default_registered_tier(),
            donor: default_donor_tier(),
            bucket_retention_hours: default_bucket_retention(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Request queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_processing_secs")]
    pub default_processing_secs: f64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_retention_hours() -> u64 {
    24
}

fn default_maintenance_interval() -> u64 {
    30
}

fn default_processing_secs() -> f64 {
    30.0
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retention_hours: default_retention_hours(),
            maintenance_interval_secs: default_maintenance_interval(),
            default_processing_secs: default_processing_secs(),
        }
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(value: &QueueSettings) -> Self {
        QueueConfig {
            max_concurrent: value.max_concurrent,
            retention: Duration::from_secs(value.retention_hours * 3600),
            maintenance_interval: Duration::from_secs(value.maintenance_interval_secs),
            default_processing_secs: value.default_processing_secs,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_idle_poll_ms() -> u64 {
    250
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl From<&WorkerSettings> for WorkerPoolConfig {
    fn from(value: &WorkerSettings) -> Self {
        WorkerPoolConfig {
            workers: value.count,
            idle_poll: Duration::from_millis(value.idle_poll_ms),
        }
    }
}

/// Retry backoff configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_max() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            max_secs: default_backoff_max(),
            jitter: true,
        }
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(value: &BackoffSettings) -> Self {
        BackoffPolicy::new(value.base_secs, value.max_secs, value.jitter)
    }
}

/// One backend instance entry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceSettings {
    pub url: String,
    pub name: String,
    #[serde(default = "default_instance_priority")]
    pub priority: u32,
}

fn default_instance_priority() -> u32 {
    1
}

/// Backend router configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterSettings {
    #[serde(default)]
    pub instances: Vec<InstanceSettings>,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_secs: default_health_check_timeout(),
            request_timeout_secs: default_request_timeout(),
            health_path: default_health_path(),
        }
    }
}

impl RouterSettings {
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            health_path: self.health_path.clone(),
        }
    }

    pub fn instances(&self) -> Vec<BackendInstance> {
        self.instances
            .iter()
            .map(|i| BackendInstance::new(&i.url, &i.name, i.priority))
            .collect()
    }
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/default.toml")
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(
                File::with_name(path.as_ref().to_str().unwrap_or("config/default"))
                    .required(false),
            )
            // Override with environment variables (prefixed with ADMISSION_)
            .add_source(
                Environment::with_prefix("ADMISSION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.monitor.throttle_threshold) {
            return Err(AdmissionError::Config(config::ConfigError::Message(
                "monitor.throttle_threshold must be within [0, 1]".to_string(),
            )));
        }

        for (name, tier) in [
            ("anonymous", &self.limiter.anonymous),
            ("registered", &self.limiter.registered),
            ("donor", &self.limiter.donor),
        ] {
            if tier.per_minute == 0 || tier.per_hour == 0 || tier.per_day == 0 {
                return Err(AdmissionError::Config(config::ConfigError::Message(
                    format!("Tier '{}' must have non-zero window limits", name),
                )));
            }
            if !(1..=3).contains(&tier.queue_priority) {
                return Err(AdmissionError::Config(config::ConfigError::Message(
                    format!("Tier '{}' queue_priority must be 1, 2 or 3", name),
                )));
            }
        }

        if self.queue.max_concurrent == 0 {
            return Err(AdmissionError::Config(config::ConfigError::Message(
                "queue.max_concurrent cannot be 0".to_string(),
            )));
        }

        if self.workers.count == 0 {
            return Err(AdmissionError::Config(config::ConfigError::Message(
                "workers.count cannot be 0".to_string(),
            )));
        }

        if self.backoff.base_secs > self.backoff.max_secs {
            return Err(AdmissionError::Config(config::ConfigError::Message(
                "backoff.base_secs cannot exceed backoff.max_secs".to_string(),
            )));
        }

        for instance in &self.router.instances {
            if instance.name.is_empty() {
                return Err(AdmissionError::Config(config::ConfigError::Message(
                    "Backend instance name cannot be empty".to_string(),
                )));
            }
            if !instance.url.starts_with("http://") && !instance.url.starts_with("https://") {
                return Err(AdmissionError::Config(config::ConfigError::Message(
                    format!(
                        "Backend instance '{}' has invalid url '{}'",
                        instance.name, instance.url
                    ),
                )));
            }
        }

        Ok(())
    }
}
