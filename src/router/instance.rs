//! Backend instance state and derived health scoring

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Observed health of a backend instance. Updated by the health-check loop
/// and by dispatch outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Degraded,
    Down,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Down => "down",
            InstanceStatus::Unknown => "unknown",
        }
    }
}

/// One backend deployment with its health and performance bookkeeping.
#[derive(Debug, Clone)]
pub struct BackendInstance {
    pub url: String,
    pub name: String,
    /// Lower number wins when health scores tie.
    pub priority: u32,
    pub status: InstanceStatus,
    pub last_check: Option<DateTime<Utc>>,
    /// Most recent health-check round trip, in seconds.
    pub response_time: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl BackendInstance {
    pub fn new(url: &str, name: &str, priority: u32) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            priority,
            status: InstanceStatus::Unknown,
            last_check: None,
            response_time: 0.0,
            success_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    /// Fitness score in [0, 1], recomputed on demand and never stored.
    ///
    /// Starts from a status base and subtracts capped penalties for slow
    /// responses, error rate, and consecutive failures. Down always scores
    /// zero.
    pub fn health_score(&self) -> f64 {
        if self.status == InstanceStatus::Down {
            return 0.0;
        }

        let base = match self.status {
            InstanceStatus::Healthy => 1.0,
            InstanceStatus::Degraded => 0.6,
            InstanceStatus::Unknown => 0.3,
            InstanceStatus::Down => 0.0,
        };

        let time_penalty = (self.response_time / 10.0).min(0.3);

        let total = self.success_count + self.error_count;
        let error_penalty = if total > 0 {
            (self.error_count as f64 / total as f64) * 0.4
        } else {
            0.0
        };

        let failure_penalty = (f64::from(self.consecutive_failures) * 0.1).min(0.5);

        (base - time_penalty - error_penalty - failure_penalty).clamp(0.0, 1.0)
    }

    pub(crate) fn record_success(&mut self) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, error: String) {
        self.error_count += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error);
    }

    pub(crate) fn report(&self) -> InstanceReport {
        InstanceReport {
            name: self.name.clone(),
            url: self.url.clone(),
            status: self.status,
            health_score: self.health_score(),
            priority: self.priority,
            response_time: self.response_time,
            success_count: self.success_count,
            error_count: self.error_count,
            consecutive_failures: self.consecutive_failures,
            last_check: self.last_check,
            last_error: self.last_error.clone(),
        }
    }
}

/// Serialized per-instance snapshot for observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub name: String,
    pub url: String,
    pub status: InstanceStatus,
    pub health_score: f64,
    pub priority: u32,
    pub response_time: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
