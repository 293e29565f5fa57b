//! Queued request data model

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::limiter::UserTier;

/// Lifecycle state of a queued request. Transitions are strictly forward:
/// Queued -> Processing -> Completed | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// Processing priority lane. Declaration order is service order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Lanes in the order they are drained.
    pub const ORDER: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn from_tier(tier: UserTier) -> Self {
        match tier {
            UserTier::Donor => Priority::High,
            UserTier::Registered => Priority::Medium,
            UserTier::Anonymous => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// A request owned by the queue manager from enqueue until eviction.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub subject_id: Option<String>,
    pub ip: String,
    pub endpoint: String,
    pub payload: Value,
    pub priority: Priority,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Returned to the caller immediately on enqueue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueTicket {
    pub request_id: Uuid,
    pub status: RequestStatus,
    /// 1-based rank counting everything that will be served first.
    pub position: usize,
    pub estimated_wait_secs: u64,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

/// Live view of a request, with position and ETA recomputed for queued ones.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub priority: Priority,
    /// 1-based position while queued, 0 otherwise.
    pub position: usize,
    pub estimated_wait_secs: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}
