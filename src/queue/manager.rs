//! Priority lane queue manager with lifecycle tracking and wait estimates

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;
use tracing::{debug, info, warn};

use crate::error::{AdmissionError, Result};
use crate::limiter::Identity;
use crate::monitor::LoadSource;
use crate::queue::backoff::{BackoffPolicy, RetrySuggestion};
use crate::queue::request::{
    Priority, QueueTicket, QueuedRequest, RequestStatus, StatusReport,
};

/// Trailing window length for processing/wait time averages.
const TIMING_WINDOW: usize = 100;

/// Configuration for the queue manager
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of requests in the Processing state at once
    pub max_concurrent: usize,
    /// How long terminal requests are kept before eviction
    pub retention: Duration,
    /// Interval of the background eviction sweep
    pub maintenance_interval: Duration,
    /// Assumed processing time before any completions have been observed
    pub default_processing_secs: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            retention: Duration::from_secs(24 * 3600),
            maintenance_interval: Duration::from_secs(30),
            default_processing_secs: 30.0,
        }
    }
}

/// Queue depth per priority lane.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LaneDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Aggregate queue statistics for observability.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub total_requests: u64,
    pub queued: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub average_wait_secs: f64,
    pub average_processing_secs: f64,
    /// Estimated requests per minute at the current concurrency limit.
    pub throughput_per_minute: f64,
    pub server_load: f64,
    pub lane_depths: LaneDepths,
    pub max_concurrent: usize,
}

/// Load information for callers deciding how to present queueing to users.
/// Requests are never rejected for capacity reasons; `accept` is always true.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub accept: bool,
    pub server_load: f64,
    pub queue_length: usize,
    pub processing: usize,
    pub estimated_wait_secs: u64,
}

struct QueueState {
    lanes: [VecDeque<Uuid>; 3],
    requests: HashMap<Uuid, QueuedRequest>,
    processing: HashSet<Uuid>,
    total_requests: u64,
    completed: u64,
    failed: u64,
    processing_times: VecDeque<f64>,
    wait_times: VecDeque<f64>,
}

impl QueueState {
    fn queued_len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Queued requests in `priority`'s lane and all strictly higher lanes.
    fn ahead_in_or_above(&self, priority: Priority) -> usize {
        self.lanes[..=priority.index()]
            .iter()
            .map(VecDeque::len)
            .sum()
    }

    fn trailing_average(&self, default_secs: f64) -> f64 {
        if self.processing_times.is_empty() {
            default_secs
        } else {
            self.processing_times.iter().sum::<f64>() / self.processing_times.len() as f64
        }
    }

    fn push_capped(window: &mut VecDeque<f64>, value: f64) {
        window.push_back(value);
        if window.len() > TIMING_WINDOW {
            window.pop_front();
        }
    }
}

/// Accepts every request into one of three priority lanes and bounds how
/// many are processed at once.
///
/// Within a lane requests are FIFO; across lanes priority is strict, with
/// no aging. All state lives behind one mutex; the processing callback
/// itself runs in the worker pool, never under the lock.
pub struct QueueManager {
    load: Arc<dyn LoadSource>,
    backoff: BackoffPolicy,
    config: QueueConfig,
    state: Mutex<QueueState>,
    sweep_task: RwLock<Option<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(load: Arc<dyn LoadSource>, backoff: BackoffPolicy, config: QueueConfig) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            "Queue manager initialized"
        );
        Self {
            load,
            backoff,
            config,
            state: Mutex::new(QueueState {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                requests: HashMap::new(),
                processing: HashSet::new(),
                total_requests: 0,
                completed: 0,
                failed: 0,
                processing_times: VecDeque::with_capacity(TIMING_WINDOW),
                wait_times: VecDeque::with_capacity(TIMING_WINDOW),
            }),
            sweep_task: RwLock::new(None),
        }
    }

    /// Enqueue a request. Never blocks and never rejects: under load the
    /// caller gets a ticket with a position and wait estimate instead of an
    /// error.
    pub fn enqueue(
        &self,
        identity: &Identity,
        endpoint: &str,
        payload: Value,
    ) -> (Uuid, QueueTicket) {
        let priority = Priority::from_tier(identity.tier);
        let load = self.load.current_load().load;
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        let request = QueuedRequest {
            id,
            subject_id: identity.subject_id.clone(),
            ip: identity.ip.clone(),
            endpoint: endpoint.to_string(),
            payload,
            priority,
            status: RequestStatus::Queued,
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
        };

        let ticket = {
            let mut state = self.state.lock();

            let ahead = state.ahead_in_or_above(priority) + state.processing.len();
            let estimated_wait_secs = self.estimate_wait(
                ahead,
                state.trailing_average(self.config.default_processing_secs),
                load,
            );

            state.lanes[priority.index()].push_back(id);
            state.requests.insert(id, request);
            state.total_requests += 1;

            QueueTicket {
                request_id: id,
                status: RequestStatus::Queued,
                position: state.ahead_in_or_above(priority),
                estimated_wait_secs,
                priority,
                created_at,
            }
        };

        info!(
            request_id = %id,
            priority = priority.as_str(),
            position = ticket.position,
            estimated_wait_secs = ticket.estimated_wait_secs,
            "Request enqueued"
        );

        (id, ticket)
    }

    /// Pop the next request to process, highest priority first.
    ///
    /// Returns `None` when every lane is empty or the concurrency limit is
    /// reached; callers poll rather than block.
    pub fn dequeue_next(&self) -> Option<QueuedRequest> {
        let mut state = self.state.lock();

        if state.processing.len() >= self.config.max_concurrent {
            return None;
        }

        for lane in 0..state.lanes.len() {
            let Some(id) = state.lanes[lane].pop_front() else {
                continue;
            };

            let started_at = Utc::now();
            let Some(request) = state.requests.get_mut(&id) else {
                warn!(request_id = %id, "Queued id missing from request table");
                continue;
            };
            request.status = RequestStatus::Processing;
            request.started_at = Some(started_at);
            let snapshot = request.clone();

            let waited = (started_at - snapshot.created_at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            QueueState::push_capped(&mut state.wait_times, waited);
            state.processing.insert(id);

            debug!(
                request_id = %id,
                waited_secs = waited,
                "Request moved to processing"
            );
            return Some(snapshot);
        }

        None
    }

    /// Record the outcome of a processing attempt and release its slot.
    pub fn complete(
        &self,
        id: Uuid,
        outcome: std::result::Result<Value, String>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if !state.processing.remove(&id) {
            warn!(request_id = %id, "Completion for a request that is not processing");
            return Err(AdmissionError::RequestNotFound(id.to_string()));
        }

        let completed_at = Utc::now();
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| AdmissionError::RequestNotFound(id.to_string()))?;
        request.completed_at = Some(completed_at);

        match outcome {
            Ok(result) => {
                request.status = RequestStatus::Completed;
                request.result = Some(result);
            }
            Err(message) => {
                request.status = RequestStatus::Failed;
                request.error = Some(message);
            }
        }

        let status = request.status;
        let elapsed = request
            .started_at
            .map(|started| (completed_at - started).num_milliseconds().max(0) as f64 / 1000.0);

        if let Some(elapsed) = elapsed {
            QueueState::push_capped(&mut state.processing_times, elapsed);
        }
        match status {
            RequestStatus::Completed => state.completed += 1,
            RequestStatus::Failed => state.failed += 1,
            _ => unreachable!(),
        }

        info!(request_id = %id, status = status.as_str(), "Request finished");
        Ok(())
    }

    /// Live status for a request; position and ETA are recomputed for
    /// queued requests as earlier entries drain.
    pub fn status(&self, id: Uuid) -> Option<StatusReport> {
        let load = self.load.current_load().load;
        let state = self.state.lock();
        let request = state.requests.get(&id)?;

        let (position, estimated_wait_secs) = if request.status == RequestStatus::Queued {
            let lane = &state.lanes[request.priority.index()];
            let rank = lane.iter().position(|queued| *queued == id).map(|i| i + 1)?;
            let above: usize = state.lanes[..request.priority.index()]
                .iter()
                .map(VecDeque::len)
                .sum();
            let position = rank + above;
            let wait = self.estimate_wait(
                position - 1 + state.processing.len(),
                state.trailing_average(self.config.default_processing_secs),
                load,
            );
            (position, wait)
        } else {
            (0, 0)
        };

        Some(StatusReport {
            request_id: id,
            status: request.status,
            priority: request.priority,
            position,
            estimated_wait_secs,
            created_at: request.created_at,
            started_at: request.started_at,
            completed_at: request.completed_at,
            result: request.result.clone(),
            error: request.error.clone(),
            retry_count: request.retry_count,
        })
    }

    /// Retry guidance for a failed request; `None` for unknown ids or
    /// requests in any other state.
    pub fn retry_suggestion(&self, id: Uuid) -> Option<RetrySuggestion> {
        let load = self.load.current_load().load;
        let state = self.state.lock();
        let request = state.requests.get(&id)?;
        if request.status != RequestStatus::Failed {
            return None;
        }
        Some(self.backoff.suggestion(request.retry_count, load))
    }

    /// Re-enqueue a failed request with its retry count bumped, so the next
    /// backoff suggestion grows.
    pub fn requeue_failed(&self, id: Uuid) -> Result<(Uuid, QueueTicket)> {
        let load = self.load.current_load().load;
        let mut state = self.state.lock();

        let failed = state
            .requests
            .get(&id)
            .ok_or_else(|| AdmissionError::RequestNotFound(id.to_string()))?;
        if failed.status != RequestStatus::Failed {
            return Err(AdmissionError::InvalidRequestState(id.to_string()));
        }

        let priority = failed.priority;
        let new_id = Uuid::new_v4();
        let created_at = Utc::now();
        let retry = QueuedRequest {
            id: new_id,
            subject_id: failed.subject_id.clone(),
            ip: failed.ip.clone(),
            endpoint: failed.endpoint.clone(),
            payload: failed.payload.clone(),
            priority,
            status: RequestStatus::Queued,
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: failed.retry_count + 1,
        };

        let ahead = state.ahead_in_or_above(priority) + state.processing.len();
        let estimated_wait_secs = self.estimate_wait(
            ahead,
            state.trailing_average(self.config.default_processing_secs),
            load,
        );

        state.lanes[priority.index()].push_back(new_id);
        state.requests.insert(new_id, retry);
        state.total_requests += 1;

        info!(request_id = %new_id, original = %id, "Failed request requeued");

        Ok((
            new_id,
            QueueTicket {
                request_id: new_id,
                status: RequestStatus::Queued,
                position: state.ahead_in_or_above(priority),
                estimated_wait_secs,
                priority,
                created_at,
            },
        ))
    }

    /// Aggregate statistics snapshot.
    pub fn metrics(&self) -> QueueMetrics {
        let load = self.load.current_load().load;
        let state = self.state.lock();

        let average = |window: &VecDeque<f64>| {
            if window.is_empty() {
                0.0
            } else {
                window.iter().sum::<f64>() / window.len() as f64
            }
        };

        // Throughput estimated from the last few completions scaled by the
        // concurrency limit.
        let recent: Vec<f64> = state
            .processing_times
            .iter()
            .rev()
            .take(10)
            .copied()
            .collect();
        let throughput_per_minute = if recent.is_empty() {
            0.0
        } else {
            let avg = recent.iter().sum::<f64>() / recent.len() as f64;
            if avg > 0.0 {
                (60.0 / avg) * self.config.max_concurrent as f64
            } else {
                0.0
            }
        };

        QueueMetrics {
            total_requests: state.total_requests,
            queued: state.queued_len(),
            processing: state.processing.len(),
            completed: state.completed,
            failed: state.failed,
            average_wait_secs: average(&state.wait_times),
            average_processing_secs: average(&state.processing_times),
            throughput_per_minute,
            server_load: load,
            lane_depths: LaneDepths {
                high: state.lanes[Priority::High.index()].len(),
                medium: state.lanes[Priority::Medium.index()].len(),
                low: state.lanes[Priority::Low.index()].len(),
            },
            max_concurrent: self.config.max_concurrent,
        }
    }

    /// Load and depth information for the caller's UX. Requests are always
    /// accepted; capacity rejection does not exist by policy.
    pub fn load_report(&self) -> LoadReport {
        let load = self.load.current_load().load;
        let state = self.state.lock();
        let ahead = state.queued_len() + state.processing.len();
        LoadReport {
            accept: true,
            server_load: load,
            queue_length: state.queued_len(),
            processing: state.processing.len(),
            estimated_wait_secs: self.estimate_wait(
                ahead,
                state.trailing_average(self.config.default_processing_secs),
                load,
            ),
        }
    }

    /// Evict terminal requests older than the retention window. Returns the
    /// number evicted.
    pub fn sweep_terminal(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut state = self.state.lock();

        let before = state.requests.len();
        state.requests.retain(|_, request| {
            !(request.status.is_terminal()
                && request.completed_at.is_some_and(|done| done < cutoff))
        });
        let removed = before - state.requests.len();
        if removed > 0 {
            info!(removed, "Evicted terminal requests past retention");
        }
        removed
    }

    /// Start the periodic eviction sweep.
    pub async fn start_maintenance(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = self.config.maintenance_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                manager.sweep_terminal();
            }
        });

        *self.sweep_task.write().await = Some(handle);
        info!(
            interval_secs = interval.as_secs(),
            "Started queue maintenance task"
        );
    }

    /// Stop the periodic sweep.
    pub async fn stop_maintenance(&self) {
        if let Some(handle) = self.sweep_task.write().await.take() {
            handle.abort();
            info!("Stopped queue maintenance task");
        }
    }

    fn estimate_wait(&self, ahead: usize, average_secs: f64, load: f64) -> u64 {
        let concurrency = self.config.max_concurrent.max(1) as f64;
        ((ahead as f64 / concurrency) * average_secs * (1.0 + 1.5 * load)) as u64
    }
}
