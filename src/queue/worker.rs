//! Fixed-size worker pool draining the queue manager

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::manager::QueueManager;

/// The external processing callback that performs the actual generation.
///
/// Errors are caught by the worker and recorded on the request as a
/// failure; they never take a worker down.
#[async_trait]
pub trait ProcessHandler: Send + Sync {
    async fn process(&self, endpoint: &str, payload: Value) -> Result<Value>;
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Sleep between polls when the queue yields nothing
    pub idle_poll: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_poll: Duration::from_millis(250),
        }
    }
}

/// Pulls requests from the queue via `dequeue_next` in a poll loop and runs
/// the processing callback outside any queue lock.
pub struct WorkerPool {
    queue: Arc<QueueManager>,
    handler: Arc<dyn ProcessHandler>,
    config: WorkerPoolConfig,
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<QueueManager>,
        handler: Arc<dyn ProcessHandler>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Start the worker tasks.
    pub async fn start(&self) {
        let mut handles = self.handles.write().await;
        if !handles.is_empty() {
            return;
        }

        for worker in 0..self.config.workers {
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let idle = self.config.idle_poll;

            handles.push(tokio::spawn(async move {
                loop {
                    match queue.dequeue_next() {
                        Some(request) => {
                            debug!(
                                worker,
                                request_id = %request.id,
                                endpoint = %request.endpoint,
                                "Worker picked up request"
                            );
                            let outcome = handler
                                .process(&request.endpoint, request.payload.clone())
                                .await
                                .map_err(|e| e.to_string());
                            if let Err(e) = queue.complete(request.id, outcome) {
                                warn!(
                                    worker,
                                    request_id = %request.id,
                                    error = %e,
                                    "Failed to record request outcome"
                                );
                            }
                        }
                        None => tokio::time::sleep(idle).await,
                    }
                }
            }));
        }

        info!(workers = self.config.workers, "Started worker pool");
    }

    /// Stop all workers. In-flight callback invocations are aborted.
    pub async fn stop(&self) {
        let mut handles = self.handles.write().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("Stopped worker pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdmissionError;
    use crate::limiter::{Identity, UserTier};
    use crate::monitor::FixedLoad;
    use crate::queue::backoff::BackoffPolicy;
    use crate::queue::manager::QueueConfig;
    use crate::queue::request::RequestStatus;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl ProcessHandler for EchoHandler {
        async fn process(&self, endpoint: &str, payload: Value) -> Result<Value> {
            if endpoint == "broken" {
                return Err(AdmissionError::Internal("generator offline".into()));
            }
            Ok(json!({ "endpoint": endpoint, "echo": payload }))
        }
    }

    fn queue() -> Arc<QueueManager> {
        Arc::new(QueueManager::new(
            Arc::new(FixedLoad(0.0)),
            BackoffPolicy::new(2, 300, false),
            QueueConfig::default(),
        ))
    }

    fn anonymous(ip: &str) -> Identity {
        Identity {
            subject_id: None,
            ip: ip.to_string(),
            tier: UserTier::Anonymous,
        }
    }

    async fn wait_for_terminal(
        queue: &QueueManager,
        id: uuid::Uuid,
    ) -> crate::queue::request::StatusReport {
        for _ in 0..200 {
            let report = queue.status(id).unwrap();
            if report.status.is_terminal() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request {} never reached a terminal state", id);
    }

    #[tokio::test]
    async fn workers_process_queued_requests_to_completion() {
        let queue = queue();
        let pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::new(EchoHandler),
            WorkerPoolConfig {
                workers: 2,
                idle_poll: Duration::from_millis(5),
            },
        );
        pool.start().await;

        let (id, _) = queue.enqueue(&anonymous("1.1.1.1"), "txt2img", json!({"prompt": "cat"}));
        let report = wait_for_terminal(&queue, id).await;

        assert_eq!(report.status, RequestStatus::Completed);
        assert_eq!(
            report.result.unwrap()["echo"]["prompt"],
            json!("cat")
        );
        pool.stop().await;
    }

    #[tokio::test]
    async fn handler_errors_become_failed_requests() {
        let queue = queue();
        let pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::new(EchoHandler),
            WorkerPoolConfig {
                workers: 1,
                idle_poll: Duration::from_millis(5),
            },
        );
        pool.start().await;

        let (id, _) = queue.enqueue(&anonymous("1.1.1.2"), "broken", json!({}));
        let report = wait_for_terminal(&queue, id).await;

        assert_eq!(report.status, RequestStatus::Failed);
        assert!(report.error.unwrap().contains("generator offline"));
        assert!(queue.retry_suggestion(id).is_some());
        pool.stop().await;
    }
}
