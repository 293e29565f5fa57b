//! Health-checked request dispatch across backend instances

use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AdmissionError, Result};
use crate::router::instance::{BackendInstance, InstanceReport, InstanceStatus};

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Delay between health-check sweeps
    pub health_check_interval: Duration,
    /// Per-probe timeout
    pub health_check_timeout: Duration,
    /// Timeout for forwarded requests
    pub request_timeout: Duration,
    /// Path probed on each instance, e.g. `/health`
    pub health_path: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            health_path: "/health".to_string(),
        }
    }
}

/// Response forwarded back from whichever instance handled the request.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: u16,
    pub body: Value,
    /// Name of the instance that produced the response
    pub instance: String,
}

/// Routes requests to the fittest backend instance and fails over on
/// server errors and transport failures.
///
/// Non-5xx responses, including client errors, are treated as authoritative
/// and returned to the caller without trying another instance.
pub struct BackendRouter {
    client: reqwest::Client,
    config: RouterConfig,
    instances: Mutex<Vec<BackendInstance>>,
    check_task: RwLock<Option<JoinHandle<()>>>,
}

struct ProbeOutcome {
    status: InstanceStatus,
    response_time: f64,
    error: Option<String>,
}

impl BackendRouter {
    pub fn new(
        instances: impl IntoIterator<Item = BackendInstance>,
        config: RouterConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let instances: Vec<BackendInstance> = instances.into_iter().collect();
        info!(count = instances.len(), "Initialized backend router");
        Ok(Self {
            client,
            config,
            instances: Mutex::new(instances),
            check_task: RwLock::new(None),
        })
    }

    /// Start the periodic health-check loop.
    pub async fn start_health_checks(self: &Arc<Self>) {
        let mut task = self.check_task.write().await;
        if task.is_some() {
            return;
        }

        let router = Arc::clone(self);
        let interval = self.config.health_check_interval;
        *task = Some(tokio::spawn(async move {
            loop {
                router.check_all().await;
                tokio::time::sleep(interval).await;
            }
        }));
        info!(interval_secs = interval.as_secs(), "Started backend health checks");
    }

    /// Stop the health-check loop.
    pub async fn stop_health_checks(&self) {
        let mut task = self.check_task.write().await;
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Stopped backend health checks");
        }
    }

    /// Probe every instance once and fold the outcomes into their state.
    pub async fn check_all(&self) {
        let targets: Vec<(String, String)> = self
            .instances
            .lock()
            .iter()
            .map(|i| (i.name.clone(), i.url.clone()))
            .collect();

        for (name, url) in targets {
            let outcome = self.probe(&url).await;
            if let Some(ref e) = outcome.error {
                warn!(instance = %name, status = outcome.status.as_str(), error = %e, "Health check failed");
            } else {
                debug!(
                    instance = %name,
                    status = outcome.status.as_str(),
                    response_time = outcome.response_time,
                    "Health check passed"
                );
            }

            let mut instances = self.instances.lock();
            if let Some(instance) = instances.iter_mut().find(|i| i.url == url) {
                instance.status = outcome.status;
                instance.response_time = outcome.response_time;
                instance.last_check = Some(chrono::Utc::now());
                match outcome.error {
                    None => instance.record_success(),
                    Some(e) => instance.record_failure(e),
                }
            }
        }
    }

    async fn probe(&self, url: &str) -> ProbeOutcome {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}{}", url, self.config.health_path))
            .timeout(self.config.health_check_timeout)
            .send()
            .await;
        let response_time = started.elapsed().as_secs_f64();

        match response {
            Ok(resp) if resp.status().is_success() => {
                // Only an explicit `{"status": "healthy"}` body counts as
                // Healthy; anything else that still answers 200 is Degraded.
                let body: Value = resp.json().await.unwrap_or_else(|_| json!({}));
                let status = match body.get("status").and_then(Value::as_str) {
                    Some("healthy") => InstanceStatus::Healthy,
                    _ => InstanceStatus::Degraded,
                };
                ProbeOutcome {
                    status,
                    response_time,
                    error: None,
                }
            }
            Ok(resp) => ProbeOutcome {
                status: InstanceStatus::Degraded,
                response_time,
                error: Some(format!("HTTP {}", resp.status().as_u16())),
            },
            Err(e) => ProbeOutcome {
                status: InstanceStatus::Down,
                response_time: self.config.health_check_timeout.as_secs_f64(),
                error: Some(e.to_string()),
            },
        }
    }

    /// Forward a request to the best available instance, failing over on
    /// 5xx responses and transport errors until every instance has been
    /// tried once.
    pub async fn dispatch(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<DispatchResponse> {
        let total = self.instances.lock().len();
        let mut tried: HashSet<String> = HashSet::new();

        for _ in 0..total {
            let Some((name, url)) = self.select_best(&tried) else {
                break;
            };
            tried.insert(url.clone());

            let target = format!("{}/{}", url, endpoint.trim_start_matches('/'));
            debug!(instance = %name, target = %target, "Dispatching request");

            let mut request = self.client.request(method.clone(), &target);
            if let Some(payload) = body {
                request = request.json(payload);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    let reason = format!("HTTP {}", resp.status().as_u16());
                    warn!(instance = %name, reason = %reason, "Instance returned a server error, failing over");
                    self.mark_down(&url, reason);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    {
                        let mut instances = self.instances.lock();
                        if let Some(instance) = instances.iter_mut().find(|i| i.url == url) {
                            instance.record_success();
                        }
                    }
                    let text = resp.text().await.unwrap_or_default();
                    let body = serde_json::from_str(&text)
                        .unwrap_or_else(|_| json!({ "response": text }));
                    return Ok(DispatchResponse {
                        status,
                        body,
                        instance: name,
                    });
                }
                Err(e) => {
                    warn!(instance = %name, error = %e, "Instance unreachable, failing over");
                    self.mark_down(&url, e.to_string());
                }
            }
        }

        error!(endpoint = %endpoint, tried = tried.len(), "All backend instances unavailable");
        Err(AdmissionError::AllBackendsUnavailable(endpoint.to_string()))
    }

    /// Highest health score wins; ties go to the lower priority number.
    fn select_best(&self, tried: &HashSet<String>) -> Option<(String, String)> {
        let instances = self.instances.lock();
        instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Down && !tried.contains(&i.url))
            .max_by(|a, b| {
                a.health_score()
                    .partial_cmp(&b.health_score())
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.priority.cmp(&a.priority))
            })
            .map(|i| (i.name.clone(), i.url.clone()))
    }

    /// Mark an instance Down so selection skips it until a health check
    /// brings it back.
    pub fn mark_down(&self, url: &str, error: String) {
        let mut instances = self.instances.lock();
        if let Some(instance) = instances.iter_mut().find(|i| i.url == url) {
            instance.status = InstanceStatus::Down;
            instance.record_failure(error);
        }
    }

    /// Snapshot of every instance for observability.
    pub fn status_report(&self) -> Vec<InstanceReport> {
        self.instances.lock().iter().map(|i| i.report()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(instances: Vec<BackendInstance>) -> BackendRouter {
        BackendRouter::new(instances, RouterConfig::default()).unwrap()
    }

    fn set_status(router: &BackendRouter, url: &str, status: InstanceStatus) {
        let mut instances = router.instances.lock();
        let instance = instances.iter_mut().find(|i| i.url == url).unwrap();
        instance.status = status;
    }

    #[test]
    fn selection_prefers_the_highest_health_score() {
        let router = router(vec![
            BackendInstance::new("http://primary.example", "primary", 1),
            BackendInstance::new("http://spare.example", "spare", 2),
        ]);
        set_status(&router, "http://primary.example", InstanceStatus::Degraded);
        set_status(&router, "http://spare.example", InstanceStatus::Healthy);

        let (name, _) = router.select_best(&HashSet::new()).unwrap();
        assert_eq!(name, "spare");
    }

    #[test]
    fn equal_scores_fall_back_to_configured_priority() {
        let router = router(vec![
            BackendInstance::new("http://spare.example", "spare", 2),
            BackendInstance::new("http://primary.example", "primary", 1),
        ]);

        // Both Unknown, identical scores.
        let (name, _) = router.select_best(&HashSet::new()).unwrap();
        assert_eq!(name, "primary");
    }

    #[test]
    fn down_and_already_tried_instances_are_skipped() {
        let router = router(vec![
            BackendInstance::new("http://a.example", "a", 1),
            BackendInstance::new("http://b.example", "b", 2),
            BackendInstance::new("http://c.example", "c", 3),
        ]);
        set_status(&router, "http://a.example", InstanceStatus::Down);

        let mut tried = HashSet::new();
        tried.insert("http://b.example".to_string());

        let (name, _) = router.select_best(&tried).unwrap();
        assert_eq!(name, "c");

        tried.insert("http://c.example".to_string());
        assert!(router.select_best(&tried).is_none());
    }

    #[test]
    fn mark_down_records_the_failure() {
        let router = router(vec![BackendInstance::new("http://a.example", "a", 1)]);
        router.mark_down("http://a.example", "HTTP 502".into());

        let report = &router.status_report()[0];
        assert_eq!(report.status, InstanceStatus::Down);
        assert_eq!(report.consecutive_failures, 1);
        assert_eq!(report.last_error.as_deref(), Some("HTTP 502"));
    }

    #[tokio::test]
    async fn dispatch_with_no_instances_is_an_error() {
        let router = router(Vec::new());
        let err = router
            .dispatch(Method::POST, "generate", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::AllBackendsUnavailable(_)));
    }
}
