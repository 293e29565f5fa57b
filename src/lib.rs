//! Admission control and load shedding for generative media services
//!
//! Combines a server load monitor, a tiered load-adaptive rate limiter, a
//! priority request queue with retry guidance, and a health-checked backend
//! router into one front door for expensive generation requests.

pub mod config;
pub mod error;
pub mod limiter;
pub mod monitor;
pub mod queue;
pub mod router;

pub use error::{AdmissionError, Result};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::settings::LoggingConfig;
use crate::config::Settings;
use crate::limiter::{AdaptiveRateLimiter, TierRegistry};
use crate::monitor::{FixedLoad, LoadMonitor, LoadSource};
use crate::queue::{BackoffPolicy, ProcessHandler, QueueManager, WorkerPool};
use crate::router::BackendRouter;

/// Initialize the global tracing subscriber from logging settings.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.clone()));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// All admission-control components wired together from one `Settings`.
pub struct AdmissionControl {
    pub settings: Settings,
    pub monitor: Arc<LoadMonitor>,
    pub tiers: Arc<TierRegistry>,
    pub limiter: Arc<AdaptiveRateLimiter>,
    pub queue: Arc<QueueManager>,
    /// Absent when no backend instances are configured.
    pub router: Option<Arc<BackendRouter>>,
}

impl AdmissionControl {
    pub fn from_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let monitor = Arc::new(LoadMonitor::new(settings.monitor.throttle_threshold));
        let load: Arc<dyn LoadSource> = if settings.monitor.enabled {
            monitor.clone()
        } else {
            Arc::new(FixedLoad(0.0))
        };
        let tiers = Arc::new(TierRegistry::new(
            (&settings.limiter.anonymous).into(),
            (&settings.limiter.registered).into(),
            (&settings.limiter.donor).into(),
        ));
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            Arc::clone(&tiers),
            Arc::clone(&load),
        ));
        let queue = Arc::new(QueueManager::new(
            load,
            BackoffPolicy::from(&settings.backoff),
            (&settings.queue).into(),
        ));

        let router = if settings.router.instances.is_empty() {
            None
        } else {
            Some(Arc::new(BackendRouter::new(
                settings.router.instances(),
                settings.router.router_config(),
            )?))
        };

        info!(
            backends = settings.router.instances.len(),
            max_concurrent = settings.queue.max_concurrent,
            "Admission control initialized"
        );

        Ok(Self {
            settings,
            monitor,
            tiers,
            limiter,
            queue,
            router,
        })
    }

    /// Build a worker pool draining this queue into the given handler.
    pub fn worker_pool(&self, handler: Arc<dyn ProcessHandler>) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.queue),
            handler,
            (&self.settings.workers).into(),
        )
    }

    /// Start the background maintenance tasks: limiter sweeps, queue
    /// eviction, and backend health checks.
    pub async fn start_background(&self) {
        self.limiter
            .start_maintenance(
                Duration::from_secs(self.settings.limiter.sweep_interval_secs),
                Duration::from_secs(self.settings.limiter.bucket_retention_hours * 3600),
            )
            .await;
        self.queue.start_maintenance().await;
        if let Some(router) = &self.router {
            router.start_health_checks().await;
        }
    }

    /// Stop all background tasks.
    pub async fn shutdown(&self) {
        self.limiter.stop_maintenance().await;
        self.queue.stop_maintenance().await;
        if let Some(router) = &self.router {
            router.stop_health_checks().await;
        }
        info!("Admission control shut down");
    }
}
