//! Priority request queue with wait-time feedback and retry guidance

pub mod backoff;
pub mod manager;
pub mod request;
pub mod worker;

pub use backoff::{BackoffPolicy, RetrySuggestion};
pub use manager::{QueueConfig, QueueManager, QueueMetrics};
pub use request::{Priority, QueueTicket, QueuedRequest, RequestStatus, StatusReport};
pub use worker::{ProcessHandler, WorkerPool, WorkerPoolConfig};
