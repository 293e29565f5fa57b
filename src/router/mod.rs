//! Multi-instance backend routing with health-based failover

pub mod dispatch;
pub mod instance;

pub use dispatch::{BackendRouter, DispatchResponse, RouterConfig};
pub use instance::{BackendInstance, InstanceReport, InstanceStatus};
