//! Tiered, load-adaptive admission control

pub mod adaptive;
pub mod bucket;
pub mod clock;
pub mod tiers;

pub use adaptive::{AdaptiveRateLimiter, Decision, DecisionReason, Window};
pub use bucket::TokenBucket;
pub use clock::{Clock, SystemClock};
pub use tiers::{Identity, TierLimits, TierRegistry, UserTier};
