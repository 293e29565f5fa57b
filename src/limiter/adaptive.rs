//! Load-adaptive tiered rate limiter

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::limiter::bucket::TokenBucket;
use crate::limiter::clock::{Clock, SystemClock};
use crate::limiter::tiers::{Identity, TierRegistry, UserTier};
use crate::monitor::LoadSource;

const GRACE_WINDOW: Duration = Duration::from_secs(3600);

/// Rate limit window granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

/// Why a request was admitted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    GracePeriod,
    WithinLimits,
    RateLimitExceeded,
}

impl DecisionReason {
    pub fn code(&self) -> &'static str {
        match self {
            DecisionReason::GracePeriod => "grace_period",
            DecisionReason::WithinLimits => "within_limits",
            DecisionReason::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

/// Per-window limits after the load adjustment factor is applied.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdjustedLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

/// Bucket fill level for one window at decision time.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowState {
    pub window: Window,
    pub tokens: f64,
    pub capacity: f64,
}

/// Seconds until an exhausted window regains a token.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowWait {
    pub window: Window,
    pub seconds: u64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub tier: UserTier,
    pub server_load: f64,
    pub load_factor: f64,
    pub adjusted_limits: AdjustedLimits,
    /// Remaining free requests, present only for grace period admissions.
    pub grace_remaining: Option<u32>,
    pub windows: Vec<WindowState>,
    pub exhausted: Vec<Window>,
    pub wait_times: Vec<WindowWait>,
}

impl Decision {
    /// Shortest constructive wait across exhausted windows, for display.
    pub fn shortest_wait(&self) -> Option<u64> {
        self.wait_times.iter().map(|w| w.seconds).min()
    }
}

struct WindowBuckets {
    minute: TokenBucket,
    hour: TokenBucket,
    day: TokenBucket,
}

struct IdentityEntry {
    first_seen: Instant,
    grace_used: u32,
    buckets: Option<WindowBuckets>,
    last_activity: Instant,
}

/// Per-identity, per-window admission control adapted by server load.
///
/// Buckets are created lazily on the first post-grace request, sized from
/// the limits in effect at that moment, and swept after a configurable idle
/// age. The three-window consume for one identity runs under that
/// identity's map entry lock, so concurrent calls cannot interleave it.
pub struct AdaptiveRateLimiter {
    tiers: Arc<TierRegistry>,
    load: Arc<dyn LoadSource>,
    entries: Arc<DashMap<String, IdentityEntry>>,
    clock: Arc<dyn Clock>,
    sweep_task: RwLock<Option<JoinHandle<()>>>,
}

impl AdaptiveRateLimiter {
    pub fn new(tiers: Arc<TierRegistry>, load: Arc<dyn LoadSource>) -> Self {
        Self::with_clock(tiers, load, Arc::new(SystemClock))
    }

    pub fn with_clock(
        tiers: Arc<TierRegistry>,
        load: Arc<dyn LoadSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tiers,
            load,
            entries: Arc::new(DashMap::new()),
            clock,
            sweep_task: RwLock::new(None),
        }
    }

    /// Decide whether to admit one request for `identity`.
    ///
    /// Never fails: a load monitor outage degrades to load 0 inside the
    /// `LoadSource` implementation, not to an error here.
    pub fn decide(&self, identity: &Identity) -> Decision {
        let base = self.tiers.effective_limits(identity);
        let sample = self.load.current_load();
        let load_factor = load_factor(sample.load);

        // Floors keep every tier serviceable even at maximum load.
        let adjusted = AdjustedLimits {
            per_minute: ((f64::from(base.per_minute) * load_factor) as u32).max(1),
            per_hour: ((f64::from(base.per_hour) * load_factor) as u32).max(5),
            per_day: ((f64::from(base.per_day) * load_factor) as u32).max(10),
        };

        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(identity.key())
            .or_insert_with(|| IdentityEntry {
                first_seen: now,
                grace_used: 0,
                buckets: None,
                last_activity: now,
            });
        entry.last_activity = now;

        // First `grace_requests` calls within the identity's first hour skip
        // the buckets entirely.
        let in_first_hour = now.duration_since(entry.first_seen) < GRACE_WINDOW;
        if in_first_hour && entry.grace_used < base.grace_requests {
            entry.grace_used += 1;
            let remaining = base.grace_requests - entry.grace_used;
            debug!(
                identity = %identity.key(),
                remaining,
                "Request admitted under grace period"
            );
            return Decision {
                allowed: true,
                reason: DecisionReason::GracePeriod,
                tier: identity.tier,
                server_load: sample.load,
                load_factor,
                adjusted_limits: adjusted,
                grace_remaining: Some(remaining),
                windows: Vec::new(),
                exhausted: Vec::new(),
                wait_times: Vec::new(),
            };
        }

        let buckets = entry.buckets.get_or_insert_with(|| WindowBuckets {
            minute: TokenBucket::new(
                adjusted.per_minute,
                f64::from(adjusted.per_minute) / 60.0,
                now,
            ),
            hour: TokenBucket::new(
                adjusted.per_hour,
                f64::from(adjusted.per_hour) / 3600.0,
                now,
            ),
            day: TokenBucket::new(
                adjusted.per_day,
                f64::from(adjusted.per_day) / 86400.0,
                now,
            ),
        });

        // All three windows must yield a token. Tokens taken from windows
        // that passed are not refunded when a later window rejects; the
        // slight under-serving during bursts is accepted over refund
        // bookkeeping.
        let allowed = buckets.minute.try_consume(now)
            && buckets.hour.try_consume(now)
            && buckets.day.try_consume(now);

        // Bring every bucket current so reported fill levels and wait times
        // are accurate even for windows the short-circuit never touched.
        buckets.minute.refill(now);
        buckets.hour.refill(now);
        buckets.day.refill(now);

        let labeled = [
            (Window::Minute, &buckets.minute),
            (Window::Hour, &buckets.hour),
            (Window::Day, &buckets.day),
        ];

        let windows: Vec<WindowState> = labeled
            .iter()
            .map(|(window, bucket)| WindowState {
                window: *window,
                tokens: bucket.tokens(),
                capacity: bucket.capacity(),
            })
            .collect();

        if allowed {
            Decision {
                allowed: true,
                reason: DecisionReason::WithinLimits,
                tier: identity.tier,
                server_load: sample.load,
                load_factor,
                adjusted_limits: adjusted,
                grace_remaining: None,
                windows,
                exhausted: Vec::new(),
                wait_times: Vec::new(),
            }
        } else {
            let mut exhausted = Vec::new();
            let mut wait_times = Vec::new();
            for (window, bucket) in labeled {
                if bucket.tokens() < 1.0 {
                    exhausted.push(window);
                    wait_times.push(WindowWait {
                        window,
                        seconds: bucket.seconds_until_available(),
                    });
                }
            }

            debug!(
                identity = %identity.key(),
                exhausted = ?exhausted,
                load = sample.load,
                "Request rejected by rate limiter"
            );

            Decision {
                allowed: false,
                reason: DecisionReason::RateLimitExceeded,
                tier: identity.tier,
                server_load: sample.load,
                load_factor,
                adjusted_limits: adjusted,
                grace_remaining: None,
                windows,
                exhausted,
                wait_times,
            }
        }
    }

    /// Drop identity entries with no activity for `max_age`. Returns the
    /// number of entries removed.
    pub fn sweep_idle(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_activity) < max_age);
        let removed = before - self.entries.len();
        if removed > 0 {
            info!(removed, "Swept idle rate limit buckets");
        }
        removed
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.entries.len()
    }

    /// Start the periodic idle-bucket sweep.
    pub async fn start_maintenance(&self, interval: Duration, max_age: Duration) {
        let entries = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let now = clock.now();
                let before = entries.len();
                entries.retain(|_, entry| now.duration_since(entry.last_activity) < max_age);
                let removed = before - entries.len();
                if removed > 0 {
                    info!(removed, "Swept idle rate limit buckets");
                }
            }
        });

        *self.sweep_task.write().await = Some(handle);
        info!(
            interval_secs = interval.as_secs(),
            max_age_secs = max_age.as_secs(),
            "Started rate limiter maintenance task"
        );
    }

    /// Stop the periodic sweep.
    pub async fn stop_maintenance(&self) {
        if let Some(handle) = self.sweep_task.write().await.take() {
            handle.abort();
            info!("Stopped rate limiter maintenance task");
        }
    }
}

/// Monotonic step function mapping server load to a limit multiplier.
fn load_factor(load: f64) -> f64 {
    if load <= 0.5 {
        1.0
    } else if load <= 0.7 {
        0.8
    } else if load <= 0.8 {
        0.6
    } else if load <= 0.9 {
        0.4
    } else {
        0.2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::tiers::TierLimits;
    use crate::monitor::FixedLoad;
    use parking_lot::Mutex;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn starting_now() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    fn registry(anonymous: TierLimits) -> Arc<TierRegistry> {
        Arc::new(TierRegistry::new(
            anonymous,
            TierLimits::registered(),
            TierLimits::donor(),
        ))
    }

    fn limiter_with(
        anonymous: TierLimits,
        load: f64,
    ) -> (AdaptiveRateLimiter, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let limiter = AdaptiveRateLimiter::with_clock(
            registry(anonymous),
            Arc::new(FixedLoad(load)),
            clock.clone(),
        );
        (limiter, clock)
    }

    fn anon(ip: &str) -> Identity {
        Identity {
            subject_id: None,
            ip: ip.to_string(),
            tier: UserTier::Anonymous,
        }
    }

    fn no_grace(per_minute: u32, per_hour: u32, per_day: u32) -> TierLimits {
        TierLimits {
            per_minute,
            per_hour,
            per_day,
            queue_priority: 3,
            grace_requests: 0,
        }
    }

    #[test]
    fn load_factor_steps() {
        assert_eq!(load_factor(0.0), 1.0);
        assert_eq!(load_factor(0.5), 1.0);
        assert_eq!(load_factor(0.7), 0.8);
        assert_eq!(load_factor(0.8), 0.6);
        assert_eq!(load_factor(0.9), 0.4);
        assert_eq!(load_factor(1.0), 0.2);
    }

    #[test]
    fn grace_period_admits_exactly_the_configured_count() {
        let limits = TierLimits {
            grace_requests: 2,
            ..no_grace(1, 60, 100)
        };
        let (limiter, _clock) = limiter_with(limits, 0.0);
        let identity = anon("1.1.1.1");

        let first = limiter.decide(&identity);
        assert!(first.allowed);
        assert_eq!(first.reason, DecisionReason::GracePeriod);
        assert_eq!(first.grace_remaining, Some(1));

        let second = limiter.decide(&identity);
        assert_eq!(second.reason, DecisionReason::GracePeriod);
        assert_eq!(second.grace_remaining, Some(0));

        // Third call hits the buckets (per_minute 1, so it is the one
        // admitted token).
        let third = limiter.decide(&identity);
        assert!(third.allowed);
        assert_eq!(third.reason, DecisionReason::WithinLimits);
    }

    #[test]
    fn grace_period_expires_after_first_hour() {
        let limits = TierLimits {
            grace_requests: 5,
            ..no_grace(3, 60, 100)
        };
        let (limiter, clock) = limiter_with(limits, 0.0);
        let identity = anon("1.1.1.2");

        assert_eq!(limiter.decide(&identity).reason, DecisionReason::GracePeriod);
        clock.advance(Duration::from_secs(3601));
        assert_eq!(limiter.decide(&identity).reason, DecisionReason::WithinLimits);
    }

    #[test]
    fn minute_window_exhausts_after_configured_limit() {
        let (limiter, _clock) = limiter_with(no_grace(3, 60, 100), 0.0);
        let identity = anon("1.1.1.3");

        for _ in 0..3 {
            assert!(limiter.decide(&identity).allowed);
        }

        let rejected = limiter.decide(&identity);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reason, DecisionReason::RateLimitExceeded);
        assert_eq!(rejected.exhausted, vec![Window::Minute]);
        assert!(rejected.shortest_wait().unwrap() > 0);
    }

    #[test]
    fn minute_window_recovers_as_tokens_refill() {
        let (limiter, clock) = limiter_with(no_grace(3, 60, 100), 0.0);
        let identity = anon("1.1.1.4");

        for _ in 0..3 {
            assert!(limiter.decide(&identity).allowed);
        }
        assert!(!limiter.decide(&identity).allowed);

        // 3 per minute refills one token every 20 seconds.
        clock.advance(Duration::from_secs(21));
        assert!(limiter.decide(&identity).allowed);
    }

    #[test]
    fn high_load_shrinks_limits_with_floors() {
        let (limiter, _clock) = limiter_with(no_grace(3, 60, 100), 1.0);
        let identity = anon("1.1.1.5");

        let decision = limiter.decide(&identity);
        // 3 * 0.2 rounds down to 0, floored to 1; 60 * 0.2 = 12; 100 * 0.2 = 20.
        assert_eq!(decision.adjusted_limits.per_minute, 1);
        assert_eq!(decision.adjusted_limits.per_hour, 12);
        assert_eq!(decision.adjusted_limits.per_day, 20);
        assert!(decision.allowed);
        assert!(!limiter.decide(&identity).allowed);
    }

    #[test]
    fn passed_windows_are_not_refunded_on_rejection() {
        // Hour window is the binding constraint: after 5 admissions the 6th
        // consumes a minute token, then fails on the hour bucket.
        let (limiter, _clock) = limiter_with(no_grace(10, 5, 100), 0.0);
        let identity = anon("1.1.1.6");

        for _ in 0..5 {
            assert!(limiter.decide(&identity).allowed);
        }

        let rejected = limiter.decide(&identity);
        assert!(!rejected.allowed);
        assert_eq!(rejected.exhausted, vec![Window::Hour]);

        let minute = rejected
            .windows
            .iter()
            .find(|w| w.window == Window::Minute)
            .unwrap();
        // 10 capacity minus 6 consumed: the token taken by the rejected
        // attempt stays consumed.
        assert!(minute.tokens < 4.5);
    }

    #[test]
    fn identities_do_not_share_buckets() {
        let (limiter, _clock) = limiter_with(no_grace(1, 60, 100), 0.0);

        assert!(limiter.decide(&anon("2.2.2.1")).allowed);
        assert!(!limiter.decide(&anon("2.2.2.1")).allowed);
        assert!(limiter.decide(&anon("2.2.2.2")).allowed);
    }

    #[test]
    fn sweep_removes_idle_entries_only() {
        let (limiter, clock) = limiter_with(no_grace(3, 60, 100), 0.0);

        limiter.decide(&anon("3.3.3.1"));
        clock.advance(Duration::from_secs(3600));
        limiter.decide(&anon("3.3.3.2"));
        assert_eq!(limiter.tracked_identities(), 2);

        let removed = limiter.sweep_idle(Duration::from_secs(1800));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_identities(), 1);
    }
}
