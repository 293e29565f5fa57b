//! Token bucket with lazy, compute-on-access refill

use std::time::Instant;

/// A token bucket that refills continuously over time.
///
/// Refill happens lazily when the bucket is touched, so idle buckets cost
/// nothing. `0 <= tokens <= capacity` holds at all times.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket. `refill_rate` is tokens per second.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: now,
        }
    }

    /// Refill based on elapsed time, then take one token if available.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub(crate) fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Seconds until at least one token is available, assuming no further
    /// consumption. Zero when a token is already available.
    pub fn seconds_until_available(&self) -> u64 {
        if self.tokens >= 1.0 || self.refill_rate <= 0.0 {
            return 0;
        }
        ((1.0 - self.tokens) / self.refill_rate).ceil() as u64
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
