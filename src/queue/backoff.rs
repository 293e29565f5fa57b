//! Exponential backoff with load scaling and jitter

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// Computes jittered retry delays for failed requests.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_secs: u64,
    max_secs: u64,
    jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base_secs: u64, max_secs: u64, jitter: bool) -> Self {
        Self {
            base_secs,
            max_secs,
            jitter,
        }
    }

    /// Delay in seconds before the given retry attempt.
    ///
    /// `base * 2^retry_count`, scaled up to 3x by server load, multiplied by
    /// a uniform [0.5, 1.5] jitter factor when enabled, capped at the
    /// maximum. With jitter disabled the result is exact and monotonic in
    /// `retry_count`.
    pub fn delay(&self, retry_count: u32, load: f64) -> u64 {
        let exponential = self.base_secs as f64 * 2f64.powi(retry_count.min(63) as i32);
        let scaled = exponential * (1.0 + 2.0 * load.clamp(0.0, 1.0));

        let final_delay = if self.jitter {
            scaled * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            scaled
        };

        (final_delay.round() as u64).min(self.max_secs)
    }

    /// Retry hint with an absolute retry-after timestamp.
    pub fn suggestion(&self, retry_count: u32, load: f64) -> RetrySuggestion {
        let delay_seconds = self.delay(retry_count, load);
        RetrySuggestion {
            delay_seconds,
            human: humanize(delay_seconds),
            retry_after: Utc::now() + chrono::Duration::seconds(delay_seconds as i64),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 2,
            max_secs: 300,
            jitter: true,
        }
    }
}

/// User-facing retry guidance for a failed request.
#[derive(Debug, Clone, Serialize)]
pub struct RetrySuggestion {
    pub delay_seconds: u64,
    pub human: String,
    pub retry_after: DateTime<Utc>,
}

fn humanize(seconds: u64) -> String {
    if seconds < 60 {
        format!("{} seconds", seconds)
    } else if seconds < 3600 {
        format!("{} minutes", seconds / 60)
    } else {
        format!("{} hours", seconds / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_doubling_without_jitter() {
        let policy = BackoffPolicy::new(2, 300, false);
        assert_eq!(policy.delay(0, 0.0), 2);
        assert_eq!(policy.delay(1, 0.0), 4);
        assert_eq!(policy.delay(2, 0.0), 8);
        assert_eq!(policy.delay(5, 0.0), 64);
        // 2 * 2^8 = 512, capped.
        assert_eq!(policy.delay(8, 0.0), 300);
    }

    #[test]
    fn delay_is_monotonic_in_retry_count() {
        let policy = BackoffPolicy::new(2, 300, false);
        for retry in 0..12 {
            assert!(policy.delay(retry + 1, 0.3) >= policy.delay(retry, 0.3));
        }
    }

    #[test]
    fn load_scales_delay_up_to_three_times() {
        let policy = BackoffPolicy::new(2, 300, false);
        assert_eq!(policy.delay(0, 1.0), 6);
        assert_eq!(policy.delay(0, 0.5), 4);
        // Out-of-range load is clamped.
        assert_eq!(policy.delay(0, 7.0), 6);
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let policy = BackoffPolicy::new(8, 300, true);
        for _ in 0..200 {
            let delay = policy.delay(1, 0.0);
            assert!((8..=24).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn cap_applies_after_jitter_and_scaling() {
        let policy = BackoffPolicy::new(100, 120, true);
        for _ in 0..50 {
            assert!(policy.delay(4, 1.0) <= 120);
        }
    }

    #[test]
    fn suggestion_reports_future_timestamp() {
        let policy = BackoffPolicy::new(90, 300, false);
        let before = Utc::now();
        let suggestion = policy.suggestion(0, 0.0);
        assert_eq!(suggestion.delay_seconds, 90);
        assert_eq!(suggestion.human, "1 minutes");
        assert!(suggestion.retry_after > before);
    }

    #[test]
    fn humanize_picks_sensible_units() {
        assert_eq!(humanize(45), "45 seconds");
        assert_eq!(humanize(120), "2 minutes");
        assert_eq!(humanize(7200), "2 hours");
    }
}
