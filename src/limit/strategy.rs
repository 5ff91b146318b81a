//! Admission strategies.
//!
//! Pure decision functions: no I/O, no interior state. Each strategy answers
//! whether `cost` more units fit given the current usage snapshot, and how
//! much budget remains. The limiter supplies `current_count` and `elapsed`
//! from the counter store; a key with no prior usage is evaluated as if the
//! full window had elapsed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::policy::LimitPolicy;

/// Counting scheme used to evaluate requests against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Discrete window anchored to the first write for the key.
    #[default]
    FixedWindow,
    /// Rate approximation of a continuously moving window.
    SlidingWindow,
    /// Capacity of tokens spent per admitted unit and refilled over time.
    TokenBucket,
}

impl Strategy {
    /// Whether `cost` more units fit under `policy` given `current_count`
    /// units consumed over `elapsed` time.
    pub fn should_allow(
        &self,
        policy: &LimitPolicy,
        current_count: u64,
        elapsed: Duration,
        cost: u32,
    ) -> bool {
        let cost = cost as u64;
        match self {
            Strategy::FixedWindow => current_count + cost <= policy.max_requests,
            Strategy::SlidingWindow => {
                // Approximate the moving window as an observed rate; elapsed
                // is floored at one second so a burst on a young key cannot
                // divide by (near) zero.
                let rate = current_count as f64 / elapsed.as_secs_f64().max(1.0);
                rate <= policy.max_requests as f64 / policy.window_seconds.max(1) as f64
            }
            Strategy::TokenBucket => {
                Self::tokens_available(policy, current_count, elapsed) >= cost
            }
        }
    }

    /// Budget still available for the snapshot, clamped to
    /// `[0, max_requests]`.
    pub fn remaining(&self, policy: &LimitPolicy, current_count: u64, elapsed: Duration) -> u64 {
        match self {
            Strategy::FixedWindow | Strategy::SlidingWindow => {
                policy.max_requests.saturating_sub(current_count)
            }
            Strategy::TokenBucket => Self::tokens_available(policy, current_count, elapsed),
        }
    }

    /// Upper bound on the counter after an admission. Used by the store's
    /// guarded append to keep concurrent admissions under the aggregate cap.
    pub fn record_ceiling(&self, policy: &LimitPolicy, elapsed: Duration) -> u64 {
        match self {
            Strategy::FixedWindow | Strategy::SlidingWindow => policy.max_requests,
            // Consumptions accumulate in the counter until it expires, so a
            // refilled bucket may legitimately exceed max_requests.
            Strategy::TokenBucket => {
                policy.max_requests + Self::tokens_refilled(policy, elapsed)
            }
        }
    }

    fn tokens_refilled(policy: &LimitPolicy, elapsed: Duration) -> u64 {
        (elapsed.as_secs_f64() * policy.effective_refill_rate()).floor() as u64
    }

    fn tokens_available(policy: &LimitPolicy, current_count: u64, elapsed: Duration) -> u64 {
        let refilled = Self::tokens_refilled(policy, elapsed);
        if current_count >= policy.max_requests {
            // Once empty, nothing is admitted until a full refill has
            // accumulated.
            if refilled >= policy.max_requests {
                policy.max_requests
            } else {
                0
            }
        } else {
            (policy.max_requests - current_count + refilled).min(policy.max_requests)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max: u64, window: u64) -> LimitPolicy {
        LimitPolicy::new("fixed", max, window)
    }

    fn sliding(max: u64, window: u64) -> LimitPolicy {
        LimitPolicy::new("sliding", max, window).with_strategy(Strategy::SlidingWindow)
    }

    fn bucket(max: u64, window: u64, refill: f64) -> LimitPolicy {
        LimitPolicy::new("bucket", max, window)
            .with_strategy(Strategy::TokenBucket)
            .with_refill_rate(refill)
    }

    const ZERO: Duration = Duration::ZERO;

    #[test]
    fn test_fixed_window_admits_up_to_max() {
        let policy = fixed(2, 60);
        let s = Strategy::FixedWindow;

        assert!(s.should_allow(&policy, 0, ZERO, 1));
        assert!(s.should_allow(&policy, 1, ZERO, 1));
        assert!(!s.should_allow(&policy, 2, ZERO, 1));
    }

    #[test]
    fn test_fixed_window_batch_cost() {
        let policy = fixed(10, 60);
        let s = Strategy::FixedWindow;

        assert!(s.should_allow(&policy, 7, ZERO, 3));
        assert!(!s.should_allow(&policy, 7, ZERO, 4));
        assert_eq!(s.remaining(&policy, 7, ZERO), 3);
    }

    #[test]
    fn test_fixed_window_remaining_clamps_at_zero() {
        let policy = fixed(5, 60);
        assert_eq!(Strategy::FixedWindow.remaining(&policy, 9, ZERO), 0);
    }

    #[test]
    fn test_sliding_window_compares_observed_rate() {
        // 120 per 60s, threshold rate 2/s.
        let policy = sliding(120, 60);
        let s = Strategy::SlidingWindow;

        // 30 requests over 30s is 1/s, under the threshold.
        assert!(s.should_allow(&policy, 30, Duration::from_secs(30), 1));
        // 90 requests over 30s is 3/s, over the threshold.
        assert!(!s.should_allow(&policy, 90, Duration::from_secs(30), 1));
    }

    #[test]
    fn test_sliding_window_floors_elapsed_at_one_second() {
        let policy = sliding(120, 60);
        let s = Strategy::SlidingWindow;

        // A burst in the first milliseconds is rated against a full second.
        assert!(s.should_allow(&policy, 2, Duration::from_millis(5), 1));
        assert!(!s.should_allow(&policy, 3, Duration::from_millis(5), 1));
    }

    #[test]
    fn test_sliding_window_fresh_key_admits() {
        let policy = sliding(10, 60);
        // Fresh keys are evaluated with the full window elapsed.
        assert!(Strategy::SlidingWindow.should_allow(&policy, 0, Duration::from_secs(60), 1));
    }

    #[test]
    fn test_token_bucket_spends_down_to_empty() {
        let policy = bucket(5, 60, 1.0 / 60.0);
        let s = Strategy::TokenBucket;

        assert!(s.should_allow(&policy, 0, ZERO, 1));
        assert!(s.should_allow(&policy, 4, ZERO, 1));
        assert!(!s.should_allow(&policy, 5, ZERO, 1));
    }

    #[test]
    fn test_token_bucket_empty_until_full_refill() {
        let policy = bucket(5, 60, 1.0 / 60.0);
        let s = Strategy::TokenBucket;

        // Half a window refills nothing usable while empty.
        assert!(!s.should_allow(&policy, 5, Duration::from_secs(30), 1));
        assert_eq!(s.remaining(&policy, 5, Duration::from_secs(30)), 0);

        // A full refill (5 tokens at 1/60 per second = 300s) reopens the
        // bucket at capacity.
        assert!(s.should_allow(&policy, 5, Duration::from_secs(300), 1));
        assert_eq!(s.remaining(&policy, 5, Duration::from_secs(300)), 5);
    }

    #[test]
    fn test_token_bucket_partial_consumption_refills() {
        let policy = bucket(10, 60, 1.0);
        let s = Strategy::TokenBucket;

        // 6 consumed, 3s elapsed: 10 - 6 + 3 = 7 available.
        assert_eq!(s.remaining(&policy, 6, Duration::from_secs(3)), 7);
        assert!(s.should_allow(&policy, 6, Duration::from_secs(3), 7));
        assert!(!s.should_allow(&policy, 6, Duration::from_secs(3), 8));
    }

    #[test]
    fn test_token_bucket_available_clamps_at_capacity() {
        let policy = bucket(10, 60, 5.0);
        // 1 consumed but a long idle stretch: capacity, not more.
        assert_eq!(
            Strategy::TokenBucket.remaining(&policy, 1, Duration::from_secs(600)),
            10
        );
    }

    #[test]
    fn test_record_ceiling_per_strategy() {
        let policy = fixed(10, 60);
        assert_eq!(Strategy::FixedWindow.record_ceiling(&policy, ZERO), 10);
        assert_eq!(Strategy::SlidingWindow.record_ceiling(&policy, ZERO), 10);

        let policy = bucket(10, 60, 1.0);
        assert_eq!(
            Strategy::TokenBucket.record_ceiling(&policy, Duration::from_secs(5)),
            15
        );
    }

    #[test]
    fn test_strategy_deserializes_snake_case() {
        let s: Strategy = serde_yaml::from_str("sliding_window").unwrap();
        assert_eq!(s, Strategy::SlidingWindow);
        let s: Strategy = serde_yaml::from_str("token_bucket").unwrap();
        assert_eq!(s, Strategy::TokenBucket);
    }
}
