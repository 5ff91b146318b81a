//! Core rate limiter implementation.
//!
//! The limiter binds a policy provider to a strategy and the shared counter
//! store. Evaluation is reject-before-count: a denied request never touches
//! the counter. Admission is recorded through the store's guarded append, so
//! concurrent checks for the same key stay under the aggregate cap without
//! any in-process locking.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TurnstileError};

use super::block::{BlockList, BlockState};
use super::decision::{LimitDecision, Outcome};
use super::policy::{LimitPolicy, PolicyProvider};
use super::store::{CounterStore, LogEntry, UsageSnapshot};
use super::strategy::Strategy;

/// Admission controller over a shared counter store.
///
/// Cheap to share behind an [`Arc`]; all state lives in the store and the
/// policy provider.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policies: Arc<PolicyProvider>,
    blocks: BlockList,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(store: Arc<dyn CounterStore>, policies: Arc<PolicyProvider>) -> Self {
        Self::with_clock(store, policies, Arc::new(SystemClock))
    }

    /// Create a limiter on an injected clock (tests).
    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        policies: Arc<PolicyProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blocks: BlockList::new(Arc::clone(&store)),
            store,
            policies,
            clock,
        }
    }

    /// Store key of the counter for a (namespace, identifier) pair.
    pub fn counter_key(namespace: &str, identifier: &str) -> String {
        format!("{namespace}:{identifier}")
    }

    /// The policy provider backing this limiter.
    pub fn policies(&self) -> &Arc<PolicyProvider> {
        &self.policies
    }

    /// Check whether `cost` units of work may proceed for `identifier` under
    /// the policy registered for `namespace`, and record the usage if so.
    ///
    /// Returns the full tagged outcome; store failures surface as errors and
    /// are never treated as an admission. Decision and charge share the
    /// single guarded record call, so a caller cancelled mid-check either
    /// left no trace or was charged in full.
    pub async fn is_allowed(
        &self,
        identifier: &str,
        namespace: &str,
        cost: u32,
    ) -> Result<Outcome> {
        if cost == 0 {
            return Err(TurnstileError::InvalidRequest(
                "cost must be positive".to_string(),
            ));
        }
        let policy = self.resolve_policy(namespace)?;
        let now = self.clock.now();

        // A live block overrides all normal evaluation and leaves the
        // counter untouched.
        if let Some(ttl) = self.blocks.active_block(identifier).await? {
            debug!(
                namespace = %namespace,
                identifier = %identifier,
                retry_after = ttl.as_secs(),
                "Denying blocked identifier"
            );
            return Ok(Outcome::DeniedBlocked(Self::blocked_decision(
                &policy, now, ttl,
            )));
        }

        let key = Self::counter_key(namespace, identifier);
        let cutoff = Self::cutoff(&policy, now);
        let snapshot = self.store.log_snapshot(&key, cutoff).await?;
        let (count, elapsed) = Self::usage(&policy, &snapshot, now);
        let anchor = snapshot.earliest.unwrap_or(now);

        trace!(
            key = %key,
            count = count,
            elapsed = elapsed.as_secs_f64(),
            cost = cost,
            "Evaluating admission"
        );

        if policy.strategy.should_allow(&policy, count, elapsed, cost) {
            let entries = LogEntry::batch(now, cost);
            let ceiling = policy.strategy.record_ceiling(&policy, elapsed);
            let recorded = self
                .store
                .log_append_guarded(
                    &key,
                    &entries,
                    cutoff,
                    ceiling,
                    policy.window(),
                    Self::refresh_ttl(&policy),
                )
                .await?;
            if recorded {
                let decision =
                    Self::build_decision(&policy, count + cost as u64, elapsed, anchor, now, true);
                return Ok(Outcome::Allowed(decision));
            }
            // Concurrent admissions filled the window between the snapshot
            // and the record; fall through to the denial path.
        }

        debug!(
            namespace = %namespace,
            identifier = %identifier,
            count = count,
            limit = policy.max_requests,
            "Rate limit exceeded"
        );

        let mut decision = Self::build_decision(&policy, count, elapsed, anchor, now, false);
        match self
            .blocks
            .record_violation(namespace, identifier, &policy, now)
            .await?
        {
            BlockState::Blocked {
                retry_after,
                newly_blocked,
            } => {
                decision.remaining = 0;
                decision.retry_after = retry_after.as_secs_f64().ceil() as u64;
                decision.reset_time = (now + retry_after.as_secs_f64()).ceil() as u64;
                if newly_blocked {
                    // The violation that engages the block is still reported
                    // as a policy denial; subsequent calls short-circuit.
                    Ok(Outcome::DeniedPolicy(decision))
                } else {
                    Ok(Outcome::DeniedBlocked(decision))
                }
            }
            BlockState::Unblocked => Ok(Outcome::DeniedPolicy(decision)),
        }
    }

    /// Like [`is_allowed`](Self::is_allowed), but converts denials into
    /// typed errors for callers that propagate with `?`.
    pub async fn check(
        &self,
        identifier: &str,
        namespace: &str,
        cost: u32,
    ) -> Result<LimitDecision> {
        match self.is_allowed(identifier, namespace, cost).await? {
            Outcome::Allowed(decision) => Ok(decision),
            Outcome::DeniedPolicy(decision) => Err(TurnstileError::Exceeded(decision)),
            Outcome::DeniedBlocked(decision) => Err(TurnstileError::Blocked(decision)),
        }
    }

    /// Read-only view of the current budget. Performs the store-side
    /// cleanup+read but never records usage.
    pub async fn get_limit_info(&self, identifier: &str, namespace: &str) -> Result<LimitDecision> {
        let policy = self.resolve_policy(namespace)?;
        let now = self.clock.now();

        if let Some(ttl) = self.blocks.active_block(identifier).await? {
            return Ok(Self::blocked_decision(&policy, now, ttl));
        }

        let key = Self::counter_key(namespace, identifier);
        let snapshot = self
            .store
            .log_snapshot(&key, Self::cutoff(&policy, now))
            .await?;
        let (count, elapsed) = Self::usage(&policy, &snapshot, now);
        let anchor = snapshot.earliest.unwrap_or(now);
        let allowed = policy.strategy.should_allow(&policy, count, elapsed, 1);
        Ok(Self::build_decision(
            &policy, count, elapsed, anchor, now, allowed,
        ))
    }

    /// Delete the counter and violation log for an identifier, restoring the
    /// full budget immediately.
    pub async fn reset(&self, identifier: &str, namespace: &str) -> Result<()> {
        info!(namespace = %namespace, identifier = %identifier, "Resetting rate limit state");
        self.store
            .remove(&[
                Self::counter_key(namespace, identifier),
                BlockList::violations_key(namespace, identifier),
            ])
            .await?;
        Ok(())
    }

    /// Administrative reset: also lifts an active block.
    pub async fn reset_all(&self, identifier: &str, namespace: &str) -> Result<()> {
        info!(namespace = %namespace, identifier = %identifier, "Resetting limit state and block");
        self.store
            .remove(&[
                Self::counter_key(namespace, identifier),
                BlockList::violations_key(namespace, identifier),
                BlockList::block_key(identifier),
            ])
            .await?;
        Ok(())
    }

    /// Upsert the policy for a namespace. Effective for subsequent checks;
    /// existing counters are not migrated. For strategy selection beyond the
    /// fixed-window default, register a full policy via
    /// [`policies`](Self::policies).
    pub fn configure_limit(
        &self,
        namespace: &str,
        max_requests: u64,
        window_seconds: u64,
        block_duration: Option<u64>,
        refill_rate: Option<f64>,
    ) {
        let mut policy = LimitPolicy::new(namespace, max_requests, window_seconds);
        if let Some(seconds) = block_duration {
            policy = policy.with_block(seconds);
        }
        if let Some(rate) = refill_rate {
            policy = policy.with_refill_rate(rate);
        }
        self.policies.upsert(namespace, policy);
    }

    fn resolve_policy(&self, namespace: &str) -> Result<Arc<LimitPolicy>> {
        self.policies.get(namespace).ok_or_else(|| {
            TurnstileError::InvalidRequest(format!("no policy for namespace {namespace:?}"))
        })
    }

    /// Prune horizon for the strategy: only the sliding window discards
    /// entries before the key's TTL does.
    fn cutoff(policy: &LimitPolicy, now: f64) -> Option<f64> {
        match policy.strategy {
            Strategy::SlidingWindow => Some(now - policy.window_seconds as f64),
            Strategy::FixedWindow | Strategy::TokenBucket => None,
        }
    }

    /// Whether writes extend the counter's TTL. Fixed-window and bucket
    /// counters stay anchored to their first write.
    fn refresh_ttl(policy: &LimitPolicy) -> bool {
        matches!(policy.strategy, Strategy::SlidingWindow)
    }

    /// Live count and elapsed time for a snapshot. A fresh key is treated as
    /// having the full window elapsed.
    fn usage(policy: &LimitPolicy, snapshot: &UsageSnapshot, now: f64) -> (u64, Duration) {
        match snapshot.earliest {
            Some(earliest) if snapshot.count > 0 => (
                snapshot.count,
                Duration::from_secs_f64((now - earliest).max(0.0)),
            ),
            _ => (0, policy.window()),
        }
    }

    fn build_decision(
        policy: &LimitPolicy,
        count: u64,
        elapsed: Duration,
        anchor: f64,
        now: f64,
        allowed: bool,
    ) -> LimitDecision {
        let reset_at = anchor + policy.window_seconds as f64;
        LimitDecision {
            allowed,
            limit: policy.max_requests,
            remaining: policy.strategy.remaining(policy, count, elapsed),
            reset_time: reset_at.ceil() as u64,
            retry_after: if allowed {
                0
            } else {
                (reset_at - now).max(0.0).ceil() as u64
            },
        }
    }

    fn blocked_decision(policy: &LimitPolicy, now: f64, ttl: Duration) -> LimitDecision {
        let retry_after = ttl.as_secs_f64().ceil() as u64;
        LimitDecision {
            allowed: false,
            limit: policy.max_requests,
            remaining: 0,
            reset_time: (now + ttl.as_secs_f64()).ceil() as u64,
            retry_after,
        }
    }
}
