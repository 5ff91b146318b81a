//! Limit policies and the policy provider.
//!
//! A policy names an admission budget: how many requests fit in a window,
//! which strategy evaluates them, and whether repeated violations quarantine
//! the caller. Policies are registered by namespace and may be hot-swapped at
//! any time; existing counters are never migrated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::strategy::Strategy;

fn default_violation_threshold() -> u32 {
    1
}

/// Admission budget for one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// Policy name, used for logging and introspection.
    pub name: String,
    /// Maximum requests allowed in the time window.
    pub max_requests: u64,
    /// Length of the time window in seconds.
    pub window_seconds: u64,
    /// Strategy used to evaluate requests against the budget.
    #[serde(default)]
    pub strategy: Strategy,
    /// Quarantine duration applied after repeated violations.
    #[serde(default)]
    pub block_duration_seconds: Option<u64>,
    /// Tokens restored per second (token bucket only). Defaults to
    /// `max_requests / window_seconds` when unset.
    #[serde(default)]
    pub refill_rate: Option<f64>,
    /// Denials within a window before a block engages.
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,
}

impl LimitPolicy {
    /// Create a fixed-window policy with the given budget.
    pub fn new(name: impl Into<String>, max_requests: u64, window_seconds: u64) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window_seconds,
            strategy: Strategy::default(),
            block_duration_seconds: None,
            refill_rate: None,
            violation_threshold: default_violation_threshold(),
        }
    }

    /// Select the evaluation strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Quarantine the caller for `seconds` once the violation threshold is
    /// crossed.
    pub fn with_block(mut self, seconds: u64) -> Self {
        self.block_duration_seconds = Some(seconds);
        self
    }

    /// Token-bucket refill rate in tokens per second.
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = Some(rate);
        self
    }

    /// Number of denials within a window before a block engages.
    pub fn with_violation_threshold(mut self, threshold: u32) -> Self {
        self.violation_threshold = threshold.max(1);
        self
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// The quarantine duration, if blocking is enabled.
    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration_seconds.map(Duration::from_secs)
    }

    /// Effective refill rate in tokens per second.
    pub fn effective_refill_rate(&self) -> f64 {
        self.refill_rate
            .unwrap_or(self.max_requests as f64 / self.window_seconds.max(1) as f64)
    }
}

/// Registry of policies, keyed by namespace.
///
/// The provider is passed explicitly to the limiter rather than living in
/// process-wide state, so tests and embedders control its lifetime. Lookups
/// fall back to the default policy when a namespace has no entry of its own.
pub struct PolicyProvider {
    policies: RwLock<HashMap<String, Arc<LimitPolicy>>>,
    default_policy: RwLock<Option<Arc<LimitPolicy>>>,
}

impl PolicyProvider {
    /// Create an empty provider with no default policy. Lookups for
    /// unregistered namespaces will fail.
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            default_policy: RwLock::new(None),
        }
    }

    /// Create a provider whose unmatched namespaces resolve to `default`.
    pub fn with_default(default: LimitPolicy) -> Self {
        let provider = Self::new();
        provider.set_default(default);
        provider
    }

    /// Install or replace the fallback policy.
    pub fn set_default(&self, policy: LimitPolicy) {
        *self.default_policy.write() = Some(Arc::new(policy));
    }

    /// Insert or replace the policy for a namespace. Effective immediately
    /// for subsequent checks; in-flight counters are not migrated.
    pub fn upsert(&self, namespace: impl Into<String>, policy: LimitPolicy) {
        let namespace = namespace.into();
        info!(
            namespace = %namespace,
            policy = %policy.name,
            max_requests = policy.max_requests,
            window_seconds = policy.window_seconds,
            "Registering limit policy"
        );
        self.policies.write().insert(namespace, Arc::new(policy));
    }

    /// Resolve the policy for a namespace, falling back to the default.
    pub fn get(&self, namespace: &str) -> Option<Arc<LimitPolicy>> {
        if let Some(policy) = self.policies.read().get(namespace) {
            return Some(Arc::clone(policy));
        }
        self.default_policy.read().clone()
    }

    /// Resolve a namespace without consulting the default.
    pub fn lookup(&self, namespace: &str) -> Option<Arc<LimitPolicy>> {
        self.policies.read().get(namespace).cloned()
    }

    /// Number of registered namespaces (excluding the default).
    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    /// Whether no namespaces are registered.
    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}

impl Default for PolicyProvider {
    fn default() -> Self {
        Self::new()
    }
}
