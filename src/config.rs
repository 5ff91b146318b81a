//! Configuration management for Turnstile.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::http::{Tier, TierMap};
use crate::limit::{LimitPolicy, PolicyProvider, Strategy};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Policies and route tiers
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check budgets and tier references.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in &self.limits.policies {
            if policy.max_requests == 0 || policy.window_seconds == 0 {
                return Err(TurnstileError::Config(format!(
                    "policy {name:?} must have a positive budget and window"
                )));
            }
        }
        for tier in &self.limits.tiers {
            if !self.limits.policies.contains_key(&tier.policy) {
                return Err(TurnstileError::Config(format!(
                    "tier references unknown policy {:?}",
                    tier.policy
                )));
            }
        }
        if !self.limits.policies.contains_key(&self.limits.default_policy) {
            return Err(TurnstileError::Config(format!(
                "default policy {:?} is not defined",
                self.limits.default_policy
            )));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; counters stay in process memory when unset.
    pub redis_url: Option<String>,

    /// Deadline for a single store operation, in milliseconds. Separate
    /// from any request timeout of the host.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Admit requests when the store is unreachable instead of rejecting
    /// them with 503.
    #[serde(default)]
    pub fail_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            op_timeout_ms: default_op_timeout_ms(),
            fail_open: false,
        }
    }
}

fn default_op_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    /// The per-operation deadline as a [`Duration`].
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// A policy budget as written in configuration; the map key becomes the
/// policy name and namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    pub max_requests: u64,
    pub window_seconds: u64,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub block_duration_seconds: Option<u64>,
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,
}

fn default_violation_threshold() -> u32 {
    1
}

impl PolicySpec {
    fn into_policy(self, name: &str) -> LimitPolicy {
        let mut policy = LimitPolicy::new(name, self.max_requests, self.window_seconds)
            .with_strategy(self.strategy)
            .with_violation_threshold(self.violation_threshold);
        if let Some(seconds) = self.block_duration_seconds {
            policy = policy.with_block(seconds);
        }
        if let Some(rate) = self.refill_rate {
            policy = policy.with_refill_rate(rate);
        }
        policy
    }
}

/// Policies and route tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Policy applied to namespaces and routes with no tier of their own.
    #[serde(default = "default_policy_name")]
    pub default_policy: String,

    /// Named policies, keyed by namespace.
    #[serde(default = "default_policies")]
    pub policies: HashMap<String, PolicySpec>,

    /// Route patterns mapped to policy namespaces, most sensitive first.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<Tier>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_policy: default_policy_name(),
            policies: default_policies(),
            tiers: default_tiers(),
        }
    }
}

fn default_policy_name() -> String {
    "normal".to_string()
}

fn default_policies() -> HashMap<String, PolicySpec> {
    let mut policies = HashMap::new();
    policies.insert(
        "strict".to_string(),
        PolicySpec {
            max_requests: 5,
            window_seconds: 60,
            strategy: Strategy::FixedWindow,
            block_duration_seconds: Some(300),
            refill_rate: None,
            violation_threshold: 3,
        },
    );
    policies.insert(
        "normal".to_string(),
        PolicySpec {
            max_requests: 60,
            window_seconds: 60,
            strategy: Strategy::FixedWindow,
            block_duration_seconds: None,
            refill_rate: None,
            violation_threshold: 1,
        },
    );
    policies.insert(
        "lenient".to_string(),
        PolicySpec {
            max_requests: 120,
            window_seconds: 60,
            strategy: Strategy::SlidingWindow,
            block_duration_seconds: None,
            refill_rate: None,
            violation_threshold: 1,
        },
    );
    policies
}

fn default_tiers() -> Vec<Tier> {
    vec![
        Tier {
            policy: "strict".to_string(),
            patterns: vec![
                "/auth".to_string(),
                "/login".to_string(),
                "/password".to_string(),
            ],
        },
        Tier {
            policy: "lenient".to_string(),
            patterns: vec!["/public".to_string(), "/healthz".to_string()],
        },
    ]
}

impl LimitsConfig {
    /// Build the policy provider: every named policy registered under its
    /// own namespace, with the default policy as fallback.
    pub fn build_provider(&self) -> Arc<PolicyProvider> {
        let fallback = self
            .policies
            .get(&self.default_policy)
            .cloned()
            .map(|spec| spec.into_policy(&self.default_policy))
            .unwrap_or_else(|| LimitPolicy::new("default", 100, 60));
        let provider = PolicyProvider::with_default(fallback);
        for (name, spec) in &self.policies {
            provider.upsert(name.clone(), spec.clone().into_policy(name));
        }
        Arc::new(provider)
    }

    /// Build the route tier map.
    pub fn tier_map(&self) -> Arc<TierMap> {
        Arc::new(TierMap::with_tiers(
            self.default_policy.clone(),
            self.tiers.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TurnstileConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert!(config.store.redis_url.is_none());
        assert_eq!(config.store.op_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  listen_addr: 0.0.0.0:9000
store:
  redis_url: redis://127.0.0.1:6379
  op_timeout_ms: 100
  fail_open: true
limits:
  default_policy: api
  policies:
    api:
      max_requests: 30
      window_seconds: 60
    auth:
      max_requests: 5
      window_seconds: 60
      block_duration_seconds: 300
      violation_threshold: 3
    search:
      max_requests: 10
      window_seconds: 60
      strategy: token_bucket
      refill_rate: 0.5
  tiers:
    - policy: auth
      patterns: ["/auth", "/login"]
"#;
        let config: TurnstileConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert!(config.store.fail_open);

        let provider = config.limits.build_provider();
        let auth = provider.get("auth").unwrap();
        assert_eq!(auth.max_requests, 5);
        assert_eq!(auth.block_duration_seconds, Some(300));
        assert_eq!(auth.violation_threshold, 3);

        let search = provider.get("search").unwrap();
        assert_eq!(search.strategy, Strategy::TokenBucket);
        assert_eq!(search.refill_rate, Some(0.5));

        // Unmatched namespaces resolve to the configured default.
        assert_eq!(provider.get("anything").unwrap().name, "api");

        let tiers = config.limits.tier_map();
        assert_eq!(tiers.namespace_for("/auth/login"), "auth");
        assert_eq!(tiers.namespace_for("/games"), "api");
    }

    #[test]
    fn test_zero_budget_is_rejected() {
        let yaml = r#"
limits:
  default_policy: api
  policies:
    api:
      max_requests: 0
      window_seconds: 60
  tiers: []
"#;
        let config: TurnstileConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tier_referencing_unknown_policy_is_rejected() {
        let yaml = r#"
limits:
  default_policy: api
  policies:
    api:
      max_requests: 10
      window_seconds: 60
  tiers:
    - policy: missing
      patterns: ["/x"]
"#;
        let config: TurnstileConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
