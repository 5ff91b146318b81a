//! Route tier selection.
//!
//! Maps request paths to policy namespaces: sensitive routes get a strict
//! tier, public reads a lenient one, everything else the default. Matching
//! is first-hit over substring patterns, so order the tiers from most to
//! least sensitive.

use serde::{Deserialize, Serialize};

/// One tier: route patterns mapped to a policy namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier {
    /// Policy namespace applied when a pattern matches.
    pub policy: String,
    /// Substring patterns matched against the request path.
    pub patterns: Vec<String>,
}

/// Ordered tier map with a default namespace for unmatched routes.
#[derive(Debug, Clone)]
pub struct TierMap {
    tiers: Vec<Tier>,
    default_namespace: String,
}

impl TierMap {
    /// A map where every route resolves to `default_namespace`.
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            tiers: Vec::new(),
            default_namespace: default_namespace.into(),
        }
    }

    /// Build a map from pre-assembled tiers.
    pub fn with_tiers(default_namespace: impl Into<String>, tiers: Vec<Tier>) -> Self {
        Self {
            tiers,
            default_namespace: default_namespace.into(),
        }
    }

    /// Append a tier mapping `patterns` to `policy`.
    pub fn add(mut self, policy: impl Into<String>, patterns: &[&str]) -> Self {
        self.tiers.push(Tier {
            policy: policy.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    /// Resolve the policy namespace for a request path.
    pub fn namespace_for(&self, path: &str) -> &str {
        for tier in &self.tiers {
            if tier.patterns.iter().any(|pattern| path.contains(pattern.as_str())) {
                return &tier.policy;
            }
        }
        &self.default_namespace
    }
}
