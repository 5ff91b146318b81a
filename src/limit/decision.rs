//! Admission decision types.

use serde::Serialize;

/// The result of evaluating a request against a policy.
///
/// `reset_time` is in epoch seconds; `retry_after` is the number of seconds
/// the caller should wait before retrying (zero when allowed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitDecision {
    /// Whether the request was (or would be) admitted.
    pub allowed: bool,
    /// Maximum requests permitted by the governing policy.
    pub limit: u64,
    /// Requests still available in the current window.
    pub remaining: u64,
    /// Epoch seconds at which the current window resets.
    pub reset_time: u64,
    /// Seconds until a retry can succeed.
    pub retry_after: u64,
}

/// A fully evaluated admission outcome.
///
/// Store failures are not an outcome; they surface as errors so that callers
/// choose fail-open or fail-closed behavior explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request was admitted and its cost recorded.
    Allowed(LimitDecision),
    /// The request was denied by normal policy evaluation.
    DeniedPolicy(LimitDecision),
    /// The request was denied by an active block marker.
    DeniedBlocked(LimitDecision),
}

impl Outcome {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Outcome::Allowed(_))
    }

    /// The decision payload, regardless of variant.
    pub fn decision(&self) -> &LimitDecision {
        match self {
            Outcome::Allowed(d) | Outcome::DeniedPolicy(d) | Outcome::DeniedBlocked(d) => d,
        }
    }

    /// Consume the outcome, yielding its decision payload.
    pub fn into_decision(self) -> LimitDecision {
        match self {
            Outcome::Allowed(d) | Outcome::DeniedPolicy(d) | Outcome::DeniedBlocked(d) => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool) -> LimitDecision {
        LimitDecision {
            allowed,
            limit: 10,
            remaining: 3,
            reset_time: 1_700_000_060,
            retry_after: 0,
        }
    }

    #[test]
    fn test_outcome_accessors() {
        let allowed = Outcome::Allowed(decision(true));
        assert!(allowed.is_allowed());
        assert_eq!(allowed.decision().remaining, 3);

        let denied = Outcome::DeniedPolicy(decision(false));
        assert!(!denied.is_allowed());
        assert_eq!(denied.into_decision().limit, 10);
    }

    #[test]
    fn test_decision_serializes_to_json() {
        let json = serde_json::to_value(decision(false)).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["remaining"], 3);
        assert_eq!(json["reset_time"], 1_700_000_060u64);
    }
}
