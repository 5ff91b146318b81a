//! Blocking/quarantine extension.
//!
//! A secondary state machine layered over normal evaluation: once an
//! identifier crosses a policy's violation threshold, a block marker with
//! its own TTL denies all traffic until it expires. The marker is written
//! with set-if-absent semantics, so continued violations count down the
//! existing block rather than extending it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::policy::LimitPolicy;
use super::store::{CounterStore, LogEntry, StoreError};

/// Result of feeding one violation into the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockState {
    /// Below the threshold; normal evaluation continues.
    Unblocked,
    /// The identifier is quarantined for `retry_after`.
    Blocked {
        retry_after: Duration,
        /// Whether this violation is the one that engaged the block.
        newly_blocked: bool,
    },
}

/// Tracks violations and block markers in the shared store.
pub struct BlockList {
    store: Arc<dyn CounterStore>,
}

impl BlockList {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Store key of the block marker for an identifier. Markers are scoped
    /// to the identifier alone: a blocked caller is blocked everywhere.
    pub fn block_key(identifier: &str) -> String {
        format!("blocked:{identifier}")
    }

    /// Store key of the violation log for a (namespace, identifier) pair.
    pub fn violations_key(namespace: &str, identifier: &str) -> String {
        format!("violations:{namespace}:{identifier}")
    }

    /// Remaining quarantine time for an identifier, if a block is live.
    pub async fn active_block(&self, identifier: &str) -> Result<Option<Duration>, StoreError> {
        self.store.marker_ttl(&Self::block_key(identifier)).await
    }

    /// Record one policy denial at `now` and engage a block if the
    /// violation threshold is crossed. No-op for policies without a block
    /// duration.
    pub async fn record_violation(
        &self,
        namespace: &str,
        identifier: &str,
        policy: &LimitPolicy,
        now: f64,
    ) -> Result<BlockState, StoreError> {
        let Some(block_duration) = policy.block_duration() else {
            return Ok(BlockState::Unblocked);
        };

        let violations_key = Self::violations_key(namespace, identifier);
        self.store
            .log_append(&violations_key, &[LogEntry::tagged(now)], policy.window(), true)
            .await?;
        let violations = self
            .store
            .log_snapshot(&violations_key, Some(now - policy.window_seconds as f64))
            .await?;

        debug!(
            namespace = %namespace,
            identifier = %identifier,
            violations = violations.count,
            threshold = policy.violation_threshold,
            "Recorded limit violation"
        );

        if violations.count < policy.violation_threshold as u64 {
            return Ok(BlockState::Unblocked);
        }

        let block_key = Self::block_key(identifier);
        let newly_blocked = self.store.put_marker(&block_key, block_duration).await?;
        if newly_blocked {
            warn!(
                namespace = %namespace,
                identifier = %identifier,
                block_seconds = block_duration.as_secs(),
                "Blocking identifier after repeated violations"
            );
        }
        let retry_after = self
            .store
            .marker_ttl(&block_key)
            .await?
            .unwrap_or(block_duration);
        Ok(BlockState::Blocked {
            retry_after,
            newly_blocked,
        })
    }

    /// Drop the block marker and violation log for an identifier.
    pub async fn clear(&self, namespace: &str, identifier: &str) -> Result<(), StoreError> {
        self.store
            .remove(&[
                Self::block_key(identifier),
                Self::violations_key(namespace, identifier),
            ])
            .await
    }
}
