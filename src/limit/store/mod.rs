//! Shared counter store.
//!
//! The store is the only coordination point between limiter instances: a
//! per-key ordered log of uniquely tagged, timestamped entries plus expiring
//! block markers. Each trait operation is a single atomic unit on the store
//! side; the cleanup+read of [`CounterStore::log_snapshot`] can never be
//! interleaved with another caller's mutation of the same key.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Failure talking to the counter store. Always distinct from a policy
/// decision so callers can choose fail-open or fail-closed explicitly.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the connection was lost.
    #[error("connection failure: {0}")]
    Connection(String),

    /// The operation exceeded the store's own deadline. Distinct from the
    /// host's request timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One usage entry in a per-key ordered log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Unique member tag; two entries recorded at the same instant must not
    /// collide.
    pub member: String,
    /// Epoch seconds at which the usage occurred.
    pub timestamp: f64,
}

impl LogEntry {
    /// A new entry at `timestamp` with a collision-free member tag.
    pub fn tagged(timestamp: f64) -> Self {
        Self {
            member: format!("{timestamp:.6}:{}", Uuid::new_v4().simple()),
            timestamp,
        }
    }

    /// A batch of `cost` entries at the same instant, each uniquely tagged.
    pub fn batch(timestamp: f64, cost: u32) -> Vec<Self> {
        (0..cost).map(|_| Self::tagged(timestamp)).collect()
    }
}

/// Result of the atomic cleanup+read: live entry count and the earliest
/// surviving timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UsageSnapshot {
    /// Number of live entries for the key.
    pub count: u64,
    /// Timestamp of the oldest live entry, if any.
    pub earliest: Option<f64>,
}

impl UsageSnapshot {
    /// Whether the key has no recorded usage.
    pub fn is_fresh(&self) -> bool {
        self.count == 0
    }
}

/// Atomic primitives over the shared counter store.
///
/// Keys are caller-composed (`{namespace}:{identifier}` for counters,
/// `blocked:{identifier}` for markers); the store is agnostic to layout.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Prune entries with `timestamp <= cutoff` (when given), then read the
    /// live count and earliest timestamp, as one atomic operation.
    async fn log_snapshot(
        &self,
        key: &str,
        cutoff: Option<f64>,
    ) -> Result<UsageSnapshot, StoreError>;

    /// Append entries and set the key's TTL. With `refresh_ttl` the TTL is
    /// extended on every write; otherwise it is only set when the key has
    /// none, anchoring expiry to the first write.
    async fn log_append(
        &self,
        key: &str,
        entries: &[LogEntry],
        ttl: Duration,
        refresh_ttl: bool,
    ) -> Result<(), StoreError>;

    /// Append entries only if the resulting live count stays within
    /// `ceiling`, pruning at `cutoff` first. Returns whether the append
    /// happened. This is the store-side compare-and-increment that keeps
    /// concurrent admissions under the aggregate cap.
    async fn log_append_guarded(
        &self,
        key: &str,
        entries: &[LogEntry],
        cutoff: Option<f64>,
        ceiling: u64,
        ttl: Duration,
        refresh_ttl: bool,
    ) -> Result<bool, StoreError>;

    /// Create a marker with the given TTL if none is live. Returns whether
    /// the marker was newly created; an existing marker's TTL is never
    /// extended.
    async fn put_marker(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL of a live marker, if present.
    async fn marker_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Delete keys (counters or markers) immediately.
    async fn remove(&self, keys: &[String]) -> Result<(), StoreError>;
}
