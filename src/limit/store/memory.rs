//! In-process counter store.
//!
//! State lives in [`DashMap`]s; each operation runs under the map's per-shard
//! lock, which makes every trait operation atomic with respect to concurrent
//! callers in the same process. TTLs are enforced lazily on access. Intended
//! for tests and single-instance deployments; cross-instance coordination
//! requires [`RedisStore`](super::RedisStore).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};

use super::{CounterStore, LogEntry, StoreError, UsageSnapshot};

#[derive(Debug)]
struct LogRecord {
    entries: Vec<LogEntry>,
    expires_at: f64,
}

/// Counter store backed by process memory.
pub struct MemoryStore {
    logs: DashMap<String, LogRecord>,
    markers: DashMap<String, f64>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on an injected clock (tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: DashMap::new(),
            markers: DashMap::new(),
            clock,
        }
    }

    /// Number of live counter keys, expired records included until their
    /// next access.
    pub fn key_count(&self) -> usize {
        self.logs.len()
    }

    fn prune(record: &mut LogRecord, cutoff: Option<f64>) {
        if let Some(cutoff) = cutoff {
            record.entries.retain(|e| e.timestamp > cutoff);
        }
    }

    fn snapshot_of(record: &LogRecord) -> UsageSnapshot {
        UsageSnapshot {
            count: record.entries.len() as u64,
            earliest: record
                .entries
                .iter()
                .map(|e| e.timestamp)
                .fold(None, |min, t| Some(min.map_or(t, |m: f64| m.min(t)))),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn log_snapshot(
        &self,
        key: &str,
        cutoff: Option<f64>,
    ) -> Result<UsageSnapshot, StoreError> {
        let now = self.clock.now();
        let mut expired = false;
        if let Some(mut record) = self.logs.get_mut(key) {
            if now >= record.expires_at {
                expired = true;
            } else {
                Self::prune(&mut record, cutoff);
                return Ok(Self::snapshot_of(&record));
            }
        }
        if expired {
            self.logs.remove(key);
        }
        Ok(UsageSnapshot::default())
    }

    async fn log_append(
        &self,
        key: &str,
        entries: &[LogEntry],
        ttl: Duration,
        refresh_ttl: bool,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut record = self.logs.entry(key.to_string()).or_insert_with(|| LogRecord {
            entries: Vec::new(),
            expires_at: now + ttl.as_secs_f64(),
        });
        if now >= record.expires_at {
            // Stale record left behind by lazy expiry; restart it.
            record.entries.clear();
            record.expires_at = now + ttl.as_secs_f64();
        } else if refresh_ttl {
            record.expires_at = now + ttl.as_secs_f64();
        }
        record.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn log_append_guarded(
        &self,
        key: &str,
        entries: &[LogEntry],
        cutoff: Option<f64>,
        ceiling: u64,
        ttl: Duration,
        refresh_ttl: bool,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut record = self.logs.entry(key.to_string()).or_insert_with(|| LogRecord {
            entries: Vec::new(),
            expires_at: now + ttl.as_secs_f64(),
        });
        if now >= record.expires_at {
            record.entries.clear();
            record.expires_at = now + ttl.as_secs_f64();
        }
        Self::prune(&mut record, cutoff);

        if record.entries.len() as u64 + entries.len() as u64 > ceiling {
            return Ok(false);
        }
        if refresh_ttl {
            record.expires_at = now + ttl.as_secs_f64();
        }
        record.entries.extend_from_slice(entries);
        Ok(true)
    }

    async fn put_marker(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut newly = false;
        let mut marker = self.markers.entry(key.to_string()).or_insert_with(|| {
            newly = true;
            now + ttl.as_secs_f64()
        });
        if !newly && now >= *marker {
            // Expired marker; a new block may start.
            *marker = now + ttl.as_secs_f64();
            newly = true;
        }
        Ok(newly)
    }

    async fn marker_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let mut expired = false;
        if let Some(expires_at) = self.markers.get(key) {
            if now < *expires_at {
                return Ok(Some(Duration::from_secs_f64(*expires_at - now)));
            }
            expired = true;
        }
        if expired {
            self.markers.remove(key);
        }
        Ok(None)
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.logs.remove(key);
            self.markers.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(now: f64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::at(now));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_snapshot_of_missing_key_is_fresh() {
        let (_, store) = store_at(1_000.0);
        let snap = store.log_snapshot("ns:k", None).await.unwrap();
        assert!(snap.is_fresh());
    }

    #[tokio::test]
    async fn test_append_and_snapshot() {
        let (_, store) = store_at(1_000.0);
        store
            .log_append("ns:k", &LogEntry::batch(1_000.0, 2), Duration::from_secs(60), false)
            .await
            .unwrap();

        let snap = store.log_snapshot("ns:k", None).await.unwrap();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.earliest, Some(1_000.0));
    }

    #[tokio::test]
    async fn test_record_expires_by_ttl() {
        let (clock, store) = store_at(1_000.0);
        store
            .log_append("ns:k", &[LogEntry::tagged(1_000.0)], Duration::from_secs(60), false)
            .await
            .unwrap();

        clock.advance(59.0);
        assert_eq!(store.log_snapshot("ns:k", None).await.unwrap().count, 1);

        clock.advance(1.0);
        assert!(store.log_snapshot("ns:k", None).await.unwrap().is_fresh());
    }

    #[tokio::test]
    async fn test_ttl_anchor_not_refreshed_by_later_writes() {
        let (clock, store) = store_at(1_000.0);
        let ttl = Duration::from_secs(60);
        store
            .log_append("ns:k", &[LogEntry::tagged(1_000.0)], ttl, false)
            .await
            .unwrap();

        clock.advance(30.0);
        store
            .log_append("ns:k", &[LogEntry::tagged(1_030.0)], ttl, false)
            .await
            .unwrap();

        // Expiry stays anchored to the first write.
        clock.advance(30.0);
        assert!(store.log_snapshot("ns:k", None).await.unwrap().is_fresh());
    }

    #[tokio::test]
    async fn test_refresh_ttl_extends_expiry() {
        let (clock, store) = store_at(1_000.0);
        let ttl = Duration::from_secs(60);
        store
            .log_append("ns:k", &[LogEntry::tagged(1_000.0)], ttl, true)
            .await
            .unwrap();

        clock.advance(30.0);
        store
            .log_append("ns:k", &[LogEntry::tagged(1_030.0)], ttl, true)
            .await
            .unwrap();

        clock.advance(45.0);
        assert_eq!(store.log_snapshot("ns:k", None).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_snapshot_prunes_at_cutoff() {
        let (clock, store) = store_at(1_000.0);
        let ttl = Duration::from_secs(60);
        store
            .log_append("ns:k", &[LogEntry::tagged(1_000.0)], ttl, true)
            .await
            .unwrap();
        clock.advance(40.0);
        store
            .log_append("ns:k", &[LogEntry::tagged(1_040.0)], ttl, true)
            .await
            .unwrap();

        // Entries at or before the cutoff are removed.
        let snap = store.log_snapshot("ns:k", Some(1_000.0)).await.unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.earliest, Some(1_040.0));
    }

    #[tokio::test]
    async fn test_guarded_append_respects_ceiling() {
        let (_, store) = store_at(1_000.0);
        let ttl = Duration::from_secs(60);

        let recorded = store
            .log_append_guarded("ns:k", &LogEntry::batch(1_000.0, 2), None, 2, ttl, false)
            .await
            .unwrap();
        assert!(recorded);

        let recorded = store
            .log_append_guarded("ns:k", &[LogEntry::tagged(1_000.5)], None, 2, ttl, false)
            .await
            .unwrap();
        assert!(!recorded);
        // The rejected append left no trace.
        assert_eq!(store.log_snapshot("ns:k", None).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_marker_lifecycle() {
        let (clock, store) = store_at(1_000.0);

        assert!(store.marker_ttl("blocked:k").await.unwrap().is_none());
        assert!(store.put_marker("blocked:k", Duration::from_secs(300)).await.unwrap());

        // A second put while live must not extend the TTL.
        clock.advance(100.0);
        assert!(!store.put_marker("blocked:k", Duration::from_secs(300)).await.unwrap());
        let ttl = store.marker_ttl("blocked:k").await.unwrap().unwrap();
        assert_eq!(ttl.as_secs(), 200);

        clock.advance(200.0);
        assert!(store.marker_ttl("blocked:k").await.unwrap().is_none());

        // After expiry a fresh block may start.
        assert!(store.put_marker("blocked:k", Duration::from_secs(300)).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_deletes_counters_and_markers() {
        let (_, store) = store_at(1_000.0);
        store
            .log_append("ns:k", &[LogEntry::tagged(1_000.0)], Duration::from_secs(60), false)
            .await
            .unwrap();
        store.put_marker("blocked:k", Duration::from_secs(300)).await.unwrap();

        store
            .remove(&["ns:k".to_string(), "blocked:k".to_string()])
            .await
            .unwrap();

        assert!(store.log_snapshot("ns:k", None).await.unwrap().is_fresh());
        assert!(store.marker_ttl("blocked:k").await.unwrap().is_none());
    }
}
