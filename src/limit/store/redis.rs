//! Redis-backed counter store.
//!
//! Counters are sorted sets of `{member: timestamp}` entries; block markers
//! are plain keys written with `SET NX EX`. The cleanup+read runs as one
//! MULTI/EXEC pipeline, and the guarded append as a server-side script, so no
//! concurrent caller can interleave with either. Every call carries the
//! store's own deadline, reported as [`StoreError::Timeout`].

use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::debug;

use super::{CounterStore, LogEntry, StoreError, UsageSnapshot};

/// Prune, count, compare against the ceiling, then append and manage the
/// TTL, all inside the store. Returns 1 when the entries were recorded.
///
/// ARGV: cutoff (empty to skip pruning), ceiling, refresh flag, ttl seconds,
/// then (score, member) pairs.
const GUARDED_APPEND: &str = r#"
if ARGV[1] ~= '' then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
local count = redis.call('ZCARD', KEYS[1])
local added = (#ARGV - 4) / 2
if count + added > tonumber(ARGV[2]) then
  return 0
end
for i = 0, added - 1 do
  redis.call('ZADD', KEYS[1], ARGV[5 + i * 2], ARGV[6 + i * 2])
end
if ARGV[3] == '1' or redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[4])
end
return 1
"#;

/// Counter store over a shared Redis instance.
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    guarded_append: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`). `op_timeout` bounds
    /// every store call independently of the host's request deadline.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(url = %url, "Connected to counter store");
        Ok(Self {
            conn,
            op_timeout,
            guarded_append: Script::new(GUARDED_APPEND),
        })
    }

    async fn run<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisStore {
    async fn log_snapshot(
        &self,
        key: &str,
        cutoff: Option<f64>,
    ) -> Result<UsageSnapshot, StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(cutoff) = cutoff {
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(cutoff)
                .ignore();
        }
        pipe.cmd("ZCARD").arg(key);
        pipe.cmd("ZRANGE").arg(key).arg(0).arg(0).arg("WITHSCORES");

        let (count, earliest): (u64, Vec<(String, f64)>) =
            self.run(pipe.query_async(&mut conn)).await?;
        Ok(UsageSnapshot {
            count,
            earliest: earliest.first().map(|(_, ts)| *ts),
        })
    }

    async fn log_append(
        &self,
        key: &str,
        entries: &[LogEntry],
        ttl: Duration,
        refresh_ttl: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut zadd = redis::cmd("ZADD");
        zadd.arg(key);
        for entry in entries {
            zadd.arg(entry.timestamp).arg(&entry.member);
        }
        pipe.add_command(zadd).ignore();
        if refresh_ttl {
            pipe.cmd("EXPIRE").arg(key).arg(Self::ttl_secs(ttl)).ignore();
        } else {
            // NX keeps expiry anchored to the first write (Redis >= 7.0).
            pipe.cmd("EXPIRE")
                .arg(key)
                .arg(Self::ttl_secs(ttl))
                .arg("NX")
                .ignore();
        }
        self.run(pipe.query_async::<()>(&mut conn)).await
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
        let mut conn = self.conn.clone();
        let mut script = self.guarded_append.key(key);
        script
            .arg(cutoff.map(|c| c.to_string()).unwrap_or_default())
            .arg(ceiling)
            .arg(if refresh_ttl { 1 } else { 0 })
            .arg(Self::ttl_secs(ttl));
        for entry in entries {
            script.arg(entry.timestamp).arg(&entry.member);
        }
        let recorded: i64 = self.run(script.invoke_async(&mut conn)).await?;
        Ok(recorded == 1)
    }

    async fn put_marker(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let set: Option<String> = self
            .run(
                redis::cmd("SET")
                    .arg(key)
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(Self::ttl_secs(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(set.is_some())
    }

    async fn marker_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let ttl: i64 = self
            .run(redis::cmd("PTTL").arg(key).query_async(&mut conn))
            .await?;
        if ttl > 0 {
            Ok(Some(Duration::from_millis(ttl as u64)))
        } else {
            Ok(None)
        }
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        self.run(redis::cmd("DEL").arg(keys).query_async::<()>(&mut conn))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        let io: redis::RedisError = (redis::ErrorKind::IoError, "broken pipe").into();
        assert!(matches!(StoreError::from(io), StoreError::Connection(_)));

        let ty: redis::RedisError = (redis::ErrorKind::TypeError, "bad reply").into();
        assert!(matches!(StoreError::from(ty), StoreError::Protocol(_)));
    }

    #[test]
    fn test_ttl_floor_is_one_second() {
        assert_eq!(RedisStore::ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(RedisStore::ttl_secs(Duration::from_secs(60)), 60);
    }
}
