use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use super::{QueueBackend, WriteOutcome};
use crate::common::error::StoreError;
use crate::infrastructure::redis::client::RedisService;

const PUT_IF_VERSION: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return -1 end
local ok, rec = pcall(cjson.decode, cur)
if not ok then return -2 end
if tonumber(rec['version'] or 0) ~= tonumber(ARGV[1]) then return 0 end
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

const EXTEND_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const DELETE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Job queue storage on Redis. Records are JSON strings, queues are lists
/// (LPUSH at the head, BRPOPLPUSH from the tail), leases are `SET NX PX` keys
/// holding the owner's token.
///
/// Blocking moves run on connections of their own so a long BRPOPLPUSH never
/// stalls the shared one. Those connections are kept for the next wait.
#[derive(Clone)]
pub struct RedisBackend {
    redis: RedisService,
    op_timeout: Duration,
    idle_blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    put_if_version: Script,
    extend_if_owner: Script,
    delete_if_owner: Script,
}

impl RedisBackend {
    pub fn new(redis: RedisService, op_timeout: Duration) -> Self {
        Self {
            redis,
            op_timeout,
            idle_blocking: Arc::new(Mutex::new(Vec::new())),
            put_if_version: Script::new(PUT_IF_VERSION),
            extend_if_owner: Script::new(EXTEND_IF_OWNER),
            delete_if_owner: Script::new(DELETE_IF_OWNER),
        }
    }

    async fn bounded<T, F>(&self, limit: Duration, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.idle_blocking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn blocking_conn(&self) -> Result<MultiplexedConnection, StoreError> {
        let reused = self.idle().pop();
        match reused {
            Some(conn) => Ok(conn),
            None => self.bounded(self.op_timeout, self.redis.dedicated_conn()).await,
        }
    }

    #[cfg(test)]
    fn idle_blocking_count(&self) -> usize {
        self.idle().len()
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.get_conn();
        self.bounded(self.op_timeout, conn.get(key)).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: &str,
        expected: u64,
        ttl: Option<Duration>,
    ) -> Result<WriteOutcome, StoreError> {
        let mut conn = self.redis.get_conn();
        let ttl_ms = ttl.map(millis).unwrap_or(0);
        let mut invocation = self.put_if_version.key(key);
        invocation.arg(expected).arg(value).arg(ttl_ms);
        let code: i64 = self
            .bounded(self.op_timeout, invocation.invoke_async(&mut conn))
            .await?;

        match code {
            1 => Ok(WriteOutcome::Written),
            0 => Ok(WriteOutcome::Conflict),
            -1 => Ok(WriteOutcome::Missing),
            _ => Err(StoreError::corrupt(key, "stored record is not valid JSON")),
        }
    }

    async fn insert_and_push(
        &self,
        key: &str,
        value: &str,
        list: &str,
        member: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.get_conn();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(key, value)
            .ignore()
            .lpush(list, member)
            .ignore();
        self.bounded(self.op_timeout, pipe.query_async(&mut conn))
            .await
    }

    async fn move_blocking(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.blocking_conn().await?;
        let mut cmd = redis::cmd("BRPOPLPUSH");
        cmd.arg(src).arg(dst).arg(timeout.as_secs_f64());
        let moved = self
            .bounded(timeout + self.op_timeout, cmd.query_async(&mut conn))
            .await;

        // A connection whose reply may still be in flight is not reused.
        if moved.is_ok() {
            self.idle().push(conn);
        }
        moved
    }

    async fn range(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.get_conn();
        self.bounded(self.op_timeout, conn.lrange(list, 0, count as isize - 1))
            .await
    }

    async fn remove(&self, list: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.get_conn();
        self.bounded(self.op_timeout, conn.lrem(list, 0, member))
            .await
    }

    async fn requeue(&self, src: &str, dst: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.get_conn();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(dst, member)
            .ignore()
            .lrem(src, 0, member)
            .ignore();
        self.bounded(self.op_timeout, pipe.query_async(&mut conn))
            .await
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.get_conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(token).arg("NX").arg("PX").arg(millis(ttl));
        let reply: Option<String> = self
            .bounded(self.op_timeout, cmd.query_async(&mut conn))
            .await?;
        Ok(reply.is_some())
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.get_conn();
        let mut invocation = self.extend_if_owner.key(key);
        invocation.arg(token).arg(millis(ttl));
        let extended: i64 = self
            .bounded(self.op_timeout, invocation.invoke_async(&mut conn))
            .await?;
        Ok(extended == 1)
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.get_conn();
        let mut invocation = self.delete_if_owner.key(key);
        invocation.arg(token);
        let deleted: i64 = self
            .bounded(self.op_timeout, invocation.invoke_async(&mut conn))
            .await?;
        Ok(deleted == 1)
    }
}

/// These run against a real server and are skipped unless `REDIS_TEST_URL`
/// is set, e.g. `REDIS_TEST_URL=redis://127.0.0.1:6379 cargo test redis_backend`.
#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    struct Scratch {
        backend: RedisBackend,
        prefix: String,
    }

    impl Scratch {
        fn key(&self, name: &str) -> String {
            format!("{}:{name}", self.prefix)
        }

        async fn cleanup(&self) {
            let mut conn = self.backend.redis.get_conn();
            let keys: Vec<String> = conn.keys(format!("{}:*", self.prefix)).await.unwrap();
            if !keys.is_empty() {
                let _: () = conn.del(keys).await.unwrap();
            }
        }
    }

    async fn scratch() -> Option<Scratch> {
        let url = std::env::var("REDIS_TEST_URL").ok()?;
        let redis = RedisService::new(&url).await.unwrap();
        Some(Scratch {
            backend: RedisBackend::new(redis, Duration::from_secs(2)),
            prefix: format!("media-worker-test:{}", Uuid::new_v4()),
        })
    }

    #[tokio::test]
    async fn versioned_write_checks_the_stored_version() {
        let Some(s) = scratch().await else { return };
        let (b, key) = (&s.backend, s.key("job:1"));

        let missing = b.put_if_version(&key, r#"{"version":1}"#, 0, None).await.unwrap();
        assert_eq!(missing, WriteOutcome::Missing);

        b.insert_and_push(&key, r#"{"version":0}"#, &s.key("pending"), "1")
            .await
            .unwrap();
        let written = b.put_if_version(&key, r#"{"version":1}"#, 0, None).await.unwrap();
        assert_eq!(written, WriteOutcome::Written);
        let stale = b.put_if_version(&key, r#"{"version":1}"#, 0, None).await.unwrap();
        assert_eq!(stale, WriteOutcome::Conflict);
        assert_eq!(b.get(&key).await.unwrap().as_deref(), Some(r#"{"version":1}"#));

        b.put_if_version(&key, r#"{"version":2}"#, 1, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let ttl: i64 = b.redis.get_conn().pttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60_000);

        let bad = s.key("job:bad");
        b.insert_and_push(&bad, "not json", &s.key("pending"), "bad")
            .await
            .unwrap();
        let err = b.put_if_version(&bad, "{}", 0, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        s.cleanup().await;
    }

    #[tokio::test]
    async fn lease_updates_require_the_owner_token() {
        let Some(s) = scratch().await else { return };
        let (b, lock) = (&s.backend, s.key("lock:job:1"));
        let ttl = Duration::from_secs(10);

        assert!(b.set_if_absent(&lock, "mine", ttl).await.unwrap());
        assert!(!b.set_if_absent(&lock, "theirs", ttl).await.unwrap());

        assert!(!b.extend_if_owner(&lock, "theirs", ttl).await.unwrap());
        assert!(b.extend_if_owner(&lock, "mine", Duration::from_secs(30)).await.unwrap());
        let left: i64 = b.redis.get_conn().pttl(&lock).await.unwrap();
        assert!(left > 10_000);

        assert!(!b.delete_if_owner(&lock, "theirs").await.unwrap());
        assert!(b.delete_if_owner(&lock, "mine").await.unwrap());
        assert_eq!(b.get(&lock).await.unwrap(), None);
        assert!(!b.extend_if_owner(&lock, "mine", ttl).await.unwrap());

        s.cleanup().await;
    }

    #[tokio::test]
    async fn lists_move_oldest_first_and_requeue_atomically() {
        let Some(s) = scratch().await else { return };
        let b = &s.backend;
        let (pending, inflight) = (s.key("queue:pending"), s.key("queue:inflight"));
        let wait = Duration::from_millis(200);

        b.insert_and_push(&s.key("job:1"), "{}", &pending, "1").await.unwrap();
        b.insert_and_push(&s.key("job:2"), "{}", &pending, "2").await.unwrap();
        assert_eq!(b.get(&s.key("job:2")).await.unwrap().as_deref(), Some("{}"));
        assert_eq!(b.range(&pending, 10).await.unwrap(), vec!["2", "1"]);

        assert_eq!(b.move_blocking(&pending, &inflight, wait).await.unwrap().as_deref(), Some("1"));
        assert_eq!(b.range(&inflight, 10).await.unwrap(), vec!["1"]);

        b.requeue(&inflight, &pending, "1").await.unwrap();
        assert_eq!(b.range(&pending, 10).await.unwrap(), vec!["1", "2"]);
        assert!(b.range(&inflight, 10).await.unwrap().is_empty());

        b.remove(&pending, "1").await.unwrap();
        assert_eq!(b.move_blocking(&pending, &inflight, wait).await.unwrap().as_deref(), Some("2"));
        assert_eq!(b.move_blocking(&pending, &inflight, wait).await.unwrap(), None);
        assert!(b.range(&pending, 0).await.unwrap().is_empty());

        s.cleanup().await;
    }

    #[tokio::test]
    async fn blocking_connections_are_reused() {
        let Some(s) = scratch().await else { return };
        let b = &s.backend;
        let (pending, inflight) = (s.key("queue:pending"), s.key("queue:inflight"));
        let wait = Duration::from_millis(100);

        for _ in 0..3 {
            b.move_blocking(&pending, &inflight, wait).await.unwrap();
            assert_eq!(b.idle_blocking_count(), 1);
        }

        let (x, y) = tokio::join!(
            b.move_blocking(&pending, &inflight, wait),
            b.move_blocking(&pending, &inflight, wait)
        );
        x.unwrap();
        y.unwrap();
        assert_eq!(b.idle_blocking_count(), 2);

        s.cleanup().await;
    }
}
