use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{QueueBackend, WriteOutcome};
use crate::common::error::StoreError;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|e| !e.live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn remove_member(&mut self, list: &str, member: &str) {
        if let Some(items) = self.lists.get_mut(list) {
            items.retain(|m| m != member);
        }
    }
}

/// In-process store with the same semantics as the Redis backend: lists are
/// pushed at the head and consumed from the tail, keys expire lazily.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    pushed: Notify,
    failing_refreshes: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` lease extensions fail as if the store were unreachable.
    #[cfg(test)]
    pub fn fail_next_refreshes(&self, count: u32) {
        self.failing_refreshes.store(count, Ordering::SeqCst);
    }

    /// Drop `key` as if its TTL had run out.
    #[cfg(test)]
    pub fn expire(&self, key: &str) {
        self.lock().values.remove(key);
    }

    #[cfg(test)]
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let mut inner = self.lock();
        let at = inner.live_value(key)?.expires_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }

    fn try_move(&self, src: &str, dst: &str) -> Option<String> {
        let mut inner = self.lock();
        let member = inner.lists.get_mut(src)?.pop_back()?;
        inner
            .lists
            .entry(dst.to_string())
            .or_default()
            .push_front(member.clone());
        Some(member)
    }
}

fn record_version(key: &str, raw: &str) -> Result<u64, StoreError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| StoreError::corrupt(key, e))?;
    Ok(value.get("version").and_then(|v| v.as_u64()).unwrap_or(0))
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().live_value(key).map(|e| e.value.clone()))
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: &str,
        expected: u64,
        ttl: Option<Duration>,
    ) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        let Some(entry) = inner.live_value(key) else {
            return Ok(WriteOutcome::Missing);
        };
        if record_version(key, &entry.value)? != expected {
            return Ok(WriteOutcome::Conflict);
        }
        entry.value = value.to_string();
        entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        Ok(WriteOutcome::Written)
    }

    async fn insert_and_push(
        &self,
        key: &str,
        value: &str,
        list: &str,
        member: &str,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            inner.values.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
            inner
                .lists
                .entry(list.to_string())
                .or_default()
                .push_front(member.to_string());
        }
        self.pushed.notify_one();
        Ok(())
    }

    async fn move_blocking(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            if let Some(member) = self.try_move(src, dst) {
                return Ok(Some(member));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn range(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get(list)
            .map(|items| items.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, list: &str, member: &str) -> Result<(), StoreError> {
        self.lock().remove_member(list, member);
        Ok(())
    }

    async fn requeue(&self, src: &str, dst: &str, member: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            inner
                .lists
                .entry(dst.to_string())
                .or_default()
                .push_front(member.to_string());
            inner.remove_member(src, member);
        }
        self.pushed.notify_one();
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                value: token.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let injected = self
            .failing_refreshes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Backend("injected refresh failure".to_string()));
        }

        let mut inner = self.lock();
        match inner.live_value(key) {
            Some(entry) if entry.value == token => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let owned = inner.live_value(key).is_some_and(|e| e.value == token);
        if owned {
            inner.values.remove(key);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn move_is_fifo_and_lands_in_destination() {
        let backend = MemoryBackend::new();
        backend.insert_and_push("job:1", "{}", "pending", "1").await.unwrap();
        backend.insert_and_push("job:2", "{}", "pending", "2").await.unwrap();

        let first = backend
            .move_blocking("pending", "inflight", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("1"));
        assert_eq!(backend.range("pending", 10).await.unwrap(), vec!["2"]);
        assert_eq!(backend.range("inflight", 10).await.unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn blocking_move_times_out_empty_and_wakes_on_push() {
        let backend = Arc::new(MemoryBackend::new());
        let empty = backend
            .move_blocking("pending", "inflight", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_none());

        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .move_blocking("pending", "inflight", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.insert_and_push("job:9", "{}", "pending", "9").await.unwrap();

        let moved = waiter.await.unwrap().unwrap();
        assert_eq!(moved.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn versioned_write_rejects_stale_writers() {
        let backend = MemoryBackend::new();
        backend
            .insert_and_push("job:1", r#"{"version":0}"#, "pending", "1")
            .await
            .unwrap();

        let ok = backend
            .put_if_version("job:1", r#"{"version":1}"#, 0, None)
            .await
            .unwrap();
        assert_eq!(ok, WriteOutcome::Written);

        let stale = backend
            .put_if_version("job:1", r#"{"version":1}"#, 0, None)
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::Conflict);

        let missing = backend
            .put_if_version("job:2", r#"{"version":1}"#, 0, None)
            .await
            .unwrap();
        assert_eq!(missing, WriteOutcome::Missing);
    }

    #[tokio::test]
    async fn lease_primitives_check_the_token() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(30);
        assert!(backend.set_if_absent("lock", "a", ttl).await.unwrap());
        assert!(!backend.set_if_absent("lock", "b", ttl).await.unwrap());
        assert!(!backend.extend_if_owner("lock", "b", ttl).await.unwrap());
        assert!(!backend.delete_if_owner("lock", "b").await.unwrap());
        assert!(backend.extend_if_owner("lock", "a", ttl).await.unwrap());
        assert!(backend.delete_if_owner("lock", "a").await.unwrap());
        assert!(backend.set_if_absent("lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let backend = MemoryBackend::new();
        assert!(
            backend
                .set_if_absent("lock", "a", Duration::from_millis(5))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.get("lock").await.unwrap().is_none());
        assert!(!backend.extend_if_owner("lock", "a", Duration::from_secs(1)).await.unwrap());
    }
}
