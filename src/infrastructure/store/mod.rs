//! Storage primitives the job queue is built on.
//!
//! A backend only knows about string keys, string values and lists of ids. Every
//! operation that must not be observed half-done (enqueue, dequeue move, requeue,
//! versioned write, token-checked lease update) is a single call here so each
//! backend can implement it with its native atomic primitive.

use std::time::Duration;

use async_trait::async_trait;

use crate::common::error::StoreError;

pub mod memory;
pub mod redis_backend;

pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;

/// Result of a version-checked record write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Conflict,
    Missing,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replace the record at `key` only if its stored `version` field equals
    /// `expected`. `ttl` of `None` persists the record.
    async fn put_if_version(
        &self,
        key: &str,
        value: &str,
        expected: u64,
        ttl: Option<Duration>,
    ) -> Result<WriteOutcome, StoreError>;

    /// Write the record and push `member` onto `list` in one transaction.
    async fn insert_and_push(
        &self,
        key: &str,
        value: &str,
        list: &str,
        member: &str,
    ) -> Result<(), StoreError>;

    /// Atomically move the oldest member of `src` to `dst`, waiting up to
    /// `timeout` for one to appear. `None` means the wait timed out.
    async fn move_blocking(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Up to `count` members of `list`, most recently pushed first.
    async fn range(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError>;

    async fn remove(&self, list: &str, member: &str) -> Result<(), StoreError>;

    /// Push `member` onto `dst` and remove it from `src` in one transaction.
    async fn requeue(&self, src: &str, dst: &str, member: &str) -> Result<(), StoreError>;

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Extend `key` if it still holds `token`. `false` means ownership is gone.
    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError>;
}
