//! Key-value store client abstraction.
//!
//! Every component talks to the remote store through [`KvStore`], which
//! exposes the handful of sorted-set, set, hash and list primitives the
//! services rely on. [`RedisStore`](crate::redis_store::RedisStore) is the
//! production implementation; [`MemoryStore`](crate::memory_store::MemoryStore)
//! reproduces the same semantics in-process for tests and local runs.
//!
//! Range arguments follow Redis conventions: indexes are 0-based, inclusive,
//! and negative values count from the end (`-1` is the last element).

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Prefix shared by every key the services write.
pub const KEY_PREFIX: &str = "osp:";

/// Errors surfaced by the store layer. No retries happen at this level.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Check that the store answers.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Add `member` with `score`. Returns `true` when the member was new.
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<bool, StoreError>;

    /// Members by descending score, between rank `start` and `stop`.
    async fn zrevrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Members by ascending score with `min <= score <= max`.
    async fn zrangebyscore(&self, key: &str, min: i64, max: i64)
        -> Result<Vec<String>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Returns `true` when the member was new.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Set `field` only if absent. Returns `true` when it was written.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Keep only the elements between `start` and `stop`.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError>;

    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;
}

/// Resolve a Redis-style inclusive index range against a collection of `len`
/// elements. Returns `None` when the range selects nothing.
pub fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }

    Some((start as usize, stop as usize))
}

/// Convert a 0-based inclusive rank window into store indexes; an open
/// `stop` runs to the end of the collection.
pub fn rank_window(start: usize, stop: Option<usize>) -> (isize, isize) {
    let start = isize::try_from(start).unwrap_or(isize::MAX);
    let stop = match stop {
        Some(stop) => isize::try_from(stop).unwrap_or(isize::MAX),
        None => -1,
    };
    (start, stop)
}
