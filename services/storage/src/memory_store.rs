//! In-process [`KvStore`] with Redis semantics, used by tests and local runs.

use crate::kv::{resolve_range, KvStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.ordered.remove(&(previous, member.to_string()));
                self.ordered.insert((score, member.to_string()));
                false
            }
            None => {
                self.ordered.insert((score, member.to_string()));
                true
            }
        }
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    sorted_sets: HashMap<String, SortedSet>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
}

/// Thread-safe in-memory store. Cloning is not supported; share it behind an
/// `Arc` like any other [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
        let mut keyspace = self.keyspace.lock();
        Ok(keyspace
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(score, member))
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let keyspace = self.keyspace.lock();
        let Some(set) = keyspace.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };

        Ok(match resolve_range(set.ordered.len(), start, stop) {
            Some((from, to)) => set
                .ordered
                .iter()
                .rev()
                .skip(from)
                .take(to - from + 1)
                .map(|(_, member)| member.clone())
                .collect(),
            None => Vec::new(),
        })
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError> {
        let keyspace = self.keyspace.lock();
        Ok(keyspace
            .sorted_sets
            .get(key)
            .map(|set| {
                set.ordered
                    .iter()
                    .filter(|(score, _)| (min..=max).contains(score))
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let keyspace = self.keyspace.lock();
        Ok(keyspace
            .sorted_sets
            .get(key)
            .map(|set| set.ordered.len() as u64)
            .unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut keyspace = self.keyspace.lock();
        Ok(keyspace
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let keyspace = self.keyspace.lock();
        Ok(keyspace
            .sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let keyspace = self.keyspace.lock();
        Ok(keyspace
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut keyspace = self.keyspace.lock();
        keyspace
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut keyspace = self.keyspace.lock();
        let hash = keyspace.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let keyspace = self.keyspace.lock();
        Ok(keyspace
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let keyspace = self.keyspace.lock();
        Ok(keyspace.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut keyspace = self.keyspace.lock();
        keyspace
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let mut keyspace = self.keyspace.lock();
        let Some(list) = keyspace.lists.get_mut(key) else {
            return Ok(());
        };

        match resolve_range(list.len(), start, stop) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => {
                keyspace.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let keyspace = self.keyspace.lock();
        let Some(list) = keyspace.lists.get(key) else {
            return Ok(Vec::new());
        };

        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }
}
