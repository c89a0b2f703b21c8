use crate::kv::{KvStore, StoreError, KEY_PREFIX};
use chrono::Local;
use std::sync::Arc;

pub fn logs_key() -> String {
    format!("{KEY_PREFIX}logs")
}

/// Bounded list of the most recent raw payloads received from devices,
/// newest first.
#[derive(Clone)]
pub struct OpLog {
    store: Arc<dyn KvStore>,
    capacity: usize,
}

impl OpLog {
    pub fn new(store: Arc<dyn KvStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
        }
    }

    /// Prepend a timestamped entry and drop everything past the capacity.
    pub async fn record(&self, payload: &str) -> Result<(), StoreError> {
        let entry = format!("{} {}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f %:z"), payload);
        let key = logs_key();

        self.store.lpush(&key, &entry).await?;
        self.store.ltrim(&key, 0, self.last_index()).await
    }

    /// Stored entries, newest first.
    pub async fn recent(&self) -> Result<Vec<String>, StoreError> {
        self.store.lrange(&logs_key(), 0, self.last_index()).await
    }

    fn last_index(&self) -> isize {
        isize::try_from(self.capacity - 1).unwrap_or(isize::MAX)
    }
}
