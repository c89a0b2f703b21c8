use crate::kv::{rank_window, KvStore, StoreError, KEY_PREFIX};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn controller_readings_key(controller_id: &str) -> String {
    format!("{KEY_PREFIX}coordinator:{controller_id}:readings")
}

/// Aggregate of one batch of ticks relayed through a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerReading {
    /// When the batch was processed
    pub datetime: DateTime<FixedOffset>,
    pub controller_id: String,
    /// Ticks in the batch attributed to this controller
    pub tick_count: usize,
    /// Distinct sensors seen, ascending
    pub sensor_ids: Vec<i64>,
}

impl ControllerReading {
    pub fn rank(&self) -> i64 {
        self.datetime.timestamp()
    }
}

/// Per-controller ordered collection of batch aggregates.
#[derive(Clone)]
pub struct ReadingStore {
    store: Arc<dyn KvStore>,
}

impl ReadingStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn append(&self, reading: &ControllerReading) -> Result<bool, StoreError> {
        let member = serde_json::to_string(reading)?;
        self.store
            .zadd(
                &controller_readings_key(&reading.controller_id),
                reading.rank(),
                &member,
            )
            .await
    }

    /// Readings by position, newest first.
    pub async fn query_by_rank(
        &self,
        controller_id: &str,
        start: usize,
        stop: Option<usize>,
    ) -> Result<Vec<ControllerReading>, StoreError> {
        let (start, stop) = rank_window(start, stop);
        self.store
            .zrevrange(&controller_readings_key(controller_id), start, stop)
            .await?
            .iter()
            .map(|member| serde_json::from_str(member).map_err(StoreError::from))
            .collect()
    }
}
