use crate::kv::{rank_window, KvStore, StoreError, KEY_PREFIX};
use crate::tick::{DecodedTick, PaginatedTicks, Tick};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Key of a sensor's ordered tick collection.
pub fn sensor_ticks_key(sensor_id: i64) -> String {
    format!("{KEY_PREFIX}sensor:{sensor_id}:ticks")
}

/// Window of a sensor series to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickRange {
    /// 0-based positions counted from the newest tick, inclusive
    Rank { start: usize, stop: Option<usize> },
    /// Epoch seconds, inclusive on both ends
    Time { start: i64, end: i64 },
}

/// Per-sensor time-ordered tick storage.
///
/// Each tick is stored as its JSON form, scored by epoch seconds. Appending a
/// tick whose timestamp and payload already exist is a no-op.
#[derive(Clone)]
pub struct TimeSeriesStore {
    store: Arc<dyn KvStore>,
}

impl TimeSeriesStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Append a tick to a sensor's series. Returns `false` for a duplicate.
    #[instrument(skip(self, tick), fields(rank = tick.rank()))]
    pub async fn append(&self, sensor_id: i64, tick: &Tick) -> Result<bool, StoreError> {
        let member = serde_json::to_string(tick)?;
        let added = self
            .store
            .zadd(&sensor_ticks_key(sensor_id), tick.rank(), &member)
            .await?;

        if !added {
            debug!("Duplicate tick ignored");
        }

        Ok(added)
    }

    /// Ticks by position, newest first.
    pub async fn query_by_rank(
        &self,
        sensor_id: i64,
        start: usize,
        stop: Option<usize>,
    ) -> Result<Vec<Tick>, StoreError> {
        let (start, stop) = rank_window(start, stop);
        let members = self
            .store
            .zrevrange(&sensor_ticks_key(sensor_id), start, stop)
            .await?;

        parse_ticks(members)
    }

    /// Ticks with `start <= epoch seconds <= end`, oldest first.
    pub async fn query_by_time_range(
        &self,
        sensor_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<Tick>, StoreError> {
        let members = self
            .store
            .zrangebyscore(&sensor_ticks_key(sensor_id), start, end)
            .await?;

        parse_ticks(members)
    }

    /// Number of stored ticks for a sensor.
    pub async fn count(&self, sensor_id: i64) -> Result<u64, StoreError> {
        self.store.zcard(&sensor_ticks_key(sensor_id)).await
    }

    /// Most recent tick of a sensor.
    pub async fn latest(&self, sensor_id: i64) -> Result<Option<Tick>, StoreError> {
        Ok(self
            .query_by_rank(sensor_id, 0, Some(0))
            .await?
            .into_iter()
            .next())
    }

    /// A page of decoded ticks with the series total.
    #[instrument(skip(self))]
    pub async fn page(&self, sensor_id: i64, range: TickRange) -> Result<PaginatedTicks, StoreError> {
        let total = self.count(sensor_id).await?;
        let ticks = match range {
            TickRange::Rank { start, stop } => self.query_by_rank(sensor_id, start, stop).await?,
            TickRange::Time { start, end } => {
                self.query_by_time_range(sensor_id, start, end).await?
            }
        };

        Ok(PaginatedTicks {
            ticks: ticks.into_iter().map(DecodedTick::project).collect(),
            total,
        })
    }
}

fn parse_ticks(members: Vec<String>) -> Result<Vec<Tick>, StoreError> {
    members
        .iter()
        .map(|member| serde_json::from_str(member).map_err(StoreError::from))
        .collect()
}
