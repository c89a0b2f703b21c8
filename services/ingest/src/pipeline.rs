//! Per-batch ingestion: decode each record, store the tick, then resolve and
//! record its controller.

use crate::frame_decoder::records;
use crate::resolver::AssociationResolver;
use chrono::Local;
use osp_storage::codec::{DecodeError, RecordZone};
use osp_storage::kv::StoreError;
use osp_storage::readings::{ControllerReading, ReadingStore};
use osp_storage::timeseries::TimeSeriesStore;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Errors that stop a batch.
///
/// Records before the failing one stay stored; records after it are never
/// looked at.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Record {index} failed to decode: {source}")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),
}

/// Ticks seen for one controller within a batch.
#[derive(Debug, Default)]
struct ControllerTally {
    ticks: usize,
    sensors: BTreeSet<i64>,
}

/// Turns a connection payload into stored ticks and associations.
#[derive(Clone)]
pub struct IngestPipeline {
    timeseries: TimeSeriesStore,
    resolver: AssociationResolver,
    readings: ReadingStore,
    zone: RecordZone,
}

impl IngestPipeline {
    pub fn new(
        timeseries: TimeSeriesStore,
        resolver: AssociationResolver,
        readings: ReadingStore,
        zone: RecordZone,
    ) -> Self {
        Self {
            timeseries,
            resolver,
            readings,
            zone,
        }
    }

    /// Process every record of `payload` in order. Returns the number of
    /// records processed.
    ///
    /// Controller readings are written after the last record; a failure there
    /// is logged and counted but leaves the batch successful.
    #[instrument(skip(self, payload), fields(payload_bytes = payload.len()))]
    pub async fn process(&self, payload: &str) -> Result<usize, PipelineError> {
        match self.process_records(payload).await {
            Ok(tallies) => {
                let processed: usize = tallies.values().map(|t| t.ticks).sum();
                metrics::counter!("ingest.ticks.processed").increment(processed as u64);

                // Ticks are stored by now, so a readings failure leaves the batch Ok
                if let Err(e) = self.record_readings(tallies).await {
                    metrics::counter!("ingest.readings.failed").increment(1);
                    warn!(error = %e, "Failed to record controller readings");
                }

                Ok(processed)
            }
            Err(e) => {
                metrics::counter!("ingest.batches.failed").increment(1);
                Err(e)
            }
        }
    }

    async fn process_records(
        &self,
        payload: &str,
    ) -> Result<BTreeMap<String, ControllerTally>, PipelineError> {
        let mut tallies: BTreeMap<String, ControllerTally> = BTreeMap::new();

        for (index, record) in records(payload).enumerate() {
            let tick = self.zone.decode(record).map_err(|source| {
                warn!(index = index, error = %source, "Aborting batch on undecodable record");
                PipelineError::Decode { index, source }
            })?;

            self.timeseries.append(tick.sensor_id, &tick).await?;
            let controller_id = self.resolver.resolve(&tick).await?;

            debug!(
                sensor_id = tick.sensor_id,
                controller_id = %controller_id,
                "Tick stored"
            );

            let tally = tallies.entry(controller_id).or_default();
            tally.ticks += 1;
            tally.sensors.insert(tick.sensor_id);
        }

        Ok(tallies)
    }

    async fn record_readings(
        &self,
        tallies: BTreeMap<String, ControllerTally>,
    ) -> Result<(), StoreError> {
        let now = Local::now();
        let datetime = now.with_timezone(now.offset());

        for (controller_id, tally) in tallies {
            let reading = ControllerReading {
                datetime,
                controller_id,
                tick_count: tally.ticks,
                sensor_ids: tally.sensors.into_iter().collect(),
            };
            self.readings.append(&reading).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osp_storage::directory::DirectoryStore;
    use osp_storage::kv::KvStore;
    use osp_storage::memory_store::MemoryStore;
    use async_trait::async_trait;
    use osp_storage::readings::controller_readings_key;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    /// Memory store whose controller readings writes always fail.
    struct ReadingsDown {
        inner: MemoryStore,
    }

    #[async_trait]
    impl KvStore for ReadingsDown {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
            if key == controller_readings_key("1") {
                return Err(StoreError::Unavailable("readings offline".to_string()));
            }
            self.inner.zadd(key, score, member).await
        }

        async fn zrevrange(&self, key: &str, start: isize, stop: isize)
            -> Result<Vec<String>, StoreError> {
            self.inner.zrevrange(key, start, stop).await
        }

        async fn zrangebyscore(&self, key: &str, min: i64, max: i64)
            -> Result<Vec<String>, StoreError> {
            self.inner.zrangebyscore(key, min, max).await
        }

        async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
            self.inner.zcard(key).await
        }

        async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.inner.sadd(key, member).await
        }

        async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.inner.sismember(key, member).await
        }

        async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.smembers(key).await
        }

        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
            self.inner.hset(key, field, value).await
        }

        async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
            self.inner.hset_nx(key, field, value).await
        }

        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
            self.inner.hget(key, field).await
        }

        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
            self.inner.hgetall(key).await
        }

        async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.lpush(key, value).await
        }

        async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
            self.inner.ltrim(key, start, stop).await
        }

        async fn lrange(&self, key: &str, start: isize, stop: isize)
            -> Result<Vec<String>, StoreError> {
            self.inner.lrange(key, start, stop).await
        }
    }

    struct Harness {
        pipeline: IngestPipeline,
        timeseries: TimeSeriesStore,
        directory: DirectoryStore,
        readings: ReadingStore,
    }

    fn harness() -> Harness {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let timeseries = TimeSeriesStore::new(store.clone());
        let directory = DirectoryStore::new(store.clone(), timeseries.clone(), "");
        let readings = ReadingStore::new(store);
        let pipeline = IngestPipeline::new(
            timeseries.clone(),
            AssociationResolver::new(directory.clone(), "1"),
            readings.clone(),
            RecordZone::from_offset_minutes(0).unwrap(),
        );

        Harness {
            pipeline,
            timeseries,
            directory,
            readings,
        }
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_bad_record() {
        let h = harness();
        let payload = "[2024-1-1 10:0:0;42;60;3300;200;0;255]\n[bad-record]\n[2024-1-1 10:0:1;42;60;3300;200;0;255]";

        let err = h.pipeline.process(payload).await.unwrap_err();

        assert!(matches!(err, PipelineError::Decode { index: 1, .. }));
        assert_eq!(h.timeseries.count(42).await.unwrap(), 1);
        let stored = h.timeseries.latest(42).await.unwrap().unwrap();
        assert_eq!(stored.datetime.timestamp() % 60, 0);
        assert!(h.readings.query_by_rank("1", 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_counts_and_associates() {
        let h = harness();
        let payload = concat!(
            "[2024-1-1 10:0:0;42;60;3300;200;0;255;5]\r",
            "[2024-1-1 10:0:1;42;60;3300;200;0;255]\n",
            "[2024-1-1 10:0:1;8;60;3300;200;0;255]\n",
        );

        let processed = assert_ok!(h.pipeline.process(payload).await);

        assert_eq!(processed, 3);
        assert_eq!(h.timeseries.count(42).await.unwrap(), 2);
        assert_eq!(
            h.directory.controller_of_sensor(42).await.unwrap().as_deref(),
            Some("5")
        );
        assert_eq!(
            h.directory.controller_of_sensor(8).await.unwrap().as_deref(),
            Some("1")
        );

        let readings = h.readings.query_by_rank("5", 0, None).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].tick_count, 2);
        assert_eq!(readings[0].sensor_ids, vec![42]);

        let readings = h.readings.query_by_rank("1", 0, None).await.unwrap();
        assert_eq!(readings[0].sensor_ids, vec![8]);
    }

    #[tokio::test]
    async fn test_replayed_batch_is_idempotent() {
        let h = harness();
        let payload = "[2024-1-1 10:0:0;42;60;3300;200;0;255]\n[2024-1-1 10:0:1;42;60;3300;200;0;255]";

        assert_eq!(h.pipeline.process(payload).await.unwrap(), 2);
        assert_eq!(h.pipeline.process(payload).await.unwrap(), 2);

        assert_eq!(h.timeseries.count(42).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let h = harness();
        assert_eq!(h.pipeline.process("\r\n").await.unwrap(), 0);
        assert!(h.directory.list_controllers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_readings_failure_keeps_batch_successful() {
        let store: Arc<dyn KvStore> = Arc::new(ReadingsDown {
            inner: MemoryStore::new(),
        });
        let timeseries = TimeSeriesStore::new(store.clone());
        let directory = DirectoryStore::new(store.clone(), timeseries.clone(), "");
        let pipeline = IngestPipeline::new(
            timeseries.clone(),
            AssociationResolver::new(directory.clone(), "1"),
            ReadingStore::new(store),
            RecordZone::from_offset_minutes(0).unwrap(),
        );
        let payload = "[2024-1-1 10:0:0;42;60;3300;200;0;255]\n[2024-1-1 10:0:1;42;60;3300;200;0;255]";

        let processed = assert_ok!(pipeline.process(payload).await);

        assert_eq!(processed, 2);
        assert_eq!(timeseries.count(42).await.unwrap(), 2);
        assert_eq!(
            directory.controller_of_sensor(42).await.unwrap().as_deref(),
            Some("1")
        );
    }
}
