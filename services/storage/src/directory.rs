use crate::kv::{KvStore, StoreError, KEY_PREFIX};
use crate::timeseries::TimeSeriesStore;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const FIELD_LABEL: &str = "label";
const FIELD_TOKEN: &str = "token";
const FIELD_LAT: &str = "lat";
const FIELD_LNG: &str = "lng";

/// Set of every known controller id.
pub fn controllers_key() -> String {
    format!("{KEY_PREFIX}controllers")
}

/// Global sensor id -> controller id hash.
pub fn sensor_to_controller_key() -> String {
    format!("{KEY_PREFIX}sensor_to_controller")
}

pub fn controller_fields_key(controller_id: &str) -> String {
    format!("{KEY_PREFIX}controller:{controller_id}:fields")
}

pub fn controller_sensors_key(controller_id: &str) -> String {
    format!("{KEY_PREFIX}controller:{controller_id}:sensors")
}

pub fn sensor_fields_key(sensor_id: i64) -> String {
    format!("{KEY_PREFIX}sensor:{sensor_id}:fields")
}

/// A coordinator device relaying sensor readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Controller {
    pub id: String,
    /// Display label, the id when none was set
    pub label: String,
    pub token: Option<String>,
    /// Dashboard link for this controller
    pub url: Option<String>,
}

/// Sensor latitude/longitude, kept as transmitted by the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: Option<String>,
    pub lng: Option<String>,
}

/// A sensor as listed under its controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: i64,
    pub controller_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

/// Directory of controllers, their member sensors and the sensor to
/// controller association.
///
/// Reassociating a sensor does not remove it from its previous controller's
/// member set, so a sensor may be listed under more than one controller while
/// [`controller_of_sensor`](Self::controller_of_sensor) names only the latest.
#[derive(Clone)]
pub struct DirectoryStore {
    store: Arc<dyn KvStore>,
    timeseries: TimeSeriesStore,
    view_url_base: String,
}

impl DirectoryStore {
    pub fn new(
        store: Arc<dyn KvStore>,
        timeseries: TimeSeriesStore,
        view_url_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            timeseries,
            view_url_base: view_url_base.into(),
        }
    }

    /// Add a controller to the known set, issuing an access token the first
    /// time it is seen.
    #[instrument(skip(self))]
    pub async fn register_controller(&self, controller_id: &str) -> Result<(), StoreError> {
        let added = self.store.sadd(&controllers_key(), controller_id).await?;

        let token = Uuid::new_v4().simple().to_string();
        let issued = self
            .store
            .hset_nx(&controller_fields_key(controller_id), FIELD_TOKEN, &token)
            .await?;

        if added {
            info!("Registered new controller");
        }
        if issued {
            debug!("Issued controller access token");
        }

        Ok(())
    }

    /// Set a controller's display label, registering the controller if needed.
    #[instrument(skip(self))]
    pub async fn set_controller_label(
        &self,
        controller_id: &str,
        label: &str,
    ) -> Result<(), StoreError> {
        self.register_controller(controller_id).await?;
        self.store
            .hset(&controller_fields_key(controller_id), FIELD_LABEL, label)
            .await
    }

    /// Look up a controller. `None` when it was never registered.
    pub async fn get_controller(&self, controller_id: &str) -> Result<Option<Controller>, StoreError> {
        let fields = self
            .store
            .hgetall(&controller_fields_key(controller_id))
            .await?;

        if fields.is_empty() && !self.store.sismember(&controllers_key(), controller_id).await? {
            return Ok(None);
        }

        Ok(Some(self.build_controller(controller_id, fields)))
    }

    /// All known controllers, ordered by id.
    pub async fn list_controllers(&self) -> Result<Vec<Controller>, StoreError> {
        let mut ids = self.store.smembers(&controllers_key()).await?;
        ids.sort();

        let mut controllers = Vec::with_capacity(ids.len());
        for id in ids {
            let fields = self.store.hgetall(&controller_fields_key(&id)).await?;
            controllers.push(self.build_controller(&id, fields));
        }

        Ok(controllers)
    }

    /// Record `controller_id` as the sensor's controller and add the sensor to
    /// its member set. The previous association is overwritten.
    #[instrument(skip(self))]
    pub async fn register_sensor_under_controller(
        &self,
        sensor_id: i64,
        controller_id: &str,
    ) -> Result<(), StoreError> {
        let sensor = sensor_id.to_string();
        self.store
            .hset(&sensor_to_controller_key(), &sensor, controller_id)
            .await?;
        self.store
            .sadd(&controller_sensors_key(controller_id), &sensor)
            .await?;
        Ok(())
    }

    /// Controller currently associated with a sensor.
    pub async fn controller_of_sensor(&self, sensor_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .hget(&sensor_to_controller_key(), &sensor_id.to_string())
            .await?
            .filter(|id| !id.is_empty()))
    }

    pub async fn set_sensor_coordinates(
        &self,
        sensor_id: i64,
        lat: &str,
        lng: &str,
    ) -> Result<(), StoreError> {
        let key = sensor_fields_key(sensor_id);
        self.store.hset(&key, FIELD_LAT, lat).await?;
        self.store.hset(&key, FIELD_LNG, lng).await
    }

    pub async fn get_sensor_coordinates(&self, sensor_id: i64) -> Result<Option<Coordinates>, StoreError> {
        let mut fields = self.store.hgetall(&sensor_fields_key(sensor_id)).await?;
        let lat = fields.remove(FIELD_LAT);
        let lng = fields.remove(FIELD_LNG);

        if lat.is_none() && lng.is_none() {
            return Ok(None);
        }
        Ok(Some(Coordinates { lat, lng }))
    }

    /// Member sensors of a controller, ordered by id, each joined with its
    /// latest tick time and coordinates at read time.
    #[instrument(skip(self))]
    pub async fn list_sensors_of_controller(
        &self,
        controller_id: &str,
    ) -> Result<Vec<Sensor>, StoreError> {
        let members = self
            .store
            .smembers(&controller_sensors_key(controller_id))
            .await?;

        let mut ids = members
            .iter()
            .map(|member| {
                member.parse::<i64>().map_err(|_| {
                    StoreError::Corrupt(format!(
                        "invalid sensor id {member:?} in controller {controller_id}"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort_unstable();

        let mut sensors = Vec::with_capacity(ids.len());
        for id in ids {
            let last_tick = self.timeseries.latest(id).await?.map(|tick| tick.datetime);
            let coordinates = self.get_sensor_coordinates(id).await?;
            sensors.push(Sensor {
                id,
                controller_id: controller_id.to_string(),
                last_tick,
                coordinates,
            });
        }

        Ok(sensors)
    }

    fn build_controller(&self, controller_id: &str, mut fields: HashMap<String, String>) -> Controller {
        let token = fields.remove(FIELD_TOKEN);
        let label = fields
            .remove(FIELD_LABEL)
            .unwrap_or_else(|| controller_id.to_string());
        let url = token
            .as_ref()
            .map(|token| format!("{}#/{}/{}", self.view_url_base, controller_id, token));

        Controller {
            id: controller_id.to_string(),
            label,
            token,
            url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RecordZone;
    use crate::memory_store::MemoryStore;

    fn directory() -> (DirectoryStore, TimeSeriesStore) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let timeseries = TimeSeriesStore::new(store.clone());
        let directory = DirectoryStore::new(store, timeseries.clone(), "http://example.test/view");
        (directory, timeseries)
    }

    #[tokio::test]
    async fn test_register_controller_issues_stable_token() {
        let (directory, _) = directory();

        directory.register_controller("5").await.unwrap();
        let first = directory.get_controller("5").await.unwrap().unwrap();
        directory.register_controller("5").await.unwrap();
        let second = directory.get_controller("5").await.unwrap().unwrap();

        let token = first.token.clone().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.label, "5");
        assert_eq!(
            first.url.as_deref(),
            Some(format!("http://example.test/view#/5/{token}").as_str())
        );
    }

    #[tokio::test]
    async fn test_unknown_controller_is_absent() {
        let (directory, _) = directory();
        assert_eq!(directory.get_controller("404").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_label_registers_and_lists() {
        let (directory, _) = directory();

        directory.set_controller_label("b", "Barn").await.unwrap();
        directory.register_controller("a").await.unwrap();

        let controllers = directory.list_controllers().await.unwrap();
        let labels: Vec<(&str, &str)> = controllers
            .iter()
            .map(|c| (c.id.as_str(), c.label.as_str()))
            .collect();
        assert_eq!(labels, vec![("a", "a"), ("b", "Barn")]);
    }

    #[tokio::test]
    async fn test_reassociation_keeps_stale_membership() {
        let (directory, _) = directory();

        directory.register_sensor_under_controller(42, "1").await.unwrap();
        directory.register_sensor_under_controller(42, "2").await.unwrap();

        assert_eq!(
            directory.controller_of_sensor(42).await.unwrap().as_deref(),
            Some("2")
        );
        assert_eq!(directory.list_sensors_of_controller("1").await.unwrap().len(), 1);
        assert_eq!(directory.list_sensors_of_controller("2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sensor_listing_joins_latest_tick_and_coordinates() {
        let (directory, timeseries) = directory();
        let zone = RecordZone::from_offset_minutes(0).unwrap();

        for raw in [
            "[2024-1-1 10:0:0;42;60;3300;200;0;255]",
            "[2024-1-1 11:0:0;42;60;3300;200;0;255]",
        ] {
            let tick = zone.decode(raw).unwrap();
            timeseries.append(42, &tick).await.unwrap();
        }
        directory.register_sensor_under_controller(42, "1").await.unwrap();
        directory.register_sensor_under_controller(7, "1").await.unwrap();
        directory
            .set_sensor_coordinates(42, "58.37", "26.72")
            .await
            .unwrap();

        let sensors = directory.list_sensors_of_controller("1").await.unwrap();
        assert_eq!(sensors.len(), 2);

        assert_eq!(sensors[0].id, 7);
        assert_eq!(sensors[0].last_tick, None);
        assert_eq!(sensors[0].coordinates, None);

        let latest = zone.decode("[2024-1-1 11:0:0;42;60;3300;200;0;255]").unwrap();
        assert_eq!(sensors[1].id, 42);
        assert_eq!(sensors[1].last_tick, Some(latest.datetime));
        assert_eq!(
            sensors[1].coordinates,
            Some(Coordinates {
                lat: Some("58.37".to_string()),
                lng: Some("26.72".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_corrupt_member_reported() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.sadd(&controller_sensors_key("1"), "x").await.unwrap();
        let directory = DirectoryStore::new(store.clone(), TimeSeriesStore::new(store), "");

        assert!(matches!(
            directory.list_sensors_of_controller("1").await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
