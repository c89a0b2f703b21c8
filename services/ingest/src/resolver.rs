use osp_storage::directory::DirectoryStore;
use osp_storage::kv::StoreError;
use osp_storage::tick::Tick;
use tracing::{instrument, warn};

/// Decides which controller a tick was relayed through and records the
/// association.
#[derive(Clone)]
pub struct AssociationResolver {
    directory: DirectoryStore,
    default_controller_id: String,
}

impl AssociationResolver {
    pub fn new(directory: DirectoryStore, default_controller_id: impl Into<String>) -> Self {
        Self {
            directory,
            default_controller_id: default_controller_id.into(),
        }
    }

    /// Controller id for `tick`: the record's own hint, else the stored
    /// association, else the configured default.
    ///
    /// The outcome is always written back, so the controller is registered
    /// and the sensor listed under it even when nothing changed.
    #[instrument(skip(self, tick), fields(sensor_id = tick.sensor_id))]
    pub async fn resolve(&self, tick: &Tick) -> Result<String, StoreError> {
        let controller_id = match tick.controller_hint.as_deref() {
            Some(hint) => hint.to_string(),
            None => match self.directory.controller_of_sensor(tick.sensor_id).await? {
                Some(stored) => stored,
                None => {
                    warn!(
                        controller_id = %self.default_controller_id,
                        "No controller known for sensor, using default"
                    );
                    self.default_controller_id.clone()
                }
            },
        };

        self.directory.register_controller(&controller_id).await?;
        self.directory
            .register_sensor_under_controller(tick.sensor_id, &controller_id)
            .await?;

        Ok(controller_id)
    }
}
