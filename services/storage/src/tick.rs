use crate::codec::{decode_battery_voltage, decode_temperature};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One telemetry reading from a sensor device.
///
/// Measurement fields are kept exactly as transmitted. The serialized form is
/// what the time-series store persists, so field order and names are part of
/// the stored data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Reading time, second resolution
    pub datetime: DateTime<FixedOffset>,
    /// Numeric sensor identifier
    pub sensor_id: i64,
    /// Seconds until the next transmission
    pub next_data_session: String,
    /// Battery voltage in millivolts
    pub battery_voltage: String,
    /// Encoded temperature
    pub sensor1: String,
    pub sensor2: String,
    /// Link quality indicator (0..255)
    pub radio_quality: String,
    /// Controller the device reported it was relayed through. Never persisted.
    #[serde(skip)]
    pub controller_hint: Option<String>,
}

impl Tick {
    /// Ordering key in the per-sensor series: Unix epoch seconds.
    pub fn rank(&self) -> i64 {
        self.datetime.timestamp()
    }
}

/// A stored tick plus the measurements derived from its raw fields.
///
/// Derived values are recomputed on every read so a change to the decoding
/// formulas applies to old data too.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedTick {
    #[serde(flatten)]
    pub tick: Tick,
    /// Degrees Celsius decoded from `sensor1`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Battery voltage in volts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_voltage_visual: Option<f64>,
}

impl DecodedTick {
    /// Project a stored tick. A raw field that does not decode leaves the
    /// matching derived value empty.
    pub fn project(tick: Tick) -> Self {
        let temperature = decode_temperature(&tick.sensor1)
            .map_err(|e| debug!(sensor_id = tick.sensor_id, error = %e, "Temperature not decodable"))
            .ok();
        let battery_voltage_visual = decode_battery_voltage(&tick.battery_voltage)
            .map_err(|e| debug!(sensor_id = tick.sensor_id, error = %e, "Battery voltage not decodable"))
            .ok();

        Self {
            tick,
            temperature,
            battery_voltage_visual,
        }
    }
}

/// A page of a sensor's series together with the series size.
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedTicks {
    pub ticks: Vec<DecodedTick>,
    pub total: u64,
}
