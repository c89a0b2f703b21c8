//! Wire-format codec for sensor tick records.
//!
//! A record looks like
//!
//! ```text
//! [2024-1-1 10:0:0;42;60;3300;200;0;255;7]
//!  timestamp      id next batt s1  s2 lqi controller (optional)
//! ```
//!
//! Timestamps need no zero padding and carry no zone; they are read in the
//! configured [`RecordZone`]. Measurement fields pass through as text; only
//! the temperature and battery voltage have decoders, applied at read time.

use crate::tick::Tick;
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use thiserror::Error;

pub const FIELD_SEPARATOR: char = ';';
pub const RECORD_OPEN: char = '[';
pub const RECORD_CLOSE: char = ']';

const REQUIRED_FIELDS: usize = 7;
const HINT_FIELD: usize = 7;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%-m-%-d %-H:%-M:%-S";

/// Magnitude contributed by each set bit of an encoded temperature.
const MAGNITUDE_WEIGHTS: [(u32, f64); 8] = [
    (7, 0.5),
    (8, 1.0),
    (9, 2.0),
    (10, 4.0),
    (11, 8.0),
    (12, 16.0),
    (13, 32.0),
    (14, 64.0),
];
const SIGN_BIT: u32 = 15;

/// Errors produced while decoding a record or a measurement.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record is not enclosed in '[' and ']': {0:?}")]
    Unframed(String),

    #[error("Record has {found} fields, at least 7 are required")]
    MissingFields { found: usize },

    #[error("Invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("Invalid sensor id {0:?}")]
    InvalidSensorId(String),

    #[error("Invalid integer {0:?}")]
    InvalidInteger(String),
}

/// Time zone that record timestamps are written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordZone {
    /// The zone of the host running the service
    #[default]
    Local,
    /// A fixed UTC offset
    Fixed(FixedOffset),
}

impl RecordZone {
    /// Fixed zone `minutes` east of UTC, if the offset is valid.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(RecordZone::Fixed)
    }

    /// Decode one framed record into a [`Tick`].
    ///
    /// The record is rejected as a whole if any required field fails to parse.
    pub fn decode(&self, raw: &str) -> Result<Tick, DecodeError> {
        let record = raw.trim();
        let contents = record
            .strip_prefix(RECORD_OPEN)
            .and_then(|r| r.strip_suffix(RECORD_CLOSE))
            .ok_or_else(|| DecodeError::Unframed(record.to_string()))?;

        let fields: Vec<&str> = contents.split(FIELD_SEPARATOR).collect();
        if fields.len() < REQUIRED_FIELDS {
            return Err(DecodeError::MissingFields {
                found: fields.len(),
            });
        }

        let datetime = self.parse_timestamp(fields[0])?;
        let sensor_id = fields[1]
            .parse::<i64>()
            .map_err(|_| DecodeError::InvalidSensorId(fields[1].to_string()))?;
        let controller_hint = fields
            .get(HINT_FIELD)
            .map(|hint| hint.trim())
            .filter(|hint| !hint.is_empty())
            .map(str::to_string);

        Ok(Tick {
            datetime,
            sensor_id,
            next_data_session: fields[2].to_string(),
            battery_voltage: fields[3].to_string(),
            sensor1: fields[4].to_string(),
            sensor2: fields[5].to_string(),
            radio_quality: fields[6].to_string(),
            controller_hint,
        })
    }

    fn parse_timestamp(&self, value: &str) -> Result<DateTime<FixedOffset>, DecodeError> {
        let invalid = |reason: String| DecodeError::InvalidTimestamp {
            value: value.to_string(),
            reason,
        };

        let naive = NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
            .map_err(|e| invalid(e.to_string()))?;

        let resolved = match self {
            // Ambiguous local times (DST fold) take the earlier instant
            RecordZone::Local => Local.from_local_datetime(&naive).earliest().map(|dt| {
                let offset = *dt.offset();
                dt.with_timezone(&offset)
            }),
            RecordZone::Fixed(offset) => offset.from_local_datetime(&naive).single(),
        };

        resolved.ok_or_else(|| invalid("time does not exist in the record zone".to_string()))
    }
}

/// Decode a record whose timestamp is in the host's local zone.
pub fn decode_tick_record(raw: &str) -> Result<Tick, DecodeError> {
    RecordZone::Local.decode(raw)
}

/// Render a tick back into its wire form, hint included when present.
pub fn encode_tick_record(tick: &Tick) -> String {
    let mut record = format!(
        "{open}{ts}{sep}{id}{sep}{next}{sep}{batt}{sep}{s1}{sep}{s2}{sep}{radio}",
        open = RECORD_OPEN,
        ts = tick.datetime.format(WIRE_TIMESTAMP_FORMAT),
        sep = FIELD_SEPARATOR,
        id = tick.sensor_id,
        next = tick.next_data_session,
        batt = tick.battery_voltage,
        s1 = tick.sensor1,
        s2 = tick.sensor2,
        radio = tick.radio_quality,
    );
    if let Some(ref hint) = tick.controller_hint {
        record.push(FIELD_SEPARATOR);
        record.push_str(hint);
    }
    record.push(RECORD_CLOSE);
    record
}

/// Decode a sign-and-magnitude value: bits 7..=14 weigh 0.5 to 64, bit 15 is
/// the sign. Bits 0..=6 carry no information.
pub fn decode_signed_magnitude16(raw: i64) -> f64 {
    let magnitude: f64 = MAGNITUDE_WEIGHTS
        .iter()
        .filter(|(bit, _)| raw & (1 << bit) != 0)
        .map(|(_, weight)| weight)
        .sum();

    if raw & (1 << SIGN_BIT) != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Decode the `sensor1` field into degrees.
pub fn decode_temperature(raw: &str) -> Result<f64, DecodeError> {
    parse_integer(raw).map(decode_signed_magnitude16)
}

/// Convert a millivolt reading into volts.
pub fn decode_battery_voltage(raw: &str) -> Result<f64, DecodeError> {
    parse_integer(raw).map(|millivolts| millivolts as f64 / 1000.0)
}

fn parse_integer(raw: &str) -> Result<i64, DecodeError> {
    raw.parse::<i64>()
        .map_err(|_| DecodeError::InvalidInteger(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn utc() -> RecordZone {
        RecordZone::from_offset_minutes(0).unwrap()
    }

    #[test]
    fn test_decode_record_fields_pass_through() {
        let tick = utc()
            .decode("[2024-1-1 10:0:0;42;60;3300;200;0;255]")
            .unwrap();

        assert_eq!(tick.sensor_id, 42);
        assert_eq!(tick.next_data_session, "60");
        assert_eq!(tick.battery_voltage, "3300");
        assert_eq!(tick.sensor1, "200");
        assert_eq!(tick.sensor2, "0");
        assert_eq!(tick.radio_quality, "255");
        assert_eq!(tick.controller_hint, None);
        assert_eq!(tick.datetime.year(), 2024);
        assert_eq!(tick.datetime.hour(), 10);
        assert_eq!(tick.datetime.minute(), 0);
    }

    #[test]
    fn test_encode_reproduces_wire_record() {
        let raw = "[2023-11-5 7:3:9;1001;600;2950;-32640;17;88;controller-9]";
        let tick = utc().decode(raw).unwrap();

        assert_eq!(encode_tick_record(&tick), raw);
    }

    #[test]
    fn test_decode_controller_hint() {
        let tick = utc()
            .decode("[2024-1-1 10:0:0;42;60;3300;200;0;255;17]")
            .unwrap();
        assert_eq!(tick.controller_hint.as_deref(), Some("17"));

        let tick = utc()
            .decode("[2024-1-1 10:0:0;42;60;3300;200;0;255;]")
            .unwrap();
        assert_eq!(tick.controller_hint, None);
    }

    #[test]
    fn test_decode_fixed_offset_rank() {
        let zone = RecordZone::from_offset_minutes(120).unwrap();
        let tick = zone.decode("[1970-1-1 2:0:10;1;0;0;0;0;0]").unwrap();

        assert_eq!(tick.rank(), 10);
    }

    #[test]
    fn test_decode_rejects_short_record() {
        assert_eq!(
            utc().decode("[bad-record]"),
            Err(DecodeError::MissingFields { found: 1 })
        );
        assert_eq!(
            utc().decode("[2024-1-1 10:0:0;42;60;3300;200;0]"),
            Err(DecodeError::MissingFields { found: 6 })
        );
    }

    #[test]
    fn test_decode_rejects_unframed_record() {
        assert!(matches!(
            utc().decode("2024-1-1 10:0:0;42;60;3300;200;0;255"),
            Err(DecodeError::Unframed(_))
        ));
        assert!(matches!(utc().decode("["), Err(DecodeError::Unframed(_))));
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        assert!(matches!(
            utc().decode("[2024-13-1 10:0:0;42;60;3300;200;0;255]"),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            utc().decode("[yesterday;42;60;3300;200;0;255]"),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_non_numeric_sensor() {
        assert_eq!(
            utc().decode("[2024-1-1 10:0:0;abc;60;3300;200;0;255]"),
            Err(DecodeError::InvalidSensorId("abc".to_string()))
        );
    }

    #[test]
    fn test_signed_magnitude_single_bits() {
        assert_eq!(decode_signed_magnitude16(1 << 7), 0.5);
        assert_eq!(decode_signed_magnitude16(1 << 14), 64.0);
        // Low bits are ignored
        assert_eq!(decode_signed_magnitude16(0b111_1111), 0.0);
    }

    #[test]
    fn test_signed_magnitude_full_negative() {
        let all_bits = (7..=15).fold(0i64, |acc, bit| acc | (1 << bit));
        assert_eq!(decode_signed_magnitude16(all_bits), -127.5);
    }

    #[test]
    fn test_temperature_from_text() {
        assert_eq!(decode_temperature("4608"), Ok(18.0));
        assert!(decode_temperature("warm").is_err());
    }

    #[test]
    fn test_battery_voltage() {
        assert_eq!(decode_battery_voltage("3300"), Ok(3.3));
        assert_eq!(
            decode_battery_voltage("abc"),
            Err(DecodeError::InvalidInteger("abc".to_string()))
        );
    }
}
