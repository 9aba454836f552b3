//! Records exchanged with the sink: delivered sessions, gates and crossing events

use crate::domain::types::BeaconIdentity;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Snapshot of a finished dwell session as submitted to the sink
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub raspi_serial: String,
    pub ibeacon_uuid: String,
    #[serde(deserialize_with = "deserialize_lenient_int")]
    pub ibeacon_major: u16,
    #[serde(deserialize_with = "deserialize_lenient_int")]
    pub ibeacon_minor: u16,
    #[serde(deserialize_with = "deserialize_datetime")]
    pub in_time: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_datetime")]
    pub out_time: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_lenient_int")]
    pub min_dist: u32,
    #[serde(deserialize_with = "deserialize_datetime")]
    pub min_time: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn identity(&self) -> BeaconIdentity {
        BeaconIdentity::new(self.ibeacon_uuid.clone(), self.ibeacon_major, self.ibeacon_minor)
    }
}

/// Two sensors bracketing a passage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GateDefinition {
    #[serde(default)]
    pub id: u64,
    #[serde(rename = "raspi_serial_left")]
    pub sensor_left: String,
    #[serde(rename = "raspi_serial_right")]
    pub sensor_right: String,
    /// Course distance threshold; beyond it a pass counts as `wide`
    #[serde(deserialize_with = "deserialize_lenient_int")]
    pub distance: u32,
}

/// Side of a gate a sensor sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSide {
    Left,
    Right,
}

impl GateDefinition {
    pub fn side_of(&self, sensor: &str) -> Option<GateSide> {
        if sensor == self.sensor_left {
            Some(GateSide::Left)
        } else if sensor == self.sensor_right {
            Some(GateSide::Right)
        } else {
            None
        }
    }

    /// Same sensors and threshold, ignoring the id
    pub fn same_definition(&self, other: &GateDefinition) -> bool {
        self.sensor_left == other.sensor_left
            && self.sensor_right == other.sensor_right
            && self.distance == other.distance
    }
}

/// Classified crossing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Course {
    Left,
    Right,
    Center,
    Wide,
}

impl Course {
    /// Classify by the closest approach seen from each side.
    ///
    /// Halving is integer floor division, so two zero distances classify as `Left`.
    pub fn classify(dist_left: u32, dist_right: u32, threshold: u32) -> Self {
        if dist_left > threshold || dist_right > threshold {
            Course::Wide
        } else if dist_left <= dist_right / 2 {
            Course::Left
        } else if dist_right <= dist_left / 2 {
            Course::Right
        } else {
            Course::Center
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Course::Left => "left",
            Course::Right => "right",
            Course::Center => "center",
            Course::Wide => "wide",
        }
    }
}

/// A beacon passing through a gate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrossingEvent {
    pub gate_id: u64,
    pub ibeacon_uuid: String,
    pub ibeacon_major: u16,
    pub ibeacon_minor: u16,
    pub in_time: DateTime<Utc>,
    pub out_time: DateTime<Utc>,
    pub min_time_left: DateTime<Utc>,
    pub min_time_right: DateTime<Utc>,
    pub course: Course,
}

/// Accepts RFC 3339 timestamps and naive ISO-8601 timestamps (taken as UTC)
fn deserialize_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct DateTimeVisitor;

    impl<'de> Visitor<'de> for DateTimeVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an ISO-8601 timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<DateTime<Utc>, E>
        where
            E: de::Error,
        {
            if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| naive.and_utc())
                .map_err(|_| E::custom(format!("invalid timestamp: {value}")))
        }
    }

    deserializer.deserialize_str(DateTimeVisitor)
}

/// Accepts integers, floats (truncated) and numeric strings
fn deserialize_lenient_int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    use serde::de::{self, Visitor};

    struct LenientIntVisitor;

    impl<'de> Visitor<'de> for LenientIntVisitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an integer, a float or a numeric string")
        }

        fn visit_i64<E>(self, value: i64) -> Result<i64, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_u64<E>(self, value: u64) -> Result<i64, E>
        where
            E: de::Error,
        {
            i64::try_from(value).map_err(|_| E::custom("integer out of range"))
        }

        fn visit_f64<E>(self, value: f64) -> Result<i64, E>
        where
            E: de::Error,
        {
            if value.is_finite() {
                Ok(value.trunc() as i64)
            } else {
                Err(E::custom("non-finite number"))
            }
        }

        fn visit_str<E>(self, value: &str) -> Result<i64, E>
        where
            E: de::Error,
        {
            let value = value.trim();
            if let Ok(v) = value.parse::<i64>() {
                return Ok(v);
            }
            value
                .parse::<f64>()
                .map_err(|_| E::custom(format!("not a number: {value}")))
                .and_then(|v| self.visit_f64(v))
        }
    }

    let raw = deserializer.deserialize_any(LenientIntVisitor)?;
    T::try_from(raw).map_err(|_| serde::de::Error::custom(format!("{raw} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_classification() {
        assert_eq!(Course::classify(2, 8, 10), Course::Left);
        assert_eq!(Course::classify(8, 2, 10), Course::Right);
        assert_eq!(Course::classify(5, 5, 10), Course::Center);
        assert_eq!(Course::classify(12, 2, 10), Course::Wide);
        assert_eq!(Course::classify(2, 11, 10), Course::Wide);
    }

    #[test]
    fn test_course_halving_uses_floor() {
        // 3 / 2 == 1, so 2 is not <= 1
        assert_eq!(Course::classify(2, 3, 10), Course::Center);
        assert_eq!(Course::classify(1, 3, 10), Course::Left);
        // zero on both sides degenerates to left
        assert_eq!(Course::classify(0, 0, 10), Course::Left);
    }

    #[test]
    fn test_record_accepts_string_numbers_and_naive_times() {
        let json = r#"{
            "raspi_serial": "00000000f56eacba",
            "ibeacon_uuid": "abcd",
            "ibeacon_major": "1",
            "ibeacon_minor": "5555",
            "in_time": "2024-03-01T10:00:00.250000",
            "out_time": "2024-03-01T10:00:09",
            "min_dist": "3.0",
            "min_time": "2024-03-01T10:00:04+00:00"
        }"#;
        let record: DeliveryRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.ibeacon_major, 1);
        assert_eq!(record.ibeacon_minor, 5555);
        assert_eq!(record.min_dist, 3);
        assert_eq!(record.in_time.to_rfc3339(), "2024-03-01T10:00:00.250+00:00");
        assert_eq!(record.identity(), BeaconIdentity::new("abcd", 1, 5555));
    }

    #[test]
    fn test_record_rejects_out_of_range_major() {
        let json = r#"{
            "raspi_serial": "s", "ibeacon_uuid": "abcd",
            "ibeacon_major": 70000, "ibeacon_minor": 1,
            "in_time": "2024-03-01T10:00:00Z", "out_time": "2024-03-01T10:00:09Z",
            "min_dist": 3, "min_time": "2024-03-01T10:00:04Z"
        }"#;
        assert!(serde_json::from_str::<DeliveryRecord>(json).is_err());
    }

    #[test]
    fn test_gate_side_lookup() {
        let gate = GateDefinition {
            id: 1,
            sensor_left: "L".to_string(),
            sensor_right: "R".to_string(),
            distance: 10,
        };
        assert_eq!(gate.side_of("L"), Some(GateSide::Left));
        assert_eq!(gate.side_of("R"), Some(GateSide::Right));
        assert_eq!(gate.side_of("X"), None);
    }

    #[test]
    fn test_gate_wire_names() {
        let gate: GateDefinition = serde_json::from_str(
            r#"{"raspi_serial_left":"L","raspi_serial_right":"R","distance":15}"#,
        )
        .unwrap();
        assert_eq!(gate.id, 0);
        assert_eq!(gate.sensor_left, "L");
        assert_eq!(gate.distance, 15);
    }
}
