//! Shared types for the beacon gate agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// iBeacon identity: (uuid, major, minor)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeaconIdentity {
    pub uuid: String,
    pub major: u16,
    pub minor: u16,
}

impl BeaconIdentity {
    pub fn new(uuid: impl Into<String>, major: u16, minor: u16) -> Self {
        Self { uuid: uuid.into(), major, minor }
    }
}

impl std::fmt::Display for BeaconIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.uuid, self.major, self.minor)
    }
}

/// A single parsed advertisement as delivered by the scanner
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub identity: BeaconIdentity,
    pub timestamp: DateTime<Utc>,
    pub rssi: i32,
    pub tx_power: i32,
}

#[derive(Debug, Error, PartialEq)]
pub enum SampleParseError {
    #[error("expected 5 or 6 comma separated fields, got {0}")]
    FieldCount(usize),
    #[error("empty beacon uuid")]
    EmptyUuid,
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

fn parse_field<T: std::str::FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, SampleParseError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SampleParseError::InvalidField { field, value: value.to_string() })
}

/// Parse one scanner line.
///
/// Accepted forms:
/// - `uuid,major,minor,tx_power,rssi`
/// - `mac,uuid,major,minor,tx_power,rssi` (raw scanner output, MAC ignored)
pub fn parse_sample_line(
    line: &str,
    timestamp: DateTime<Utc>,
) -> Result<Sample, SampleParseError> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    let fields = match fields.len() {
        5 => &fields[..],
        6 => &fields[1..],
        n => return Err(SampleParseError::FieldCount(n)),
    };

    let uuid = fields[0].trim();
    if uuid.is_empty() {
        return Err(SampleParseError::EmptyUuid);
    }

    let major = parse_field("major", fields[1])?;
    let minor = parse_field("minor", fields[2])?;

    Ok(Sample {
        identity: BeaconIdentity::new(uuid, major, minor),
        timestamp,
        tx_power: parse_field("tx_power", fields[3])?,
        rssi: parse_field("rssi", fields[4])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_parse_five_fields() {
        let sample = parse_sample_line("b3de1433880f020106030220fe07fffe,1,5555,-59,-71", ts()).unwrap();
        assert_eq!(sample.identity, BeaconIdentity::new("b3de1433880f020106030220fe07fffe", 1, 5555));
        assert_eq!(sample.tx_power, -59);
        assert_eq!(sample.rssi, -71);
        assert_eq!(sample.timestamp, ts());
    }

    #[test]
    fn test_parse_scanner_form_skips_mac() {
        let sample = parse_sample_line("d0:39:72:a4:1e:9b,abcd,2,7,-60,-80\n", ts()).unwrap();
        assert_eq!(sample.identity.uuid, "abcd");
        assert_eq!(sample.identity.major, 2);
        assert_eq!(sample.identity.minor, 7);
        assert_eq!(sample.rssi, -80);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_sample_line("abcd,1,2", ts()), Err(SampleParseError::FieldCount(3)));
        assert_eq!(parse_sample_line(",1,2,-59,-70", ts()), Err(SampleParseError::EmptyUuid));
        assert!(matches!(
            parse_sample_line("abcd,x,2,-59,-70", ts()),
            Err(SampleParseError::InvalidField { field: "major", .. })
        ));
        assert!(matches!(
            parse_sample_line("abcd,1,70000,-59,-70", ts()),
            Err(SampleParseError::InvalidField { field: "minor", .. })
        ));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(BeaconIdentity::new("abcd", 1, 2).to_string(), "abcd,1,2");
    }
}
