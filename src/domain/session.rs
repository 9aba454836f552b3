//! Dwell session model
//!
//! A dwell session is one continuous period during which a beacon is heard by
//! this sensor. Sessions start `Open`, are moved to `Preserved` once the beacon
//! has been quiet for the configured timeout, and are removed after the sink
//! acknowledged them.

use crate::domain::records::DeliveryRecord;
use crate::domain::types::BeaconIdentity;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a dwell session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    Open,
    /// Closed and waiting for delivery; `seq` keeps keys unique per table
    Preserved { seq: u64 },
}

/// Table key of a session.
///
/// Only one `Open` key exists per identity. Preserved keys also carry the
/// closest-approach time and a sequence number, so any number of finished
/// dwells for the same beacon can wait for delivery side by side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionKey {
    Open(BeaconIdentity),
    Preserved { identity: BeaconIdentity, min_time: DateTime<Utc>, seq: u64 },
}

impl SessionKey {
    pub fn identity(&self) -> &BeaconIdentity {
        match self {
            SessionKey::Open(identity) => identity,
            SessionKey::Preserved { identity, .. } => identity,
        }
    }

    pub fn is_preserved(&self) -> bool {
        matches!(self, SessionKey::Preserved { .. })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKey::Open(identity) => write!(f, "{identity}"),
            SessionKey::Preserved { identity, min_time, seq } => {
                write!(f, "{identity}@{}#{seq}", min_time.to_rfc3339())
            }
        }
    }
}

/// One dwell of a beacon at this sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellSession {
    pub identity: BeaconIdentity,
    pub in_time: DateTime<Utc>,
    pub last_seen_time: DateTime<Utc>,
    pub min_distance: u32,
    pub min_distance_time: DateTime<Utc>,
    #[serde(flatten)]
    pub phase: SessionPhase,
}

impl DwellSession {
    #[inline]
    pub fn new(identity: BeaconIdentity, timestamp: DateTime<Utc>, distance: u32) -> Self {
        Self {
            identity,
            in_time: timestamp,
            last_seen_time: timestamp,
            min_distance: distance,
            min_distance_time: timestamp,
            phase: SessionPhase::Open,
        }
    }

    /// Record another sighting. Ties keep the earlier closest-approach time.
    pub fn observe(&mut self, timestamp: DateTime<Utc>, distance: u32) {
        self.last_seen_time = timestamp;
        if distance < self.min_distance {
            self.min_distance = distance;
            self.min_distance_time = timestamp;
        }
    }

    pub fn key(&self) -> SessionKey {
        match self.phase {
            SessionPhase::Open => SessionKey::Open(self.identity.clone()),
            SessionPhase::Preserved { seq } => SessionKey::Preserved {
                identity: self.identity.clone(),
                min_time: self.min_distance_time,
                seq,
            },
        }
    }

    pub fn is_open(&self) -> bool {
        self.phase == SessionPhase::Open
    }

    /// Quiet for strictly longer than `quiet_timeout`
    pub fn is_ready(&self, now: DateTime<Utc>, quiet_timeout: Duration) -> bool {
        now - self.last_seen_time > quiet_timeout
    }

    pub fn to_record(&self, sensor_serial: &str) -> DeliveryRecord {
        DeliveryRecord {
            raspi_serial: sensor_serial.to_string(),
            ibeacon_uuid: self.identity.uuid.clone(),
            ibeacon_major: self.identity.major,
            ibeacon_minor: self.identity.minor,
            in_time: self.in_time,
            out_time: self.last_seen_time,
            min_dist: self.min_distance,
            min_time: self.min_distance_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn beacon() -> BeaconIdentity {
        BeaconIdentity::new("abcd", 1, 2)
    }

    #[test]
    fn test_new_session_fields() {
        let session = DwellSession::new(beacon(), at(0), 5);
        assert_eq!(session.in_time, at(0));
        assert_eq!(session.last_seen_time, at(0));
        assert_eq!(session.min_distance, 5);
        assert_eq!(session.min_distance_time, at(0));
        assert!(session.is_open());
    }

    #[test]
    fn test_observe_tracks_closest_approach() {
        let mut session = DwellSession::new(beacon(), at(0), 5);
        session.observe(at(3), 2);
        session.observe(at(6), 4);
        session.observe(at(7), 2);

        assert_eq!(session.last_seen_time, at(7));
        assert_eq!(session.min_distance, 2);
        // tie at t=7 keeps t=3
        assert_eq!(session.min_distance_time, at(3));
        assert_eq!(session.in_time, at(0));
    }

    #[test]
    fn test_readiness_is_strict() {
        let session = DwellSession::new(beacon(), at(0), 5);
        let timeout = Duration::seconds(5);
        assert!(!session.is_ready(at(5), timeout));
        assert!(session.is_ready(at(6), timeout));
    }

    #[test]
    fn test_key_follows_phase() {
        let mut session = DwellSession::new(beacon(), at(0), 5);
        assert_eq!(session.key(), SessionKey::Open(beacon()));

        session.phase = SessionPhase::Preserved { seq: 3 };
        let key = session.key();
        assert!(key.is_preserved());
        assert_eq!(key.identity(), &beacon());
        assert_eq!(key, SessionKey::Preserved { identity: beacon(), min_time: at(0), seq: 3 });
    }

    #[test]
    fn test_to_record() {
        let mut session = DwellSession::new(beacon(), at(0), 5);
        session.observe(at(4), 1);
        let record = session.to_record("00000000f56eacba");
        assert_eq!(record.raspi_serial, "00000000f56eacba");
        assert_eq!(record.ibeacon_uuid, "abcd");
        assert_eq!(record.in_time, at(0));
        assert_eq!(record.out_time, at(4));
        assert_eq!(record.min_dist, 1);
        assert_eq!(record.min_time, at(4));
    }
}
