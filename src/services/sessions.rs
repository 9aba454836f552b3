//! Dwell session table
//!
//! Holds at most one open session per beacon plus any number of preserved
//! sessions waiting for delivery. Ordered by key, so open sessions always
//! iterate before preserved ones and flush order is deterministic.

use crate::domain::session::{DwellSession, SessionKey, SessionPhase};
use crate::domain::types::BeaconIdentity;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Serialized form of the table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub next_seq: u64,
    pub sessions: Vec<DwellSession>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionTable {
    sessions: BTreeMap<SessionKey, DwellSession>,
    next_seq: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting. Returns true when a new open session was started.
    pub fn observe(&mut self, identity: &BeaconIdentity, at: DateTime<Utc>, distance: u32) -> bool {
        let key = SessionKey::Open(identity.clone());
        match self.sessions.get_mut(&key) {
            Some(session) => {
                session.observe(at, distance);
                false
            }
            None => {
                self.sessions.insert(key, DwellSession::new(identity.clone(), at, distance));
                true
            }
        }
    }

    /// Keys of every session quiet for longer than `quiet_timeout`, open ones first
    pub fn age_out(&self, now: DateTime<Utc>, quiet_timeout: Duration) -> Vec<SessionKey> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.is_ready(now, quiet_timeout))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Move an open session to the preserved set. Returns its new key.
    pub fn preserve(&mut self, key: &SessionKey) -> Option<SessionKey> {
        if key.is_preserved() {
            return None;
        }
        let mut session = self.sessions.remove(key)?;
        session.phase = SessionPhase::Preserved { seq: self.next_seq };
        self.next_seq += 1;

        let preserved_key = session.key();
        debug!(key = %preserved_key, "session_preserved_in_table");
        self.sessions.insert(preserved_key.clone(), session);
        Some(preserved_key)
    }

    /// Delete a preserved session. Open keys and absent keys are left alone.
    pub fn remove(&mut self, key: &SessionKey) -> Option<DwellSession> {
        if !key.is_preserved() {
            return None;
        }
        self.sessions.remove(key)
    }

    pub fn get(&self, key: &SessionKey) -> Option<&DwellSession> {
        self.sessions.get(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.sessions.keys().filter(|key| !key.is_preserved()).count()
    }

    pub fn preserved_count(&self) -> usize {
        self.sessions.keys().filter(|key| key.is_preserved()).count()
    }

    /// Whether `identity` currently has an open dwell
    pub fn has_open(&self, identity: &BeaconIdentity) -> bool {
        self.sessions.contains_key(&SessionKey::Open(identity.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionKey, &DwellSession)> {
        self.sessions.iter()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            next_seq: self.next_seq,
            sessions: self.sessions.values().cloned().collect(),
        }
    }

    /// Rebuild a table. A duplicated open identity keeps the last entry.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut next_seq = snapshot.next_seq;
        let mut sessions = BTreeMap::new();
        for session in snapshot.sessions {
            if let SessionPhase::Preserved { seq } = session.phase {
                next_seq = next_seq.max(seq.saturating_add(1));
            }
            sessions.insert(session.key(), session);
        }
        Self { sessions, next_seq }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn beacon(minor: u16) -> BeaconIdentity {
        BeaconIdentity::new("abcd", 1, minor)
    }

    fn timeout() -> Duration {
        Duration::seconds(5)
    }

    #[test]
    fn test_one_open_session_per_identity() {
        let mut table = SessionTable::new();
        assert!(table.observe(&beacon(1), at(0), 5));
        assert!(!table.observe(&beacon(1), at(1), 3));
        assert!(table.observe(&beacon(2), at(1), 3));
        assert_eq!(table.open_count(), 2);
        assert_eq!(table.preserved_count(), 0);
    }

    #[test]
    fn test_age_out_is_strict_and_ordered() {
        let mut table = SessionTable::new();
        table.observe(&beacon(2), at(0), 5);
        table.observe(&beacon(1), at(0), 5);
        table.observe(&beacon(3), at(4), 5);

        assert!(table.age_out(at(5), timeout()).is_empty());

        let ready = table.age_out(at(6), timeout());
        assert_eq!(ready, vec![SessionKey::Open(beacon(1)), SessionKey::Open(beacon(2))]);
    }

    #[test]
    fn test_open_keys_come_before_preserved_keys() {
        let mut table = SessionTable::new();
        table.observe(&beacon(1), at(0), 5);
        table.preserve(&SessionKey::Open(beacon(1))).unwrap();
        table.observe(&beacon(9), at(1), 5);

        let ready = table.age_out(at(100), timeout());
        assert_eq!(ready.len(), 2);
        assert!(!ready[0].is_preserved());
        assert!(ready[1].is_preserved());
    }

    #[test]
    fn test_preserve_frees_identity_for_new_open_session() {
        let mut table = SessionTable::new();
        table.observe(&beacon(1), at(0), 5);
        let key = table.preserve(&SessionKey::Open(beacon(1))).unwrap();
        assert_eq!(key, SessionKey::Preserved { identity: beacon(1), min_time: at(0), seq: 0 });

        assert!(table.observe(&beacon(1), at(10), 7));
        assert_eq!(table.open_count(), 1);
        assert_eq!(table.preserved_count(), 1);

        // preserved copy is untouched by the new dwell
        assert_eq!(table.get(&key).unwrap().last_seen_time, at(0));
    }

    #[test]
    fn test_many_preserved_sessions_for_one_identity() {
        let mut table = SessionTable::new();
        for dwell in 0..3 {
            table.observe(&beacon(1), at(dwell * 100), 5);
            table.preserve(&SessionKey::Open(beacon(1))).unwrap();
        }
        assert_eq!(table.preserved_count(), 3);
        assert!(!table.has_open(&beacon(1)));
    }

    #[test]
    fn test_preserve_rejects_preserved_or_absent_keys() {
        let mut table = SessionTable::new();
        assert_eq!(table.preserve(&SessionKey::Open(beacon(1))), None);

        table.observe(&beacon(1), at(0), 5);
        let key = table.preserve(&SessionKey::Open(beacon(1))).unwrap();
        assert_eq!(table.preserve(&key), None);
        assert_eq!(table.preserved_count(), 1);
    }

    #[test]
    fn test_remove_only_touches_preserved() {
        let mut table = SessionTable::new();
        table.observe(&beacon(1), at(0), 5);
        assert!(table.remove(&SessionKey::Open(beacon(1))).is_none());
        assert_eq!(table.len(), 1);

        let key = table.preserve(&SessionKey::Open(beacon(1))).unwrap();
        assert!(table.remove(&key).is_some());
        assert!(table.remove(&key).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_dwell_scenario() {
        let mut table = SessionTable::new();
        table.observe(&beacon(1), at(0), 5);
        table.observe(&beacon(1), at(3), 2);
        table.observe(&beacon(1), at(6), 4);

        assert!(table.age_out(at(11), timeout()).is_empty());

        let ready = table.age_out(at(12), timeout());
        assert_eq!(ready, vec![SessionKey::Open(beacon(1))]);
        let key = table.preserve(&ready[0]).unwrap();

        let session = table.get(&key).unwrap();
        assert_eq!(session.min_distance, 2);
        assert_eq!(session.min_distance_time, at(3));
        assert_eq!(session.in_time, at(0));
        assert_eq!(session.last_seen_time, at(6));

        let ready = table.age_out(at(20), timeout());
        assert_eq!(ready, vec![key.clone()]);
        table.remove(&key);
        assert!(table.is_empty());
        assert!(table.age_out(at(30), timeout()).is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut table = SessionTable::new();
        table.observe(&beacon(1), at(0), 5);
        table.preserve(&SessionKey::Open(beacon(1))).unwrap();
        table.observe(&beacon(1), at(10), 3);
        table.observe(&beacon(2), at(11), 8);

        let json = serde_json::to_string(&table.snapshot()).unwrap();
        let restored = SessionTable::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored, table);
    }

    #[test]
    fn test_from_snapshot_keeps_sequence_ahead_of_stored_keys() {
        let mut session = DwellSession::new(beacon(1), at(0), 5);
        session.phase = SessionPhase::Preserved { seq: 7 };
        let mut table =
            SessionTable::from_snapshot(SessionSnapshot { next_seq: 0, sessions: vec![session] });

        table.observe(&beacon(1), at(0), 5);
        let key = table.preserve(&SessionKey::Open(beacon(1))).unwrap();
        assert_eq!(key, SessionKey::Preserved { identity: beacon(1), min_time: at(0), seq: 8 });
        assert_eq!(table.preserved_count(), 2);
    }
}
