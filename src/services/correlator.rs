//! Gate correlation engine
//!
//! A beacon crossing a gate is heard by both of its sensors with overlapping
//! dwell intervals. For every pair of stored sessions of the same beacon
//! where the second one starts inside the first one, and the two come from
//! opposite sides of the gate, the closest-approach distances decide the
//! course.

use crate::domain::records::{Course, CrossingEvent, DeliveryRecord, GateDefinition, GateSide};
use crate::domain::types::BeaconIdentity;
use crate::services::sink_store::{SinkStore, StoreError};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// Crossing events for one gate, in record order
pub fn correlate(gate: &GateDefinition, records: &[DeliveryRecord]) -> Vec<CrossingEvent> {
    let mut by_beacon: FxHashMap<BeaconIdentity, Vec<&DeliveryRecord>> = FxHashMap::default();
    for record in records {
        by_beacon.entry(record.identity()).or_default().push(record);
    }

    let mut events = Vec::new();
    for first in records {
        let Some(first_side) = gate.side_of(&first.raspi_serial) else {
            continue;
        };
        let Some(candidates) = by_beacon.get(&first.identity()) else {
            continue;
        };

        for second in candidates {
            if !(first.in_time < second.in_time && second.in_time < first.out_time) {
                continue;
            }

            let (left, right) = match (first_side, gate.side_of(&second.raspi_serial)) {
                (GateSide::Left, Some(GateSide::Right)) => (first, *second),
                (GateSide::Right, Some(GateSide::Left)) => (*second, first),
                (_, other_side) => {
                    debug!(
                        gate_id = %gate.id,
                        identity = %first.identity(),
                        first_sensor = %first.raspi_serial,
                        second_sensor = %second.raspi_serial,
                        second_side = ?other_side,
                        "correlation_pair_skipped"
                    );
                    continue;
                }
            };

            events.push(CrossingEvent {
                gate_id: gate.id,
                ibeacon_uuid: first.ibeacon_uuid.clone(),
                ibeacon_major: first.ibeacon_major,
                ibeacon_minor: first.ibeacon_minor,
                in_time: first.in_time,
                out_time: second.out_time,
                min_time_left: left.min_time,
                min_time_right: right.min_time,
                course: Course::classify(left.min_dist, right.min_dist, gate.distance),
            });
        }
    }
    events
}

/// Correlate every stored gate and store the new events.
/// Returns how many events were inserted.
pub fn collect(store: &SinkStore) -> Result<usize, StoreError> {
    let (gates, records) = store.correlation_input();

    let mut events = Vec::new();
    for gate in &gates {
        let found = correlate(gate, &records);
        debug!(gate_id = %gate.id, events = %found.len(), "gate_correlated");
        events.extend(found);
    }

    let candidates = events.len();
    let inserted = store.insert_events(events)?;
    info!(
        gates = %gates.len(),
        records = %records.len(),
        candidates = %candidates,
        inserted = %inserted,
        "correlation_run"
    );
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(serial: &str, in_secs: i64, out_secs: i64, dist: u32, min_secs: i64) -> DeliveryRecord {
        DeliveryRecord {
            raspi_serial: serial.to_string(),
            ibeacon_uuid: "abcd".to_string(),
            ibeacon_major: 1,
            ibeacon_minor: 2,
            in_time: at(in_secs),
            out_time: at(out_secs),
            min_dist: dist,
            min_time: at(min_secs),
        }
    }

    fn gate() -> GateDefinition {
        GateDefinition {
            id: 7,
            sensor_left: "LEFT".to_string(),
            sensor_right: "RIGHT".to_string(),
            distance: 10,
        }
    }

    #[test]
    fn test_left_course_from_left_first() {
        let records = vec![record("LEFT", 0, 10, 2, 3), record("RIGHT", 5, 15, 8, 9)];
        let events = correlate(&gate(), &records);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.gate_id, 7);
        assert_eq!(event.in_time, at(0));
        assert_eq!(event.out_time, at(15));
        assert_eq!(event.min_time_left, at(3));
        assert_eq!(event.min_time_right, at(9));
        assert_eq!(event.course, Course::Left);
    }

    #[test]
    fn test_right_first_maps_sides_by_gate() {
        let records = vec![record("RIGHT", 0, 10, 2, 3), record("LEFT", 5, 15, 8, 9)];
        let events = correlate(&gate(), &records);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].min_time_left, at(9));
        assert_eq!(events[0].min_time_right, at(3));
        assert_eq!(events[0].course, Course::Right);
    }

    #[test]
    fn test_courses() {
        let cases = [(5, 5, Course::Center), (12, 2, Course::Wide), (2, 11, Course::Wide)];
        for (left, right, course) in cases {
            let records = vec![record("LEFT", 0, 10, left, 3), record("RIGHT", 5, 15, right, 9)];
            assert_eq!(correlate(&gate(), &records)[0].course, course);
        }
    }

    #[test]
    fn test_overlap_bounds_are_strict() {
        // second starts exactly when first starts or ends
        let records = vec![
            record("LEFT", 0, 10, 2, 3),
            record("RIGHT", 0, 12, 8, 9),
            record("RIGHT", 10, 20, 8, 15),
        ];
        assert!(correlate(&gate(), &records).is_empty());
    }

    #[test]
    fn test_same_side_and_foreign_sensor_are_skipped() {
        let records = vec![
            record("LEFT", 0, 10, 2, 3),
            record("LEFT", 4, 12, 2, 5),
            record("ELSEWHERE", 5, 15, 8, 9),
        ];
        assert!(correlate(&gate(), &records).is_empty());
    }

    #[test]
    fn test_skipped_pair_does_not_hide_valid_pair() {
        // the foreign sensor starts first inside the left dwell
        let records = vec![
            record("LEFT", 0, 10, 2, 3),
            record("ELSEWHERE", 3, 9, 1, 4),
            record("RIGHT", 5, 15, 8, 9),
        ];
        let events = correlate(&gate(), &records);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].in_time, at(0));
        assert_eq!(events[0].out_time, at(15));
        assert_eq!(events[0].min_time_right, at(9));
    }

    #[test]
    fn test_collect_continues_past_gate_without_pairs() {
        let store = SinkStore::in_memory();
        let mut unrelated = gate();
        unrelated.sensor_left = "NORTH".to_string();
        store.insert_gate(unrelated).unwrap();
        store.insert_gate(gate()).unwrap();
        store.insert_record(record("LEFT", 0, 10, 2, 3)).unwrap();
        store.insert_record(record("LEFT", 4, 12, 2, 5)).unwrap();
        store.insert_record(record("RIGHT", 5, 15, 8, 9)).unwrap();

        // both LEFT dwells pair with RIGHT on the second gate
        assert_eq!(collect(&store).unwrap(), 2);
        assert!(store.events().iter().all(|e| e.item.gate_id == 2));
    }

    #[test]
    fn test_other_beacons_do_not_pair() {
        let mut other = record("RIGHT", 5, 15, 8, 9);
        other.ibeacon_minor = 3;
        assert!(correlate(&gate(), &[record("LEFT", 0, 10, 2, 3), other]).is_empty());
    }

    #[test]
    fn test_collect_is_idempotent() {
        let store = SinkStore::in_memory();
        store.insert_gate(gate()).unwrap();
        store.insert_record(record("LEFT", 0, 10, 2, 3)).unwrap();
        store.insert_record(record("RIGHT", 5, 15, 8, 9)).unwrap();

        assert_eq!(collect(&store).unwrap(), 1);
        assert_eq!(collect(&store).unwrap(), 0);

        let events = store.events();
        assert_eq!(events.len(), 1);
        // store assigned gate id 1
        assert_eq!(events[0].item.gate_id, 1);
    }

    #[test]
    fn test_collect_without_gates_inserts_nothing() {
        let store = SinkStore::in_memory();
        store.insert_record(record("LEFT", 0, 10, 2, 3)).unwrap();
        assert_eq!(collect(&store).unwrap(), 0);
    }
}
