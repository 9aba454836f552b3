//! Domain models - beacon identities, dwell sessions and gate records
//!
//! This module contains the canonical data types used throughout the system:
//! - `BeaconIdentity` - the (uuid, major, minor) key of a tracked tag
//! - `Sample` - one scanner advertisement
//! - `DwellSession` - one continuous stay of a beacon at a sensor
//! - `DeliveryRecord` - a finished session as stored by the sink
//! - `GateDefinition` / `CrossingEvent` - gate pairs and classified passes

pub mod records;
pub mod session;
pub mod types;

pub use records::{Course, CrossingEvent, DeliveryRecord, GateDefinition, GateSide};
pub use session::{DwellSession, SessionKey, SessionPhase};
pub use types::{parse_sample_line, BeaconIdentity, Sample, SampleParseError};
