//! Sink storage: delivered sessions, gate definitions and crossing events
//!
//! All three tables live behind one mutex and are written to a single JSON
//! file after every mutation. Inserts suppress duplicates by full-field
//! match; gates compare sensors and threshold only.

use crate::domain::records::{CrossingEvent, DeliveryRecord, GateDefinition};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("store file is not valid json: {0}")]
    Format(#[from] serde_json::Error),
}

/// A row with its table id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub id: u64,
    #[serde(flatten)]
    pub item: T,
}

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted(u64),
    /// An identical row exists under this id
    Duplicate(u64),
}

impl Insert {
    pub fn id(&self) -> u64 {
        match self {
            Insert::Inserted(id) | Insert::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Insert::Duplicate(_))
    }
}

fn first_id() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tables {
    #[serde(default = "first_id")]
    next_record_id: u64,
    #[serde(default = "first_id")]
    next_gate_id: u64,
    #[serde(default = "first_id")]
    next_event_id: u64,
    #[serde(default)]
    records: Vec<Stored<DeliveryRecord>>,
    #[serde(default)]
    gates: Vec<GateDefinition>,
    #[serde(default)]
    events: Vec<Stored<CrossingEvent>>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            next_record_id: first_id(),
            next_gate_id: first_id(),
            next_event_id: first_id(),
            records: Vec::new(),
            gates: Vec::new(),
            events: Vec::new(),
        }
    }
}

fn take_id(next: &mut u64) -> u64 {
    let id = *next;
    *next += 1;
    id
}

pub struct SinkStore {
    tables: Mutex<Tables>,
    /// None keeps everything in memory
    path: Option<PathBuf>,
}

impl SinkStore {
    pub fn in_memory() -> Self {
        Self { tables: Mutex::new(Tables::default()), path: None }
    }

    /// Open a file-backed store; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Tables::default(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Tables::default(),
            Err(source) => {
                return Err(StoreError::Io { path: path.display().to_string(), source })
            }
        };
        info!(
            path = %path.display(),
            records = %tables.records.len(),
            gates = %tables.gates.len(),
            events = %tables.events.len(),
            "sink_store_opened"
        );
        Ok(Self { tables: Mutex::new(tables), path: Some(path) })
    }

    fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_error =
            |source: io::Error| StoreError::Io { path: path.display().to_string(), source };

        let json = serde_json::to_vec(tables)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }
        let tmp = tmp_path(path);
        fs::write(&tmp, &json).map_err(io_error)?;
        fs::rename(&tmp, path).map_err(io_error)?;
        debug!(path = %path.display(), bytes = %json.len(), "sink_store_written");
        Ok(())
    }

    /// Apply `change` under the lock and write the tables when it reports a
    /// modification. A failed write restores the previous tables, so nothing
    /// that missed the disk is ever reported as stored.
    fn mutate<R>(&self, change: impl FnOnce(&mut Tables) -> (R, bool)) -> Result<R, StoreError> {
        let mut tables = self.tables.lock();
        let previous = self.path.as_ref().map(|_| tables.clone());
        let (result, changed) = change(&mut tables);
        if changed {
            if let Err(e) = self.persist(&tables) {
                if let Some(previous) = previous {
                    *tables = previous;
                }
                return Err(e);
            }
        }
        Ok(result)
    }

    // ---- records ----

    pub fn records(&self) -> Vec<Stored<DeliveryRecord>> {
        self.tables.lock().records.clone()
    }

    pub fn insert_record(&self, record: DeliveryRecord) -> Result<Insert, StoreError> {
        self.mutate(|tables| {
            if let Some(existing) = tables.records.iter().find(|r| r.item == record) {
                return (Insert::Duplicate(existing.id), false);
            }
            let id = take_id(&mut tables.next_record_id);
            tables.records.push(Stored { id, item: record });
            (Insert::Inserted(id), true)
        })
    }

    /// Replace a record. Returns false when the id is unknown.
    pub fn update_record(&self, id: u64, record: DeliveryRecord) -> Result<bool, StoreError> {
        self.mutate(|tables| match tables.records.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.item = record;
                (true, true)
            }
            None => (false, false),
        })
    }

    pub fn delete_record(&self, id: u64) -> Result<bool, StoreError> {
        self.mutate(|tables| {
            let before = tables.records.len();
            tables.records.retain(|r| r.id != id);
            let removed = tables.records.len() != before;
            (removed, removed)
        })
    }

    // ---- gates ----

    pub fn gates(&self) -> Vec<GateDefinition> {
        self.tables.lock().gates.clone()
    }

    /// The id in `gate` is ignored; the store assigns one
    pub fn insert_gate(&self, mut gate: GateDefinition) -> Result<Insert, StoreError> {
        self.mutate(|tables| {
            if let Some(existing) = tables.gates.iter().find(|g| g.same_definition(&gate)) {
                return (Insert::Duplicate(existing.id), false);
            }
            gate.id = take_id(&mut tables.next_gate_id);
            let id = gate.id;
            tables.gates.push(gate);
            (Insert::Inserted(id), true)
        })
    }

    pub fn update_gate(&self, id: u64, mut gate: GateDefinition) -> Result<bool, StoreError> {
        self.mutate(|tables| match tables.gates.iter_mut().find(|g| g.id == id) {
            Some(row) => {
                gate.id = id;
                *row = gate;
                (true, true)
            }
            None => (false, false),
        })
    }

    pub fn delete_gate(&self, id: u64) -> Result<bool, StoreError> {
        self.mutate(|tables| {
            let before = tables.gates.len();
            tables.gates.retain(|g| g.id != id);
            let removed = tables.gates.len() != before;
            (removed, removed)
        })
    }

    // ---- events ----

    pub fn events(&self) -> Vec<Stored<CrossingEvent>> {
        self.tables.lock().events.clone()
    }

    pub fn insert_event(&self, event: CrossingEvent) -> Result<Insert, StoreError> {
        self.mutate(|tables| {
            if let Some(existing) = tables.events.iter().find(|e| e.item == event) {
                return (Insert::Duplicate(existing.id), false);
            }
            let id = take_id(&mut tables.next_event_id);
            tables.events.push(Stored { id, item: event });
            (Insert::Inserted(id), true)
        })
    }

    /// Insert every event not already stored; one write for the batch
    pub fn insert_events(&self, events: Vec<CrossingEvent>) -> Result<usize, StoreError> {
        self.mutate(|tables| {
            let mut inserted = 0;
            for event in events {
                if tables.events.iter().any(|e| e.item == event) {
                    continue;
                }
                let id = take_id(&mut tables.next_event_id);
                tables.events.push(Stored { id, item: event });
                inserted += 1;
            }
            (inserted, inserted > 0)
        })
    }

    pub fn update_event(&self, id: u64, event: CrossingEvent) -> Result<bool, StoreError> {
        self.mutate(|tables| match tables.events.iter_mut().find(|e| e.id == id) {
            Some(row) => {
                row.item = event;
                (true, true)
            }
            None => (false, false),
        })
    }

    pub fn delete_event(&self, id: u64) -> Result<bool, StoreError> {
        self.mutate(|tables| {
            let before = tables.events.len();
            tables.events.retain(|e| e.id != id);
            let removed = tables.events.len() != before;
            (removed, removed)
        })
    }

    /// Cloned gates and records, so correlation runs without holding the lock
    pub fn correlation_input(&self) -> (Vec<GateDefinition>, Vec<DeliveryRecord>) {
        let tables = self.tables.lock();
        let records = tables.records.iter().map(|r| r.item.clone()).collect();
        (tables.gates.clone(), records)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
