//! Session table persistence
//!
//! The table is written as one JSON document. Writes go to a sibling temp
//! file which is then renamed over the target, so a crash mid-write leaves
//! the previous snapshot intact.

use crate::services::sessions::{SessionSnapshot, SessionTable};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("snapshot is not valid json: {0}")]
    Format(#[from] serde_json::Error),
}

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> PersistError {
        PersistError::Io { path: self.path.display().to_string(), source }
    }

    /// Read the stored table; a missing file is an empty table
    pub fn try_load(&self) -> Result<SessionTable, PersistError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SessionTable::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        if content.trim().is_empty() {
            return Ok(SessionTable::new());
        }
        let snapshot: SessionSnapshot = serde_json::from_str(&content)?;
        Ok(SessionTable::from_snapshot(snapshot))
    }

    /// Load, falling back to an empty table on any error
    pub fn load(&self) -> SessionTable {
        match self.try_load() {
            Ok(table) => {
                info!(
                    path = %self.path.display(),
                    sessions = %table.len(),
                    "snapshot_loaded"
                );
                table
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot_load_failed");
                SessionTable::new()
            }
        }
    }

    pub fn save(&self, table: &SessionTable) -> Result<(), PersistError> {
        let json = serde_json::to_vec_pretty(&table.snapshot())?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, &json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), bytes = %json.len(), "snapshot_written");
        Ok(())
    }
}
