use crate::state_store::{atomic_replace, io_error, StateStoreError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// What the companion process supervising the database server should make
/// true. Written by the reconciliation loop, read by the supervisor; the two
/// processes share nothing else.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedPostgresStatus {
    Unknown,
    Stopped,
    Running,
    RunningAsSubprocess,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
struct StatusRecord {
    version: u32,
    expected: ExpectedPostgresStatus,
}

/// One-slot mailbox between the reconciliation loop and the database
/// supervisor process, with the same crash-safe replace semantics as the
/// state file.
pub struct StatusFileBridge {
    path: PathBuf,
}

impl StatusFileBridge {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StatusFileBridge { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, expected: ExpectedPostgresStatus) -> Result<(), StateStoreError> {
        let record = StatusRecord {
            version: 1,
            expected,
        };
        let contents = serde_json::to_vec_pretty(&record)
            .map_err(|e| io_error(&self.path, io::Error::new(io::ErrorKind::Other, e)))?;
        atomic_replace(&self.path, &contents).map_err(|e| io_error(&self.path, e))
    }

    /// A missing file reads as Unknown: the supervisor makes no assumption
    /// until the loop has stated an expectation.
    pub fn read(&self) -> Result<ExpectedPostgresStatus, StateStoreError> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(ExpectedPostgresStatus::Unknown)
            }
            Err(e) => return Err(io_error(&self.path, e)),
        };

        let record: StatusRecord =
            serde_json::from_slice(&contents).map_err(|e| StateStoreError::Corrupt {
                path: self.path.display().to_string(),
                source: e,
            })?;
        Ok(record.expected)
    }

    /// Clearing the bridge hands control of the server back to the operator
    /// (maintenance) or to nobody (drop).
    pub fn clear(&self) -> Result<(), StateStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }
}
