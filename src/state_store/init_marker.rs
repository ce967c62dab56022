use crate::state_store::{atomic_replace, io_error, StateStoreError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// What we found (or made of) the data directory when initialization began.
/// Recorded before the first monitor contact so a crash mid-initialization
/// can resume instead of guessing.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStage {
    /// No data directory existed; we are creating the cluster ourselves.
    Empty,
    /// A data directory existed already and we did not create it.
    Exists,
    /// The pre-existing cluster was found running.
    Running,
    /// The pre-existing cluster was found running as a primary.
    Primary,
}

impl InitStage {
    /// Stages at `Running` or later describe a live server; on resume they
    /// must be re-discovered since the operator may have stopped it.
    pub fn is_running_stage(&self) -> bool {
        matches!(self, InitStage::Running | InitStage::Primary)
    }

    /// Whether the data directory is ours to manage and (re)configure, as
    /// opposed to a pre-existing installation we only verify.
    pub fn instance_is_ours(&self) -> bool {
        matches!(self, InitStage::Empty | InitStage::Exists)
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct InitMarker {
    pub version: u32,
    pub stage: InitStage,
}

impl InitMarker {
    pub fn new(stage: InitStage) -> Self {
        InitMarker { version: 1, stage }
    }
}

/// The marker lives next to the state file and only exists while an
/// initialization is incomplete; its presence at startup routes the process
/// into the resume path.
pub struct InitMarkerFile {
    path: PathBuf,
}

impl InitMarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        InitMarkerFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<InitMarker, StateStoreError> {
        let contents = std::fs::read(&self.path).map_err(|e| io_error(&self.path, e))?;
        serde_json::from_slice(&contents).map_err(|e| StateStoreError::Corrupt {
            path: self.path.display().to_string(),
            source: e,
        })
    }

    pub fn save(&self, marker: &InitMarker) -> Result<(), StateStoreError> {
        let contents = serde_json::to_vec_pretty(marker)
            .map_err(|e| io_error(&self.path, io::Error::new(io::ErrorKind::Other, e)))?;
        atomic_replace(&self.path, &contents).map_err(|e| io_error(&self.path, e))
    }

    /// Removing an already-absent marker is success; initialization
    /// completion and node drop both call this unconditionally.
    pub fn remove(&self) -> Result<(), StateStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let marker_file = InitMarkerFile::new(dir.path().join("init.json"));
        assert!(!marker_file.exists());

        marker_file.save(&InitMarker::new(InitStage::Empty)).unwrap();
        assert!(marker_file.exists());
        assert_eq!(marker_file.load().unwrap().stage, InitStage::Empty);

        marker_file.remove().unwrap();
        assert!(!marker_file.exists());
        // Idempotent removal.
        marker_file.remove().unwrap();
    }

    #[test]
    fn stage_predicates() {
        assert!(InitStage::Running.is_running_stage());
        assert!(InitStage::Primary.is_running_stage());
        assert!(!InitStage::Empty.is_running_stage());

        assert!(InitStage::Empty.instance_is_ours());
        assert!(InitStage::Exists.instance_is_ours());
        assert!(!InitStage::Primary.instance_is_ours());
    }
}
