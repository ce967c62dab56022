use crate::fsm::NodeState;
use crate::state_store::{atomic_replace, io_error, StateStoreError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

pub const STATE_FORMAT_VERSION: u32 = 1;

/// The node's durable record: who we are, what role we hold, what role the
/// monitor last assigned, and the contact timestamps feeding partition
/// detection. Exactly one of these exists per node; the reconciliation loop
/// is its only writer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeeperState {
    pub version: u32,
    pub current_role: NodeState,
    pub assigned_role: NodeState,
    pub node_id: i64,
    pub group_id: i32,
    /// Monotonic counter bumped by the monitor whenever group membership
    /// changes; lets us notice stale peer lists.
    pub nodes_version: u64,
    /// Unix seconds of the last successful monitor exchange; 0 means never.
    pub last_monitor_contact: i64,
    /// Unix seconds of the last time a standby was seen connected to us;
    /// 0 means never. Only maintained while we act as a primary.
    pub last_secondary_contact: i64,
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
}

impl KeeperState {
    pub fn new(current_role: NodeState, node_id: i64, group_id: i32) -> Self {
        KeeperState {
            version: STATE_FORMAT_VERSION,
            current_role,
            assigned_role: current_role,
            node_id,
            group_id,
            nodes_version: 0,
            last_monitor_contact: 0,
            last_secondary_contact: 0,
            system_identifier: 0,
            pg_control_version: 0,
            catalog_version_no: 0,
        }
    }
}

/// On-disk home of the KeeperState record. Writes go through the atomic
/// replace path so a crash mid-write never leaves a torn file.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<KeeperState, StateStoreError> {
        let contents = std::fs::read(&self.path).map_err(|e| io_error(&self.path, e))?;
        let state: KeeperState =
            serde_json::from_slice(&contents).map_err(|e| StateStoreError::Corrupt {
                path: self.path.display().to_string(),
                source: e,
            })?;

        if state.version != STATE_FORMAT_VERSION {
            return Err(StateStoreError::VersionMismatch {
                path: self.path.display().to_string(),
                found: state.version,
                expected: STATE_FORMAT_VERSION,
            });
        }

        Ok(state)
    }

    pub fn save(&self, state: &KeeperState) -> Result<(), StateStoreError> {
        let contents = serde_json::to_vec_pretty(state).map_err(|e| {
            // Serializing a plain struct only fails on an I/O-less writer
            // bug; map it through the same error type for the caller.
            io_error(&self.path, io::Error::new(io::ErrorKind::Other, e))
        })?;
        atomic_replace(&self.path, &contents).map_err(|e| io_error(&self.path, e))
    }

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

    fn sample_state() -> KeeperState {
        let mut state = KeeperState::new(NodeState::Primary, 4, 0);
        state.assigned_role = NodeState::Draining;
        state.last_monitor_contact = 1_700_000_000;
        state.last_secondary_contact = 1_700_000_005;
        state.system_identifier = 7_078_433_244_784_152_647;
        state
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        store.save(&sample_state()).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.current_role, NodeState::Primary);
        assert_eq!(loaded.assigned_role, NodeState::Draining);
        assert_eq!(loaded.system_identifier, 7_078_433_244_784_152_647);
        assert_eq!(loaded.last_secondary_contact, 1_700_000_005);
    }

    #[test]
    fn save_replaces_atomically_leaving_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStateStore::new(&path);

        store.save(&sample_state()).unwrap();
        let mut second = sample_state();
        second.current_role = NodeState::Draining;
        store.save(&second).unwrap();

        assert!(!path.with_extension("new").exists());
        assert_eq!(store.load().unwrap().current_role, NodeState::Draining);
    }

    #[test]
    fn interrupted_write_keeps_previous_state_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStateStore::new(&path);
        store.save(&sample_state()).unwrap();

        // A crash between temp-write and rename leaves a stray .new file;
        // the state file proper must still read back the old contents.
        std::fs::write(path.with_extension("new"), b"{ torn").unwrap();
        assert_eq!(store.load().unwrap().current_role, NodeState::Primary);
    }

    #[test]
    fn corrupt_state_file_is_an_error_not_a_guess() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json at all").unwrap();

        let store = FileStateStore::new(&path);
        assert!(matches!(
            store.load(),
            Err(StateStoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStateStore::new(&path);

        let mut state = sample_state();
        state.version = 99;
        // Bypass save() so the bad version actually lands on disk.
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        assert!(matches!(
            store.load(),
            Err(StateStoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
