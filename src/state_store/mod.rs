mod init_marker;
mod status_file;
mod store;

pub use init_marker::{InitMarker, InitMarkerFile, InitStage};
pub use status_file::{ExpectedPostgresStatus, StatusFileBridge};
pub use store::{FileStateStore, KeeperState, STATE_FORMAT_VERSION};

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("state file i/o failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("state file at {path} is not readable: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("state file at {path} has format version {found}, expected {expected}")]
    VersionMismatch {
        path: String,
        found: u32,
        expected: u32,
    },
}

/// Replace the file at `path` atomically: write the whole content to a
/// sibling temp path, fsync it, then rename over the target. A crash at any
/// point leaves either the old file or the new one, never a torn mix.
pub(crate) fn atomic_replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("new");

    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)
}

pub(crate) fn io_error(path: &Path, source: io::Error) -> StateStoreError {
    StateStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
