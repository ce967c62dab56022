use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    /// Our marker file disappeared. Another instance may be starting up;
    /// exit rather than fight over the database.
    #[error("liveness marker at {0} is gone")]
    Missing(String),
    /// Someone else's pid is in our marker file. That process now owns the
    /// node; continuing would mean two keepers driving one database.
    #[error("liveness marker at {path} is owned by pid {found}, not us ({own})")]
    Stolen { path: String, found: u32, own: u32 },
    #[error("liveness marker at {path} unreadable: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// A pid file claiming exclusive ownership of this node. Checked every loop
/// tick; any violation is fatal to the whole process, never retried.
pub struct LivenessMarker {
    path: PathBuf,
    own_pid: u32,
}

impl LivenessMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LivenessMarker {
            path: path.into(),
            own_pid: std::process::id(),
        }
    }

    #[cfg(test)]
    fn with_pid(path: impl Into<PathBuf>, own_pid: u32) -> Self {
        LivenessMarker {
            path: path.into(),
            own_pid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self) -> Result<(), LivenessError> {
        std::fs::write(&self.path, format!("{}\n", self.own_pid)).map_err(|e| {
            LivenessError::Unreadable {
                path: self.path.display().to_string(),
                source: e,
            }
        })
    }

    /// Verify the marker still names this process.
    pub fn check(&self) -> Result<(), LivenessError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LivenessError::Missing(self.path.display().to_string()))
            }
            Err(e) => {
                return Err(LivenessError::Unreadable {
                    path: self.path.display().to_string(),
                    source: e,
                })
            }
        };

        match contents.trim().parse::<u32>() {
            Ok(pid) if pid == self.own_pid => Ok(()),
            Ok(pid) => Err(LivenessError::Stolen {
                path: self.path.display().to_string(),
                found: pid,
                own: self.own_pid,
            }),
            Err(_) => Err(LivenessError::Unreadable {
                path: self.path.display().to_string(),
                source: io::Error::new(io::ErrorKind::InvalidData, "not a pid"),
            }),
        }
    }

    pub fn remove(&self) {
        // On shutdown only; a failure here leaves a stale file the next
        // startup will overwrite.
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_check_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let marker = LivenessMarker::new(dir.path().join("pid"));
        marker.create().unwrap();
        marker.check().unwrap();
    }

    #[test]
    fn missing_marker_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let marker = LivenessMarker::new(dir.path().join("pid"));
        assert!(matches!(marker.check(), Err(LivenessError::Missing(_))));
    }

    #[test]
    fn foreign_pid_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");

        let ours = LivenessMarker::with_pid(&path, 100);
        ours.create().unwrap();

        let intruder = LivenessMarker::with_pid(&path, 200);
        intruder.create().unwrap();

        assert!(matches!(
            ours.check(),
            Err(LivenessError::Stolen {
                found: 200,
                own: 100,
                ..
            })
        ));
    }
}
