//! In-memory implementations of the capability seams, used by unit and
//! integration tests to script whole failover scenarios without a real
//! database or monitor.

mod monitor;
mod postgres;

pub use monitor::FakeMonitor;
pub use postgres::FakePostgres;

use crate::config::{ConfigError, ConfigLoader, KeeperOptions};
use slog::Drain;
use std::sync::Mutex;

pub fn stdout_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Hands out a stored copy of the options on every load, standing in for
/// re-reading a configuration file.
pub struct StaticConfigLoader {
    options: Mutex<KeeperOptions>,
}

impl StaticConfigLoader {
    pub fn new(options: KeeperOptions) -> Self {
        StaticConfigLoader {
            options: Mutex::new(options),
        }
    }

    /// What the next reload will see.
    pub fn replace(&self, options: KeeperOptions) {
        *self.options.lock().unwrap() = options;
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<KeeperOptions, ConfigError> {
        Ok(self.options.lock().unwrap().clone())
    }
}
