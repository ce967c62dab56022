use std::convert::TryFrom;
use std::path::PathBuf;
use tokio::time::Duration;

/// Replication slots on a primary are named after the standby they retain
/// WAL for, so slot reconciliation is a pure set comparison on node ids.
pub fn replication_slot_name(node_id: i64) -> String {
    format!("keeper_standby_{}", node_id)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    MissingField(&'static str),
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("setting {0} cannot be changed while the service runs")]
    ImmutableFieldChanged(&'static str),
    #[error("failed to read configuration: {0}")]
    Unreadable(String),
}

/// Raw configuration as collected from file/environment/CLI, every field
/// optional. Validation into [KeeperConfig] fills defaults and rejects
/// incomplete setups.
#[derive(Clone, Default)]
pub struct KeeperOptions {
    pub formation: Option<String>,
    pub node_name: Option<String>,
    pub node_host: Option<String>,
    pub node_port: Option<u16>,
    pub data_directory: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub init_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub replication_user: Option<String>,
    pub replication_password: Option<String>,
    pub sleep_interval: Option<Duration>,
    pub network_partition_timeout: Option<Duration>,
    pub restart_failure_max_retries: Option<u32>,
    pub restart_failure_window: Option<Duration>,
    pub candidate_priority: Option<i32>,
    pub replication_quorum: Option<bool>,
}

/// Validated, fully-populated configuration. Paths default to siblings of
/// the data directory so one setting is enough for a standard setup.
#[derive(Clone, Debug)]
pub struct KeeperConfig {
    pub formation: String,
    pub node_name: String,
    pub node_host: String,
    pub node_port: u16,
    pub data_directory: PathBuf,
    pub state_file: PathBuf,
    pub init_file: PathBuf,
    pub status_file: PathBuf,
    pub pid_file: PathBuf,
    pub replication_user: String,
    pub replication_password: Option<String>,
    pub sleep_interval: Duration,
    pub network_partition_timeout: Duration,
    pub restart_failure_max_retries: u32,
    pub restart_failure_window: Duration,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
}

impl KeeperConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.formation.is_empty() {
            return Err(ConfigError::Invalid {
                field: "formation",
                reason: "must not be empty",
            });
        }
        if self.node_port == 0 {
            return Err(ConfigError::Invalid {
                field: "node_port",
                reason: "must be a usable TCP port",
            });
        }
        if self.sleep_interval.as_millis() == 0 {
            return Err(ConfigError::Invalid {
                field: "sleep_interval",
                reason: "must be positive",
            });
        }
        if self.network_partition_timeout < self.sleep_interval {
            return Err(ConfigError::Invalid {
                field: "network_partition_timeout",
                reason: "must be at least the sleep interval",
            });
        }
        Ok(())
    }

    /// Apply a reloaded configuration to the live one. Identity and on-disk
    /// layout are pinned for the life of the process; operational knobs and
    /// connection details merge freely.
    pub fn merge_reloaded(&mut self, reloaded: KeeperConfig) -> Result<(), ConfigError> {
        if reloaded.data_directory != self.data_directory {
            return Err(ConfigError::ImmutableFieldChanged("data_directory"));
        }
        if reloaded.state_file != self.state_file {
            return Err(ConfigError::ImmutableFieldChanged("state_file"));
        }
        if reloaded.formation != self.formation {
            return Err(ConfigError::ImmutableFieldChanged("formation"));
        }
        if reloaded.node_name != self.node_name {
            return Err(ConfigError::ImmutableFieldChanged("node_name"));
        }

        self.node_host = reloaded.node_host;
        self.node_port = reloaded.node_port;
        self.replication_user = reloaded.replication_user;
        self.replication_password = reloaded.replication_password;
        self.sleep_interval = reloaded.sleep_interval;
        self.network_partition_timeout = reloaded.network_partition_timeout;
        self.restart_failure_max_retries = reloaded.restart_failure_max_retries;
        self.restart_failure_window = reloaded.restart_failure_window;
        self.candidate_priority = reloaded.candidate_priority;
        self.replication_quorum = reloaded.replication_quorum;
        self.validate()
    }
}

impl TryFrom<KeeperOptions> for KeeperConfig {
    type Error = ConfigError;

    fn try_from(options: KeeperOptions) -> Result<Self, Self::Error> {
        let data_directory = options
            .data_directory
            .ok_or(ConfigError::MissingField("data_directory"))?;
        let sibling = |name: &str| -> PathBuf {
            let mut file_name = data_directory
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            file_name.push(".");
            file_name.push(name);
            data_directory.with_file_name(file_name)
        };

        let config = KeeperConfig {
            formation: options.formation.unwrap_or_else(|| "default".to_string()),
            node_name: options
                .node_name
                .ok_or(ConfigError::MissingField("node_name"))?,
            node_host: options
                .node_host
                .ok_or(ConfigError::MissingField("node_host"))?,
            node_port: options.node_port.unwrap_or(5432),
            state_file: options.state_file.unwrap_or_else(|| sibling("state.json")),
            init_file: options.init_file.unwrap_or_else(|| sibling("init.json")),
            status_file: options
                .status_file
                .unwrap_or_else(|| sibling("status.json")),
            pid_file: options.pid_file.unwrap_or_else(|| sibling("pid")),
            data_directory,
            replication_user: options
                .replication_user
                .unwrap_or_else(|| "replicator".to_string()),
            replication_password: options.replication_password,
            sleep_interval: options.sleep_interval.unwrap_or(Duration::from_secs(5)),
            network_partition_timeout: options
                .network_partition_timeout
                .unwrap_or(Duration::from_secs(20)),
            restart_failure_max_retries: options.restart_failure_max_retries.unwrap_or(3),
            restart_failure_window: options
                .restart_failure_window
                .unwrap_or(Duration::from_secs(20)),
            candidate_priority: options.candidate_priority.unwrap_or(100),
            replication_quorum: options.replication_quorum.unwrap_or(true),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Where reloaded configuration comes from; the loop re-reads through this
/// seam when a reload is requested, keeping file formats out of the core.
pub trait ConfigLoader: Send + Sync {
    fn load(&self) -> Result<KeeperOptions, ConfigError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_options() -> KeeperOptions {
        KeeperOptions {
            node_name: Some("node_a".to_string()),
            node_host: Some("10.0.0.1".to_string()),
            data_directory: Some(PathBuf::from("/var/lib/db/data")),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_in_around_required_fields() {
        let config = KeeperConfig::try_from(minimal_options()).unwrap();
        assert_eq!(config.formation, "default");
        assert_eq!(config.node_port, 5432);
        assert_eq!(config.sleep_interval, Duration::from_secs(5));
        assert_eq!(config.network_partition_timeout, Duration::from_secs(20));
        assert_eq!(config.restart_failure_max_retries, 3);
        assert_eq!(config.state_file, PathBuf::from("/var/lib/db/data.state.json"));
    }

    #[test]
    fn missing_data_directory_is_rejected() {
        let mut options = minimal_options();
        options.data_directory = None;
        assert!(matches!(
            KeeperConfig::try_from(options),
            Err(ConfigError::MissingField("data_directory"))
        ));
    }

    #[test]
    fn partition_timeout_must_cover_a_tick() {
        let mut options = minimal_options();
        options.sleep_interval = Some(Duration::from_secs(30));
        options.network_partition_timeout = Some(Duration::from_secs(10));
        assert!(KeeperConfig::try_from(options).is_err());
    }

    #[test]
    fn reload_merges_mutable_and_pins_immutable() {
        let mut live = KeeperConfig::try_from(minimal_options()).unwrap();

        let mut reloaded_options = minimal_options();
        reloaded_options.node_host = Some("10.0.0.9".to_string());
        reloaded_options.network_partition_timeout = Some(Duration::from_secs(60));
        let reloaded = KeeperConfig::try_from(reloaded_options).unwrap();
        live.merge_reloaded(reloaded).unwrap();
        assert_eq!(live.node_host, "10.0.0.9");
        assert_eq!(live.network_partition_timeout, Duration::from_secs(60));

        let mut moved_options = minimal_options();
        moved_options.data_directory = Some(PathBuf::from("/somewhere/else"));
        let moved = KeeperConfig::try_from(moved_options).unwrap();
        assert!(matches!(
            live.merge_reloaded(moved),
            Err(ConfigError::ImmutableFieldChanged("data_directory"))
        ));
    }

    #[test]
    fn slot_names_are_deterministic_per_node_id() {
        assert_eq!(replication_slot_name(7), "keeper_standby_7");
        assert_eq!(replication_slot_name(12), "keeper_standby_12");
    }
}
