use crate::lsn::Lsn;

/// One standby currently streaming from us, as seen in the primary's
/// replication views.
#[derive(Clone, Debug)]
pub struct StandbyConnection {
    pub application_name: String,
    pub sync_state: String,
    pub reported_lsn: Lsn,
}

/// Snapshot of the local server's replication situation, taken once per
/// loop tick and never cached across ticks.
#[derive(Clone, Debug, Default)]
pub struct ReplicationStatus {
    pub current_lsn: Lsn,
    /// Our own sync standing as reported by the upstream ("sync", "async",
    /// "quorum"), empty when not applicable.
    pub sync_state: String,
    pub is_in_recovery: bool,
    /// Standbys connected to us; only populated while running as a primary.
    pub connected_standbys: Vec<StandbyConnection>,
}

impl ReplicationStatus {
    pub fn has_connected_standby(&self) -> bool {
        !self.connected_standbys.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("sql failure: {0}")]
pub struct SqlError(pub String);

/// Query-level access to the local database. Implementations own connection
/// management; transition code expresses intent ("make sure this slot
/// exists") and implementations make the matching statements.
#[async_trait::async_trait]
pub trait SqlClient: Send + Sync {
    async fn is_in_recovery(&self) -> Result<bool, SqlError>;

    async fn replication_status(&self) -> Result<ReplicationStatus, SqlError>;

    /// Create the slot if missing. An already-existing slot is success.
    async fn ensure_replication_slot(&self, slot_name: &str) -> Result<(), SqlError>;
    /// Drop the slot if present. An already-absent slot is success.
    async fn drop_replication_slot(&self, slot_name: &str) -> Result<(), SqlError>;
    async fn list_replication_slots(&self) -> Result<Vec<String>, SqlError>;

    async fn set_synchronous_standby_names(&self, expression: &str) -> Result<(), SqlError>;
    async fn disable_synchronous_replication(&self) -> Result<(), SqlError>;

    /// Toggle default_transaction_read_only, the write-blocking switch used
    /// during promotion.
    async fn set_default_transaction_read_only(&self, read_only: bool) -> Result<(), SqlError>;

    /// Create the replication role if missing.
    async fn ensure_replication_user(&self, username: &str) -> Result<(), SqlError>;

    /// Make sure `host` is allowed to open replication connections to us.
    /// An already-present access rule is success.
    async fn ensure_replication_access(&self, host: &str) -> Result<(), SqlError>;

    /// Create the target database and its required extensions, when absent.
    async fn ensure_database_and_extensions(&self) -> Result<(), SqlError>;

    /// Apply the always-required settings (wal_level and friends) to a
    /// cluster we created ourselves.
    async fn apply_baseline_settings(&self) -> Result<(), SqlError>;

    /// For a cluster we did not create: confirm the required settings are
    /// already present, failing with the missing setting's name rather than
    /// editing someone else's configuration.
    async fn verify_baseline_settings(&self) -> Result<(), SqlError>;
}
