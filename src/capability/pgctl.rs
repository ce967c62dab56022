use crate::lsn::Lsn;

/// Connection coordinates of the node we replicate from. For a standby this
/// is the primary; during fast-forward it is the most advanced standby.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamNode {
    pub host: String,
    pub port: u16,
    /// Replication slot reserved for us on the upstream, when one exists.
    pub slot_name: Option<String>,
}

/// Cluster-level facts read from the local installation's control data.
/// Compared against the persisted expectations every probe; a mismatch means
/// we might be pointed at the wrong cluster.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DatabaseMetadata {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub timeline_id: u32,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("database control failure: {0}")]
pub struct DatabaseControlError(pub String);

/// Process-level control of the local database server. Implementations wrap
/// the server's own binaries (initdb, pg_ctl, pg_rewind, pg_basebackup,
/// pg_receivewal); transition code only sees this seam.
///
/// All operations are expected to be idempotent at the observable level:
/// starting a running server or stopping a stopped one is success.
#[async_trait::async_trait]
pub trait DatabaseControl: Send + Sync {
    /// Create a brand-new cluster in the data directory.
    async fn initialize(&self) -> Result<(), DatabaseControlError>;

    fn data_directory_exists(&self) -> bool;

    async fn ensure_running(&self) -> Result<(), DatabaseControlError>;
    async fn ensure_stopped(&self) -> Result<(), DatabaseControlError>;
    async fn restart(&self) -> Result<(), DatabaseControlError>;

    async fn is_running(&self) -> bool;

    /// Promote a server currently running in recovery, polling until the
    /// promotion has completed. Promoting a server that is already out of
    /// recovery is a no-op.
    async fn promote(&self) -> Result<(), DatabaseControlError>;

    /// Incremental resync of our data directory against `upstream`. Fails
    /// when the WAL needed for the rewind is gone; callers fall back to
    /// `base_backup`.
    async fn rewind(&self, upstream: &UpstreamNode) -> Result<(), DatabaseControlError>;

    /// Full re-seed of the data directory from `upstream`, replacing
    /// whatever is there.
    async fn base_backup(&self, upstream: &UpstreamNode) -> Result<(), DatabaseControlError>;

    async fn checkpoint(&self) -> Result<(), DatabaseControlError>;

    /// Verify replication connectivity to `upstream` (IDENTIFY_SYSTEM) and
    /// return the upstream cluster's metadata.
    async fn identify_system(
        &self,
        upstream: &UpstreamNode,
    ) -> Result<DatabaseMetadata, DatabaseControlError>;

    /// Read the local cluster's control data. Works whether or not the
    /// server is running.
    async fn metadata(&self) -> Result<DatabaseMetadata, DatabaseControlError>;

    /// Rewrite the standby replication settings. `Some(upstream)` makes the
    /// server follow that node; `None` leaves the server in standby mode
    /// with no upstream, so its replay position freezes where it is.
    async fn setup_standby_mode(
        &self,
        upstream: Option<&UpstreamNode>,
    ) -> Result<(), DatabaseControlError>;

    /// Remove standby-mode settings after a promotion, so the server runs
    /// as a plain primary from the next start onward.
    async fn cleanup_standby_mode(&self) -> Result<(), DatabaseControlError>;

    /// Fetch WAL from `upstream` up to `target`, replaying it locally.
    /// Used to fast-forward a failover candidate that is missing bytes some
    /// other standby already has.
    async fn fetch_wal(
        &self,
        upstream: &UpstreamNode,
        target: Lsn,
    ) -> Result<(), DatabaseControlError>;
}
