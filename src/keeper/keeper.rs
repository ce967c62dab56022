use crate::capability::{
    AssignedState, DatabaseControl, MonitorClient, MonitorError, NodeActiveReport, PeerNode,
    ReplicationStatus, SqlClient,
};
use crate::config::{replication_slot_name, ConfigError, ConfigLoader, KeeperConfig};
use crate::fsm::{NodeState, TransitionError};
use crate::liveness::{LivenessError, LivenessMarker};
use crate::lsn::Lsn;
use crate::signals::Signals;
use crate::state_store::{
    ExpectedPostgresStatus, FileStateStore, InitMarkerFile, KeeperState, StateStoreError,
    StatusFileBridge,
};
use std::convert::TryFrom;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    #[error(transparent)]
    Store(#[from] StateStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    /// The database we probed is not the one our state file describes.
    /// Managing the wrong cluster is worse than doing nothing, so the tick
    /// aborts without progress.
    #[error("local database mismatch: {0}")]
    LocalDatabaseMismatch(String),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl KeeperError {
    /// Only a liveness violation kills the process outright; everything
    /// else fails the current tick and is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KeeperError::Liveness(_))
    }
}

/// Per-tick view of the local database, recomputed by every probe and never
/// carried across ticks.
#[derive(Clone, Debug, Default)]
pub struct PgLocalState {
    pub is_running: bool,
    pub status: ReplicationStatus,
}

/// Restart-failure accounting behind the primary's "keep claiming we are
/// running" grace budget.
#[derive(Debug, Default)]
pub(crate) struct RestartTracker {
    first_failure_at: Option<i64>,
    retries: u32,
}

impl RestartTracker {
    pub(crate) fn record_success(&mut self) {
        *self = RestartTracker::default();
    }

    pub(crate) fn record_failure(&mut self, now: i64) {
        self.retries += 1;
        self.first_failure_at.get_or_insert(now);
    }

    pub(crate) fn budget_exhausted(&self, max_retries: u32, window_secs: i64, now: i64) -> bool {
        match self.first_failure_at {
            None => false,
            Some(first) => self.retries >= max_retries || now - first > window_secs,
        }
    }
}

/// The per-node agent: every capability seam, the durable state record, and
/// the ephemeral probe results, in one place. Transition steps and the
/// reconciliation loop are all methods of this type.
pub struct Keeper {
    pub(crate) logger: slog::Logger,
    pub config: KeeperConfig,
    pub state: KeeperState,
    pub local: PgLocalState,
    pub(crate) pg_ctl: Arc<dyn DatabaseControl>,
    pub(crate) sql: Arc<dyn SqlClient>,
    pub(crate) monitor: Arc<dyn MonitorClient>,
    pub(crate) config_loader: Arc<dyn ConfigLoader>,
    pub(crate) store: FileStateStore,
    pub(crate) init_marker: InitMarkerFile,
    pub(crate) status_bridge: StatusFileBridge,
    pub(crate) liveness: LivenessMarker,
    pub(crate) signals: Signals,
    pub(crate) restart_tracker: RestartTracker,
    /// Peers as last reported by the monitor; refreshed after each
    /// successful node-active exchange.
    pub(crate) peers: Vec<PeerNode>,
}

impl Keeper {
    /// Build a keeper from configuration and capability implementations.
    /// When a state file exists it is the source of truth; otherwise the
    /// node starts unregistered in `Init` and must go through
    /// [Keeper::initialize].
    pub fn new(
        logger: slog::Logger,
        config: KeeperConfig,
        pg_ctl: Arc<dyn DatabaseControl>,
        sql: Arc<dyn SqlClient>,
        monitor: Arc<dyn MonitorClient>,
        config_loader: Arc<dyn ConfigLoader>,
        signals: Signals,
    ) -> Result<Self, KeeperError> {
        let store = FileStateStore::new(&config.state_file);
        let init_marker = InitMarkerFile::new(&config.init_file);
        let status_bridge = StatusFileBridge::new(&config.status_file);
        let liveness = LivenessMarker::new(&config.pid_file);

        let state = if store.exists() {
            store.load()?
        } else {
            KeeperState::new(NodeState::Init, -1, 0)
        };

        let logger = logger.new(slog::o!(
            "node_name" => config.node_name.clone(),
            "formation" => config.formation.clone(),
        ));

        Ok(Keeper {
            logger,
            config,
            state,
            local: PgLocalState::default(),
            pg_ctl,
            sql,
            monitor,
            config_loader,
            store,
            init_marker,
            status_bridge,
            liveness,
            signals,
            restart_tracker: RestartTracker::default(),
            peers: Vec::new(),
        })
    }

    pub fn signals(&self) -> Signals {
        self.signals.clone()
    }

    pub fn peers(&self) -> &[PeerNode] {
        &self.peers
    }

    /// Probe the local database and refresh the ephemeral view. Probing
    /// failures degrade to "not running"; a metadata contradiction with the
    /// persisted expectations is an error, since it means we may be looking
    /// at the wrong cluster.
    pub async fn probe_local_database(&mut self) -> Result<(), KeeperError> {
        if self.pg_ctl.data_directory_exists() {
            match self.pg_ctl.metadata().await {
                Ok(metadata) => {
                    if self.state.system_identifier != 0
                        && metadata.system_identifier != self.state.system_identifier
                    {
                        return Err(KeeperError::LocalDatabaseMismatch(format!(
                            "system identifier {} does not match expected {}",
                            metadata.system_identifier, self.state.system_identifier
                        )));
                    }
                    if metadata.port != 0 && metadata.port != self.config.node_port {
                        return Err(KeeperError::LocalDatabaseMismatch(format!(
                            "database listens on port {}, expected {}",
                            metadata.port, self.config.node_port
                        )));
                    }
                    self.state.system_identifier = metadata.system_identifier;
                    self.state.pg_control_version = metadata.pg_control_version;
                    self.state.catalog_version_no = metadata.catalog_version_no;
                }
                Err(e) => {
                    slog::warn!(self.logger, "Could not read local cluster metadata";
                        "error" => %e);
                }
            }
        }

        self.local.is_running = self.pg_ctl.is_running().await;
        self.local.status = if self.local.is_running {
            match self.sql.replication_status().await {
                Ok(status) => status,
                Err(e) => {
                    slog::warn!(self.logger, "Could not query replication status";
                        "error" => %e);
                    ReplicationStatus::default()
                }
            }
        } else {
            ReplicationStatus::default()
        };

        Ok(())
    }

    /// What to tell the monitor about the database being up. A primary that
    /// keeps failing to restart stops claiming "running" once its retry
    /// budget is spent, so the monitor can fail over instead of waiting on
    /// a server that will not come back.
    pub fn report_pg_is_running(&self, now: i64) -> bool {
        if self.state.current_role != NodeState::Primary {
            return self.local.is_running;
        }
        if self.local.is_running {
            return true;
        }
        !self.restart_tracker.budget_exhausted(
            self.config.restart_failure_max_retries,
            self.config.restart_failure_window.as_secs() as i64,
            now,
        )
    }

    pub(crate) async fn ensure_postgres_running(&mut self) -> Result<(), TransitionError> {
        self.status_bridge.write(ExpectedPostgresStatus::Running)?;
        self.pg_ctl.ensure_running().await?;
        self.local.is_running = true;
        Ok(())
    }

    /// Like [Self::ensure_postgres_running] but feeding the restart-failure
    /// budget; used while holding a primary-side role.
    pub(crate) async fn ensure_postgres_running_tracked(
        &mut self,
        now: i64,
    ) -> Result<(), TransitionError> {
        self.status_bridge.write(ExpectedPostgresStatus::Running)?;
        match self.pg_ctl.ensure_running().await {
            Ok(()) => {
                self.restart_tracker.record_success();
                self.local.is_running = true;
                Ok(())
            }
            Err(e) => {
                self.restart_tracker.record_failure(now);
                Err(e.into())
            }
        }
    }

    pub(crate) async fn ensure_postgres_stopped(&mut self) -> Result<(), TransitionError> {
        self.status_bridge.write(ExpectedPostgresStatus::Stopped)?;
        self.pg_ctl.ensure_stopped().await?;
        self.local.is_running = false;
        Ok(())
    }

    pub(crate) async fn refresh_peers(&mut self) -> Result<(), MonitorError> {
        self.peers = self
            .monitor
            .get_peer_nodes(&self.config.formation, self.state.group_id)
            .await?;
        Ok(())
    }

    /// Make sure every cached peer has an access rule and a replication
    /// slot here, and drop slots of peers the monitor no longer knows.
    pub(crate) async fn reconcile_replication_slots(&self) -> Result<(), TransitionError> {
        for peer in &self.peers {
            self.sql.ensure_replication_access(&peer.host).await?;
            self.sql
                .ensure_replication_slot(&replication_slot_name(peer.node_id))
                .await?;
        }

        let wanted: Vec<String> = self
            .peers
            .iter()
            .map(|p| replication_slot_name(p.node_id))
            .collect();
        for slot in self.sql.list_replication_slots().await? {
            if slot.starts_with("keeper_standby_") && !wanted.contains(&slot) {
                self.sql.drop_replication_slot(&slot).await?;
            }
        }
        Ok(())
    }

    /// Create missing slots only, without dropping anything. Standbys keep
    /// slots for their fellow standbys so a failover candidate retains WAL.
    pub(crate) async fn maintain_replication_slots(&self) -> Result<(), TransitionError> {
        for peer in &self.peers {
            self.sql
                .ensure_replication_slot(&replication_slot_name(peer.node_id))
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn drop_all_replication_slots(&self) -> Result<(), TransitionError> {
        for slot in self.sql.list_replication_slots().await? {
            if slot.starts_with("keeper_standby_") {
                self.sql.drop_replication_slot(&slot).await?;
            }
        }
        Ok(())
    }

    pub(crate) fn node_active_report(&self, pg_is_running: bool) -> NodeActiveReport {
        NodeActiveReport {
            formation: self.config.formation.clone(),
            node_name: self.config.node_name.clone(),
            node_host: self.config.node_host.clone(),
            node_port: self.config.node_port,
            node_id: self.state.node_id,
            group_id: self.state.group_id,
            current_role: self.state.current_role,
            pg_is_running,
            current_lsn: if pg_is_running {
                self.local.status.current_lsn
            } else {
                Lsn::zero()
            },
            sync_state: self.local.status.sync_state.clone(),
        }
    }

    /// The monitor can re-home a node (new node id or group); adopt the new
    /// identity so slot names and future reports match its bookkeeping.
    pub(crate) fn apply_assigned_identity(&mut self, assigned: &AssignedState) {
        if assigned.node_id != self.state.node_id || assigned.group_id != self.state.group_id {
            slog::info!(self.logger, "Monitor changed our identity";
                "old_node_id" => self.state.node_id,
                "new_node_id" => assigned.node_id,
                "old_group_id" => self.state.group_id,
                "new_group_id" => assigned.group_id,
            );
            self.state.node_id = assigned.node_id;
            self.state.group_id = assigned.group_id;
        }
    }

    /// Make local reality match the role we already hold, independent of
    /// any pending transition: a node that rebooted while `demoted` must
    /// not leave its database running.
    pub(crate) async fn ensure_current_state(&mut self, now: i64) -> Result<(), TransitionError> {
        match self.state.current_role {
            NodeState::Single
            | NodeState::Primary
            | NodeState::WaitPrimary
            | NodeState::JoinPrimary
            | NodeState::ApplySettings => {
                self.ensure_postgres_running_tracked(now).await?;
                self.reconcile_replication_slots().await
            }
            NodeState::PrepPromotion | NodeState::StopReplication => {
                self.ensure_postgres_running().await
            }
            NodeState::Secondary | NodeState::ReportLsn => {
                self.ensure_postgres_running().await?;
                self.maintain_replication_slots().await
            }
            NodeState::Catchingup => self.ensure_postgres_running().await,
            NodeState::Demoted | NodeState::DemoteTimeout | NodeState::Draining => {
                self.ensure_postgres_stopped().await
            }
            _ => Ok(()),
        }
    }

    /// Some edges must not be preceded by an ensure pass: never restart a
    /// server we are about to stop (or the reverse), and leave a secondary
    /// alone when it is being promoted.
    pub(crate) fn should_ensure_current_state_before_transition(
        current: NodeState,
        assigned: NodeState,
    ) -> bool {
        let demotion_states = [
            NodeState::Draining,
            NodeState::DemoteTimeout,
            NodeState::Demoted,
        ];
        if demotion_states.contains(&assigned) || demotion_states.contains(&current) {
            return false;
        }
        if current == NodeState::Secondary && assigned != NodeState::Secondary {
            return false;
        }
        true
    }

    /// Re-read configuration through the loader and merge it into the live
    /// config. A bad reload keeps the previous configuration.
    pub(crate) fn reload_configuration(&mut self) {
        let options = match self.config_loader.load() {
            Ok(options) => options,
            Err(e) => {
                slog::warn!(self.logger, "Configuration reload failed, keeping previous";
                    "error" => %e);
                return;
            }
        };
        let reloaded = match KeeperConfig::try_from(options) {
            Ok(config) => config,
            Err(e) => {
                slog::warn!(self.logger, "Reloaded configuration is invalid, keeping previous";
                    "error" => %e);
                return;
            }
        };
        match self.config.merge_reloaded(reloaded) {
            Ok(()) => slog::info!(self.logger, "Configuration reloaded"),
            Err(e) => {
                slog::warn!(self.logger, "Configuration reload rejected";
                    "error" => %e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_budget_tracks_retries_and_window() {
        let mut tracker = RestartTracker::default();
        assert!(!tracker.budget_exhausted(3, 20, 100));

        tracker.record_failure(100);
        tracker.record_failure(101);
        assert!(!tracker.budget_exhausted(3, 20, 102));

        // The third consecutive failure spends the whole retry budget.
        tracker.record_failure(102);
        assert!(tracker.budget_exhausted(3, 20, 103));

        // Success resets everything.
        tracker.record_success();
        assert!(!tracker.budget_exhausted(3, 20, 200));

        // A single failure still exhausts the budget once the window is
        // over, even without retries.
        tracker.record_failure(200);
        assert!(!tracker.budget_exhausted(3, 20, 210));
        assert!(tracker.budget_exhausted(3, 20, 221));
    }

    #[test]
    fn ensure_skips_around_demotions_and_promotions() {
        assert!(!Keeper::should_ensure_current_state_before_transition(
            NodeState::Primary,
            NodeState::Draining,
        ));
        assert!(!Keeper::should_ensure_current_state_before_transition(
            NodeState::Demoted,
            NodeState::Catchingup,
        ));
        assert!(!Keeper::should_ensure_current_state_before_transition(
            NodeState::Secondary,
            NodeState::PrepPromotion,
        ));
        assert!(Keeper::should_ensure_current_state_before_transition(
            NodeState::Single,
            NodeState::WaitPrimary,
        ));
        assert!(Keeper::should_ensure_current_state_before_transition(
            NodeState::Catchingup,
            NodeState::Secondary,
        ));
    }
}
