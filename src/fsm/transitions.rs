//! The transition step bodies. Every step is idempotent: it checks the
//! observable condition before acting, so a crash mid-step followed by a
//! retry from scratch converges to the same end state.

use crate::capability::{PeerNode, UpstreamNode};
use crate::config::replication_slot_name;
use crate::fsm::engine::TransitionError;
use crate::fsm::table::TransitionStep;
use crate::keeper::Keeper;
use crate::state_store::InitStage;

impl Keeper {
    pub(crate) async fn run_transition_step(
        &mut self,
        step: TransitionStep,
    ) -> Result<(), TransitionError> {
        match step {
            TransitionStep::InitPrimary => self.init_primary().await,
            TransitionStep::InitFromStandby => self.init_from_standby().await,
            TransitionStep::DisableReplication => self.disable_replication().await,
            TransitionStep::ResumeAsPrimary => self.resume_as_primary().await,
            TransitionStep::PrepareReplication => self.prepare_replication().await,
            TransitionStep::DisableSyncRep => self.disable_sync_rep().await,
            TransitionStep::EnableSyncRep => self.enable_sync_rep().await,
            TransitionStep::ApplySettings => self.apply_settings().await,
            TransitionStep::StartPostgres => self.start_postgres().await,
            TransitionStep::StopPostgres => self.ensure_postgres_stopped().await,
            TransitionStep::StopPostgresForPrimaryMaintenance => {
                self.checkpoint_and_stop_postgres().await
            }
            TransitionStep::StopPostgresAndSetupStandby => {
                self.stop_postgres_and_setup_standby().await
            }
            TransitionStep::CheckpointAndStopPostgres => self.checkpoint_and_stop_postgres().await,
            TransitionStep::InitStandby => self.init_standby().await,
            TransitionStep::RewindOrInit => self.rewind_or_init().await,
            TransitionStep::PrepareForSecondary => self.prepare_for_secondary().await,
            TransitionStep::PrepareStandbyForPromotion => {
                self.prepare_standby_for_promotion().await
            }
            TransitionStep::StopReplication => self.stop_replication().await,
            TransitionStep::PromoteStandbyToPrimary => self.promote_standby_to_primary().await,
            TransitionStep::PromoteStandby => self.promote_standby().await,
            TransitionStep::StartMaintenanceOnStandby => self.start_maintenance_on_standby().await,
            TransitionStep::RestartStandby => self.rewind_or_init().await,
            TransitionStep::ReportLsn => self.report_lsn().await,
            TransitionStep::ReportLsnAndDropSlots => self.report_lsn_and_drop_slots().await,
            TransitionStep::FastForward => self.fast_forward().await,
            TransitionStep::CleanupAsPrimary => self.cleanup_as_primary().await,
            TransitionStep::FollowNewPrimary => self.follow_new_primary().await,
            TransitionStep::DropNode => self.drop_node().await,
        }
    }

    /// The primary node of the group, with our reserved slot on it.
    async fn resolve_primary(&self) -> Result<UpstreamNode, TransitionError> {
        let primary = self
            .monitor
            .get_primary(&self.config.formation, self.state.group_id)
            .await?;
        Ok(UpstreamNode {
            host: primary.host,
            port: primary.port,
            slot_name: Some(replication_slot_name(self.state.node_id)),
        })
    }

    async fn resolve_most_advanced_standby(&self) -> Result<PeerNode, TransitionError> {
        Ok(self
            .monitor
            .get_most_advanced_standby(&self.config.formation, self.state.group_id)
            .await?)
    }

    async fn publish_system_identifier(&mut self) -> Result<(), TransitionError> {
        let metadata = self.pg_ctl.metadata().await?;
        self.monitor
            .set_node_system_identifier(self.state.node_id, metadata.system_identifier)
            .await?;
        self.state.system_identifier = metadata.system_identifier;
        self.state.pg_control_version = metadata.pg_control_version;
        self.state.catalog_version_no = metadata.catalog_version_no;
        Ok(())
    }

    /// INIT/DROPPED -> SINGLE. Bring the node up as the group's one and
    /// only primary, whether we start from nothing, from a half-finished
    /// previous attempt, or from a pre-existing installation.
    async fn init_primary(&mut self) -> Result<(), TransitionError> {
        let mut marker = self.init_marker.load().map_err(|e| {
            TransitionError::Init(format!("cannot initialize without an init marker: {}", e))
        })?;

        // The marker may predate an operator stopping the server; running
        // stages are re-discovered, not trusted.
        if marker.stage.is_running_stage() && !self.pg_ctl.is_running().await {
            marker.stage = InitStage::Exists;
        }

        if marker.stage == InitStage::Empty {
            if !self.pg_ctl.data_directory_exists() {
                self.pg_ctl.initialize().await?;
            }
            self.publish_system_identifier().await?;
        }

        self.ensure_postgres_running().await?;

        // A crash after a previous promotion attempt leaves the server in
        // recovery; finish the job before configuring it as a primary.
        if self.sql.is_in_recovery().await? {
            if !marker.stage.instance_is_ours() {
                return Err(TransitionError::Init(
                    "pre-existing database is a standby, refusing to promote it".to_string(),
                ));
            }
            self.pg_ctl.promote().await?;
        }

        if marker.stage.instance_is_ours() {
            self.sql.ensure_database_and_extensions().await?;
            self.sql.apply_baseline_settings().await?;
        } else {
            self.sql.verify_baseline_settings().await?;
        }

        self.sql
            .ensure_replication_user(&self.config.replication_user)
            .await?;

        self.disable_replication().await?;
        self.init_marker.remove()?;
        Ok(())
    }

    /// PRIMARY-side -> SINGLE. The other node is gone for good; run alone.
    async fn disable_replication(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_running().await?;
        self.sql.disable_synchronous_replication().await?;
        self.refresh_peers().await?;
        self.reconcile_replication_slots().await
    }

    /// DEMOTED/DEMOTE_TIMEOUT/DRAINING -> SINGLE. We were being demoted but
    /// the secondary was removed instead; pick writes back up.
    async fn resume_as_primary(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_running().await?;
        self.disable_replication().await
    }

    /// Make room for the standbys the monitor knows about: access rules and
    /// a replication slot per peer. Already-present artifacts are success.
    async fn prepare_replication(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_running().await?;
        self.refresh_peers().await?;
        for peer in self.peers.clone() {
            self.sql.ensure_replication_access(&peer.host).await?;
            self.sql
                .ensure_replication_slot(&replication_slot_name(peer.node_id))
                .await?;
        }
        Ok(())
    }

    /// The secondary went unhealthy; stop requiring its acknowledgement so
    /// writes keep flowing.
    async fn disable_sync_rep(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_running().await?;
        Ok(self.sql.disable_synchronous_replication().await?)
    }

    /// Turn synchronous replication (back) on with the expression the
    /// monitor computed. The edge only completes once a standby has
    /// confirmed the WAL we already wrote; until then it fails and is
    /// retried on the next tick, so the monitor can still reassign us while
    /// we wait.
    async fn enable_sync_rep(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_running().await?;
        let expression = self
            .monitor
            .synchronous_standby_expression(&self.config.formation, self.state.group_id)
            .await?;

        if expression.is_empty() {
            return Ok(self.sql.disable_synchronous_replication().await?);
        }
        self.sql.set_synchronous_standby_names(&expression).await?;

        let status = self.sql.replication_status().await?;
        let target = status.current_lsn;
        if status
            .connected_standbys
            .iter()
            .any(|s| s.reported_lsn >= target)
        {
            return Ok(());
        }

        slog::info!(self.logger, "No standby has confirmed our WAL position yet";
            "target_lsn" => %target);
        Err(TransitionError::StandbyNotCaughtUp { target })
    }

    /// Fetch and apply the current synchronous-standby expression; used
    /// when peer metadata changed without a role change.
    async fn apply_settings(&mut self) -> Result<(), TransitionError> {
        let expression = self
            .monitor
            .synchronous_standby_expression(&self.config.formation, self.state.group_id)
            .await?;
        if expression.is_empty() {
            Ok(self.sql.disable_synchronous_replication().await?)
        } else {
            Ok(self.sql.set_synchronous_standby_names(&expression).await?)
        }
    }

    /// DEMOTE_TIMEOUT -> PRIMARY. False alarm: the monitor saw us again and
    /// decided against the failover.
    async fn start_postgres(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_running().await?;
        self.apply_settings().await
    }

    async fn checkpoint_and_stop_postgres(&mut self) -> Result<(), TransitionError> {
        if self.pg_ctl.is_running().await {
            // Two checkpoints so the shutdown one is quick and the standby
            // has as little replay as possible to catch up on.
            self.pg_ctl.checkpoint().await?;
            self.pg_ctl.checkpoint().await?;
        }
        self.ensure_postgres_stopped().await
    }

    /// PREPARE_MAINTENANCE -> MAINTENANCE on the old primary: leave behind
    /// a stopped server configured as a standby, ready to rejoin later.
    async fn stop_postgres_and_setup_standby(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_stopped().await?;
        self.status_bridge.clear()?;
        self.pg_ctl.setup_standby_mode(None).await?;
        Ok(())
    }

    /// WAIT_STANDBY -> CATCHINGUP. The primary is ready for us: seed the
    /// data directory and start streaming.
    async fn init_standby(&mut self) -> Result<(), TransitionError> {
        let upstream = self.resolve_primary().await?;

        // A pre-existing data directory (marker stage Exists) is reused as
        // is; anything else is seeded from the primary.
        let reuse_existing = self
            .init_marker
            .exists()
            .then(|| self.init_marker.load())
            .transpose()?
            .map(|marker| marker.stage == InitStage::Exists)
            .unwrap_or(false);
        if !reuse_existing {
            self.ensure_postgres_stopped().await?;
            self.pg_ctl.base_backup(&upstream).await?;
        }

        self.pg_ctl.setup_standby_mode(Some(&upstream)).await?;
        self.ensure_postgres_running().await?;
        self.publish_system_identifier().await?;
        self.init_marker.remove()?;
        Ok(())
    }

    /// INIT/DROPPED -> REPORT_LSN. Joining a group that currently has no
    /// primary: seed from the most advanced standby, without a slot.
    async fn init_from_standby(&mut self) -> Result<(), TransitionError> {
        let standby = self.resolve_most_advanced_standby().await?;
        let upstream = UpstreamNode {
            host: standby.host,
            port: standby.port,
            slot_name: None,
        };

        self.ensure_postgres_stopped().await?;
        self.pg_ctl.base_backup(&upstream).await?;
        self.pg_ctl.setup_standby_mode(Some(&upstream)).await?;
        self.ensure_postgres_running().await?;
        self.publish_system_identifier().await?;
        self.init_marker.remove()?;
        Ok(())
    }

    /// DEMOTED -> CATCHINGUP. Rejoin as a standby of the new primary: try
    /// an incremental rewind, fall back to a full re-seed when the WAL the
    /// rewind needs is gone.
    async fn rewind_or_init(&mut self) -> Result<(), TransitionError> {
        let upstream = self.resolve_primary().await?;

        // Proves replication connectivity before we touch the data
        // directory; failing here is cheap and fully retryable.
        self.pg_ctl.identify_system(&upstream).await?;

        self.ensure_postgres_stopped().await?;
        if let Err(e) = self.pg_ctl.rewind(&upstream).await {
            slog::warn!(self.logger, "Rewind failed, falling back to a full re-seed";
                "error" => %e);
            self.pg_ctl.base_backup(&upstream).await?;
        }

        self.pg_ctl.setup_standby_mode(Some(&upstream)).await?;
        self.ensure_postgres_running().await?;

        // Local slots survived the demotion with stale positions; drop them
        // so they are recreated fresh.
        self.drop_all_replication_slots().await
    }

    /// CATCHINGUP -> SECONDARY. We are a real standby now; verify we are on
    /// the primary's timeline and retain WAL for our fellow standbys.
    async fn prepare_for_secondary(&mut self) -> Result<(), TransitionError> {
        let upstream = self.resolve_primary().await?;
        let upstream_metadata = self.pg_ctl.identify_system(&upstream).await?;
        let local_metadata = self.pg_ctl.metadata().await?;
        if local_metadata.timeline_id != upstream_metadata.timeline_id {
            return Err(TransitionError::Init(format!(
                "local timeline {} does not match upstream timeline {}",
                local_metadata.timeline_id, upstream_metadata.timeline_id
            )));
        }

        self.refresh_peers().await?;
        self.maintain_replication_slots().await
    }

    /// SECONDARY -> PREP_PROMOTION. First leg of the promotion; the actual
    /// write-blocking happens in the stop_replication leg.
    async fn prepare_standby_for_promotion(&mut self) -> Result<(), TransitionError> {
        slog::info!(self.logger, "Preparing promotion, waiting for the primary to drain";
            "current_lsn" => %self.local.status.current_lsn);
        Ok(())
    }

    /// PREP_PROMOTION -> STOP_REPLICATION. The split-brain defense: refuse
    /// read-write sessions first, then leave recovery. The old primary sees
    /// its standby vanish and self-demotes; nobody accepts writes until the
    /// promote_standby_to_primary leg flips read-only back off.
    async fn stop_replication(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_running().await?;
        self.sql.set_default_transaction_read_only(true).await?;
        self.promote_if_in_recovery().await
    }

    /// STOP_REPLICATION -> WAIT_PRIMARY. Replication is severed and the
    /// monitor confirmed the promotion; start accepting writes.
    async fn promote_standby_to_primary(&mut self) -> Result<(), TransitionError> {
        self.sql.set_default_transaction_read_only(false).await?;
        self.refresh_peers().await?;
        for peer in self.peers.clone() {
            self.sql.ensure_replication_access(&peer.host).await?;
        }
        Ok(())
    }

    async fn promote_if_in_recovery(&mut self) -> Result<(), TransitionError> {
        if self.sql.is_in_recovery().await? {
            self.pg_ctl.promote().await?;
        }
        self.pg_ctl.cleanup_standby_mode().await?;
        Ok(())
    }

    /// SECONDARY-side -> SINGLE. The primary is gone for good; become the
    /// new one, alone.
    async fn promote_standby(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_running().await?;
        self.promote_if_in_recovery().await?;
        self.disable_replication().await
    }

    /// SECONDARY-side -> MAINTENANCE. The operator drives the server from
    /// here on; stop stating expectations about it.
    async fn start_maintenance_on_standby(&mut self) -> Result<(), TransitionError> {
        self.status_bridge.clear()?;
        Ok(())
    }

    /// A failover is being decided: freeze our replay position by dropping
    /// the upstream from the replication settings, and report where we are.
    /// The frozen position is what the monitor compares across candidates.
    async fn report_lsn(&mut self) -> Result<(), TransitionError> {
        self.pg_ctl.setup_standby_mode(None).await?;
        self.pg_ctl.restart().await?;
        self.local.is_running = true;
        self.local.status = self.sql.replication_status().await?;
        Ok(())
    }

    /// Same, for a demoted former primary rejoining the election; its old
    /// slots are meaningless now.
    async fn report_lsn_and_drop_slots(&mut self) -> Result<(), TransitionError> {
        self.report_lsn().await?;
        self.drop_all_replication_slots().await
    }

    /// REPORT_LSN -> FAST_FORWARD. We are the chosen candidate but another
    /// standby has WAL we are missing; fetch it before promoting.
    async fn fast_forward(&mut self) -> Result<(), TransitionError> {
        let standby = self.resolve_most_advanced_standby().await?;
        let target = standby.reported_lsn;
        let upstream = UpstreamNode {
            host: standby.host,
            port: standby.port,
            slot_name: None,
        };
        self.pg_ctl.fetch_wal(&upstream, target).await?;
        Ok(())
    }

    /// FAST_FORWARD -> PREP_PROMOTION. The missing WAL has been replayed;
    /// shed the standby configuration.
    async fn cleanup_as_primary(&mut self) -> Result<(), TransitionError> {
        self.pg_ctl.cleanup_standby_mode().await?;
        Ok(())
    }

    /// Follow whichever node the monitor now calls primary.
    async fn follow_new_primary(&mut self) -> Result<(), TransitionError> {
        let upstream = self.resolve_primary().await?;
        self.pg_ctl.identify_system(&upstream).await?;
        self.pg_ctl.setup_standby_mode(Some(&upstream)).await?;
        self.pg_ctl.restart().await?;
        self.local.is_running = true;
        self.init_marker.remove()?;
        Ok(())
    }

    /// ANY -> DROPPED. Terminal: stop the server and forget we were ever
    /// initializing.
    async fn drop_node(&mut self) -> Result<(), TransitionError> {
        self.ensure_postgres_stopped().await?;
        self.status_bridge.clear()?;
        self.init_marker.remove()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{replication_slot_name, KeeperConfig, KeeperOptions};
    use crate::fsm::table::TransitionStep;
    use crate::keeper::Keeper;
    use crate::signals::Signals;
    use crate::test_support::{FakeMonitor, FakePostgres, StaticConfigLoader};
    use std::convert::TryFrom;
    use std::sync::Arc;

    struct Fixture {
        keeper: Keeper,
        postgres: Arc<FakePostgres>,
        _dir: tempfile::TempDir,
    }

    fn fixture(postgres: FakePostgres, monitor: FakeMonitor) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let options = KeeperOptions {
            node_name: Some("node_a".to_string()),
            node_host: Some("10.0.0.1".to_string()),
            data_directory: Some(dir.path().join("data")),
            ..KeeperOptions::default()
        };
        let config = KeeperConfig::try_from(options.clone()).unwrap();
        let postgres = Arc::new(postgres);
        let keeper = Keeper::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            config,
            postgres.clone(),
            postgres.clone(),
            Arc::new(monitor),
            Arc::new(StaticConfigLoader::new(options)),
            Signals::new(),
        )
        .unwrap();
        Fixture {
            keeper,
            postgres,
            _dir: dir,
        }
    }

    // Crash-and-retry contract: running the same step twice from the same
    // observable state must succeed twice and end in the same place.

    #[tokio::test]
    async fn stop_postgres_twice_is_safe() {
        let mut f = fixture(FakePostgres::running_primary(5432, 1), FakeMonitor::new(1));

        f.keeper
            .run_transition_step(TransitionStep::StopPostgres)
            .await
            .unwrap();
        assert!(!f.postgres.is_running());

        f.keeper
            .run_transition_step(TransitionStep::StopPostgres)
            .await
            .unwrap();
        assert!(!f.postgres.is_running());
        // The second invocation found nothing to do.
        assert_eq!(f.postgres.events().iter().filter(|e| *e == "stop").count(), 1);
    }

    #[tokio::test]
    async fn promote_standby_twice_promotes_once() {
        let mut f = fixture(FakePostgres::running_standby(5432, 1), FakeMonitor::new(1));

        f.keeper
            .run_transition_step(TransitionStep::PromoteStandby)
            .await
            .unwrap();
        assert!(f.postgres.accepts_writes());

        f.keeper
            .run_transition_step(TransitionStep::PromoteStandby)
            .await
            .unwrap();
        assert!(f.postgres.accepts_writes());
        let promotes = f.postgres.events().iter().filter(|e| *e == "promote").count();
        assert_eq!(promotes, 1);
    }

    #[tokio::test]
    async fn prepare_replication_twice_creates_artifacts_once() {
        let monitor = FakeMonitor::new(1);
        monitor.set_peers(vec![crate::capability::PeerNode {
            node_id: 7,
            node_name: "node_7".to_string(),
            host: "10.0.0.7".to_string(),
            port: 5432,
            current_role: crate::fsm::NodeState::WaitStandby,
            reported_lsn: crate::lsn::Lsn::zero(),
        }]);
        let mut f = fixture(FakePostgres::running_primary(5432, 1), monitor);

        for _ in 0..2 {
            f.keeper
                .run_transition_step(TransitionStep::PrepareReplication)
                .await
                .unwrap();
        }

        let slot = replication_slot_name(7);
        assert!(f.postgres.has_slot(&slot));
        let creates = f
            .postgres
            .events()
            .iter()
            .filter(|e| *e == &format!("create_slot:{}", slot))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn empty_sync_expression_turns_sync_replication_off() {
        use crate::capability::SqlClient;

        let mut f = fixture(FakePostgres::running_primary(5432, 1), FakeMonitor::new(1));

        // The monitor computed no expression: both edges fall back to
        // turning synchronous replication off entirely.
        f.postgres
            .set_synchronous_standby_names("ANY 1 (node_7)")
            .await
            .unwrap();
        f.keeper
            .run_transition_step(TransitionStep::ApplySettings)
            .await
            .unwrap();
        assert_eq!(f.postgres.sync_standby_names(), None);

        f.postgres
            .set_synchronous_standby_names("ANY 1 (node_7)")
            .await
            .unwrap();
        f.keeper
            .run_transition_step(TransitionStep::DisableSyncRep)
            .await
            .unwrap();
        assert_eq!(f.postgres.sync_standby_names(), None);
    }

    #[tokio::test]
    async fn report_lsn_freezes_replay_without_upstream() {
        let mut f = fixture(FakePostgres::running_standby(5432, 1), FakeMonitor::new(1));

        f.keeper
            .run_transition_step(TransitionStep::ReportLsn)
            .await
            .unwrap();

        // Standby mode with no upstream: the replay position is frozen.
        assert_eq!(f.postgres.standby_upstream(), Some(None));
        assert!(f.postgres.is_running());
    }
}
