use crate::capability::RegistrationRequest;
use crate::fsm::NodeState;
use crate::keeper::{Keeper, KeeperError};
use crate::state_store::{InitMarker, InitStage};

impl Keeper {
    /// Register this node with the monitor and persist the initial state.
    ///
    /// The init marker is written before the first monitor contact and
    /// records what we found on disk, so a crash anywhere in here resumes
    /// instead of re-discovering (and possibly re-seeding) from scratch.
    /// The marker is removed by the init transitions once the node has
    /// converged to its first assigned role.
    pub async fn initialize(&mut self) -> Result<(), KeeperError> {
        self.liveness.create()?;

        // A persisted state file means a registration already succeeded;
        // re-registering would hand us a new identity and lose the slot
        // names the monitor reserved under the old one. When the marker is
        // also present the previous run crashed mid-initialization: the
        // recorded stage stands and the loop finishes the job.
        if self.store.exists() {
            self.state = self.store.load()?;
            if self.init_marker.exists() {
                slog::info!(self.logger, "Resuming an unfinished initialization";
                    "node_id" => self.state.node_id,
                    "assigned_role" => %self.state.assigned_role);
            } else {
                slog::info!(self.logger, "Node is already initialized";
                    "current_role" => %self.state.current_role);
            }
            return Ok(());
        }

        let stage = self.discover_init_stage().await;
        self.init_marker.save(&InitMarker::new(stage))?;
        slog::info!(self.logger, "Recorded pre-initialization state"; "stage" => ?stage);

        let request = RegistrationRequest {
            formation: self.config.formation.clone(),
            node_name: self.config.node_name.clone(),
            node_host: self.config.node_host.clone(),
            node_port: self.config.node_port,
            desired_group_id: None,
            candidate_priority: self.config.candidate_priority,
            replication_quorum: self.config.replication_quorum,
        };
        let assigned = self.monitor.register_node(&request).await?;

        self.state.node_id = assigned.node_id;
        self.state.group_id = assigned.group_id;
        self.state.current_role = NodeState::Init;
        self.state.assigned_role = assigned.role;
        self.store.save(&self.state)?;

        slog::info!(self.logger, "Registered with the monitor";
            "node_id" => assigned.node_id,
            "group_id" => assigned.group_id,
            "assigned_role" => %assigned.role,
        );
        Ok(())
    }

    async fn discover_init_stage(&self) -> InitStage {
        if !self.pg_ctl.data_directory_exists() {
            return InitStage::Empty;
        }
        if !self.pg_ctl.is_running().await {
            return InitStage::Exists;
        }
        match self.sql.is_in_recovery().await {
            Ok(false) => InitStage::Primary,
            // In recovery, or running but not answering queries yet.
            _ => InitStage::Running,
        }
    }
}
