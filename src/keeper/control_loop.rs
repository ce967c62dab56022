use crate::fsm::{self, NodeState};
use crate::keeper::partition::check_network_partition;
use crate::keeper::{Keeper, KeeperError};
use chrono::Utc;

/// What one tick of the reconciliation loop did.
#[derive(Copy, Clone, Debug, Default)]
pub struct TickOutcome {
    /// A transition was needed and completed; the loop skips its next
    /// sleep so multi-hop convergence is fast.
    pub transitioned: bool,
    pub monitor_reachable: bool,
}

/// Why the loop ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoopExit {
    StopRequested,
    /// The monitor dropped this node and we confirmed it; there is nothing
    /// left to reconcile.
    Dropped,
}

impl Keeper {
    /// One reconciliation tick. Verifies process identity, reloads the
    /// durable state, probes the local database, exchanges node-active with
    /// the monitor, reconciles, transitions when needed, and persists
    /// unconditionally so the contact timestamps are never lost.
    pub async fn run_loop_once(&mut self) -> Result<TickOutcome, KeeperError> {
        let now = Utc::now().timestamp();

        // Losing our pid marker means another process may own this node;
        // that one is fatal to the whole process.
        self.liveness.check()?;

        // Disk, not memory, is the source of truth across crashes.
        self.state = self.store.load()?;

        self.probe_local_database().await?;

        if self.state.current_role == NodeState::Primary
            && self.local.status.has_connected_standby()
        {
            self.state.last_secondary_contact = now;
        }

        let pg_is_running = self.report_pg_is_running(now);
        let report = self.node_active_report(pg_is_running);

        let mut outcome = TickOutcome::default();
        match self.monitor.node_active(&report).await {
            Ok(assigned) => {
                outcome.monitor_reachable = true;
                self.state.last_monitor_contact = now;
                self.apply_assigned_identity(&assigned);
                self.state.assigned_role = assigned.role;

                // Peer lists only change when the monitor says membership
                // changed; a stable nodes_version skips the lookup.
                if assigned.nodes_version != self.state.nodes_version {
                    match self.refresh_peers().await {
                        Ok(()) => self.state.nodes_version = assigned.nodes_version,
                        Err(e) => {
                            slog::warn!(self.logger, "Could not refresh peer list";
                                "error" => %e);
                        }
                    }
                }

                if Keeper::should_ensure_current_state_before_transition(
                    self.state.current_role,
                    self.state.assigned_role,
                ) {
                    if let Err(e) = self.ensure_current_state(now).await {
                        slog::warn!(self.logger, "Could not ensure current state";
                            "current" => %self.state.current_role, "error" => %e);
                    }
                }
            }
            Err(e) => {
                slog::warn!(self.logger, "Monitor is unreachable"; "error" => %e);
                check_network_partition(
                    &mut self.state,
                    &self.local.status,
                    self.config.network_partition_timeout.as_secs() as i64,
                    now,
                    &self.logger,
                );
            }
        }

        let assigned_role = self.state.assigned_role;
        if assigned_role != self.state.current_role {
            match fsm::reach_assigned_state(self, assigned_role).await {
                Ok(transitioned) => outcome.transitioned = transitioned,
                Err(e) => {
                    // Non-fatal: the role did not advance and the same edge
                    // is retried next tick.
                    slog::error!(self.logger, "Could not reach assigned state"; "error" => %e);
                }
            }
        }

        self.store.save(&self.state)?;
        Ok(outcome)
    }

    /// The long-running reconciliation loop. Returns when a stop is
    /// requested, when the node has been dropped, or on a fatal error.
    pub async fn run_loop_forever(&mut self) -> Result<LoopExit, KeeperError> {
        let signals = self.signals.clone();
        // Claim ownership of the node; every tick re-checks that the
        // marker still names us.
        self.liveness.create()?;
        if self.init_marker.exists() {
            slog::info!(self.logger, "Resuming an unfinished initialization");
        }

        // No sleep before the first tick: converge fast on startup.
        let mut skip_sleep = true;
        let mut first_iteration = true;
        let mut dropped_rounds = 0u32;

        loop {
            // The first contact can change our node id and thus our slot
            // name; re-merge configuration around it.
            if signals.take_reload_request() || first_iteration {
                self.reload_configuration();
            }

            if signals.stop_requested() {
                return Ok(LoopExit::StopRequested);
            }

            if !skip_sleep
                && signals.interruptible_sleep(self.config.sleep_interval).await
            {
                return Ok(LoopExit::StopRequested);
            }

            match self.run_loop_once().await {
                Ok(outcome) => {
                    skip_sleep = outcome.transitioned;

                    let fully_dropped = self.state.current_role == NodeState::Dropped
                        && self.state.assigned_role == NodeState::Dropped;
                    if fully_dropped && outcome.monitor_reachable {
                        // One extra round reporting DROPPED so the monitor
                        // sees the confirmation, then stop for good.
                        dropped_rounds += 1;
                        if dropped_rounds >= 2 {
                            slog::info!(self.logger, "Node has been dropped, exiting");
                            return Ok(LoopExit::Dropped);
                        }
                        skip_sleep = true;
                    }
                }
                Err(e) if e.is_fatal() => {
                    slog::crit!(self.logger, "Fatal error, exiting"; "error" => %e);
                    return Err(e);
                }
                Err(e) => {
                    slog::error!(self.logger, "Tick failed, retrying next tick"; "error" => %e);
                    skip_sleep = false;
                }
            }

            if first_iteration {
                first_iteration = false;
                self.reload_configuration();
            }
        }
    }
}
