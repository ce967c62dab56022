use crate::fsm::node_state::{MatchState, NodeState};
use std::fmt::Write;

/// TransitionStep names the side-effecting body of one FSM edge. The actual
/// implementations live on the Keeper (see `fsm::transitions`); keeping the
/// table as plain data makes lookup, graph export and coverage checks trivial.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransitionStep {
    InitPrimary,
    InitFromStandby,
    DisableReplication,
    ResumeAsPrimary,
    PrepareReplication,
    DisableSyncRep,
    EnableSyncRep,
    ApplySettings,
    StartPostgres,
    StopPostgres,
    StopPostgresForPrimaryMaintenance,
    StopPostgresAndSetupStandby,
    CheckpointAndStopPostgres,
    InitStandby,
    RewindOrInit,
    PrepareForSecondary,
    PrepareStandbyForPromotion,
    StopReplication,
    PromoteStandbyToPrimary,
    PromoteStandby,
    StartMaintenanceOnStandby,
    RestartStandby,
    ReportLsn,
    ReportLsnAndDropSlots,
    FastForward,
    CleanupAsPrimary,
    FollowNewPrimary,
    DropNode,
}

/// One edge of the keeper FSM: when the monitor assigns `assigned` while we
/// are in `current`, run `step` (or just adopt the new role when `None`).
pub struct Transition {
    pub current: MatchState,
    pub assigned: MatchState,
    pub rationale: &'static str,
    pub step: Option<TransitionStep>,
}

const fn edge(
    current: NodeState,
    assigned: NodeState,
    rationale: &'static str,
    step: TransitionStep,
) -> Transition {
    Transition {
        current: MatchState::Exact(current),
        assigned: MatchState::Exact(assigned),
        rationale,
        step: Some(step),
    }
}

const fn bookkeeping(current: NodeState, assigned: NodeState, rationale: &'static str) -> Transition {
    Transition {
        current: MatchState::Exact(current),
        assigned: MatchState::Exact(assigned),
        rationale,
        step: None,
    }
}

/// The full two-role state machine. A node changes role over its life-cycle,
/// so primary-side and standby-side states live in one table. The table is
/// ordered and lookup is first-match; the only wildcard entry is the
/// universal drop at the end.
#[rustfmt::skip]
pub const KEEPER_FSM: &[Transition] = &[
    // starting from scratch, or re-initializing after a drop
    edge(NodeState::Init, NodeState::Single,
         "Start as a single node", TransitionStep::InitPrimary),
    edge(NodeState::Dropped, NodeState::Single,
         "Start as a single node", TransitionStep::InitPrimary),
    edge(NodeState::Dropped, NodeState::ReportLsn,
         "This node is being reinitialized after having been dropped",
         TransitionStep::InitFromStandby),

    // other node(s) forcibly removed, now single
    edge(NodeState::Primary, NodeState::Single,
         "Other node was forcibly removed, now single", TransitionStep::DisableReplication),
    edge(NodeState::WaitPrimary, NodeState::Single,
         "Other node was forcibly removed, now single", TransitionStep::DisableReplication),
    edge(NodeState::JoinPrimary, NodeState::Single,
         "Other node was forcibly removed, now single", TransitionStep::DisableReplication),

    // failover occurred, primary must stop serving writes
    edge(NodeState::Primary, NodeState::Draining,
         "A failover occurred, stopping writes", TransitionStep::StopPostgres),
    edge(NodeState::Draining, NodeState::Demoted,
         "Demoted after a failover, no longer primary", TransitionStep::StopPostgres),
    edge(NodeState::Primary, NodeState::Demoted,
         "A failover occurred, no longer primary", TransitionStep::StopPostgres),
    edge(NodeState::Primary, NodeState::DemoteTimeout,
         "A failover occurred, no longer primary", TransitionStep::StopPostgres),

    edge(NodeState::JoinPrimary, NodeState::Draining,
         "A failover occurred, stopping writes", TransitionStep::StopPostgres),
    edge(NodeState::JoinPrimary, NodeState::Demoted,
         "A failover occurred, no longer primary", TransitionStep::StopPostgres),
    edge(NodeState::JoinPrimary, NodeState::DemoteTimeout,
         "A failover occurred, no longer primary", TransitionStep::StopPostgres),

    edge(NodeState::ApplySettings, NodeState::Draining,
         "A failover occurred, stopping writes", TransitionStep::StopPostgres),
    edge(NodeState::ApplySettings, NodeState::Demoted,
         "A failover occurred, no longer primary", TransitionStep::StopPostgres),
    edge(NodeState::ApplySettings, NodeState::DemoteTimeout,
         "A failover occurred, no longer primary", TransitionStep::StopPostgres),

    // primary is put to maintenance
    edge(NodeState::Primary, NodeState::PrepareMaintenance,
         "Promoting the standby to enable maintenance on the primary",
         TransitionStep::StopPostgresForPrimaryMaintenance),
    edge(NodeState::PrepareMaintenance, NodeState::Maintenance,
         "Setting up the database in standby mode for maintenance operations",
         TransitionStep::StopPostgresAndSetupStandby),
    edge(NodeState::Primary, NodeState::Maintenance,
         "Stopping the database to enable maintenance on the primary",
         TransitionStep::StopPostgresForPrimaryMaintenance),

    // was demoted, needs to be dead now
    edge(NodeState::Draining, NodeState::DemoteTimeout,
         "Secondary confirms it receives no more writes", TransitionStep::StopPostgres),
    edge(NodeState::DemoteTimeout, NodeState::Demoted,
         "Demote timeout expired", TransitionStep::StopPostgres),

    // wait_primary stopped reporting, is (supposed) dead now
    edge(NodeState::WaitPrimary, NodeState::Demoted,
         "A failover occurred, no longer primary", TransitionStep::StopPostgres),

    // demoted after a failure, but the standby was forcibly removed
    edge(NodeState::Demoted, NodeState::Single,
         "Was demoted after a failure, but secondary was forcibly removed",
         TransitionStep::ResumeAsPrimary),
    edge(NodeState::DemoteTimeout, NodeState::Single,
         "Was demoted after a failure, but secondary was forcibly removed",
         TransitionStep::ResumeAsPrimary),
    edge(NodeState::Draining, NodeState::Single,
         "Was demoted after a failure, but secondary was forcibly removed",
         TransitionStep::ResumeAsPrimary),

    // primary was forcibly removed
    edge(NodeState::Secondary, NodeState::Single,
         "Primary was forcibly removed", TransitionStep::PromoteStandby),
    edge(NodeState::Catchingup, NodeState::Single,
         "Primary was forcibly removed", TransitionStep::PromoteStandby),
    edge(NodeState::PrepPromotion, NodeState::Single,
         "Primary was forcibly removed", TransitionStep::PromoteStandby),
    edge(NodeState::StopReplication, NodeState::Single,
         "Went down to force the primary to time out, but then it was removed",
         TransitionStep::PromoteStandby),
    edge(NodeState::ReportLsn, NodeState::Single,
         "There is no other node anymore, promote this node",
         TransitionStep::PromoteStandby),

    // on the primary, wait for a standby to be ready
    edge(NodeState::Single, NodeState::WaitPrimary,
         "A new secondary was added", TransitionStep::PrepareReplication),
    edge(NodeState::Primary, NodeState::JoinPrimary,
         "A new secondary was added", TransitionStep::PrepareReplication),
    edge(NodeState::Primary, NodeState::WaitPrimary,
         "Secondary became unhealthy", TransitionStep::DisableSyncRep),
    edge(NodeState::JoinPrimary, NodeState::WaitPrimary,
         "Secondary became unhealthy", TransitionStep::DisableSyncRep),
    edge(NodeState::WaitPrimary, NodeState::JoinPrimary,
         "A new secondary was added", TransitionStep::PrepareReplication),

    // situation getting back to normal on the primary
    edge(NodeState::WaitPrimary, NodeState::Primary,
         "A healthy secondary appeared", TransitionStep::EnableSyncRep),
    edge(NodeState::JoinPrimary, NodeState::Primary,
         "A healthy secondary appeared", TransitionStep::EnableSyncRep),
    edge(NodeState::DemoteTimeout, NodeState::Primary,
         "Detected a network partition, but monitor did not do failover",
         TransitionStep::StartPostgres),

    // the primary is ready to accept a standby; we are the standby
    edge(NodeState::WaitStandby, NodeState::Catchingup,
         "The primary is now ready to accept a standby", TransitionStep::InitStandby),
    edge(NodeState::Demoted, NodeState::Catchingup,
         "A new primary is available. First try to rewind, else re-seed from backup",
         TransitionStep::RewindOrInit),
    edge(NodeState::Secondary, NodeState::Catchingup,
         "Failed to report back to the monitor, not eligible for promotion",
         TransitionStep::FollowNewPrimary),

    // we are asked to be a standby
    edge(NodeState::Catchingup, NodeState::Secondary,
         "Convinced the monitor we are up and running, eligible for promotion again",
         TransitionStep::PrepareForSecondary),

    // the standby is asked to prepare its own promotion
    edge(NodeState::Secondary, NodeState::PrepPromotion,
         "Stop traffic to primary, wait for it to finish draining",
         TransitionStep::PrepareStandbyForPromotion),
    edge(NodeState::Catchingup, NodeState::PrepPromotion,
         "Stop traffic to primary, wait for it to finish draining",
         TransitionStep::PrepareStandbyForPromotion),

    // forcefully stop replication by stopping the server
    edge(NodeState::PrepPromotion, NodeState::StopReplication,
         "Prevent against split-brain situations", TransitionStep::StopReplication),

    // finish the promotion
    edge(NodeState::StopReplication, NodeState::WaitPrimary,
         "Confirmed promotion with the monitor", TransitionStep::PromoteStandbyToPrimary),
    edge(NodeState::PrepPromotion, NodeState::WaitPrimary,
         "Promoting a standby after having blocked writes",
         TransitionStep::PromoteStandby),

    // just wait until the primary is ready
    bookkeeping(NodeState::Init, NodeState::WaitStandby,
                "Start following a primary"),
    bookkeeping(NodeState::Dropped, NodeState::WaitStandby,
                "Start following a primary"),
    bookkeeping(NodeState::Secondary, NodeState::WaitStandby,
                "Registering to a new monitor"),

    // maintenance of the standby server
    bookkeeping(NodeState::Secondary, NodeState::WaitMaintenance,
                "Waiting for the primary to disable sync replication before maintenance"),
    bookkeeping(NodeState::Catchingup, NodeState::WaitMaintenance,
                "Waiting for the primary to disable sync replication before maintenance"),
    edge(NodeState::Secondary, NodeState::Maintenance,
         "Suspending standby for manual maintenance", TransitionStep::StartMaintenanceOnStandby),
    edge(NodeState::Catchingup, NodeState::Maintenance,
         "Suspending standby for manual maintenance", TransitionStep::StartMaintenanceOnStandby),
    edge(NodeState::WaitMaintenance, NodeState::Maintenance,
         "Suspending standby for manual maintenance", TransitionStep::StartMaintenanceOnStandby),
    edge(NodeState::Maintenance, NodeState::Catchingup,
         "Restarting standby after manual maintenance is done", TransitionStep::RestartStandby),
    edge(NodeState::PrepareMaintenance, NodeState::Catchingup,
         "Restarting standby after manual maintenance is done", TransitionStep::RestartStandby),

    // new replication settings mean a fresh synchronous-standby expression
    bookkeeping(NodeState::Primary, NodeState::ApplySettings,
                "Apply new replication settings (synchronous standby expression)"),
    bookkeeping(NodeState::WaitPrimary, NodeState::ApplySettings,
                "Apply new replication settings (synchronous standby expression)"),
    edge(NodeState::ApplySettings, NodeState::Primary,
         "Back to primary after having applied new replication settings",
         TransitionStep::EnableSyncRep),

    edge(NodeState::ApplySettings, NodeState::Single,
         "Other node was forcibly removed, now single", TransitionStep::DisableReplication),
    edge(NodeState::ApplySettings, NodeState::WaitPrimary,
         "Secondary became unhealthy", TransitionStep::DisableSyncRep),
    edge(NodeState::ApplySettings, NodeState::JoinPrimary,
         "A new secondary was added", TransitionStep::PrepareReplication),

    // with multiple standbys, failover begins by reporting the current LSN
    edge(NodeState::Secondary, NodeState::ReportLsn,
         "Reporting the last write-ahead log location received", TransitionStep::ReportLsn),
    edge(NodeState::Catchingup, NodeState::ReportLsn,
         "Reporting the last write-ahead log location received", TransitionStep::ReportLsn),
    edge(NodeState::Maintenance, NodeState::ReportLsn,
         "Reporting the last write-ahead log location received", TransitionStep::ReportLsn),
    edge(NodeState::PrepareMaintenance, NodeState::ReportLsn,
         "Reporting the last write-ahead log location received", TransitionStep::ReportLsn),

    edge(NodeState::ReportLsn, NodeState::PrepPromotion,
         "Stop traffic to primary, wait for it to finish draining",
         TransitionStep::PrepareStandbyForPromotion),

    edge(NodeState::ReportLsn, NodeState::FastForward,
         "Fetching missing WAL from another standby before promotion",
         TransitionStep::FastForward),
    edge(NodeState::FastForward, NodeState::PrepPromotion,
         "Got the missing WAL bytes, promoted", TransitionStep::CleanupAsPrimary),

    edge(NodeState::ReportLsn, NodeState::JoinSecondary,
         "A failover candidate has been selected, stop replication",
         TransitionStep::CheckpointAndStopPostgres),
    edge(NodeState::ReportLsn, NodeState::Secondary,
         "Failover is done, we have a new primary to follow",
         TransitionStep::FollowNewPrimary),
    edge(NodeState::JoinSecondary, NodeState::Secondary,
         "Failover is done, we have a new primary to follow",
         TransitionStep::FollowNewPrimary),

    // old primary back online during the secondary election
    edge(NodeState::Draining, NodeState::ReportLsn,
         "Reporting the last write-ahead log location after draining",
         TransitionStep::ReportLsnAndDropSlots),
    edge(NodeState::Demoted, NodeState::ReportLsn,
         "Reporting the last write-ahead log location after being demoted",
         TransitionStep::ReportLsnAndDropSlots),

    // adding a new node when there is no primary, only non-candidate standbys
    edge(NodeState::Init, NodeState::ReportLsn,
         "Creating a new node from a standby node that is not a candidate",
         TransitionStep::InitFromStandby),

    // dropping a node works from any state
    Transition {
        current: MatchState::Any,
        assigned: MatchState::Exact(NodeState::Dropped),
        rationale: "This node is being dropped from the monitor",
        step: Some(TransitionStep::DropNode),
    },
];

/// First entry whose `(current, assigned)` pair matches wins.
pub fn find_transition(current: NodeState, assigned: NodeState) -> Option<&'static Transition> {
    KEEPER_FSM
        .iter()
        .find(|t| t.current.matches(current) && t.assigned.matches(assigned))
}

/// All transitions applicable from `current`, for diagnostics and for
/// checking that every monitor-reachable edge is defined.
pub fn reachable_states(current: NodeState) -> Vec<&'static Transition> {
    KEEPER_FSM.iter().filter(|t| t.current.matches(current)).collect()
}

/// Graphviz program drawing the FSM: `keeper fsm gv | dot -Tpng > fsm.png`.
pub fn render_graphviz() -> String {
    let mut out = String::new();
    out.push_str("digraph finite_state_machine\n{\n");
    out.push_str("    size=\"12\"\n    ratio=\"fill\"\n");
    out.push_str(
        "    node [shape = doubleoctagon, style=filled, color=\"bisque1\"]; init primary secondary;\n",
    );
    out.push_str("    node [shape = octagon, style=filled color=\"bisque3\"];\n");

    for transition in KEEPER_FSM {
        // String formatting into a String cannot fail.
        let _ = writeln!(
            out,
            "    \"{}\" -> \"{}\" [ label = \"{}\" ];",
            transition.current, transition.assigned, transition.rationale
        );
    }

    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::node_state::ALL_NODE_STATES;

    #[test]
    fn every_state_can_be_dropped() {
        for state in ALL_NODE_STATES {
            if *state == NodeState::Dropped {
                continue;
            }
            let transition = find_transition(*state, NodeState::Dropped)
                .unwrap_or_else(|| panic!("no drop transition from {}", state));
            assert_eq!(transition.step, Some(TransitionStep::DropNode));
        }
    }

    #[test]
    fn lookup_is_first_match() {
        // PRIMARY -> DEMOTED appears before the wildcard drop entry, and both
        // edges for PRIMARY -> * resolve to their specific step.
        let t = find_transition(NodeState::Primary, NodeState::Demoted).unwrap();
        assert_eq!(t.step, Some(TransitionStep::StopPostgres));

        let t = find_transition(NodeState::Primary, NodeState::JoinPrimary).unwrap();
        assert_eq!(t.step, Some(TransitionStep::PrepareReplication));
    }

    #[test]
    fn undefined_edges_have_no_match() {
        assert!(find_transition(NodeState::Single, NodeState::Secondary).is_none());
        assert!(find_transition(NodeState::Maintenance, NodeState::Primary).is_none());
    }

    #[test]
    fn bookkeeping_edges_carry_no_step() {
        let t = find_transition(NodeState::Init, NodeState::WaitStandby).unwrap();
        assert!(t.step.is_none());

        let t = find_transition(NodeState::Primary, NodeState::ApplySettings).unwrap();
        assert!(t.step.is_none());
    }

    #[test]
    fn promotion_sequence_is_fully_defined() {
        let steps = [
            (NodeState::Secondary, NodeState::PrepPromotion, TransitionStep::PrepareStandbyForPromotion),
            (NodeState::PrepPromotion, NodeState::StopReplication, TransitionStep::StopReplication),
            (NodeState::StopReplication, NodeState::WaitPrimary, TransitionStep::PromoteStandbyToPrimary),
            (NodeState::WaitPrimary, NodeState::Primary, TransitionStep::EnableSyncRep),
        ];
        for (current, assigned, expected) in &steps {
            let t = find_transition(*current, *assigned).unwrap();
            assert_eq!(t.step, Some(*expected));
        }
    }

    #[test]
    fn reachable_states_include_wildcard_drop() {
        let reachable = reachable_states(NodeState::Maintenance);
        assert!(reachable
            .iter()
            .any(|t| t.assigned.matches(NodeState::Dropped)));
        assert!(reachable
            .iter()
            .any(|t| t.assigned.matches(NodeState::ReportLsn)));
    }

    #[test]
    fn graphviz_export_mentions_every_edge() {
        let gv = render_graphviz();
        assert!(gv.starts_with("digraph"));
        assert_eq!(
            gv.matches(" -> ").count(),
            KEEPER_FSM.len(),
            "one graph edge per table entry"
        );
    }
}
