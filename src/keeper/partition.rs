use crate::capability::ReplicationStatus;
use crate::fsm::NodeState;
use crate::state_store::KeeperState;

/// Decide whether a primary that cannot reach the monitor should demote
/// itself. Returns true when the demotion was forced (the assigned role is
/// set to DemoteTimeout in `state`).
///
/// A connected standby counts as proof of network health even with the
/// monitor silent: replication traffic is flowing, so we are not isolated,
/// and `last_secondary_contact` is refreshed. The forced demotion only
/// fires when BOTH the monitor and every standby have been silent longer
/// than `timeout_secs`; one silent peer alone never demotes.
pub fn check_network_partition(
    state: &mut KeeperState,
    status: &ReplicationStatus,
    timeout_secs: i64,
    now: i64,
    logger: &slog::Logger,
) -> bool {
    if state.current_role != NodeState::Primary {
        return false;
    }

    if status.has_connected_standby() {
        state.last_secondary_contact = now;
        return false;
    }

    // A zero timestamp means we have never heard from that peer; without a
    // baseline there is no elapsed time to measure, so no demotion.
    let monitor_silent =
        state.last_monitor_contact > 0 && now - state.last_monitor_contact > timeout_secs;
    let secondary_silent =
        state.last_secondary_contact > 0 && now - state.last_secondary_contact > timeout_secs;

    if monitor_silent && secondary_silent {
        slog::error!(logger, "Network partition detected, demoting ourselves";
            "seconds_since_monitor_contact" => now - state.last_monitor_contact,
            "seconds_since_secondary_contact" => now - state.last_secondary_contact,
            "timeout" => timeout_secs,
        );
        state.assigned_role = NodeState::DemoteTimeout;
        return true;
    }

    false
}
