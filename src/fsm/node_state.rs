use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// NodeState is the FSM's state space: the roles a node can hold, as decided
/// by the monitor and implemented locally by the keeper.
///
/// Exactly one of these is the node's current role (authoritative on the
/// node) and one is the assigned role (what the monitor wants us to become).
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Init,
    Single,
    Primary,
    WaitPrimary,
    WaitStandby,
    Demoted,
    DemoteTimeout,
    Draining,
    Secondary,
    Catchingup,
    PrepPromotion,
    StopReplication,
    Maintenance,
    JoinPrimary,
    ApplySettings,
    PrepareMaintenance,
    WaitMaintenance,
    ReportLsn,
    FastForward,
    JoinSecondary,
    Dropped,
}

pub const ALL_NODE_STATES: &[NodeState] = &[
    NodeState::Init,
    NodeState::Single,
    NodeState::Primary,
    NodeState::WaitPrimary,
    NodeState::WaitStandby,
    NodeState::Demoted,
    NodeState::DemoteTimeout,
    NodeState::Draining,
    NodeState::Secondary,
    NodeState::Catchingup,
    NodeState::PrepPromotion,
    NodeState::StopReplication,
    NodeState::Maintenance,
    NodeState::JoinPrimary,
    NodeState::ApplySettings,
    NodeState::PrepareMaintenance,
    NodeState::WaitMaintenance,
    NodeState::ReportLsn,
    NodeState::FastForward,
    NodeState::JoinSecondary,
    NodeState::Dropped,
];

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Init => "init",
            NodeState::Single => "single",
            NodeState::Primary => "primary",
            NodeState::WaitPrimary => "wait_primary",
            NodeState::WaitStandby => "wait_standby",
            NodeState::Demoted => "demoted",
            NodeState::DemoteTimeout => "demote_timeout",
            NodeState::Draining => "draining",
            NodeState::Secondary => "secondary",
            NodeState::Catchingup => "catchingup",
            NodeState::PrepPromotion => "prepare_promotion",
            NodeState::StopReplication => "stop_replication",
            NodeState::Maintenance => "maintenance",
            NodeState::JoinPrimary => "join_primary",
            NodeState::ApplySettings => "apply_settings",
            NodeState::PrepareMaintenance => "prepare_maintenance",
            NodeState::WaitMaintenance => "wait_maintenance",
            NodeState::ReportLsn => "report_lsn",
            NodeState::FastForward => "fast_forward",
            NodeState::JoinSecondary => "join_secondary",
            NodeState::Dropped => "dropped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized node state {0:?}")]
pub struct ParseNodeStateError(String);

impl FromStr for NodeState {
    type Err = ParseNodeStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_NODE_STATES
            .iter()
            .copied()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| ParseNodeStateError(s.to_string()))
    }
}

/// MatchState is the key type used by transition table entries. The wildcard
/// is deliberately a separate variant rather than a magic NodeState value, so
/// that a live node can never hold it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MatchState {
    Exact(NodeState),
    Any,
}

impl MatchState {
    pub fn matches(&self, state: NodeState) -> bool {
        match self {
            MatchState::Exact(wanted) => *wanted == state,
            MatchState::Any => true,
        }
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchState::Exact(state) => state.fmt(f),
            MatchState::Any => f.write_str("(any)"),
        }
    }
}
