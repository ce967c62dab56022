use crate::fsm::NodeState;
use crate::lsn::Lsn;

/// Everything the node tells the monitor on each loop tick.
#[derive(Clone, Debug)]
pub struct NodeActiveReport {
    pub formation: String,
    pub node_name: String,
    pub node_host: String,
    pub node_port: u16,
    pub node_id: i64,
    pub group_id: i32,
    pub current_role: NodeState,
    pub pg_is_running: bool,
    pub current_lsn: Lsn,
    pub sync_state: String,
}

/// The monitor's answer: who we are and what we should become. The role is
/// authoritative; the ids can change when the monitor re-homes the node.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AssignedState {
    pub node_id: i64,
    pub group_id: i32,
    pub role: NodeState,
    /// Bumped by the monitor whenever group membership changes; a value we
    /// have not seen yet means our cached peer list is stale.
    pub nodes_version: u64,
}

/// A peer node in our formation, as known to the monitor.
#[derive(Clone, Debug)]
pub struct PeerNode {
    pub node_id: i64,
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub current_role: NodeState,
    pub reported_lsn: Lsn,
}

/// First-contact registration arguments.
#[derive(Clone, Debug)]
pub struct RegistrationRequest {
    pub formation: String,
    pub node_name: String,
    pub node_host: String,
    pub node_port: u16,
    pub desired_group_id: Option<i32>,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Could not talk to the monitor at all. Non-fatal; on a primary this
    /// feeds partition detection.
    #[error("monitor unreachable: {0}")]
    Unreachable(String),
    /// The monitor answered but the exchange did not make sense (rejected
    /// registration, malformed answer).
    #[error("monitor protocol failure: {0}")]
    Protocol(String),
}

/// Client side of the monitor protocol. One logical RPC (`node_active`)
/// drives the whole reconciliation loop; the rest are lookups used by
/// individual transitions.
#[async_trait::async_trait]
pub trait MonitorClient: Send + Sync {
    /// Report our state, receive the assigned state. Idempotent on the
    /// monitor side for identical reports.
    async fn node_active(&self, report: &NodeActiveReport) -> Result<AssignedState, MonitorError>;

    async fn register_node(
        &self,
        request: &RegistrationRequest,
    ) -> Result<AssignedState, MonitorError>;

    /// Peers of this node (every other node of the group).
    async fn get_peer_nodes(
        &self,
        formation: &str,
        group_id: i32,
    ) -> Result<Vec<PeerNode>, MonitorError>;

    /// The node currently acting as the group's primary.
    async fn get_primary(&self, formation: &str, group_id: i32) -> Result<PeerNode, MonitorError>;

    /// During a failover, the standby that has reported the most WAL.
    async fn get_most_advanced_standby(
        &self,
        formation: &str,
        group_id: i32,
    ) -> Result<PeerNode, MonitorError>;

    /// The synchronous-standby expression the monitor computed for the
    /// group, empty when synchronous replication should be off.
    async fn synchronous_standby_expression(
        &self,
        formation: &str,
        group_id: i32,
    ) -> Result<String, MonitorError>;

    /// Publish the cluster's system identifier after initializing or
    /// re-seeding a data directory.
    async fn set_node_system_identifier(
        &self,
        node_id: i64,
        system_identifier: u64,
    ) -> Result<(), MonitorError>;
}
