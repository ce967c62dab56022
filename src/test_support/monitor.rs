use crate::capability::{
    AssignedState, MonitorClient, MonitorError, NodeActiveReport, PeerNode, RegistrationRequest,
};
use crate::fsm::NodeState;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A scriptable monitor: tests queue up the roles it assigns and flip its
/// reachability; every node-active report is captured for assertions.
pub struct FakeMonitor {
    inner: Mutex<Sim>,
}

struct Sim {
    reachable: bool,
    node_id: i64,
    group_id: i32,
    nodes_version: u64,
    assignments: VecDeque<NodeState>,
    last_assignment: NodeState,
    peers: Vec<PeerNode>,
    primary: Option<PeerNode>,
    most_advanced_standby: Option<PeerNode>,
    sync_expression: String,
    reports: Vec<NodeActiveReport>,
    published_system_identifier: Option<u64>,
}

impl FakeMonitor {
    pub fn new(node_id: i64) -> Self {
        FakeMonitor {
            inner: Mutex::new(Sim {
                reachable: true,
                node_id,
                group_id: 0,
                nodes_version: 1,
                assignments: VecDeque::new(),
                last_assignment: NodeState::Init,
                peers: Vec::new(),
                primary: None,
                most_advanced_standby: None,
                sync_expression: String::new(),
                reports: Vec::new(),
                published_system_identifier: None,
            }),
        }
    }

    /// Queue the next assigned roles; once the queue is drained the last
    /// one keeps being repeated, like a monitor holding its decision.
    pub fn assign(&self, roles: &[NodeState]) {
        let mut sim = self.inner.lock().unwrap();
        sim.assignments.extend(roles.iter().copied());
        if let Some(last) = roles.last() {
            sim.last_assignment = *last;
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unwrap().reachable = reachable;
    }

    /// Replacing the peer list counts as a membership change and bumps the
    /// monitor's nodes version, like a real node addition or removal.
    pub fn set_peers(&self, peers: Vec<PeerNode>) {
        let mut sim = self.inner.lock().unwrap();
        sim.peers = peers;
        sim.nodes_version += 1;
    }

    pub fn set_primary(&self, primary: PeerNode) {
        self.inner.lock().unwrap().primary = Some(primary);
    }

    pub fn set_most_advanced_standby(&self, standby: PeerNode) {
        self.inner.lock().unwrap().most_advanced_standby = Some(standby);
    }

    pub fn set_sync_expression(&self, expression: &str) {
        self.inner.lock().unwrap().sync_expression = expression.to_string();
    }

    pub fn reports(&self) -> Vec<NodeActiveReport> {
        self.inner.lock().unwrap().reports.clone()
    }

    pub fn published_system_identifier(&self) -> Option<u64> {
        self.inner.lock().unwrap().published_system_identifier
    }
}

#[async_trait::async_trait]
impl MonitorClient for FakeMonitor {
    async fn node_active(&self, report: &NodeActiveReport) -> Result<AssignedState, MonitorError> {
        let mut sim = self.inner.lock().unwrap();
        if !sim.reachable {
            return Err(MonitorError::Unreachable("connection refused".to_string()));
        }
        sim.reports.push(report.clone());
        let role = sim.assignments.pop_front().unwrap_or(sim.last_assignment);
        Ok(AssignedState {
            node_id: sim.node_id,
            group_id: sim.group_id,
            role,
            nodes_version: sim.nodes_version,
        })
    }

    async fn register_node(
        &self,
        _request: &RegistrationRequest,
    ) -> Result<AssignedState, MonitorError> {
        let sim = self.inner.lock().unwrap();
        if !sim.reachable {
            return Err(MonitorError::Unreachable("connection refused".to_string()));
        }
        Ok(AssignedState {
            node_id: sim.node_id,
            group_id: sim.group_id,
            role: sim.last_assignment,
            nodes_version: sim.nodes_version,
        })
    }

    async fn get_peer_nodes(
        &self,
        _formation: &str,
        _group_id: i32,
    ) -> Result<Vec<PeerNode>, MonitorError> {
        let sim = self.inner.lock().unwrap();
        if !sim.reachable {
            return Err(MonitorError::Unreachable("connection refused".to_string()));
        }
        Ok(sim.peers.clone())
    }

    async fn get_primary(
        &self,
        _formation: &str,
        _group_id: i32,
    ) -> Result<PeerNode, MonitorError> {
        let sim = self.inner.lock().unwrap();
        if !sim.reachable {
            return Err(MonitorError::Unreachable("connection refused".to_string()));
        }
        sim.primary
            .clone()
            .ok_or_else(|| MonitorError::Protocol("group has no primary".to_string()))
    }

    async fn get_most_advanced_standby(
        &self,
        _formation: &str,
        _group_id: i32,
    ) -> Result<PeerNode, MonitorError> {
        let sim = self.inner.lock().unwrap();
        if !sim.reachable {
            return Err(MonitorError::Unreachable("connection refused".to_string()));
        }
        sim.most_advanced_standby
            .clone()
            .ok_or_else(|| MonitorError::Protocol("no standby has reported".to_string()))
    }

    async fn synchronous_standby_expression(
        &self,
        _formation: &str,
        _group_id: i32,
    ) -> Result<String, MonitorError> {
        let sim = self.inner.lock().unwrap();
        if !sim.reachable {
            return Err(MonitorError::Unreachable("connection refused".to_string()));
        }
        Ok(sim.sync_expression.clone())
    }

    async fn set_node_system_identifier(
        &self,
        _node_id: i64,
        system_identifier: u64,
    ) -> Result<(), MonitorError> {
        let mut sim = self.inner.lock().unwrap();
        if !sim.reachable {
            return Err(MonitorError::Unreachable("connection refused".to_string()));
        }
        sim.published_system_identifier = Some(system_identifier);
        Ok(())
    }
}
