mod monitor;
mod pgctl;
mod sql;

pub use monitor::{
    AssignedState, MonitorClient, MonitorError, NodeActiveReport, PeerNode, RegistrationRequest,
};
pub use pgctl::{DatabaseControl, DatabaseControlError, DatabaseMetadata, UpstreamNode};
pub use sql::{ReplicationStatus, SqlClient, SqlError, StandbyConnection};
