mod capability;
mod config;
mod fsm;
mod keeper;
mod liveness;
mod lsn;
mod signals;
mod state_store;
pub mod test_support;

pub use capability::AssignedState;
pub use capability::DatabaseControl;
pub use capability::DatabaseControlError;
pub use capability::DatabaseMetadata;
pub use capability::MonitorClient;
pub use capability::MonitorError;
pub use capability::NodeActiveReport;
pub use capability::PeerNode;
pub use capability::RegistrationRequest;
pub use capability::ReplicationStatus;
pub use capability::SqlClient;
pub use capability::SqlError;
pub use capability::StandbyConnection;
pub use capability::UpstreamNode;
pub use config::replication_slot_name;
pub use config::ConfigError;
pub use config::ConfigLoader;
pub use config::KeeperConfig;
pub use config::KeeperOptions;
pub use fsm::find_transition;
pub use fsm::reachable_states;
pub use fsm::render_graphviz;
pub use fsm::MatchState;
pub use fsm::NodeState;
pub use fsm::Transition;
pub use fsm::TransitionError;
pub use fsm::TransitionStep;
pub use fsm::ALL_NODE_STATES;
pub use keeper::check_network_partition;
pub use keeper::Keeper;
pub use keeper::KeeperError;
pub use keeper::LoopExit;
pub use keeper::PgLocalState;
pub use keeper::TickOutcome;
pub use liveness::LivenessError;
pub use liveness::LivenessMarker;
pub use lsn::Lsn;
pub use lsn::ParseLsnError;
pub use signals::Signals;
pub use state_store::ExpectedPostgresStatus;
pub use state_store::FileStateStore;
pub use state_store::InitMarker;
pub use state_store::InitMarkerFile;
pub use state_store::InitStage;
pub use state_store::KeeperState;
pub use state_store::StateStoreError;
pub use state_store::StatusFileBridge;
pub use state_store::STATE_FORMAT_VERSION;
