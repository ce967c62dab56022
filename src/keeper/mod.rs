mod control_loop;
mod init;
mod keeper;
mod partition;

pub use control_loop::{LoopExit, TickOutcome};
pub use keeper::{Keeper, KeeperError, PgLocalState};
pub use partition::check_network_partition;
