use crate::capability::{DatabaseControlError, MonitorError, SqlError};
use crate::fsm::node_state::NodeState;
use crate::fsm::table;
use crate::keeper::Keeper;
use crate::lsn::Lsn;
use crate::state_store::StateStoreError;

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The monitor assigned a state we have no edge for. A protocol
    /// mismatch between keeper and monitor; no local progress is possible
    /// until the monitor corrects itself or an operator intervenes.
    #[error("no transition from \"{current}\" to \"{assigned}\"")]
    Undefined {
        current: NodeState,
        assigned: NodeState,
    },
    #[error(transparent)]
    DatabaseControl(#[from] DatabaseControlError),
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Store(#[from] StateStoreError),
    #[error("initialization state is missing or inconsistent: {0}")]
    Init(String),
    /// Synchronous replication is configured but no standby has confirmed
    /// our WAL position yet; the edge retries on a later tick.
    #[error("no standby has confirmed WAL up to {target} yet")]
    StandbyNotCaughtUp { target: Lsn },
}

/// Drive the node from its current role to `assigned`. Returns whether a
/// transition actually ran: `current == assigned` is an immediate no-op.
///
/// On success the current role is advanced in memory only; the caller owns
/// persistence. On failure the current role is untouched and the same edge
/// is retried on a later tick (every step is idempotent, so retrying from
/// scratch is always safe).
pub async fn reach_assigned_state(
    keeper: &mut Keeper,
    assigned: NodeState,
) -> Result<bool, TransitionError> {
    let current = keeper.state.current_role;
    if current == assigned {
        return Ok(false);
    }

    let transition = table::find_transition(current, assigned).ok_or(
        TransitionError::Undefined { current, assigned },
    )?;

    slog::info!(keeper.logger, "FSM transition";
        "current" => %current,
        "assigned" => %assigned,
        "rationale" => transition.rationale,
    );

    if let Some(step) = transition.step {
        if let Err(e) = keeper.run_transition_step(step).await {
            slog::error!(keeper.logger, "Transition failed, role unchanged";
                "current" => %current,
                "assigned" => %assigned,
                "error" => %e,
            );
            return Err(e);
        }
    }

    keeper.state.current_role = assigned;
    Ok(true)
}
