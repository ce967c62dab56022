mod engine;
mod node_state;
mod table;
mod transitions;

pub use engine::{reach_assigned_state, TransitionError};
pub use node_state::{MatchState, NodeState, ParseNodeStateError, ALL_NODE_STATES};
pub use table::{
    find_transition, reachable_states, render_graphviz, Transition, TransitionStep, KEEPER_FSM,
};
