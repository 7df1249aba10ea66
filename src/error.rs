//! Errors raised by the engine core.
//!
//! Agent faults are not represented here: the isolators downgrade them to crashed
//! [`ActionRecord`](crate::action::ActionRecord)s. What remains are contract
//! violations that a caller must handle (or that abort a game).

use crate::action::Action;
use crate::agent::AgentIndex;

/// Contract violations detected by the game state, the roster validation or the engine loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The action is not part of the active agent's legal actions.
    #[error("illegal action for agent {agent_index}: '{action}'")]
    IllegalAction {
        /// Agent that tried to move.
        agent_index: AgentIndex,
        /// The rejected action.
        action: Action,
    },

    /// A turn was requested on a state that already reached its end.
    #[error("the game is over, no more turns can be processed")]
    GameOver,

    /// A turn operation needs an active agent but none is selected.
    #[error("game state does not have an active agent")]
    NoActiveAgent,

    /// The agent registry has no constructor under this name.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    /// A game needs at least one agent.
    #[error("no agents provided")]
    NoAgents,

    /// Move delays must be strictly positive.
    #[error("agent {agent_index} has a non-positive move delay")]
    InvalidMoveDelay {
        /// Offending agent.
        agent_index: AgentIndex,
    },

    /// Agent names are registry keys and cannot be blank.
    #[error("agent name cannot be empty")]
    EmptyAgentName,

    /// The state and the game info do not describe the same agents.
    #[error("state agents {state:?} do not match roster {roster:?}")]
    RosterMismatch {
        /// Agents known to the state (through their move delays).
        state: Vec<AgentIndex>,
        /// Agents of the roster.
        roster: Vec<AgentIndex>,
    },

    /// Highlight intensities live in `[0, 1000]` (or `[0.0, 1.0]` before scaling).
    #[error("highlight intensity out of range: {0}")]
    InvalidHighlight(String),
}
