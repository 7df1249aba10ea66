//! The game state contract every concrete game implements.
//!
//! A concrete game keeps its own fields next to a [`StateCore`] (board, active agent,
//! scheduling data, score, turn count) and implements the rule hooks of [`GameState`].
//! The turn protocol itself (legality check, bookkeeping, ticket advance) is provided by
//! the trait and is the same for every game:
//!
//! ```text
//! IDLE -> ACTIVE (select_next_agent) -> TRANSITIONED (process_turn)
//!      -> BOOKKEEPING (end_turn) -> IDLE | TERMINAL (game_over)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::action::{Action, AgentAction, STOP};
use crate::agent::{AgentIndex, AgentInfo};
use crate::board::{Board, Position};
use crate::error::EngineError;
use crate::rng::GameRng;
use crate::ticket::{self, Ticket};

/// Data shared by all games.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateCore<B> {
    board: B,
    agent_index: Option<AgentIndex>,
    /// The game reached its end.
    pub game_over: bool,
    /// The game was cut short by the engine's turn or time budget.
    pub timeout: bool,
    /// Current score. Games decide what it means.
    pub score: i64,
    turn_count: u64,
    move_delays: BTreeMap<AgentIndex, u32>,
    tickets: BTreeMap<AgentIndex, Ticket>,
    last_actions: BTreeMap<AgentIndex, Action>,
}

impl<B: Board> StateCore<B> {
    /// A fresh core for the given roster. Tickets are issued by [`GameState::game_start`].
    pub fn new(board: B, agent_infos: &BTreeMap<AgentIndex, AgentInfo>) -> Self {
        let move_delays = agent_infos
            .iter()
            .map(|(agent_index, info)| (*agent_index, info.move_delay))
            .collect();
        Self::with_move_delays(board, move_delays)
    }

    /// A fresh core from explicit move delays.
    pub fn with_move_delays(board: B, move_delays: BTreeMap<AgentIndex, u32>) -> Self {
        Self {
            board,
            agent_index: None,
            game_over: false,
            timeout: false,
            score: 0,
            turn_count: 0,
            move_delays,
            tickets: BTreeMap::new(),
            last_actions: BTreeMap::new(),
        }
    }

    /// The board.
    pub fn board(&self) -> &B {
        &self.board
    }

    /// Mutable board, for a game's own rules.
    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    /// The agent whose turn it is, `None` between turns.
    pub fn agent_index(&self) -> Option<AgentIndex> {
        self.agent_index
    }

    /// Completed turns.
    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    /// Every agent's move delay.
    pub fn move_delays(&self) -> &BTreeMap<AgentIndex, u32> {
        &self.move_delays
    }

    /// Every agent's ticket (empty before the game starts).
    pub fn tickets(&self) -> &BTreeMap<AgentIndex, Ticket> {
        &self.tickets
    }

    /// Agents taking part in the game.
    pub fn agent_indexes(&self) -> Vec<AgentIndex> {
        self.move_delays.keys().copied().collect()
    }

    /// The last action an agent made, if it moved at all.
    pub fn last_action(&self, agent_index: AgentIndex) -> Option<&Action> {
        self.last_actions.get(&agent_index)
    }

    /// Position of the active agent.
    pub fn get_agent_position(&self) -> Option<Position> {
        self.agent_index
            .and_then(|agent_index| self.board.get_agent_position(agent_index))
    }

    /// STOP, plus every move the board allows from the active agent's position.
    ///
    /// An agent that is not on the board (or no active agent) can only stop.
    pub fn default_legal_actions(&self) -> Vec<Action> {
        let mut actions = vec![STOP];
        if let Some(position) = self.get_agent_position() {
            actions.extend(
                self.board
                    .get_legal_neighbors(position)
                    .into_iter()
                    .map(|(action, _)| action),
            );
        }
        actions
    }
}

/// What a concrete game must provide to be driven by the engine loop.
///
/// Required: access to the [`StateCore`], the game's rule for applying an action, and
/// the winner computation. Everything else has a default.
pub trait GameState: Clone + Debug + Send + Serialize + DeserializeOwned + 'static {
    /// The board type of this game.
    type Board: Board;

    /// Shared state.
    fn core(&self) -> &StateCore<Self::Board>;

    /// Mutable shared state.
    fn core_mut(&mut self) -> &mut StateCore<Self::Board>;

    /// Apply a legal action for the active agent (board, score, `game_over`).
    ///
    /// Bookkeeping (last action, turn count, tickets) is done by the caller.
    fn apply_action(&mut self, action: &Action, rng: &mut GameRng);

    /// Called once after the game loop exits. Returns the winners (empty for none/draw).
    fn game_complete(&mut self) -> BTreeSet<AgentIndex>;

    /// Actions the active agent may take. Must never be empty.
    fn get_legal_actions(&self) -> Vec<Action> {
        self.core().default_legal_actions()
    }

    /// An agent crashed. By default the game ends.
    fn process_agent_crash(&mut self, _agent_index: AgentIndex) {
        self.core_mut().game_over = true;
    }

    /// The engine's budget ran out before the game ended.
    fn process_game_timeout(&mut self) {
        let core = self.core_mut();
        core.game_over = true;
        core.timeout = true;
    }

    /// Agents finished starting; `responses` holds what each of them sent back.
    fn agents_game_start(&mut self, _responses: &BTreeMap<AgentIndex, AgentAction>) {}

    /// Whether the game has ended.
    fn check_end(&self) -> bool {
        self.core().game_over
    }

    /// Issue every agent its first ticket and select the first agent.
    fn game_start(&mut self) -> Result<AgentIndex, EngineError> {
        let core = self.core_mut();
        if core.move_delays.is_empty() {
            return Err(EngineError::NoAgents);
        }
        if let Some((agent_index, _)) = core.move_delays.iter().find(|(_, delay)| **delay == 0) {
            return Err(EngineError::InvalidMoveDelay {
                agent_index: *agent_index,
            });
        }
        core.tickets = core
            .move_delays
            .iter()
            .map(|(agent_index, delay)| (*agent_index, Ticket::initial(*delay)))
            .collect();
        self.select_next_agent()
    }

    /// Mark the agent with the smallest ticket active.
    fn select_next_agent(&mut self) -> Result<AgentIndex, EngineError> {
        let core = self.core_mut();
        let agent_index = ticket::select_next(&core.tickets).ok_or(EngineError::NoAgents)?;
        core.agent_index = Some(agent_index);
        Ok(agent_index)
    }

    /// Play `action` for the active agent.
    ///
    /// # Errors
    /// - [`EngineError::GameOver`] on a finished game,
    /// - [`EngineError::NoActiveAgent`] when no agent is selected,
    /// - [`EngineError::IllegalAction`] when the action is not legal right now.
    ///
    /// Nothing is modified when an error is returned.
    fn process_turn(&mut self, action: &Action, rng: &mut GameRng) -> Result<(), EngineError> {
        if self.core().game_over {
            return Err(EngineError::GameOver);
        }
        let agent_index = self.core().agent_index.ok_or(EngineError::NoActiveAgent)?;
        if !self.get_legal_actions().contains(action) {
            return Err(EngineError::IllegalAction {
                agent_index,
                action: action.clone(),
            });
        }

        self.apply_action(action, rng);

        let core = self.core_mut();
        core.last_actions.insert(agent_index, action.clone());
        core.turn_count += 1;
        Ok(())
    }

    /// Give the active agent its next ticket and clear the active marker.
    fn end_turn(&mut self) -> Result<AgentIndex, EngineError> {
        let core = self.core_mut();
        let agent_index = core.agent_index.take().ok_or(EngineError::NoActiveAgent)?;
        if let (Some(delay), Some(ticket)) = (
            core.move_delays.get(&agent_index),
            core.tickets.get_mut(&agent_index),
        ) {
            *ticket = ticket.next(*delay);
        }
        Ok(agent_index)
    }

    /// An independent copy with `action` played and the next agent selected.
    ///
    /// The copy shares nothing mutable with `self`.
    fn generate_successor(&self, action: &Action, rng: &mut GameRng) -> Result<Self, EngineError> {
        let mut successor = self.clone();
        successor.process_turn(action, rng)?;
        successor.end_turn()?;
        if !successor.check_end() {
            successor.select_next_agent()?;
        }
        Ok(successor)
    }
}
