//! A small reference game: agents race to a goal cell.
//!
//! The first agent to step on the goal wins and ends the game. Every move that is not
//! `STOP` costs one point. An agent that crashes is taken off the board and can only
//! stop from then on; the game ends once nobody is left.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::action::{Action, STOP};
use crate::agent::{AgentIndex, AgentInfo};
use crate::board::{Board, GridBoard, Position};
use crate::game_state::{GameState, StateCore};
use crate::rng::GameRng;

/// State of a race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceState {
    core: StateCore<GridBoard>,
    goal: Position,
    winner: Option<AgentIndex>,
    crashed: BTreeSet<AgentIndex>,
}

impl RaceState {
    /// A race on `board` towards `goal`.
    pub fn new(board: GridBoard, goal: Position, agent_infos: &BTreeMap<AgentIndex, AgentInfo>) -> Self {
        Self {
            core: StateCore::new(board, agent_infos),
            goal,
            winner: None,
            crashed: BTreeSet::new(),
        }
    }

    /// An empty `height`x`width` field, agents lined up on the first column, goal in
    /// the bottom right corner.
    pub fn open_field(height: i32, width: i32, agent_infos: &BTreeMap<AgentIndex, AgentInfo>) -> Self {
        let board = agent_infos
            .keys()
            .zip(0..)
            .fold(GridBoard::new(height, width), |board, (agent_index, row)| {
                board.with_agent(*agent_index, Position::new(row % height.max(1), 0))
            });
        Self::new(board, Position::new(height - 1, width - 1), agent_infos)
    }

    /// The goal cell.
    pub fn goal(&self) -> Position {
        self.goal
    }

    /// The agent that reached the goal, if any.
    pub fn winner(&self) -> Option<AgentIndex> {
        self.winner
    }

    /// Agents that crashed during the game.
    pub fn crashed(&self) -> &BTreeSet<AgentIndex> {
        &self.crashed
    }

    /// Manhattan distance from the active agent to the goal.
    pub fn distance_to_goal(&self) -> Option<u32> {
        self.core
            .get_agent_position()
            .map(|position| position.manhattan(&self.goal))
    }
}

impl GameState for RaceState {
    type Board = GridBoard;

    fn core(&self) -> &StateCore<GridBoard> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StateCore<GridBoard> {
        &mut self.core
    }

    fn apply_action(&mut self, action: &Action, _rng: &mut GameRng) {
        if *action == STOP {
            return;
        }
        let (Some(agent_index), Some(position)) =
            (self.core.agent_index(), self.core.get_agent_position())
        else {
            return;
        };
        let Some(next) = position.apply(action) else {
            return;
        };

        self.core.board_mut().set_agent_position(agent_index, Some(next));
        self.core.score -= 1;

        if next == self.goal {
            self.winner = Some(agent_index);
            self.core.game_over = true;
        }
    }

    fn game_complete(&mut self) -> BTreeSet<AgentIndex> {
        self.winner.into_iter().collect()
    }

    fn process_agent_crash(&mut self, agent_index: AgentIndex) {
        self.crashed.insert(agent_index);
        self.core.board_mut().set_agent_position(agent_index, None);
        if self
            .core
            .agent_indexes()
            .iter()
            .all(|agent| self.crashed.contains(agent))
        {
            self.core.game_over = true;
        }
    }
}
