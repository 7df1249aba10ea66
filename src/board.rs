//! Board collaborator.
//!
//! The core treats a board as an opaque positional structure: it only needs legal
//! neighbors, agent positions, and a deep copy (`Clone`). [`GridBoard`] is a plain
//! rectangular implementation used by the reference game.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::action::{Action, CARDINAL_DIRECTIONS};
use crate::agent::AgentIndex;

/// A cell on a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Row, growing southward.
    pub row: i32,
    /// Column, growing eastward.
    pub col: i32,
}

impl Position {
    /// Create a position.
    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    /// The position reached by a cardinal action, `None` for non-moving actions.
    pub fn apply(&self, action: &Action) -> Option<Position> {
        let (dr, dc) = action.offset()?;
        Some(Position::new(self.row + dr, self.col + dc))
    }

    /// Manhattan distance between two positions.
    pub fn manhattan(&self, other: &Position) -> u32 {
        self.row.abs_diff(other.row) + self.col.abs_diff(other.col)
    }
}

/// What the engine core needs from a board.
///
/// A board is owned exclusively by its game state; `Clone` must produce a fully
/// independent copy.
pub trait Board: Clone + Debug + Send + Serialize + DeserializeOwned + 'static {
    /// Moves available from `position`, paired with where they lead.
    fn get_legal_neighbors(&self, position: Position) -> Vec<(Action, Position)>;

    /// Where an agent currently is, `None` when it is not on the board.
    fn get_agent_position(&self, agent_index: AgentIndex) -> Option<Position>;

    /// Place an agent (`Some`) or take it off the board (`None`).
    fn set_agent_position(&mut self, agent_index: AgentIndex, position: Option<Position>);

    /// Agents that have a starting spot on this board.
    fn agent_indexes(&self) -> Vec<AgentIndex>;
}

/// A rectangular grid with walls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridBoard {
    height: i32,
    width: i32,
    walls: BTreeSet<Position>,
    agents: BTreeMap<AgentIndex, Position>,
    initial_positions: BTreeMap<AgentIndex, Position>,
}

impl GridBoard {
    /// An empty (wall-less) grid.
    pub fn new(height: i32, width: i32) -> Self {
        Self {
            height,
            width,
            walls: BTreeSet::new(),
            agents: BTreeMap::new(),
            initial_positions: BTreeMap::new(),
        }
    }

    /// Add a wall.
    #[must_use]
    pub fn with_wall(mut self, position: Position) -> Self {
        self.walls.insert(position);
        self
    }

    /// Add an agent and remember it as its spawn point.
    #[must_use]
    pub fn with_agent(mut self, agent_index: AgentIndex, position: Position) -> Self {
        self.agents.insert(agent_index, position);
        self.initial_positions.insert(agent_index, position);
        self
    }

    /// Grid height.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Grid width.
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Whether the position is inside the grid.
    pub fn in_bounds(&self, position: &Position) -> bool {
        (0..self.height).contains(&position.row) && (0..self.width).contains(&position.col)
    }

    /// Whether the position holds a wall.
    pub fn is_wall(&self, position: &Position) -> bool {
        self.walls.contains(position)
    }

    /// Where an agent started the game.
    pub fn get_agent_initial_position(&self, agent_index: AgentIndex) -> Option<Position> {
        self.initial_positions.get(&agent_index).copied()
    }

    /// The agent standing on `position`, if any.
    pub fn agent_at(&self, position: &Position) -> Option<AgentIndex> {
        self.agents
            .iter()
            .find_map(|(agent, p)| (p == position).then_some(*agent))
    }
}

impl Board for GridBoard {
    fn get_legal_neighbors(&self, position: Position) -> Vec<(Action, Position)> {
        CARDINAL_DIRECTIONS
            .iter()
            .filter_map(|action| {
                let next = position.apply(action)?;
                (self.in_bounds(&next) && !self.is_wall(&next)).then(|| (action.clone(), next))
            })
            .collect()
    }

    fn get_agent_position(&self, agent_index: AgentIndex) -> Option<Position> {
        self.agents.get(&agent_index).copied()
    }

    fn set_agent_position(&mut self, agent_index: AgentIndex, position: Option<Position>) {
        match position {
            Some(position) => {
                self.agents.insert(agent_index, position);
            }
            None => {
                self.agents.remove(&agent_index);
            }
        }
    }

    fn agent_indexes(&self) -> Vec<AgentIndex> {
        self.initial_positions.keys().copied().collect()
    }
}
