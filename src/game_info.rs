//! Everything needed to set a game up, besides the initial state.

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::agent::{validate_roster, AgentIndex, AgentInfo};
use crate::error::EngineError;
use crate::isolation::IsolationLevel;
use crate::rng::GameRng;

/// Seed, roster and budgets of one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameInfo {
    /// Seed of the game's RNG.
    pub seed: u64,
    /// Agents, by index.
    pub agent_infos: BTreeMap<AgentIndex, AgentInfo>,
    /// Where the agents run.
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Turns to play at most. `None` plays until the game ends.
    #[serde(default)]
    pub max_turns: Option<u64>,
}

impl GameInfo {
    /// A game with `agent_infos`, unbounded and without isolation.
    pub fn new(seed: u64, agent_infos: BTreeMap<AgentIndex, AgentInfo>) -> Self {
        Self {
            seed,
            agent_infos,
            isolation_level: IsolationLevel::None,
            max_turns: None,
        }
    }

    /// Builder: run the agents at `isolation_level`.
    #[must_use]
    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    /// Builder: stop after `max_turns` turns.
    #[must_use]
    pub fn with_max_turns(mut self, max_turns: u64) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    /// Check the roster. Run before any agent is built.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_roster(&self.agent_infos)
    }

    /// `count` copies of this game, each with its own seed drawn from this game's seed.
    ///
    /// The same info always yields the same series.
    pub fn series(&self, count: usize) -> Vec<GameInfo> {
        let mut master = GameRng::new(self.seed);
        (0..count)
            .map(|_| GameInfo {
                seed: master.next_u64(),
                ..self.clone()
            })
            .collect()
    }
}
