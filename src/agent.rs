//! Agents, their construction data, and the registry that builds them by name.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::{Action, AgentAction};
use crate::error::EngineError;
use crate::game_state::GameState;

/// The game's identifier for an agent.
pub type AgentIndex = usize;

/// Move delay used when none is given.
pub const DEFAULT_MOVE_DELAY: u32 = 100;

/// A pluggable decision maker.
///
/// Every method may fail; the isolator running the agent turns failures (errors as well
/// as panics) into crash records, so agents never need to guard themselves.
pub trait Agent<S: GameState>: Send {
    /// Choose an action for the given state.
    ///
    /// The state is a snapshot owned by the engine: it is the source of truth, and
    /// agents only ever get a shared reference to it.
    fn get_action(&mut self, state: &S, user_inputs: &[Action]) -> anyhow::Result<Action>;

    /// Like [`get_action`](Agent::get_action), with room for highlights and extra data.
    fn get_action_full(&mut self, state: &S, user_inputs: &[Action]) -> anyhow::Result<AgentAction> {
        self.get_action(state, user_inputs).map(AgentAction::new)
    }

    /// The game is about to start. Any precomputation belongs here.
    ///
    /// An agent may answer with highlights or extra data (e.g. values it computed);
    /// the game gets them through [`GameState::agents_game_start`]. The action part of
    /// the answer is ignored.
    fn game_start(
        &mut self,
        _agent_index: AgentIndex,
        _seed: u64,
        _initial_state: &S,
    ) -> anyhow::Result<Option<AgentAction>> {
        Ok(None)
    }

    /// The game is over.
    fn game_complete(&mut self, _final_state: &S) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything needed to build an agent.
///
/// The engine only reads `move_delay`; `extra_arguments` are for the agent itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Registry key of the agent implementation.
    pub name: String,
    /// Relative slowness of the agent. Lower moves more often.
    #[serde(default = "default_move_delay")]
    pub move_delay: u32,
    /// Agent-specific parameters.
    #[serde(default)]
    pub extra_arguments: serde_json::Map<String, serde_json::Value>,
}

fn default_move_delay() -> u32 {
    DEFAULT_MOVE_DELAY
}

impl AgentInfo {
    /// Agent info with the default move delay.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            move_delay: DEFAULT_MOVE_DELAY,
            extra_arguments: serde_json::Map::new(),
        }
    }

    /// Set the move delay.
    #[must_use]
    pub fn with_move_delay(mut self, move_delay: u32) -> Self {
        self.move_delay = move_delay;
        self
    }

    /// Add an extra argument.
    #[must_use]
    pub fn with_arg(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.set(key, value.into());
        self
    }

    /// Set a field by name. `name` and `move_delay` go to their fields, the rest is an
    /// extra argument. Values given as strings are accepted for the move delay.
    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        match key {
            "name" => {
                self.name = match value {
                    serde_json::Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                };
            }
            "move_delay" => {
                let parsed = match &value {
                    serde_json::Value::Number(n) => n.as_u64(),
                    serde_json::Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                // unparsable delays become 0 and are rejected by validate()
                self.move_delay = parsed.and_then(|d| u32::try_from(d).ok()).unwrap_or(0);
            }
            _ => {
                self.extra_arguments.insert(key.to_string(), value);
            }
        }
    }

    /// Take the name and delay of `other` and merge its extra arguments into ours.
    pub fn update(&mut self, other: &AgentInfo) {
        self.name.clone_from(&other.name);
        self.move_delay = other.move_delay;
        for (key, value) in &other.extra_arguments {
            self.extra_arguments.insert(key.clone(), value.clone());
        }
    }

    /// Check the fields the engine relies on.
    pub fn validate(&self, agent_index: AgentIndex) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::EmptyAgentName);
        }
        if self.move_delay == 0 {
            return Err(EngineError::InvalidMoveDelay { agent_index });
        }
        Ok(())
    }

    /// An extra argument, if present.
    pub fn arg(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra_arguments.get(key)
    }
}

/// Validate a whole roster: non-empty, and every entry valid.
pub fn validate_roster(agent_infos: &BTreeMap<AgentIndex, AgentInfo>) -> Result<(), EngineError> {
    if agent_infos.is_empty() {
        return Err(EngineError::NoAgents);
    }
    for (agent_index, info) in agent_infos {
        info.validate(*agent_index)?;
    }
    Ok(())
}

/// Builds an agent from its info.
pub type AgentConstructor<S> =
    Box<dyn Fn(&AgentInfo) -> anyhow::Result<Box<dyn Agent<S>>> + Send + Sync>;

/// Maps stable names to agent constructors.
///
/// Names are resolved once, when a game sets its agents up.
pub struct AgentRegistry<S: GameState> {
    constructors: BTreeMap<String, AgentConstructor<S>>,
}

impl<S: GameState> AgentRegistry<S> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&AgentInfo) -> anyhow::Result<Box<dyn Agent<S>>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Box::new(constructor));
    }

    /// Builder flavor of [`register`](Self::register).
    #[must_use]
    pub fn with<F>(mut self, name: &str, constructor: F) -> Self
    where
        F: Fn(&AgentInfo) -> anyhow::Result<Box<dyn Agent<S>>> + Send + Sync + 'static,
    {
        self.register(name, constructor);
        self
    }

    /// Whether a constructor is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Build the agent described by `info`.
    ///
    /// # Errors
    /// [`EngineError::UnknownAgent`] when the name is not registered, or whatever the
    /// constructor reports (e.g. malformed extra arguments).
    pub fn create(&self, info: &AgentInfo) -> anyhow::Result<Box<dyn Agent<S>>> {
        let constructor = self
            .constructors
            .get(&info.name)
            .ok_or_else(|| EngineError::UnknownAgent(info.name.clone()))?;
        constructor(info)
    }
}

impl<S: GameState> Default for AgentRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: GameState> fmt::Debug for AgentRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("names", &self.names())
            .finish()
    }
}
