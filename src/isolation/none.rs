//! Agents on the engine's own thread.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use tracing::{instrument, warn};

use super::{active_agent, call_agent, checked_record, child_seeds, Isolator};
use crate::action::{Action, ActionRecord, AgentAction};
use crate::agent::{Agent, AgentIndex, AgentInfo, AgentRegistry};
use crate::game_state::GameState;
use crate::rng::GameRng;

/// No isolation at all: the fastest backend, and the least protective.
///
/// Errors and panics raised by agents are caught and turned into crash records. An
/// agent cannot be timed out, and can reach anything the engine can.
pub struct NoneIsolator<S: GameState> {
    registry: Arc<AgentRegistry<S>>,
    agents: BTreeMap<AgentIndex, Box<dyn Agent<S>>>,
}

impl<S: GameState> NoneIsolator<S> {
    /// An isolator building its agents from `registry`.
    pub fn new(registry: Arc<AgentRegistry<S>>) -> Self {
        Self {
            registry,
            agents: BTreeMap::new(),
        }
    }
}

impl<S: GameState> std::fmt::Debug for NoneIsolator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoneIsolator")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<S: GameState> Isolator<S> for NoneIsolator<S> {
    fn init_agents(&mut self, agent_infos: &BTreeMap<AgentIndex, AgentInfo>) -> anyhow::Result<()> {
        self.agents.clear();
        for (agent_index, agent_info) in agent_infos {
            let agent = self
                .registry
                .create(agent_info)
                .with_context(|| format!("could not build agent {agent_index} ('{}')", agent_info.name))?;
            self.agents.insert(*agent_index, agent);
        }
        Ok(())
    }

    #[instrument(skip_all)]
    fn game_start(
        &mut self,
        rng: &mut GameRng,
        initial_state: &S,
    ) -> anyhow::Result<BTreeMap<AgentIndex, AgentAction>> {
        let seeds = child_seeds(rng, self.agents.keys().copied().collect::<Vec<_>>());
        let mut responses = BTreeMap::new();
        for (agent_index, agent) in &mut self.agents {
            let seed = seeds[agent_index];
            match call_agent(|| agent.game_start(*agent_index, seed, initial_state)) {
                Ok(Some(info)) => {
                    responses.insert(*agent_index, info);
                }
                Ok(None) => {}
                Err(e) => warn!(agent = agent_index, "agent failed to start: {e:#}"),
            }
        }
        Ok(responses)
    }

    fn get_action(&mut self, state: &S, user_inputs: &[Action]) -> anyhow::Result<ActionRecord> {
        let agent_index = active_agent(state)?;
        let agent = self
            .agents
            .get_mut(&agent_index)
            .ok_or_else(|| anyhow!("no agent with index {agent_index}"))?;

        let start = Instant::now();
        let result = call_agent(|| agent.get_action_full(state, user_inputs));
        let duration = start.elapsed();

        Ok(checked_record(state, agent_index, result, duration))
    }

    fn game_complete(&mut self, final_state: &S) {
        for (agent_index, agent) in &mut self.agents {
            if let Err(e) = call_agent(|| agent.game_complete(final_state)) {
                warn!(agent = agent_index, "agent failed to complete: {e:#}");
            }
        }
    }

    fn close(&mut self) {
        self.agents.clear();
    }
}
