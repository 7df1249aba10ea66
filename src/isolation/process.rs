//! One worker process per agent.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tracing::{debug, info, instrument, warn};

use super::channel::AgentChannel;
use super::protocol::Command;
use super::{active_agent, checked_record, child_seeds, spawn_worker, worker_answer, Isolator};
use crate::action::{Action, ActionRecord, AgentAction};
use crate::agent::{AgentIndex, AgentInfo};
use crate::cgroup_manager::{LimitedProcess, ShutdownBudgets, ShutdownStage};
use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::game_state::GameState;
use crate::rng::GameRng;

#[derive(Debug)]
struct Worker {
    process: LimitedProcess,
    channel: AgentChannel,
}

/// Runs every agent in its own worker process.
///
/// Commands go to the worker's stdin, results come back on its stdout. Agents cannot
/// touch the engine's memory, and an unresponsive worker is timed out. With memory or
/// CPU limits in the [`Constraints`], workers run in their own cgroup (Linux only).
///
/// Workers are shut down on [`close`](Isolator::close), or on drop.
#[derive(Debug)]
pub struct ProcessIsolator<S> {
    config: Configuration,
    constraints: Constraints,
    workers: BTreeMap<AgentIndex, Worker>,
    _state: PhantomData<fn() -> S>,
}

impl<S: GameState> ProcessIsolator<S> {
    /// A process isolator launching the configured worker command.
    ///
    /// # Errors
    /// When no worker command is configured.
    pub fn new(config: Configuration, constraints: Constraints) -> anyhow::Result<Self> {
        if config.worker_command.is_none() {
            bail!("the process isolator needs a worker command");
        }
        Ok(Self {
            config,
            constraints,
            workers: BTreeMap::new(),
            _state: PhantomData,
        })
    }

    fn launch(&self, agent_index: AgentIndex, agent_info: &AgentInfo) -> anyhow::Result<Worker> {
        let mut process = spawn_worker(&self.config, &self.constraints, &[])?;
        let (stdin, stdout) = process
            .take_stdio()
            .context("worker has no stdin/stdout")?;
        let channel = AgentChannel::new(agent_index, stdout, stdin)?;
        debug!(
            agent = agent_index,
            pid = process.id(),
            contained = process.is_contained(),
            "worker launched"
        );

        let mut worker = Worker { process, channel };
        if let Err(e) = worker.channel.init(agent_info, self.constraints.start_timeout) {
            shutdown_worker(agent_index, &mut worker, &self.constraints);
            return Err(e);
        }
        Ok(worker)
    }
}

fn shutdown_worker(agent_index: AgentIndex, worker: &mut Worker, constraints: &Constraints) {
    let budgets = ShutdownBudgets::from_constraints(constraints);
    worker.channel.close_writer();
    worker.channel.drain(budgets.join);
    let stage = worker.process.shutdown(&budgets);
    match stage {
        ShutdownStage::Exited => debug!(agent = agent_index, "worker exited"),
        stage => warn!(agent = agent_index, ?stage, "worker could not be stopped"),
    }
}

impl<S: GameState> Isolator<S> for ProcessIsolator<S> {
    #[instrument(skip_all)]
    fn init_agents(&mut self, agent_infos: &BTreeMap<AgentIndex, AgentInfo>) -> anyhow::Result<()> {
        self.close();
        for (agent_index, agent_info) in agent_infos {
            let worker = self
                .launch(*agent_index, agent_info)
                .with_context(|| format!("could not set up agent {agent_index} ('{}')", agent_info.name))?;
            self.workers.insert(*agent_index, worker);
        }
        info!(workers = self.workers.len(), "agents ready");
        Ok(())
    }

    #[instrument(skip_all)]
    fn game_start(
        &mut self,
        rng: &mut GameRng,
        initial_state: &S,
    ) -> anyhow::Result<BTreeMap<AgentIndex, AgentAction>> {
        let seeds = child_seeds(rng, self.workers.keys().copied().collect::<Vec<_>>());

        // post every start first, then collect the acknowledgements
        for (agent_index, worker) in &mut self.workers {
            let command = Command::Start {
                agent_index: *agent_index,
                seed: seeds[agent_index],
                initial_state,
            };
            if let Err(e) = worker.channel.send(&command) {
                warn!(agent = agent_index, "could not start agent: {e:#}");
            }
        }

        let deadline = Instant::now() + self.constraints.start_timeout;
        let mut responses = BTreeMap::new();
        for (agent_index, worker) in &mut self.workers {
            if worker.channel.is_dead() {
                continue;
            }
            match worker.channel.await_started(deadline) {
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
        let worker = self
            .workers
            .get_mut(&agent_index)
            .with_context(|| format!("no agent with index {agent_index}"))?;

        let start = Instant::now();
        let result = worker
            .channel
            .request_action(state, user_inputs, self.constraints.action_timeout);
        let duration = start.elapsed();

        let answer = worker_answer(agent_index, result);
        Ok(checked_record(state, agent_index, answer, duration))
    }

    fn game_complete(&mut self, final_state: &S) {
        for (agent_index, worker) in &mut self.workers {
            if worker.channel.is_dead() {
                continue;
            }
            if let Err(e) = worker
                .channel
                .complete(final_state, self.constraints.complete_timeout)
            {
                warn!(agent = agent_index, "agent failed to complete: {e:#}");
            }
        }
    }

    fn close(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        for (agent_index, mut worker) in workers {
            shutdown_worker(agent_index, &mut worker, &self.constraints);
        }
    }
}

impl<S> Drop for ProcessIsolator<S> {
    fn drop(&mut self) {
        let budgets = ShutdownBudgets {
            join: Duration::ZERO,
            ..ShutdownBudgets::from_constraints(&self.constraints)
        };
        for (_, mut worker) in std::mem::take(&mut self.workers) {
            worker.channel.close_writer();
            worker.channel.drain(Duration::ZERO);
            worker.process.shutdown(&budgets);
        }
    }
}
