//! The boundary between the engine and agent code.
//!
//! An [`Isolator`] owns the agents of one game and mediates every call to them. Whatever
//! an agent does (return an error, panic, hang, exit, send garbage), the engine only ever
//! sees a well-formed [`ActionRecord`]: either a real decision, or a crash record carrying
//! a safe default action.
//!
//! Three backends are available, selected by [`IsolationLevel`]:
//! - [`NoneIsolator`]: agents run on the engine's thread. Errors and panics are caught,
//!   but an agent that never returns blocks the game.
//! - [`ProcessIsolator`]: one worker process per agent, spoken to over its stdin/stdout.
//! - [`TcpIsolator`]: same protocol over TCP, with workers connecting to the engine.
//!
//! See [`protocol`] for the messages used by the last two.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::action::{Action, ActionRecord, AgentAction, STOP};
use crate::agent::{AgentIndex, AgentInfo, AgentRegistry};
use crate::cgroup_manager::LimitedProcess;
use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::game_state::GameState;
use crate::rng::GameRng;

mod channel;
pub mod none;
pub mod process;
pub mod protocol;
pub mod tcp;
pub mod worker;

pub use none::NoneIsolator;
pub use process::ProcessIsolator;
pub use tcp::TcpIsolator;

/// Runs the agents of one game.
pub trait Isolator<S: GameState>: Send {
    /// Instantiate (or connect) every agent.
    ///
    /// # Errors
    /// When an agent cannot be built or reached. This happens before any turn is played.
    fn init_agents(&mut self, agent_infos: &BTreeMap<AgentIndex, AgentInfo>) -> anyhow::Result<()>;

    /// Tell every agent the game starts, each with its own seed forked from `rng`.
    ///
    /// Returns what agents answered while starting. Agents failing to start are logged
    /// and left out.
    fn game_start(
        &mut self,
        rng: &mut GameRng,
        initial_state: &S,
    ) -> anyhow::Result<BTreeMap<AgentIndex, AgentAction>>;

    /// Ask the state's active agent for an action.
    ///
    /// Agent failures are never errors: they produce a crashed record.
    ///
    /// # Errors
    /// Only when the engine itself is at fault (no active agent, unknown agent index).
    fn get_action(&mut self, state: &S, user_inputs: &[Action]) -> anyhow::Result<ActionRecord>;

    /// Tell every agent the game is over. Best effort: failures are logged.
    fn game_complete(&mut self, final_state: &S);

    /// Release every resource. Safe to call more than once.
    fn close(&mut self);
}

/// How agents are separated from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Same thread as the engine.
    #[default]
    None,
    /// One worker process per agent.
    Process,
    /// Workers connected over TCP.
    Tcp,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationLevel::None => "none",
            IsolationLevel::Process => "process",
            IsolationLevel::Tcp => "tcp",
        })
    }
}

impl FromStr for IsolationLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(IsolationLevel::None),
            "process" => Ok(IsolationLevel::Process),
            "tcp" => Ok(IsolationLevel::Tcp),
            other => Err(anyhow!("unknown isolation level '{other}'")),
        }
    }
}

impl IsolationLevel {
    /// Build the isolator for this level.
    ///
    /// The registry is only used by `None`; the other levels rely on the worker
    /// program set in the configuration.
    pub fn build<S: GameState>(
        self,
        registry: Arc<AgentRegistry<S>>,
        config: &Configuration,
        constraints: &Constraints,
    ) -> anyhow::Result<Box<dyn Isolator<S>>> {
        Ok(match self {
            IsolationLevel::None => Box::new(NoneIsolator::new(registry)),
            IsolationLevel::Process => {
                Box::new(ProcessIsolator::new(config.clone(), constraints.clone())?)
            }
            IsolationLevel::Tcp => Box::new(TcpIsolator::new(config.clone(), constraints.clone())),
        })
    }
}

/// One seed per agent, each from its own fork of `rng`.
///
/// Forking leaves the game stream untouched, so the game's own randomness does not
/// depend on how many agents there are.
pub(crate) fn child_seeds(
    rng: &mut GameRng,
    agent_indexes: impl IntoIterator<Item = AgentIndex>,
) -> BTreeMap<AgentIndex, u64> {
    agent_indexes
        .into_iter()
        .map(|agent_index| (agent_index, rng.fork().seed()))
        .collect()
}

/// The action played for an agent that crashed: `STOP` when legal, else the first legal
/// action.
pub fn safe_default<S: GameState>(state: &S) -> Action {
    let legal = state.get_legal_actions();
    if legal.contains(&STOP) {
        STOP
    } else {
        legal.into_iter().next().unwrap_or(STOP)
    }
}

/// The record the engine plays for what an agent answered.
///
/// `duration` is the isolator's own measure of the call. A failed call, or an action
/// the state does not allow, becomes a crash record carrying the safe default.
pub(crate) fn checked_record<S: GameState>(
    state: &S,
    agent_index: AgentIndex,
    answer: anyhow::Result<AgentAction>,
    duration: Duration,
) -> ActionRecord {
    match answer {
        Ok(response) if state.get_legal_actions().contains(&response.action) => {
            ActionRecord::answered(agent_index, response, duration)
        }
        Ok(response) => {
            warn!(agent = agent_index, action = %response.action, "agent chose an illegal action");
            ActionRecord::crash(agent_index, safe_default(state), duration)
        }
        Err(e) => {
            warn!(agent = agent_index, "agent crashed: {e:#}");
            ActionRecord::crash(agent_index, safe_default(state), duration)
        }
    }
}

/// The answer inside a record sent back by a worker hosting `agent_index`.
pub(crate) fn worker_answer(
    agent_index: AgentIndex,
    record: anyhow::Result<ActionRecord>,
) -> anyhow::Result<AgentAction> {
    let record = record?;
    if record.agent_index() != agent_index {
        bail!("worker answered for agent {}", record.agent_index());
    }
    if record.crashed() {
        bail!("agent crashed in its worker");
    }
    Ok(record.into_response())
}

/// Run agent code, turning panics into errors.
pub(crate) fn call_agent<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(anyhow!("agent panicked: {message}"))
        }
    }
}

/// Start the worker program, in a cgroup when the constraints ask for limits.
pub(crate) fn spawn_worker(
    config: &Configuration,
    constraints: &Constraints,
    extra_args: &[String],
) -> anyhow::Result<LimitedProcess> {
    let (program, args) = config
        .worker_command
        .as_ref()
        .context("no worker command configured")?;
    let args: Vec<String> = args.iter().chain(extra_args).cloned().collect();
    spawn(program, &args, config, constraints)
}

fn spawn(
    program: &Path,
    args: &[String],
    config: &Configuration,
    constraints: &Constraints,
) -> anyhow::Result<LimitedProcess> {
    if !constraints.needs_container() {
        return LimitedProcess::launch_without_container(program, args, config.debug_agent_stderr);
    }
    let max_memory = constraints
        .agent_ram
        .map(|bytes| i64::try_from(bytes).unwrap_or(i64::MAX))
        .unwrap_or(0);
    match LimitedProcess::launch(
        program,
        args,
        max_memory,
        &constraints.cpus_string(),
        config.debug_agent_stderr,
    ) {
        Ok(process) => Ok(process),
        Err(e) if config.allow_uncontained => {
            warn!("could not contain worker, running it without limits: {e:#}");
            LimitedProcess::launch_without_container(program, args, config.debug_agent_stderr)
        }
        Err(e) => Err(e.context(
            "could not contain worker (allow uncontained workers to run anyway)",
        )),
    }
}

/// The active agent of `state`, or an error.
pub(crate) fn active_agent<S: GameState>(state: &S) -> anyhow::Result<AgentIndex> {
    match state.core().agent_index() {
        Some(agent_index) => Ok(agent_index),
        None => bail!(crate::error::EngineError::NoActiveAgent),
    }
}
