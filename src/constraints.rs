//! Time and resource budgets for agents and games.
//!
//! # Overview
//!
//! The main entry point is the [`ConstraintsBuilder`] struct, which uses a builder pattern
//! to configure limits. These include:
//!
//! - **Per-call budgets**: how long an isolator waits for an agent to choose an action,
//!   to start, to acknowledge the end of the game, or to connect (network backend).
//! - **Shutdown budgets**: how long each stage of the worker shutdown sequence
//!   (graceful join, terminate, kill) may take.
//! - **Game budget**: an optional wall-clock limit for a whole game.
//! - **Memory and CPU**: an optional RAM limit per agent and an optional CPU list, both
//!   enforced with Linux cgroups v2 on worker processes.
//!
//! An expired per-call budget turns into a crashed action record: the game goes on.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use ai_game_engine::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_action_timeout(Duration::from_millis(200))
//!     .with_ram_per_agent(500)
//!     .with_game_time_budget(Duration::from_secs(60))
//!     .build()
//!     .unwrap();
//! ```
//!
//! You may also construct constraints from environment variables using
//! [`ConstraintsBuilder::from_env()`] for runtime configurability.

use std::{collections::BTreeSet, env, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

/// A builder for [`Constraints`].
///
/// Every field is optional; unset fields take the defaults listed on each `with_*`
/// method.
#[derive(Debug, Default, Clone)]
pub struct ConstraintsBuilder {
    action_timeout: Option<Duration>,
    start_timeout: Option<Duration>,
    complete_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    join_timeout: Option<Duration>,
    terminate_timeout: Option<Duration>,
    kill_timeout: Option<Duration>,
    game_time_budget: Option<Duration>,
    agent_ram: Option<usize>,
    cpu_list: Option<String>,
}

impl ConstraintsBuilder {
    const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(5);
    const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);
    const DEFAULT_COMPLETE_TIMEOUT: Duration = Duration::from_secs(2);
    const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
    const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_millis(500);
    const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(1);

    /// Creates a new `ConstraintsBuilder` with default budgets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `ConstraintsBuilder` configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `ACTION_TIMEOUT_MS` (u64)
    /// - `START_TIMEOUT_MS` (u64)
    /// - `COMPLETE_TIMEOUT_MS` (u64)
    /// - `CONNECT_TIMEOUT_MS` (u64)
    /// - `JOIN_TIMEOUT_MS`, `TERMINATE_TIMEOUT_MS`, `KILL_TIMEOUT_MS` (u64)
    /// - `GAME_TIME_BUDGET_SECS` (u64): wall-clock budget of a whole game
    /// - `RAM_PER_AGENT` (usize): maximum RAM per agent in MB
    /// - `CPU_LIST` (string): comma-separated list or ranges of CPUs, e.g. "0-3,6"
    ///
    /// Unset or unparsable variables are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_usize(var: &str) -> Option<usize> {
            env::var(var).ok()?.parse().ok()
        }

        fn parse_duration_secs(var: &str) -> Option<Duration> {
            env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        }

        fn parse_duration_millis(var: &str) -> Option<Duration> {
            env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_millis)
        }

        ConstraintsBuilder {
            action_timeout: parse_duration_millis("ACTION_TIMEOUT_MS"),
            start_timeout: parse_duration_millis("START_TIMEOUT_MS"),
            complete_timeout: parse_duration_millis("COMPLETE_TIMEOUT_MS"),
            connect_timeout: parse_duration_millis("CONNECT_TIMEOUT_MS"),
            join_timeout: parse_duration_millis("JOIN_TIMEOUT_MS"),
            terminate_timeout: parse_duration_millis("TERMINATE_TIMEOUT_MS"),
            kill_timeout: parse_duration_millis("KILL_TIMEOUT_MS"),
            game_time_budget: parse_duration_secs("GAME_TIME_BUDGET_SECS"),
            agent_ram: parse_usize("RAM_PER_AGENT"),
            cpu_list: env::var("CPU_LIST").ok(),
        }
    }

    /// Sets the maximum duration allowed for a single action (default 5s).
    #[must_use]
    pub fn with_action_timeout(self, duration: Duration) -> Self {
        Self {
            action_timeout: Some(duration),
            ..self
        }
    }

    /// Sets how long agents may take to acknowledge the start of a game (default 10s).
    ///
    /// Start messages are sent to every agent without waiting; this is the total time
    /// allowed for all acknowledgements to come back.
    #[must_use]
    pub fn with_start_timeout(self, duration: Duration) -> Self {
        Self {
            start_timeout: Some(duration),
            ..self
        }
    }

    /// Sets how long each agent may take to acknowledge the end of a game (default 2s).
    #[must_use]
    pub fn with_complete_timeout(self, duration: Duration) -> Self {
        Self {
            complete_timeout: Some(duration),
            ..self
        }
    }

    /// Sets how long the network isolator waits for all agents to connect (default 10s).
    #[must_use]
    pub fn with_connect_timeout(self, duration: Duration) -> Self {
        Self {
            connect_timeout: Some(duration),
            ..self
        }
    }

    /// Sets the graceful join stage of the worker shutdown (default 500ms).
    #[must_use]
    pub fn with_join_timeout(self, duration: Duration) -> Self {
        Self {
            join_timeout: Some(duration),
            ..self
        }
    }

    /// Sets the terminate stage of the worker shutdown (default 500ms).
    #[must_use]
    pub fn with_terminate_timeout(self, duration: Duration) -> Self {
        Self {
            terminate_timeout: Some(duration),
            ..self
        }
    }

    /// Sets the kill stage of the worker shutdown (default 1s).
    #[must_use]
    pub fn with_kill_timeout(self, duration: Duration) -> Self {
        Self {
            kill_timeout: Some(duration),
            ..self
        }
    }

    /// Sets the total wall-clock time a game may last (default: unlimited).
    ///
    /// When exceeded, the engine stops the loop and marks the game as timed out.
    #[must_use]
    pub fn with_game_time_budget(self, duration: Duration) -> Self {
        Self {
            game_time_budget: Some(duration),
            ..self
        }
    }

    /// Sets the maximum RAM available per agent worker (in MB).
    #[must_use]
    pub fn with_ram_per_agent(self, max: usize) -> Self {
        Self {
            agent_ram: Some(max),
            ..self
        }
    }

    /// Sets the CPUs worker processes may run on.
    ///
    /// Format follows the pattern: `"0-3,6,8"` (inclusive ranges and individual IDs).
    #[must_use]
    pub fn with_cpu_list(self, cpus: &str) -> Self {
        Self {
            cpu_list: Some(cpus.to_string()),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed `Constraints`.
    ///
    /// # Errors
    ///
    /// Returns an error when a budget is zero, when the CPU list cannot be parsed, or
    /// when the RAM per agent is larger than the available memory.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let budgets = [
            ("action timeout", self.action_timeout),
            ("start timeout", self.start_timeout),
            ("complete timeout", self.complete_timeout),
            ("connect timeout", self.connect_timeout),
            ("join timeout", self.join_timeout),
            ("terminate timeout", self.terminate_timeout),
            ("kill timeout", self.kill_timeout),
            ("game time budget", self.game_time_budget),
        ];
        for (name, budget) in budgets {
            if budget == Some(Duration::ZERO) {
                bail!("{name} must be greater than zero");
            }
        }

        if let Some(agent_ram) = self.agent_ram {
            if agent_ram == 0 {
                bail!("RAM per agent must be greater than zero");
            }
            let mut sys = sysinfo::System::new();
            sys.refresh_memory();
            let available = sys.available_memory() as usize;
            if available > 0 && available < agent_ram * 1_000_000 {
                bail!(
                    "Agent RAM size ({}MB) is greater than available RAM ({}MB)",
                    agent_ram,
                    available / 1_000_000
                );
            } else if available == 0 {
                warn!("could not read available memory, RAM per agent is not checked");
            }
        }

        let cpus = match self.cpu_list {
            Some(list) => {
                Some(cpu_list_to_set(&list).map_err(|e| e.context("error parsing cpu list"))?)
            }
            None => None,
        };

        Ok(Constraints {
            action_timeout: self.action_timeout.unwrap_or(Self::DEFAULT_ACTION_TIMEOUT),
            start_timeout: self.start_timeout.unwrap_or(Self::DEFAULT_START_TIMEOUT),
            complete_timeout: self
                .complete_timeout
                .unwrap_or(Self::DEFAULT_COMPLETE_TIMEOUT),
            connect_timeout: self.connect_timeout.unwrap_or(Self::DEFAULT_CONNECT_TIMEOUT),
            join_timeout: self.join_timeout.unwrap_or(Self::DEFAULT_JOIN_TIMEOUT),
            terminate_timeout: self
                .terminate_timeout
                .unwrap_or(Self::DEFAULT_TERMINATE_TIMEOUT),
            kill_timeout: self.kill_timeout.unwrap_or(Self::DEFAULT_KILL_TIMEOUT),
            game_time_budget: self.game_time_budget,
            agent_ram: self.agent_ram.map(|mb| mb * 1_000_000),
            cpus,
        })
    }
}

fn cpu_list_to_set(s: &str) -> anyhow::Result<BTreeSet<u8>> {
    if s.trim().is_empty() {
        bail!("Empty string");
    }
    let mut set = BTreeSet::new();
    for item in s.split(',') {
        let bounds = item
            .split('-')
            .map(|value| {
                value
                    .trim()
                    .parse::<u8>()
                    .with_context(|| format!("could not parse {value}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        match bounds[..] {
            [cpu] => {
                set.insert(cpu);
            }
            [start, end] => set.extend(start.min(end)..=start.max(end)),
            _ => bail!(
                "each comma-separated item must be a number or a range (e.g. '0-3'), got '{item}'"
            ),
        }
    }
    Ok(set)
}

/// Obtained using [`ConstraintsBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraints {
    pub(crate) action_timeout: Duration,
    pub(crate) start_timeout: Duration,
    pub(crate) complete_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) join_timeout: Duration,
    pub(crate) terminate_timeout: Duration,
    pub(crate) kill_timeout: Duration,
    pub(crate) game_time_budget: Option<Duration>,
    /// bytes
    pub(crate) agent_ram: Option<usize>,
    pub(crate) cpus: Option<BTreeSet<u8>>,
}

impl Constraints {
    /// create a ConstraintsBuilder
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    /// Budget of one action request.
    pub fn action_timeout(&self) -> Duration {
        self.action_timeout
    }

    /// Wall-clock budget of a whole game, if any.
    pub fn game_time_budget(&self) -> Option<Duration> {
        self.game_time_budget
    }

    /// Whether worker processes need a cgroup.
    pub(crate) fn needs_container(&self) -> bool {
        self.agent_ram.is_some() || self.cpus.is_some()
    }

    /// The CPU list in cgroup format ("0,1,4"), empty when unrestricted.
    pub(crate) fn cpus_string(&self) -> String {
        self.cpus
            .iter()
            .flatten()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            action_timeout: ConstraintsBuilder::DEFAULT_ACTION_TIMEOUT,
            start_timeout: ConstraintsBuilder::DEFAULT_START_TIMEOUT,
            complete_timeout: ConstraintsBuilder::DEFAULT_COMPLETE_TIMEOUT,
            connect_timeout: ConstraintsBuilder::DEFAULT_CONNECT_TIMEOUT,
            join_timeout: ConstraintsBuilder::DEFAULT_JOIN_TIMEOUT,
            terminate_timeout: ConstraintsBuilder::DEFAULT_TERMINATE_TIMEOUT,
            kill_timeout: ConstraintsBuilder::DEFAULT_KILL_TIMEOUT,
            game_time_budget: None,
            agent_ram: None,
            cpus: None,
        }
    }
}
