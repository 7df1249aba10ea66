//! Config for the engine behaviors
//!
//! This module provides configuration options for controlling how the engine runs agents.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Set a flag to `"true"` (case-insensitive) to enable it.
//!
//! - `ENGINE_LOG` — Enable logging to a file (default: `false`)
//! - `ENGINE_ALLOW_UNCONTAINED` — Run workers without cgroup when cgroups are unavailable (default: `false`)
//! - `ENGINE_DEBUG_AGENT_STDERR` — Let workers print on the engine's stderr (default: `false`)
//! - `ENGINE_WORKER_COMMAND` — Worker program and its arguments, space separated
//! - `ENGINE_TCP_ADDRESS` — Address the network isolator listens on (default: `127.0.0.1:0`)
//! - `ENGINE_SPAWN_TCP_WORKERS` — Have the network isolator launch local workers (default: `false`)

use std::path::PathBuf;

/// Configuration for engine behaviors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) debug_agent_stderr: bool,
    pub(crate) worker_command: Option<(PathBuf, Vec<String>)>,
    pub(crate) tcp_address: String,
    pub(crate) spawn_tcp_workers: bool,
}

impl Configuration {
    const DEFAULT_TCP_ADDRESS: &'static str = "127.0.0.1:0";

    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Logging to file is disabled.
    /// - Workers without cgroup are not allowed when containment is requested.
    /// - Worker stderr output is discarded.
    /// - No worker command is set: the process isolator cannot be used until one is.
    /// - The network isolator listens on an ephemeral loopback port and waits for
    ///   agents started by someone else.
    pub fn new() -> Self {
        Self {
            log: false,
            allow_uncontained: false,
            debug_agent_stderr: false,
            worker_command: None,
            tcp_address: Self::DEFAULT_TCP_ADDRESS.to_string(),
            spawn_tcp_workers: false,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// The following environment variables are recognized:
    /// - `ENGINE_LOG`: if set to `"true"`, enables logging to file (default: `false`)
    /// - `ENGINE_ALLOW_UNCONTAINED`: if set to `"true"`, allows uncontained workers (default: `false`)
    /// - `ENGINE_DEBUG_AGENT_STDERR`: if set to `"true"`, shows worker stderr (default: `false`)
    /// - `ENGINE_WORKER_COMMAND`: program followed by its arguments, split on whitespace
    /// - `ENGINE_TCP_ADDRESS`: listening address of the network isolator
    /// - `ENGINE_SPAWN_TCP_WORKERS`: if set to `"true"`, the network isolator launches
    ///   the worker command with `--connect <address>` (default: `false`)
    ///
    /// Any other value (including unset) will result in using the default value for each field.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        let worker_command = std::env::var("ENGINE_WORKER_COMMAND")
            .ok()
            .and_then(|command| {
                let mut parts = command.split_whitespace().map(str::to_string);
                let program = parts.next()?;
                Some((PathBuf::from(program), parts.collect()))
            });

        Self {
            log: get_env_flag("ENGINE_LOG", false),
            allow_uncontained: get_env_flag("ENGINE_ALLOW_UNCONTAINED", false),
            debug_agent_stderr: get_env_flag("ENGINE_DEBUG_AGENT_STDERR", false),
            worker_command,
            tcp_address: std::env::var("ENGINE_TCP_ADDRESS")
                .unwrap_or_else(|_| Self::DEFAULT_TCP_ADDRESS.to_string()),
            spawn_tcp_workers: get_env_flag("ENGINE_SPAWN_TCP_WORKERS", false),
        }
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Enable or disable uncontained fallbacks.
    ///
    /// When memory or CPU limits are set but cgroups cannot be created, workers are
    /// started anyway (and a warning is logged) instead of failing.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable worker stderr output (debug purposes only).
    pub fn with_debug_agent_stderr(mut self, value: bool) -> Self {
        self.debug_agent_stderr = value;
        self
    }

    /// Program (and arguments) hosting one agent per process.
    ///
    /// The program must speak the worker protocol on its stdin/stdout, see
    /// [`run_worker`](crate::isolation::worker::run_worker).
    pub fn with_worker_command(mut self, program: impl Into<PathBuf>, args: &[&str]) -> Self {
        self.worker_command = Some((
            program.into(),
            args.iter().map(|arg| arg.to_string()).collect(),
        ));
        self
    }

    /// Address the network isolator listens on.
    pub fn with_tcp_address(mut self, address: &str) -> Self {
        self.tcp_address = address.to_string();
        self
    }

    /// Have the network isolator start workers itself, instead of waiting for agents
    /// started elsewhere.
    pub fn with_spawn_tcp_workers(mut self, value: bool) -> Self {
        self.spawn_tcp_workers = value;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
