//! Worker processes, optionally confined to a cgroup, and their shutdown sequence.
//!
//! Shutting a worker down goes through explicit stages, each bounded by its own budget:
//!
//! ```text
//! Running -> Joining -> Exited
//!               |
//!               +-> Terminating -> Exited
//!                       |
//!                       +-> Killing -> Exited | Abandoned
//! ```
//!
//! [`LimitedProcess::shutdown`] never blocks longer than the sum of the three budgets and
//! can be called any number of times.

#[cfg(target_os = "linux")]
mod cgroup_manager_linux;

#[cfg(target_os = "linux")]
pub use cgroup_manager_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_manager_stub;

#[cfg(not(target_os = "linux"))]
pub use cgroup_manager_stub::*;

use std::path::Path;
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, warn};

use crate::constraints::Constraints;

/// Where a worker is in its shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    /// Not asked to stop yet.
    Running,
    /// Waiting for the worker to exit on its own (its input was closed).
    Joining,
    /// Asked to terminate (SIGTERM on unix).
    Terminating,
    /// Forcibly killed, waiting for the kill to land.
    Killing,
    /// The process is gone.
    Exited,
    /// Even a kill could not be confirmed. The process is left behind.
    Abandoned,
}

impl ShutdownStage {
    /// Whether the sequence is over.
    pub fn is_final(self) -> bool {
        matches!(self, ShutdownStage::Exited | ShutdownStage::Abandoned)
    }
}

/// Budget of each shutdown stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownBudgets {
    /// Graceful exit.
    pub join: Duration,
    /// After the terminate signal.
    pub terminate: Duration,
    /// After the kill.
    pub kill: Duration,
}

impl ShutdownBudgets {
    /// Budgets taken from the constraints.
    pub fn from_constraints(constraints: &Constraints) -> Self {
        Self {
            join: constraints.join_timeout,
            terminate: constraints.terminate_timeout,
            kill: constraints.kill_timeout,
        }
    }
}

impl LimitedProcess {
    /// Current shutdown stage.
    pub fn stage(&self) -> ShutdownStage {
        self.stage
    }

    /// OS process id.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Walk the shutdown sequence until the process is gone or abandoned.
    ///
    /// Callers should close the worker's stdin first so it can exit on its own during
    /// the join stage.
    pub fn shutdown(&mut self, budgets: &ShutdownBudgets) -> ShutdownStage {
        while !self.stage.is_final() {
            self.stage = match self.stage {
                ShutdownStage::Running => ShutdownStage::Joining,
                ShutdownStage::Joining => {
                    if wait_for_exit(&mut self.child, budgets.join) {
                        ShutdownStage::Exited
                    } else {
                        debug!(pid = self.child.id(), "worker did not exit, terminating");
                        if let Err(e) = terminate(&mut self.child) {
                            warn!(pid = self.child.id(), "could not terminate worker: {e:#}");
                        }
                        ShutdownStage::Terminating
                    }
                }
                ShutdownStage::Terminating => {
                    if wait_for_exit(&mut self.child, budgets.terminate) {
                        ShutdownStage::Exited
                    } else {
                        debug!(pid = self.child.id(), "worker ignored terminate, killing");
                        if let Err(e) = self.force_kill() {
                            warn!(pid = self.child.id(), "could not kill worker: {e:#}");
                        }
                        ShutdownStage::Killing
                    }
                }
                ShutdownStage::Killing => {
                    if self.wait_for_cleanup(budgets.kill) {
                        ShutdownStage::Exited
                    } else {
                        warn!(pid = self.child.id(), "worker kill could not be confirmed, giving up");
                        ShutdownStage::Abandoned
                    }
                }
                stage @ (ShutdownStage::Exited | ShutdownStage::Abandoned) => stage,
            };
        }
        self.release();
        self.stage
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        const CLEANUP_BUDGETS: ShutdownBudgets = ShutdownBudgets {
            join: Duration::ZERO,
            terminate: Duration::from_millis(10),
            kill: Duration::from_millis(100),
        };
        if !self.stage.is_final() {
            debug!(
                pid = self.child.id(),
                "process was not shut down before dropping, cleaning up"
            );
            if self.shutdown(&CLEANUP_BUDGETS) == ShutdownStage::Abandoned {
                warn!(pid = self.child.id(), "could not kill process on drop");
            }
        }
    }
}

/// Spawn `command` with piped stdin/stdout. Stderr is inherited only when allowed.
fn create_process(
    command: &Path,
    args: &[String],
    allow_stderr: bool,
) -> anyhow::Result<Child> {
    let mut cmd = std::process::Command::new(command);
    cmd.args(args).stdin(Stdio::piped()).stdout(Stdio::piped());
    if !allow_stderr {
        cmd.stderr(Stdio::null());
    }
    cmd.spawn()
        .with_context(|| format!("command '{}' not found", command.display()))
}

/// Poll the child until it exits or `max_duration` elapses. Returns whether it exited.
fn wait_for_exit(child: &mut Child, max_duration: Duration) -> bool {
    let deadline = Instant::now() + max_duration;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            // the child was already reaped
            Err(_) => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10).min(max_duration / 10).max(Duration::from_millis(1)));
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(child.id()).context("pid out of range")?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).context("SIGTERM failed")
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> anyhow::Result<()> {
    child.kill().context("could not terminate process")
}
