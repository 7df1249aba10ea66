use std::{
    path::Path,
    process::{Child, ChildStdin, ChildStdout},
    time::Duration,
};

use anyhow::{self, bail, Context};

use super::{create_process, wait_for_exit, ShutdownStage};

/// A worker process. Limits are only available on linux.
#[derive(Debug)]
pub struct LimitedProcess {
    pub(super) child: Child,
    pub(super) stage: ShutdownStage,
}

impl LimitedProcess {
    pub fn launch(
        _command: &Path,
        _args: &[String],
        _max_memory: i64,
        _cpus: &str,
        _allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        bail!("cgroups only available on linux")
    }

    pub fn launch_without_container(
        command: &Path,
        args: &[String],
        allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        let child =
            create_process(command, args, allow_stderr).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            stage: ShutdownStage::Running,
        })
    }

    pub fn is_contained(&self) -> bool {
        false
    }

    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        Some((self.child.stdin.take()?, self.child.stdout.take()?))
    }

    pub(super) fn force_kill(&mut self) -> anyhow::Result<()> {
        self.child.kill().context("could not kill process")
    }

    pub(super) fn wait_for_cleanup(&mut self, max_duration: Duration) -> bool {
        wait_for_exit(&mut self.child, max_duration)
    }

    pub(super) fn release(&mut self) {}
}
