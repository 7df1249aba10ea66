use std::{
    path::Path,
    process::{Child, ChildStdin, ChildStdout},
    time::{Duration, Instant},
};

use anyhow::{self, Context};
use cgroups_rs::Cgroup;
use tracing::warn;

use super::{create_process, wait_for_exit, ShutdownStage};

pub fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimed_id.trim().to_string())
}

pub fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path`.
///
/// * `max_memory` - Maximum available memory in Bytes. Non-positive means no restriction.
/// * `max_pids` - Maximum number of PIDS inside the cgroup at any time. Non-positive means no restriction.
/// * `cpus` - which cpus the members can run one ("1-5,7", "1,3,4", ...). Empty string means no restriction.
///
/// # Errors
///
/// This function will return an error if the cgroup could not be created. This can happen if the parameters are incorrect or if cgroup is not available.
pub fn create_cgroup(
    path: &str,
    max_memory: i64,
    max_pids: i64,
    cpus: &str,
) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if max_memory > 0 {
        builder = builder.memory().memory_hard_limit(max_memory).done();
    }
    if max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(max_pids))
            .done();
    }
    if !cpus.is_empty() {
        builder = builder.cpu().cpus(cpus.to_string()).done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

fn create_process_in_cgroup(
    command: &Path,
    args: &[String],
    group: &Cgroup,
    allow_stderr: bool,
) -> anyhow::Result<Child> {
    let mut child = create_process(command, args, allow_stderr)?;

    let pid = u64::from(child.id());
    let addition = group.add_task_by_tgid(cgroups_rs::CgroupPid { pid });
    if addition.is_err() {
        let kill = child.kill();

        addition.with_context(|| {
            if let Err(err) = kill {
                format!(
                    "could not add process to cgroup, and process could not be killed either ({err})"
                )
            } else {
                "could not add process to cgroup".to_string()
            }
        })?;
    }
    Ok(child)
}

/// A worker process, in its own cgroup when launched with limits.
#[derive(Debug)]
pub struct LimitedProcess {
    pub(super) child: Child,
    cgroup: Option<Cgroup>,
    pub(super) stage: ShutdownStage,
}

impl LimitedProcess {
    /// Launch `command` in a fresh cgroup limited to `max_memory` bytes (non-positive:
    /// unlimited) and `cpus` (empty: unrestricted).
    pub fn launch(
        command: &Path,
        args: &[String],
        max_memory: i64,
        cpus: &str,
        allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        // one cgroup per worker, unique across engines running at the same time
        let group_name = format!(
            "AI_GAME_ENGINE_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let group =
            create_cgroup(&path, max_memory, 100, cpus).context("could not create cgroup")?;
        let child = match create_process_in_cgroup(command, args, &group, allow_stderr) {
            Ok(child) => child,
            Err(e) => {
                if let Err(err) = group.delete() {
                    warn!("could not delete cgroup {path}: {err}");
                }
                return Err(e.context(format!("could not create process in cgroup {path}")));
            }
        };

        Ok(LimitedProcess {
            child,
            cgroup: Some(group),
            stage: ShutdownStage::Running,
        })
    }

    /// Launch `command` without any limit.
    pub fn launch_without_container(
        command: &Path,
        args: &[String],
        allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        let child =
            create_process(command, args, allow_stderr).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cgroup: None,
            stage: ShutdownStage::Running,
        })
    }

    /// Whether the process runs in a cgroup.
    pub fn is_contained(&self) -> bool {
        self.cgroup.is_some()
    }

    /// The worker's stdin and stdout. Only available once.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        Some((self.child.stdin.take()?, self.child.stdout.take()?))
    }

    pub(super) fn force_kill(&mut self) -> anyhow::Result<()> {
        match &self.cgroup {
            Some(cgroup) => cgroup.kill().context("could not kill cgroup"),
            None => self.child.kill().context("could not kill process"),
        }
    }

    /// Wait for the process (and, when contained, every task of its cgroup) to be gone.
    pub(super) fn wait_for_cleanup(&mut self, max_duration: Duration) -> bool {
        let deadline = Instant::now() + max_duration;
        if !wait_for_exit(&mut self.child, max_duration) {
            return false;
        }
        let Some(cgroup) = &self.cgroup else {
            return true;
        };
        while !cgroup.tasks().is_empty() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10).min(max_duration / 10));
        }
        true
    }

    /// Remove the cgroup once the process is gone.
    pub(super) fn release(&mut self) {
        if self.stage != ShutdownStage::Exited {
            return;
        }
        if let Some(cgroup) = self.cgroup.take() {
            if let Err(e) = cgroup.delete() {
                warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
            }
        }
    }
}
