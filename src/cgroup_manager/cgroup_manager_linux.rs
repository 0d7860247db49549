use std::{
    process::Child,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{self, Context};
use cgroups_rs::Cgroup;
use tracing::{trace, warn};

use super::{create_process, ChildOutput, ProcessLimits};

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

/// Create a cgroup at `path` with the provided limits.
///
/// # Errors
///
/// Fails if the parameters are incorrect or if cgroups are not available.
pub fn create_cgroup(path: &str, limits: &ProcessLimits) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if let Some(max_memory) = limits.max_memory {
        builder = builder.memory().memory_hard_limit(max_memory as i64).done();
    }
    if let Some(max_pids) = limits.max_pids.filter(|n| *n > 0) {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(max_pids))
            .done();
    }
    if !limits.cpus.is_empty() {
        builder = builder.cpu().cpus(limits.cpus.clone()).done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

#[derive(Debug)]
pub struct TimeoutError {}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timeout Error")
    }
}

impl std::error::Error for TimeoutError {}

pub fn wait_for_process_cleanup(
    cgroup: &Cgroup,
    pid: u64,
    max_duration: Duration,
) -> Result<(), TimeoutError> {
    let deadline = Instant::now() + max_duration;
    while cgroup.tasks().iter().any(|cpid| cpid.pid == pid) {
        if Instant::now() > deadline {
            return Err(TimeoutError {});
        }

        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

fn create_process_in_cgroup(
    command: &str,
    args: &[String],
    group: &Cgroup,
    stdout: ChildOutput,
    stderr: ChildOutput,
) -> anyhow::Result<Child> {
    let mut child = create_process(command, args, stdout, stderr)?;

    let pid = child.id() as u64;
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

/// A child process, optionally confined to its own cgroup.
#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cgroup: Option<Cgroup>,
    cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(
        command: &str,
        args: &[String],
        limits: &ProcessLimits,
        stdout: ChildOutput,
        stderr: ChildOutput,
    ) -> anyhow::Result<LimitedProcess> {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        // one cgroup per process, named after the arena pid so parallel arenas do not clash
        let group_name = format!(
            "ARENA_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let group = create_cgroup(&path, limits).context("could not create cgroup")?;
        let child = create_process_in_cgroup(command, args, &group, stdout, stderr)
            .with_context(|| {
                let _ = group.delete();
                "could not create process in cgroup"
            })?;
        trace!(pid = child.id(), cgroup = path, "contained process launched");

        Ok(LimitedProcess {
            child,
            cgroup: Some(group),
            cleaned_up: false,
        })
    }

    pub fn launch_without_container(
        command: &str,
        args: &[String],
        stdout: ChildOutput,
        stderr: ChildOutput,
    ) -> anyhow::Result<LimitedProcess> {
        let child = create_process(command, args, stdout, stderr)
            .context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cgroup: None,
            cleaned_up: false,
        })
    }

    /// True when the process runs inside its own cgroup.
    pub fn is_contained(&self) -> bool {
        self.cgroup.is_some()
    }

    /// Kill the process (and everything left in its cgroup), then reap it.
    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        match &mut self.cgroup {
            Some(cgroup) => {
                cgroup.kill().context("could not kill process")?;
                wait_for_process_cleanup(cgroup, self.child.id() as u64, max_duration)
                    .context("process cleanup timed out")?;
                // the process is gone; a failed cgroup removal only leaks an empty directory
                if let Err(e) = cgroup.delete() {
                    warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
                }
            }
            None => {
                if self.child.try_wait().context("could not poll process")?.is_none() {
                    self.child.kill().context("could not kill process")?;
                }
            }
        }
        let _ = self.child.wait();
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_millis(100);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!("could not clean up process {}: {e:#}", self.child.id());
            }
        }
    }
}
