//! Child processes confined to a cgroup, with a portable uncontained fallback.
//!
//! Used for both sandboxed commands and agent processes. A [`LimitedProcess`] is killed
//! (together with every process left in its cgroup) on [`LimitedProcess::try_kill`] or on
//! drop.

#[cfg(target_os = "linux")]
mod cgroup_manager_linux;

#[cfg(target_os = "linux")]
pub use cgroup_manager_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_manager_stub;

#[cfg(not(target_os = "linux"))]
pub use cgroup_manager_stub::*;

use std::process::{Child, Stdio};

use anyhow::Context;
use tracing::warn;

/// What happens to one output stream of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutput {
    /// Sent to `/dev/null`.
    Discard,
    /// Shared with the arena process.
    Inherit,
    /// Piped back to the arena.
    Capture,
}

impl ChildOutput {
    fn stdio(self) -> Stdio {
        match self {
            ChildOutput::Discard => Stdio::null(),
            ChildOutput::Inherit => Stdio::inherit(),
            ChildOutput::Capture => Stdio::piped(),
        }
    }
}

/// How strictly processes must be confined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// Fail when a cgroup cannot be created.
    Required,
    /// Try a cgroup, fall back to a plain child process on failure.
    Preferred,
    /// Never create a cgroup.
    Disabled,
}

/// Resource caps applied to a contained process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessLimits {
    /// Hard memory limit in bytes.
    pub max_memory: Option<usize>,
    /// Maximum number of simultaneous tasks in the group.
    pub max_pids: Option<i64>,
    /// CPU list (`"0-3,6"`); empty means any CPU.
    pub cpus: String,
}

/// Launch `command` under `limits`, honouring `containment`.
pub fn launch(
    command: &str,
    args: &[String],
    limits: &ProcessLimits,
    stdout: ChildOutput,
    stderr: ChildOutput,
    containment: Containment,
) -> anyhow::Result<LimitedProcess> {
    match containment {
        Containment::Disabled => LimitedProcess::launch_without_container(command, args, stdout, stderr),
        Containment::Required => LimitedProcess::launch(command, args, limits, stdout, stderr),
        Containment::Preferred => LimitedProcess::launch(command, args, limits, stdout, stderr)
            .or_else(|e| {
                warn!("running '{command}' uncontained: {e:#}");
                LimitedProcess::launch_without_container(command, args, stdout, stderr)
            }),
    }
}

fn create_process(
    command: &str,
    args: &[String],
    stdout: ChildOutput,
    stderr: ChildOutput,
) -> anyhow::Result<Child> {
    std::process::Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout.stdio())
        .stderr(stderr.stdio())
        .spawn()
        .with_context(|| format!("command '{command}' not found"))
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use super::*;

    #[test]
    fn uncontained_child_output_is_captured() {
        let args = vec!["-c".to_string(), "echo hello".to_string()];
        let mut process = launch(
            "sh",
            &args,
            &ProcessLimits::default(),
            ChildOutput::Capture,
            ChildOutput::Discard,
            Containment::Disabled,
        )
        .unwrap();
        let mut out = String::new();
        process
            .child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out.trim(), "hello");
        process.try_kill(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn killing_a_running_child_terminates_it() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let mut process = launch(
            "sh",
            &args,
            &ProcessLimits::default(),
            ChildOutput::Discard,
            ChildOutput::Discard,
            Containment::Disabled,
        )
        .unwrap();
        process.try_kill(Duration::from_secs(1)).unwrap();
        assert!(process.child.try_wait().unwrap().is_some());
    }

    #[test]
    fn missing_binary_is_an_error() {
        let result = launch(
            "definitely-not-a-binary-on-this-host",
            &[],
            &ProcessLimits::default(),
            ChildOutput::Discard,
            ChildOutput::Discard,
            Containment::Disabled,
        );
        assert!(result.is_err());
    }
}
