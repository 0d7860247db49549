//! Process-backed sandbox.
//!
//! Each command becomes one child process (`docker exec <workload> ...` or a local shell),
//! launched through [`cgroup_manager`](crate::cgroup_manager). The wall-clock timeout is
//! enforced twice: inside the workload by `timeout -s KILL`, which takes the whole process
//! group down, and on the arena side by killing the child once the deadline plus a grace
//! period has passed.

use std::io::Read;
use std::process::{ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tracing::{debug, instrument, trace, warn};

use super::{CommandResult, Sandbox, EXIT_SANDBOX_ERROR, EXIT_TIMEOUT};
use crate::cgroup_manager::{self, ChildOutput, Containment, LimitedProcess, ProcessLimits};
use crate::constraints::Constraints;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READER_GRACE: Duration = Duration::from_millis(200);
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Where commands are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// `<binary> exec <workload> ...` against a container engine (`docker`, `podman`).
    Container { binary: String },
    /// A shell on this host; the workload name is only recorded.
    Local,
}

impl Backend {
    pub fn docker() -> Self {
        Backend::Container {
            binary: "docker".to_string(),
        }
    }

    fn command_line(&self, workload: &str, command: &str, timeout: Duration) -> (String, Vec<String>) {
        let limit = format!("{:.3}", timeout.as_secs_f64());
        match self {
            Backend::Container { binary } => (
                binary.clone(),
                [
                    "exec", workload, "timeout", "-s", "KILL", &limit, "bash", "-c", command,
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            Backend::Local => (
                "timeout".to_string(),
                ["-s", "KILL", &limit, "sh", "-c", command]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        }
    }

    /// True when the engine itself, not the command, failed.
    fn is_transport_failure(&self, stderr: &str) -> bool {
        match self {
            Backend::Container { .. } => {
                stderr.starts_with("Error response from daemon")
                    || stderr.contains("No such container")
                    || stderr.contains("Cannot connect to the Docker daemon")
                    || stderr.contains("is not running")
            }
            Backend::Local => false,
        }
    }
}

/// Runs commands as contained child processes with a hard timeout and an output cap.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    backend: Backend,
    output_cap: usize,
    limits: ProcessLimits,
    containment: Containment,
}

impl ProcessSandbox {
    /// A sandbox using `backend`, with output cap and per-command memory taken from
    /// `constraints`.
    pub fn new(backend: Backend, constraints: &Constraints, containment: Containment) -> Self {
        ProcessSandbox {
            backend,
            output_cap: constraints.output_cap,
            limits: ProcessLimits {
                max_memory: constraints.command_ram,
                max_pids: Some(256),
                cpus: String::new(),
            },
            containment,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    fn finish(
        &self,
        status: Option<ExitStatus>,
        timeout: Duration,
        start: Instant,
        stdout: StreamCapture,
        stderr: StreamCapture,
    ) -> CommandResult {
        let elapsed = start.elapsed();
        let (stdout, stdout_truncated) = stdout.collect(READER_GRACE);
        let (mut stderr, stderr_truncated) = stderr.collect(READER_GRACE);
        let truncated = stdout_truncated || stderr_truncated;

        let exit_status = match status {
            Some(status) if elapsed < timeout => {
                if self.backend.is_transport_failure(&stderr) {
                    debug!(code = ?status.code(), "container engine failure");
                    EXIT_SANDBOX_ERROR
                } else {
                    exit_code(status)
                }
            }
            // whatever the process printed or returned after the deadline is irrelevant
            _ => {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr += &format!("command timed out after {:.3}s", timeout.as_secs_f64());
                EXIT_TIMEOUT
            }
        };

        CommandResult {
            exit_status,
            stdout,
            stderr,
            elapsed_ms: elapsed.as_millis() as u64,
            truncated,
        }
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip(self, timeout), fields(timeout_ms = timeout.as_millis() as u64))]
    fn execute(&mut self, workload: &str, command: &str, timeout: Duration) -> CommandResult {
        let start = Instant::now();
        let (program, args) = self.backend.command_line(workload, command, timeout);

        let mut process = match cgroup_manager::launch(
            &program,
            &args,
            &self.limits,
            ChildOutput::Capture,
            ChildOutput::Capture,
            self.containment,
        ) {
            Ok(process) => process,
            Err(e) => {
                warn!("could not start command: {e:#}");
                return CommandResult::fault(
                    EXIT_SANDBOX_ERROR,
                    format!("could not start command: {e:#}"),
                    start.elapsed(),
                );
            }
        };

        let pid = process.child.id();
        let stdout = StreamCapture::spawn(process.child.stdout.take(), self.output_cap);
        let stderr = StreamCapture::spawn(process.child.stderr.take(), self.output_cap);

        let status = match wait_until(&mut process, start + timeout + KILL_GRACE) {
            Ok(status) => status,
            Err(e) => {
                kill(&mut process);
                return CommandResult::fault(
                    EXIT_SANDBOX_ERROR,
                    format!("lost track of command: {e:#}"),
                    start.elapsed(),
                );
            }
        };
        if status.is_none() {
            debug!("deadline passed, killing command");
        }
        if self.backend == Backend::Local {
            kill_process_group(pid);
        }
        kill(&mut process);

        let result = self.finish(status, timeout, start, stdout, stderr);
        trace!(
            exit_status = result.exit_status,
            elapsed_ms = result.elapsed_ms,
            truncated = result.truncated
        );
        result
    }

    fn probe(&mut self, workload: &str) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Local => Ok(()),
            Backend::Container { binary } => {
                let output = std::process::Command::new(binary)
                    .args(["inspect", "-f", "{{.State.Running}}", workload])
                    .output()
                    .with_context(|| format!("could not launch '{binary} inspect'"))?;
                let running = String::from_utf8_lossy(&output.stdout);
                if !output.status.success() {
                    bail!(
                        "workload '{workload}' not found: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                if running.trim() != "true" {
                    bail!("workload '{workload}' is not running");
                }
                Ok(())
            }
        }
    }
}

/// Poll the child until it exits or `deadline` passes (`Ok(None)`).
fn wait_until(process: &mut LimitedProcess, deadline: Instant) -> anyhow::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = process.child.try_wait().context("could not poll command")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill(process: &mut LimitedProcess) {
    if let Err(e) = process.try_kill(Duration::from_secs(1)) {
        warn!("could not kill command process: {e:#}");
    }
}

/// Kill what is left of a local command's process group.
///
/// `timeout` leads its own group, so background jobs of the shell (`cmd &`) are members.
/// Left alive they would keep the output pipes open past the command's exit.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let status = std::process::Command::new("sh")
        .args(["-c", &format!("kill -s KILL -- -{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        // a non-zero status means the group is already gone
        Ok(status) => trace!(pid, killed = status.success(), "process group swept"),
        Err(e) => debug!(pid, "could not signal process group: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(EXIT_SANDBOX_ERROR)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_SANDBOX_ERROR)
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Background reader keeping at most `cap` bytes of one stream while draining the rest,
/// so a chatty command never blocks on a full pipe.
///
/// The reader thread is detached. It ends when every writer of the pipe is gone, which
/// for a container command may be after [`collect`](Self::collect) gave up waiting: a
/// process left running inside the workload keeps its thread blocked until it exits.
/// Local commands have their process group killed first, so they never leave one behind.
struct StreamCapture {
    captured: Arc<Mutex<Captured>>,
    done: Receiver<()>,
}

impl StreamCapture {
    fn spawn<R: Read + Send + 'static>(source: Option<R>, cap: usize) -> StreamCapture {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let (tx, done) = mpsc::channel();
        let Some(mut source) = source else {
            let _ = tx.send(());
            return StreamCapture { captured, done };
        };

        let shared = captured.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match source.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
                        let room = cap.saturating_sub(guard.bytes.len());
                        if n > room {
                            guard.truncated = true;
                        }
                        let keep = n.min(room);
                        guard.bytes.extend_from_slice(&buf[..keep]);
                    }
                }
            }
            let _ = tx.send(());
        });

        StreamCapture { captured, done }
    }

    /// Wait up to `grace` for the stream to close, then take what was captured.
    fn collect(self, grace: Duration) -> (String, bool) {
        let _ = self.done.recv_timeout(grace);
        let guard = self.captured.lock().unwrap_or_else(|e| e.into_inner());
        (String::from_utf8_lossy(&guard.bytes).into_owned(), guard.truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintsBuilder;

    fn local(cap: usize) -> ProcessSandbox {
        let constraints = ConstraintsBuilder::new()
            .with_output_cap(cap)
            .build()
            .unwrap();
        ProcessSandbox::new(Backend::Local, &constraints, Containment::Disabled)
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let mut sandbox = local(4096);
        let result = sandbox.execute("local", "echo out; echo err >&2; exit 3", Duration::from_secs(5));
        assert_eq!(result.exit_status, 3);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.truncated);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn background_jobs_do_not_outlive_local_commands() {
        let mut sandbox = local(4096);
        let result = sandbox.execute("local", "sleep 30 & echo $!", Duration::from_secs(5));
        assert_eq!(result.exit_status, 0);
        let pid: u32 = result.stdout.trim().parse().unwrap();

        let proc_stat = format!("/proc/{pid}/stat");
        let deadline = Instant::now() + Duration::from_secs(2);
        let gone = loop {
            // killed jobs may linger as zombies until their new parent reaps them
            match std::fs::read_to_string(&proc_stat) {
                Err(_) => break true,
                Ok(stat) if stat.contains(") Z ") => break true,
                Ok(_) if Instant::now() >= deadline => break false,
                Ok(_) => thread::sleep(POLL_INTERVAL),
            }
        };
        assert!(gone, "background sleep {pid} is still running");
    }

    #[test]
    fn successful_command_exits_zero() {
        let mut sandbox = local(4096);
        let result = sandbox.execute("local", "true", Duration::from_secs(5));
        assert!(result.succeeded());
        assert!(result.stdout.is_empty());
        assert!(!result.truncated);
    }

    #[test]
    fn slow_command_yields_timeout_status() {
        let mut sandbox = local(4096);
        let started = Instant::now();
        let result = sandbox.execute(
            "local",
            "echo started; sleep 20; echo finished",
            Duration::from_millis(300),
        );
        assert_eq!(result.exit_status, EXIT_TIMEOUT);
        assert!(result.stderr.contains("timed out"));
        assert!(!result.stdout.contains("finished"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn output_is_truncated_at_the_cap() {
        let mut sandbox = local(100);
        let result = sandbox.execute(
            "local",
            "head -c 100000 /dev/zero | tr '\\0' 'a'",
            Duration::from_secs(5),
        );
        assert!(result.succeeded());
        assert!(result.truncated);
        assert_eq!(result.stdout.len(), 100);
    }

    #[test]
    fn docker_command_line_wraps_in_timeout() {
        let (program, args) =
            Backend::docker().command_line("red-kali", "nmap -sV 10.0.0.1", Duration::from_secs(30));
        assert_eq!(program, "docker");
        assert_eq!(
            args,
            vec![
                "exec", "red-kali", "timeout", "-s", "KILL", "30.000", "bash", "-c",
                "nmap -sV 10.0.0.1"
            ]
        );
    }

    #[test]
    fn engine_errors_are_transport_failures() {
        let docker = Backend::docker();
        assert!(docker.is_transport_failure("Error response from daemon: No such container: x"));
        assert!(!docker.is_transport_failure("bash: nmap: command not found"));
        assert!(!Backend::Local.is_transport_failure("Error response from daemon"));
    }

    #[test]
    fn missing_engine_binary_is_a_sandbox_fault() {
        let constraints = ConstraintsBuilder::new().build().unwrap();
        let mut sandbox = ProcessSandbox::new(
            Backend::Container {
                binary: "no-such-container-engine".to_string(),
            },
            &constraints,
            Containment::Disabled,
        );
        let result = sandbox.execute("red-kali", "id", Duration::from_secs(1));
        assert_eq!(result.exit_status, EXIT_SANDBOX_ERROR);
        assert!(!result.stderr.is_empty());
        assert!(sandbox.probe("red-kali").is_err());
    }
}
