//! Sandbox executor: run one command inside a named workload, never failing.
//!
//! Every outcome, including a missing workload, a broken transport, a timeout or a
//! denylisted command, is reported as a [`CommandResult`]. Sandbox-level faults use the
//! reserved negative exit statuses below so callers branch on the status, not on control
//! flow.
//!
//! - [`executor`]: [`ProcessSandbox`], the process-backed implementation (`docker exec` or
//!   a local shell).
//! - [`guard`]: [`Denylist`] and the [`Guarded`] wrapper that rejects commands before
//!   dispatch.

pub mod executor;
pub mod guard;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use executor::{Backend, ProcessSandbox};
pub use guard::{Denylist, Guarded};

/// Workload missing, exec transport error or spawn failure.
pub const EXIT_SANDBOX_ERROR: i32 = -1;
/// The command ran past its timeout and was killed.
pub const EXIT_TIMEOUT: i32 = -2;
/// The command matched the denylist and was never dispatched.
pub const EXIT_REJECTED: i32 = -3;

/// Outcome of one sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The program's own exit code, or one of the reserved negative statuses.
    pub exit_status: i32,
    /// Captured stdout, cut at the output cap.
    pub stdout: String,
    /// Captured stderr, cut at the output cap; holds the reason for sandbox-level faults.
    pub stderr: String,
    /// Wall-clock time spent, in milliseconds.
    pub elapsed_ms: u64,
    /// True when either stream was cut at the output cap.
    pub truncated: bool,
}

impl CommandResult {
    /// A sandbox-level fault carrying `reason` in stderr.
    pub fn fault(exit_status: i32, reason: impl Into<String>, elapsed: Duration) -> Self {
        debug_assert!(exit_status < 0, "faults use reserved negative statuses");
        CommandResult {
            exit_status,
            stdout: String::new(),
            stderr: reason.into(),
            elapsed_ms: elapsed.as_millis() as u64,
            truncated: false,
        }
    }

    /// Result of a turn where nothing was dispatched.
    pub fn skipped() -> Self {
        CommandResult {
            exit_status: 0,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
            truncated: false,
        }
    }

    /// Exit status 0.
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }

    /// Negative status: the sandbox, not the program, decided the outcome.
    pub fn is_sandbox_fault(&self) -> bool {
        self.exit_status < 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_status == EXIT_TIMEOUT
    }

    pub fn rejected(&self) -> bool {
        self.exit_status == EXIT_REJECTED
    }

    /// stdout followed by stderr, the text classifiers look at.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Something able to run commands inside workloads.
///
/// Implementations must enforce `timeout` themselves (terminating the command, not just
/// abandoning it) and must not panic or return early on failure: every path ends in a
/// [`CommandResult`].
pub trait Sandbox {
    /// Run `command` inside `workload`.
    fn execute(&mut self, workload: &str, command: &str, timeout: Duration) -> CommandResult;

    /// Check once, before a game starts, that `workload` can accept commands.
    fn probe(&mut self, workload: &str) -> anyhow::Result<()>;
}

impl<S: Sandbox + ?Sized> Sandbox for Box<S> {
    fn execute(&mut self, workload: &str, command: &str, timeout: Duration) -> CommandResult {
        (**self).execute(workload, command, timeout)
    }

    fn probe(&mut self, workload: &str) -> anyhow::Result<()> {
        (**self).probe(workload)
    }
}
