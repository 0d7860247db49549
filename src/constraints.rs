//! Resource limits for sandboxed commands and agent processes.
//!
//! Constraints cover:
//!
//! - **Timing**: the hard per-command timeout enforced by the sandbox, and the time an
//!   agent is given to produce a decision
//! - **Output**: the byte cap applied to each captured stream
//! - **Memory**: RAM per agent process and per sandboxed command
//! - **CPU**: the CPU list agents are pinned to, and how many CPUs each agent gets
//!
//! Memory and CPU limits are enforced with Linux cgroups v2 when available (see
//! [`Configuration`](crate::configuration::Configuration) for the uncontained fallback).
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use cyber_arena::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_command_timeout(Duration::from_secs(20))
//!     .with_decision_timeout(Duration::from_secs(90))
//!     .with_output_cap(32 * 1024)
//!     .with_ram_per_agent(2_000)
//!     .build()
//!     .unwrap();
//! assert_eq!(constraints.command_timeout(), Duration::from_secs(20));
//! ```

use std::{collections::BTreeSet, env, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

use crate::cgroup_manager::ProcessLimits;

pub(crate) const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_OUTPUT_CAP: usize = 64 * 1024;

#[derive(Debug, Default)]
enum AutoCpus {
    #[default]
    Auto,
    Count(usize),
    List(String),
}

/// A builder for the arena's resource limits.
///
/// By default commands time out after 30 seconds, decisions after 60 seconds, each output
/// stream is capped at 64 KiB, agents get one CPU each from the physical CPUs of the host
/// and an even share of the available memory, and commands have no memory limit.
#[derive(Debug, Default)]
pub struct ConstraintsBuilder {
    total_ram: Option<usize>,
    agent_ram: Option<usize>,
    command_ram: Option<usize>,
    cpus: AutoCpus,
    cpus_per_agent: Option<usize>,
    command_timeout: Option<Duration>,
    decision_timeout: Option<Duration>,
    output_cap: Option<usize>,
}

impl ConstraintsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `MAX_TOTAL_RAM` (usize): total RAM for agents, in MB
    /// - `RAM_PER_AGENT` (usize): RAM per agent process, in MB
    /// - `RAM_PER_COMMAND` (usize): RAM per sandboxed command, in MB
    /// - `CPU_LIST` (string): comma-separated list or ranges of CPUs, e.g. "0-3,6"
    /// - `TOTAL_CPU_COUNT` (usize): number of CPUs, overridden by `CPU_LIST`
    /// - `CPUS_PER_AGENT` (usize): CPUs per agent process
    /// - `COMMAND_TIMEOUT` (u64): per-command timeout in seconds
    /// - `DECISION_TIMEOUT` (u64): per-decision timeout in seconds
    /// - `OUTPUT_CAP_BYTES` (usize): byte cap per captured stream
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

        let cpus = if let Ok(list) = env::var("CPU_LIST") {
            AutoCpus::List(list)
        } else if let Some(count) = parse_usize("TOTAL_CPU_COUNT") {
            AutoCpus::Count(count)
        } else {
            AutoCpus::Auto
        };

        ConstraintsBuilder {
            total_ram: parse_usize("MAX_TOTAL_RAM"),
            agent_ram: parse_usize("RAM_PER_AGENT"),
            command_ram: parse_usize("RAM_PER_COMMAND"),
            cpus,
            cpus_per_agent: parse_usize("CPUS_PER_AGENT"),
            command_timeout: parse_duration_secs("COMMAND_TIMEOUT"),
            decision_timeout: parse_duration_secs("DECISION_TIMEOUT"),
            output_cap: parse_usize("OUTPUT_CAP_BYTES"),
        }
    }

    /// Total RAM available to agent processes (in MB).
    #[must_use]
    pub fn with_max_total_ram(self, max: usize) -> Self {
        Self {
            total_ram: Some(max),
            ..self
        }
    }

    /// RAM per agent process (in MB).
    #[must_use]
    pub fn with_ram_per_agent(self, max: usize) -> Self {
        Self {
            agent_ram: Some(max),
            ..self
        }
    }

    /// RAM per sandboxed command process (in MB).
    #[must_use]
    pub fn with_ram_per_command(self, max: usize) -> Self {
        Self {
            command_ram: Some(max),
            ..self
        }
    }

    /// CPUs agents may run on, as `"0-3,6,8"`.
    #[must_use]
    pub fn with_cpu_list(self, cpus: &str) -> Self {
        Self {
            cpus: AutoCpus::List(cpus.to_string()),
            ..self
        }
    }

    /// Number of CPUs agents may run on. Ignored if `with_cpu_list` is also used.
    #[must_use]
    pub fn with_total_cpu_count(self, max: usize) -> Self {
        if let AutoCpus::List(_) = self.cpus {
            warn!("`with_total_cpu_count` is ignored if `with_cpu_list` is used!");
            self
        } else {
            Self {
                cpus: AutoCpus::Count(max),
                ..self
            }
        }
    }

    /// CPUs per agent process. Default is one.
    #[must_use]
    pub fn with_cpus_per_agent(self, max: usize) -> Self {
        Self {
            cpus_per_agent: Some(max),
            ..self
        }
    }

    /// Hard wall-clock limit for one sandboxed command.
    #[must_use]
    pub fn with_command_timeout(self, duration: Duration) -> Self {
        Self {
            command_timeout: Some(duration),
            ..self
        }
    }

    /// Time an agent has to answer with a decision.
    #[must_use]
    pub fn with_decision_timeout(self, duration: Duration) -> Self {
        Self {
            decision_timeout: Some(duration),
            ..self
        }
    }

    /// Byte cap per captured output stream.
    #[must_use]
    pub fn with_output_cap(self, bytes: usize) -> Self {
        Self {
            output_cap: Some(bytes),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed [`Constraints`].
    ///
    /// # Errors
    ///
    /// Impossible constraints: zero timeouts or output cap, agent RAM above total RAM,
    /// an unparsable CPU list.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let command_timeout = self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let decision_timeout = self.decision_timeout.unwrap_or(DEFAULT_DECISION_TIMEOUT);
        let output_cap = self.output_cap.unwrap_or(DEFAULT_OUTPUT_CAP);
        if command_timeout.is_zero() {
            bail!("command timeout must be greater than zero");
        }
        if decision_timeout.is_zero() {
            bail!("decision timeout must be greater than zero");
        }
        if output_cap == 0 {
            bail!("output cap must be greater than zero");
        }

        let mut sys = sysinfo::System::new();
        let total_ram = self.total_ram.map(|i| i * 1_000_000).unwrap_or_else(|| {
            sys.refresh_memory();
            sys.available_memory() as usize
        });

        if total_ram < (self.agent_ram.unwrap_or(0) * 1_000_000) {
            bail!(
                "Agent RAM size ({}MB) is greater than total RAM ({}MB)",
                self.agent_ram.unwrap_or(0),
                total_ram / 1_000_000
            );
        }

        // physical CPUs by default: agents sharing hyperthreads run at half speed
        let cpus = match self.cpus {
            AutoCpus::Auto => (0..num_cpus::get_physical() as u8).collect::<BTreeSet<u8>>(),
            AutoCpus::Count(num_cpus) => (0..(num_cpus as u8)).collect::<BTreeSet<u8>>(),
            AutoCpus::List(s) => {
                cpu_list_to_set(&s).map_err(|e| e.context("error parsing cpu list"))?
            }
        };
        let cpus_per_agent = self.cpus_per_agent.unwrap_or(1).max(1);
        let agent_ram = self
            .agent_ram
            .map(|i| i * 1_000_000)
            .unwrap_or_else(|| total_ram / 2);

        Ok(Constraints {
            total_ram,
            agent_ram,
            command_ram: self.command_ram.map(|i| i * 1_000_000),
            cpus,
            cpus_per_agent,
            command_timeout,
            decision_timeout,
            output_cap,
        })
    }
}

fn cpu_list_to_set(s: &str) -> anyhow::Result<BTreeSet<u8>> {
    if s.is_empty() {
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
            .collect::<anyhow::Result<Vec<u8>>>()?;
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
    pub(crate) total_ram: usize,
    pub(crate) agent_ram: usize,
    pub(crate) command_ram: Option<usize>,
    pub(crate) cpus: BTreeSet<u8>,
    pub(crate) cpus_per_agent: usize,
    pub(crate) command_timeout: Duration,
    pub(crate) decision_timeout: Duration,
    pub(crate) output_cap: usize,
}

impl Constraints {
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn decision_timeout(&self) -> Duration {
        self.decision_timeout
    }

    pub fn output_cap(&self) -> usize {
        self.output_cap
    }

    /// Limits for one agent process, taking its CPUs and RAM out of the pool.
    ///
    /// When the pool is exhausted the agent is still given its RAM cap but no CPU pinning.
    pub fn take_agent_limits(&mut self) -> ProcessLimits {
        let ram = self.agent_ram.min(self.total_ram);
        self.total_ram -= ram;
        let cpus = if self.cpus.len() >= self.cpus_per_agent {
            let taken: Vec<u8> = self.cpus.iter().copied().take(self.cpus_per_agent).collect();
            for cpu in &taken {
                self.cpus.remove(cpu);
            }
            taken
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(",")
        } else {
            warn!("not enough CPUs left to pin an agent, running it unpinned");
            String::new()
        };
        ProcessLimits {
            max_memory: (ram > 0).then_some(ram),
            max_pids: Some(128),
            cpus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let constraints = ConstraintsBuilder::new().build().unwrap();
        assert_eq!(constraints.command_timeout(), Duration::from_secs(30));
        assert_eq!(constraints.decision_timeout(), Duration::from_secs(60));
        assert_eq!(constraints.output_cap(), 64 * 1024);
        assert_eq!(constraints.command_ram, None);
        assert_eq!(constraints.cpus_per_agent, 1);
    }

    #[test]
    fn cpu_lists() {
        assert_eq!(
            cpu_list_to_set("0-3,6").unwrap(),
            BTreeSet::from([0, 1, 2, 3, 6])
        );
        assert_eq!(cpu_list_to_set("5-3").unwrap(), BTreeSet::from([3, 4, 5]));
        assert!(cpu_list_to_set("").is_err());
        assert!(cpu_list_to_set("1-2-3").is_err());
        assert!(cpu_list_to_set("a").is_err());
    }

    #[test]
    fn rejects_impossible_constraints() {
        assert!(ConstraintsBuilder::new()
            .with_command_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(ConstraintsBuilder::new().with_output_cap(0).build().is_err());
        assert!(ConstraintsBuilder::new()
            .with_max_total_ram(100)
            .with_ram_per_agent(200)
            .build()
            .is_err());
    }

    #[test]
    fn agents_take_disjoint_cpus() {
        let mut constraints = ConstraintsBuilder::new()
            .with_cpu_list("0-3")
            .with_cpus_per_agent(2)
            .with_max_total_ram(1000)
            .with_ram_per_agent(400)
            .build()
            .unwrap();
        let red = constraints.take_agent_limits();
        let blue = constraints.take_agent_limits();
        assert_eq!(red.cpus, "0,1");
        assert_eq!(blue.cpus, "2,3");
        assert_eq!(red.max_memory, Some(400_000_000));
        assert_eq!(constraints.total_ram, 200_000_000);

        let third = constraints.take_agent_limits();
        assert_eq!(third.cpus, "");
        assert_eq!(third.max_memory, Some(200_000_000));
    }
}
