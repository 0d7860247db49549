//! # Cyber Arena
//!
//! A turn-based arena where an offensive (red) and a defensive (blue) autonomous agent take
//! turns running shell commands inside sandboxed workloads, and a referee turns what they did
//! into scored events.
//!
//! It provides:
//! - A round loop with a fixed red-then-blue turn order and a round-number driven phase
//!   table ([`Arena`](crate::arena::Arena), [`phase`])
//! - Sandboxed command execution with timeouts, output caps and a command denylist
//!   ([`sandbox`])
//! - Rule-based event detection and a point table ([`detector`], [`scoring`])
//! - Durable, replayable game history ([`history`])
//! - Decision collaborators running as contained child processes, limited through Linux
//!   cgroups v2 and `taskset` ([`agent_process`], [`constraints`])
//!
//! # Documentation Overview
//!
//! - For the round loop and its fault handling, see the [`arena`] module.
//! - For configuring arena behavior and resource limits, see
//!   [`Configuration`](crate::configuration::Configuration) and [`constraints`].
//! - To plug another execution backend, decision source or storage, implement
//!   [`Sandbox`](crate::sandbox::Sandbox), [`DecisionMaker`](crate::decision::DecisionMaker)
//!   or [`HistorySink`](crate::history::HistorySink).
//!
//! # Usage Example
//!
//! ```no_run
//! use cyber_arena::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let constraints = ConstraintsBuilder::new()
//!         .with_command_timeout(std::time::Duration::from_secs(20))
//!         .build()?;
//!     let config = Configuration::new().with_max_rounds(10);
//!     let scenario = ScenarioCatalog::builtin().get(DEFAULT_SCENARIO)?.clone();
//!
//!     let sandbox = ProcessSandbox::new(Backend::docker(), &constraints, config.containment());
//!     let red = Player::new(
//!         Contestant::new(Side::Red, "scripted", &scenario.attacker_workload),
//!         Scripted::new([r#"{"rationale": "map the target", "command": "nmap -sV 172.20.0.10"}"#]),
//!     );
//!     let blue = Player::new(
//!         Contestant::new(Side::Blue, "scripted", &scenario.target_workload),
//!         Scripted::new(Vec::<String>::new()),
//!     );
//!
//!     let mut arena = Arena::new(scenario, sandbox, MemoryHistory::new(), red, blue)?
//!         .with_configuration(config)
//!         .with_constraints(&constraints);
//!     let outcome = arena.run()?;
//!     println!("{outcome}");
//!     Ok(())
//! }
//! ```
//!
//! # Agent Protocol
//!
//! Agent executables receive `<port> --side <red|blue> --model <model>` followed by their
//! own arguments, connect to `127.0.0.1:<port>`, then answer each newline-delimited JSON
//! request `{"request", "timeout_ms", "observation"}` with one line echoing the request
//! number next to a decision:
//!
//! ```json
//! {"request": 3, "decision": {"rationale": "...", "command": "nmap -sV 172.20.0.10", "expected_outcome": "...", "phase": "reconnaissance"}}
//! ```
//!
//! The decision may also be free text sent as a JSON string. Replies carrying another
//! request number are ignored. A `"none"` command is a deliberate no-action turn. See
//! [`decision`] for accepted shapes.

pub mod agent_process;
pub mod arena;
pub mod cgroup_manager;
pub mod configuration;
pub mod constraints;
pub mod decision;
pub mod detector;
pub mod game;
pub mod history;
mod logger;
pub mod phase;
pub mod sandbox;
pub mod scenario;
pub mod scoring;
pub mod series;
pub mod side;

pub use anyhow;
pub use logger::init_logger;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use cyber_arena::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent_process::ProcessAgent;
    pub use crate::arena::{Arena, Player};
    pub use crate::configuration::{Configuration, TieBreak};
    pub use crate::constraints::ConstraintsBuilder;
    pub use crate::decision::{DecisionMaker, Scripted};
    pub use crate::game::{EndReason, GameOutcome, GameStatus};
    pub use crate::history::{HistorySink, JsonlHistory, MemoryHistory};
    pub use crate::sandbox::{Backend, ProcessSandbox, Sandbox};
    pub use crate::scenario::{Scenario, ScenarioCatalog, DEFAULT_SCENARIO};
    pub use crate::series::{Series, SeriesScore};
    pub use crate::side::{Contestant, Side};
}
