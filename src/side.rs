//! The two competing roles and their immutable per-game configuration.

use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One of the two roles in a game.
///
/// `Red` is the offensive side, `Blue` the defensive one. The derived ordering (red before
/// blue) is the event-processing order used to break same-round ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Offense.
    Red,
    /// Defense.
    Blue,
}

impl Side {
    /// Both sides, in turn order.
    pub const BOTH: [Side; 2] = [Side::Red, Side::Blue];

    /// The other side.
    pub fn opponent(self) -> Side {
        match self {
            Side::Red => Side::Blue,
            Side::Blue => Side::Red,
        }
    }

    /// Lowercase label used in logs, history records and agent arguments.
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Red => "red",
            Side::Blue => "blue",
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the round loop needs to know about a side, fixed for the whole game.
///
/// Cross-round memory is not kept here: it lives in the history sink and is read back
/// when building each observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contestant {
    /// Which role this contestant plays.
    pub side: Side,
    /// Identifier of the decision model driving this side (recorded on the game).
    pub model: String,
    /// Workload every command of this side is dispatched to.
    pub workload: String,
    /// Optional agent executable; when set the decision collaborator is a child process.
    pub agent_exe: Option<PathBuf>,
    /// Extra arguments handed to the agent executable.
    pub agent_args: Vec<String>,
}

impl Contestant {
    /// Create a contestant without an agent executable.
    pub fn new(side: Side, model: impl Into<String>, workload: impl Into<String>) -> Self {
        Contestant {
            side,
            model: model.into(),
            workload: workload.into(),
            agent_exe: None,
            agent_args: vec![],
        }
    }

    /// Run the decision collaborator as the given executable.
    pub fn with_agent_exe(self, exe: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Contestant {
            agent_exe: Some(exe.into()),
            agent_args: args,
            ..self
        }
    }
}
