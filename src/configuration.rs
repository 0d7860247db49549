//! Config for the arena behaviors
//!
//! This module provides configuration options for controlling the behavior of the round loop.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Flags are case-insensitive, set the value to `"true"` to enable one.
//!
//! - `ARENA_VERBOSE`: print round progress to stdout (default: `true`)
//! - `ARENA_LOG`: enable logging to a file (default: `false`)
//! - `ARENA_ALLOW_UNCONTAINED`: run commands and agents without a cgroup when one cannot be
//!   created (default: `false`)
//! - `ARENA_DEBUG_AGENT_STDERR`: print agent stderr for debugging (default: `false`)
//! - `ARENA_MAX_ROUNDS`: round limit of a game (default: `30`)
//! - `ARENA_HISTORY_WINDOW`: number of prior turns shown to an agent (default: `5`)
//! - `ARENA_TIE_BREAK`: `higher_score` or `draw` (default: `higher_score`)
//! - `ARENA_SCORE_FLOOR`: lowest cumulative score a side can reach (default: unset)
//! - `ARENA_PERSIST_BACKOFF_MS`: wait before retrying a failed history write (default: `500`)
//! - `ARENA_ROUND_PAUSE_MS`: pause between rounds (default: `0`)

use std::{str::FromStr, time::Duration};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cgroup_manager::Containment;

/// How the winner is chosen when the round limit is reached without a terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The side with the higher cumulative score wins; equal scores give no winner.
    #[default]
    HigherScore,
    /// No winner.
    Draw,
}

impl FromStr for TieBreak {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "higher_score" | "score" => Ok(TieBreak::HigherScore),
            "draw" | "none" => Ok(TieBreak::Draw),
            other => bail!("unknown tie-break '{other}', expected 'higher_score' or 'draw'"),
        }
    }
}

/// Configuration for arena behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) debug_agent_stderr: bool,
    pub(crate) max_rounds: u32,
    pub(crate) history_window: usize,
    pub(crate) tie_break: TieBreak,
    pub(crate) score_floor: Option<i64>,
    pub(crate) persist_backoff: Duration,
    pub(crate) round_pause: Duration,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - The arena will print round progress to stdout.
    /// - Logging to file is disabled.
    /// - Every command and agent must run inside a cgroup.
    /// - Agent stderr output is disabled.
    /// - Games last at most 30 rounds, agents see their last 5 turns.
    /// - At the round limit the higher score wins, and scores are not clamped.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            allow_uncontained: false,
            debug_agent_stderr: false,
            max_rounds: 30,
            history_window: 5,
            tie_break: TieBreak::HigherScore,
            score_floor: None,
            persist_backoff: Duration::from_millis(500),
            round_pause: Duration::ZERO,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the [module documentation](self) for the recognized variables. Unset or
    /// unparsable values keep their default (a warning is logged for unparsable ones).
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_value<T: FromStr>(var: &str) -> Option<T> {
            let raw = std::env::var(var).ok()?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("ignoring unparsable {var}='{raw}'");
                    None
                }
            }
        }

        let default = Self::new();
        Self {
            verbose: get_env_flag("ARENA_VERBOSE", default.verbose),
            log: get_env_flag("ARENA_LOG", default.log),
            allow_uncontained: get_env_flag("ARENA_ALLOW_UNCONTAINED", default.allow_uncontained),
            debug_agent_stderr: get_env_flag(
                "ARENA_DEBUG_AGENT_STDERR",
                default.debug_agent_stderr,
            ),
            max_rounds: get_env_value("ARENA_MAX_ROUNDS").unwrap_or(default.max_rounds),
            history_window: get_env_value("ARENA_HISTORY_WINDOW")
                .unwrap_or(default.history_window),
            tie_break: get_env_value("ARENA_TIE_BREAK").unwrap_or(default.tie_break),
            score_floor: get_env_value("ARENA_SCORE_FLOOR").or(default.score_floor),
            persist_backoff: get_env_value("ARENA_PERSIST_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.persist_backoff),
            round_pause: get_env_value("ARENA_ROUND_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.round_pause),
        }
    }

    /// Enable or disable round progress on stdout.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Allow or forbid running without cgroups.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable agent stderr output (debug purposes only).
    pub fn with_debug_agent_stderr(mut self, value: bool) -> Self {
        self.debug_agent_stderr = value;
        self
    }

    /// Round limit of a game.
    pub fn with_max_rounds(mut self, value: u32) -> Self {
        self.max_rounds = value;
        self
    }

    /// Number of prior turns included in each observation.
    pub fn with_history_window(mut self, value: usize) -> Self {
        self.history_window = value;
        self
    }

    pub fn with_tie_break(mut self, value: TieBreak) -> Self {
        self.tie_break = value;
        self
    }

    /// Lowest cumulative score a side can reach. `None` lets scores go negative freely.
    pub fn with_score_floor(mut self, value: Option<i64>) -> Self {
        self.score_floor = value;
        self
    }

    /// Wait before the single retry of a failed history write.
    pub fn with_persist_backoff(mut self, value: Duration) -> Self {
        self.persist_backoff = value;
        self
    }

    /// Pause between two rounds.
    pub fn with_round_pause(mut self, value: Duration) -> Self {
        self.round_pause = value;
        self
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log(&self) -> bool {
        self.log
    }

    pub fn debug_agent_stderr(&self) -> bool {
        self.debug_agent_stderr
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn score_floor(&self) -> Option<i64> {
        self.score_floor
    }

    /// Containment policy derived from `allow_uncontained`.
    pub fn containment(&self) -> Containment {
        if self.allow_uncontained {
            Containment::Preferred
        } else {
            Containment::Required
        }
    }

    /// # Errors
    /// When the round limit is zero.
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.max_rounds == 0 {
            bail!("max_rounds must be at least 1");
        }
        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_break_parsing() {
        assert_eq!("higher_score".parse::<TieBreak>().unwrap(), TieBreak::HigherScore);
        assert_eq!("Higher-Score".parse::<TieBreak>().unwrap(), TieBreak::HigherScore);
        assert_eq!("draw".parse::<TieBreak>().unwrap(), TieBreak::Draw);
        assert!("coin_flip".parse::<TieBreak>().is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = Configuration::new()
            .with_max_rounds(5)
            .with_tie_break(TieBreak::Draw)
            .with_score_floor(Some(0))
            .with_allow_uncontained(true);
        assert_eq!(config.max_rounds(), 5);
        assert_eq!(config.tie_break(), TieBreak::Draw);
        assert_eq!(config.score_floor(), Some(0));
        assert_eq!(config.containment(), Containment::Preferred);
        assert_eq!(Configuration::default().containment(), Containment::Required);
    }

    #[test]
    fn zero_rounds_is_invalid() {
        assert!(Configuration::new().with_max_rounds(0).validate().is_err());
        assert!(Configuration::new().validate().is_ok());
    }
}
