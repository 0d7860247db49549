//! Game and round records.
//!
//! A [`Game`] is mutated only by the round loop (scores, status, winner, end time) and is
//! frozen once its status leaves [`GameStatus::Running`]. A [`Round`] is built once per
//! loop iteration, with its points finalized by scoring before it is persisted.

use std::fmt;

use anyhow::ensure;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{sandbox::CommandResult, scoring::Scores, side::Side};

pub type GameId = Uuid;
pub type RoundId = Uuid;

/// Characters of a command's output kept in a history window entry.
const PRIOR_OUTPUT_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GameStatus::Running => "running",
            GameStatus::Completed => "completed",
            GameStatus::Aborted => "aborted",
        })
    }
}

/// Why a game stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A side-specific terminal event was recorded.
    TerminalEvent,
    /// `max_rounds` rounds were played.
    RoundLimit,
    /// An external stop request was observed at a round boundary.
    StopSignal,
    /// The history sink failed twice on the same round.
    PersistenceFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub scenario_id: String,
    pub red_model: String,
    pub blue_model: String,
    pub max_rounds: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub ended_at: Option<OffsetDateTime>,
    pub scores: Scores,
    pub status: GameStatus,
    pub winner: Option<Side>,
    #[serde(default)]
    pub end_reason: Option<EndReason>,
}

impl Game {
    pub fn new(
        scenario_id: impl Into<String>,
        red_model: impl Into<String>,
        blue_model: impl Into<String>,
        max_rounds: u32,
    ) -> Self {
        Game {
            id: Uuid::new_v4(),
            scenario_id: scenario_id.into(),
            red_model: red_model.into(),
            blue_model: blue_model.into(),
            max_rounds,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
            scores: Scores::default(),
            status: GameStatus::Running,
            winner: None,
            end_reason: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == GameStatus::Running
    }

    /// Replace the cumulative scores with the totals of a persisted round.
    pub(crate) fn apply_scores(&mut self, totals: Scores) -> anyhow::Result<()> {
        ensure!(self.is_running(), "game {} is {}, scores are frozen", self.id, self.status);
        self.scores = totals;
        Ok(())
    }

    /// Leave the running state. Only allowed once.
    pub(crate) fn end(
        &mut self,
        status: GameStatus,
        winner: Option<Side>,
        reason: EndReason,
    ) -> anyhow::Result<()> {
        ensure!(self.is_running(), "game {} already ended", self.id);
        ensure!(status != GameStatus::Running, "a game cannot end as running");
        self.status = status;
        self.winner = winner;
        self.end_reason = Some(reason);
        self.ended_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }
}

/// One side's half of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub side: Side,
    /// Observation handed to the decision collaborator.
    pub observation: serde_json::Value,
    pub rationale: String,
    /// Issued command, `None` for no action.
    pub command: Option<String>,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    pub result: CommandResult,
    pub success: bool,
    /// Sum of the points of this side's events in the round.
    pub points: i64,
    pub decision_valid: bool,
    /// Why the decision was unusable, when it was.
    #[serde(default)]
    pub decision_error: Option<String>,
}

impl TurnRecord {
    /// The command, or `"none"`.
    pub fn action(&self) -> &str {
        self.command.as_deref().unwrap_or("none")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub game_id: GameId,
    /// 1-based, contiguous within a game.
    pub number: u32,
    /// Label of the phase containing `number`.
    pub phase: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration_ms: u64,
    pub red: TurnRecord,
    pub blue: TurnRecord,
    /// Opaque snapshot of the game state, passed through to the history sink.
    pub state: serde_json::Value,
}

impl Round {
    pub fn turn(&self, side: Side) -> &TurnRecord {
        match side {
            Side::Red => &self.red,
            Side::Blue => &self.blue,
        }
    }

    pub fn points(&self) -> Scores {
        Scores::new(self.red.points, self.blue.points)
    }
}

/// A past turn as shown in an observation's history window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorTurn {
    pub round_number: u32,
    pub phase: String,
    pub rationale: String,
    pub action: String,
    pub exit_status: i32,
    pub success: bool,
    pub output: String,
    pub points: i64,
}

impl PriorTurn {
    pub fn from_round(round: &Round, side: Side) -> Self {
        let turn = round.turn(side);
        let mut output = turn.result.combined_output();
        if let Some((cut, _)) = output.char_indices().nth(PRIOR_OUTPUT_CHARS) {
            output.truncate(cut);
            output.push_str("...");
        }
        PriorTurn {
            round_number: round.number,
            phase: round.phase.clone(),
            rationale: turn.rationale.clone(),
            action: turn.action().to_string(),
            exit_status: turn.result.exit_status,
            success: turn.success,
            output,
            points: turn.points,
        }
    }
}

/// Final state of a game returned by the round loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameOutcome {
    pub game: Game,
    pub rounds_played: u32,
}

impl fmt::Display for GameOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let winner = self.game.winner.map_or("none", Side::as_str);
        write!(
            f,
            "game {} {} after {} round(s): winner {winner}, red {} / blue {}",
            self.game.id,
            self.game.status,
            self.rounds_played,
            self.game.scores.red,
            self.game.scores.blue,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn turn(side: Side, command: Option<&str>, stdout: &str) -> TurnRecord {
        TurnRecord {
            side,
            observation: serde_json::Value::Null,
            rationale: String::new(),
            command: command.map(str::to_string),
            expected_outcome: None,
            result: CommandResult {
                stdout: stdout.to_string(),
                ..CommandResult::skipped()
            },
            success: command.is_some(),
            points: 0,
            decision_valid: true,
            decision_error: None,
        }
    }

    pub(crate) fn round(game_id: GameId, number: u32) -> Round {
        Round {
            id: Uuid::new_v4(),
            game_id,
            number,
            phase: "reconnaissance".into(),
            started_at: OffsetDateTime::now_utc(),
            duration_ms: 0,
            red: turn(Side::Red, Some("nmap 172.20.0.10"), "22/tcp open ssh"),
            blue: turn(Side::Blue, None, ""),
            state: serde_json::Value::Null,
        }
    }

    #[test]
    fn ended_games_are_frozen() {
        let mut game = Game::new("dvwa_basic_pentest", "red-model", "blue-model", 5);
        game.apply_scores(Scores::new(10, 0)).unwrap();
        game.end(GameStatus::Completed, Some(Side::Red), EndReason::RoundLimit)
            .unwrap();
        assert!(game.ended_at.is_some());
        assert!(game.apply_scores(Scores::new(20, 0)).is_err());
        assert!(game
            .end(GameStatus::Aborted, None, EndReason::StopSignal)
            .is_err());
        assert_eq!(game.scores, Scores::new(10, 0));
        assert_eq!(game.winner, Some(Side::Red));
    }

    #[test]
    fn games_serialize_with_rfc3339_timestamps() {
        let game = Game::new("s", "r", "b", 3);
        let json = serde_json::to_value(&game).unwrap();
        assert_eq!(json["status"], "running");
        assert!(json["started_at"].as_str().unwrap().contains('T'));
        let back: Game = serde_json::from_value(json).unwrap();
        assert_eq!(back, game);
    }

    #[test]
    fn prior_turns_show_none_for_idle_turns_and_cut_long_output() {
        let mut round = round(Uuid::new_v4(), 1);
        round.red.result.stdout = "x".repeat(PRIOR_OUTPUT_CHARS + 10);
        let red = PriorTurn::from_round(&round, Side::Red);
        assert_eq!(red.action, "nmap 172.20.0.10");
        assert_eq!(red.output.chars().count(), PRIOR_OUTPUT_CHARS + 3);
        let blue = PriorTurn::from_round(&round, Side::Blue);
        assert_eq!(blue.action, "none");
    }
}
