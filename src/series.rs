//! Several games in a row between the same two players.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    arena::Arena,
    game::{EndReason, GameOutcome, GameStatus},
    history::HistorySink,
    sandbox::Sandbox,
    scoring::Scores,
    side::Side,
};

/// Aggregated results of a series, from the point of view of both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesScore {
    pub red_wins: u32,
    pub blue_wins: u32,
    /// Completed games without a winner.
    pub draws: u32,
    /// Games that did not complete.
    pub aborted: u32,
    /// Sum of the final scores of every game, completed or not.
    pub totals: Scores,
}

impl SeriesScore {
    pub fn record(&mut self, outcome: &GameOutcome) {
        let game = &outcome.game;
        match (game.status, game.winner) {
            (GameStatus::Completed, Some(Side::Red)) => self.red_wins += 1,
            (GameStatus::Completed, Some(Side::Blue)) => self.blue_wins += 1,
            (GameStatus::Completed, None) => self.draws += 1,
            _ => self.aborted += 1,
        }
        self.totals = self.totals.plus(game.scores);
    }

    pub fn games(&self) -> u32 {
        self.red_wins + self.blue_wins + self.draws + self.aborted
    }
}

impl fmt::Display for SeriesScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "red wins: {}, blue wins: {}, draw: {}, aborted: {}, points: {} - {}",
            self.red_wins, self.blue_wins, self.draws, self.aborted, self.totals.red, self.totals.blue
        )
    }
}

/// Plays a fixed number of games on one arena.
#[derive(Debug, Clone, Copy)]
pub struct Series {
    games: u32,
}

impl Series {
    /// # Panics
    /// If `games` is zero.
    pub fn new(games: u32) -> Self {
        assert!(games >= 1, "Must play at least one game.");
        Series { games }
    }

    /// Play the games one after the other, each recorded as its own game in the arena's
    /// history. A stop request ends the series after the game it aborted.
    ///
    /// # Errors
    /// Startup faults of any game (see [`Arena::run`]).
    pub fn run<S: Sandbox, H: HistorySink>(
        &self,
        arena: &mut Arena<S, H>,
    ) -> anyhow::Result<(SeriesScore, Vec<GameOutcome>)> {
        let mut score = SeriesScore::default();
        let mut outcomes = Vec::with_capacity(self.games as usize);
        for index in 1..=self.games {
            info!(game = index, of = self.games, "starting game");
            let outcome = arena.run()?;
            score.record(&outcome);
            let stopped = outcome.game.end_reason == Some(EndReason::StopSignal);
            outcomes.push(outcome);
            if stopped {
                warn!("series stopped after {index} game(s)");
                break;
            }
        }
        info!("{score}");
        Ok((score, outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Game;

    fn outcome(status: GameStatus, winner: Option<Side>, scores: Scores) -> GameOutcome {
        let mut game = Game::new("s", "r", "b", 3);
        game.apply_scores(scores).unwrap();
        game.end(status, winner, EndReason::RoundLimit).unwrap();
        GameOutcome {
            game,
            rounds_played: 3,
        }
    }

    #[test]
    fn outcomes_are_tallied() {
        let mut score = SeriesScore::default();
        score.record(&outcome(GameStatus::Completed, Some(Side::Red), Scores::new(120, 5)));
        score.record(&outcome(GameStatus::Completed, None, Scores::new(10, 10)));
        score.record(&outcome(GameStatus::Aborted, None, Scores::new(-5, 0)));
        score.record(&outcome(GameStatus::Completed, Some(Side::Blue), Scores::new(0, 95)));
        assert_eq!(score.red_wins, 1);
        assert_eq!(score.blue_wins, 1);
        assert_eq!(score.draws, 1);
        assert_eq!(score.aborted, 1);
        assert_eq!(score.games(), 4);
        assert_eq!(score.totals, Scores::new(125, 110));
        assert_eq!(
            score.to_string(),
            "red wins: 1, blue wins: 1, draw: 1, aborted: 1, points: 125 - 110"
        );
    }

    #[test]
    #[should_panic]
    fn empty_series_are_refused() {
        Series::new(0);
    }
}
