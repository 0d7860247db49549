//! History sink: the narrow persistence contract of the round loop.
//!
//! - [`HistorySink`]: the trait the loop writes games, rounds, events and score updates
//!   through, and reads history windows back from.
//! - [`MemoryHistory`]: in-process store, also the replay target of the file log.
//! - [`JsonlHistory`]: append-only JSON-lines file, one record per write, rebuilt on open.
//!
//! The round loop persists through [`HistorySink::record_round`], which stores a round, its
//! events and its score delta together or not at all. The finer-grained writes stay
//! available to tools that build a history by hand.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    game::{Game, GameId, PriorTurn, Round, RoundId},
    scoring::{Event, ScoreDelta, Scores},
    side::Side,
};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("game {0} is not known to the history")]
    UnknownGame(GameId),

    #[error("game {0} is already recorded")]
    DuplicateGame(GameId),

    #[error("game {0} has ended, its history is closed")]
    GameEnded(GameId),

    #[error("round {got} of game {game} is out of sequence, expected round {expected}")]
    OutOfSequence { game: GameId, expected: u32, got: u32 },

    #[error("event references round {round} of game {game}, which is not recorded")]
    DanglingEvent { game: GameId, round: u32 },

    /// Backend reachable but refusing work, or not reachable at all.
    #[error("history backend unavailable: {0}")]
    Unavailable(String),

    #[error("history i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("history record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("history file {path} is corrupt at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Persistence contract used by the round loop.
///
/// Implementations must reject a round whose number is not the next one of its game, so
/// the recorded sequence stays contiguous.
pub trait HistorySink {
    /// Record a freshly started game.
    fn create_game(&mut self, game: &Game) -> HistoryResult<()>;

    /// Record a complete round and return its id.
    fn append_round(&mut self, round: &Round) -> HistoryResult<RoundId>;

    /// Record one scored event of an already recorded round.
    fn append_event(&mut self, event: &Event) -> HistoryResult<()>;

    /// Add `delta` to the game's cumulative scores and return the new totals.
    fn update_scores(&mut self, game_id: GameId, delta: ScoreDelta) -> HistoryResult<Scores>;

    /// Record `round`, its `events` and its score `delta` as a single write and return the
    /// new totals.
    ///
    /// All or nothing: on error none of the three is recorded, so the call can be retried.
    fn record_round(
        &mut self,
        round: &Round,
        events: &[Event],
        delta: ScoreDelta,
    ) -> HistoryResult<Scores>;

    /// Record the final state of a game.
    fn end_game(&mut self, game: &Game) -> HistoryResult<()>;

    /// Up to `limit` most recent turns of `side`, most recent last.
    fn read_recent(&self, game_id: GameId, side: Side, limit: usize)
        -> HistoryResult<Vec<PriorTurn>>;

    /// Every recorded event of the game, optionally only those of `side`, in order.
    fn read_events(&self, game_id: GameId, side: Option<Side>) -> HistoryResult<Vec<Event>>;
}

impl<H: HistorySink + ?Sized> HistorySink for &mut H {
    fn create_game(&mut self, game: &Game) -> HistoryResult<()> {
        (**self).create_game(game)
    }

    fn append_round(&mut self, round: &Round) -> HistoryResult<RoundId> {
        (**self).append_round(round)
    }

    fn append_event(&mut self, event: &Event) -> HistoryResult<()> {
        (**self).append_event(event)
    }

    fn update_scores(&mut self, game_id: GameId, delta: ScoreDelta) -> HistoryResult<Scores> {
        (**self).update_scores(game_id, delta)
    }

    fn record_round(
        &mut self,
        round: &Round,
        events: &[Event],
        delta: ScoreDelta,
    ) -> HistoryResult<Scores> {
        (**self).record_round(round, events, delta)
    }

    fn end_game(&mut self, game: &Game) -> HistoryResult<()> {
        (**self).end_game(game)
    }

    fn read_recent(
        &self,
        game_id: GameId,
        side: Side,
        limit: usize,
    ) -> HistoryResult<Vec<PriorTurn>> {
        (**self).read_recent(game_id, side, limit)
    }

    fn read_events(&self, game_id: GameId, side: Option<Side>) -> HistoryResult<Vec<Event>> {
        (**self).read_events(game_id, side)
    }
}

impl<H: HistorySink + ?Sized> HistorySink for Box<H> {
    fn create_game(&mut self, game: &Game) -> HistoryResult<()> {
        (**self).create_game(game)
    }

    fn append_round(&mut self, round: &Round) -> HistoryResult<RoundId> {
        (**self).append_round(round)
    }

    fn append_event(&mut self, event: &Event) -> HistoryResult<()> {
        (**self).append_event(event)
    }

    fn update_scores(&mut self, game_id: GameId, delta: ScoreDelta) -> HistoryResult<Scores> {
        (**self).update_scores(game_id, delta)
    }

    fn record_round(
        &mut self,
        round: &Round,
        events: &[Event],
        delta: ScoreDelta,
    ) -> HistoryResult<Scores> {
        (**self).record_round(round, events, delta)
    }

    fn end_game(&mut self, game: &Game) -> HistoryResult<()> {
        (**self).end_game(game)
    }

    fn read_recent(
        &self,
        game_id: GameId,
        side: Side,
        limit: usize,
    ) -> HistoryResult<Vec<PriorTurn>> {
        (**self).read_recent(game_id, side, limit)
    }

    fn read_events(&self, game_id: GameId, side: Option<Side>) -> HistoryResult<Vec<Event>> {
        (**self).read_events(game_id, side)
    }
}

// ---------------------------------------------------------------------------
// MemoryHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct GameLog {
    game: Game,
    rounds: Vec<Round>,
    events: Vec<Event>,
    ended: bool,
}

/// In-memory history, ordered by game creation.
#[derive(Debug, Default, Clone)]
pub struct MemoryHistory {
    games: Vec<GameLog>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, game_id: GameId) -> HistoryResult<&GameLog> {
        self.games
            .iter()
            .find(|log| log.game.id == game_id)
            .ok_or(HistoryError::UnknownGame(game_id))
    }

    fn log_mut(&mut self, game_id: GameId) -> HistoryResult<&mut GameLog> {
        self.games
            .iter_mut()
            .find(|log| log.game.id == game_id)
            .ok_or(HistoryError::UnknownGame(game_id))
    }

    fn open_log(&self, game_id: GameId) -> HistoryResult<&GameLog> {
        let log = self.log(game_id)?;
        if log.ended {
            return Err(HistoryError::GameEnded(game_id));
        }
        Ok(log)
    }

    fn check_new_game(&self, game: &Game) -> HistoryResult<()> {
        if self.log(game.id).is_ok() {
            return Err(HistoryError::DuplicateGame(game.id));
        }
        Ok(())
    }

    fn check_round(&self, round: &Round) -> HistoryResult<()> {
        let log = self.open_log(round.game_id)?;
        let expected = log.rounds.len() as u32 + 1;
        if round.number != expected {
            return Err(HistoryError::OutOfSequence {
                game: round.game_id,
                expected,
                got: round.number,
            });
        }
        Ok(())
    }

    fn check_event(&self, event: &Event) -> HistoryResult<()> {
        let log = self.open_log(event.game_id)?;
        if !log.rounds.iter().any(|r| r.number == event.round_number) {
            return Err(HistoryError::DanglingEvent {
                game: event.game_id,
                round: event.round_number,
            });
        }
        Ok(())
    }

    /// Every event must belong to `round`, which is about to be recorded.
    fn check_round_events(&self, round: &Round, events: &[Event]) -> HistoryResult<()> {
        self.check_round(round)?;
        match events
            .iter()
            .find(|e| e.game_id != round.game_id || e.round_number != round.number)
        {
            Some(stray) => Err(HistoryError::DanglingEvent {
                game: stray.game_id,
                round: stray.round_number,
            }),
            None => Ok(()),
        }
    }

    /// The recorded game, with its latest scores and status.
    pub fn game(&self, game_id: GameId) -> Option<&Game> {
        self.log(game_id).ok().map(|log| &log.game)
    }

    /// All recorded games, oldest first.
    pub fn games(&self) -> impl Iterator<Item = &Game> {
        self.games.iter().map(|log| &log.game)
    }

    /// Every recorded round of a game, in order.
    pub fn rounds(&self, game_id: GameId) -> &[Round] {
        self.log(game_id).map(|log| &log.rounds[..]).unwrap_or(&[])
    }
}

impl HistorySink for MemoryHistory {
    fn create_game(&mut self, game: &Game) -> HistoryResult<()> {
        self.check_new_game(game)?;
        self.games.push(GameLog {
            game: game.clone(),
            rounds: vec![],
            events: vec![],
            ended: false,
        });
        Ok(())
    }

    fn append_round(&mut self, round: &Round) -> HistoryResult<RoundId> {
        self.check_round(round)?;
        self.log_mut(round.game_id)?.rounds.push(round.clone());
        Ok(round.id)
    }

    fn append_event(&mut self, event: &Event) -> HistoryResult<()> {
        self.check_event(event)?;
        self.log_mut(event.game_id)?.events.push(event.clone());
        Ok(())
    }

    fn update_scores(&mut self, game_id: GameId, delta: ScoreDelta) -> HistoryResult<Scores> {
        self.open_log(game_id)?;
        let log = self.log_mut(game_id)?;
        log.game.scores = log.game.scores.plus(delta);
        Ok(log.game.scores)
    }

    fn record_round(
        &mut self,
        round: &Round,
        events: &[Event],
        delta: ScoreDelta,
    ) -> HistoryResult<Scores> {
        self.check_round_events(round, events)?;
        let log = self.log_mut(round.game_id)?;
        log.rounds.push(round.clone());
        log.events.extend_from_slice(events);
        log.game.scores = log.game.scores.plus(delta);
        Ok(log.game.scores)
    }

    fn end_game(&mut self, game: &Game) -> HistoryResult<()> {
        self.open_log(game.id)?;
        let log = self.log_mut(game.id)?;
        // the sink's own totals are authoritative: they are what the events add up to
        let scores = log.game.scores;
        log.game = game.clone();
        log.game.scores = scores;
        log.ended = true;
        Ok(())
    }

    fn read_recent(
        &self,
        game_id: GameId,
        side: Side,
        limit: usize,
    ) -> HistoryResult<Vec<PriorTurn>> {
        let rounds = &self.log(game_id)?.rounds;
        let skip = rounds.len().saturating_sub(limit);
        Ok(rounds[skip..]
            .iter()
            .map(|round| PriorTurn::from_round(round, side))
            .collect())
    }

    fn read_events(&self, game_id: GameId, side: Option<Side>) -> HistoryResult<Vec<Event>> {
        Ok(self
            .log(game_id)?
            .events
            .iter()
            .filter(|event| side.map_or(true, |side| event.side == side))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// JsonlHistory
// ---------------------------------------------------------------------------

/// One line of the history file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Game { game: Game },
    Round { round: Round },
    Event { event: Event },
    Scores { game_id: GameId, delta: ScoreDelta },
    /// A round with its events and score delta, written by [`HistorySink::record_round`].
    Played {
        round: Round,
        events: Vec<Event>,
        delta: ScoreDelta,
    },
    End { game: Game },
}

/// Append-only JSON-lines history file.
///
/// Every write is validated against the in-memory state, appended as one line and flushed
/// before the in-memory state changes, so the file is always a valid prefix of the
/// history. Opening an existing file replays it.
#[derive(Debug)]
pub struct JsonlHistory {
    path: PathBuf,
    file: File,
    state: MemoryHistory,
}

impl JsonlHistory {
    /// Open (or create) the file at `path` and replay its records.
    ///
    /// # Errors
    /// I/O failures, and lines that do not parse or do not form a valid history.
    pub fn open(path: impl AsRef<Path>) -> HistoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = MemoryHistory::new();
        let mut records = 0;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let corrupt = |reason: String| HistoryError::Corrupt {
                    path: path.clone(),
                    line: index + 1,
                    reason,
                };
                let record: Record =
                    serde_json::from_str(&line).map_err(|e| corrupt(e.to_string()))?;
                apply(&mut state, record).map_err(|e| corrupt(e.to_string()))?;
                records += 1;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), records, "history file opened");
        Ok(JsonlHistory { path, file, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replayed state.
    pub fn state(&self) -> &MemoryHistory {
        &self.state
    }

    fn write(&mut self, record: &Record) -> HistoryResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        append_line(&mut self.file, &line, |file, line| file.write_all(line))?;
        debug!(bytes = line.len(), "history record appended");
        Ok(())
    }
}

/// Append `line` through `write`. On failure the file is cut back to its previous length,
/// so a partial line never precedes the next record.
fn append_line(
    file: &mut File,
    line: &[u8],
    write: impl FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    let written = write(&mut *file, line).and_then(|()| file.flush());
    if let Err(e) = written {
        if let Err(truncate) = file.set_len(len) {
            warn!(len, "could not drop a partial history line: {truncate}");
        }
        return Err(e);
    }
    Ok(())
}

fn apply(state: &mut MemoryHistory, record: Record) -> HistoryResult<()> {
    match record {
        Record::Game { game } => state.create_game(&game),
        Record::Round { round } => state.append_round(&round).map(|_| ()),
        Record::Event { event } => state.append_event(&event),
        Record::Scores { game_id, delta } => state.update_scores(game_id, delta).map(|_| ()),
        Record::Played {
            round,
            events,
            delta,
        } => state.record_round(&round, &events, delta).map(|_| ()),
        Record::End { game } => state.end_game(&game),
    }
}

impl HistorySink for JsonlHistory {
    fn create_game(&mut self, game: &Game) -> HistoryResult<()> {
        self.state.check_new_game(game)?;
        self.write(&Record::Game { game: game.clone() })?;
        self.state.create_game(game)
    }

    fn append_round(&mut self, round: &Round) -> HistoryResult<RoundId> {
        self.state.check_round(round)?;
        self.write(&Record::Round {
            round: round.clone(),
        })?;
        self.state.append_round(round)
    }

    fn append_event(&mut self, event: &Event) -> HistoryResult<()> {
        self.state.check_event(event)?;
        self.write(&Record::Event {
            event: event.clone(),
        })?;
        self.state.append_event(event)
    }

    fn update_scores(&mut self, game_id: GameId, delta: ScoreDelta) -> HistoryResult<Scores> {
        self.state.open_log(game_id)?;
        self.write(&Record::Scores { game_id, delta })?;
        self.state.update_scores(game_id, delta)
    }

    fn record_round(
        &mut self,
        round: &Round,
        events: &[Event],
        delta: ScoreDelta,
    ) -> HistoryResult<Scores> {
        self.state.check_round_events(round, events)?;
        self.write(&Record::Played {
            round: round.clone(),
            events: events.to_vec(),
            delta,
        })?;
        self.state.record_round(round, events, delta)
    }

    fn end_game(&mut self, game: &Game) -> HistoryResult<()> {
        self.state.open_log(game.id)?;
        self.write(&Record::End { game: game.clone() })?;
        self.state.end_game(game)
    }

    fn read_recent(
        &self,
        game_id: GameId,
        side: Side,
        limit: usize,
    ) -> HistoryResult<Vec<PriorTurn>> {
        self.state.read_recent(game_id, side, limit)
    }

    fn read_events(&self, game_id: GameId, side: Option<Side>) -> HistoryResult<Vec<Event>> {
        self.state.read_events(game_id, side)
    }
}
