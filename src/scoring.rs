//! Scoring engine: turns a round's detections into signed point deltas and event rows.
//!
//! Scoring is a pure function of the scores before the round, the round number and the
//! detected set. Nothing here touches the game: the round loop applies the returned
//! totals once the round has been persisted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    detector::{Detection, EventKind},
    side::Side,
};

/// Cumulative score per side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub red: i64,
    pub blue: i64,
}

/// Points gained or lost by each side during one round.
pub type ScoreDelta = Scores;

impl Scores {
    pub fn new(red: i64, blue: i64) -> Self {
        Scores { red, blue }
    }

    pub fn get(&self, side: Side) -> i64 {
        match side {
            Side::Red => self.red,
            Side::Blue => self.blue,
        }
    }

    pub fn add(&mut self, side: Side, points: i64) {
        match side {
            Side::Red => self.red += points,
            Side::Blue => self.blue += points,
        }
    }

    /// Side-wise sum.
    pub fn plus(self, delta: ScoreDelta) -> Scores {
        Scores {
            red: self.red + delta.red,
            blue: self.blue + delta.blue,
        }
    }

    /// Scores obtained by summing `events` from zero.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Scores {
        let mut scores = Scores::default();
        for event in events {
            scores.add(event.side, event.points);
        }
        scores
    }

    /// Side with the strictly higher score.
    pub fn leader(&self) -> Option<Side> {
        match self.red.cmp(&self.blue) {
            std::cmp::Ordering::Greater => Some(Side::Red),
            std::cmp::Ordering::Less => Some(Side::Blue),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// A scored occurrence. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub game_id: Uuid,
    /// Round the event originated in.
    pub round_number: u32,
    pub side: Side,
    pub kind: EventKind,
    /// Signed delta actually applied to `side`.
    pub points: i64,
    pub description: String,
}

/// Static mapping from event kind to signed points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointTable {
    points: BTreeMap<EventKind, i64>,
}

impl PointTable {
    /// Standard values: achievements are positive, penalties negative.
    pub fn standard() -> Self {
        use EventKind::*;
        let points = [
            (PortScanComplete, 10),
            (ServiceIdentified, 15),
            (VulnerabilityFound, 25),
            (CredentialsObtained, 50),
            (ShellAccessGained, 100),
            (PrivilegeEscalation, 150),
            (PersistenceEstablished, 200),
            (DataExfiltration, 300),
            (AttackDetected, 25),
            (AttackBlocked, 50),
            (AttackerIpBanned, 75),
            (VulnerabilityPatched, 100),
            (ServiceMaintained, 10),
            (ForensicsComplete, 150),
            (RecoveryComplete, 200),
            (ServiceDown, -50),
            (DetectedByBlue, -25),
            (FalsePositiveAlert, -10),
            (CommandTimeout, -5),
            (InvalidCommand, -10),
            (InvalidDecision, -10),
            (ExecutionFailed, -5),
        ];
        PointTable {
            points: points.into_iter().collect(),
        }
    }

    /// Override the value of one kind.
    pub fn with(mut self, kind: EventKind, points: i64) -> Self {
        self.points.insert(kind, points);
        self
    }

    pub fn points(&self, kind: EventKind) -> i64 {
        self.points.get(&kind).copied().unwrap_or(0)
    }
}

impl Default for PointTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Everything scoring one round produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundScore {
    pub delta: ScoreDelta,
    /// Events in processing order (red first).
    pub events: Vec<Event>,
    /// Scores after applying `delta`.
    pub totals: Scores,
}

impl RoundScore {
    /// Winner by terminal event, if any: red on `data_exfiltration`, blue on
    /// `recovery_complete`. When both fire, the first in processing order wins.
    pub fn terminal_winner(&self) -> Option<Side> {
        self.events.iter().find_map(|event| match event.kind {
            EventKind::DataExfiltration | EventKind::RecoveryComplete
                if event.kind.owner() == Some(event.side) =>
            {
                Some(event.side)
            }
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    table: PointTable,
    floor: Option<i64>,
}

impl ScoringEngine {
    pub fn new(table: PointTable) -> Self {
        ScoringEngine { table, floor: None }
    }

    /// Keep cumulative scores at or above `floor`.
    ///
    /// Penalties that would cross the floor are reduced so that the recorded event points
    /// still sum to the cumulative score.
    pub fn with_floor(mut self, floor: Option<i64>) -> Self {
        self.floor = floor;
        self
    }

    pub fn table(&self) -> &PointTable {
        &self.table
    }

    /// Score one round.
    ///
    /// `detections` is already deduplicated per side and kind, so each kind is awarded at
    /// most once per side in this round.
    pub fn score(
        &self,
        game_id: Uuid,
        before: Scores,
        round_number: u32,
        detections: &BTreeSet<Detection>,
    ) -> RoundScore {
        let mut running = before;
        let mut events = Vec::with_capacity(detections.len());
        for detection in detections {
            let mut points = self.table.points(detection.kind);
            if let Some(floor) = self.floor {
                if points < 0 {
                    let room = (floor - running.get(detection.side)).min(0);
                    points = points.max(room);
                }
            }
            running.add(detection.side, points);
            events.push(Event {
                game_id,
                round_number,
                side: detection.side,
                kind: detection.kind,
                points,
                description: format!("{} {}", detection.side, detection.kind.description()),
            });
        }
        let delta = Scores {
            red: running.red - before.red,
            blue: running.blue - before.blue,
        };
        RoundScore {
            delta,
            events,
            totals: running,
        }
    }
}
