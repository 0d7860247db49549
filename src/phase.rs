//! Phase state machine.
//!
//! A game moves through labeled stages bound to round-index ranges. The active phase is a
//! pure function of the round number over a static [`PhaseTable`]; nothing here mutates
//! after the table has been validated.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::side::Side;

/// One labeled stage of the game, covering rounds `first..=last`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Label shown to agents and recorded on rounds, e.g. `"reconnaissance"`.
    pub label: String,
    /// First round (1-based, inclusive).
    pub first: u32,
    /// Last round (inclusive).
    pub last: u32,
    /// What the offensive side should be working towards.
    #[serde(default)]
    pub red_objectives: Vec<String>,
    /// What the defensive side should be working towards.
    #[serde(default)]
    pub blue_objectives: Vec<String>,
}

impl Phase {
    /// Objectives for one side.
    pub fn objectives(&self, side: Side) -> &[String] {
        match side {
            Side::Red => &self.red_objectives,
            Side::Blue => &self.blue_objectives,
        }
    }

    fn contains(&self, round_number: u32) -> bool {
        (self.first..=self.last).contains(&round_number)
    }
}

/// Ordered, contiguous, non-overlapping phase ranges starting at round 1.
///
/// Only obtainable through [`PhaseTable::new`] (or [`PhaseTable::standard`]), which
/// rejects malformed tables, so lookups never fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTable {
    phases: Vec<Phase>,
}

impl PhaseTable {
    /// Validate and build a table.
    ///
    /// # Errors
    /// Empty table, empty label, reversed range, a first phase not starting at round 1,
    /// and gaps or overlaps between consecutive phases are all rejected.
    pub fn new(phases: Vec<Phase>) -> anyhow::Result<PhaseTable> {
        let Some(first) = phases.first() else {
            bail!("phase table is empty");
        };
        if first.first != 1 {
            bail!(
                "first phase '{}' must start at round 1, starts at {}",
                first.label,
                first.first
            );
        }
        for phase in &phases {
            if phase.label.trim().is_empty() {
                bail!("phase covering rounds {}..={} has no label", phase.first, phase.last);
            }
            if phase.first > phase.last {
                bail!(
                    "phase '{}' has a reversed range {}..={}",
                    phase.label,
                    phase.first,
                    phase.last
                );
            }
        }
        for pair in phases.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let expected = prev
                .last
                .checked_add(1)
                .with_context(|| format!("phase '{}' ends at the last possible round", prev.label))?;
            if next.first != expected {
                bail!(
                    "phase '{}' must start at round {expected} right after '{}', starts at {}",
                    next.label,
                    prev.label,
                    next.first
                );
            }
        }
        Ok(PhaseTable { phases })
    }

    /// Four-stage table: reconnaissance, initial access, privilege escalation, exfiltration.
    pub fn standard() -> PhaseTable {
        fn phase(label: &str, first: u32, last: u32, red: &[&str], blue: &[&str]) -> Phase {
            Phase {
                label: label.to_string(),
                first,
                last,
                red_objectives: red.iter().map(|s| s.to_string()).collect(),
                blue_objectives: blue.iter().map(|s| s.to_string()).collect(),
            }
        }

        PhaseTable {
            phases: vec![
                phase(
                    "reconnaissance",
                    1,
                    5,
                    &[
                        "scan ports and identify running services",
                        "identify service versions and candidate vulnerabilities",
                    ],
                    &[
                        "establish a baseline of connections and processes",
                        "detect scanning activity",
                    ],
                ),
                phase(
                    "initial_access",
                    6,
                    15,
                    &[
                        "gain a foothold through exploits, weak credentials or injection",
                        "obtain valid credentials",
                    ],
                    &[
                        "detect brute force and injection attempts",
                        "block attacking addresses without taking services down",
                    ],
                ),
                phase(
                    "privilege_escalation",
                    16,
                    25,
                    &[
                        "escalate to root",
                        "establish persistence",
                    ],
                    &[
                        "patch exploited weaknesses",
                        "hunt for persistence and unusual processes",
                    ],
                ),
                phase(
                    "exfiltration",
                    26,
                    30,
                    &["extract the flag file"],
                    &[
                        "complete forensics on the intrusion",
                        "restore services to a clean running state",
                    ],
                ),
            ],
        }
    }

    /// All phases in round order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// The phase active on `round_number`.
    ///
    /// Total: rounds before the first range map to the first phase, rounds past the last
    /// range map to the last phase.
    pub fn phase_for(&self, round_number: u32) -> &Phase {
        // validated non-empty in `new`
        let last = &self.phases[self.phases.len() - 1];
        self.phases
            .iter()
            .find(|phase| phase.contains(round_number))
            .unwrap_or(if round_number < self.phases[0].first {
                &self.phases[0]
            } else {
                last
            })
    }
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// True when `round_number` is the final round the game may play.
pub fn is_last_round(round_number: u32, max_rounds: u32) -> bool {
    round_number >= max_rounds
}
