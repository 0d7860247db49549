//! Observations handed to decision collaborators, and the decisions they answer with.
//!
//! A collaborator receives an [`Observation`] serialized as JSON and answers with free
//! text expected to hold a JSON decision. [`Decision::parse`] never fails: anything it
//! cannot use becomes an invalid, no-action decision, which the detector turns into a
//! penalty.

use std::{collections::VecDeque, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{game::PriorTurn, scoring::Scores, side::Side};

/// How deep the offensive side is into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// No foothold yet.
    #[default]
    External,
    /// Unprivileged shell or credentials.
    User,
    /// Root on the target.
    Root,
}

/// Output of one telemetry probe run on the defended workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub name: String,
    pub output: String,
    pub exit_status: i32,
}

/// Side-specific part of an observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum SideState {
    Offense {
        access_level: AccessLevel,
        target: String,
        discovered_services: Vec<String>,
    },
    Defense {
        telemetry: Vec<TelemetryReading>,
        blocked_addresses: Vec<String>,
    },
}

/// Everything a decision collaborator gets to see before a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub side: Side,
    pub scenario: String,
    pub round_number: u32,
    pub max_rounds: u32,
    pub phase: String,
    pub objectives: Vec<String>,
    pub tools: Vec<String>,
    pub state: SideState,
    /// Cumulative scores of both sides.
    pub scores: Scores,
    /// Recent turns of this side, most recent last.
    pub history: Vec<PriorTurn>,
}

/// A usable or unusable answer from a decision collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub rationale: String,
    /// `None` is the explicit "no action" sentinel, or the fallback for invalid decisions.
    pub command: Option<String>,
    pub expected_outcome: Option<String>,
    /// Phase label echoed back by the collaborator.
    pub phase: Option<String>,
    /// Why the answer was unusable; `None` for a valid decision.
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct RawDecision {
    #[serde(alias = "reasoning", default)]
    rationale: Option<String>,
    #[serde(alias = "defensive_action")]
    command: Option<String>,
    #[serde(alias = "expected_result", default)]
    expected_outcome: Option<String>,
    #[serde(default)]
    phase: Option<String>,
}

impl Decision {
    /// A deliberate no-action turn.
    pub fn no_action(rationale: impl Into<String>) -> Self {
        Decision {
            rationale: rationale.into(),
            command: None,
            expected_outcome: None,
            phase: None,
            error: None,
        }
    }

    /// An unusable answer, treated as no action plus a penalty.
    pub fn invalid(error: impl Into<String>) -> Self {
        Decision {
            error: Some(error.into()),
            ..Decision::no_action("")
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// Parse a collaborator's raw answer.
    ///
    /// Accepts bare JSON, JSON wrapped in a Markdown code fence, or JSON surrounded by
    /// prose. `"none"` (any case) or an empty command is a valid no-action decision; a
    /// missing command field is not.
    pub fn parse(raw: &str) -> Decision {
        let body = json_body(raw);
        let parsed: RawDecision = match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(e) => return Decision::invalid(format!("unparsable decision: {e}")),
        };
        let Some(command) = parsed.command else {
            return Decision::invalid("decision has no command");
        };
        let command = command.trim();
        let command = if command.is_empty() || command.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(command.to_string())
        };
        Decision {
            rationale: parsed.rationale.unwrap_or_default(),
            command,
            expected_outcome: parsed.expected_outcome,
            phase: parsed.phase,
            error: None,
        }
    }
}

fn json_body(raw: &str) -> &str {
    let trimmed = raw.trim();
    let unfenced = match trimmed.strip_prefix("```") {
        Some(rest) => {
            // drop the info string ("json") up to the end of the opening fence line
            let rest = rest.split_once('\n').map_or(rest, |(_, body)| body);
            rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
        }
        None => trimmed,
    };
    if unfenced.starts_with('{') {
        return unfenced;
    }
    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}

/// An external decision collaborator for one side.
pub trait DecisionMaker {
    /// Produce a raw answer for `observation` within `timeout`.
    ///
    /// # Errors
    /// Transport failures and timeouts; the round loop treats them as invalid decisions.
    fn decide(&mut self, observation: &Observation, timeout: Duration) -> anyhow::Result<String>;
}

impl<D: DecisionMaker + ?Sized> DecisionMaker for Box<D> {
    fn decide(&mut self, observation: &Observation, timeout: Duration) -> anyhow::Result<String> {
        (**self).decide(observation, timeout)
    }
}

/// Replays canned answers in order, then keeps answering with the fallback.
///
/// Useful to test a scenario or to drive a side with a fixed playbook.
#[derive(Debug, Clone)]
pub struct Scripted {
    answers: VecDeque<String>,
    fallback: String,
    observations: Vec<Observation>,
}

impl Scripted {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Scripted {
            answers: answers.into_iter().map(Into::into).collect(),
            fallback: r#"{"rationale": "nothing left to do", "command": "none"}"#.to_string(),
            observations: vec![],
        }
    }

    /// Answer given once the script is exhausted.
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// Observations received so far.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }
}

impl DecisionMaker for Scripted {
    fn decide(&mut self, observation: &Observation, _timeout: Duration) -> anyhow::Result<String> {
        self.observations.push(observation.clone());
        Ok(self
            .answers
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
