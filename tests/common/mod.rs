#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use cyber_arena::{
    decision::{DecisionMaker, Observation},
    game::{Game, PriorTurn, Round, RoundId},
    history::{HistoryError, HistoryResult, HistorySink},
    prelude::*,
    sandbox::CommandResult,
    scoring::{Event, ScoreDelta, Scores},
};
use time::format_description;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub fn init_logger() {
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_timer(timer)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Answers commands from a table of `(substring, stdout)` and records every call.
#[derive(Debug, Default)]
pub struct FakeSandbox {
    pub outputs: Vec<(String, String)>,
    pub calls: Vec<(String, String)>,
    pub unreachable: Vec<String>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, fragment: &str, stdout: &str) -> Self {
        self.outputs.push((fragment.to_string(), stdout.to_string()));
        self
    }

    pub fn without(mut self, workload: &str) -> Self {
        self.unreachable.push(workload.to_string());
        self
    }

    pub fn commands(&self) -> Vec<&str> {
        self.calls.iter().map(|(_, command)| command.as_str()).collect()
    }
}

impl Sandbox for FakeSandbox {
    fn execute(&mut self, workload: &str, command: &str, _timeout: Duration) -> CommandResult {
        self.calls.push((workload.to_string(), command.to_string()));
        let stdout = self
            .outputs
            .iter()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();
        CommandResult {
            exit_status: 0,
            stdout,
            stderr: String::new(),
            elapsed_ms: 1,
            truncated: false,
        }
    }

    fn probe(&mut self, workload: &str) -> anyhow::Result<()> {
        if self.unreachable.iter().any(|w| w == workload) {
            anyhow::bail!("no such container: {workload}");
        }
        Ok(())
    }
}

/// Scripted answers, keeping a copy of every observation where the test can see it.
#[derive(Clone)]
pub struct Recorder {
    script: Arc<Mutex<Scripted>>,
}

impl Recorder {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Recorder {
            script: Arc::new(Mutex::new(Scripted::new(answers))),
        }
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.script.lock().unwrap().observations().to_vec()
    }
}

impl DecisionMaker for Recorder {
    fn decide(&mut self, observation: &Observation, timeout: Duration) -> anyhow::Result<String> {
        self.script.lock().unwrap().decide(observation, timeout)
    }
}

/// Memory history whose round writes fail on demand.
///
/// Rounds in `failing_rounds` fail on every attempt; rounds in `transient_rounds` fail on
/// their first attempt only. Every other write goes straight to `inner`.
#[derive(Debug, Default)]
pub struct FlakyHistory {
    pub inner: MemoryHistory,
    pub failing_rounds: Vec<u32>,
    pub transient_rounds: Vec<u32>,
    pub attempts: u32,
    pub failures: u32,
}

impl FlakyHistory {
    fn check(&mut self, number: u32) -> HistoryResult<()> {
        self.attempts += 1;
        if self.failing_rounds.contains(&number) {
            self.failures += 1;
            return Err(HistoryError::Unavailable("disk full".into()));
        }
        if let Some(at) = self.transient_rounds.iter().position(|&n| n == number) {
            self.transient_rounds.remove(at);
            self.failures += 1;
            return Err(HistoryError::Unavailable("connection reset".into()));
        }
        Ok(())
    }
}

impl HistorySink for FlakyHistory {
    fn create_game(&mut self, game: &Game) -> HistoryResult<()> {
        self.inner.create_game(game)
    }

    fn append_round(&mut self, round: &Round) -> HistoryResult<RoundId> {
        self.check(round.number)?;
        self.inner.append_round(round)
    }

    fn append_event(&mut self, event: &Event) -> HistoryResult<()> {
        self.inner.append_event(event)
    }

    fn update_scores(&mut self, game_id: uuid::Uuid, delta: ScoreDelta) -> HistoryResult<Scores> {
        self.inner.update_scores(game_id, delta)
    }

    fn record_round(
        &mut self,
        round: &Round,
        events: &[Event],
        delta: ScoreDelta,
    ) -> HistoryResult<Scores> {
        self.check(round.number)?;
        self.inner.record_round(round, events, delta)
    }

    fn end_game(&mut self, game: &Game) -> HistoryResult<()> {
        self.inner.end_game(game)
    }

    fn read_recent(
        &self,
        game_id: uuid::Uuid,
        side: Side,
        limit: usize,
    ) -> HistoryResult<Vec<PriorTurn>> {
        self.inner.read_recent(game_id, side, limit)
    }

    fn read_events(&self, game_id: uuid::Uuid, side: Option<Side>) -> HistoryResult<Vec<Event>> {
        self.inner.read_events(game_id, side)
    }
}

pub fn config(max_rounds: u32) -> Configuration {
    Configuration::new()
        .with_verbose(false)
        .with_max_rounds(max_rounds)
        .with_persist_backoff(Duration::from_millis(1))
}

pub fn arena<H: HistorySink>(
    sandbox: FakeSandbox,
    history: H,
    red: impl DecisionMaker + 'static,
    blue: impl DecisionMaker + 'static,
    max_rounds: u32,
) -> Arena<FakeSandbox, H> {
    let scenario = Scenario::dvwa_basic_pentest();
    let red = Player::new(
        Contestant::new(Side::Red, "red-model", &scenario.attacker_workload),
        red,
    );
    let blue = Player::new(
        Contestant::new(Side::Blue, "blue-model", &scenario.target_workload),
        blue,
    );
    Arena::new(scenario, sandbox, history, red, blue)
        .unwrap()
        .with_configuration(config(max_rounds))
}

pub fn decision(command: &str) -> String {
    serde_json::json!({"rationale": "next step", "command": command}).to_string()
}
