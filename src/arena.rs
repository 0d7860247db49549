//! Round scheduler: the game loop.
//!
//! One [`Arena`] plays one game at a time between two [`Player`]s. Every round runs, in
//! order: phase lookup, red observation/decision/execution, blue
//! observation/decision/execution, detection, scoring, persistence, score application and
//! the game-over check. The two sides never execute concurrently.
//!
//! Sandbox and decision faults are folded into the round as penalties. History faults are
//! retried once after a backoff; a second failure aborts the game before its scores move,
//! so a round is either fully recorded and applied or not applied at all.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{ensure, Context};
use regex::Regex;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    configuration::{Configuration, TieBreak},
    constraints::{Constraints, DEFAULT_COMMAND_TIMEOUT, DEFAULT_DECISION_TIMEOUT},
    decision::{AccessLevel, Decision, DecisionMaker, Observation, SideState, TelemetryReading},
    detector::{Detector, EventKind, RoundContext, TurnView},
    game::{EndReason, Game, GameOutcome, GameStatus, PriorTurn, Round, TurnRecord},
    history::{HistoryResult, HistorySink},
    phase::{is_last_round, Phase, PhaseTable},
    sandbox::{CommandResult, Guarded, Sandbox},
    scenario::Scenario,
    scoring::{Event, PointTable, RoundScore, ScoringEngine},
    side::{Contestant, Side},
};

/// One side of a game: who plays it and who decides its moves.
pub struct Player {
    pub contestant: Contestant,
    pub decision_maker: Box<dyn DecisionMaker>,
}

impl Player {
    pub fn new(contestant: Contestant, decision_maker: impl DecisionMaker + 'static) -> Self {
        Player {
            contestant,
            decision_maker: Box::new(decision_maker),
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("contestant", &self.contestant)
            .finish_non_exhaustive()
    }
}

fn turn_view(turn: &TurnRecord) -> TurnView<'_> {
    TurnView {
        command: turn.command.as_deref(),
        rationale: &turn.rationale,
        result: &turn.result,
        decision_valid: turn.decision_valid,
    }
}

/// Text patterns used to summarize past turns in observations.
#[derive(Debug)]
struct Recon {
    open_port: Regex,
    firewall_rule: Regex,
}

impl Recon {
    fn new() -> anyhow::Result<Self> {
        Ok(Recon {
            open_port: Regex::new(r"(?m)^[ \t]*(\d+/(?:tcp|udp))[ \t]+open\b[ \t]*(.*?)[ \t]*$")?,
            firewall_rule: Regex::new(
                r"(?i)\biptables\b.*?\s-([aid])\s+input\b.*?\s-s\s+(\d{1,3}(?:\.\d{1,3}){3}(?:/\d{1,2})?)",
            )?,
        })
    }

    /// `"<port>/<proto> <service>"` for every open port in past outputs, first seen first.
    fn discovered_services(&self, turns: &[PriorTurn]) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut services = vec![];
        for turn in turns {
            for capture in self.open_port.captures_iter(&turn.output) {
                let entry = format!("{} {}", &capture[1], &capture[2])
                    .trim()
                    .to_string();
                if seen.insert(entry.clone()) {
                    services.push(entry);
                }
            }
        }
        services
    }

    /// Addresses dropped by successful firewall commands and not removed since.
    fn blocked_addresses(&self, turns: &[PriorTurn]) -> Vec<String> {
        let mut blocked: Vec<String> = vec![];
        for turn in turns.iter().filter(|turn| turn.success) {
            let Some(capture) = self.firewall_rule.captures(&turn.action) else {
                continue;
            };
            let address = capture[2].to_string();
            if capture[1].eq_ignore_ascii_case("d") {
                blocked.retain(|a| *a != address);
            } else if !blocked.contains(&address) {
                blocked.push(address);
            }
        }
        blocked
    }
}

fn access_level(events: &[Event]) -> AccessLevel {
    events
        .iter()
        .map(|event| match event.kind {
            EventKind::PrivilegeEscalation => AccessLevel::Root,
            EventKind::ShellAccessGained | EventKind::CredentialsObtained => AccessLevel::User,
            _ => AccessLevel::External,
        })
        .max()
        .unwrap_or_default()
}

/// Plays games between two players against one scenario.
pub struct Arena<S: Sandbox, H: HistorySink> {
    scenario: Scenario,
    phases: PhaseTable,
    configuration: Configuration,
    command_timeout: Duration,
    decision_timeout: Duration,
    detector: Detector,
    scoring: ScoringEngine,
    sandbox: Guarded<S>,
    history: H,
    red: Player,
    blue: Player,
    recon: Recon,
    stop: Arc<AtomicBool>,
}

impl<S: Sandbox, H: HistorySink> Arena<S, H> {
    /// Set up an arena with the default configuration, timeouts, detector and point table.
    ///
    /// Every command goes through the scenario's denylist before reaching `sandbox`.
    ///
    /// # Errors
    /// Configuration faults: invalid scenario, players on the wrong side.
    pub fn new(
        scenario: Scenario,
        sandbox: S,
        history: H,
        red: Player,
        blue: Player,
    ) -> anyhow::Result<Self> {
        scenario.validate()?;
        ensure!(
            red.contestant.side == Side::Red,
            "the offensive player must play red"
        );
        ensure!(
            blue.contestant.side == Side::Blue,
            "the defensive player must play blue"
        );
        let phases = scenario.phase_table()?;
        let denylist = scenario.denylist()?;
        Ok(Arena {
            configuration: Configuration::new().with_max_rounds(scenario.estimated_rounds),
            scenario,
            phases,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            detector: Detector::standard(),
            scoring: ScoringEngine::default(),
            sandbox: Guarded::new(sandbox, denylist),
            history,
            red,
            blue,
            recon: Recon::new()?,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.scoring = self.scoring.with_floor(configuration.score_floor);
        self.configuration = configuration;
        self
    }

    /// Take the command and decision timeouts from `constraints`.
    pub fn with_constraints(mut self, constraints: &Constraints) -> Self {
        self.command_timeout = constraints.command_timeout();
        self.decision_timeout = constraints.decision_timeout();
        self
    }

    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_point_table(mut self, table: PointTable) -> Self {
        self.scoring = ScoringEngine::new(table).with_floor(self.configuration.score_floor);
        self
    }

    /// Shared flag: once set, the running game is aborted at the next round boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn into_history(self) -> H {
        self.history
    }

    pub fn player(&self, side: Side) -> &Player {
        match side {
            Side::Red => &self.red,
            Side::Blue => &self.blue,
        }
    }

    /// The sandbox behind the denylist.
    pub fn sandbox(&self) -> &S {
        self.sandbox.inner()
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Play one game to its end.
    ///
    /// # Errors
    /// Startup faults only: invalid configuration, unreachable workload, history unable to
    /// record the game. Faults after round 1 has started end the game as aborted instead.
    #[instrument(skip_all, fields(scenario = %self.scenario.id))]
    pub fn run(&mut self) -> anyhow::Result<GameOutcome> {
        self.configuration.validate()?;
        for side in Side::BOTH {
            let workload = self.player(side).contestant.workload.clone();
            self.sandbox
                .probe(&workload)
                .with_context(|| format!("{side} workload '{workload}' is not available"))?;
        }

        let max_rounds = self.configuration.max_rounds;
        let mut game = Game::new(
            &self.scenario.id,
            &self.red.contestant.model,
            &self.blue.contestant.model,
            max_rounds,
        );
        self.write(|history| history.create_game(&game))
            .context("could not record the new game")?;
        info!(game = %game.id, max_rounds, "game started");

        let mut rounds_played = 0;
        let mut number = 1;
        while game.is_running() {
            if self.stop.load(Ordering::SeqCst) {
                warn!(game = %game.id, round = number, "stop requested, aborting");
                self.finish(&mut game, GameStatus::Aborted, None, EndReason::StopSignal)?;
                break;
            }

            let (round, score) = match self.play_round(&game, number) {
                Ok(played) => played,
                Err(e) => {
                    error!(game = %game.id, round = number, "history failed twice: {e}");
                    self.finish(
                        &mut game,
                        GameStatus::Aborted,
                        None,
                        EndReason::PersistenceFailure,
                    )?;
                    break;
                }
            };
            game.apply_scores(score.totals)?;
            rounds_played = number;
            self.report(&round, &score);

            if let Some(winner) = score.terminal_winner() {
                info!(game = %game.id, %winner, "terminal event recorded");
                self.finish(
                    &mut game,
                    GameStatus::Completed,
                    Some(winner),
                    EndReason::TerminalEvent,
                )?;
            } else if is_last_round(number, max_rounds) {
                let winner = match self.configuration.tie_break {
                    TieBreak::HigherScore => game.scores.leader(),
                    TieBreak::Draw => None,
                };
                self.finish(&mut game, GameStatus::Completed, winner, EndReason::RoundLimit)?;
            } else {
                number += 1;
                if !self.configuration.round_pause.is_zero() {
                    thread::sleep(self.configuration.round_pause);
                }
            }
        }

        let outcome = GameOutcome {
            game,
            rounds_played,
        };
        info!("{outcome}");
        Ok(outcome)
    }

    #[instrument(skip_all, fields(round = number))]
    fn play_round(&mut self, game: &Game, number: u32) -> HistoryResult<(Round, RoundScore)> {
        let started_at = OffsetDateTime::now_utc();
        let start = Instant::now();
        let phase = self.phases.phase_for(number).clone();

        let mut red = self.play_turn(game, Side::Red, number, &phase)?;
        let mut blue = self.play_turn(game, Side::Blue, number, &phase)?;

        let detections = self.detector.detect(&RoundContext {
            round_number: number,
            red: turn_view(&red),
            blue: turn_view(&blue),
        });
        let score = self.scoring.score(game.id, game.scores, number, &detections);
        red.points = score.delta.red;
        blue.points = score.delta.blue;

        let events: Vec<_> = score.events.iter().map(|e| (e.side, e.kind)).collect();
        let round = Round {
            id: Uuid::new_v4(),
            game_id: game.id,
            number,
            phase: phase.label.clone(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            state: json!({
                "round": number,
                "phase": phase.label,
                "scores_before": game.scores,
                "scores_after": score.totals,
                "events": events,
                "workloads": {
                    "red": self.red.contestant.workload,
                    "blue": self.blue.contestant.workload,
                },
            }),
            red,
            blue,
        };
        self.persist_round(&round, &score)?;
        Ok((round, score))
    }

    #[instrument(skip_all, fields(%side))]
    fn play_turn(
        &mut self,
        game: &Game,
        side: Side,
        number: u32,
        phase: &Phase,
    ) -> HistoryResult<TurnRecord> {
        let observation = self.observe(game, side, number, phase)?;

        let timeout = self.decision_timeout;
        let player = match side {
            Side::Red => &mut self.red,
            Side::Blue => &mut self.blue,
        };
        let decision = match player.decision_maker.decide(&observation, timeout) {
            Ok(raw) => Decision::parse(&raw),
            Err(e) => Decision::invalid(format!("decision collaborator failed: {e:#}")),
        };
        if let Some(error) = &decision.error {
            warn!(round = number, "invalid decision: {error}");
        }
        if let Some(echoed) = decision.phase.as_deref() {
            if echoed != phase.label {
                debug!(echoed, expected = %phase.label, "agent echoed another phase");
            }
        }

        let workload = player.contestant.workload.clone();
        let result = match decision.command.as_deref() {
            Some(command) => {
                debug!(command, workload, "dispatching");
                self.sandbox
                    .execute(&workload, command, self.command_timeout)
            }
            None => CommandResult::skipped(),
        };

        Ok(TurnRecord {
            side,
            observation: serde_json::to_value(&observation).unwrap_or_default(),
            success: decision.command.is_some() && result.succeeded(),
            decision_valid: decision.is_valid(),
            rationale: decision.rationale,
            command: decision.command,
            expected_outcome: decision.expected_outcome,
            decision_error: decision.error,
            result,
            points: 0,
        })
    }

    fn observe(
        &mut self,
        game: &Game,
        side: Side,
        number: u32,
        phase: &Phase,
    ) -> HistoryResult<Observation> {
        let past = self.read(|history| history.read_recent(game.id, side, usize::MAX))?;
        let state = match side {
            Side::Red => {
                let events = self.read(|history| history.read_events(game.id, Some(Side::Red)))?;
                SideState::Offense {
                    access_level: access_level(&events),
                    target: self.scenario.target_address.clone(),
                    discovered_services: self.recon.discovered_services(&past),
                }
            }
            Side::Blue => SideState::Defense {
                telemetry: self.collect_telemetry(),
                blocked_addresses: self.recon.blocked_addresses(&past),
            },
        };
        let window = past.len().saturating_sub(self.configuration.history_window);
        Ok(Observation {
            side,
            scenario: self.scenario.id.clone(),
            round_number: number,
            max_rounds: self.configuration.max_rounds,
            phase: phase.label.clone(),
            objectives: phase.objectives(side).to_vec(),
            tools: self.scenario.tools(side).to_vec(),
            state,
            scores: game.scores,
            history: past[window..].to_vec(),
        })
    }

    /// Run the read-only probes on the defended workload. Not scored, not recorded.
    fn collect_telemetry(&mut self) -> Vec<TelemetryReading> {
        let workload = self.blue.contestant.workload.clone();
        self.scenario
            .telemetry
            .iter()
            .map(|probe| {
                let result = self
                    .sandbox
                    .execute(&workload, &probe.command, self.command_timeout);
                let output = if result.is_sandbox_fault() {
                    result.stderr
                } else {
                    result.stdout.trim().to_string()
                };
                TelemetryReading {
                    name: probe.name.clone(),
                    output,
                    exit_status: result.exit_status,
                }
            })
            .collect()
    }

    /// Record the round, its events and its score delta as one write, retried once.
    fn persist_round(&mut self, round: &Round, score: &RoundScore) -> HistoryResult<()> {
        let totals =
            self.write(|history| history.record_round(round, &score.events, score.delta))?;
        if totals != score.totals {
            warn!(?totals, expected = ?score.totals, "history totals diverge");
        }
        Ok(())
    }

    fn read<T>(&self, read: impl Fn(&H) -> HistoryResult<T>) -> HistoryResult<T> {
        read(&self.history).or_else(|e| {
            warn!("history read failed, retrying once: {e}");
            thread::sleep(self.configuration.persist_backoff);
            read(&self.history)
        })
    }

    fn write<T>(&mut self, mut write: impl FnMut(&mut H) -> HistoryResult<T>) -> HistoryResult<T> {
        match write(&mut self.history) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("history write failed, retrying once: {e}");
                thread::sleep(self.configuration.persist_backoff);
                write(&mut self.history)
            }
        }
    }

    /// End the game and record its final state. An unrecordable end aborts the game.
    fn finish(
        &mut self,
        game: &mut Game,
        status: GameStatus,
        winner: Option<Side>,
        reason: EndReason,
    ) -> anyhow::Result<()> {
        let mut ended = game.clone();
        ended.end(status, winner, reason)?;
        match self.write(|history| history.end_game(&ended)) {
            Ok(()) => *game = ended,
            Err(e) => {
                error!(game = %game.id, "could not record the end of the game: {e}");
                game.end(GameStatus::Aborted, None, EndReason::PersistenceFailure)?;
            }
        }
        Ok(())
    }

    fn report(&self, round: &Round, score: &RoundScore) {
        for event in &score.events {
            debug!(side = %event.side, kind = %event.kind, points = event.points, "event");
        }
        if self.configuration.verbose {
            println!(
                "round {:>3} [{}] red: {} ({:+}) | blue: {} ({:+}) | score {} - {}",
                round.number,
                round.phase,
                round.red.action(),
                score.delta.red,
                round.blue.action(),
                score.delta.blue,
                score.totals.red,
                score.totals.blue,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decision::Scripted, game::tests::turn, history::MemoryHistory};

    struct Echo;

    impl Sandbox for Echo {
        fn execute(&mut self, _workload: &str, command: &str, _timeout: Duration) -> CommandResult {
            CommandResult {
                stdout: command.to_string(),
                ..CommandResult::skipped()
            }
        }

        fn probe(&mut self, _workload: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn prior(number: u32, side: Side, command: &str, output: &str) -> PriorTurn {
        let mut round = crate::game::tests::round(Uuid::new_v4(), number);
        let record = turn(side, Some(command), output);
        match side {
            Side::Red => round.red = record,
            Side::Blue => round.blue = record,
        }
        PriorTurn::from_round(&round, side)
    }

    #[test]
    fn services_are_parsed_from_scan_output() {
        let recon = Recon::new().unwrap();
        let turns = [
            prior(1, Side::Red, "nmap", "PORT   STATE SERVICE\n22/tcp open  ssh\n80/tcp open  http Apache 2.4\n3306/tcp closed mysql\n"),
            prior(2, Side::Red, "nmap", "22/tcp open  ssh\n"),
        ];
        assert_eq!(
            recon.discovered_services(&turns),
            vec!["22/tcp ssh".to_string(), "80/tcp http Apache 2.4".to_string()]
        );
    }

    #[test]
    fn blocked_addresses_follow_firewall_commands() {
        let recon = Recon::new().unwrap();
        let turns = [
            prior(1, Side::Blue, "iptables -A INPUT -s 172.20.0.5 -j DROP", ""),
            prior(2, Side::Blue, "iptables -I INPUT -s 10.0.0.9 -j DROP", ""),
            prior(3, Side::Blue, "iptables -D INPUT -s 10.0.0.9 -j DROP", ""),
            prior(4, Side::Blue, "iptables -L INPUT -n", ""),
        ];
        assert_eq!(recon.blocked_addresses(&turns), vec!["172.20.0.5".to_string()]);
    }

    #[test]
    fn access_level_is_the_highest_reached() {
        let event = |kind| Event {
            game_id: Uuid::new_v4(),
            round_number: 1,
            side: Side::Red,
            kind,
            points: 0,
            description: String::new(),
        };
        assert_eq!(access_level(&[]), AccessLevel::External);
        assert_eq!(
            access_level(&[event(EventKind::PortScanComplete), event(EventKind::CredentialsObtained)]),
            AccessLevel::User
        );
        assert_eq!(
            access_level(&[event(EventKind::PrivilegeEscalation), event(EventKind::ShellAccessGained)]),
            AccessLevel::Root
        );
    }

    #[test]
    fn players_must_sit_on_their_side() {
        let scenario = Scenario::dvwa_basic_pentest();
        let red = Player::new(Contestant::new(Side::Blue, "m", "w"), Scripted::new(Vec::<String>::new()));
        let blue = Player::new(Contestant::new(Side::Blue, "m", "w"), Scripted::new(Vec::<String>::new()));
        assert!(Arena::new(scenario, Echo, MemoryHistory::new(), red, blue).is_err());
    }
}
