use std::sync::atomic::Ordering;

use cyber_arena::{
    decision::SideState,
    game::{EndReason, GameStatus},
    history::HistorySink,
    prelude::*,
    sandbox::EXIT_REJECTED,
    scoring::Scores,
};

use common::*;

mod common;

const SCAN: &str = "nmap -sV 172.20.0.10";
const SCAN_OUTPUT: &str = "Host is up\n22/tcp open\n80/tcp open\n";

fn idle() -> Recorder {
    Recorder::new(Vec::<String>::new())
}

#[test]
fn port_scan_scores_in_the_reconnaissance_phase() {
    init_logger();
    let sandbox = FakeSandbox::new().answer("nmap", SCAN_OUTPUT);
    let red = Recorder::new([decision(SCAN)]);
    let mut arena = arena(sandbox, MemoryHistory::new(), red.clone(), idle(), 5);

    let outcome = arena.run().unwrap();
    assert_eq!(outcome.rounds_played, 5);
    assert_eq!(outcome.game.status, GameStatus::Completed);
    assert_eq!(outcome.game.end_reason, Some(EndReason::RoundLimit));

    let history = arena.history();
    let rounds = history.rounds(outcome.game.id);
    assert_eq!(rounds[0].phase, "reconnaissance");
    assert_eq!(rounds[0].red.command.as_deref(), Some(SCAN));
    assert_eq!(rounds[0].red.points, 10);
    assert!(rounds[0].red.success);

    let red_events = history
        .read_events(outcome.game.id, Some(Side::Red))
        .unwrap();
    assert_eq!(red_events.len(), 1);
    assert_eq!(red_events[0].round_number, 1);
    assert_eq!(red_events[0].points, 10);

    // the second observation shows what the scan found
    let observations = red.observations();
    assert_eq!(observations.len(), 5);
    assert_eq!(observations[1].round_number, 2);
    assert_eq!(observations[1].history.len(), 1);
    assert_eq!(observations[1].history[0].action, SCAN);
    match &observations[1].state {
        SideState::Offense {
            discovered_services,
            ..
        } => assert_eq!(discovered_services.len(), 2),
        other => panic!("red observed {other:?}"),
    }
}

#[test]
fn denylisted_commands_never_reach_the_workload() {
    init_logger();
    let red = Recorder::new([decision("rm -rf /")]);
    let mut arena = arena(FakeSandbox::new(), MemoryHistory::new(), red, idle(), 1);

    let outcome = arena.run().unwrap();
    let round = &arena.history().rounds(outcome.game.id)[0];
    assert_eq!(round.red.result.exit_status, EXIT_REJECTED);
    assert!(round.red.result.stderr.contains("rejected"));
    assert!(!round.red.success);
    assert_eq!(round.red.points, -10);
    assert!(!arena.sandbox().commands().contains(&"rm -rf /"));
    assert_eq!(outcome.game.scores.red, -10);
}

#[test]
fn unparsable_decisions_are_penalized_and_the_game_goes_on() {
    init_logger();
    let red = Recorder::new(["I would like to scan the network please."]);
    let mut arena = arena(FakeSandbox::new(), MemoryHistory::new(), red, idle(), 3);

    let outcome = arena.run().unwrap();
    assert_eq!(outcome.rounds_played, 3);
    let rounds = arena.history().rounds(outcome.game.id);
    assert_eq!(rounds[0].red.action(), "none");
    assert!(!rounds[0].red.decision_valid);
    assert!(rounds[0].red.decision_error.is_some());
    assert_eq!(rounds[0].red.points, -10);
    assert!(rounds[1].red.decision_valid);
}

#[test]
fn persistence_failures_abort_the_game() {
    init_logger();
    let history = FlakyHistory {
        failing_rounds: vec![2],
        ..FlakyHistory::default()
    };
    let red = Recorder::new([decision(SCAN), decision(SCAN), decision(SCAN)]);
    let sandbox = FakeSandbox::new().answer("nmap", SCAN_OUTPUT);
    let mut arena = arena(sandbox, history, red.clone(), idle(), 5);

    let outcome = arena.run().unwrap();
    assert_eq!(outcome.game.status, GameStatus::Aborted);
    assert_eq!(outcome.game.end_reason, Some(EndReason::PersistenceFailure));
    assert_eq!(outcome.rounds_played, 1);
    assert_eq!(outcome.game.winner, None);
    // round 2 scores were never applied
    assert_eq!(outcome.game.scores, Scores::new(10, 10));

    let history = arena.history();
    assert_eq!(history.attempts, 3);
    assert_eq!(history.failures, 2);
    assert_eq!(history.inner.rounds(outcome.game.id).len(), 1);
    let recorded = history.inner.game(outcome.game.id).unwrap();
    assert_eq!(recorded.status, GameStatus::Aborted);
    assert_eq!(red.observations().len(), 2);
}

#[test]
fn an_unrecorded_round_leaves_no_events_or_points_behind() {
    init_logger();
    // round 2 scores for both sides, then cannot be written
    let history = FlakyHistory {
        failing_rounds: vec![2],
        ..FlakyHistory::default()
    };
    let red = Recorder::new([decision(SCAN), decision(SCAN)]);
    let blue = Recorder::new([
        decision("ps aux"),
        r#"{"reasoning": "nmap scan observed", "defensive_action": "iptables -A INPUT -s 172.20.0.5 -j DROP"}"#.to_string(),
    ]);
    let sandbox = FakeSandbox::new()
        .answer("nmap", SCAN_OUTPUT)
        .answer("iptables", "");
    let mut arena = arena(sandbox, history, red, blue, 5);

    let outcome = arena.run().unwrap();
    assert_eq!(outcome.game.end_reason, Some(EndReason::PersistenceFailure));

    let history = &arena.history().inner;
    let game_id = outcome.game.id;
    let events = history.read_events(game_id, None).unwrap();
    assert!(events.iter().all(|event| event.round_number == 1));
    let recorded: Scores = history
        .rounds(game_id)
        .iter()
        .map(|round| round.points())
        .fold(Scores::default(), |total, points| total.plus(points));
    assert_eq!(recorded, Scores::from_events(&events));
    assert_eq!(history.game(game_id).unwrap().scores, recorded);
    assert_eq!(outcome.game.scores, recorded);
}

#[test]
fn transient_history_failures_are_absorbed_without_duplicates() {
    init_logger();
    let history = FlakyHistory {
        transient_rounds: vec![1, 2, 3, 4],
        ..FlakyHistory::default()
    };
    let red = Recorder::new([
        decision(SCAN),
        "not json".to_string(),
        decision("rm -rf /"),
        decision(SCAN),
    ]);
    let blue = Recorder::new([
        r#"{"reasoning": "nmap scan observed from 172.20.0.5", "defensive_action": "iptables -A INPUT -s 172.20.0.5 -j DROP"}"#,
    ]);
    let sandbox = FakeSandbox::new()
        .answer("nmap", SCAN_OUTPUT)
        .answer("iptables", "");
    let mut arena = arena(sandbox, history, red, blue, 4);

    let outcome = arena.run().unwrap();
    assert_eq!(outcome.game.status, GameStatus::Completed);
    assert_eq!(outcome.game.end_reason, Some(EndReason::RoundLimit));
    assert_eq!(outcome.rounds_played, 4);

    let flaky = arena.history();
    assert_eq!(flaky.failures, 4);
    assert_eq!(flaky.attempts, 8);

    let history = &flaky.inner;
    let game_id = outcome.game.id;
    let numbers: Vec<u32> = history
        .rounds(game_id)
        .iter()
        .map(|round| round.number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);

    let events = history.read_events(game_id, None).unwrap();
    assert!(!events.is_empty());
    let mut seen = std::collections::BTreeSet::new();
    for event in &events {
        assert!(seen.insert((event.round_number, event.side, event.kind)));
    }
    assert_eq!(Scores::from_events(&events), outcome.game.scores);
    assert_eq!(history.game(game_id).unwrap().scores, outcome.game.scores);
}

#[test]
fn round_limit_goes_to_the_higher_score_or_to_nobody() {
    init_logger();
    // red does nothing, blue collects its monitoring points
    let mut arena = arena(FakeSandbox::new(), MemoryHistory::new(), idle(), idle(), 2);
    let outcome = arena.run().unwrap();
    assert_eq!(outcome.game.scores, Scores::new(0, 20));
    assert_eq!(outcome.game.winner, Some(Side::Blue));

    let mut arena = arena_with_draws();
    let outcome = arena.run().unwrap();
    assert_eq!(outcome.game.status, GameStatus::Completed);
    assert_eq!(outcome.game.winner, None);
}

fn arena_with_draws() -> Arena<FakeSandbox, MemoryHistory> {
    arena(FakeSandbox::new(), MemoryHistory::new(), idle(), idle(), 2)
        .with_configuration(config(2).with_tie_break(TieBreak::Draw))
}

#[test]
fn terminal_event_ends_the_game_early() {
    init_logger();
    let sandbox = FakeSandbox::new().answer("flag.txt", "flag{dvwa_pwned}\n");
    let red = Recorder::new([decision("cat /root/flag.txt")]);
    let mut arena = arena(sandbox, MemoryHistory::new(), red, idle(), 10);

    let outcome = arena.run().unwrap();
    assert_eq!(outcome.rounds_played, 1);
    assert_eq!(outcome.game.winner, Some(Side::Red));
    assert_eq!(outcome.game.end_reason, Some(EndReason::TerminalEvent));
    assert_eq!(
        arena.history().game(outcome.game.id).unwrap().status,
        GameStatus::Completed
    );
}

#[test]
fn rounds_are_contiguous_and_scores_are_the_sum_of_events() {
    init_logger();
    let sandbox = FakeSandbox::new()
        .answer("nmap", SCAN_OUTPUT)
        .answer("iptables", "");
    let red = Recorder::new([
        decision(SCAN),
        "not json".to_string(),
        decision("rm -rf /"),
        decision(SCAN),
    ]);
    let blue = Recorder::new([
        r#"{"reasoning": "nmap scan observed from 172.20.0.5", "defensive_action": "iptables -A INPUT -s 172.20.0.5 -j DROP"}"#,
    ]);
    let mut arena = arena(sandbox, MemoryHistory::new(), red, blue.clone(), 4);

    let outcome = arena.run().unwrap();
    let history = arena.history();
    let numbers: Vec<u32> = history
        .rounds(outcome.game.id)
        .iter()
        .map(|round| round.number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);

    let events = history.read_events(outcome.game.id, None).unwrap();
    assert_eq!(Scores::from_events(&events), outcome.game.scores);
    assert_eq!(
        history.game(outcome.game.id).unwrap().scores,
        outcome.game.scores
    );
    for round in history.rounds(outcome.game.id) {
        let in_round = events.iter().filter(|e| e.round_number == round.number);
        assert_eq!(Scores::from_events(in_round), round.points());
    }

    // each kind at most once per side and round
    let mut seen = std::collections::BTreeSet::new();
    for event in &events {
        assert!(seen.insert((event.round_number, event.side, event.kind)));
    }

    // blue sees its firewall rule and the telemetry of its own workload
    let observations = blue.observations();
    match &observations[1].state {
        SideState::Defense {
            telemetry,
            blocked_addresses,
        } => {
            assert_eq!(blocked_addresses, &vec!["172.20.0.5".to_string()]);
            assert!(!telemetry.is_empty());
        }
        other => panic!("blue observed {other:?}"),
    }
}

#[test]
fn stop_requests_abort_at_the_round_boundary() {
    init_logger();
    let mut arena = arena(FakeSandbox::new(), MemoryHistory::new(), idle(), idle(), 5);
    arena.stop_handle().store(true, Ordering::SeqCst);

    let outcome = arena.run().unwrap();
    assert_eq!(outcome.rounds_played, 0);
    assert_eq!(outcome.game.status, GameStatus::Aborted);
    assert_eq!(outcome.game.end_reason, Some(EndReason::StopSignal));
    assert!(arena.history().rounds(outcome.game.id).is_empty());
}

#[test]
fn unreachable_workloads_fail_before_the_game_starts() {
    init_logger();
    let sandbox = FakeSandbox::new().without("blue-target");
    let mut arena = arena(sandbox, MemoryHistory::new(), idle(), idle(), 5);

    let error = arena.run().unwrap_err();
    assert!(format!("{error:#}").contains("blue-target"));
    assert_eq!(arena.history().games().count(), 0);
}

#[test]
fn series_tally_every_game() {
    init_logger();
    let mut arena = arena(FakeSandbox::new(), MemoryHistory::new(), idle(), idle(), 2);
    let (score, outcomes) = Series::new(3).run(&mut arena).unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(score.blue_wins, 3);
    assert_eq!(score.totals, Scores::new(0, 60));
    assert_eq!(arena.history().games().count(), 3);
}
