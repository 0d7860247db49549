//! Command-line entry point: play games, list scenarios, summarize recorded history.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, Level};

use cyber_arena::{
    constraints::Constraints,
    decision::DecisionMaker,
    game::{EndReason, GameStatus},
    init_logger,
    prelude::*,
};

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_PERSISTENCE_FAILURE: u8 = 2;
const EXIT_STOPPED: u8 = 130;

#[derive(Parser)]
#[command(name = "arena")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Red team versus blue team arena for autonomous agents", long_about = None)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, env = "ARENA_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Scenario catalog (`{"scenarios": [...]}`); the built-in catalog when omitted
    #[arg(long, global = true, env = "ARENA_SCENARIOS")]
    scenarios_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play one or more games
    Run(RunArgs),
    /// List available scenarios
    Scenarios,
    /// Summarize games recorded in a history file
    Report {
        /// JSON Lines history file
        history: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Scenario identifier
    #[arg(short, long, default_value = DEFAULT_SCENARIO)]
    scenario: String,

    /// Round limit; the scenario's estimate when omitted
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Number of games to play
    #[arg(short, long, default_value = "1")]
    games: u32,

    /// Per-command timeout in seconds
    #[arg(long)]
    command_timeout: Option<u64>,

    /// Per-decision timeout in seconds
    #[arg(long)]
    decision_timeout: Option<u64>,

    /// Winner selection at the round limit: higher_score or draw
    #[arg(long)]
    tie_break: Option<TieBreak>,

    /// Lowest cumulative score a side can reach
    #[arg(long, allow_hyphen_values = true)]
    score_floor: Option<i64>,

    /// Model recorded for the red side
    #[arg(long, default_value = "scripted")]
    red_model: String,

    /// Agent executable for the red side
    #[arg(long)]
    red_agent: Option<PathBuf>,

    /// Extra argument for the red agent executable (repeatable)
    #[arg(long = "red-agent-arg")]
    red_agent_args: Vec<String>,

    /// JSON array of canned red decisions, used when no agent is given
    #[arg(long, conflicts_with = "red_agent")]
    red_script: Option<PathBuf>,

    /// Workload override for the red side
    #[arg(long)]
    red_workload: Option<String>,

    /// Model recorded for the blue side
    #[arg(long, default_value = "scripted")]
    blue_model: String,

    /// Agent executable for the blue side
    #[arg(long)]
    blue_agent: Option<PathBuf>,

    /// Extra argument for the blue agent executable (repeatable)
    #[arg(long = "blue-agent-arg")]
    blue_agent_args: Vec<String>,

    /// JSON array of canned blue decisions, used when no agent is given
    #[arg(long, conflicts_with = "blue_agent")]
    blue_script: Option<PathBuf>,

    /// Workload override for the blue side
    #[arg(long)]
    blue_workload: Option<String>,

    /// Append the game history to this JSON Lines file; kept in memory when omitted
    #[arg(long, env = "ARENA_HISTORY")]
    history: Option<PathBuf>,

    /// Run commands on this host instead of in containers
    #[arg(long)]
    local: bool,

    /// Container engine used to reach workloads
    #[arg(long, default_value = "docker")]
    engine: String,

    /// Run commands and agents without a cgroup when one cannot be created
    #[arg(long)]
    allow_uncontained: bool,

    /// Abort the running game at the next round boundary once this file exists
    #[arg(long)]
    stop_file: Option<PathBuf>,

    /// Do not print round progress
    #[arg(short, long)]
    quiet: bool,
}

/// Options of one side, gathered from the side-prefixed flags.
struct SideOptions<'a> {
    side: Side,
    model: &'a str,
    agent: Option<&'a PathBuf>,
    agent_args: &'a [String],
    script: Option<&'a PathBuf>,
    workload: Option<&'a str>,
}

impl RunArgs {
    fn side(&self, side: Side) -> SideOptions<'_> {
        match side {
            Side::Red => SideOptions {
                side,
                model: &self.red_model,
                agent: self.red_agent.as_ref(),
                agent_args: &self.red_agent_args,
                script: self.red_script.as_ref(),
                workload: self.red_workload.as_deref(),
            },
            Side::Blue => SideOptions {
                side,
                model: &self.blue_model,
                agent: self.blue_agent.as_ref(),
                agent_args: &self.blue_agent_args,
                script: self.blue_script.as_ref(),
                workload: self.blue_workload.as_deref(),
            },
        }
    }
}

impl SideOptions<'_> {
    fn contestant(&self, scenario: &Scenario) -> Contestant {
        let workload = self
            .workload
            .unwrap_or_else(|| scenario.workload(self.side));
        let contestant = Contestant::new(self.side, self.model, workload);
        match self.agent {
            Some(exe) => contestant.with_agent_exe(exe, self.agent_args.to_vec()),
            None => contestant,
        }
    }

    fn player(
        &self,
        scenario: &Scenario,
        constraints: &mut Constraints,
        config: &Configuration,
    ) -> anyhow::Result<Player> {
        let contestant = self.contestant(scenario);
        let decision_maker: Box<dyn DecisionMaker> = if contestant.agent_exe.is_some() {
            Box::new(ProcessAgent::launch(
                &contestant,
                &constraints.take_agent_limits(),
                config.containment(),
                config.debug_agent_stderr(),
            )?)
        } else if let Some(path) = self.script {
            Box::new(load_script(path)?)
        } else {
            Box::new(Scripted::new(Vec::<String>::new()))
        };
        Ok(Player {
            contestant,
            decision_maker,
        })
    }
}

fn load_script(path: &Path) -> anyhow::Result<Scripted> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read script {}", path.display()))?;
    let answers: Vec<serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("script {} is not a JSON array", path.display()))?;
    Ok(Scripted::new(answers.into_iter().map(|answer| match answer {
        serde_json::Value::String(raw) => raw,
        other => other.to_string(),
    })))
}

fn catalog(cli: &Cli) -> anyhow::Result<ScenarioCatalog> {
    match &cli.scenarios_file {
        Some(path) => ScenarioCatalog::load(path),
        None => Ok(ScenarioCatalog::builtin()),
    }
}

fn watch_stop_file(path: PathBuf, stop: Arc<AtomicBool>) {
    thread::spawn(move || loop {
        if path.exists() {
            info!("stop file {} found", path.display());
            stop.store(true, Ordering::SeqCst);
            break;
        }
        thread::sleep(Duration::from_millis(250));
    });
}

fn run(cli: &Cli, args: &RunArgs) -> anyhow::Result<ExitCode> {
    let scenario = catalog(cli)?.get(&args.scenario)?.clone();

    let mut config = Configuration::from_env()
        .with_verbose(!args.quiet)
        .with_max_rounds(args.max_rounds.unwrap_or(scenario.estimated_rounds));
    if args.allow_uncontained {
        config = config.with_allow_uncontained(true);
    }
    if let Some(tie_break) = args.tie_break {
        config = config.with_tie_break(tie_break);
    }
    if args.score_floor.is_some() {
        config = config.with_score_floor(args.score_floor);
    }

    let mut builder = ConstraintsBuilder::from_env();
    builder = match args.command_timeout {
        Some(secs) => builder.with_command_timeout(Duration::from_secs(secs)),
        None => builder,
    };
    builder = match args.decision_timeout {
        Some(secs) => builder.with_decision_timeout(Duration::from_secs(secs)),
        None => builder,
    };
    let mut constraints = builder.build()?;

    let backend = if args.local {
        Backend::Local
    } else {
        Backend::Container {
            binary: args.engine.clone(),
        }
    };
    let sandbox = ProcessSandbox::new(backend, &constraints, config.containment());
    let history: Box<dyn HistorySink> = match &args.history {
        Some(path) => Box::new(JsonlHistory::open(path)?),
        None => Box::new(MemoryHistory::new()),
    };

    let red = args
        .side(Side::Red)
        .player(&scenario, &mut constraints, &config)?;
    let blue = args
        .side(Side::Blue)
        .player(&scenario, &mut constraints, &config)?;

    let mut arena = Arena::new(scenario, sandbox, history, red, blue)?
        .with_configuration(config)
        .with_constraints(&constraints);
    if let Some(path) = &args.stop_file {
        watch_stop_file(path.clone(), arena.stop_handle());
    }

    let (score, outcomes) = Series::new(args.games).run(&mut arena)?;
    for outcome in &outcomes {
        println!("{outcome}");
    }
    if args.games > 1 {
        println!("{score}");
    }

    let reasons: Vec<_> = outcomes
        .iter()
        .filter(|outcome| outcome.game.status == GameStatus::Aborted)
        .filter_map(|outcome| outcome.game.end_reason)
        .collect();
    Ok(if reasons.contains(&EndReason::PersistenceFailure) {
        ExitCode::from(EXIT_PERSISTENCE_FAILURE)
    } else if reasons.contains(&EndReason::StopSignal) {
        ExitCode::from(EXIT_STOPPED)
    } else {
        ExitCode::SUCCESS
    })
}

fn report(path: &Path) -> anyhow::Result<()> {
    let history = JsonlHistory::open(path)?;
    for game in history.state().games() {
        println!(
            "{} {} [{}] {} vs {}: {} after {} round(s), score {} - {}, winner: {}",
            game.id,
            game.scenario_id,
            game.status,
            game.red_model,
            game.blue_model,
            game.end_reason
                .map_or("running".to_string(), |reason| format!("{reason:?}")),
            history.state().rounds(game.id).len(),
            game.scores.red,
            game.scores.blue,
            game.winner.map_or("none", Side::as_str),
        );
        for event in history.read_events(game.id, None)? {
            println!(
                "  round {:>3} {:>4} {:+4} {}",
                event.round_number, event.side, event.points, event.description
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let to_file = Configuration::from_env().log();
    if let Err(e) = init_logger(to_file, cli.log_file.as_deref(), level) {
        eprintln!("{e:#}");
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }

    let result = match &cli.command {
        Commands::Run(args) => run(&cli, args),
        Commands::Scenarios => catalog(&cli).map(|catalog| {
            for scenario in catalog.scenarios() {
                println!(
                    "{:<24} {:<12} {}",
                    scenario.id, scenario.difficulty, scenario.name
                );
            }
            ExitCode::SUCCESS
        }),
        Commands::Report { history } => report(history).map(|()| ExitCode::SUCCESS),
    };
    result.unwrap_or_else(|e| {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        ExitCode::from(EXIT_STARTUP_FAILURE)
    })
}
