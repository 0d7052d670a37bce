// src/main.rs
//
// Command-line entrypoint.
//
// Subcommands:
// - list:       registered tasks (built-ins plus manifests from --task-dir)
// - play:       interactive console play of a few episodes
// - run:        an experimental run for one participant; --simulate lets a
//               random agent drive it on a virtual clock
// - trajectory: rebuild (s, a, r, s') transitions from an event log
//
// Precedence for run settings: CLI flag > TASKGRAPH_* env > default.
// Diagnostics go to stderr through tracing (RUST_LOG overrides -v).

use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskgraph::clock::{MonotonicClock, VirtualClock};
use taskgraph::output::{
    create_run_dir, ensure_can_write, events_file_name, RunSummary, SUMMARY_FILE,
};
use taskgraph::trajectory::{load_trajectories, write_jsonl};
use taskgraph::{
    ConsoleWindow, EventLogger, Frontend, RandomAgent, RunConfig, RunIdentity, RunMode,
    RunStats, TaskDefinition, TaskError, TaskRegistry, TaskRunner, WindowSize,
};

#[derive(Debug, Parser)]
#[command(
    name = "taskgraph",
    about = "Task-graph runner for behavioural RL experiments",
    version
)]
struct Cli {
    /// Verbosity: -v, -vv
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered tasks.
    List {
        /// Directory of *.yaml task manifests.
        #[arg(long)]
        task_dir: Option<PathBuf>,
    },
    /// Play a task interactively in the terminal.
    Play(PlayArgs),
    /// Experimental run for one participant.
    Run(RunArgs),
    /// Rebuild transitions from an event log as JSON lines.
    Trajectory {
        /// Event log (TSV).
        log: PathBuf,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct PlayArgs {
    #[arg(long)]
    task: String,

    #[arg(long, default_value_t = 5)]
    episodes: usize,

    #[arg(long, default_value_t = WindowSize::default())]
    window_size: WindowSize,

    #[arg(long)]
    task_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    task: String,

    #[arg(long)]
    participant: String,

    #[arg(long, default_value = "1")]
    run: String,

    #[arg(long, default_value = "1")]
    session: String,

    #[arg(long, default_value = "1")]
    stimulus_set: String,

    #[arg(long, default_value_t = WindowSize::default())]
    window_size: WindowSize,

    /// Output directory (default: TASKGRAPH_OUTPUT_DIR or runs/).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Overwrite an existing event log without asking.
    #[arg(long)]
    force: bool,

    /// Drive the run with a random agent on a virtual clock.
    #[arg(long)]
    simulate: bool,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    task_dir: Option<PathBuf>,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "taskgraph=info",
        1 => "taskgraph=debug",
        _ => "taskgraph=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(io::stderr)
        .init();
}

fn find_task(task_dir: Option<&Path>, name: &str) -> Result<Arc<dyn TaskDefinition>> {
    let registry = TaskRegistry::discover(task_dir).context("loading task manifests")?;
    Ok(registry.get(name)?)
}

/// Ask on stdin whether `path` may be overwritten.
fn confirm_overwrite(path: &Path) -> bool {
    eprint!("{} already exists. Overwrite? [y/N] ", path.display());
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Run to completion, treating a kill-switch abort as a clean stop.
fn finish(result: Result<RunStats, TaskError>) -> Result<Option<RunStats>> {
    match result {
        Ok(stats) => Ok(Some(stats)),
        Err(TaskError::RunAborted { key }) => {
            warn!(%key, "run aborted by operator");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_list(task_dir: Option<&Path>) -> Result<()> {
    let registry = TaskRegistry::discover(task_dir).context("loading task manifests")?;
    for (name, task) in registry.iter() {
        println!("{name:<20} {}", task.description());
    }
    Ok(())
}

fn cmd_play(args: PlayArgs, config: RunConfig) -> Result<()> {
    let task = find_task(args.task_dir.as_deref(), &args.task)?;
    let schedule = task
        .get_configs("1", config.seed)?
        .truncated(args.episodes);
    let bundle = task.get_task(&schedule.condition_dict, args.window_size, config.seed)?;
    let mut runner = TaskRunner::from_bundle(bundle, schedule, &config)?;

    let path = std::env::temp_dir().join(format!(
        "taskgraph-play-{}-{}.tsv",
        task.name(),
        std::process::id()
    ));
    let clock = MonotonicClock::new();
    let mut logger = EventLogger::create(
        &path,
        Box::new(clock),
        config.reserved_keys(),
        config.frame_rate,
    )?;
    let mut window = ConsoleWindow::new(args.window_size, clock);
    println!("type a key name and press Enter; '{}' quits", config.kill_key);

    let stats = finish(runner.run(&mut logger, &mut Frontend::Live(&mut window)))?;
    logger.close()?;
    if let Some(stats) = stats {
        println!(
            "episodes={} total_reward={} log={}",
            stats.trials_completed + stats.trials_aborted,
            stats.total_reward,
            path.display()
        );
    }
    Ok(())
}

fn cmd_run(args: RunArgs, config: RunConfig) -> Result<()> {
    let mode = if args.simulate { RunMode::Simulated } else { RunMode::Live };
    let config = config
        .with_mode(mode)
        .with_seed(args.seed)
        .with_output_dir(args.output_dir.clone());
    config.log_startup();

    let task = find_task(args.task_dir.as_deref(), &args.task)?;
    let identity = RunIdentity {
        participant: args.participant.clone(),
        run: args.run.clone(),
        session: args.session.clone(),
    };

    // Nothing is created before the overwrite check passes.
    let dir = taskgraph::output::run_dir(&config.output_dir, task.name(), &identity);
    let log_path = dir.join(events_file_name(task.name(), &identity));
    ensure_can_write(&log_path, args.force, confirm_overwrite)?;

    let schedule = task.get_configs(&args.stimulus_set, config.seed)?;
    let bundle = task.get_task(&schedule.condition_dict, args.window_size, config.seed)?;
    let mut runner =
        TaskRunner::from_bundle(bundle, schedule, &config)?.with_identity(identity.clone());

    create_run_dir(&config.output_dir, task.name(), &identity)?;
    if log_path.exists() {
        fs::remove_file(&log_path)
            .with_context(|| format!("removing {}", log_path.display()))?;
    }

    let stats = match mode {
        RunMode::Simulated => {
            let clock = VirtualClock::new();
            let mut logger =
                EventLogger::in_memory(Box::new(clock), config.reserved_keys(), config.frame_rate);
            let mut agent = RandomAgent::new(config.seed);
            let stats = finish(runner.run(&mut logger, &mut Frontend::Agent(&mut agent)))?;
            logger.save(&log_path)?;
            stats
        }
        RunMode::Live => {
            let clock = MonotonicClock::new();
            let mut logger = EventLogger::create(
                &log_path,
                Box::new(clock),
                config.reserved_keys(),
                config.frame_rate,
            )?;
            let mut window = ConsoleWindow::new(args.window_size, clock);
            let stats = finish(runner.run(&mut logger, &mut Frontend::Live(&mut window)))?;
            logger.close()?;
            stats
        }
    };

    let Some(stats) = stats else {
        println!("aborted; partial log at {}", log_path.display());
        return Ok(());
    };
    let summary = RunSummary::new(
        task.name(),
        &args.stimulus_set,
        &identity,
        &config,
        &stats,
        &log_path,
    )?;
    let summary_path = dir.join(SUMMARY_FILE);
    summary
        .write_to_file(&summary_path)
        .with_context(|| format!("writing {}", summary_path.display()))?;
    info!(path = %summary_path.display(), sha256 = %summary.event_log_sha256, "run summary written");

    println!(
        "taskgraph | task={} | participant={} | run={} | mode={} | seed={} | completed={} | aborted={} | total_reward={} | log={}",
        summary.task,
        summary.participant,
        summary.run,
        summary.mode,
        summary.seed,
        summary.trials_completed,
        summary.trials_aborted,
        summary.total_reward,
        log_path.display()
    );
    Ok(())
}

fn cmd_trajectory(log: &Path, out: Option<&Path>) -> Result<()> {
    let episodes =
        load_trajectories(log).with_context(|| format!("reading {}", log.display()))?;
    match out {
        Some(path) => {
            let file = fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            write_jsonl(&episodes, BufWriter::new(file))?;
        }
        None => write_jsonl(&episodes, io::stdout().lock())?,
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = RunConfig::from_env();
    match cli.command {
        Command::List { task_dir } => cmd_list(task_dir.as_deref()),
        Command::Play(args) => cmd_play(args, config.with_mode(RunMode::Live)),
        Command::Run(args) => cmd_run(args, config),
        Command::Trajectory { log, out } => cmd_trajectory(&log, out.as_deref()),
    }
}
