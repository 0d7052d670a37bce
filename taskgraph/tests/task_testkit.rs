// tests/task_testkit.rs
//
// Shared helpers for the integration tests: simulated runs of built-in tasks
// and per-trial views of an event log.
//
// Note: This module is included via #[path] from other test files.
// The dead_code warnings are suppressed because not all functions
// are used in every test file that includes this module.

#![allow(dead_code)]

use taskgraph::event_log::{EventLogger, EventRecord, ReservedKeys};
use taskgraph::{
    Agent, Frontend, RandomAgent, RunConfig, RunIdentity, RunMode, RunStats, TaskRegistry,
    TaskRunner, TrialSchedule, WindowSize,
};

pub const BUILTIN_TASKS: [&str; 6] = [
    "hcp_gambling",
    "two_step",
    "go_nogo",
    "mid",
    "risk_sensitive",
    "posner",
];

pub fn sim_config(seed: u64) -> RunConfig {
    RunConfig::default()
        .with_mode(RunMode::Simulated)
        .with_seed(Some(seed))
}

pub fn identity() -> RunIdentity {
    RunIdentity {
        participant: "sim".into(),
        run: "1".into(),
        session: "1".into(),
    }
}

/// Full simulated run of a built-in task with a random agent.
pub fn simulate_builtin(task: &str, seed: u64) -> (EventLogger, RunStats) {
    let mut agent = RandomAgent::new(seed);
    simulate_builtin_with(task, seed, None, &mut agent)
}

/// Simulated run of a built-in task, optionally with a replacement schedule.
pub fn simulate_builtin_with(
    task: &str,
    seed: u64,
    schedule: Option<TrialSchedule>,
    agent: &mut dyn Agent,
) -> (EventLogger, RunStats) {
    let config = sim_config(seed);
    let registry = TaskRegistry::builtin();
    let def = registry.get(task).unwrap();
    let schedule = match schedule {
        Some(s) => s,
        None => def.get_configs("1", seed).unwrap(),
    };
    let bundle = def
        .get_task(&schedule.condition_dict, WindowSize::default(), seed)
        .unwrap();
    let mut runner = TaskRunner::from_bundle(bundle, schedule, &config)
        .unwrap()
        .with_identity(identity());
    let (mut logger, _clock) = EventLogger::simulated(ReservedKeys::default());
    let stats = runner
        .run(&mut logger, &mut Frontend::Agent(agent))
        .unwrap();
    (logger, stats)
}

/// Rows grouped by trial index, in log order. Rows without a trial are dropped.
pub fn rows_by_trial(records: &[EventRecord]) -> Vec<(usize, Vec<&EventRecord>)> {
    let mut out: Vec<(usize, Vec<&EventRecord>)> = Vec::new();
    for r in records {
        let Some(t) = r.trial else { continue };
        match out.last_mut() {
            Some((last, rows)) if *last == t => rows.push(r),
            _ => out.push((t, vec![r])),
        }
    }
    out
}

pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
