//! Task discovery: YAML manifests in a directory join the built-ins, run
//! through the same runner, and produce logs the trajectory loader reads.

#[path = "task_testkit.rs"]
mod task_testkit;

use std::fs;

use tempfile::tempdir;

use taskgraph::event_log::{EventLogger, ReservedKeys};
use taskgraph::output::{
    create_run_dir, ensure_can_write, events_file_name, run_dir, RunSummary, SUMMARY_FILE,
};
use taskgraph::trajectory::load_trajectories;
use taskgraph::{
    Frontend, RandomAgent, ScriptedAgent, TaskError, TaskRegistry, TaskRunner, WindowSize,
};

use task_testkit::{identity, sim_config, BUILTIN_TASKS};

const BANDIT: &str = r#"
name: bandit
description: two-armed bandit with a fixation cross
keys: [left, right]
graph:
  0: !deterministic [1, 2]
  1: terminal
  2: terminal
rewards:
  1: !constant 1.0
  2: !categorical
    outcomes: [0.0, 2.0]
    probs: [0.5, 0.5]
hooks:
  0:
    - kind: passive
      name: fixation
      duration: 0.5
    - kind: action
      name: choice
      duration: 1.5
  1:
    - kind: feedback
      name: outcome
      duration: 1.0
      text: "{reward}"
  2:
    - kind: feedback
      name: outcome
      duration: 1.0
schedule:
  quotas: {a: 5, b: 5}
  update: [fixation]
  jitter: [[0.4, 0.6]]
  break_every: 5
  break_duration: 10
"#;

#[test]
fn builtins_are_registered() {
    let registry = TaskRegistry::builtin();
    assert_eq!(registry.len(), BUILTIN_TASKS.len());
    for name in BUILTIN_TASKS {
        assert_eq!(registry.get(name).unwrap().name(), name);
    }
}

#[test]
fn builtin_schedules_generate_for_any_seed() {
    let registry = TaskRegistry::builtin();
    for name in BUILTIN_TASKS {
        let task = registry.get(name).unwrap();
        for set in ["1", "2"] {
            for seed in 0..50 {
                let schedule = task
                    .get_configs(set, seed)
                    .unwrap_or_else(|e| panic!("{name} set {set} seed {seed}: {e}"));
                schedule.validate().unwrap();
                assert!(schedule.trials().next().is_some(), "{name} produced no trials");
            }
        }
    }
}

#[test]
fn unknown_task_lists_known_names() {
    let err = TaskRegistry::builtin().get("stroop").unwrap_err();
    match err {
        TaskError::MissingTaskPlugin { name, known } => {
            assert_eq!(name, "stroop");
            assert!(known.contains("two_step"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn manifest_directory_is_discovered() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("bandit.yaml"), BANDIT).unwrap();
    fs::write(dir.path().join("notes.txt"), "not a manifest").unwrap();

    let registry = TaskRegistry::discover(Some(dir.path())).unwrap();
    assert_eq!(registry.len(), BUILTIN_TASKS.len() + 1);
    let task = registry.get("bandit").unwrap();
    assert_eq!(task.description(), "two-armed bandit with a fixation cross");

    let schedule = task.get_configs("1", 4).unwrap();
    assert_eq!(schedule.ntrials, 10);
    assert_eq!(schedule.breakpoints, vec![4]);
}

#[test]
fn broken_manifest_fails_discovery() {
    let dir = tempdir().unwrap();
    let broken = BANDIT.replace("  2: terminal\n", "");
    fs::write(dir.path().join("broken.yml"), broken).unwrap();
    let err = TaskRegistry::discover(Some(dir.path())).unwrap_err();
    assert!(matches!(err, TaskError::Manifest { .. }), "{err}");
}

#[test]
fn manifest_task_runs_and_rebuilds() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("bandit.yaml"), BANDIT).unwrap();
    let registry = TaskRegistry::discover(Some(dir.path())).unwrap();
    let task = registry.get("bandit").unwrap();

    let seed = 9;
    let config = sim_config(seed);
    let schedule = task.get_configs("1", seed).unwrap();
    let bundle = task
        .get_task(&schedule.condition_dict, WindowSize::default(), seed)
        .unwrap();
    let mut runner = TaskRunner::from_bundle(bundle, schedule, &config)
        .unwrap()
        .with_identity(identity());
    let (mut logger, _clock) = EventLogger::simulated(ReservedKeys::default());
    let mut agent = ScriptedAgent::default();
    let stats = runner
        .run(&mut logger, &mut Frontend::Agent(&mut agent))
        .unwrap();
    assert_eq!(stats.trials_completed, 10);
    assert_eq!(stats.breaks, 1);

    let out = dir.path().join("out");
    let run = create_run_dir(&out, task.name(), &identity()).unwrap();
    assert_eq!(run, run_dir(&out, task.name(), &identity()));
    let log_path = run.join(events_file_name(task.name(), &identity()));
    logger.save(&log_path).unwrap();

    let episodes = load_trajectories(&log_path).unwrap();
    assert_eq!(episodes.len(), 10);
    assert!(episodes.iter().all(|e| e.is_complete() && e.steps.len() == 1));
    let rebuilt: f64 = episodes.iter().map(|e| e.total_reward()).sum();
    assert!((rebuilt - stats.total_reward).abs() < 1e-9);

    let summary =
        RunSummary::new(task.name(), "1", &identity(), &config, &stats, &log_path).unwrap();
    summary.write_to_file(run.join(SUMMARY_FILE)).unwrap();
    let back = RunSummary::read_from_file(run.join(SUMMARY_FILE)).unwrap();
    assert_eq!(back, summary);
}

#[test]
fn existing_log_is_protected() {
    let dir = tempdir().unwrap();
    let task = TaskRegistry::builtin().get("hcp_gambling").unwrap();
    let seed = 3;
    let schedule = task.get_configs("1", seed).unwrap();
    let bundle = task
        .get_task(&schedule.condition_dict, WindowSize::default(), seed)
        .unwrap();
    let mut runner = TaskRunner::from_bundle(bundle, schedule, &sim_config(seed)).unwrap();
    let (mut logger, _clock) = EventLogger::simulated(ReservedKeys::default());
    runner
        .run(&mut logger, &mut Frontend::Agent(&mut RandomAgent::new(seed)))
        .unwrap();

    let path = dir.path().join(events_file_name("hcp_gambling", &identity()));
    logger.save(&path).unwrap();
    let before = fs::read(&path).unwrap();

    let err = ensure_can_write(&path, false, |_| false).unwrap_err();
    assert!(matches!(err, TaskError::OverwriteRefused { .. }));
    assert_eq!(fs::read(&path).unwrap(), before);
    ensure_can_write(&path, true, |_| false).unwrap();
}
