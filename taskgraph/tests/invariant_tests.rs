//! Property-style invariants over every built-in task and a range of seeds.
//!
//! - every legal walk from every start terminates within the graph size
//! - trial-end totals move by exactly the trial's summed delta_reward
//! - transitions rebuilt from rl_label rows match what the engine did
//! - trial-local time starts >= 0 and never decreases within a trial
//! - drifting reward parameters stay within their bounds
//! - the event log is well-formed TSV that parses back identically

#[path = "task_testkit.rs"]
mod task_testkit;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use taskgraph::event_log::{parse_event_log, EventLogger, ReservedKeys, COLUMNS, NA};
use taskgraph::reward::{DRIFT_LOWER, DRIFT_UPPER};
use taskgraph::trajectory::reconstruct;
use taskgraph::{
    ConditionTag, Driver, DriftingReward, RewardSource, ScriptedAgent, TaskRegistry, WindowSize,
};

use task_testkit::{rows_by_trial, simulate_builtin, simulate_builtin_with, BUILTIN_TASKS};

const SEEDS: std::ops::Range<u64> = 0..4;

#[test]
fn every_walk_terminates() {
    let registry = TaskRegistry::builtin();
    for name in BUILTIN_TASKS {
        let def = registry.get(name).unwrap();
        let schedule = def.get_configs("1", 0).unwrap();
        let bundle = def
            .get_task(&schedule.condition_dict, WindowSize::default(), 0)
            .unwrap();
        let (mut env, _keys, _staircase) = bundle.into_env(0).unwrap();
        let starts: Vec<usize> = env
            .graph()
            .states()
            .filter(|(_, t)| !t.is_terminal())
            .map(|(s, _)| s)
            .collect();
        let bound = env.graph().n_states();
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        for condition in schedule.distinct_conditions() {
            for &start in &starts {
                for _ in 0..5 {
                    let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
                    let (mut obs, _) = env
                        .reset(start, &condition, &mut log, &mut Driver::Silent)
                        .unwrap();
                    let mut steps = 0;
                    while !env.graph().is_terminal(obs) {
                        let avail = env.avail_actions(obs);
                        assert!(!avail.is_empty(), "{name}: dead end at {obs}");
                        let a = avail[rng.gen_range(0..avail.len())];
                        let r = env.step(a, &mut log, &mut Driver::Silent).unwrap();
                        obs = r.obs;
                        steps += 1;
                        assert!(steps <= bound, "{name}: walk from {start} did not terminate");
                    }
                }
            }
        }
    }
}

#[test]
fn trial_end_totals_match_summed_deltas() {
    for name in BUILTIN_TASKS {
        for seed in SEEDS {
            let (log, stats) = simulate_builtin(name, seed);
            let mut previous = 0.0;
            for (trial, rows) in rows_by_trial(log.records()) {
                let deltas: f64 = rows.iter().filter_map(|r| r.delta_reward).sum();
                let end = rows
                    .iter()
                    .find(|r| r.event_type == "trial-end")
                    .unwrap_or_else(|| panic!("{name}/{seed}: trial {trial} has no trial-end"));
                assert!(
                    (end.total_reward - previous - deltas).abs() < 1e-9,
                    "{name}/{seed}: trial {trial}"
                );
                previous = end.total_reward;
            }
            assert!((previous - stats.total_reward).abs() < 1e-9);
        }
    }
}

#[test]
fn rebuilt_transitions_match_engine() {
    for name in BUILTIN_TASKS {
        for seed in SEEDS {
            // Always responds in time, so every trial completes.
            let mut agent = ScriptedAgent::default();
            let (log, stats) = simulate_builtin_with(name, seed, None, &mut agent);
            assert_eq!(stats.trials_aborted, 0, "{name}/{seed}");

            let steps: Vec<_> = reconstruct(log.records())
                .into_iter()
                .flat_map(|e| e.steps)
                .collect();
            let history = agent.history();
            assert_eq!(steps.len(), history.len(), "{name}/{seed}");
            for (rebuilt, seen) in steps.iter().zip(history) {
                assert_eq!(rebuilt.obs, seen.obs, "{name}/{seed}");
                assert_eq!(rebuilt.next_obs, seen.next_obs, "{name}/{seed}");
                assert_eq!(rebuilt.reward, seen.reward, "{name}/{seed}");
                assert_eq!(rebuilt.terminal, seen.terminated, "{name}/{seed}");
            }
        }
    }
}

#[test]
fn trial_time_is_non_negative_and_monotone() {
    for name in BUILTIN_TASKS {
        for seed in SEEDS {
            let (log, _) = simulate_builtin(name, seed);
            for (trial, rows) in rows_by_trial(log.records()) {
                let times: Vec<f64> = rows.iter().map(|r| r.trial_time.unwrap()).collect();
                assert!(times[0] >= 0.0, "{name}/{seed}: trial {trial}");
                assert!(
                    times.windows(2).all(|w| w[1] >= w[0]),
                    "{name}/{seed}: trial {trial} time went backwards"
                );
            }
            let onsets: Vec<f64> = log.records().iter().map(|r| r.onset).collect();
            assert!(onsets.windows(2).all(|w| w[1] >= w[0]));
        }
    }
}

#[test]
fn drifting_parameters_stay_in_bounds() {
    let mut emitter = DriftingReward::bernoulli(0.74, 1.0, 5).unwrap();
    let tag = ConditionTag::from("any");
    for _ in 0..20_000 {
        let value = emitter.emit(&tag).unwrap();
        assert!(value == 0.0 || value == 1.0);
        let p = emitter.parameter();
        assert!((DRIFT_LOWER..=DRIFT_UPPER).contains(&p), "p = {p}");
    }

    for seed in SEEDS {
        let registry = TaskRegistry::builtin();
        let def = registry.get("two_step").unwrap();
        let schedule = def.get_configs("1", seed).unwrap();
        let bundle = def
            .get_task(&schedule.condition_dict, WindowSize::default(), seed)
            .unwrap();
        let (mut env, _, _) = bundle.into_env(seed).unwrap();
        let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
        for _ in 0..500 {
            env.reset(0, &ConditionTag::from("expected"), &mut log, &mut Driver::Silent)
                .unwrap();
            env.step(0, &mut log, &mut Driver::Silent).unwrap();
            env.step(1, &mut log, &mut Driver::Silent).unwrap();
        }
        for (state, p) in env.drift_parameters() {
            assert!((DRIFT_LOWER..=DRIFT_UPPER).contains(&p), "state {state}: {p}");
        }
    }
}

#[test]
fn log_is_well_formed_tsv() {
    for name in BUILTIN_TASKS {
        let (log, _) = simulate_builtin(name, 1);
        let text = log.to_tsv();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), COLUMNS.join("\t"));
        for line in lines {
            let cells: Vec<&str> = line.split('\t').collect();
            assert_eq!(cells.len(), COLUMNS.len(), "{name}: {line}");
            assert!(cells.iter().all(|c| !c.is_empty()), "{name}: empty cell");
        }
        assert!(text.contains(NA));

        let parsed = parse_event_log(&text).unwrap();
        assert_eq!(parsed.len(), log.records().len());
        let reparsed: String = parsed.iter().map(|r| r.to_tsv_row() + "\n").collect();
        assert!(text.ends_with(&reparsed));
    }
}
