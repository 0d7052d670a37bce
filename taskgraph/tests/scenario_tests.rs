//! End-to-end scenarios on single trials and short runs.
//!
//! Each test drives the full runner (schedule -> reset -> step -> logging)
//! with a scripted agent on a virtual clock and checks the event log.

#[path = "task_testkit.rs"]
mod task_testkit;

use rand::rngs::mock::StepRng;

use taskgraph::engine::HookTable;
use taskgraph::event_log::{EventLogger, ReservedKeys, RlLabel};
use taskgraph::hooks::ActionHook;
use taskgraph::tasks::{go_nogo, mid, risk_sensitive};
use taskgraph::{
    CategoricalReward, ConditionTable, ConditionTag, Driver, Frontend, RewardTable,
    ScriptedAgent, TaskEnv, TaskGraph, TaskRunner, Transition, TrialSchedule,
};

use task_testkit::{approx_eq, identity, rows_by_trial, sim_config, simulate_builtin_with};

fn hcp_env(seed: u64) -> TaskEnv {
    let graph = TaskGraph::from_pairs([
        (0, Transition::Deterministic(vec![1, 2])),
        (1, Transition::Terminal),
        (2, Transition::Terminal),
    ])
    .unwrap();
    let mut rewards = RewardTable::new();
    rewards.insert(1, Box::new(CategoricalReward::constant(5.0)) as _);
    rewards.insert(2, Box::new(CategoricalReward::constant(5.0)) as _);
    let mut hooks = HookTable::new();
    hooks.insert(
        0,
        vec![Box::new(ActionHook::new("guess", 1.5).with_keys(["left", "right"])) as _],
    );
    TaskEnv::new(graph, rewards, ConditionTable::new(), hooks, seed).unwrap()
}

#[test]
fn hcp_single_trial_engine_contract() {
    let mut env = hcp_env(0);
    let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
    let neutral = ConditionTag::from(1);

    let (obs, info) = env.reset(0, &neutral, &mut log, &mut Driver::Silent).unwrap();
    assert_eq!(obs, 0);
    assert_eq!(info.avail_actions, vec![0, 1]);
    assert!(!info.skip_node);

    let r = env.step(0, &mut log, &mut Driver::Silent).unwrap();
    assert_eq!(r.obs, 1);
    assert_eq!(r.reward, 5.0);
    assert!(r.terminated);
}

#[test]
fn hcp_single_trial_logs_one_trial_end_with_total() {
    let config = sim_config(0);
    let schedule = TrialSchedule::new("hcp_gambling", vec![ConditionTag::from(1)]);
    let mut runner = TaskRunner::new(
        hcp_env(0),
        schedule,
        vec!["left".into(), "right".into()],
        None,
        &config,
    )
    .unwrap()
    .with_identity(identity());
    let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
    let mut agent = ScriptedAgent::new([(0, 0.4)]);

    let stats = runner
        .run(&mut log, &mut Frontend::Agent(&mut agent))
        .unwrap();
    assert_eq!(stats.trials_completed, 1);
    assert_eq!(stats.total_reward, 5.0);

    let ends: Vec<_> = log
        .records()
        .iter()
        .filter(|r| r.event_type == "trial-end")
        .collect();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].total_reward, 5.0);
    assert_eq!(ends[0].misc.as_deref(), Some("completed"));

    // obs -> action -> reward -> obs
    let labels: Vec<RlLabel> = log.records().iter().filter_map(|r| r.rl_label).collect();
    assert_eq!(
        labels,
        vec![RlLabel::Obs, RlLabel::Action, RlLabel::Reward, RlLabel::Obs]
    );
    let resp = log
        .records()
        .iter()
        .find(|r| r.event_type == "response")
        .unwrap();
    assert_eq!(resp.response_button.as_deref(), Some("left"));
    assert!(approx_eq(resp.response_time.unwrap(), 0.4));
    assert_eq!(agent.history().len(), 1);
    assert_eq!(agent.history()[0].next_obs, 1);
}

#[test]
fn two_step_rare_transition() {
    let stage1 = Transition::probabilistic(vec![1, 2], 0.7);
    // First uniform draw is 0.9.
    let bits = ((0.9 * (1u64 << 53) as f64) as u64) << 11;
    let mut rng = StepRng::new(bits, 0);
    assert_eq!(stage1.route(0, &mut rng), Some(2));

    // Below 0.7 the common destination wins.
    let bits = ((0.3 * (1u64 << 53) as f64) as u64) << 11;
    let mut rng = StepRng::new(bits, 0);
    assert_eq!(stage1.route(0, &mut rng), Some(1));
    assert_eq!(stage1.route(1, &mut rng), Some(2));
}

#[test]
fn go_nogo_late_press_times_out_to_withhold() {
    let schedule = TrialSchedule::new(go_nogo::NAME, vec![ConditionTag::from("go")])
        .with_condition_dict(go_nogo::start_conditions());
    let mut agent = ScriptedAgent::new([(0, 0.75)]);
    let (log, stats) = simulate_builtin_with(go_nogo::NAME, 3, Some(schedule), &mut agent);
    assert_eq!(stats.trials_completed, 1);

    let timeout = log
        .records()
        .iter()
        .find(|r| r.event_type == "response-time-out")
        .expect("timeout row");
    assert_eq!(timeout.response_late, Some(true));
    assert_eq!(timeout.response_button.as_deref(), Some("space"));
    assert_eq!(timeout.rl_label, Some(RlLabel::Action));
    assert_eq!(timeout.action, Some(go_nogo::WITHHOLD));
    // No in-window press anywhere; the late one only shows on the timeout row.
    assert!(log
        .records()
        .iter()
        .all(|r| !(r.response_time.is_some() && r.response_late == Some(false))));

    // The engine stepped with the timeout action: go + withhold = miss (3).
    let exp = &agent.history()[0];
    assert_eq!(exp.action, go_nogo::WITHHOLD);
    assert_eq!(exp.next_obs, 3);
}

#[test]
fn risk_sensitive_logs_remapped_action() {
    let tag = risk_sensitive::pair_tag(3, 1);
    let schedule = TrialSchedule::new(risk_sensitive::NAME, vec![tag])
        .with_condition_dict(risk_sensitive::pair_conditions());
    let mut agent = ScriptedAgent::new([(0, 0.5)]);
    let (log, _stats) =
        simulate_builtin_with(risk_sensitive::NAME, 1, Some(schedule), &mut agent);

    let resp = log
        .records()
        .iter()
        .find(|r| r.event_type == "response")
        .unwrap();
    assert_eq!(resp.response_button.as_deref(), Some("left"));
    assert_eq!(resp.action, Some(3));

    let reward = log
        .records()
        .iter()
        .find(|r| r.rl_label == Some(RlLabel::Reward))
        .unwrap();
    assert_eq!(reward.current_location, Some(risk_sensitive::terminal_of(3)));

    // The agent saw its own physical action.
    assert_eq!(agent.history()[0].action, 0);
}

#[test]
fn mid_staircase_follows_win_trial_hit_rate() {
    // Ten large-win trials, one hit: the target lengthens after wins 3, 6, 9.
    let schedule = TrialSchedule::new(mid::NAME, vec![ConditionTag::from("win-large"); 10]);
    let mut script = vec![(0, 0.1)];
    script.extend(std::iter::repeat((1, 0.1)).take(9));
    let mut agent = ScriptedAgent::new(script);
    let (log, stats) = simulate_builtin_with(mid::NAME, 0, Some(schedule), &mut agent);

    assert_eq!(stats.trials_completed, 10);
    let target = stats.final_target_duration.unwrap();
    assert!(approx_eq(target, 0.375), "target {target}");

    // The last trial ran with the duration set after win 9.
    let last_window = log
        .records()
        .iter()
        .filter(|r| r.event_type == mid::TARGET_HOOK)
        .last()
        .unwrap();
    assert!(approx_eq(last_window.expected_duration.unwrap(), 0.375));

    let hits = log
        .records()
        .iter()
        .filter(|r| r.event_type == "response")
        .count();
    assert_eq!(hits, 1);
}

#[test]
fn break_point_inserts_single_break_row() {
    let schedule = TrialSchedule::new("hcp_gambling", vec![ConditionTag::from("reward"); 40])
        .with_breaks(vec![39], 15.0);
    let mut agent = ScriptedAgent::default();
    let (log, stats) = simulate_builtin_with("hcp_gambling", 2, Some(schedule), &mut agent);
    assert_eq!(stats.breaks, 1);

    let records = log.records();
    let breaks: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.event_type == "break")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(breaks.len(), 1);
    let row = &records[breaks[0]];
    assert_eq!(row.expected_duration, Some(15.0));
    assert_eq!(row.trial, Some(39));

    // After trial 39's trial-end.
    let end = records
        .iter()
        .rposition(|r| r.event_type == "trial-end")
        .unwrap();
    assert!(breaks[0] > end);
}

#[test]
fn unknown_condition_aborts_only_its_trial() {
    let tags = ["reward", "bogus", "reward"].map(ConditionTag::from).to_vec();
    let schedule = TrialSchedule::new("hcp_gambling", tags);
    let mut agent = ScriptedAgent::default();
    let (log, stats) = simulate_builtin_with("hcp_gambling", 4, Some(schedule), &mut agent);
    assert_eq!(stats.trials_completed, 2);
    assert_eq!(stats.trials_aborted, 1);

    let trials = rows_by_trial(log.records());
    assert_eq!(trials.len(), 3);
    let (index, rows) = &trials[1];
    assert_eq!(*index, 1);
    let kinds: Vec<&str> = rows.iter().map(|r| r.event_type.as_str()).collect();
    let aborted = kinds.iter().position(|k| *k == "trial-aborted").unwrap();
    let end = kinds.iter().position(|k| *k == "trial-end").unwrap();
    assert!(aborted < end);
    assert_eq!(rows[end].misc.as_deref(), Some("failed"));

    let last_end = trials[2].1.iter().find(|r| r.event_type == "trial-end").unwrap();
    assert_eq!(last_end.misc.as_deref(), Some("completed"));
}
