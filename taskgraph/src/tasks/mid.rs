// src/tasks/mid.rs
//
// Monetary incentive delay.
//
// A cue announces the stake, a short blank follows (presses there are too
// early), then a target appears briefly. Pressing while it is up is a hit
// (action 0); anything else is a miss (action 1). Wins pay on hits, losses
// cost on misses. The target duration follows a staircase over win trials.

use std::sync::Arc;

use crate::condition::ConditionTable;
use crate::engine::HookTable;
use crate::error::TaskResult;
use crate::graph::{TaskGraph, Transition};
use crate::hooks::{ActionHook, FeedbackHook, PassiveHook};
use crate::reward::{ConditionalReward, RewardTable};
use crate::schedule::{ScheduleBuilder, TrialSchedule};
use crate::staircase::Staircase;
use crate::window::WindowSize;

use super::{boxed, schedule_seed, TaskBundle, TaskDefinition, TaskFragment};

pub const NAME: &str = "mid";
pub const HIT: usize = 1;
pub const MISS: usize = 2;
pub const TARGET_HOOK: &str = "target";
pub const INITIAL_TARGET: f64 = 0.30;

/// (condition, payoff on hit, payoff on miss)
pub const STAKES: [(&str, f64, f64); 5] = [
    ("win-large", 5.0, 0.0),
    ("win-small", 1.0, 0.0),
    ("neutral", 0.0, 0.0),
    ("lose-small", 0.0, -1.0),
    ("lose-large", 0.0, -5.0),
];

#[derive(Debug, Clone, Default)]
pub struct Mid;

impl TaskDefinition for Mid {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "hit a brief target to win or avoid losing money"
    }

    fn get_task(
        &self,
        conditions: &ConditionTable,
        _window: WindowSize,
        _seed: u64,
    ) -> TaskResult<TaskBundle> {
        let graph = TaskGraph::from_pairs([
            (0, Transition::Deterministic(vec![HIT, MISS])),
            (HIT, Transition::Terminal),
            (MISS, Transition::Terminal),
        ])?;

        let mut rewards = RewardTable::new();
        rewards.insert(
            HIT,
            Box::new(ConditionalReward::from_pairs(STAKES.iter().map(|(t, h, _)| (*t, *h)))) as _,
        );
        rewards.insert(
            MISS,
            Box::new(ConditionalReward::from_pairs(STAKES.iter().map(|(t, _, m)| (*t, *m)))) as _,
        );

        let mut hooks = HookTable::new();
        hooks.insert(
            0,
            vec![
                boxed(PassiveHook::new("cue", "stake", 2.0)),
                boxed(PassiveHook::new("anticipation", "+", 2.0)),
                boxed(
                    ActionHook::new(TARGET_HOOK, INITIAL_TARGET)
                        .with_text("*")
                        .with_keys(["space"])
                        .with_timeout_action(1)
                        .with_too_early(0.25),
                ),
            ],
        );
        for terminal in [HIT, MISS] {
            hooks.insert(
                terminal,
                vec![
                    boxed(FeedbackHook::new("feedback", "{reward} (total {total})", 2.0)),
                    boxed(PassiveHook::new("iti", "+", 2.0)),
                ],
            );
        }

        Ok(TaskBundle {
            graph,
            rewards,
            conditions: conditions.clone(),
            hooks,
            keys: vec!["space".into()],
            staircase: Some(Staircase::new(TARGET_HOOK, INITIAL_TARGET)),
        })
    }

    fn get_configs(&self, stimulus_set: &str, seed: u64) -> TaskResult<TrialSchedule> {
        let mut builder = ScheduleBuilder::new(schedule_seed(seed, stimulus_set));
        for (tag, _, _) in STAKES {
            builder = builder.quota(tag, 10);
        }
        let condition = builder.sequence()?;
        let isi = builder.jittered(condition.len(), &[(2.0, 2.5), (1.5, 4.0)]);
        Ok(TrialSchedule::new(NAME, condition)
            .with_stimulus_set(stimulus_set)
            .with_updates(vec!["anticipation".into(), "iti".into()], isi)
            .with_remainder(true))
    }
}

pub fn register_task() -> TaskFragment {
    vec![Arc::new(Mid)]
}
