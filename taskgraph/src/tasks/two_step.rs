// src/tasks/two_step.rs
//
// Two-step task.
//
// Stage 1 (state 0) leads to one of two stage-2 states; the chosen option's
// "common" destination is reached with probability 0.7. Each stage-2 state
// offers two options ending in terminals whose payoff probabilities drift.
//
// The schedule pins every trial's stage-1 transition through a condition:
// `expected` (common) or `unexpected` (rare), 70/30, never two unexpected
// trials in a row. The graph's probabilistic descriptor is used when a trial
// carries neither tag.

use std::sync::Arc;

use crate::condition::{ConditionTable, ConditionTag};
use crate::engine::HookTable;
use crate::error::TaskResult;
use crate::graph::{TaskGraph, Transition};
use crate::hooks::{CompositeHook, FeedbackHook, PassiveHook};
use crate::reward::{DriftingReward, RewardTable};
use crate::schedule::{quota_counts, ScheduleBuilder, TrialSchedule};
use crate::window::WindowSize;

use super::{boxed, schedule_seed, TaskBundle, TaskDefinition, TaskFragment};

pub const NAME: &str = "two_step";
pub const COMMON_P: f64 = 0.7;
pub const NTRIALS: usize = 100;
pub const EXPECTED: &str = "expected";
pub const UNEXPECTED: &str = "unexpected";

#[derive(Debug, Clone, Default)]
pub struct TwoStep;

/// Condition table that pins the stage-1 transition.
pub fn transition_conditions() -> ConditionTable {
    ConditionTable::new()
        .with_transition(EXPECTED, 0, Transition::Deterministic(vec![1, 2]))
        .with_transition(UNEXPECTED, 0, Transition::Deterministic(vec![2, 1]))
}

impl TaskDefinition for TwoStep {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "two-stage choice, common/rare transitions, drifting payoffs"
    }

    fn get_task(
        &self,
        conditions: &ConditionTable,
        _window: WindowSize,
        seed: u64,
    ) -> TaskResult<TaskBundle> {
        let graph = TaskGraph::from_pairs([
            (0, Transition::probabilistic(vec![1, 2], COMMON_P)),
            (1, Transition::Deterministic(vec![3, 4])),
            (2, Transition::Deterministic(vec![5, 6])),
            (3, Transition::Terminal),
            (4, Transition::Terminal),
            (5, Transition::Terminal),
            (6, Transition::Terminal),
        ])?;

        let mut rewards = RewardTable::new();
        for (i, terminal) in (3..=6).enumerate() {
            let initial = [0.3, 0.45, 0.55, 0.7][i];
            let emitter = DriftingReward::bernoulli(initial, 1.0, seed.wrapping_add(terminal as u64))?;
            rewards.insert(terminal, Box::new(emitter) as _);
        }

        let mut hooks = HookTable::new();
        hooks.insert(
            0,
            vec![boxed(
                CompositeHook::new("stage1", vec!["A".into(), "B".into()], 2.0, seed)
                    .with_prepare("+", 0.5)
                    .with_feedback(vec!["A".into(), "B".into()], 0.5)
                    .with_flip(true),
            )],
        );
        for (state, options) in [(1, ["C", "D"]), (2, ["E", "F"])] {
            hooks.insert(
                state,
                vec![boxed(
                    CompositeHook::new(
                        "stage2",
                        options.iter().map(|s| s.to_string()).collect(),
                        2.0,
                        seed.wrapping_add(state as u64),
                    )
                    .with_prepare("", 0.0)
                    .with_flip(true),
                )],
            );
        }
        for terminal in 3..=6 {
            hooks.insert(
                terminal,
                vec![
                    boxed(FeedbackHook::new("outcome", "{reward}", 1.0)),
                    boxed(PassiveHook::new("iti", "+", 1.0)),
                ],
            );
        }

        let mut table = transition_conditions();
        table.merge(conditions.clone());
        Ok(TaskBundle {
            graph,
            rewards,
            conditions: table,
            hooks,
            keys: vec!["left".into(), "right".into()],
            staircase: None,
        })
    }

    fn get_configs(&self, stimulus_set: &str, seed: u64) -> TaskResult<TrialSchedule> {
        let counts = quota_counts(NTRIALS, &[COMMON_P, 1.0 - COMMON_P]);
        let mut builder = ScheduleBuilder::new(schedule_seed(seed, stimulus_set))
            .quota(EXPECTED, counts[0])
            .quota(UNEXPECTED, counts[1])
            .forbid_consecutive(UNEXPECTED);
        let condition: Vec<ConditionTag> = builder.sequence()?;
        let isi = builder.jittered(condition.len(), &[(0.5, 1.5)]);
        Ok(TrialSchedule::new(NAME, condition)
            .with_stimulus_set(stimulus_set)
            .with_condition_dict(transition_conditions())
            .with_updates(vec!["iti".into()], isi)
            .with_breaks(vec![NTRIALS / 2 - 1], 30.0))
    }
}

pub fn register_task() -> TaskFragment {
    vec![Arc::new(TwoStep)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_seventy_thirty() {
        let s = TwoStep.get_configs("1", 5).unwrap();
        let rare = s.condition.iter().filter(|t| t.as_str() == UNEXPECTED).count();
        assert_eq!(rare, 30);
        assert_eq!(s.ntrials, NTRIALS);
        assert!(s
            .condition
            .windows(2)
            .all(|w| !(w[0].as_str() == UNEXPECTED && w[1].as_str() == UNEXPECTED)));
    }
}
