// src/tasks/posner.rs
//
// Posner spatial cueing.
//
// State 0 is a skip node: the engine picks the cue side (1: left, 2: right)
// without waiting for a response. The participant then reports the target
// side. Whether the target appears at the cued side is the trial's condition
// (`valid` / `invalid`), so correctness, and the reward, is decided at the
// terminal from the condition.

use std::sync::Arc;

use crate::condition::ConditionTable;
use crate::engine::HookTable;
use crate::error::TaskResult;
use crate::graph::{TaskGraph, Transition};
use crate::hooks::{ActionHook, FeedbackHook, PassiveHook};
use crate::reward::{ConditionalReward, RewardTable};
use crate::schedule::{quota_counts, ScheduleBuilder, TrialSchedule};
use crate::window::WindowSize;

use super::{boxed, schedule_seed, TaskBundle, TaskDefinition, TaskFragment};

pub const NAME: &str = "posner";
pub const CUE_VALIDITY: f64 = 0.8;
pub const NTRIALS: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct Posner;

impl TaskDefinition for Posner {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "report the target side after a valid or invalid spatial cue"
    }

    fn get_task(
        &self,
        conditions: &ConditionTable,
        _window: WindowSize,
        _seed: u64,
    ) -> TaskResult<TaskBundle> {
        // 3: cue left/press left, 4: cue left/press right,
        // 5: cue right/press left, 6: cue right/press right
        let graph = TaskGraph::from_pairs([
            (0, Transition::skip([(0, 1), (1, 2)])),
            (1, Transition::Deterministic(vec![3, 4])),
            (2, Transition::Deterministic(vec![5, 6])),
            (3, Transition::Terminal),
            (4, Transition::Terminal),
            (5, Transition::Terminal),
            (6, Transition::Terminal),
        ])?;

        let mut rewards = RewardTable::new();
        for (terminal, pressed_cued_side) in [(3, true), (4, false), (5, false), (6, true)] {
            let (valid, invalid) = if pressed_cued_side { (1.0, 0.0) } else { (0.0, 1.0) };
            rewards.insert(
                terminal,
                Box::new(ConditionalReward::from_pairs([("valid", valid), ("invalid", invalid)]))
                    as _,
            );
        }

        let mut hooks = HookTable::new();
        hooks.insert(0, vec![boxed(PassiveHook::new("fixation", "+", 1.0))]);
        for (state, arrow) in [(1, "<"), (2, ">")] {
            hooks.insert(
                state,
                vec![
                    boxed(PassiveHook::new("cue", arrow, 0.2)),
                    boxed(PassiveHook::new("delay", "+", 0.3)),
                    boxed(ActionHook::new("target", 1.0).with_text("target")),
                ],
            );
        }
        for terminal in 3..=6 {
            hooks.insert(
                terminal,
                vec![
                    boxed(FeedbackHook::new("feedback", "{reward}", 0.5)),
                    boxed(PassiveHook::new("iti", "+", 1.0)),
                ],
            );
        }

        Ok(TaskBundle {
            graph,
            rewards,
            conditions: conditions.clone(),
            hooks,
            keys: vec!["left".into(), "right".into()],
            staircase: None,
        })
    }

    fn get_configs(&self, stimulus_set: &str, seed: u64) -> TaskResult<TrialSchedule> {
        let counts = quota_counts(NTRIALS, &[CUE_VALIDITY, 1.0 - CUE_VALIDITY]);
        let mut builder = ScheduleBuilder::new(schedule_seed(seed, stimulus_set))
            .quota("valid", counts[0])
            .quota("invalid", counts[1])
            .forbid_consecutive("invalid");
        let condition = builder.sequence()?;
        let isi = builder.jittered(condition.len(), &[(0.1, 0.5), (0.8, 1.6)]);
        Ok(TrialSchedule::new(NAME, condition)
            .with_stimulus_set(stimulus_set)
            .with_updates(vec!["delay".into(), "iti".into()], isi))
    }
}

pub fn register_task() -> TaskFragment {
    vec![Arc::new(Posner)]
}
