// src/tasks/go_nogo.rs
//
// Go/No-Go with probabilistic feedback.
//
// The condition picks the cue: `go` starts at state 0, `nogo` at state 1.
// Action 0 is a press, action 1 is withholding; an empty response window
// delivers action 1. Correct responses are rewarded 80% of the time,
// incorrect ones 20%.

use std::sync::Arc;

use crate::condition::ConditionTable;
use crate::engine::HookTable;
use crate::error::TaskResult;
use crate::graph::{TaskGraph, Transition};
use crate::hooks::{ActionHook, FeedbackHook, PassiveHook};
use crate::reward::{CategoricalReward, RewardTable};
use crate::schedule::{ScheduleBuilder, TrialSchedule};
use crate::window::WindowSize;

use super::{boxed, schedule_seed, TaskBundle, TaskDefinition, TaskFragment};

pub const NAME: &str = "go_nogo";
pub const GO_START: usize = 0;
pub const NOGO_START: usize = 1;
/// Action delivered when the response window closes without a press.
pub const WITHHOLD: usize = 1;
pub const RESPONSE_WINDOW: f64 = 0.5;
pub const FEEDBACK_VALIDITY: f64 = 0.8;

#[derive(Debug, Clone, Default)]
pub struct GoNoGo;

pub fn start_conditions() -> ConditionTable {
    ConditionTable::new()
        .with_start("go", GO_START)
        .with_start("nogo", NOGO_START)
}

impl TaskDefinition for GoNoGo {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "press to go cues, withhold to no-go cues, 80/20 feedback"
    }

    fn get_task(
        &self,
        conditions: &ConditionTable,
        _window: WindowSize,
        seed: u64,
    ) -> TaskResult<TaskBundle> {
        // 2: hit, 3: miss, 4: false alarm, 5: correct rejection
        let graph = TaskGraph::from_pairs([
            (GO_START, Transition::Deterministic(vec![2, 3])),
            (NOGO_START, Transition::Deterministic(vec![4, 5])),
            (2, Transition::Terminal),
            (3, Transition::Terminal),
            (4, Transition::Terminal),
            (5, Transition::Terminal),
        ])?;

        let p = FEEDBACK_VALIDITY;
        let mut rewards = RewardTable::new();
        for (terminal, correct) in [(2, true), (3, false), (4, false), (5, true)] {
            let probs = if correct { vec![p, 1.0 - p] } else { vec![1.0 - p, p] };
            let emitter = CategoricalReward::new(
                vec![1.0, 0.0],
                probs,
                seed.wrapping_mul(31).wrapping_add(terminal as u64),
            )?;
            rewards.insert(terminal, Box::new(emitter) as _);
        }

        let mut hooks = HookTable::new();
        for (state, cue) in [(GO_START, "GO"), (NOGO_START, "NO-GO")] {
            hooks.insert(
                state,
                vec![
                    boxed(PassiveHook::new("cue", cue, 1.0)),
                    boxed(
                        ActionHook::new("response", RESPONSE_WINDOW)
                            .with_keys(["space"])
                            .with_timeout_action(WITHHOLD),
                    ),
                ],
            );
        }
        for terminal in 2..=5 {
            hooks.insert(
                terminal,
                vec![
                    boxed(FeedbackHook::new("feedback", "{reward}", 1.0)),
                    boxed(PassiveHook::new("iti", "+", 1.0)),
                ],
            );
        }

        let mut table = start_conditions();
        table.merge(conditions.clone());
        Ok(TaskBundle {
            graph,
            rewards,
            conditions: table,
            hooks,
            keys: vec!["space".into()],
            staircase: None,
        })
    }

    fn get_configs(&self, stimulus_set: &str, seed: u64) -> TaskResult<TrialSchedule> {
        let mut builder = ScheduleBuilder::new(schedule_seed(seed, stimulus_set))
            .quota("go", 30)
            .quota("nogo", 20)
            .forbid_consecutive("nogo");
        let condition = builder.sequence()?;
        let isi = builder.jittered(condition.len(), &[(0.75, 1.5)]);
        Ok(TrialSchedule::new(NAME, condition)
            .with_stimulus_set(stimulus_set)
            .with_condition_dict(start_conditions())
            .with_updates(vec!["iti".into()], isi))
    }
}

pub fn register_task() -> TaskFragment {
    vec![Arc::new(GoNoGo)]
}
