// src/tasks/risk_sensitive.rs
//
// Risk-sensitive choice among five gambles.
//
// State 0 routes gamble `g` (keyed 0..5) to terminal `g + 1`. Each trial shows
// two of the gambles; the condition `"i-j"` remaps the left key to gamble `i`
// and the right key to gamble `j`. Every ordered pair appears twice, so both
// sides are counterbalanced.

use std::sync::Arc;

use crate::condition::{ActionRemap, ConditionTable, ConditionTag};
use crate::engine::HookTable;
use crate::error::TaskResult;
use crate::graph::{StateId, TaskGraph, Transition};
use crate::hooks::{ActionHook, FeedbackHook, PassiveHook};
use crate::reward::{CategoricalReward, RewardTable};
use crate::schedule::{ScheduleBuilder, TrialSchedule};
use crate::window::WindowSize;

use super::{boxed, schedule_seed, TaskBundle, TaskDefinition, TaskFragment};

pub const NAME: &str = "risk_sensitive";
pub const N_GAMBLES: usize = 5;
pub const REPEATS: usize = 2;

/// (outcomes, probabilities) per gamble: sure things and 50/50 risks.
fn gamble(g: usize) -> (Vec<f64>, Vec<f64>) {
    match g {
        0 => (vec![0.0], vec![1.0]),
        1 => (vec![2.0], vec![1.0]),
        2 => (vec![0.0, 4.0], vec![0.5, 0.5]),
        3 => (vec![4.0], vec![1.0]),
        _ => (vec![0.0, 8.0], vec![0.5, 0.5]),
    }
}

pub fn terminal_of(g: usize) -> StateId {
    g + 1
}

pub fn pair_tag(left: usize, right: usize) -> ConditionTag {
    ConditionTag::new(format!("{left}-{right}"))
}

/// Every ordered pair of distinct gambles.
pub fn pairs() -> Vec<(usize, usize)> {
    (0..N_GAMBLES)
        .flat_map(|i| (0..N_GAMBLES).map(move |j| (i, j)))
        .filter(|(i, j)| i != j)
        .collect()
}

pub fn pair_conditions() -> ConditionTable {
    pairs().into_iter().fold(ConditionTable::new(), |table, (i, j)| {
        table
            .with_start(pair_tag(i, j), 0)
            .with_remap(pair_tag(i, j), 0, ActionRemap::from([(0, i), (1, j)]))
    })
}

#[derive(Debug, Clone, Default)]
pub struct RiskSensitive;

impl TaskDefinition for RiskSensitive {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "pairwise choice between sure and risky gambles"
    }

    fn get_task(
        &self,
        conditions: &ConditionTable,
        _window: WindowSize,
        seed: u64,
    ) -> TaskResult<TaskBundle> {
        let mut states = vec![(0, Transition::keyed((0..N_GAMBLES).map(|g| (g, terminal_of(g)))))];
        states.extend((0..N_GAMBLES).map(|g| (terminal_of(g), Transition::Terminal)));
        let graph = TaskGraph::from_pairs(states)?;

        let mut rewards = RewardTable::new();
        for g in 0..N_GAMBLES {
            let (outcomes, probs) = gamble(g);
            let emitter = CategoricalReward::new(outcomes, probs, seed.wrapping_add(g as u64))?;
            rewards.insert(terminal_of(g), Box::new(emitter) as _);
        }

        let mut hooks = HookTable::new();
        hooks.insert(
            0,
            vec![
                boxed(PassiveHook::new("fixation", "+", 0.5)),
                boxed(ActionHook::new("choice", 2.0).with_text("left / right")),
            ],
        );
        for g in 0..N_GAMBLES {
            hooks.insert(
                terminal_of(g),
                vec![
                    boxed(FeedbackHook::new("outcome", "{reward}", 1.0)),
                    boxed(PassiveHook::new("iti", "+", 1.0)),
                ],
            );
        }

        let mut table = pair_conditions();
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
        let mut builder = ScheduleBuilder::new(schedule_seed(seed, stimulus_set));
        for (i, j) in pairs() {
            builder = builder.quota(pair_tag(i, j), REPEATS);
        }
        let condition = builder.sequence()?;
        let isi = builder.jittered(condition.len(), &[(0.5, 1.5)]);
        let n = condition.len();
        Ok(TrialSchedule::new(NAME, condition)
            .with_stimulus_set(stimulus_set)
            .with_condition_dict(pair_conditions())
            .with_updates(vec!["iti".into()], isi)
            .with_breaks(vec![n / 2 - 1], 20.0))
    }
}

pub fn register_task() -> TaskFragment {
    vec![Arc::new(RiskSensitive)]
}
