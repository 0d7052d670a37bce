// src/tasks/hcp_gambling.rs
//
// Card-guessing gambling task (Human Connectome Project protocol).
//
// The participant guesses whether a hidden card is above or below 5. The
// outcome is fixed by the trial's condition, not by the guess: `reward`,
// `loss` or `neutral`. Trials come in blocks of eight that are mostly reward
// or mostly loss, with a paced break after each block.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::condition::{ConditionTable, ConditionTag};
use crate::engine::HookTable;
use crate::error::TaskResult;
use crate::graph::{TaskGraph, Transition};
use crate::hooks::{ActionHook, FeedbackHook, PassiveHook};
use crate::reward::{ConditionalReward, RewardSource, RewardTable};
use crate::schedule::{breakpoints_every, ScheduleBuilder, TrialSchedule};
use crate::window::WindowSize;

use super::{boxed, schedule_seed, TaskBundle, TaskDefinition, TaskFragment};

pub const NAME: &str = "hcp_gambling";
pub const BLOCK_LEN: usize = 8;
pub const BREAK_DURATION: f64 = 15.0;

/// Outcome per condition.
pub const OUTCOMES: [(&str, f64); 3] = [("reward", 1.0), ("loss", -0.5), ("neutral", 0.0)];

#[derive(Debug, Clone, Default)]
pub struct HcpGambling;

fn outcome_emitter() -> Box<dyn RewardSource> {
    Box::new(ConditionalReward::from_pairs(OUTCOMES))
}

/// Block order per stimulus set (`true` = mostly reward).
fn block_order(stimulus_set: &str) -> [bool; 4] {
    match stimulus_set {
        "2" => [false, true, true, false],
        _ => [true, false, false, true],
    }
}

impl TaskDefinition for HcpGambling {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "guess higher/lower; outcome set by block condition"
    }

    fn get_task(
        &self,
        conditions: &ConditionTable,
        _window: WindowSize,
        _seed: u64,
    ) -> TaskResult<TaskBundle> {
        let graph = TaskGraph::from_pairs([
            (0, Transition::Deterministic(vec![1, 2])),
            (1, Transition::Terminal),
            (2, Transition::Terminal),
        ])?;

        let mut rewards = RewardTable::new();
        rewards.insert(1, outcome_emitter());
        rewards.insert(2, outcome_emitter());

        let mut hooks = HookTable::new();
        hooks.insert(
            0,
            vec![boxed(
                ActionHook::new("guess", 1.5).with_text("?  (left: lower, right: higher)"),
            )],
        );
        for terminal in [1, 2] {
            hooks.insert(
                terminal,
                vec![
                    boxed(FeedbackHook::new("feedback", "{reward}", 1.0)),
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
        let mut builder = ScheduleBuilder::new(schedule_seed(seed, stimulus_set));
        let mut rng = ChaCha8Rng::seed_from_u64(schedule_seed(seed ^ 0x5eed, stimulus_set));

        let mut condition: Vec<ConditionTag> = Vec::new();
        for mostly_reward in block_order(stimulus_set) {
            let (major, minor) = if mostly_reward {
                ("reward", "loss")
            } else {
                ("loss", "reward")
            };
            let mut block: Vec<ConditionTag> = std::iter::repeat(ConditionTag::from(major))
                .take(BLOCK_LEN - 2)
                .chain([ConditionTag::from(minor), ConditionTag::from("neutral")])
                .collect();
            block.shuffle(&mut rng);
            condition.extend(block);
        }

        let n = condition.len();
        let isi = builder.jittered(n, &[(0.5, 1.5)]);
        Ok(TrialSchedule::new(NAME, condition)
            .with_stimulus_set(stimulus_set)
            .with_updates(vec!["iti".into()], isi)
            .with_remainder(true)
            .with_breaks(breakpoints_every(n, BLOCK_LEN), BREAK_DURATION))
    }
}

pub fn register_task() -> TaskFragment {
    vec![Arc::new(HcpGambling)]
}

/// Expected outcome per condition tag.
pub fn outcome_table() -> BTreeMap<ConditionTag, f64> {
    OUTCOMES
        .iter()
        .map(|(t, v)| (ConditionTag::from(*t), *v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_mostly_one_outcome() {
        let s = HcpGambling.get_configs("1", 0).unwrap();
        assert_eq!(s.ntrials, 32);
        assert_eq!(s.breakpoints, vec![7, 15, 23]);
        let first: Vec<&str> = s.condition[..8].iter().map(|t| t.as_str()).collect();
        assert_eq!(first.iter().filter(|t| **t == "reward").count(), 6);
        assert!(s.add_remainder);
    }

    #[test]
    fn outcome_does_not_depend_on_guess() {
        let bundle = HcpGambling
            .get_task(&ConditionTable::default(), WindowSize::default(), 0)
            .unwrap();
        let mut rewards = bundle.rewards;
        let tag = ConditionTag::from("loss");
        let a = rewards.get_mut(&1).unwrap().emit(&tag).unwrap();
        let b = rewards.get_mut(&2).unwrap().emit(&tag).unwrap();
        assert_eq!(a, b);
        assert_eq!(outcome_table()[&tag], a);
    }
}
