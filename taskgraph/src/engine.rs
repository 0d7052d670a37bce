// src/engine.rs
//
// Task environment: a reset/step state machine over a `TaskGraph`.
//
// - reset(start, condition): apply the condition's start override, resolve
//   skip nodes, play the start state's render hooks.
// - step(action): reject illegal actions as a silent no-op, apply the
//   condition's action remap and transition override, route, resolve skip
//   nodes, emit the terminal reward, play the new state's render hooks.
//
// Every state entry writes an `obs` row, every legal step a `reward` row, and
// interactive hooks write `action` rows, so the log alone is enough to rebuild
// (s, a, r, s') tuples.
//
// Hooks are played through a `Driver`: a window for a human, a `Responder`
// for an agent, or nothing at all.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::condition::{ActionRemap, ConditionTable, ConditionTag};
use crate::error::{TaskError, TaskResult};
use crate::event_log::{EventFields, EventLogger, RlLabel};
use crate::graph::{StateId, TaskGraph, Transition};
use crate::hooks::{HookContext, HookOutcome, RenderHook, SimResponse};
use crate::reward::RewardTable;
use crate::window::Window;

/// Render hooks bound to each state, in play order.
pub type HookTable = BTreeMap<StateId, Vec<Box<dyn RenderHook>>>;

/// Supplies simulated responses when an agent drives the task.
pub trait Responder {
    /// Pick an action and reaction time for `obs`, or `None` to withhold.
    fn respond(&mut self, obs: StateId, avail_actions: &[usize]) -> Option<SimResponse>;
}

/// How render hooks are played.
pub enum Driver<'a> {
    /// Real time, human at a window.
    Display(&'a mut dyn Window),
    /// Virtual time, agent responses.
    Simulate(&'a mut dyn Responder),
    /// Hooks are skipped; the caller supplies every action.
    Silent,
}

/// Info payload returned by `reset` and `step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub obs: StateId,
    /// Names of the hooks attached to `obs`.
    pub render_hooks: Vec<String>,
    pub avail_actions: Vec<usize>,
    /// Whether a skip node was passed on the way to `obs`.
    pub skip_node: bool,
    pub behav_remap: Option<ActionRemap>,
    /// Action produced by the hooks of `obs`, if any.
    pub action: Option<usize>,
    pub timed_out: bool,
}

/// Result of one `step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub obs: StateId,
    pub reward: f64,
    pub terminated: bool,
    /// Always false here; truncation is the runner's business.
    pub truncated: bool,
    pub info: StepInfo,
}

/// Per-trial scratch plus the run's cumulative reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeState {
    pub state: StateId,
    pub condition: ConditionTag,
    pub total_reward: f64,
    pub last_action: Option<usize>,
    /// Last action after the condition's remap.
    pub last_remapped: Option<usize>,
    pub last_reward: f64,
    /// Unused response-window time accumulated this trial.
    pub remainder: f64,
    pub timed_out: bool,
}

impl Default for EpisodeState {
    fn default() -> Self {
        Self {
            state: 0,
            condition: ConditionTag::new(""),
            total_reward: 0.0,
            last_action: None,
            last_remapped: None,
            last_reward: 0.0,
            remainder: 0.0,
            timed_out: false,
        }
    }
}

#[derive(Debug)]
pub struct TaskEnv {
    graph: TaskGraph,
    rewards: RewardTable,
    conditions: ConditionTable,
    hooks: HookTable,
    rng: ChaCha8Rng,
    episode: EpisodeState,
}

impl TaskEnv {
    /// Assemble an environment, validating the graph together with every
    /// transition override, and requiring an emitter on every terminal.
    pub fn new(
        graph: TaskGraph,
        rewards: RewardTable,
        conditions: ConditionTable,
        hooks: HookTable,
        seed: u64,
    ) -> TaskResult<Self> {
        let overrides = conditions
            .transition_overrides
            .values()
            .flat_map(|per_state| per_state.iter().map(|(s, t)| (*s, t)));
        graph.validate(overrides)?;

        for terminal in graph.terminals() {
            if !rewards.contains_key(&terminal) {
                return Err(TaskError::MissingRewardEmitter { state: terminal });
            }
        }
        for state in conditions.referenced_states() {
            if !graph.contains(state) {
                return Err(TaskError::graph(format!(
                    "condition table refers to unknown state {state}"
                )));
            }
        }
        for (tag, per_state) in &conditions.action_remaps {
            for (state, remap) in per_state {
                let legal = graph.legal_actions(*state);
                if let Some(bad) = remap.values().find(|a| !legal.contains(a)) {
                    return Err(TaskError::graph(format!(
                        "condition '{tag}' remaps state {state} onto action {bad}, legal are {legal:?}"
                    )));
                }
            }
        }
        if let Some(state) = hooks.keys().find(|s| !graph.contains(**s)) {
            return Err(TaskError::graph(format!(
                "render hooks bound to unknown state {state}"
            )));
        }

        Ok(Self {
            graph,
            rewards,
            conditions,
            hooks,
            rng: ChaCha8Rng::seed_from_u64(seed),
            episode: EpisodeState::default(),
        })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn conditions(&self) -> &ConditionTable {
        &self.conditions
    }

    pub fn episode(&self) -> &EpisodeState {
        &self.episode
    }

    pub fn state(&self) -> StateId {
        self.episode.state
    }

    pub fn total_reward(&self) -> f64 {
        self.episode.total_reward
    }

    /// Unused response time accumulated this trial.
    pub fn remainder(&self) -> f64 {
        self.episode.remainder
    }

    pub fn n_actions(&self) -> usize {
        self.graph.n_actions()
    }

    /// Current parameters of drifting emitters, by terminal.
    pub fn drift_parameters(&self) -> BTreeMap<StateId, f64> {
        self.rewards
            .iter()
            .filter_map(|(s, r)| r.drift_parameter().map(|p| (*s, p)))
            .collect()
    }

    /// Call `setup` on every hook of every state. `keys[i]` is the physical
    /// key for action `i`.
    pub fn setup_hooks(&mut self, mut window: Option<&mut dyn Window>, keys: &[String]) {
        for hooks in self.hooks.values_mut() {
            for hook in hooks.iter_mut() {
                hook.setup(window.as_mut().map(|w| &mut **w as &mut dyn Window), keys);
            }
        }
    }

    /// Override the duration of every hook called `name`. Returns how many
    /// hooks matched.
    pub fn set_hook_duration(&mut self, name: &str, seconds: f64) -> usize {
        let mut n = 0;
        for hook in self.hooks.values_mut().flatten() {
            if hook.name() == name {
                hook.set_duration(seconds);
                n += 1;
            }
        }
        n
    }

    pub fn hook_duration(&self, name: &str) -> Option<f64> {
        self.hooks
            .values()
            .flatten()
            .find(|h| h.name() == name)
            .map(|h| h.duration())
    }

    /// Legal physical actions in `state` under the current condition.
    ///
    /// With a remap the legal set is the remap's keys.
    pub fn avail_actions(&self, state: StateId) -> Vec<usize> {
        match self.conditions.remap_for(&self.episode.condition, state) {
            Some(remap) => remap.keys().copied().collect(),
            None => self.graph.legal_actions(state),
        }
    }

    fn transition(&self, state: StateId) -> Option<&Transition> {
        self.conditions
            .transition_for(&self.episode.condition, state)
            .or_else(|| self.graph.get(state))
    }

    pub fn reset(
        &mut self,
        start: StateId,
        condition: &ConditionTag,
        logger: &mut EventLogger,
        driver: &mut Driver<'_>,
    ) -> TaskResult<(StateId, StepInfo)> {
        let start = self.conditions.start_for(condition).unwrap_or(start);
        if !self.graph.contains(start) {
            return Err(TaskError::graph(format!("unknown starting state {start}")));
        }
        self.episode = EpisodeState {
            state: start,
            condition: condition.clone(),
            total_reward: self.episode.total_reward,
            ..EpisodeState::default()
        };
        logger.trial_info_mut().start_position = Some(start);
        debug!(start, condition = %condition, "reset");

        let skipped = self.resolve_skips(logger, driver)?;
        let info = self.enter(logger, driver, skipped)?;
        Ok((self.episode.state, info))
    }

    pub fn step(
        &mut self,
        action: usize,
        logger: &mut EventLogger,
        driver: &mut Driver<'_>,
    ) -> TaskResult<StepResult> {
        let state = self.episode.state;
        if self.graph.is_terminal(state) {
            return Ok(StepResult {
                obs: state,
                reward: 0.0,
                terminated: true,
                truncated: false,
                info: self.info(false, None),
            });
        }

        let avail = self.avail_actions(state);
        let remapped = self
            .conditions
            .remap_for(&self.episode.condition, state)
            .and_then(|m| m.get(&action).copied())
            .unwrap_or(action);
        let transition = self.transition(state).cloned();
        let next = match transition {
            Some(t) if avail.contains(&action) => t.route(remapped, &mut self.rng),
            _ => None,
        };
        let Some(next) = next else {
            debug!(state, action, ?avail, "illegal action ignored");
            return Ok(StepResult {
                obs: state,
                reward: 0.0,
                terminated: false,
                truncated: false,
                info: self.info(false, None),
            });
        };

        self.episode.last_action = Some(action);
        self.episode.last_remapped = Some(remapped);
        self.episode.state = next;
        debug!(from = state, to = next, action, remapped, "step");

        let skipped = self.resolve_skips(logger, driver)?;
        let landed = self.episode.state;
        let terminated = self.graph.is_terminal(landed);
        let reward = if terminated {
            let emitter = self
                .rewards
                .get_mut(&landed)
                .ok_or(TaskError::MissingRewardEmitter { state: landed })?;
            emitter.emit(&self.episode.condition)?
        } else {
            0.0
        };
        self.episode.last_reward = reward;
        self.episode.total_reward += reward;
        logger.log_event(
            EventFields::new("reward")
                .reward(reward)
                .label(RlLabel::Reward)
                .location(landed),
            Some(self.episode.total_reward),
            None,
        )?;

        let info = self.enter(logger, driver, skipped)?;
        Ok(StepResult {
            obs: landed,
            reward,
            terminated,
            truncated: false,
            info,
        })
    }

    /// Pass through skip nodes, picking a uniformly random key at each.
    fn resolve_skips(
        &mut self,
        logger: &mut EventLogger,
        driver: &mut Driver<'_>,
    ) -> TaskResult<bool> {
        let mut skipped = false;
        while self.graph.is_skip(self.episode.state) {
            skipped = true;
            let state = self.episode.state;
            logger.log_event(
                EventFields::new("skip-node").location(state),
                None,
                None,
            )?;
            self.play_hooks(state, logger, driver)?;

            let Some(transition) = self.transition(state).cloned() else {
                return Err(TaskError::graph(format!("skip node {state} vanished")));
            };
            let keys = transition.legal_actions();
            if keys.is_empty() {
                return Err(TaskError::graph(format!("skip node {state} has no keys")));
            }
            let pick = keys[self.rng.gen_range(0..keys.len())];
            let next = transition
                .route(pick, &mut self.rng)
                .ok_or_else(|| TaskError::graph(format!("skip node {state} cannot route {pick}")))?;
            debug!(from = state, to = next, pick, "skip");
            self.episode.state = next;
        }
        Ok(skipped)
    }

    /// Log the `obs` row for the current state and play its hooks.
    fn enter(
        &mut self,
        logger: &mut EventLogger,
        driver: &mut Driver<'_>,
        skipped: bool,
    ) -> TaskResult<StepInfo> {
        let state = self.episode.state;
        logger.trial_info_mut().current_location = Some(state);
        logger.log_event(
            EventFields::new("state")
                .label(RlLabel::Obs)
                .location(state)
                .misc(format!("condition={}", self.episode.condition)),
            None,
            None,
        )?;

        let outcome = self.play_hooks(state, logger, driver)?;
        if let Some(o) = outcome {
            self.episode.remainder += o.remainder;
            self.episode.timed_out |= o.timed_out;
        }
        Ok(self.info(skipped, outcome))
    }

    fn play_hooks(
        &mut self,
        state: StateId,
        logger: &mut EventLogger,
        driver: &mut Driver<'_>,
    ) -> TaskResult<Option<HookOutcome>> {
        let avail = self.avail_actions(state);
        let remap = self
            .conditions
            .remap_for(&self.episode.condition, state)
            .cloned();
        let Some(hooks) = self.hooks.get_mut(&state) else {
            return Ok(None);
        };
        let ctx = HookContext {
            state,
            condition: &self.episode.condition,
            reward: self.episode.last_reward,
            total_reward: self.episode.total_reward,
            last_action: self.episode.last_action,
            avail_actions: &avail,
            remap: remap.as_ref(),
        };

        let response = match driver {
            Driver::Simulate(responder)
                if !avail.is_empty() && hooks.iter().any(|h| h.is_interactive()) =>
            {
                responder.respond(state, &avail)
            }
            _ => None,
        };

        let mut outcome = None;
        for hook in hooks.iter_mut() {
            let out = match driver {
                Driver::Display(window) => hook.display(&mut **window, logger, &ctx)?,
                Driver::Simulate(_) => hook.simulate(logger, response, &ctx)?,
                Driver::Silent => None,
            };
            if out.is_some() {
                outcome = out;
            }
        }
        Ok(outcome)
    }

    fn info(&self, skip_node: bool, outcome: Option<HookOutcome>) -> StepInfo {
        let state = self.episode.state;
        StepInfo {
            obs: state,
            render_hooks: self
                .hooks
                .get(&state)
                .map(|hs| hs.iter().map(|h| h.name().to_string()).collect())
                .unwrap_or_default(),
            avail_actions: self.avail_actions(state),
            skip_node,
            behav_remap: self
                .conditions
                .remap_for(&self.episode.condition, state)
                .cloned(),
            action: outcome.map(|o| o.action),
            timed_out: outcome.map_or(false, |o| o.timed_out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::ReservedKeys;
    use crate::hooks::{ActionHook, PassiveHook};
    use crate::reward::{CategoricalReward, ConditionalReward, RewardSource};
    use crate::window::ScriptedWindow;

    fn boxed(r: impl RewardSource + 'static) -> Box<dyn RewardSource> {
        Box::new(r)
    }

    fn hcp_env() -> TaskEnv {
        let graph = TaskGraph::from_pairs([
            (0, Transition::Deterministic(vec![1, 2])),
            (1, Transition::Terminal),
            (2, Transition::Terminal),
        ])
        .unwrap();
        let mut rewards = RewardTable::new();
        rewards.insert(1, boxed(CategoricalReward::constant(5.0)));
        rewards.insert(2, boxed(CategoricalReward::constant(-2.5)));
        TaskEnv::new(graph, rewards, ConditionTable::new(), HookTable::new(), 7).unwrap()
    }

    #[test]
    fn hcp_single_trial() {
        let mut env = hcp_env();
        let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
        let tag = ConditionTag::from(1);
        let (obs, info) = env.reset(0, &tag, &mut log, &mut Driver::Silent).unwrap();
        assert_eq!(obs, 0);
        assert_eq!(info.avail_actions, vec![0, 1]);

        let r = env.step(0, &mut log, &mut Driver::Silent).unwrap();
        assert_eq!(r.obs, 1);
        assert_eq!(r.reward, 5.0);
        assert!(r.terminated);
        assert!(!r.truncated);
        assert_eq!(env.total_reward(), 5.0);
    }

    #[test]
    fn setup_hands_task_keys_to_keyless_hooks() {
        let graph = TaskGraph::from_pairs([
            (0, Transition::Deterministic(vec![1, 2])),
            (1, Transition::Terminal),
            (2, Transition::Terminal),
        ])
        .unwrap();
        let mut rewards = RewardTable::new();
        rewards.insert(1, boxed(CategoricalReward::constant(1.0)));
        rewards.insert(2, boxed(CategoricalReward::constant(0.0)));
        let mut hooks = HookTable::new();
        hooks.insert(0, vec![Box::new(ActionHook::new("choice", 1.0)) as Box<dyn RenderHook>]);
        let mut env = TaskEnv::new(graph, rewards, ConditionTable::new(), hooks, 0).unwrap();

        let (mut log, clock) = EventLogger::simulated(ReservedKeys::default());
        let mut window = ScriptedWindow::new(clock, [(0.2, "k")]);
        env.setup_hooks(Some(&mut window as &mut dyn Window), &["j".to_string(), "k".to_string()]);

        let tag = ConditionTag::from(1);
        let (_, info) = env
            .reset(0, &tag, &mut log, &mut Driver::Display(&mut window))
            .unwrap();
        assert_eq!(info.action, Some(1));
    }

    #[test]
    fn illegal_action_is_a_silent_no_op() {
        let mut env = hcp_env();
        let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
        env.reset(0, &ConditionTag::from(1), &mut log, &mut Driver::Silent)
            .unwrap();
        let rows = log.records().len();
        let r = env.step(7, &mut log, &mut Driver::Silent).unwrap();
        assert_eq!(r.obs, 0);
        assert_eq!(r.reward, 0.0);
        assert!(!r.terminated);
        assert_eq!(log.records().len(), rows);
    }

    #[test]
    fn terminal_absorbs() {
        let mut env = hcp_env();
        let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
        env.reset(0, &ConditionTag::from(1), &mut log, &mut Driver::Silent)
            .unwrap();
        env.step(1, &mut log, &mut Driver::Silent).unwrap();
        let again = env.step(0, &mut log, &mut Driver::Silent).unwrap();
        assert!(again.terminated);
        assert_eq!(again.reward, 0.0);
        assert_eq!(env.total_reward(), -2.5);
    }

    #[test]
    fn missing_terminal_emitter_is_fatal() {
        let graph = TaskGraph::from_pairs([
            (0, Transition::Deterministic(vec![1, 2])),
            (1, Transition::Terminal),
            (2, Transition::Terminal),
        ])
        .unwrap();
        let mut rewards = RewardTable::new();
        rewards.insert(1, boxed(CategoricalReward::constant(1.0)));
        let err = TaskEnv::new(graph, rewards, ConditionTable::new(), HookTable::new(), 0)
            .unwrap_err();
        assert!(matches!(err, TaskError::MissingRewardEmitter { state: 2 }));
    }

    #[test]
    fn remap_routes_and_logs_behavioral_action() {
        let graph = TaskGraph::from_pairs([
            (0, Transition::keyed((0..5).map(|a| (a, a + 1)))),
            (1, Transition::Terminal),
            (2, Transition::Terminal),
            (3, Transition::Terminal),
            (4, Transition::Terminal),
            (5, Transition::Terminal),
        ])
        .unwrap();
        let mut rewards = RewardTable::new();
        for s in 1..=5 {
            rewards.insert(s, boxed(CategoricalReward::constant(s as f64)));
        }
        let conditions =
            ConditionTable::new().with_remap("2-4", 0, ActionRemap::from([(0, 2), (1, 4)]));
        let mut hooks = HookTable::new();
        hooks.insert(
            0,
            vec![Box::new(ActionHook::new("choice", 2.0).with_keys(["left", "right"]))
                as Box<dyn RenderHook>],
        );
        let mut env = TaskEnv::new(graph, rewards, conditions, hooks, 1).unwrap();

        struct Always0;
        impl Responder for Always0 {
            fn respond(&mut self, _obs: StateId, _avail: &[usize]) -> Option<SimResponse> {
                Some(SimResponse { action: 0, rt: 0.5 })
            }
        }
        let mut agent = Always0;
        let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
        let tag = ConditionTag::from("2-4");
        let (_, info) = env
            .reset(0, &tag, &mut log, &mut Driver::Simulate(&mut agent))
            .unwrap();
        assert_eq!(info.avail_actions, vec![0, 1]);
        assert_eq!(info.action, Some(0));

        let r = env
            .step(0, &mut log, &mut Driver::Simulate(&mut agent))
            .unwrap();
        assert_eq!(r.obs, 3);
        assert_eq!(r.reward, 3.0);
        let resp = log
            .records()
            .iter()
            .find(|r| r.event_type == "response")
            .unwrap();
        assert_eq!(resp.action, Some(2));
        assert_eq!(resp.response_button.as_deref(), Some("left"));
    }

    #[test]
    fn skip_nodes_resolve_transparently() {
        let graph = TaskGraph::from_pairs([
            (0, Transition::skip([(0, 1), (1, 2)])),
            (1, Transition::Deterministic(vec![3, 4])),
            (2, Transition::Deterministic(vec![3, 4])),
            (3, Transition::Terminal),
            (4, Transition::Terminal),
        ])
        .unwrap();
        let mut rewards = RewardTable::new();
        rewards.insert(3, boxed(ConditionalReward::from_pairs([("valid", 1.0)])));
        rewards.insert(4, boxed(CategoricalReward::constant(0.0)));
        let mut hooks = HookTable::new();
        hooks.insert(
            0,
            vec![Box::new(PassiveHook::new("fixation", "+", 0.5)) as Box<dyn RenderHook>],
        );
        let mut env = TaskEnv::new(graph, rewards, ConditionTable::new(), hooks, 3).unwrap();

        let mut seen = [false; 5];
        for _ in 0..32 {
            let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
            let (obs, info) = env
                .reset(0, &ConditionTag::from("valid"), &mut log, &mut Driver::Silent)
                .unwrap();
            assert!(obs == 1 || obs == 2);
            assert!(info.skip_node);
            seen[obs] = true;
        }
        assert!(seen[1] && seen[2]);
    }

    #[test]
    fn unknown_condition_surfaces_from_terminal() {
        let graph = TaskGraph::from_pairs([
            (0, Transition::Deterministic(vec![1])),
            (1, Transition::Terminal),
        ])
        .unwrap();
        let mut rewards = RewardTable::new();
        rewards.insert(1, boxed(ConditionalReward::from_pairs([("a", 1.0)])));
        let mut env =
            TaskEnv::new(graph, rewards, ConditionTable::new(), HookTable::new(), 0).unwrap();
        let (mut log, _clock) = EventLogger::simulated(ReservedKeys::default());
        env.reset(0, &ConditionTag::from("b"), &mut log, &mut Driver::Silent)
            .unwrap();
        let err = env.step(0, &mut log, &mut Driver::Silent).unwrap_err();
        assert!(err.is_trial_local());
    }
}
