// src/agent.rs
//
// Simulated participants.
//
// Learning rules live outside this crate; anything that implements `Agent`
// can drive a task. `AgentResponder` adapts an agent to the engine's
// `Responder` seam and fills in a reaction time when the agent does not
// supply one.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::engine::Responder;
use crate::graph::StateId;
use crate::hooks::SimResponse;

/// Fastest synthesized reaction time (s).
pub const RT_BASE: f64 = 0.2;
/// Extra latency at zero choice probability (s).
pub const RT_SPREAD: f64 = 0.6;

pub trait Agent {
    /// Choose one of `avail_actions`.
    fn get_action(&mut self, obs: StateId, avail_actions: &[usize]) -> usize;

    /// Choice probabilities, aligned with `avail_actions`.
    fn get_probs(&self, obs: StateId, avail_actions: &[usize]) -> Vec<f64>;

    fn update(
        &mut self,
        _obs: StateId,
        _action: usize,
        _reward: f64,
        _terminated: bool,
        _next_obs: StateId,
    ) {
    }

    /// Action plus reaction time, for agents that model latency themselves.
    fn get_rt_action(&mut self, _obs: StateId, _avail_actions: &[usize]) -> Option<(usize, f64)> {
        None
    }
}

/// Reaction time from the probability of the chosen action: confident
/// choices are fast.
pub fn synthesize_rt(p: f64) -> f64 {
    RT_BASE + RT_SPREAD * (1.0 - p.clamp(0.0, 1.0))
}

/// Drives the engine with an `Agent`.
pub struct AgentResponder<'a> {
    agent: &'a mut dyn Agent,
}

impl<'a> AgentResponder<'a> {
    pub fn new(agent: &'a mut dyn Agent) -> Self {
        Self { agent }
    }
}

impl Responder for AgentResponder<'_> {
    fn respond(&mut self, obs: StateId, avail_actions: &[usize]) -> Option<SimResponse> {
        if avail_actions.is_empty() {
            return None;
        }
        if let Some((action, rt)) = self.agent.get_rt_action(obs, avail_actions) {
            return Some(SimResponse { action, rt });
        }
        let action = self.agent.get_action(obs, avail_actions);
        let probs = self.agent.get_probs(obs, avail_actions);
        let p = avail_actions
            .iter()
            .position(|a| *a == action)
            .and_then(|i| probs.get(i).copied())
            .unwrap_or(0.0);
        Some(SimResponse {
            action,
            rt: synthesize_rt(p),
        })
    }
}

/// Uniform choice over the legal actions.
#[derive(Debug, Clone)]
pub struct RandomAgent {
    rng: ChaCha8Rng,
}

impl RandomAgent {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Agent for RandomAgent {
    fn get_action(&mut self, _obs: StateId, avail_actions: &[usize]) -> usize {
        if avail_actions.is_empty() {
            return 0;
        }
        avail_actions[self.rng.gen_range(0..avail_actions.len())]
    }

    fn get_probs(&self, _obs: StateId, avail_actions: &[usize]) -> Vec<f64> {
        let n = avail_actions.len();
        vec![1.0 / n.max(1) as f64; n]
    }
}

/// One observed transition, as seen by `update`.
#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    pub obs: StateId,
    pub action: usize,
    pub reward: f64,
    pub terminated: bool,
    pub next_obs: StateId,
}

/// Replays fixed `(action, rt)` responses, then falls back to the first
/// legal action. Records every update.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    script: VecDeque<(usize, f64)>,
    history: Vec<Experience>,
}

impl ScriptedAgent {
    pub fn new(script: impl IntoIterator<Item = (usize, f64)>) -> Self {
        Self {
            script: script.into_iter().collect(),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[Experience] {
        &self.history
    }
}

impl Agent for ScriptedAgent {
    fn get_action(&mut self, _obs: StateId, avail_actions: &[usize]) -> usize {
        avail_actions.first().copied().unwrap_or(0)
    }

    fn get_probs(&self, _obs: StateId, avail_actions: &[usize]) -> Vec<f64> {
        let mut probs = vec![0.0; avail_actions.len()];
        if let Some(p) = probs.first_mut() {
            *p = 1.0;
        }
        probs
    }

    fn update(&mut self, obs: StateId, action: usize, reward: f64, terminated: bool, next_obs: StateId) {
        self.history.push(Experience {
            obs,
            action,
            reward,
            terminated,
            next_obs,
        });
    }

    fn get_rt_action(&mut self, _obs: StateId, _avail_actions: &[usize]) -> Option<(usize, f64)> {
        self.script.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rt_shrinks_with_confidence() {
        assert!((synthesize_rt(1.0) - 0.2).abs() < 1e-12);
        assert!((synthesize_rt(0.5) - 0.5).abs() < 1e-12);
        assert!((synthesize_rt(0.0) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn responder_synthesizes_rt_from_probs() {
        let mut agent = RandomAgent::new(4);
        let mut responder = AgentResponder::new(&mut agent);
        let r = responder.respond(0, &[0, 1]).unwrap();
        assert!(r.action <= 1);
        assert!((r.rt - 0.5).abs() < 1e-12);
        assert!(responder.respond(0, &[]).is_none());
    }

    #[test]
    fn scripted_agent_replays_then_falls_back() {
        let mut agent = ScriptedAgent::new([(1, 0.3)]);
        let mut responder = AgentResponder::new(&mut agent);
        assert_eq!(responder.respond(0, &[0, 1]), Some(SimResponse { action: 1, rt: 0.3 }));
        let fallback = responder.respond(0, &[0, 1]).unwrap();
        assert_eq!(fallback.action, 0);
        assert!((fallback.rt - 0.2).abs() < 1e-12);
    }

    #[test]
    fn random_agent_stays_legal() {
        let mut agent = RandomAgent::new(9);
        for _ in 0..100 {
            let a = agent.get_action(0, &[2, 4]);
            assert!(a == 2 || a == 4);
        }
    }
}
