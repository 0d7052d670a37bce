// src/reward.rs
//
// Reward emitters bound to terminal states.
//
// Closed set of implementations behind one small trait:
// - CategoricalReward: finite outcomes with a probability vector.
// - ConditionalReward: outcome looked up by the trial's condition tag.
// - DriftingReward:    Bernoulli probability (or mean) following a reflected
//                      Gaussian random walk across calls.
//
// Every emitter owns its generator, seeded at construction, so replays are
// deterministic and no generator is shared.

use std::collections::BTreeMap;
use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::condition::ConditionTag;
use crate::error::{TaskError, TaskResult};
use crate::graph::StateId;

/// Scalar reward produced when a terminal state is entered.
pub trait RewardSource: fmt::Debug + Send {
    /// Emit one reward for a trial run under `condition`.
    fn emit(&mut self, condition: &ConditionTag) -> TaskResult<f64>;

    /// Current drifting parameter, if the emitter has one.
    fn drift_parameter(&self) -> Option<f64> {
        None
    }
}

/// Terminal state -> emitter.
pub type RewardTable = BTreeMap<StateId, Box<dyn RewardSource>>;

/// Finite outcome set drawn with fixed probabilities.
#[derive(Debug, Clone)]
pub struct CategoricalReward {
    outcomes: Vec<f64>,
    cumulative: Vec<f64>,
    rng: ChaCha8Rng,
}

impl CategoricalReward {
    pub fn new(outcomes: Vec<f64>, probs: Vec<f64>, seed: u64) -> TaskResult<Self> {
        if outcomes.is_empty() || outcomes.len() != probs.len() {
            return Err(TaskError::graph(format!(
                "categorical reward needs matching non-empty outcomes/probs ({} vs {})",
                outcomes.len(),
                probs.len()
            )));
        }
        if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(TaskError::graph("categorical reward has a negative probability"));
        }
        let total: f64 = probs.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(TaskError::graph(format!(
                "categorical reward probabilities sum to {total}, expected 1"
            )));
        }
        let mut acc = 0.0;
        let cumulative = probs
            .iter()
            .map(|p| {
                acc += p;
                acc
            })
            .collect();
        Ok(Self {
            outcomes,
            cumulative,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Single-outcome emitter.
    pub fn constant(value: f64) -> Self {
        Self {
            outcomes: vec![value],
            cumulative: vec![1.0],
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }
}

impl RewardSource for CategoricalReward {
    fn emit(&mut self, _condition: &ConditionTag) -> TaskResult<f64> {
        if self.outcomes.len() == 1 {
            return Ok(self.outcomes[0]);
        }
        let u: f64 = self.rng.gen();
        let idx = self
            .cumulative
            .iter()
            .position(|c| u < *c)
            .unwrap_or(self.outcomes.len() - 1);
        Ok(self.outcomes[idx])
    }
}

/// Zero-variance outcome selected by condition tag.
#[derive(Debug, Clone, Default)]
pub struct ConditionalReward {
    table: BTreeMap<ConditionTag, f64>,
}

impl ConditionalReward {
    pub fn new(table: BTreeMap<ConditionTag, f64>) -> Self {
        Self { table }
    }

    pub fn from_pairs<T: Into<ConditionTag>>(pairs: impl IntoIterator<Item = (T, f64)>) -> Self {
        Self {
            table: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl RewardSource for ConditionalReward {
    fn emit(&mut self, condition: &ConditionTag) -> TaskResult<f64> {
        self.table
            .get(condition)
            .copied()
            .ok_or_else(|| TaskError::InvalidCondition {
                condition: condition.clone(),
            })
    }
}

/// What the drifting parameter means.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Parameter is the probability of paying `payoff` (otherwise 0).
    Probability { payoff: f64 },
    /// Parameter is the mean outcome; `noise_sd` adds per-call jitter.
    Mean {
        #[serde(default)]
        noise_sd: f64,
    },
}

/// Bounded random-walk emitter.
///
/// After each emission the parameter receives a zero-mean Gaussian increment
/// with standard deviation `step_sd`, reflected at `[lower, upper]`.
#[derive(Debug, Clone)]
pub struct DriftingReward {
    kind: DriftKind,
    param: f64,
    lower: f64,
    upper: f64,
    step_sd: f64,
    rng: ChaCha8Rng,
}

/// Default reflection bounds for drifting reward probabilities.
pub const DRIFT_LOWER: f64 = 0.25;
pub const DRIFT_UPPER: f64 = 0.75;
/// Default random-walk step.
pub const DRIFT_STEP_SD: f64 = 0.025;

impl DriftingReward {
    pub fn new(
        kind: DriftKind,
        initial: f64,
        bounds: (f64, f64),
        step_sd: f64,
        seed: u64,
    ) -> TaskResult<Self> {
        let (lower, upper) = bounds;
        if !(lower < upper) || !(lower..=upper).contains(&initial) || step_sd < 0.0 {
            return Err(TaskError::graph(format!(
                "drifting reward: initial {initial} must lie in bounds ({lower}, {upper}) with step_sd >= 0"
            )));
        }
        Ok(Self {
            kind,
            param: initial,
            lower,
            upper,
            step_sd,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Two-step style Bernoulli payoff with the usual [0.25, 0.75] bounds.
    pub fn bernoulli(initial: f64, payoff: f64, seed: u64) -> TaskResult<Self> {
        Self::new(
            DriftKind::Probability { payoff },
            initial,
            (DRIFT_LOWER, DRIFT_UPPER),
            DRIFT_STEP_SD,
            seed,
        )
    }

    pub fn parameter(&self) -> f64 {
        self.param
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    fn drift(&mut self) {
        let step = standard_normal(&mut self.rng) * self.step_sd;
        self.param = reflect(self.param + step, self.lower, self.upper);
    }
}

impl RewardSource for DriftingReward {
    fn emit(&mut self, _condition: &ConditionTag) -> TaskResult<f64> {
        let value = match self.kind {
            DriftKind::Probability { payoff } => {
                let u: f64 = self.rng.gen();
                if u < self.param {
                    payoff
                } else {
                    0.0
                }
            }
            DriftKind::Mean { noise_sd } => {
                self.param + standard_normal(&mut self.rng) * noise_sd
            }
        };
        self.drift();
        Ok(value)
    }

    fn drift_parameter(&self) -> Option<f64> {
        Some(self.param)
    }
}

/// Reflect `x` into `[lower, upper]`.
fn reflect(mut x: f64, lower: f64, upper: f64) -> f64 {
    let width = upper - lower;
    if width <= 0.0 {
        return lower;
    }
    // Fold into one period of length 2 * width, then mirror the upper half.
    let period = 2.0 * width;
    x = (x - lower).rem_euclid(period);
    if x > width {
        x = period - x;
    }
    lower + x
}

/// Box-Muller standard normal draw.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Serializable emitter description used by task manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardSpec {
    Constant(f64),
    Categorical {
        outcomes: Vec<f64>,
        probs: Vec<f64>,
    },
    Conditional(BTreeMap<ConditionTag, f64>),
    Drifting {
        kind: DriftKind,
        initial: f64,
        #[serde(default = "default_bounds")]
        bounds: (f64, f64),
        #[serde(default = "default_step_sd")]
        step_sd: f64,
    },
}

fn default_bounds() -> (f64, f64) {
    (DRIFT_LOWER, DRIFT_UPPER)
}

fn default_step_sd() -> f64 {
    DRIFT_STEP_SD
}

impl RewardSpec {
    /// Build the emitter. `seed` only matters for stochastic variants.
    pub fn build(&self, seed: u64) -> TaskResult<Box<dyn RewardSource>> {
        Ok(match self {
            RewardSpec::Constant(v) => Box::new(CategoricalReward::constant(*v)),
            RewardSpec::Categorical { outcomes, probs } => {
                Box::new(CategoricalReward::new(outcomes.clone(), probs.clone(), seed)?)
            }
            RewardSpec::Conditional(table) => Box::new(ConditionalReward::new(table.clone())),
            RewardSpec::Drifting {
                kind,
                initial,
                bounds,
                step_sd,
            } => Box::new(DriftingReward::new(*kind, *initial, *bounds, *step_sd, seed)?),
        })
    }
}

/// Build a reward table from specs, deriving one seed per terminal.
pub fn build_reward_table(
    specs: &BTreeMap<StateId, RewardSpec>,
    base_seed: u64,
) -> TaskResult<RewardTable> {
    specs
        .iter()
        .map(|(state, spec)| {
            let seed = base_seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(*state as u64);
            spec.build(seed).map(|emitter| (*state, emitter))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> ConditionTag {
        ConditionTag::from(s)
    }

    #[test]
    fn conditional_rejects_unknown_tag() {
        let mut r = ConditionalReward::from_pairs([("reward", 1.0), ("loss", -0.5)]);
        assert_eq!(r.emit(&tag("loss")).unwrap(), -0.5);
        let err = r.emit(&tag("neutral")).unwrap_err();
        assert!(matches!(err, TaskError::InvalidCondition { .. }));
    }

    #[test]
    fn categorical_frequencies_follow_probs() {
        let mut r = CategoricalReward::new(vec![0.0, 4.0], vec![0.5, 0.5], 3).unwrap();
        let n = 4000;
        let wins = (0..n)
            .filter(|_| r.emit(&tag("x")).unwrap() == 4.0)
            .count();
        let freq = wins as f64 / n as f64;
        assert!((freq - 0.5).abs() < 0.05, "freq = {freq}");
    }

    #[test]
    fn categorical_rejects_bad_probs() {
        assert!(CategoricalReward::new(vec![1.0, 2.0], vec![0.5, 0.6], 0).is_err());
        assert!(CategoricalReward::new(vec![1.0], vec![0.5, 0.5], 0).is_err());
    }

    #[test]
    fn drifting_stays_within_bounds() {
        let mut r = DriftingReward::new(
            DriftKind::Probability { payoff: 1.0 },
            0.5,
            (0.25, 0.75),
            0.2,
            11,
        )
        .unwrap();
        for _ in 0..10_000 {
            let v = r.emit(&tag("any")).unwrap();
            assert!(v == 0.0 || v == 1.0);
            let p = r.parameter();
            assert!((0.25..=0.75).contains(&p), "p = {p}");
        }
    }

    #[test]
    fn drifting_is_deterministic_per_seed() {
        let mut a = DriftingReward::bernoulli(0.4, 1.0, 5).unwrap();
        let mut b = DriftingReward::bernoulli(0.4, 1.0, 5).unwrap();
        for _ in 0..200 {
            assert_eq!(a.emit(&tag("t")).unwrap(), b.emit(&tag("t")).unwrap());
            assert_eq!(a.parameter(), b.parameter());
        }
    }

    #[test]
    fn reflect_folds_large_excursions() {
        assert!((reflect(0.8, 0.25, 0.75) - 0.7).abs() < 1e-12);
        assert!((reflect(0.2, 0.25, 0.75) - 0.3).abs() < 1e-12);
        let far = reflect(3.1, 0.25, 0.75);
        assert!((0.25..=0.75).contains(&far));
    }

    #[test]
    fn spec_builds_from_yaml() {
        let yaml = r#"
3: !constant 5.0
4: !conditional { reward: 1.0, 1: 0.0 }
5: !drifting
  kind: !probability { payoff: 1.0 }
  initial: 0.6
"#;
        let specs: BTreeMap<StateId, RewardSpec> = serde_yaml::from_str(yaml).unwrap();
        let mut table = build_reward_table(&specs, 42).unwrap();
        assert_eq!(table.get_mut(&3).unwrap().emit(&tag("z")).unwrap(), 5.0);
        assert_eq!(table.get_mut(&4).unwrap().emit(&ConditionTag::from(1)).unwrap(), 0.0);
        assert_eq!(table[&5].drift_parameter(), Some(0.6));
    }
}
