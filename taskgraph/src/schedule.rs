// src/schedule.rs
//
// Per-run trial schedule and its seeded generator.
//
// A `TrialSchedule` is frozen before the first trial: one condition tag,
// starting state and set of hook-duration overrides per trial, plus break
// points and the condition dictionary. Schedules can be written by hand in
// YAML or generated with `ScheduleBuilder`, which fills per-condition quotas
// and places tags carrying a forbidden substring so that no two of them land
// on consecutive trials.

use std::collections::BTreeSet;

use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::condition::{ConditionTable, ConditionTag};
use crate::error::{TaskError, TaskResult};
use crate::graph::StateId;

/// One run's plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSchedule {
    pub name: String,
    #[serde(default)]
    pub stimulus_set: String,
    /// Per-trial durations, aligned with `update`.
    #[serde(default)]
    pub isi: Vec<Vec<f64>>,
    /// Per-trial condition tag.
    pub condition: Vec<ConditionTag>,
    /// Per-trial starting state; empty means `default_start` for every trial.
    #[serde(default)]
    pub start: Vec<StateId>,
    #[serde(default)]
    pub default_start: StateId,
    #[serde(default)]
    pub condition_dict: ConditionTable,
    pub ntrials: usize,
    /// Hook names whose durations are overridden per trial from `isi`.
    #[serde(default)]
    pub update: Vec<String>,
    /// Wait out the accumulated response remainder at trial end.
    #[serde(default)]
    pub add_remainder: bool,
    /// Trial indices after which a break is inserted.
    #[serde(default)]
    pub breakpoints: Vec<usize>,
    /// Break length (s).
    #[serde(default)]
    pub break_duration: f64,
}

/// One scheduled trial, resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub index: usize,
    pub condition: ConditionTag,
    pub start: StateId,
    /// (hook name, duration) overrides to apply before reset.
    pub durations: Vec<(String, f64)>,
    pub break_after: bool,
}

impl TrialSchedule {
    /// Schedule with `conditions.len()` trials and no timing overrides.
    pub fn new(name: impl Into<String>, conditions: Vec<ConditionTag>) -> Self {
        Self {
            name: name.into(),
            stimulus_set: String::new(),
            isi: Vec::new(),
            ntrials: conditions.len(),
            condition: conditions,
            start: Vec::new(),
            default_start: 0,
            condition_dict: ConditionTable::default(),
            update: Vec::new(),
            add_remainder: false,
            breakpoints: Vec::new(),
            break_duration: 0.0,
        }
    }

    pub fn with_stimulus_set(mut self, set: impl Into<String>) -> Self {
        self.stimulus_set = set.into();
        self
    }

    pub fn with_starts(mut self, starts: Vec<StateId>) -> Self {
        self.start = starts;
        self
    }

    pub fn with_default_start(mut self, start: StateId) -> Self {
        self.default_start = start;
        self
    }

    pub fn with_condition_dict(mut self, dict: ConditionTable) -> Self {
        self.condition_dict = dict;
        self
    }

    /// Per-trial durations for the named hooks.
    pub fn with_updates(mut self, update: Vec<String>, isi: Vec<Vec<f64>>) -> Self {
        self.update = update;
        self.isi = isi;
        self
    }

    pub fn with_remainder(mut self, add: bool) -> Self {
        self.add_remainder = add;
        self
    }

    pub fn with_breaks(mut self, breakpoints: Vec<usize>, duration: f64) -> Self {
        self.breakpoints = breakpoints;
        self.break_duration = duration;
        self
    }

    pub fn from_yaml_str(yaml: &str) -> TaskResult<Self> {
        let schedule: Self = serde_yaml::from_str(yaml)
            .map_err(|e| TaskError::schedule("yaml", e.to_string()))?;
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn to_yaml(&self) -> TaskResult<String> {
        serde_yaml::to_string(self).map_err(|e| TaskError::schedule("yaml", e.to_string()))
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.condition.len() != self.ntrials {
            return Err(TaskError::schedule(
                "condition",
                format!("{} tags for {} trials", self.condition.len(), self.ntrials),
            ));
        }
        if !self.start.is_empty() && self.start.len() != self.ntrials {
            return Err(TaskError::schedule(
                "start",
                format!("{} starts for {} trials", self.start.len(), self.ntrials),
            ));
        }
        if !self.isi.is_empty() && self.isi.len() != self.ntrials {
            return Err(TaskError::schedule(
                "isi",
                format!("{} rows for {} trials", self.isi.len(), self.ntrials),
            ));
        }
        if let Some((i, row)) = self
            .isi
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.update.len())
        {
            return Err(TaskError::schedule(
                "isi",
                format!(
                    "trial {i} has {} durations for {} updated hooks",
                    row.len(),
                    self.update.len()
                ),
            ));
        }
        if self
            .isi
            .iter()
            .flatten()
            .any(|d| !d.is_finite() || *d < 0.0)
        {
            return Err(TaskError::schedule("isi", "durations must be finite and >= 0"));
        }
        if let Some(bp) = self.breakpoints.iter().find(|b| **b >= self.ntrials) {
            return Err(TaskError::schedule(
                "breakpoints",
                format!("break point {bp} beyond {} trials", self.ntrials),
            ));
        }
        if !self.break_duration.is_finite() || self.break_duration < 0.0 {
            return Err(TaskError::schedule("break_duration", "must be finite and >= 0"));
        }
        Ok(())
    }

    pub fn trial(&self, index: usize) -> Option<Trial> {
        let condition = self.condition.get(index)?.clone();
        let start = self.start.get(index).copied().unwrap_or(self.default_start);
        let durations = self
            .isi
            .get(index)
            .map(|row| self.update.iter().cloned().zip(row.iter().copied()).collect())
            .unwrap_or_default();
        Some(Trial {
            index,
            condition,
            start,
            durations,
            break_after: self.breakpoints.contains(&index),
        })
    }

    pub fn trials(&self) -> impl Iterator<Item = Trial> + '_ {
        (0..self.ntrials).filter_map(|i| self.trial(i))
    }

    /// The first `n` trials (cycling when `n > ntrials`); break points are dropped.
    pub fn truncated(&self, n: usize) -> Self {
        if self.ntrials == 0 {
            return self.clone();
        }
        let pick = |i: usize| i % self.ntrials;
        Self {
            condition: (0..n).map(|i| self.condition[pick(i)].clone()).collect(),
            start: if self.start.is_empty() {
                Vec::new()
            } else {
                (0..n).map(|i| self.start[pick(i)]).collect()
            },
            isi: if self.isi.is_empty() {
                Vec::new()
            } else {
                (0..n).map(|i| self.isi[pick(i)].clone()).collect()
            },
            ntrials: n,
            breakpoints: Vec::new(),
            ..self.clone()
        }
    }

    /// Distinct condition tags in first-appearance order.
    pub fn distinct_conditions(&self) -> Vec<ConditionTag> {
        let mut seen = BTreeSet::new();
        self.condition
            .iter()
            .filter(|t| seen.insert((*t).clone()))
            .cloned()
            .collect()
    }
}

/// Seeded generator of condition sequences and timing.
#[derive(Debug, Clone)]
pub struct ScheduleBuilder {
    rng: ChaCha8Rng,
    quotas: Vec<(ConditionTag, usize)>,
    forbid_consecutive: Vec<String>,
}

impl ScheduleBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            quotas: Vec::new(),
            forbid_consecutive: Vec::new(),
        }
    }

    /// Require exactly `count` trials tagged `tag`.
    pub fn quota(mut self, tag: impl Into<ConditionTag>, count: usize) -> Self {
        self.quotas.push((tag.into(), count));
        self
    }

    /// Tags containing `needle` must not appear on consecutive trials.
    pub fn forbid_consecutive(mut self, needle: impl Into<String>) -> Self {
        self.forbid_consecutive.push(needle.into());
        self
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    fn is_restricted(&self, tag: &ConditionTag) -> bool {
        self.forbid_consecutive.iter().any(|n| tag.contains(n))
    }

    /// Seeded ordering of the quota pool.
    ///
    /// Tags matching any forbidden substring are dropped into distinct gaps
    /// between the shuffled free tags, so none of them are adjacent. Every
    /// such ordering is equally likely.
    pub fn sequence(&mut self) -> TaskResult<Vec<ConditionTag>> {
        let pool: Vec<ConditionTag> = self
            .quotas
            .iter()
            .flat_map(|(tag, n)| std::iter::repeat(tag.clone()).take(*n))
            .collect();
        if pool.is_empty() {
            return Err(TaskError::schedule("condition", "no quotas configured"));
        }
        let (mut restricted, mut free): (Vec<_>, Vec<_>) =
            pool.into_iter().partition(|t| self.is_restricted(t));
        let gaps = free.len() + 1;
        if restricted.len() > gaps {
            return Err(TaskError::schedule(
                "condition",
                format!(
                    "{} trials matching {:?} cannot be separated by {} others",
                    restricted.len(),
                    self.forbid_consecutive,
                    free.len()
                ),
            ));
        }

        free.shuffle(&mut self.rng);
        restricted.shuffle(&mut self.rng);
        let mut slots = index::sample(&mut self.rng, gaps, restricted.len()).into_vec();
        slots.sort_unstable();

        let mut out = Vec::with_capacity(free.len() + restricted.len());
        let mut slots = slots.into_iter().peekable();
        let mut restricted = restricted.into_iter();
        for gap in 0..gaps {
            if slots.next_if_eq(&gap).is_some() {
                out.extend(restricted.next());
            }
            if gap < free.len() {
                out.push(free[gap].clone());
            }
        }
        Ok(out)
    }

    /// `n` rows of durations, column `j` uniform in `ranges[j]`.
    pub fn jittered(&mut self, n: usize, ranges: &[(f64, f64)]) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| {
                ranges
                    .iter()
                    .map(|&(lo, hi)| {
                        if hi > lo {
                            self.rng.gen_range(lo..hi)
                        } else {
                            lo
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

/// Split `n` into per-fraction counts that sum to `n` (largest remainder).
pub fn quota_counts(n: usize, fractions: &[f64]) -> Vec<usize> {
    let total: f64 = fractions.iter().sum();
    if fractions.is_empty() || total <= 0.0 {
        return vec![0; fractions.len()];
    }
    let exact: Vec<f64> = fractions.iter().map(|f| n as f64 * f / total).collect();
    let mut counts: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();
    let mut order: Vec<usize> = (0..fractions.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    let assigned: usize = counts.iter().sum();
    for &i in order.iter().take(n.saturating_sub(assigned)) {
        counts[i] += 1;
    }
    counts
}

/// Break after every `every` trials, never after the last one.
pub fn breakpoints_every(ntrials: usize, every: usize) -> Vec<usize> {
    if every == 0 {
        return Vec::new();
    }
    (1..)
        .map(|k| k * every - 1)
        .take_while(|&i| i + 1 < ntrials)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotas_are_met_and_rare_tags_never_repeat() {
        for seed in 0..20 {
            let seq = ScheduleBuilder::new(seed)
                .quota("expected", 35)
                .quota("unexpected", 15)
                .forbid_consecutive("unexpected")
                .sequence()
                .unwrap();
            assert_eq!(seq.len(), 50);
            let rare = seq.iter().filter(|t| t.as_str() == "unexpected").count();
            assert_eq!(rare, 15);
            assert!(seq
                .windows(2)
                .all(|w| !(w[0].contains("unexpected") && w[1].contains("unexpected"))));
        }
    }

    #[test]
    fn dense_restricted_tags_still_separate() {
        for seed in 0..200 {
            let seq = ScheduleBuilder::new(seed)
                .quota("expected", 70)
                .quota("unexpected", 30)
                .forbid_consecutive("unexpected")
                .sequence()
                .unwrap();
            assert_eq!(seq.len(), 100);
            assert!(seq
                .windows(2)
                .all(|w| !(w[0].contains("unexpected") && w[1].contains("unexpected"))));
        }

        // Exactly one more restricted tag than free ones: alternation is forced.
        let seq = ScheduleBuilder::new(4)
            .quota("go", 2)
            .quota("nogo", 3)
            .forbid_consecutive("nogo")
            .sequence()
            .unwrap();
        let names: Vec<&str> = seq.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, vec!["nogo", "go", "nogo", "go", "nogo"]);
    }

    #[test]
    fn impossible_constraint_fails() {
        let err = ScheduleBuilder::new(0)
            .quota("unexpected", 3)
            .forbid_consecutive("unexpected")
            .sequence()
            .unwrap_err();
        assert!(matches!(err, TaskError::Schedule { .. }));
    }

    #[test]
    fn truncation_cycles_and_drops_breaks() {
        let s = TrialSchedule::new("t", vec!["a".into(), "b".into()])
            .with_starts(vec![0, 1])
            .with_updates(vec!["iti".into()], vec![vec![1.0], vec![2.0]])
            .with_breaks(vec![0], 5.0);
        let t = s.truncated(3);
        t.validate().unwrap();
        assert_eq!(t.ntrials, 3);
        assert_eq!(t.condition[2].as_str(), "a");
        assert_eq!(t.start, vec![0, 1, 0]);
        assert_eq!(t.isi[1], vec![2.0]);
        assert!(t.breakpoints.is_empty());
    }

    #[test]
    fn same_seed_same_sequence() {
        let build = |seed| {
            ScheduleBuilder::new(seed)
                .quota("a", 5)
                .quota("b", 5)
                .sequence()
                .unwrap()
        };
        assert_eq!(build(11), build(11));
    }

    #[test]
    fn quota_counts_sum_to_n() {
        assert_eq!(quota_counts(10, &[0.7, 0.3]), vec![7, 3]);
        assert_eq!(quota_counts(7, &[1.0, 1.0, 1.0]), vec![3, 2, 2]);
        assert_eq!(quota_counts(5, &[]), Vec::<usize>::new());
    }

    #[test]
    fn breakpoints_exclude_last_trial() {
        assert_eq!(breakpoints_every(32, 8), vec![7, 15, 23]);
        assert_eq!(breakpoints_every(33, 8), vec![7, 15, 23, 31]);
        assert!(breakpoints_every(5, 0).is_empty());
    }

    #[test]
    fn yaml_schedule_validates() {
        let yaml = r#"
name: demo
condition: [1, 2, 1]
ntrials: 3
update: [fixation]
isi: [[0.5], [0.6], [0.7]]
breakpoints: [1]
break_duration: 15
"#;
        let s = TrialSchedule::from_yaml_str(yaml).unwrap();
        let t = s.trial(1).unwrap();
        assert_eq!(t.condition.as_str(), "2");
        assert_eq!(t.durations, vec![("fixation".to_string(), 0.6)]);
        assert!(t.break_after);
        assert_eq!(s.distinct_conditions().len(), 2);

        let bad = yaml.replace("ntrials: 3", "ntrials: 4");
        assert!(TrialSchedule::from_yaml_str(&bad).is_err());
    }
}
