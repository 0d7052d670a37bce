// src/staircase.rs
//
// Target-duration staircase for incentive-delay tasks.
//
// Only win trials count. Every `every`-th win trial the target duration is
// nudged by the hit rate over the last `every` win trials: below `threshold`
// lengthens the target (easier), anything else shortens it (harder). The duration is clamped to
// [floor, ceiling].

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::condition::ConditionTag;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Staircase {
    /// Name of the hook whose duration is adjusted.
    pub hook: String,
    pub duration: f64,
    pub step: f64,
    pub floor: f64,
    pub ceiling: f64,
    pub threshold: f64,
    /// Adjust every `every` win trials.
    pub every: usize,
    /// Condition tags that count as win trials.
    pub win_tags: Vec<ConditionTag>,
    hits: usize,
    wins: usize,
    /// Outcomes of the most recent win trials, oldest first.
    #[serde(skip)]
    recent: VecDeque<bool>,
}

impl Default for Staircase {
    fn default() -> Self {
        Self {
            hook: "target".to_string(),
            duration: 0.30,
            step: 0.025,
            floor: 0.15,
            ceiling: 0.50,
            threshold: 0.4,
            every: 3,
            win_tags: vec![ConditionTag::from("win-large"), ConditionTag::from("win-small")],
            hits: 0,
            wins: 0,
            recent: VecDeque::new(),
        }
    }
}

impl Staircase {
    pub fn new(hook: impl Into<String>, initial: f64) -> Self {
        Self {
            hook: hook.into(),
            duration: initial,
            ..Self::default()
        }
    }

    pub fn with_floor(mut self, floor: f64) -> Self {
        self.floor = floor;
        self
    }

    pub fn hit_rate(&self) -> Option<f64> {
        (self.wins > 0).then(|| self.hits as f64 / self.wins as f64)
    }

    /// Hit rate over the last `every` win trials.
    pub fn rolling_hit_rate(&self) -> Option<f64> {
        let n = self.recent.len();
        (n > 0).then(|| self.recent.iter().filter(|h| **h).count() as f64 / n as f64)
    }

    pub fn win_trials(&self) -> usize {
        self.wins
    }

    /// Record a trial outcome. Returns the new duration when it changed.
    pub fn record(&mut self, condition: &ConditionTag, hit: bool) -> Option<f64> {
        if !self.win_tags.contains(condition) {
            return None;
        }
        self.wins += 1;
        if hit {
            self.hits += 1;
        }
        self.recent.push_back(hit);
        while self.recent.len() > self.every.max(1) {
            self.recent.pop_front();
        }
        if self.every == 0 || self.wins % self.every != 0 {
            return None;
        }
        let rate = self.rolling_hit_rate().unwrap_or(0.0);
        let delta = if rate < self.threshold { self.step } else { -self.step };
        let next = (self.duration + delta).clamp(self.floor, self.ceiling);
        debug!(rate, from = self.duration, to = next, "staircase");
        let changed = (next - self.duration).abs() > 1e-12;
        self.duration = next;
        changed.then_some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> ConditionTag {
        ConditionTag::from(s)
    }

    #[test]
    fn adjusts_only_every_third_win_trial() {
        let mut s = Staircase::default();
        let mut changes = Vec::new();
        for i in 0..10 {
            // one hit in ten
            if s.record(&tag("win-large"), i == 0).is_some() {
                changes.push(i + 1);
            }
        }
        assert_eq!(changes, vec![3, 6, 9]);
        assert!((s.duration - 0.375).abs() < 1e-9);
    }

    #[test]
    fn high_hit_rate_shortens_down_to_floor() {
        let mut s = Staircase::new("target", 0.2);
        for _ in 0..30 {
            s.record(&tag("win-small"), true);
        }
        assert!((s.duration - 0.15).abs() < 1e-9);
    }

    #[test]
    fn rate_is_taken_over_the_latest_block() {
        let mut s = Staircase::default();
        for _ in 0..3 {
            s.record(&tag("win-large"), true);
        }
        assert!((s.duration - 0.275).abs() < 1e-9);

        // Cumulative rate would be 0.5; the last three were all misses.
        for _ in 0..3 {
            s.record(&tag("win-large"), false);
        }
        assert_eq!(s.hit_rate(), Some(0.5));
        assert_eq!(s.rolling_hit_rate(), Some(0.0));
        assert!((s.duration - 0.30).abs() < 1e-9);
    }

    #[test]
    fn non_win_trials_are_ignored() {
        let mut s = Staircase::default();
        for _ in 0..9 {
            assert_eq!(s.record(&tag("neutral"), false), None);
        }
        assert_eq!(s.win_trials(), 0);
        assert_eq!(s.duration, 0.30);
    }
}
