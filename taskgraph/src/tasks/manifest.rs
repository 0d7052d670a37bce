// src/tasks/manifest.rs
//
// Declarative tasks loaded from YAML.
//
// A manifest carries the same pieces a built-in task builds in code: graph,
// reward specs, condition table, hook specs, key map, optional staircase, and
// a schedule recipe (quotas, consecutive-tag constraint, jitter, breaks).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::condition::{ConditionTable, ConditionTag};
use crate::engine::HookTable;
use crate::error::{TaskError, TaskResult};
use crate::graph::{StateId, TaskGraph};
use crate::hooks::HookSpec;
use crate::reward::{build_reward_table, RewardSpec};
use crate::schedule::{breakpoints_every, ScheduleBuilder, TrialSchedule};
use crate::staircase::Staircase;
use crate::window::WindowSize;

use super::{schedule_seed, TaskBundle, TaskDefinition};

/// Schedule recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Trials per condition tag.
    pub quotas: BTreeMap<ConditionTag, usize>,
    #[serde(default)]
    pub forbid_consecutive: Vec<String>,
    #[serde(default)]
    pub start: StateId,
    /// Hooks whose durations are jittered per trial.
    #[serde(default)]
    pub update: Vec<String>,
    /// `(lo, hi)` per entry of `update`.
    #[serde(default)]
    pub jitter: Vec<(f64, f64)>,
    #[serde(default)]
    pub add_remainder: bool,
    #[serde(default)]
    pub break_every: Option<usize>,
    #[serde(default)]
    pub break_duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub keys: Vec<String>,
    pub graph: TaskGraph,
    pub rewards: BTreeMap<StateId, RewardSpec>,
    #[serde(default)]
    pub conditions: ConditionTable,
    #[serde(default)]
    pub hooks: BTreeMap<StateId, Vec<HookSpec>>,
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub staircase: Option<Staircase>,
}

impl TaskManifest {
    pub fn from_yaml_str(yaml: &str, origin: &str) -> TaskResult<Self> {
        let manifest: Self = serde_yaml::from_str(yaml).map_err(|e| TaskError::Manifest {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        manifest.validate(origin)?;
        Ok(manifest)
    }

    pub fn validate(&self, origin: &str) -> TaskResult<()> {
        let fail = |message: String| TaskError::Manifest {
            path: origin.to_string(),
            message,
        };
        if self.name.trim().is_empty() {
            return Err(fail("task name is empty".into()));
        }
        if self.keys.is_empty() {
            return Err(fail("no response keys".into()));
        }
        if self.schedule.update.len() != self.schedule.jitter.len() {
            return Err(fail(format!(
                "{} updated hooks but {} jitter ranges",
                self.schedule.update.len(),
                self.schedule.jitter.len()
            )));
        }
        if self.schedule.quotas.values().sum::<usize>() == 0 {
            return Err(fail("schedule has no trials".into()));
        }
        Ok(())
    }
}

/// A manifest registered as a task.
#[derive(Debug, Clone)]
pub struct ManifestTask {
    manifest: TaskManifest,
}

impl ManifestTask {
    pub fn new(manifest: TaskManifest) -> Self {
        Self { manifest }
    }

    /// Parse and check that the task assembles.
    pub fn load(path: &Path) -> TaskResult<Self> {
        let origin = path.display().to_string();
        let text = std::fs::read_to_string(path)?;
        let task = Self::new(TaskManifest::from_yaml_str(&text, &origin)?);
        task.get_task(&ConditionTable::default(), WindowSize::default(), 0)
            .and_then(|bundle| bundle.into_env(0))
            .map_err(|e| TaskError::Manifest {
                path: origin,
                message: e.to_string(),
            })?;
        Ok(task)
    }

    pub fn manifest(&self) -> &TaskManifest {
        &self.manifest
    }
}

impl TaskDefinition for ManifestTask {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        &self.manifest.description
    }

    fn get_task(
        &self,
        conditions: &ConditionTable,
        _window: WindowSize,
        seed: u64,
    ) -> TaskResult<TaskBundle> {
        let m = &self.manifest;
        let mut table = m.conditions.clone();
        table.merge(conditions.clone());

        let mut hooks = HookTable::new();
        for (state, specs) in &m.hooks {
            let built = specs
                .iter()
                .enumerate()
                .map(|(i, s)| s.build(seed ^ ((*state as u64) << 8) ^ i as u64))
                .collect();
            hooks.insert(*state, built);
        }

        Ok(TaskBundle {
            graph: m.graph.clone(),
            rewards: build_reward_table(&m.rewards, seed)?,
            conditions: table,
            hooks,
            keys: m.keys.clone(),
            staircase: m.staircase.clone(),
        })
    }

    fn get_configs(&self, stimulus_set: &str, seed: u64) -> TaskResult<TrialSchedule> {
        let spec = &self.manifest.schedule;
        let mut builder = ScheduleBuilder::new(schedule_seed(seed, stimulus_set));
        for (tag, n) in &spec.quotas {
            builder = builder.quota(tag.clone(), *n);
        }
        for needle in &spec.forbid_consecutive {
            builder = builder.forbid_consecutive(needle.clone());
        }
        let condition = builder.sequence()?;
        let n = condition.len();
        let isi = if spec.update.is_empty() {
            Vec::new()
        } else {
            builder.jittered(n, &spec.jitter)
        };
        let breakpoints = spec
            .break_every
            .map(|every| breakpoints_every(n, every))
            .unwrap_or_default();

        let schedule = TrialSchedule::new(&self.manifest.name, condition)
            .with_stimulus_set(stimulus_set)
            .with_default_start(spec.start)
            .with_updates(spec.update.clone(), isi)
            .with_remainder(spec.add_remainder)
            .with_breaks(breakpoints, spec.break_duration);
        schedule.validate()?;
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SIMPLE: &str = r#"
name: simple_choice
description: two-armed bandit
keys: [left, right]
graph:
  0: !deterministic [1, 2]
  1: terminal
  2: terminal
rewards:
  1: !constant 1.0
  2: !categorical
    outcomes: [0.0, 2.0]
    probs: [0.5, 0.5]
hooks:
  0:
    - kind: passive
      name: fixation
      duration: 0.5
    - kind: action
      name: choice
      duration: 1.5
  1:
    - kind: feedback
      name: outcome
      duration: 1.0
      text: "{reward}"
  2:
    - kind: feedback
      name: outcome
      duration: 1.0
schedule:
  quotas: {a: 4, b: 4}
  update: [fixation]
  jitter: [[0.4, 0.6]]
  break_every: 4
  break_duration: 10
"#;

    #[test]
    fn manifest_parses_and_schedules() {
        let m = TaskManifest::from_yaml_str(SIMPLE, "inline").unwrap();
        let task = ManifestTask::new(m);
        let s = task.get_configs("1", 3).unwrap();
        assert_eq!(s.ntrials, 8);
        assert_eq!(s.breakpoints, vec![3]);
        assert!(s.isi.iter().all(|row| row[0] >= 0.4 && row[0] < 0.6));
        let bundle = task.get_task(&s.condition_dict, WindowSize::default(), 3).unwrap();
        assert_eq!(bundle.hooks[&0].len(), 2);
        bundle.into_env(3).unwrap();
    }

    #[test]
    fn mismatched_jitter_is_rejected() {
        let bad = SIMPLE.replace("jitter: [[0.4, 0.6]]", "jitter: []");
        let err = TaskManifest::from_yaml_str(&bad, "inline").unwrap_err();
        assert!(matches!(err, TaskError::Manifest { .. }));
    }
}
