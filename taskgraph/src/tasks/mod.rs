// src/tasks/mod.rs
//
// Task definitions and the registry that finds them.
//
// A task supplies two things:
// - get_task:    the graph, reward emitters, condition table and render hooks;
// - get_configs: the trial schedule for a stimulus set.
//
// Built-in tasks each expose a `register_task()` fragment; YAML manifests in
// a task directory are discovered at startup and registered alongside them.
//
// Built-ins:
// - hcp_gambling:   card guessing with block-wise reward/loss outcomes
// - two_step:       two-stage choice with common/rare transitions
// - go_nogo:        press/withhold with probabilistic feedback
// - mid:            monetary incentive delay with a target staircase
// - risk_sensitive: pairwise choice among five gambles
// - posner:         spatial cueing with valid/invalid targets

pub mod go_nogo;
pub mod hcp_gambling;
pub mod manifest;
pub mod mid;
pub mod posner;
pub mod risk_sensitive;
pub mod two_step;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::condition::ConditionTable;
use crate::engine::{HookTable, TaskEnv};
use crate::error::{TaskError, TaskResult};
use crate::graph::TaskGraph;
use crate::hooks::RenderHook;
use crate::reward::RewardTable;
use crate::schedule::TrialSchedule;
use crate::staircase::Staircase;
use crate::window::WindowSize;

pub use manifest::{ManifestTask, ScheduleSpec, TaskManifest};

/// Everything the engine needs for one task.
#[derive(Debug)]
pub struct TaskBundle {
    pub graph: TaskGraph,
    pub rewards: RewardTable,
    pub conditions: ConditionTable,
    pub hooks: HookTable,
    /// `keys[i]` is the physical key for action `i`.
    pub keys: Vec<String>,
    pub staircase: Option<Staircase>,
}

impl TaskBundle {
    /// Build the environment; also hands back the key map and staircase.
    pub fn into_env(self, seed: u64) -> TaskResult<(TaskEnv, Vec<String>, Option<Staircase>)> {
        let env = TaskEnv::new(self.graph, self.rewards, self.conditions, self.hooks, seed)?;
        Ok((env, self.keys, self.staircase))
    }
}

pub trait TaskDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Assemble the task. `conditions` (usually the schedule's condition
    /// dictionary) is merged over the task's own table.
    fn get_task(
        &self,
        conditions: &ConditionTable,
        window: WindowSize,
        seed: u64,
    ) -> TaskResult<TaskBundle>;

    /// Trial schedule for `stimulus_set`.
    fn get_configs(&self, stimulus_set: &str, seed: u64) -> TaskResult<TrialSchedule>;
}

impl fmt::Debug for dyn TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Registry fragment returned by `register_task()`.
pub type TaskFragment = Vec<Arc<dyn TaskDefinition>>;

pub(crate) fn boxed<H: RenderHook + 'static>(hook: H) -> Box<dyn RenderHook> {
    Box::new(hook)
}

/// Seed for schedule generation: stable per (seed, stimulus set).
pub fn schedule_seed(seed: u64, stimulus_set: &str) -> u64 {
    // FNV-1a over the set name
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in stimulus_set.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h ^ seed.rotate_left(17)
}

/// Name -> task definition.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Arc<dyn TaskDefinition>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in task.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        for fragment in [
            hcp_gambling::register_task(),
            two_step::register_task(),
            go_nogo::register_task(),
            mid::register_task(),
            risk_sensitive::register_task(),
            posner::register_task(),
        ] {
            reg.extend(fragment);
        }
        reg
    }

    /// Built-ins plus every manifest in `dir` (when given).
    pub fn discover(dir: Option<&Path>) -> TaskResult<Self> {
        let mut reg = Self::builtin();
        if let Some(dir) = dir {
            let n = reg.load_dir(dir)?;
            info!(dir = %dir.display(), manifests = n, "task manifests loaded");
        }
        Ok(reg)
    }

    /// Later registrations replace earlier ones with the same name.
    pub fn register(&mut self, task: Arc<dyn TaskDefinition>) {
        debug!(task = task.name(), "register task");
        self.tasks.insert(task.name().to_string(), task);
    }

    pub fn extend(&mut self, fragment: TaskFragment) {
        for task in fragment {
            self.register(task);
        }
    }

    /// Load every `*.yaml`/`*.yml` manifest in `dir`, in file-name order.
    pub fn load_dir(&mut self, dir: &Path) -> TaskResult<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e == "yaml" || e == "yml")
            })
            .collect();
        paths.sort();
        for path in &paths {
            let task = ManifestTask::load(path)?;
            self.register(Arc::new(task));
        }
        Ok(paths.len())
    }

    pub fn get(&self, name: &str) -> TaskResult<Arc<dyn TaskDefinition>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::MissingTaskPlugin {
                name: name.to_string(),
                known: self.names().join(", "),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn TaskDefinition>)> {
        self.tasks.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_every_task() {
        let reg = TaskRegistry::builtin();
        for name in ["hcp_gambling", "two_step", "go_nogo", "mid", "risk_sensitive", "posner"] {
            assert!(reg.get(name).is_ok(), "missing {name}");
        }
    }

    #[test]
    fn unknown_task_lists_known_names() {
        let reg = TaskRegistry::builtin();
        match reg.get("stroop") {
            Err(TaskError::MissingTaskPlugin { name, known }) => {
                assert_eq!(name, "stroop");
                assert!(known.contains("two_step"));
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("stroop should not exist"),
        }
    }

    #[test]
    fn every_builtin_assembles() {
        let reg = TaskRegistry::builtin();
        for (name, task) in reg.iter() {
            let schedule = task.get_configs("1", 0).unwrap();
            schedule.validate().unwrap();
            let bundle = task
                .get_task(&schedule.condition_dict, WindowSize::default(), 0)
                .unwrap();
            assert!(!bundle.keys.is_empty(), "{name} has no keys");
            bundle.into_env(0).unwrap();
        }
    }

    #[test]
    fn debug_output_names_tasks() {
        let reg = TaskRegistry::builtin();
        let text = format!("{reg:?}");
        assert!(text.starts_with("TaskRegistry"));
        assert!(text.contains("\"posner\""));
        let task = reg.get("mid").unwrap();
        assert!(format!("{task:?}").contains("\"mid\""));
    }

    #[test]
    fn schedule_seed_depends_on_set() {
        assert_ne!(schedule_seed(1, "1"), schedule_seed(1, "2"));
        assert_eq!(schedule_seed(1, "1"), schedule_seed(1, "1"));
    }
}
