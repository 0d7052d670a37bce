// src/condition.rs
//
// Condition tags and the per-condition overrides consulted by the engine.
//
// A condition can play three independent roles, each kept in its own map:
// - start_overrides:      tag -> starting state (replaces the scheduled start)
// - action_remaps:        tag -> state -> (physical action -> environment action)
// - transition_overrides: tag -> state -> replacement outgoing descriptor
//
// The engine consults whichever map applies at each decision point.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::{StateId, Transition};

/// Label identifying a trial's experimental condition.
///
/// Tags are strings; integer tags are stored in their decimal form so that
/// `ConditionTag::from(1)` and `ConditionTag::from("1")` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "TagRepr", into = "String")]
pub struct ConditionTag(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum TagRepr {
    Int(i64),
    Text(String),
}

impl From<TagRepr> for ConditionTag {
    fn from(repr: TagRepr) -> Self {
        match repr {
            TagRepr::Int(v) => ConditionTag(v.to_string()),
            TagRepr::Text(s) => ConditionTag(s),
        }
    }
}

impl From<ConditionTag> for String {
    fn from(tag: ConditionTag) -> Self {
        tag.0
    }
}

impl ConditionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        ConditionTag(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the tag contains `needle` (used by the schedule's
    /// no-consecutive constraint, e.g. "unexpected").
    pub fn contains(&self, needle: &str) -> bool {
        self.0.contains(needle)
    }
}

impl fmt::Display for ConditionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConditionTag {
    fn from(s: &str) -> Self {
        ConditionTag(s.to_string())
    }
}

impl From<String> for ConditionTag {
    fn from(s: String) -> Self {
        ConditionTag(s)
    }
}

impl From<i64> for ConditionTag {
    fn from(v: i64) -> Self {
        ConditionTag(v.to_string())
    }
}

impl From<i32> for ConditionTag {
    fn from(v: i32) -> Self {
        ConditionTag(v.to_string())
    }
}

impl From<usize> for ConditionTag {
    fn from(v: usize) -> Self {
        ConditionTag(v.to_string())
    }
}

/// Physical action index -> environment action index, for one state.
pub type ActionRemap = BTreeMap<usize, usize>;

/// The condition dictionary, split by role.
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionTable {
    /// Starting-state override per condition.
    #[serde(default)]
    pub start_overrides: BTreeMap<ConditionTag, StateId>,
    /// Per-condition, per-state action remap.
    #[serde(default)]
    pub action_remaps: BTreeMap<ConditionTag, BTreeMap<StateId, ActionRemap>>,
    /// Per-condition, per-state replacement outgoing descriptor.
    #[serde(default)]
    pub transition_overrides: BTreeMap<ConditionTag, BTreeMap<StateId, Transition>>,
}

impl ConditionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(mut self, tag: impl Into<ConditionTag>, state: StateId) -> Self {
        self.start_overrides.insert(tag.into(), state);
        self
    }

    pub fn with_remap(
        mut self,
        tag: impl Into<ConditionTag>,
        state: StateId,
        remap: ActionRemap,
    ) -> Self {
        self.action_remaps
            .entry(tag.into())
            .or_default()
            .insert(state, remap);
        self
    }

    pub fn with_transition(
        mut self,
        tag: impl Into<ConditionTag>,
        state: StateId,
        transition: Transition,
    ) -> Self {
        self.transition_overrides
            .entry(tag.into())
            .or_default()
            .insert(state, transition);
        self
    }

    pub fn start_for(&self, tag: &ConditionTag) -> Option<StateId> {
        self.start_overrides.get(tag).copied()
    }

    pub fn remap_for(&self, tag: &ConditionTag, state: StateId) -> Option<&ActionRemap> {
        self.action_remaps.get(tag).and_then(|m| m.get(&state))
    }

    pub fn transition_for(&self, tag: &ConditionTag, state: StateId) -> Option<&Transition> {
        self.transition_overrides
            .get(tag)
            .and_then(|m| m.get(&state))
    }

    /// Every state referenced by any override (used for graph validation).
    pub fn referenced_states(&self) -> Vec<StateId> {
        let mut out: Vec<StateId> = self.start_overrides.values().copied().collect();
        for per_state in self.action_remaps.values() {
            out.extend(per_state.keys().copied());
        }
        for per_state in self.transition_overrides.values() {
            for (state, transition) in per_state {
                out.push(*state);
                out.extend(transition.targets());
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Merge `other` into `self`; entries in `other` win.
    pub fn merge(&mut self, other: ConditionTable) {
        self.start_overrides.extend(other.start_overrides);
        for (tag, per_state) in other.action_remaps {
            self.action_remaps.entry(tag).or_default().extend(per_state);
        }
        for (tag, per_state) in other.transition_overrides {
            self.transition_overrides
                .entry(tag)
                .or_default()
                .extend(per_state);
        }
    }
}
