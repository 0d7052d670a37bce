// src/graph.rs
//
// Task graph: a directed acyclic graph of states, each with an outgoing
// edge descriptor.
//
// Descriptor forms:
// - Deterministic:  [s0, s1, ...]; action a routes to s_a.
// - Probabilistic:  ([s0, s1, ...], p); action a routes to s_a with
//                   probability p, otherwise to a uniformly chosen other entry.
// - Keyed:          {action -> target} with an optional skip flag; a skip node
//                   is traversed by the engine without soliciting an action.
// - Terminal:       no outgoing edges; terminals absorb.
//
// Invariants (checked at load time):
// - every target is itself a state of the graph;
// - probabilistic lists are non-empty and p lies in [0, 1];
// - the graph is acyclic, so every legal action sequence terminates.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};

/// State identifier.
pub type StateId = usize;

/// Outgoing edge descriptor of a single state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// No outgoing edges.
    Terminal,
    /// Action `a` routes to `targets[a]`.
    Deterministic(Vec<StateId>),
    /// Action `a` routes to `targets[a]` with probability `p`, otherwise to a
    /// uniformly random entry other than `targets[a]`.
    Probabilistic { targets: Vec<StateId>, p: f64 },
    /// Action key -> target. With `skip`, the engine chooses the key itself.
    Keyed {
        map: BTreeMap<usize, StateId>,
        #[serde(default)]
        skip: bool,
    },
}

impl Transition {
    pub fn keyed(pairs: impl IntoIterator<Item = (usize, StateId)>) -> Self {
        Transition::Keyed {
            map: pairs.into_iter().collect(),
            skip: false,
        }
    }

    pub fn skip(pairs: impl IntoIterator<Item = (usize, StateId)>) -> Self {
        Transition::Keyed {
            map: pairs.into_iter().collect(),
            skip: true,
        }
    }

    pub fn probabilistic(targets: Vec<StateId>, p: f64) -> Self {
        Transition::Probabilistic { targets, p }
    }

    /// Terminal states have an empty descriptor.
    pub fn is_terminal(&self) -> bool {
        match self {
            Transition::Terminal => true,
            Transition::Deterministic(t) => t.is_empty(),
            Transition::Probabilistic { targets, .. } => targets.is_empty(),
            Transition::Keyed { map, .. } => map.is_empty(),
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Transition::Keyed { skip: true, map } if !map.is_empty())
    }

    /// Every target mentioned by the descriptor, in action order.
    pub fn targets(&self) -> Vec<StateId> {
        match self {
            Transition::Terminal => Vec::new(),
            Transition::Deterministic(t) => t.clone(),
            Transition::Probabilistic { targets, .. } => targets.clone(),
            Transition::Keyed { map, .. } => map.values().copied().collect(),
        }
    }

    /// Legal action indices, ascending.
    pub fn legal_actions(&self) -> Vec<usize> {
        match self {
            Transition::Terminal => Vec::new(),
            Transition::Deterministic(t) => (0..t.len()).collect(),
            Transition::Probabilistic { targets, .. } => (0..targets.len()).collect(),
            Transition::Keyed { map, .. } => map.keys().copied().collect(),
        }
    }

    pub fn out_degree(&self) -> usize {
        match self {
            Transition::Terminal => 0,
            Transition::Deterministic(t) => t.len(),
            Transition::Probabilistic { targets, .. } => targets.len(),
            Transition::Keyed { map, .. } => map.len(),
        }
    }

    /// Route `action` to the next state. Returns `None` for an illegal action.
    pub fn route<R: Rng + ?Sized>(&self, action: usize, rng: &mut R) -> Option<StateId> {
        match self {
            Transition::Terminal => None,
            Transition::Deterministic(t) => t.get(action).copied(),
            Transition::Keyed { map, .. } => map.get(&action).copied(),
            Transition::Probabilistic { targets, p } => {
                let chosen = *targets.get(action)?;
                let u: f64 = rng.gen();
                if u < *p || targets.len() == 1 {
                    return Some(chosen);
                }
                let others: Vec<usize> = (0..targets.len()).filter(|&i| i != action).collect();
                let pick = match others.len() {
                    1 => others[0],
                    n => others[rng.gen_range(0..n)],
                };
                Some(targets[pick])
            }
        }
    }

    fn validate_shape(&self, state: StateId) -> TaskResult<()> {
        if let Transition::Probabilistic { targets, p } = self {
            if targets.is_empty() {
                return Err(TaskError::graph(format!(
                    "state {state}: probabilistic descriptor has no targets"
                )));
            }
            if !(0.0..=1.0).contains(p) || !p.is_finite() {
                return Err(TaskError::graph(format!(
                    "state {state}: transition probability {p} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Mapping from state id to outgoing descriptor.
///
/// Immutable once built; construction validates the structural invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<StateId, Transition>", into = "BTreeMap<StateId, Transition>")]
pub struct TaskGraph {
    states: BTreeMap<StateId, Transition>,
}

impl TryFrom<BTreeMap<StateId, Transition>> for TaskGraph {
    type Error = TaskError;

    fn try_from(states: BTreeMap<StateId, Transition>) -> TaskResult<Self> {
        TaskGraph::new(states)
    }
}

impl From<TaskGraph> for BTreeMap<StateId, Transition> {
    fn from(graph: TaskGraph) -> Self {
        graph.states
    }
}

impl TaskGraph {
    /// Build and validate a graph.
    pub fn new(states: BTreeMap<StateId, Transition>) -> TaskResult<Self> {
        let graph = Self { states };
        graph.validate(std::iter::empty())?;
        Ok(graph)
    }

    /// Build from `(state, descriptor)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (StateId, Transition)>) -> TaskResult<Self> {
        Self::new(pairs.into_iter().collect())
    }

    /// Validate the graph, optionally with extra (state, descriptor) edges
    /// that may replace the base descriptor at run time (transition overrides).
    pub fn validate<'a>(
        &self,
        overrides: impl IntoIterator<Item = (StateId, &'a Transition)>,
    ) -> TaskResult<()> {
        if self.states.is_empty() {
            return Err(TaskError::graph("graph has no states"));
        }
        let overrides: Vec<(StateId, &Transition)> = overrides.into_iter().collect();
        for (state, t) in self
            .states
            .iter()
            .map(|(s, t)| (*s, t))
            .chain(overrides.iter().copied())
        {
            if !self.states.contains_key(&state) {
                return Err(TaskError::graph(format!(
                    "override refers to unknown state {state}"
                )));
            }
            t.validate_shape(state)?;
            for target in t.targets() {
                if !self.states.contains_key(&target) {
                    return Err(TaskError::graph(format!(
                        "state {state} routes to unknown state {target}"
                    )));
                }
            }
        }
        self.check_acyclic(&overrides)
    }

    fn check_acyclic(&self, overrides: &[(StateId, &Transition)]) -> TaskResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut edges: BTreeMap<StateId, Vec<StateId>> = self
            .states
            .iter()
            .map(|(s, t)| (*s, t.targets()))
            .collect();
        for (state, t) in overrides {
            if let Some(e) = edges.get_mut(state) {
                e.extend(t.targets());
            }
        }

        let mut marks: BTreeMap<StateId, Mark> =
            self.states.keys().map(|s| (*s, Mark::Unvisited)).collect();

        for &root in self.states.keys() {
            if marks[&root] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS: (state, next child index).
            let mut stack: Vec<(StateId, usize)> = vec![(root, 0)];
            marks.insert(root, Mark::InProgress);
            while let Some((state, idx)) = stack.pop() {
                let children = &edges[&state];
                if idx < children.len() {
                    stack.push((state, idx + 1));
                    let child = children[idx];
                    match marks[&child] {
                        Mark::InProgress => {
                            return Err(TaskError::graph(format!(
                                "cycle detected through states {state} -> {child}"
                            )));
                        }
                        Mark::Unvisited => {
                            marks.insert(child, Mark::InProgress);
                            stack.push((child, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks.insert(state, Mark::Done);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, state: StateId) -> Option<&Transition> {
        self.states.get(&state)
    }

    pub fn contains(&self, state: StateId) -> bool {
        self.states.contains_key(&state)
    }

    pub fn is_terminal(&self, state: StateId) -> bool {
        self.states.get(&state).map_or(false, Transition::is_terminal)
    }

    pub fn is_skip(&self, state: StateId) -> bool {
        self.states.get(&state).map_or(false, Transition::is_skip)
    }

    pub fn legal_actions(&self, state: StateId) -> Vec<usize> {
        self.states
            .get(&state)
            .map(Transition::legal_actions)
            .unwrap_or_default()
    }

    /// Size of the action space: the maximum out-degree across states.
    pub fn n_actions(&self) -> usize {
        self.states
            .values()
            .map(Transition::out_degree)
            .max()
            .unwrap_or(0)
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn states(&self) -> impl Iterator<Item = (StateId, &Transition)> {
        self.states.iter().map(|(s, t)| (*s, t))
    }

    pub fn terminals(&self) -> Vec<StateId> {
        self.states
            .iter()
            .filter(|(_, t)| t.is_terminal())
            .map(|(s, _)| *s)
            .collect()
    }

    /// Length of the longest path from `start` to any terminal.
    ///
    /// Bounds the number of steps any legal action sequence can take.
    pub fn max_depth(&self, start: StateId) -> usize {
        fn depth(
            graph: &TaskGraph,
            state: StateId,
            memo: &mut BTreeMap<StateId, usize>,
        ) -> usize {
            if let Some(d) = memo.get(&state) {
                return *d;
            }
            let d = graph
                .get(state)
                .map(|t| {
                    t.targets()
                        .into_iter()
                        .map(|c| 1 + depth(graph, c, memo))
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            memo.insert(state, d);
            d
        }
        depth(self, start, &mut BTreeMap::new())
    }
}
