//! Task-graph execution engine for behavioural reinforcement-learning
//! experiments.
//!
//! A task is a finite acyclic graph of states. Each trial starts at a state
//! chosen by the trial's condition, walks the graph through the participant's
//! (or an agent's) actions, and ends at a terminal state whose reward emitter
//! pays out. Every step is recorded in a tab-separated event log that is
//! enough on its own to rebuild the (s, a, r, s') transitions offline.
//!
//! # Architecture
//!
//! - **Graph** (`graph`, `condition`): states, transition descriptors and the
//!   per-condition start / remap / transition overrides.
//! - **Rewards** (`reward`): constant, categorical, conditional and drifting
//!   emitters bound to terminal states.
//! - **Engine** (`engine`): Gym-style `reset` / `step` over one trial, playing
//!   the render hooks (`hooks`) attached to each state.
//! - **Event log** (`event_log`, `clock`, `window`): the TSV logger, its
//!   clocks and the render/keyboard seam.
//! - **Runner** (`runner`, `schedule`, `staircase`, `agent`): the per-trial
//!   loop over a frozen schedule, for humans or simulated agents.
//! - **Tasks** (`tasks`): the task-definition contract, built-in tasks and
//!   YAML manifests.
//! - **Offline** (`trajectory`, `output`): transition reconstruction and run
//!   summaries.
//!
//! Live and simulated runs go through the same code; only the clock and the
//! frontend differ.

pub mod agent;
pub mod clock;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod graph;
pub mod hooks;
pub mod output;
pub mod reward;
pub mod runner;
pub mod schedule;
pub mod staircase;
pub mod tasks;
pub mod trajectory;
pub mod window;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::{ConfigSource, RunConfig, RunMode};
pub use error::{TaskError, TaskResult};

pub use condition::{ActionRemap, ConditionTable, ConditionTag};
pub use graph::{StateId, TaskGraph, Transition};
pub use reward::{
    build_reward_table, CategoricalReward, ConditionalReward, DriftingReward, RewardSource,
    RewardSpec, RewardTable,
};

pub use engine::{Driver, HookTable, Responder, StepInfo, StepResult, TaskEnv};
pub use hooks::{
    ActionHook, CompositeHook, FeedbackHook, HookSpec, PassiveHook, RenderHook, SimResponse,
};

pub use clock::{Clock, MonotonicClock, VirtualClock};
pub use event_log::{EventFields, EventLogger, EventRecord, ReservedKeys, RlLabel};
pub use window::{ConsoleWindow, ScriptedWindow, Window, WindowSize};

pub use agent::{Agent, RandomAgent, ScriptedAgent};
pub use runner::{Frontend, RunIdentity, RunStats, TaskRunner, TrialStatus};
pub use schedule::{ScheduleBuilder, TrialSchedule};
pub use staircase::Staircase;

pub use tasks::{TaskBundle, TaskDefinition, TaskRegistry};

pub use output::RunSummary;
pub use trajectory::{reconstruct, Episode, TrajectoryRecord};
