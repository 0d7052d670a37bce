// src/error.rs
//
// Error kinds shared by the engine, the logger, the schedule generator and
// the task registry.
//
// Policy:
// - InvalidCondition aborts the current trial only (the runner logs it).
// - LoggerOnsetInFuture is a programming error and aborts the run.
// - IllegalAction is never raised by `TaskEnv::step` (illegal actions are a
//   silent no-op there); it exists for explicit validation helpers.
// - MissingTaskPlugin / OverwriteRefused only happen before the first trial.

use thiserror::Error;

use crate::condition::ConditionTag;
use crate::graph::StateId;

/// Errors produced by the task-graph engine and its collaborators.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A conditional reward emitter received a tag outside its table.
    #[error("reward emitter has no outcome for condition '{condition}'")]
    InvalidCondition { condition: ConditionTag },

    /// `log_event` was asked to backdate an event to a time in the future.
    #[error("event onset {onset:.4}s is after the current clock time {now:.4}s")]
    LoggerOnsetInFuture { onset: f64, now: f64 },

    /// Action outside the legal set of the current state.
    #[error("action {action} is not legal in state {state} (legal: {legal:?})")]
    IllegalAction {
        state: StateId,
        action: usize,
        legal: Vec<usize>,
    },

    /// No task with this name was registered or discovered.
    #[error("no task plugin named '{name}' (known: {known})")]
    MissingTaskPlugin { name: String, known: String },

    /// The output file already exists and the operator declined to overwrite it.
    #[error("refusing to overwrite existing output '{path}'")]
    OverwriteRefused { path: String },

    /// The task graph violates a structural invariant.
    #[error("invalid task graph: {message}")]
    InvalidGraph { message: String },

    /// A terminal state has no reward emitter bound to it.
    #[error("terminal state {state} has no reward emitter")]
    MissingRewardEmitter { state: StateId },

    /// The kill-switch key was pressed; the log has been closed.
    #[error("run aborted by kill-switch key '{key}'")]
    RunAborted { key: String },

    /// An event was logged after the log was closed.
    #[error("event log is closed")]
    LogClosed,

    /// The trial schedule could not be generated or failed validation.
    #[error("schedule error in '{field}': {message}")]
    Schedule { field: String, message: String },

    /// A YAML task manifest could not be parsed or validated.
    #[error("task manifest '{path}': {message}")]
    Manifest { path: String, message: String },

    /// Underlying I/O failure (log file, manifests, summaries).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Build a schedule error for `field`.
    pub fn schedule(field: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Schedule {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build a graph validation error.
    pub fn graph(message: impl Into<String>) -> Self {
        TaskError::InvalidGraph {
            message: message.into(),
        }
    }

    /// Whether this error only invalidates the current trial.
    ///
    /// Everything else aborts the run.
    pub fn is_trial_local(&self) -> bool {
        matches!(self, TaskError::InvalidCondition { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type TaskResult<T> = Result<T, TaskError>;
