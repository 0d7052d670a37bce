// src/trajectory.rs
//
// Offline transition reconstruction from an event log.
//
// The engine labels three kinds of rows: `obs` when a state is entered,
// `action` when a behavioural action is committed and `reward` when the
// transition's reward is emitted. Within a trial they interleave as
//
//   obs(s0) action(a0) reward(r0) obs(s1) action(a1) reward(r1) obs(s2) ...
//
// so every (obs, action, reward, obs) window is one transition. The last
// transition of a trial is terminal when the trial ended `completed`; trials
// that ended without a response keep their transitions non-terminal.

use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TaskResult;
use crate::event_log::{read_event_log, EventRecord, RlLabel};
use crate::graph::StateId;

/// Current trajectory format version.
/// Increment when changing the record schema.
pub const TRAJECTORY_VERSION: u32 = 1;

/// Single (s, a, r, s', terminal) transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub trial: usize,
    pub obs: StateId,
    /// Behavioural action (after any condition remap).
    pub action: usize,
    pub reward: f64,
    pub next_obs: StateId,
    pub terminal: bool,
}

/// All transitions of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub trial: usize,
    pub condition: Option<String>,
    /// `misc` of the trial's `trial-end` row, if it was reached.
    pub status: Option<String>,
    pub steps: Vec<TrajectoryRecord>,
}

impl Episode {
    fn new(trial: usize, condition: Option<String>) -> Self {
        Self {
            trial,
            condition,
            status: None,
            steps: Vec::new(),
        }
    }

    pub fn total_reward(&self) -> f64 {
        self.steps.iter().map(|s| s.reward).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("completed")
    }
}

/// Transition being assembled from consecutive labelled rows.
#[derive(Debug, Default)]
struct Pending {
    obs: Option<StateId>,
    action: Option<usize>,
    reward: Option<f64>,
}

/// Rebuild per-trial transitions from parsed log rows.
///
/// Rows without a trial number (pre-run triggers, breaks) are ignored.
pub fn reconstruct(records: &[EventRecord]) -> Vec<Episode> {
    let mut episodes: Vec<Episode> = Vec::new();
    let mut pending = Pending::default();

    for row in records {
        let Some(trial) = row.trial else { continue };
        if episodes.last().map(|e| e.trial) != Some(trial) {
            episodes.push(Episode::new(trial, row.trial_type.clone()));
            pending = Pending::default();
        }
        let Some(episode) = episodes.last_mut() else { continue };

        if row.event_type == "trial-end" {
            episode.status = row.misc.clone();
            if episode.is_complete() {
                if let Some(last) = episode.steps.last_mut() {
                    last.terminal = true;
                }
            }
            continue;
        }

        match row.rl_label {
            Some(RlLabel::Obs) => {
                let Some(next_obs) = row.current_location else { continue };
                if let Pending {
                    obs: Some(obs),
                    action: Some(action),
                    reward: Some(reward),
                } = pending
                {
                    episode.steps.push(TrajectoryRecord {
                        trial,
                        obs,
                        action,
                        reward,
                        next_obs,
                        terminal: false,
                    });
                }
                pending = Pending {
                    obs: Some(next_obs),
                    ..Pending::default()
                };
            }
            Some(RlLabel::Action) => pending.action = row.action,
            Some(RlLabel::Reward) => pending.reward = row.reward,
            None => {}
        }
    }
    episodes
}

/// Read a TSV event log and rebuild its transitions.
pub fn load_trajectories(path: &Path) -> TaskResult<Vec<Episode>> {
    Ok(reconstruct(&read_event_log(path)?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrajectoryHeader {
    trajectory_version: u32,
    episodes: usize,
    transitions: usize,
}

/// Write transitions as JSON lines, preceded by one metadata line.
pub fn write_jsonl<W: Write>(episodes: &[Episode], mut writer: W) -> io::Result<()> {
    let header = TrajectoryHeader {
        trajectory_version: TRAJECTORY_VERSION,
        episodes: episodes.len(),
        transitions: episodes.iter().map(|e| e.steps.len()).sum(),
    };
    writeln!(writer, "{}", serde_json::to_string(&header)?)?;
    for step in episodes.iter().flat_map(|e| &e.steps) {
        writeln!(writer, "{}", serde_json::to_string(step)?)?;
    }
    writer.flush()
}
