// src/output.rs
//
// Run output files.
//
// Each run directory holds:
// - the TSV event log;
// - run_summary.json: identity, seed, trial counts, final reward, and the
//   SHA-256 of the event log so two runs can be compared by digest alone.
//
// Creating the log never silently replaces an existing one: callers go
// through `ensure_can_write` first.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{RunConfig, RunMode};
use crate::error::{TaskError, TaskResult};
use crate::runner::{RunIdentity, RunStats};

/// Summary schema version.
pub const OUTPUT_SCHEMA_VERSION: u32 = 1;

pub const SUMMARY_FILE: &str = "run_summary.json";

/// Complete run summary written next to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: u32,
    pub task: String,
    pub stimulus_set: String,
    pub participant: String,
    pub run: String,
    pub session: String,
    pub seed: u64,
    pub mode: String,
    pub trials_completed: usize,
    pub trials_aborted: usize,
    pub breaks: usize,
    pub total_reward: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_target_duration: Option<f64>,
    /// File name of the event log, relative to the summary.
    pub event_log: String,
    /// Lowercase hex SHA-256 of the event log.
    pub event_log_sha256: String,
}

impl RunSummary {
    pub fn new(
        task: &str,
        stimulus_set: &str,
        identity: &RunIdentity,
        config: &RunConfig,
        stats: &RunStats,
        log_path: &Path,
    ) -> TaskResult<Self> {
        Ok(Self {
            schema_version: OUTPUT_SCHEMA_VERSION,
            task: task.to_string(),
            stimulus_set: stimulus_set.to_string(),
            participant: identity.participant.clone(),
            run: identity.run.clone(),
            session: identity.session.clone(),
            seed: config.seed,
            mode: config.mode.as_str().to_string(),
            trials_completed: stats.trials_completed,
            trials_aborted: stats.trials_aborted,
            breaks: stats.breaks,
            total_reward: stats.total_reward,
            final_target_duration: stats.final_target_duration,
            event_log: log_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            event_log_sha256: sha256_file(log_path)?,
        })
    }

    pub fn is_simulated(&self) -> bool {
        RunMode::parse(&self.mode) == Some(RunMode::Simulated)
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> TaskResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self).map_err(std::io::Error::from)?;
        Ok(())
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> TaskResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader).map_err(std::io::Error::from)?)
    }
}

/// Event log file name for one run.
pub fn events_file_name(task: &str, identity: &RunIdentity) -> String {
    format!(
        "sub-{}_ses-{}_task-{}_run-{}_events.tsv",
        identity.participant, identity.session, task, identity.run
    )
}

/// Run directory: `<base>/<task>/sub-<participant>/`.
pub fn run_dir(base: &Path, task: &str, identity: &RunIdentity) -> PathBuf {
    base.join(task).join(format!("sub-{}", identity.participant))
}

/// Create the run directory and return it.
pub fn create_run_dir(base: &Path, task: &str, identity: &RunIdentity) -> TaskResult<PathBuf> {
    let path = run_dir(base, task, identity);
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Refuse to reuse an existing output file unless forced or confirmed.
///
/// `confirm` is only consulted when the file exists and `force` is off.
pub fn ensure_can_write(
    path: &Path,
    force: bool,
    confirm: impl FnOnce(&Path) -> bool,
) -> TaskResult<()> {
    if !path.exists() || force || confirm(path) {
        return Ok(());
    }
    Err(TaskError::OverwriteRefused {
        path: path.display().to_string(),
    })
}

/// SHA-256 of a file using streaming reads, lowercase hex.
pub fn sha256_file(path: &Path) -> TaskResult<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// SHA-256 of in-memory bytes, lowercase hex.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex_encode(&Sha256::digest(bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
