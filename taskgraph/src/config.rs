// src/config.rs
//
// Ambient per-run configuration.
//
// Everything a run needs that is not part of a task definition: frame pacing,
// reserved keys, acquisition timing, the reminder length, where output goes,
// and the seed. Values come from (highest precedence first):
// 1. CLI flags (applied by the binaries through the `with_*` setters)
// 2. TASKGRAPH_* environment variables
// 3. Defaults below

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{info, warn};

use crate::event_log::ReservedKeys;

pub const ENV_FRAME_RATE: &str = "TASKGRAPH_FRAME_RATE";
pub const ENV_KILL_KEY: &str = "TASKGRAPH_KILL_KEY";
pub const ENV_TRIGGER_KEY: &str = "TASKGRAPH_TRIGGER_KEY";
pub const ENV_TR: &str = "TASKGRAPH_TR";
pub const ENV_REMINDER_DURATION: &str = "TASKGRAPH_REMINDER_DURATION";
pub const ENV_OUTPUT_DIR: &str = "TASKGRAPH_OUTPUT_DIR";
pub const ENV_SEED: &str = "TASKGRAPH_SEED";

/// Who produces the actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// A human at a window, real time.
    Live,
    /// An agent, virtual time.
    Simulated,
}

impl RunMode {
    /// Stable lowercase name (used in logs and summaries).
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Live => "live",
            RunMode::Simulated => "simulated",
        }
    }

    /// Parse a mode name (case-insensitive). Returns None if unrecognised.
    pub fn parse(s: &str) -> Option<RunMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" | "human" => Some(RunMode::Live),
            "simulated" | "sim" | "agent" => Some(RunMode::Simulated),
            _ => None,
        }
    }
}

/// Where an effective value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Cli,
    Env,
    Default,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Cli => "cli",
            ConfigSource::Env => "env",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub mode: RunMode,
    /// Key polling rate during waits (Hz).
    pub frame_rate: f64,
    /// Closes the log and aborts the run.
    pub kill_key: String,
    /// Acquisition trigger (one press per TR).
    pub trigger_key: String,
    /// Expected spacing between triggers (s).
    pub tr_duration: f64,
    /// Length of the "respond faster" reminder (s).
    pub reminder_duration: f64,
    pub output_dir: PathBuf,
    pub seed: u64,
    pub seed_source: ConfigSource,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Simulated,
            frame_rate: 60.0,
            kill_key: "escape".to_string(),
            trigger_key: "5".to_string(),
            tr_duration: 2.0,
            reminder_duration: 1.0,
            output_dir: PathBuf::from("runs"),
            seed: 0,
            seed_source: ConfigSource::Default,
        }
    }
}

/// Parse `raw` for `name`; warn and keep `current` when it does not parse.
fn parse_override<T>(name: &str, raw: &str, current: T) -> (T, bool)
where
    T: FromStr + std::fmt::Debug,
{
    match raw.trim().parse::<T>() {
        Ok(v) => {
            info!(var = name, value = ?v, "config override from environment");
            (v, true)
        }
        Err(_) => {
            warn!(
                var = name,
                raw,
                default = ?current,
                "could not parse environment override; using default"
            );
            (current, false)
        }
    }
}

impl RunConfig {
    /// Defaults with TASKGRAPH_* environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| env::var(k).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(raw) = lookup(ENV_FRAME_RATE) {
            let (v, _) = parse_override(ENV_FRAME_RATE, &raw, cfg.frame_rate);
            if v > 0.0 && v.is_finite() {
                cfg.frame_rate = v;
            } else {
                warn!(var = ENV_FRAME_RATE, value = v, "frame rate must be positive; ignoring");
            }
        }
        if let Some(raw) = lookup(ENV_KILL_KEY).filter(|s| !s.trim().is_empty()) {
            cfg.kill_key = raw.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_TRIGGER_KEY).filter(|s| !s.trim().is_empty()) {
            cfg.trigger_key = raw.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_TR) {
            cfg.tr_duration = parse_override(ENV_TR, &raw, cfg.tr_duration).0;
        }
        if let Some(raw) = lookup(ENV_REMINDER_DURATION) {
            cfg.reminder_duration =
                parse_override(ENV_REMINDER_DURATION, &raw, cfg.reminder_duration).0;
        }
        if let Some(raw) = lookup(ENV_OUTPUT_DIR).filter(|s| !s.trim().is_empty()) {
            cfg.output_dir = PathBuf::from(raw.trim());
        }
        if let Some(raw) = lookup(ENV_SEED) {
            let (seed, ok) = parse_override(ENV_SEED, &raw, cfg.seed);
            cfg.seed = seed;
            if ok {
                cfg.seed_source = ConfigSource::Env;
            }
        }
        cfg
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// CLI seed; `None` keeps the env/default value.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        if let Some(s) = seed {
            self.seed = s;
            self.seed_source = ConfigSource::Cli;
        }
        self
    }

    pub fn with_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(d) = dir {
            self.output_dir = d;
        }
        self
    }

    pub fn frame_interval(&self) -> f64 {
        1.0 / self.frame_rate
    }

    pub fn reserved_keys(&self) -> ReservedKeys {
        ReservedKeys {
            kill_key: self.kill_key.clone(),
            trigger_key: self.trigger_key.clone(),
            tr_duration: self.tr_duration,
        }
    }

    /// Log the effective configuration once at startup.
    pub fn log_startup(&self) {
        info!(
            mode = self.mode.as_str(),
            frame_rate = self.frame_rate,
            kill_key = %self.kill_key,
            trigger_key = %self.trigger_key,
            tr_duration = self.tr_duration,
            reminder_duration = self.reminder_duration,
            output_dir = %self.output_dir.display(),
            seed = self.seed,
            seed_source = self.seed_source.as_str(),
            "effective run config"
        );
    }
}
