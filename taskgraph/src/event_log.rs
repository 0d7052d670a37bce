// src/event_log.rs
//
// Tab-separated event log.
//
// One header row, then one row per event, columns in the fixed order of
// `COLUMNS`; missing values are written as `n/a`. Rows are append-only and
// carry the logger's sticky per-trial fields (`TrialInfo`) so the log is
// self-contained.
//
// The same logger serves live and simulated runs: live runs use a
// `MonotonicClock` and a file sink, simulated runs a `VirtualClock` and an
// in-memory sink that can be saved afterwards. Live key handling
// (`key_strokes`, `wait`, `wait_for_key`) recognises three reserved cases:
// the kill-switch key, the acquisition trigger key, and stray keys.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, VirtualClock};
use crate::error::{TaskError, TaskResult};
use crate::graph::StateId;
use crate::window::{KeyPress, Window};

/// Column order of the event log.
pub const COLUMNS: [&str; 22] = [
    "onset",
    "duration",
    "trial_type",
    "start_position",
    "event_type",
    "response_time",
    "response_button",
    "response_late",
    "reward",
    "delta_reward",
    "trial",
    "TR",
    "task",
    "run",
    "participant_id",
    "expected_duration",
    "trial_time",
    "total_reward",
    "current_location",
    "misc",
    "rl_label",
    "action",
];

/// Token for missing values.
pub const NA: &str = "n/a";

/// Reinforcement-learning role of a row, used to rebuild (s, a, r, s').
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RlLabel {
    Obs,
    Action,
    Reward,
}

impl fmt::Display for RlLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RlLabel::Obs => "obs",
            RlLabel::Action => "action",
            RlLabel::Reward => "reward",
        })
    }
}

impl FromStr for RlLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "obs" => Ok(RlLabel::Obs),
            "action" => Ok(RlLabel::Action),
            "reward" => Ok(RlLabel::Reward),
            other => Err(format!("unknown rl_label {other:?}")),
        }
    }
}

/// One row of the log.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventRecord {
    pub onset: f64,
    pub duration: Option<f64>,
    pub trial_type: Option<String>,
    pub start_position: Option<StateId>,
    pub event_type: String,
    pub response_time: Option<f64>,
    pub response_button: Option<String>,
    pub response_late: Option<bool>,
    pub reward: Option<f64>,
    pub delta_reward: Option<f64>,
    pub trial: Option<usize>,
    pub tr: u32,
    pub task: Option<String>,
    pub run: Option<String>,
    pub participant_id: Option<String>,
    pub expected_duration: Option<f64>,
    pub trial_time: Option<f64>,
    pub total_reward: f64,
    pub current_location: Option<StateId>,
    pub misc: Option<String>,
    pub rl_label: Option<RlLabel>,
    pub action: Option<usize>,
}

fn fmt_time(v: f64) -> String {
    format!("{v:.4}")
}

fn fmt_opt<T: fmt::Display>(v: &Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => NA.to_string(),
    }
}

fn fmt_opt_time(v: Option<f64>) -> String {
    v.map(fmt_time).unwrap_or_else(|| NA.to_string())
}

/// Free text must not break the row structure.
fn sanitize(s: &str) -> String {
    s.replace(['\t', '\n', '\r'], " ")
}

impl EventRecord {
    /// Render as one TSV line (without newline).
    pub fn to_tsv_row(&self) -> String {
        let cells = [
            fmt_time(self.onset),
            fmt_opt_time(self.duration),
            fmt_opt(&self.trial_type.as_deref().map(sanitize)),
            fmt_opt(&self.start_position),
            sanitize(&self.event_type),
            fmt_opt_time(self.response_time),
            fmt_opt(&self.response_button.as_deref().map(sanitize)),
            fmt_opt(&self.response_late),
            fmt_opt(&self.reward),
            fmt_opt(&self.delta_reward),
            fmt_opt(&self.trial),
            self.tr.to_string(),
            fmt_opt(&self.task.as_deref().map(sanitize)),
            fmt_opt(&self.run.as_deref().map(sanitize)),
            fmt_opt(&self.participant_id.as_deref().map(sanitize)),
            fmt_opt_time(self.expected_duration),
            fmt_opt_time(self.trial_time),
            self.total_reward.to_string(),
            fmt_opt(&self.current_location),
            fmt_opt(&self.misc.as_deref().map(sanitize)),
            fmt_opt(&self.rl_label),
            fmt_opt(&self.action),
        ];
        cells.join("\t")
    }

    /// Parse one TSV line written by `to_tsv_row`.
    pub fn from_tsv_row(line: &str) -> Result<Self, String> {
        let cells: Vec<&str> = line.split('\t').collect();
        if cells.len() != COLUMNS.len() {
            return Err(format!(
                "expected {} columns, found {}",
                COLUMNS.len(),
                cells.len()
            ));
        }

        fn opt<T: FromStr>(cell: &str, col: &str) -> Result<Option<T>, String>
        where
            T::Err: fmt::Display,
        {
            if cell == NA {
                return Ok(None);
            }
            cell.parse::<T>()
                .map(Some)
                .map_err(|e| format!("column {col}: {e}"))
        }

        fn req<T: FromStr>(cell: &str, col: &str) -> Result<T, String>
        where
            T::Err: fmt::Display,
        {
            cell.parse::<T>().map_err(|e| format!("column {col}: {e}"))
        }

        let text = |cell: &str| (cell != NA).then(|| cell.to_string());

        Ok(Self {
            onset: req(cells[0], "onset")?,
            duration: opt(cells[1], "duration")?,
            trial_type: text(cells[2]),
            start_position: opt(cells[3], "start_position")?,
            event_type: cells[4].to_string(),
            response_time: opt(cells[5], "response_time")?,
            response_button: text(cells[6]),
            response_late: opt(cells[7], "response_late")?,
            reward: opt(cells[8], "reward")?,
            delta_reward: opt(cells[9], "delta_reward")?,
            trial: opt(cells[10], "trial")?,
            tr: req(cells[11], "TR")?,
            task: text(cells[12]),
            run: text(cells[13]),
            participant_id: text(cells[14]),
            expected_duration: opt(cells[15], "expected_duration")?,
            trial_time: opt(cells[16], "trial_time")?,
            total_reward: req(cells[17], "total_reward")?,
            current_location: opt(cells[18], "current_location")?,
            misc: text(cells[19]),
            rl_label: opt(cells[20], "rl_label")?,
            action: opt(cells[21], "action")?,
        })
    }
}

/// Per-event fields supplied by the caller of `log_event`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFields {
    pub event_type: String,
    pub expected_duration: Option<f64>,
    pub response_time: Option<f64>,
    pub response_button: Option<String>,
    pub response_late: Option<bool>,
    pub reward: Option<f64>,
    pub misc: Option<String>,
    pub rl_label: Option<RlLabel>,
    pub action: Option<usize>,
    /// Overrides the sticky `current_location` for this row only.
    pub current_location: Option<StateId>,
}

impl EventFields {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Self::default()
        }
    }

    pub fn expected(mut self, seconds: f64) -> Self {
        self.expected_duration = Some(seconds);
        self
    }

    pub fn response(mut self, rt: f64, button: impl Into<String>, late: bool) -> Self {
        self.response_time = Some(rt);
        self.response_button = Some(button.into());
        self.response_late = Some(late);
        self
    }

    pub fn reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward);
        self
    }

    pub fn misc(mut self, misc: impl Into<String>) -> Self {
        self.misc = Some(misc.into());
        self
    }

    pub fn label(mut self, label: RlLabel) -> Self {
        self.rl_label = Some(label);
        self
    }

    pub fn label_opt(mut self, label: Option<RlLabel>) -> Self {
        self.rl_label = label;
        self
    }

    pub fn action(mut self, action: usize) -> Self {
        self.action = Some(action);
        self
    }

    pub fn location(mut self, state: StateId) -> Self {
        self.current_location = Some(state);
        self
    }
}

/// Sticky columns, repeated on every row until changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialInfo {
    pub trial_type: Option<String>,
    pub start_position: Option<StateId>,
    pub trial: Option<usize>,
    pub current_location: Option<StateId>,
    pub task: Option<String>,
    pub run: Option<String>,
    pub participant_id: Option<String>,
}

impl TrialInfo {
    pub fn merge(&mut self, other: TrialInfo) {
        let TrialInfo {
            trial_type,
            start_position,
            trial,
            current_location,
            task,
            run,
            participant_id,
        } = other;
        if trial_type.is_some() {
            self.trial_type = trial_type;
        }
        if start_position.is_some() {
            self.start_position = start_position;
        }
        if trial.is_some() {
            self.trial = trial;
        }
        if current_location.is_some() {
            self.current_location = current_location;
        }
        if task.is_some() {
            self.task = task;
        }
        if run.is_some() {
            self.run = run;
        }
        if participant_id.is_some() {
            self.participant_id = participant_id;
        }
    }
}

/// Reserved keys and trigger timing.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservedKeys {
    pub kill_key: String,
    pub trigger_key: String,
    /// Expected spacing between acquisition triggers (s).
    pub tr_duration: f64,
}

impl Default for ReservedKeys {
    fn default() -> Self {
        Self {
            kill_key: "escape".to_string(),
            trigger_key: "5".to_string(),
            tr_duration: 2.0,
        }
    }
}

/// Append-only event logger.
#[derive(Debug)]
pub struct EventLogger {
    clock: Box<dyn Clock>,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    records: Vec<EventRecord>,
    info: TrialInfo,
    total_reward: f64,
    trial_start: f64,
    last_onset: f64,
    tr_count: u32,
    first_trigger: Option<f64>,
    keys: ReservedKeys,
    frame_interval: f64,
    closed: bool,
}

impl EventLogger {
    /// Open `path` in append mode; the header is written only if the file is
    /// new or empty.
    pub fn create(
        path: impl AsRef<Path>,
        clock: Box<dyn Clock>,
        keys: ReservedKeys,
        frame_rate: f64,
    ) -> TaskResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_empty = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if is_empty {
            writeln!(writer, "{}", COLUMNS.join("\t"))?;
            writer.flush()?;
        }
        debug!(path = %path.display(), "event log opened");

        let mut logger = Self::in_memory(clock, keys, frame_rate);
        logger.writer = Some(writer);
        logger.path = Some(path);
        Ok(logger)
    }

    /// Logger that keeps rows in memory only.
    pub fn in_memory(clock: Box<dyn Clock>, keys: ReservedKeys, frame_rate: f64) -> Self {
        let now = clock.now();
        Self {
            clock,
            writer: None,
            path: None,
            records: Vec::new(),
            info: TrialInfo::default(),
            total_reward: 0.0,
            trial_start: now,
            last_onset: now,
            tr_count: 0,
            first_trigger: None,
            keys,
            frame_interval: 1.0 / frame_rate.max(1.0),
            closed: false,
        }
    }

    /// Simulation logger: virtual clock, in-memory rows.
    ///
    /// Returns the clock so a scripted window can share it.
    pub fn simulated(keys: ReservedKeys) -> (Self, VirtualClock) {
        let clock = VirtualClock::new();
        (Self::in_memory(Box::new(clock.clone()), keys, 60.0), clock)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn is_virtual(&self) -> bool {
        self.clock.is_virtual()
    }

    /// Let `dt` seconds pass (virtual: jump; live: sleep).
    pub fn advance(&mut self, dt: f64) {
        self.clock.advance(dt);
    }

    /// Mark trial-local t = 0.
    pub fn set_trial_time(&mut self) {
        self.trial_start = self.clock.now();
    }

    pub fn trial_time(&self) -> f64 {
        self.clock.now() - self.trial_start
    }

    pub fn trial_info(&self) -> &TrialInfo {
        &self.info
    }

    /// Writable sticky fields.
    pub fn trial_info_mut(&mut self) -> &mut TrialInfo {
        &mut self.info
    }

    /// Merge sticky fields: every `Some` in `info` overwrites, `None` keeps
    /// the current value.
    pub fn update_trial_info(&mut self, info: TrialInfo) {
        self.info.merge(info);
    }

    pub fn total_reward(&self) -> f64 {
        self.total_reward
    }

    pub fn tr_count(&self) -> u32 {
        self.tr_count
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write one row.
    ///
    /// - `total_reward`: new cumulative reward; the change is stored in
    ///   `delta_reward` and the sticky total is updated.
    /// - `onset`: backdate the event; `duration = now - onset`. Onsets in the
    ///   future are rejected.
    pub fn log_event(
        &mut self,
        fields: EventFields,
        total_reward: Option<f64>,
        onset: Option<f64>,
    ) -> TaskResult<()> {
        if self.closed {
            return Err(TaskError::LogClosed);
        }
        let now = self.clock.now();
        let (onset, duration) = match onset {
            Some(t) if t > now + 1e-9 => {
                return Err(TaskError::LoggerOnsetInFuture { onset: t, now });
            }
            Some(t) => {
                // Keep onsets non-decreasing; the skew is folded into duration.
                let t = t.max(self.last_onset);
                (t, Some(now - t))
            }
            None => (now.max(self.last_onset), None),
        };
        self.last_onset = onset;

        let delta_reward = total_reward.map(|total| {
            let delta = total - self.total_reward;
            self.total_reward = total;
            delta
        });

        let record = EventRecord {
            onset,
            duration,
            trial_type: self.info.trial_type.clone(),
            start_position: self.info.start_position,
            event_type: fields.event_type,
            response_time: fields.response_time,
            response_button: fields.response_button,
            response_late: fields.response_late,
            reward: fields.reward,
            delta_reward,
            trial: self.info.trial,
            tr: self.tr_count,
            task: self.info.task.clone(),
            run: self.info.run.clone(),
            participant_id: self.info.participant_id.clone(),
            expected_duration: fields.expected_duration,
            trial_time: self.info.trial.map(|_| onset - self.trial_start),
            total_reward: self.total_reward,
            current_location: fields.current_location.or(self.info.current_location),
            misc: fields.misc,
            rl_label: fields.rl_label,
            action: fields.action,
        };

        if let Some(w) = self.writer.as_mut() {
            writeln!(w, "{}", record.to_tsv_row())?;
            w.flush()?;
        }
        self.records.push(record);
        Ok(())
    }

    /// Poll the keyboard buffer.
    ///
    /// Presses of keys in `key_list` are returned with their press time. The
    /// reserved cases are handled here and never returned:
    /// - kill-switch: the log is closed and `RunAborted` is returned;
    /// - acquisition trigger: the TR counter is bumped and a `TR` row logged
    ///   with the expected-vs-observed skew;
    /// - anything else: logged as a stray `ButtonPress`.
    pub fn key_strokes(
        &mut self,
        window: &mut dyn Window,
        key_list: &[String],
    ) -> TaskResult<Vec<KeyPress>> {
        let mut accepted = Vec::new();
        for press in window.poll_keys() {
            if press.key == self.keys.kill_key {
                self.log_event(
                    EventFields::new("kill-switch").response(0.0, press.key.clone(), false),
                    None,
                    Some(press.time.min(self.now())),
                )?;
                self.close()?;
                return Err(TaskError::RunAborted { key: press.key });
            } else if press.key == self.keys.trigger_key {
                self.tr_count += 1;
                let first = *self.first_trigger.get_or_insert(press.time);
                let expected = first + f64::from(self.tr_count - 1) * self.keys.tr_duration;
                let skew = press.time - expected;
                if skew.abs() > self.keys.tr_duration / 2.0 {
                    warn!(tr = self.tr_count, skew, "acquisition trigger off schedule");
                }
                self.log_event(
                    EventFields::new("TR").misc(format!("expected={expected:.4};skew={skew:.4}")),
                    None,
                    Some(press.time.min(self.now())),
                )?;
            } else if key_list.iter().any(|k| *k == press.key) {
                accepted.push(press);
            } else {
                debug!(key = %press.key, "stray button press");
                self.log_event(
                    EventFields::new("ButtonPress").misc(format!("key={}", press.key)),
                    None,
                    Some(press.time.min(self.now())),
                )?;
            }
        }
        Ok(accepted)
    }

    /// Consume time until `start + duration`, polling keys every frame so
    /// triggers and strays are captured during stimulus display.
    pub fn wait(&mut self, window: &mut dyn Window, duration: f64, start: f64) -> TaskResult<()> {
        let end = start + duration;
        loop {
            self.key_strokes(window, &[])?;
            let now = self.now();
            if now >= end - 1e-12 {
                return Ok(());
            }
            window.flip();
            self.clock.advance(self.frame_interval.min(end - now));
        }
    }

    /// Wait up to `timeout` from `start` for a key in `key_list`.
    pub fn wait_for_key(
        &mut self,
        window: &mut dyn Window,
        key_list: &[String],
        timeout: f64,
        start: f64,
    ) -> TaskResult<Option<KeyPress>> {
        let end = start + timeout;
        loop {
            let mut keys = self.key_strokes(window, key_list)?;
            if !keys.is_empty() {
                return Ok(Some(keys.remove(0)));
            }
            let now = self.now();
            if now >= end - 1e-12 {
                return Ok(None);
            }
            window.flip();
            self.clock.advance(self.frame_interval.min(end - now));
        }
    }

    /// One frame past a closed response window: the first admitted press
    /// landing there is returned so it can be logged as late.
    pub fn late_key(
        &mut self,
        window: &mut dyn Window,
        key_list: &[String],
    ) -> TaskResult<Option<KeyPress>> {
        window.flip();
        self.clock.advance(self.frame_interval);
        let mut keys = self.key_strokes(window, key_list)?;
        Ok((!keys.is_empty()).then(|| keys.remove(0)))
    }

    /// Simulated response: advance by `min(rt, window)`.
    ///
    /// Returns the press time when the response lands inside the window.
    pub fn simulated_key_strokes(&mut self, rt: f64, window: f64) -> Option<f64> {
        let start = self.now();
        if rt.is_finite() && rt >= 0.0 && rt <= window {
            self.clock.advance(rt);
            Some(start + rt)
        } else {
            self.clock.advance(window);
            None
        }
    }

    /// Flush and close the file sink. Further `log_event` calls fail.
    pub fn close(&mut self) -> TaskResult<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }
        self.closed = true;
        Ok(())
    }

    /// Write every in-memory row to `path` (header included).
    pub fn save(&self, path: impl AsRef<Path>) -> TaskResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(self.to_tsv().as_bytes())?;
        w.flush()?;
        Ok(())
    }

    /// Header plus all rows as one string.
    pub fn to_tsv(&self) -> String {
        let mut out = COLUMNS.join("\t");
        out.push('\n');
        for r in &self.records {
            out.push_str(&r.to_tsv_row());
            out.push('\n');
        }
        out
    }
}

/// Parse a TSV event log from a string.
pub fn parse_event_log(contents: &str) -> TaskResult<Vec<EventRecord>> {
    let mut lines = contents.lines();
    let header = lines.next().unwrap_or_default();
    if header != COLUMNS.join("\t") {
        return Err(TaskError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "event log header does not match the expected columns",
        )));
    }
    let mut out = Vec::new();
    for (i, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = EventRecord::from_tsv_row(line).map_err(|e| {
            TaskError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("row {}: {e}", i + 1),
            ))
        })?;
        out.push(record);
    }
    Ok(out)
}

/// Read a TSV event log from disk.
pub fn read_event_log(path: &Path) -> TaskResult<Vec<EventRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut contents = String::new();
    for line in reader.lines() {
        contents.push_str(&line?);
        contents.push('\n');
    }
    parse_event_log(&contents)
}
