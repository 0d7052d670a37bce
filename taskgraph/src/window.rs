// src/window.rs
//
// The render-backend seam.
//
// The engine and the hooks never draw pixels; they hand a `Stimulus`
// description to a `Window` and poll it for key presses. Two backends ship
// with the crate:
// - ConsoleWindow:  prints stimuli to stdout and reads line-buffered keys from
//                   stdin on a background thread (interactive play).
// - ScriptedWindow: replays pre-timed key presses against a virtual clock
//                   (headless tests of the live path).

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, MonotonicClock, VirtualClock};

/// Window dimensions in pixels (layout hint for task definitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

impl FromStr for WindowSize {
    type Err = String;

    /// Parse `WIDTHxHEIGHT`, e.g. `1024x768`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w.parse().map_err(|e| format!("bad width {w:?}: {e}"))?;
        let height = h.parse().map_err(|e| format!("bad height {h:?}: {e}"))?;
        Ok(Self { width, height })
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Horizontal placement of a stimulus element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Center,
    Right,
}

/// Opaque description of what a hook wants on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct Stimulus {
    /// Hook or phase name (e.g. "fixation", "stage1-choice").
    pub label: String,
    /// Free text for the backend (card value, option names, outcome).
    pub text: String,
    pub side: Side,
}

impl Stimulus {
    pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: text.into(),
            side: Side::Center,
        }
    }

    pub fn at(mut self, side: Side) -> Self {
        self.side = side;
        self
    }
}

/// A key press with its timestamp on the logger's clock.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPress {
    pub key: String,
    pub time: f64,
}

/// Render backend interface.
pub trait Window {
    /// Queue a stimulus for the next flip.
    fn present(&mut self, stimulus: &Stimulus);

    /// Swap buffers (one frame).
    fn flip(&mut self);

    /// Drain the keyboard buffer.
    fn poll_keys(&mut self) -> Vec<KeyPress>;

    fn size(&self) -> WindowSize;
}

/// Terminal backend: stimuli are printed, keys are typed followed by Enter.
pub struct ConsoleWindow {
    size: WindowSize,
    clock: MonotonicClock,
    keys: Receiver<(String, Instant)>,
    pending: Vec<Stimulus>,
}

impl ConsoleWindow {
    /// `clock` must be the same clock the event logger uses.
    pub fn new(size: WindowSize, clock: MonotonicClock) -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let key = line.trim().to_string();
                if key.is_empty() {
                    continue;
                }
                if tx.send((key, Instant::now())).is_err() {
                    break;
                }
            }
        });
        Self {
            size,
            clock,
            keys: rx,
            pending: Vec::new(),
        }
    }
}

impl Window for ConsoleWindow {
    fn present(&mut self, stimulus: &Stimulus) {
        self.pending.push(stimulus.clone());
    }

    fn flip(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut out = io::stdout().lock();
        for s in self.pending.drain(..) {
            let _ = writeln!(out, "[{:?}] {}: {}", s.side, s.label, s.text);
        }
        let _ = out.flush();
    }

    fn poll_keys(&mut self) -> Vec<KeyPress> {
        let mut out = Vec::new();
        loop {
            match self.keys.try_recv() {
                Ok((key, at)) => out.push(KeyPress {
                    key,
                    time: self.clock.seconds_at(at),
                }),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    fn size(&self) -> WindowSize {
        self.size
    }
}

/// Headless backend replaying timed key presses.
///
/// Presses are delivered once the shared virtual clock reaches their time.
#[derive(Debug)]
pub struct ScriptedWindow {
    size: WindowSize,
    clock: VirtualClock,
    script: VecDeque<KeyPress>,
    presented: Vec<Stimulus>,
    flips: usize,
}

impl ScriptedWindow {
    pub fn new(clock: VirtualClock, presses: impl IntoIterator<Item = (f64, &'static str)>) -> Self {
        let mut script: Vec<KeyPress> = presses
            .into_iter()
            .map(|(time, key)| KeyPress {
                key: key.to_string(),
                time,
            })
            .collect();
        script.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self {
            size: WindowSize::default(),
            clock,
            script: script.into(),
            presented: Vec::new(),
            flips: 0,
        }
    }

    /// Every stimulus presented so far, in order.
    pub fn presented(&self) -> &[Stimulus] {
        &self.presented
    }

    pub fn flips(&self) -> usize {
        self.flips
    }
}

impl Window for ScriptedWindow {
    fn present(&mut self, stimulus: &Stimulus) {
        self.presented.push(stimulus.clone());
    }

    fn flip(&mut self) {
        self.flips += 1;
    }

    fn poll_keys(&mut self) -> Vec<KeyPress> {
        let now = self.clock.now();
        let mut out = Vec::new();
        while self.script.front().is_some_and(|k| k.time <= now) {
            if let Some(k) = self.script.pop_front() {
                out.push(k);
            }
        }
        out
    }

    fn size(&self) -> WindowSize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_window_size() {
        let s: WindowSize = "1024x768".parse().unwrap();
        assert_eq!(s, WindowSize { width: 1024, height: 768 });
        assert_eq!(s.to_string(), "1024x768");
        assert!("1024".parse::<WindowSize>().is_err());
    }

    #[test]
    fn scripted_window_releases_keys_on_time() {
        let mut clock = VirtualClock::new();
        let mut w = ScriptedWindow::new(clock.clone(), [(0.5, "left"), (0.2, "5")]);
        assert!(w.poll_keys().is_empty());
        clock.advance(0.3);
        let keys = w.poll_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key, "5");
        clock.advance(0.3);
        assert_eq!(w.poll_keys()[0].key, "left");
        assert!(w.poll_keys().is_empty());
    }
}
