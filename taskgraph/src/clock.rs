// src/clock.rs
//
// Clocks behind the event logger.
//
// - MonotonicClock: wall time since construction; `advance` sleeps.
// - VirtualClock:   simulated time; `advance` moves it forward explicitly.
//   Clones share the same time so a scripted window and a logger agree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seconds-resolution clock used for every timestamp in the event log.
pub trait Clock: std::fmt::Debug {
    /// Seconds since the clock's origin. Never decreases.
    fn now(&self) -> f64;

    /// Let `dt` seconds pass.
    fn advance(&mut self, dt: f64);

    /// Whether time only moves through `advance`.
    fn is_virtual(&self) -> bool;
}

/// Real time measured from an `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Convert an `Instant` into this clock's seconds.
    pub fn seconds_at(&self, instant: Instant) -> f64 {
        instant.saturating_duration_since(self.origin).as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn advance(&mut self, dt: f64) {
        if dt > 0.0 && dt.is_finite() {
            std::thread::sleep(Duration::from_secs_f64(dt));
        }
    }

    fn is_virtual(&self) -> bool {
        false
    }
}

/// Simulated clock. Time is stored as f64 bits in a shared atomic.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    bits: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    /// Jump to `t` if it lies in the future; the clock never runs backwards.
    pub fn advance_to(&self, t: f64) {
        let now = f64::from_bits(self.bits.load(Ordering::SeqCst));
        if t > now {
            self.bits.store(t.to_bits(), Ordering::SeqCst);
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }

    fn advance(&mut self, dt: f64) {
        if dt > 0.0 && dt.is_finite() {
            let now = self.now();
            self.bits.store((now + dt).to_bits(), Ordering::SeqCst);
        }
    }

    fn is_virtual(&self) -> bool {
        true
    }
}
