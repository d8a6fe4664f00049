//! Session clock.
//!
//! The relay owns the authoritative clock: seconds since the session started.
//! Clients keep a local monotonic clock plus an offset estimated during the
//! handshake, so that snapshot send times are comparable across peers.

use std::time::Instant;

/// Source of authoritative session time, in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Monotonic clock with an additive offset toward the session clock.
#[derive(Debug, Clone)]
pub struct SessionClock {
    origin: Instant,
    offset: f64,
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionClock {
    /// Starts a clock reading zero now. The relay uses this directly.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: 0.0,
        }
    }

    /// Seconds since this clock was created, without offset.
    pub fn local(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Aligns this clock to a remote reading taken somewhere between
    /// `sent_local` and `received_local` (both from [`SessionClock::local`]).
    ///
    /// Assumes symmetric transit, so the remote reading maps to the midpoint.
    pub fn align(&mut self, sent_local: f64, received_local: f64, remote_now: f64) {
        let midpoint = (sent_local + received_local) * 0.5;
        self.offset = remote_now - midpoint;
    }
}

impl Clock for SessionClock {
    fn now(&self) -> f64 {
        self.local() + self.offset
    }
}

/// Manually advanced clock for deterministic tests and offline simulation.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: f64,
}

impl ManualClock {
    pub fn new(now: f64) -> Self {
        Self { now }
    }

    pub fn advance(&mut self, secs: f64) {
        self.now += secs;
    }

    pub fn set(&mut self, now: f64) {
        self.now = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_uses_transit_midpoint() {
        let mut clock = SessionClock::new();
        clock.align(1.0, 1.2, 10.0);
        assert!((clock.offset() - 8.9).abs() < 1e-9);
    }

    #[test]
    fn session_clock_is_monotonic() {
        let clock = SessionClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances() {
        let mut clock = ManualClock::new(2.0);
        clock.advance(0.5);
        assert_eq!(clock.now(), 2.5);
    }
}
