//! Pacing policies relating simulated time to a reference clock.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::realtime::Injection;

/// Decides when the event loop may advance to a given simulated time.
///
/// The event queue only knows the order of events, while the pacer knows how simulated time
/// relates to the reference clock. The real-time discipline is [`WallClockPacer`];
/// [`FastForwardPacer`] substitutes it where waiting is undesirable.
pub trait Pacer {
    /// Starts the reference clock at the specified simulation time.
    fn start(&mut self, at: f64);

    /// Returns the reference time, in simulation time units.
    fn elapsed(&self) -> f64;

    /// Blocks until the reference clock reaches `time`.
    ///
    /// Returns early with the injection if one arrives into `inbox` while waiting.
    /// Returns `None` once `time` is reached.
    fn advance_to(&mut self, time: f64, inbox: &Receiver<Injection>) -> Option<Injection>;

    /// Returns `true` if the reference clock is the wall clock.
    fn is_realtime(&self) -> bool;
}

// Wall clock ----------------------------------------------------------------------------------------------------------

/// Real-time pacing: one simulated second lasts one wall-clock second.
#[derive(Default)]
pub struct WallClockPacer {
    origin: Option<Instant>,
    offset: f64,
}

impl WallClockPacer {
    /// Creates a new pacer, the wall clock is read from [`Pacer::start`] on.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pacer for WallClockPacer {
    fn start(&mut self, at: f64) {
        self.origin = Some(Instant::now());
        self.offset = at;
    }

    fn elapsed(&self) -> f64 {
        self.offset + self.origin.map_or(0., |origin| origin.elapsed().as_secs_f64())
    }

    fn advance_to(&mut self, time: f64, inbox: &Receiver<Injection>) -> Option<Injection> {
        loop {
            let now = self.elapsed();
            if now >= time {
                return None;
            }
            let wait = Duration::from_secs_f64(time - now);
            match inbox.recv_timeout(wait) {
                Ok(injection) => return Some(injection),
                // timeouts are re-checked against the clock
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(wait),
            }
        }
    }

    fn is_realtime(&self) -> bool {
        true
    }
}

// Fast forward --------------------------------------------------------------------------------------------------------

/// Pacing which jumps the reference clock straight to the requested time.
#[derive(Default)]
pub struct FastForwardPacer {
    now: f64,
}

impl FastForwardPacer {
    /// Creates a new pacer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pacer for FastForwardPacer {
    fn start(&mut self, at: f64) {
        self.now = at;
    }

    fn elapsed(&self) -> f64 {
        self.now
    }

    fn advance_to(&mut self, time: f64, inbox: &Receiver<Injection>) -> Option<Injection> {
        if let Ok(injection) = inbox.try_recv() {
            return Some(injection);
        }
        self.now = self.now.max(time);
        None
    }

    fn is_realtime(&self) -> bool {
        false
    }
}
