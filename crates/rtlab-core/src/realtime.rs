//! Real-time synchronization state and the injection path for external input.

use std::fmt;
use std::sync::mpsc::Sender;

use serde::Serialize;

use crate::error::SimulationError;
use crate::event::{EventData, Id};

/// Lag (in seconds) above which a dispatched event is counted as late.
pub const SLIP_TOLERANCE: f64 = 1e-3;

/// State of the simulation clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ClockState {
    /// Clock is not started yet, components are being configured.
    Stopped,
    /// Events are dispatched in step with the reference clock.
    Running,
    /// Stop time is reached, the event queue no longer accepts events.
    Draining,
    /// All components are released.
    Destroyed,
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClockState::Stopped => "stopped",
            ClockState::Running => "running",
            ClockState::Draining => "draining",
            ClockState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Statistics of the synchronization between simulated and reference time.
///
/// Lag is the amount of time an event was dispatched after its timestamp was reached by the
/// reference clock. It grows when event processing can not keep pace with the wall clock.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncStats {
    /// Number of dispatched events.
    pub dispatched_events: u64,
    /// Number of events received through injectors.
    pub injected_events: u64,
    /// Number of events dispatched with lag above [`SLIP_TOLERANCE`].
    pub late_events: u64,
    /// Maximum observed lag.
    pub max_lag: f64,
    /// Sum of lags of all dispatched events.
    pub total_lag: f64,
    /// Number of events rejected after the stop time was reached.
    pub rejected_events: u64,
    /// Number of pending events (and injections) discarded at the stop boundary.
    pub discarded_events: u64,
}

impl SyncStats {
    /// Returns the mean lag of dispatched events.
    pub fn mean_lag(&self) -> f64 {
        if self.dispatched_events == 0 {
            0.
        } else {
            self.total_lag / self.dispatched_events as f64
        }
    }

    pub(crate) fn record_dispatch(&mut self, lag: f64) {
        self.dispatched_events += 1;
        self.total_lag += lag;
        if lag > SLIP_TOLERANCE {
            self.late_events += 1;
        }
        if lag > self.max_lag {
            self.max_lag = lag;
        }
    }
}

/// Event payload produced outside of the simulation thread.
pub struct Injection {
    /// Component the event is produced on behalf of.
    pub src: Id,
    /// Destination component.
    pub dst: Id,
    /// Event payload.
    pub data: Box<dyn EventData + Send>,
}

/// Handle for delivering events into a running simulation from other threads.
///
/// Injected events are scheduled at the current reference time (never before the current
/// simulation time) in the order they were injected.
#[derive(Clone)]
pub struct Injector {
    src: Id,
    sender: Sender<Injection>,
}

impl Injector {
    pub(crate) fn new(src: Id, sender: Sender<Injection>) -> Self {
        Self { src, sender }
    }

    /// Returns the identifier of component the events are injected on behalf of.
    pub fn src(&self) -> Id {
        self.src
    }

    /// Injects event with specified payload and destination.
    ///
    /// Fails with [`SimulationError::InboxClosed`] once the simulation is destroyed.
    pub fn inject<T>(&self, data: T, dst: Id) -> Result<(), SimulationError>
    where
        T: EventData + Send,
    {
        self.sender
            .send(Injection {
                src: self.src,
                dst,
                data: Box::new(data),
            })
            .map_err(|_| SimulationError::InboxClosed)
    }
}
