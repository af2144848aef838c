//! Simulation errors.

use thiserror::Error;

use crate::realtime::ClockState;

/// Errors reported by the simulation run controls.
#[derive(Debug, Error, PartialEq)]
pub enum SimulationError {
    /// Requested operation is not allowed in the current clock state.
    #[error("cannot {operation} while the simulation clock is {state}")]
    InvalidTransition {
        /// Attempted operation.
        operation: &'static str,
        /// Clock state at the time of the attempt.
        state: ClockState,
    },
    /// Stop time lies before the current simulation time.
    #[error("stop time {stop:.3} is before the current simulation time {now:.3}")]
    StopInPast {
        /// Requested stop time.
        stop: f64,
        /// Current simulation time.
        now: f64,
    },
    /// The simulation no longer accepts injected events.
    #[error("simulation inbox is closed")]
    InboxClosed,
}
