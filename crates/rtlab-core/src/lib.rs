#![warn(missing_docs)]
#![doc = include_str!("../readme.md")]

pub mod context;
pub mod error;
pub mod event;
pub mod handler;
pub mod log;
pub mod pacer;
mod queue;
pub mod realtime;
pub mod simulation;
mod state;

pub use colored;
pub use context::SimulationContext;
pub use error::SimulationError;
pub use event::{Event, EventData, EventId, Id};
pub use handler::{EventCancellationPolicy, EventHandler};
pub use pacer::{FastForwardPacer, Pacer, WallClockPacer};
pub use realtime::{ClockState, Injection, Injector, SyncStats};
pub use simulation::Simulation;
pub use state::EPSILON;
