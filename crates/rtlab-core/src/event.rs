//! Simulation events.

use downcast_rs::{impl_downcast, Downcast};
use serde::ser::Serialize;

/// Identifier of simulation component.
pub type Id = u32;

/// Event identifier, assigned sequentially starting from 0.
pub type EventId = u64;

/// Payload of an event.
///
/// Implemented for every serializable type, so any `#[derive(Serialize)]` struct can be emitted.
/// Payloads are recovered in handlers via downcasting, see [`cast!`](crate::cast).
pub trait EventData: Downcast + erased_serde::Serialize {}

impl_downcast!(EventData);

erased_serde::serialize_trait_object!(EventData);

impl<T: Serialize + 'static> EventData for T {}

/// Event scheduled for delivery to a component.
pub struct Event {
    #[allow(missing_docs)]
    pub id: EventId,
    /// Simulation time of delivery.
    pub time: f64,
    /// Emitting component.
    pub src: Id,
    /// Receiving component.
    pub dst: Id,
    #[allow(missing_docs)]
    pub data: Box<dyn EventData>,
}
