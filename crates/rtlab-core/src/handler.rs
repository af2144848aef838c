//! Event handlers and payload dispatch.

use crate::event::Event;

/// Component that reacts to events addressed to it.
pub trait EventHandler {
    /// Handles a single event, called by the simulation at the event time.
    ///
    /// ```rust
    /// use std::cell::RefCell;
    /// use std::rc::Rc;
    /// use serde::Serialize;
    /// use rtlab_core::{cast, Event, EventHandler, FastForwardPacer, Simulation};
    ///
    /// #[derive(Serialize)]
    /// pub struct Frame {
    ///     len: usize,
    /// }
    ///
    /// #[derive(Default)]
    /// pub struct ByteCounter {
    ///     bytes: usize,
    /// }
    ///
    /// impl EventHandler for ByteCounter {
    ///     fn on(&mut self, event: Event) {
    ///         cast!(match event.data {
    ///             Frame { len } => {
    ///                 self.bytes += len;
    ///             }
    ///         })
    ///     }
    /// }
    ///
    /// let mut sim = Simulation::with_pacer(1, Box::new(FastForwardPacer::new()));
    /// let wire = sim.create_context("wire");
    /// let counter = Rc::new(RefCell::new(ByteCounter::default()));
    /// let counter_id = sim.add_handler("counter", counter.clone());
    /// wire.emit(Frame { len: 60 }, counter_id, 0.5);
    /// wire.emit(Frame { len: 42 }, counter_id, 0.7);
    /// while sim.step() {}
    /// assert_eq!(counter.borrow().bytes, 102);
    /// ```
    fn on(&mut self, event: Event);
}

/// Dispatches an event by the type of its payload.
///
/// Each arm names a payload type and destructures it. Arms are tried in order, the first type the payload
/// downcasts to wins. Arms need not be exhaustive: a payload matching none of them is logged as unhandled
/// at the `ERROR` level.
#[macro_export]
macro_rules! cast {
    ( match $event:ident.data { $( $type:ident { $($tt:tt)* } => { $($expr:tt)* } )+ } ) => {
        'dispatch: {
            let __data = $event.data;
            $(
                let __data = match __data.downcast::<$type>() {
                    Ok(__value) => {
                        let $type { $($tt)* } = *__value;
                        { $($expr)* }
                        break 'dispatch;
                    }
                    Err(__data) => __data,
                };
            )+
            $crate::log::log_unhandled_event($crate::Event { data: __data, ..$event });
        }
    };
}

/// Pending events cancelled when a handler is removed.
pub enum EventCancellationPolicy {
    /// Events addressed to the component.
    Incoming,
    /// Events emitted by the component.
    Outgoing,
    /// Both directions.
    All,
    /// Nothing, pending events stay in the queue.
    None,
}
