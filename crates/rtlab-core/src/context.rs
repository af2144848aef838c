//! Component-side access to the simulation.

use std::cell::RefCell;
use std::rc::Rc;

use rand::distributions::uniform::{SampleRange, SampleUniform};

use crate::event::{EventData, EventId, Id};
use crate::state::SimulationState;

/// Handle through which a component reads the clock and schedules events.
///
/// Contexts share the simulation state, so they are cheap to hold and stay valid for the whole run.
pub struct SimulationContext {
    id: Id,
    name: String,
    sim_state: Rc<RefCell<SimulationState>>,
}

impl SimulationContext {
    pub(crate) fn new(id: Id, name: &str, sim_state: Rc<RefCell<SimulationState>>) -> Self {
        Self {
            id,
            name: name.to_owned(),
            sim_state,
        }
    }

    /// Id of the owning component.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Name of the owning component, also used as its log target.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.sim_state.borrow().time()
    }

    /// Uniform float in _[0, 1)_ from the seeded simulation-wide generator.
    pub fn rand(&self) -> f64 {
        self.sim_state.borrow_mut().rand()
    }

    /// Uniform value from `range`, drawn from the same generator as [`rand()`](Self::rand()).
    pub fn gen_range<T, R>(&self, range: R) -> T
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        self.sim_state.borrow_mut().gen_range(range)
    }

    /// Returns `true` once the clock is started: from then on packet checksums are verified on receipt.
    pub fn checksums_enabled(&self) -> bool {
        self.sim_state.borrow().checksums_enabled()
    }

    fn schedule<T>(&self, data: T, src: Id, dst: Id, delay: f64) -> EventId
    where
        T: EventData,
    {
        self.sim_state.borrow_mut().add_event(data, src, dst, delay)
    }

    /// Schedules `data` for component `dst` after `delay` units of simulation time.
    ///
    /// Panics if `delay` is negative. Events emitted after the stop time is reached are rejected,
    /// the returned identifier then refers to no pending event.
    pub fn emit<T>(&self, data: T, dst: Id, delay: f64) -> EventId
    where
        T: EventData,
    {
        self.schedule(data, self.id, dst, delay)
    }

    /// Same as [`emit()`](Self::emit()) with zero delay.
    pub fn emit_now<T>(&self, data: T, dst: Id) -> EventId
    where
        T: EventData,
    {
        self.schedule(data, self.id, dst, 0.)
    }

    /// Schedules `data` for this component itself, e.g. a timer.
    pub fn emit_self<T>(&self, data: T, delay: f64) -> EventId
    where
        T: EventData,
    {
        self.schedule(data, self.id, self.id, delay)
    }

    /// Same as [`emit_self()`](Self::emit_self()) with zero delay.
    pub fn emit_self_now<T>(&self, data: T) -> EventId
    where
        T: EventData,
    {
        self.schedule(data, self.id, self.id, 0.)
    }

    /// Schedules `data` on behalf of another component `src`.
    pub fn emit_as<T>(&self, data: T, src: Id, dst: Id, delay: f64) -> EventId
    where
        T: EventData,
    {
        self.schedule(data, src, dst, delay)
    }

    /// Schedules `data` for `dst` at the absolute simulation `time`, which must not be in the past.
    pub fn emit_at<T>(&self, data: T, dst: Id, time: f64) -> EventId
    where
        T: EventData,
    {
        self.sim_state.borrow_mut().add_event_at(data, self.id, dst, time)
    }

    /// Cancels a pending event, no-op if it was already dispatched.
    pub fn cancel_event(&self, id: EventId) {
        self.sim_state.borrow_mut().cancel_event(id);
    }

    /// Returns the name registered for component `id`.
    pub fn lookup_name(&self, id: Id) -> String {
        self.sim_state.borrow().lookup_name(id)
    }
}
