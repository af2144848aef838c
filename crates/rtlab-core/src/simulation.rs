//! Simulation setup and the real-time run loop.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};

use colored::Color;
use log::Level::Trace;
use log::{debug, info, log_enabled, trace};
use serde_json::json;
use serde_type_name::type_name;

use crate::context::SimulationContext;
use crate::error::SimulationError;
use crate::event::{EventData, EventId, Id};
use crate::handler::{EventCancellationPolicy, EventHandler};
use crate::log::{get_colored, log_undelivered_event};
use crate::pacer::{Pacer, WallClockPacer};
use crate::realtime::{ClockState, Injection, Injector, SyncStats, SLIP_TOLERANCE};
use crate::state::SimulationState;
use crate::Event;

type TeardownHook = Box<dyn FnOnce()>;

/// Event loop driven by a reference clock.
///
/// Components are registered before the run, then [`start()`](Self::start()), [`run_until()`](Self::run_until())
/// and [`destroy()`](Self::destroy()) move the clock through its states.
pub struct Simulation {
    sim_state: Rc<RefCell<SimulationState>>,
    handlers: Vec<Option<Rc<RefCell<dyn EventHandler>>>>,
    pacer: Box<dyn Pacer>,
    inbox: Receiver<Injection>,
    inbox_sender: Sender<Injection>,
    clock_state: ClockState,
    stats: SyncStats,
    teardown_hooks: Vec<(String, TeardownHook)>,
}

impl Simulation {
    /// Creates a new real-time simulation with specified random seed.
    pub fn new(seed: u64) -> Self {
        Self::with_pacer(seed, Box::new(WallClockPacer::new()))
    }

    /// Creates a new simulation with specified random seed and pacing policy.
    pub fn with_pacer(seed: u64, pacer: Box<dyn Pacer>) -> Self {
        let (inbox_sender, inbox) = mpsc::channel();
        Self {
            sim_state: Rc::new(RefCell::new(SimulationState::new(seed))),
            handlers: Vec::new(),
            pacer,
            inbox,
            inbox_sender,
            clock_state: ClockState::Stopped,
            stats: SyncStats::default(),
            teardown_hooks: Vec::new(),
        }
    }

    /// Replaces the pacing policy. Allowed only before the clock is started.
    pub fn set_pacer(&mut self, pacer: Box<dyn Pacer>) -> Result<(), SimulationError> {
        self.expect_state("replace pacer", ClockState::Stopped)?;
        self.pacer = pacer;
        Ok(())
    }

    /// Returns `true` if the simulation is paced by the wall clock.
    pub fn is_realtime(&self) -> bool {
        self.pacer.is_realtime()
    }

    /// Id registered for `name`, panics for an unknown component.
    pub fn lookup_id(&self, name: &str) -> Id {
        self.sim_state
            .borrow()
            .lookup_id(name)
            .unwrap_or_else(|| panic!("Component {} does not exist", name))
    }

    /// Name registered for `id`.
    pub fn lookup_name(&self, id: Id) -> String {
        self.sim_state.borrow().lookup_name(id)
    }

    /// Registers component `name` (or reuses its id) and returns a context for it.
    ///
    /// ```rust
    /// use rtlab_core::Simulation;
    ///
    /// let mut sim = Simulation::new(7);
    /// let hub = sim.create_context("hub");
    /// let tap = sim.create_context("tap");
    /// assert_eq!((hub.id(), tap.id()), (0, 1));
    /// assert_eq!(sim.create_context("hub").id(), 0);
    /// ```
    pub fn create_context<S>(&mut self, name: S) -> SimulationContext
    where
        S: AsRef<str>,
    {
        let id = self.sim_state.borrow_mut().register(name.as_ref());
        let ctx = SimulationContext::new(id, name.as_ref(), self.sim_state.clone());
        self.log_registry("context created", ctx.name(), ctx.id());
        ctx
    }

    /// Routes events addressed to `name` into `handler` and returns the component id.
    ///
    /// A component that already has a context keeps its id.
    pub fn add_handler<S>(&mut self, name: S, handler: Rc<RefCell<dyn EventHandler>>) -> Id
    where
        S: AsRef<str>,
    {
        let id = self.sim_state.borrow_mut().register(name.as_ref());
        if self.handlers.len() <= id as usize {
            self.handlers.resize_with(id as usize + 1, || None);
        }
        self.handlers[id as usize] = Some(handler);
        self.log_registry("handler added", name.as_ref(), id);
        id
    }

    /// Detaches the handler of `name` and cancels its pending events according to `cancel_policy`.
    ///
    /// Events delivered while no handler is attached are logged and dropped.
    pub fn remove_handler<S>(&mut self, name: S, cancel_policy: EventCancellationPolicy)
    where
        S: AsRef<str>,
    {
        let id = self.lookup_id(name.as_ref());
        if let Some(slot) = self.handlers.get_mut(id as usize) {
            *slot = None;
        }
        match cancel_policy {
            EventCancellationPolicy::Incoming => self.cancel_events(|e| e.dst == id),
            EventCancellationPolicy::Outgoing => self.cancel_events(|e| e.src == id),
            EventCancellationPolicy::All => self.cancel_events(|e| e.src == id || e.dst == id),
            EventCancellationPolicy::None => {}
        }
        self.log_registry("handler removed", name.as_ref(), id);
    }

    /// Current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.sim_state.borrow().time()
    }

    /// Returns the current time of the reference (wall) clock, in simulation time units.
    ///
    /// Equals zero until the clock is started.
    pub fn wall_time(&self) -> f64 {
        match self.clock_state {
            ClockState::Stopped => 0.,
            _ => self.pacer.elapsed(),
        }
    }

    /// Returns the state of the simulation clock.
    pub fn clock_state(&self) -> ClockState {
        self.clock_state
    }

    /// Returns the synchronization statistics collected so far.
    pub fn sync_stats(&self) -> SyncStats {
        let mut stats = self.stats.clone();
        stats.rejected_events = self.sim_state.borrow().rejected_count();
        stats
    }

    /// Creates an injector for delivering events from other threads on behalf of component `src`.
    pub fn injector(&self, src: Id) -> Injector {
        Injector::new(src, self.inbox_sender.clone())
    }

    /// Creates new event with specified payload, source and destination at the absolute simulation time.
    ///
    /// Panics if `time` is before the current simulation time.
    pub fn schedule_at<T>(&mut self, data: T, src: Id, dst: Id, time: f64) -> EventId
    where
        T: EventData,
    {
        self.sim_state.borrow_mut().add_event_at(data, src, dst, time)
    }

    /// Registers a function which is invoked when the simulation is destroyed.
    ///
    /// Hooks are invoked in reverse order of registration.
    pub fn on_destroy<S, F>(&mut self, name: S, hook: F)
    where
        S: AsRef<str>,
        F: FnOnce() + 'static,
    {
        self.teardown_hooks.push((name.as_ref().to_owned(), Box::new(hook)));
    }

    /// Number of events ever created, cancelled and rejected ones included.
    pub fn event_count(&self) -> u64 {
        self.sim_state.borrow().event_count()
    }

    /// Returns the number of pending events.
    pub fn pending_events(&self) -> usize {
        self.sim_state.borrow().pending_count()
    }

    /// Cancels every pending event matching `pred`.
    pub fn cancel_events<F>(&mut self, pred: F)
    where
        F: Fn(&Event) -> bool,
    {
        self.sim_state.borrow_mut().cancel_events(pred);
    }

    /// Dispatches the earliest pending event right away, ignoring the reference clock.
    ///
    /// The clock jumps to the event time. Returns `false` when the queue is empty.
    pub fn step(&mut self) -> bool {
        let event = match self.sim_state.borrow_mut().next_event() {
            Some(event) => event,
            None => return false,
        };
        if log_enabled!(Trace) {
            self.trace_dispatch(&event);
        }
        match self.handlers.get(event.dst as usize).cloned().flatten() {
            Some(handler) => handler.borrow_mut().on(event),
            None => log_undelivered_event(event),
        }
        true
    }

    fn trace_dispatch(&self, event: &Event) {
        let dst = self.lookup_name(event.dst);
        trace!(
            target: &dst,
            "[{:.3} {} {}] {}",
            event.time,
            get_colored("EVENT", Color::BrightBlack),
            dst,
            json!({
                "type": type_name(&event.data).unwrap_or("unknown"),
                "data": event.data,
                "src": self.lookup_name(event.src),
            })
        );
    }

    // Run control -----------------------------------------------------------------------------------------------------

    /// Starts the simulation clock.
    ///
    /// From this moment simulated time advances at the pace of the reference clock and components
    /// validate checksums of simulated packets.
    pub fn start(&mut self) -> Result<(), SimulationError> {
        self.expect_state("start", ClockState::Stopped)?;
        let now = self.time();
        self.sim_state.borrow_mut().enable_checksums();
        self.pacer.start(now);
        self.clock_state = ClockState::Running;
        info!(
            target: "simulation",
            "[{:.3} {}  simulation] Started {} clock",
            now,
            get_colored("INFO", Color::Green),
            if self.pacer.is_realtime() { "real-time" } else { "fast-forward" }
        );
        Ok(())
    }

    /// Runs the simulation until `stop_time`, then switches the clock to draining.
    ///
    /// Every event is held until the reference clock reaches its timestamp. Events that became overdue
    /// because processing fell behind are dispatched as soon as possible, the lag is recorded in the returned
    /// statistics. When the stop boundary is reached, the queue is sealed, outstanding events up to the boundary
    /// are flushed and the remaining ones are discarded.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde::Serialize;
    /// use rtlab_core::{ClockState, FastForwardPacer, Simulation};
    ///
    /// #[derive(Serialize)]
    /// pub struct Tick {}
    ///
    /// let mut sim = Simulation::with_pacer(123, Box::new(FastForwardPacer::new()));
    /// let ctx = sim.create_context("comp");
    /// ctx.emit_self(Tick {}, 1.0);
    /// ctx.emit_self(Tick {}, 7.0);
    /// sim.start().unwrap();
    /// let stats = sim.run_until(5.0).unwrap();
    /// assert_eq!(stats.dispatched_events, 1);
    /// assert_eq!(stats.discarded_events, 1);
    /// assert_eq!(sim.time(), 5.0);
    /// assert_eq!(sim.clock_state(), ClockState::Draining);
    /// ```
    pub fn run_until(&mut self, stop_time: f64) -> Result<SyncStats, SimulationError> {
        self.expect_state("run", ClockState::Running)?;
        if stop_time < self.time() {
            return Err(SimulationError::StopInPast {
                stop: stop_time,
                now: self.time(),
            });
        }
        loop {
            self.accept_pending_injections();
            let next_time = self.sim_state.borrow_mut().peek_time();
            let due = next_time.filter(|time| *time <= stop_time);
            if let Some(injection) = self.pacer.advance_to(due.unwrap_or(stop_time), &self.inbox) {
                self.accept_injection(injection);
                continue;
            }
            match due {
                Some(time) => self.dispatch_due(time),
                None => break,
            }
        }
        self.drain(stop_time);
        Ok(self.sync_stats())
    }

    /// Releases all components and runs the teardown hooks.
    ///
    /// This is the single teardown point of the simulation. It is allowed once, after the run
    /// (or instead of it, if the clock was never started).
    pub fn destroy(&mut self) -> Result<(), SimulationError> {
        match self.clock_state {
            ClockState::Draining | ClockState::Stopped => {}
            state => {
                return Err(SimulationError::InvalidTransition {
                    operation: "destroy",
                    state,
                })
            }
        }
        // replacing the channel closes the inbox for all existing injectors
        let (inbox_sender, inbox) = mpsc::channel();
        self.inbox_sender = inbox_sender;
        self.inbox = inbox;

        while let Some((name, hook)) = self.teardown_hooks.pop() {
            debug!(
                target: "simulation",
                "[{:.3} {} simulation] Running teardown hook: {}",
                self.time(),
                get_colored("DEBUG", Color::Blue),
                name
            );
            hook();
        }
        self.handlers.clear();
        self.sim_state.borrow_mut().discard_pending();
        self.clock_state = ClockState::Destroyed;
        info!(
            target: "simulation",
            "[{:.3} {}  simulation] Destroyed: {}",
            self.time(),
            get_colored("INFO", Color::Green),
            json!(self.sync_stats())
        );
        Ok(())
    }

    fn log_registry(&self, what: &str, name: &str, id: Id) {
        debug!(
            target: "simulation",
            "[{:.3} {} simulation] {}: {}",
            self.time(),
            get_colored("DEBUG", Color::Blue),
            what,
            json!({"component": name, "id": id})
        );
    }

    fn expect_state(&self, operation: &'static str, expected: ClockState) -> Result<(), SimulationError> {
        if self.clock_state != expected {
            return Err(SimulationError::InvalidTransition {
                operation,
                state: self.clock_state,
            });
        }
        Ok(())
    }

    fn dispatch_due(&mut self, time: f64) {
        let lag = (self.pacer.elapsed() - time).max(0.);
        if lag > SLIP_TOLERANCE && lag > self.stats.max_lag {
            debug!(
                target: "simulation",
                "[{:.3} {} simulation] Simulation lags behind the reference clock by {:.6}s",
                time,
                get_colored("DEBUG", Color::Blue),
                lag
            );
        }
        self.stats.record_dispatch(lag);
        self.step();
    }

    fn accept_pending_injections(&mut self) {
        while let Ok(injection) = self.inbox.try_recv() {
            self.accept_injection(injection);
        }
    }

    fn accept_injection(&mut self, injection: Injection) {
        // injected events happen "now", which is never before the current simulation time
        let time = self.pacer.elapsed().max(self.time());
        let data: Box<dyn EventData> = injection.data;
        self.sim_state
            .borrow_mut()
            .push_event(data, injection.src, injection.dst, time);
        self.stats.injected_events += 1;
    }

    fn drain(&mut self, stop_time: f64) {
        self.clock_state = ClockState::Draining;
        self.sim_state.borrow_mut().seal();
        let dropped_injections = self.inbox.try_iter().count();
        loop {
            let due = self
                .sim_state
                .borrow_mut()
                .peek_time()
                .map_or(false, |time| time <= stop_time);
            if !due {
                break;
            }
            self.stats.record_dispatch(0.);
            self.step();
        }
        let discarded = self.sim_state.borrow_mut().discard_pending();
        self.stats.discarded_events += (discarded + dropped_injections) as u64;
        self.sim_state.borrow_mut().freeze_at(stop_time);
        info!(
            target: "simulation",
            "[{:.3} {}  simulation] Stop time reached, draining: {}",
            stop_time,
            get_colored("INFO", Color::Green),
            json!({"discarded": self.stats.discarded_events, "max_lag": self.stats.max_lag})
        );
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(0)
    }
}
