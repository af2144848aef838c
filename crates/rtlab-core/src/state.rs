use std::collections::HashMap;

use rand::distributions::uniform::{SampleRange, SampleUniform};
use rand::prelude::*;
use rand_pcg::Pcg64;

use crate::event::{Event, EventData, EventId, Id};
use crate::log::{log_incorrect_event, log_rejected_event};
use crate::queue::EventQueue;

/// Tolerance used when comparing simulation times.
pub const EPSILON: f64 = 1e-12;

// Shared by the simulation and every component context.
pub struct SimulationState {
    clock: f64,
    rand: Pcg64,
    queue: EventQueue,
    next_event_id: EventId,
    // draining: the queue takes no more events
    sealed: bool,
    rejected: u64,
    checksums: bool,
    names: Vec<String>,
    ids: HashMap<String, Id>,
}

impl SimulationState {
    pub fn new(seed: u64) -> Self {
        Self {
            clock: 0.,
            rand: Pcg64::seed_from_u64(seed),
            queue: EventQueue::default(),
            next_event_id: 0,
            sealed: false,
            rejected: 0,
            checksums: false,
            names: Vec::new(),
            ids: HashMap::new(),
        }
    }

    // Components ------------------------------------------------------------------------------------------------------

    pub fn register(&mut self, name: &str) -> Id {
        if let Some(id) = self.lookup_id(name) {
            return id;
        }
        let id = self.names.len() as Id;
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), id);
        id
    }

    pub fn lookup_id(&self, name: &str) -> Option<Id> {
        self.ids.get(name).copied()
    }

    pub fn lookup_name(&self, id: Id) -> String {
        self.names.get(id as usize).cloned().unwrap_or_else(|| format!("#{}", id))
    }

    // Clock and randomness --------------------------------------------------------------------------------------------

    pub fn time(&self) -> f64 {
        self.clock
    }

    pub fn freeze_at(&mut self, time: f64) {
        self.clock = time;
    }

    pub fn rand(&mut self) -> f64 {
        self.rand.gen::<f64>()
    }

    pub fn gen_range<T, R>(&mut self, range: R) -> T
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        self.rand.gen_range(range)
    }

    pub fn checksums_enabled(&self) -> bool {
        self.checksums
    }

    pub fn enable_checksums(&mut self) {
        self.checksums = true;
    }

    // Events ----------------------------------------------------------------------------------------------------------

    pub fn add_event<T>(&mut self, data: T, src: Id, dst: Id, delay: f64) -> EventId
    where
        T: EventData,
    {
        if delay < -EPSILON {
            let event = self.make_event(Box::new(data), src, dst, self.clock + delay);
            log_incorrect_event(event, &format!("negative delay {}", delay));
            panic!("Event delay is negative, events can not be scheduled in the past");
        }
        self.push_event(Box::new(data), src, dst, self.clock + delay.max(0.))
    }

    pub fn add_event_at<T>(&mut self, data: T, src: Id, dst: Id, time: f64) -> EventId
    where
        T: EventData,
    {
        self.push_event(Box::new(data), src, dst, time)
    }

    pub fn push_event(&mut self, data: Box<dyn EventData>, src: Id, dst: Id, time: f64) -> EventId {
        if time < self.clock - EPSILON {
            let event = self.make_event(data, src, dst, time);
            log_incorrect_event(event, &format!("time {} is before current time {}", time, self.clock));
            panic!("Event time is in the past, events can not be scheduled in the past");
        }
        // rounding errors must not move the event before the clock
        let event = self.make_event(data, src, dst, time.max(self.clock));
        let id = event.id;
        if self.sealed {
            self.rejected += 1;
            log_rejected_event(event);
        } else {
            self.queue.push(event);
        }
        id
    }

    fn make_event(&mut self, data: Box<dyn EventData>, src: Id, dst: Id, time: f64) -> Event {
        let id = self.next_event_id;
        self.next_event_id += 1;
        Event {
            id,
            time,
            src,
            dst,
            data,
        }
    }

    pub fn next_event(&mut self) -> Option<Event> {
        let event = self.queue.pop()?;
        self.clock = event.time;
        Some(event)
    }

    pub fn peek_time(&mut self) -> Option<f64> {
        self.queue.peek_time()
    }

    pub fn cancel_event(&mut self, id: EventId) {
        self.queue.cancel(id);
    }

    pub fn cancel_events<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&Event) -> bool,
    {
        self.queue.cancel_where(pred)
    }

    pub fn event_count(&self) -> u64 {
        self.next_event_id
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    /// Drops all pending events, returns their number.
    pub fn discard_pending(&mut self) -> usize {
        self.queue.clear()
    }
}
