//! Pending event storage.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use crate::event::{Event, EventId};

// Heap entry, the earliest (time, id) pair is the greatest.
#[derive(Clone, Copy)]
struct Slot {
    time: f64,
    id: EventId,
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Slot {}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        other.time.total_cmp(&self.time).then(other.id.cmp(&self.id))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Events ordered by time, then by creation order.
///
/// Payloads live in a map keyed by event id, the heap only keeps (time, id) pairs.
/// Cancelling an event removes its payload; the stale heap slot is skipped later.
#[derive(Default)]
pub(crate) struct EventQueue {
    order: BinaryHeap<Slot>,
    events: BTreeMap<EventId, Event>,
}

impl EventQueue {
    pub fn push(&mut self, event: Event) {
        self.order.push(Slot {
            time: event.time,
            id: event.id,
        });
        self.events.insert(event.id, event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        while let Some(slot) = self.order.pop() {
            if let Some(event) = self.events.remove(&slot.id) {
                return Some(event);
            }
        }
        None
    }

    pub fn peek_time(&mut self) -> Option<f64> {
        while let Some(slot) = self.order.peek() {
            if self.events.contains_key(&slot.id) {
                return Some(slot.time);
            }
            self.order.pop();
        }
        None
    }

    pub fn cancel(&mut self, id: EventId) -> bool {
        self.events.remove(&id).is_some()
    }

    pub fn cancel_where<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&Event) -> bool,
    {
        let before = self.events.len();
        self.events.retain(|_, event| !pred(event));
        before - self.events.len()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.events.len();
        self.events.clear();
        self.order.clear();
        dropped
    }
}
