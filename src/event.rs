/* Copyright © 2018 Gianmarco Garrisi

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>. */

//! Event state and the schedule queue.
//!
//! Events live in an arena owned by the [`Simulation`](crate::Simulation)
//! and are addressed by [`EventId`]. An event records whether its outcome
//! was decided (`triggered`), whether its callbacks already ran
//! (`processed`), whether the outcome was a success (`ok`), the value or
//! fault it carries and the ordered list of one-shot subscribers.
//! Subscribers are stored as plain enum values, not closures capturing the
//! event, so no reference cycle can form between an event, a process and
//! the simulation that owns both.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::error::{Error, Result};
use crate::simulation::Simulation;
use crate::{EventId, Priority, ProcessId};

/// The cause carried by a failed event.
///
/// A fault travels to the waiters of the event and, when the waiter is a
/// process, sets its pending-fault flag: the process must acknowledge it
/// with [`Simulation::handle_fault`] before yielding again, or terminate.
#[derive(Debug, Clone)]
pub enum Fault<T> {
    /// The event was failed explicitly through [`Simulation::fail`], with
    /// an optional payload describing the failure.
    Failed(Option<T>),
    /// The waiting process was interrupted by another process.
    Interrupted(Option<T>),
    /// The waiting process was evicted from a preemptive resource.
    Preempted {
        /// Process whose request caused the eviction, if the request was
        /// submitted from inside a process.
        by: Option<ProcessId>,
        /// Simulation time at which the evicted request had been granted.
        usage_since: f64,
    },
    /// A still-waiting resource request was withdrawn.
    Canceled,
}

/// Token returned by [`Simulation::add_callback`], used to unsubscribe.
pub type CallbackId = u64;

/// A one-shot subscriber of an event.
pub(crate) enum Callback<T> {
    /// Resume the process waiting on this event.
    Resume(ProcessId),
    /// Re-evaluate the condition event that has this event as a child.
    Evaluate(EventId),
    /// Record the event value as the run's stop value.
    Stop,
    /// User callback registered through `add_callback`.
    Hook {
        id: CallbackId,
        f: Box<dyn FnOnce(&Simulation<T>, EventId)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConditionKind {
    All,
    Any,
}

pub(crate) struct ConditionState {
    pub(crate) kind: ConditionKind,
    pub(crate) children: Vec<EventId>,
    /// Children that had been processed when the condition fired, in
    /// child order. Filled exactly once.
    pub(crate) fired: Vec<EventId>,
}

/// Arena slot for one event.
pub(crate) struct EventState<T> {
    pub(crate) triggered: bool,
    pub(crate) processed: bool,
    pub(crate) ok: bool,
    pub(crate) value: Option<T>,
    pub(crate) fault: Option<Fault<T>>,
    pub(crate) callbacks: Vec<Callback<T>>,
    pub(crate) condition: Option<ConditionState>,
}

impl<T> EventState<T> {
    pub(crate) fn new() -> Self {
        EventState {
            triggered: false,
            processed: false,
            ok: true,
            value: None,
            fault: None,
            callbacks: Vec::new(),
            condition: None,
        }
    }
}

/// Reserved insertion index that makes an entry the first one processed
/// among all entries with the same timestamp.
pub(crate) const STOP_INDEX: i64 = -1;

/// One queued occurrence of an event.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub(crate) time: f64,
    pub(crate) priority: Priority,
    pub(crate) index: i64,
    pub(crate) event: EventId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        match self.time.partial_cmp(&other.time) {
            Some(o) => o
                .then_with(|| self.priority.cmp(&other.priority))
                .then_with(|| self.index.cmp(&other.index)),
            None => panic!("Event time was uncomparable. Maybe a NaN"),
        }
    }
}

/// Min-ordered queue of pending events, keyed by
/// `(time, priority, insertion index)`.
///
/// The monotonic insertion index guarantees FIFO processing among entries
/// scheduled for the same `(time, priority)` pair. Scheduling more work
/// while an entry is being processed never invalidates that entry: the
/// entry was popped before its event ran.
pub(crate) struct ScheduleQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_index: i64,
}

impl ScheduleQueue {
    pub(crate) fn new() -> Self {
        ScheduleQueue {
            heap: BinaryHeap::new(),
            next_index: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, time: f64, priority: Priority, event: EventId) {
        let index = self.next_index;
        self.next_index += 1;
        self.heap.push(Reverse(Entry {
            time,
            priority,
            index,
            event,
        }));
    }

    /// Enqueue a stop entry: minimum priority and the reserved index, so it
    /// is the first entry processed at `time`.
    pub(crate) fn enqueue_first(&mut self, time: f64, event: EventId) {
        self.heap.push(Reverse(Entry {
            time,
            priority: Priority::MIN,
            index: STOP_INDEX,
            event,
        }));
    }

    pub(crate) fn dequeue(&mut self) -> Result<Entry> {
        match self.heap.pop() {
            Some(Reverse(entry)) => Ok(entry),
            None => Err(Error::EmptySchedule),
        }
    }

    pub(crate) fn peek_time(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(entry)| entry.time)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.next_index = 0;
    }

    #[allow(dead_code)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.heap.iter().map(|Reverse(entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_among_equal_keys() {
        let mut q = ScheduleQueue::new();
        q.enqueue(1.0, 0, 10);
        q.enqueue(1.0, 0, 11);
        q.enqueue(1.0, 0, 12);
        assert_eq!(q.dequeue().unwrap().event, 10);
        assert_eq!(q.dequeue().unwrap().event, 11);
        assert_eq!(q.dequeue().unwrap().event, 12);
    }

    #[test]
    fn time_beats_priority_beats_index() {
        let mut q = ScheduleQueue::new();
        q.enqueue(2.0, -5, 1);
        q.enqueue(1.0, 7, 2);
        q.enqueue(1.0, 0, 3);
        assert_eq!(q.dequeue().unwrap().event, 3);
        assert_eq!(q.dequeue().unwrap().event, 2);
        assert_eq!(q.dequeue().unwrap().event, 1);
    }

    #[test]
    fn stop_entry_is_first_at_its_time() {
        let mut q = ScheduleQueue::new();
        q.enqueue(10.0, Priority::MIN, 1);
        q.enqueue(10.0, 0, 2);
        q.enqueue_first(10.0, 99);
        assert_eq!(q.dequeue().unwrap().event, 99);
        assert_eq!(q.dequeue().unwrap().event, 1);
        assert_eq!(q.dequeue().unwrap().event, 2);
    }

    #[test]
    fn dequeue_from_empty_fails() {
        let mut q = ScheduleQueue::new();
        assert!(matches!(q.dequeue(), Err(Error::EmptySchedule)));
    }

    #[test]
    fn peek_does_not_consume() {
        let mut q = ScheduleQueue::new();
        q.enqueue(3.5, 0, 1);
        assert_eq!(q.peek_time(), Some(3.5));
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().unwrap().time, 3.5);
        assert_eq!(q.peek_time(), None);
    }
}
