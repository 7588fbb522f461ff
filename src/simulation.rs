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

//! The simulation environment: virtual clock, schedule queue, event arena
//! and the run loop.
//!
//! [`Simulation`] is a cheap-to-clone handle over the state it owns.
//! Processes capture a clone of the handle so they can create timeouts,
//! request resources and compose conditions while they run; all of that
//! state lives in arenas inside the simulation and is addressed by plain
//! integer ids, so cloning the handle never duplicates simulation state.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::container::ContainerState;
use crate::error::{Error, Result};
use crate::event::{
    Callback, CallbackId, ConditionKind, ConditionState, EventState, Fault, ScheduleQueue,
};
use crate::process::ProcessState;
use crate::resources::Resource;
use crate::store::StoreState;
use crate::{ContainerId, EventId, Priority, ProcessId, ResourceId, StoreId};

/// Construction options for a [`Simulation`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Virtual time at which the clock starts.
    pub start: f64,
    /// Wall-clock instant corresponding to `start`.
    pub start_date: SystemTime,
    /// Wall duration of one unit of virtual time, used only to convert
    /// virtual timestamps for presentation.
    pub default_step: Duration,
    /// Seed of the simulation-owned random number generator.
    pub seed: u64,
    /// Enable the externally schedulable mode: [`Simulation::injector`]
    /// returns a handle other threads can use to trigger events and
    /// schedule work between steps.
    pub thread_safe: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            start: 0.0,
            start_date: UNIX_EPOCH,
            default_step: Duration::from_secs(1),
            seed: 0,
            thread_safe: false,
        }
    }
}

/// Specify which condition must be met for the simulation to stop.
#[derive(Debug, Clone, Copy)]
pub enum EndCondition {
    /// Run the simulation until a certain point in time is reached. The
    /// internal stop event is the first event processed at that time;
    /// events scheduled for the same instant stay in the queue.
    Time(f64),
    /// Run the simulation until there are no more events scheduled.
    NoEvents,
    /// Execute at most N steps of the simulation.
    NSteps(usize),
    /// Run the simulation until the given event has been processed, and
    /// return its value. If the event was already processed the run
    /// returns immediately.
    Event(EventId),
}

/// A state-change notification handed to the monitor callback.
#[derive(Debug, Clone)]
pub enum Sample {
    /// Number of granted requests of a resource.
    ResourceUsers {
        resource: ResourceId,
        users: usize,
        capacity: usize,
    },
    /// Number of requests waiting on a resource.
    ResourceQueue { resource: ResourceId, waiting: usize },
    /// Level of a container.
    ContainerLevel {
        container: ContainerId,
        level: f64,
        capacity: f64,
    },
    /// Number of items in a store.
    StoreCount {
        store: StoreId,
        items: usize,
        capacity: usize,
    },
}

/// Requests a stop of the run loop, checked between steps. Safe to use
/// from any thread.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, AtomicOrdering::SeqCst);
    }
}

pub(crate) enum Command<T> {
    Succeed {
        event: EventId,
        value: Option<T>,
    },
    Fail {
        event: EventId,
    },
    ScheduleAfter {
        delay: f64,
        event: EventId,
        priority: Priority,
    },
}

/// Handle for scheduling work from outside the simulation thread.
///
/// Available when the simulation was built with
/// [`Config::thread_safe`]. Commands are applied at the top of the next
/// step; a command referring to an event in an illegal state is discarded
/// with a warning rather than tearing down the sender.
pub struct Injector<T> {
    tx: Sender<Command<T>>,
}

impl<T> Clone for Injector<T> {
    fn clone(&self) -> Self {
        Injector {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Injector<T> {
    pub fn succeed(&self, event: EventId, value: Option<T>) -> Result<()> {
        self.send(Command::Succeed { event, value })
    }

    pub fn fail(&self, event: EventId) -> Result<()> {
        self.send(Command::Fail { event })
    }

    pub fn schedule_after(&self, delay: f64, event: EventId, priority: Priority) -> Result<()> {
        self.send(Command::ScheduleAfter {
            delay,
            event,
            priority,
        })
    }

    fn send(&self, command: Command<T>) -> Result<()> {
        self.tx.send(command).map_err(|_| {
            Error::InvalidOperation("the simulation this injector fed is gone".into())
        })
    }
}

pub(crate) struct Core<T> {
    pub(crate) now: f64,
    pub(crate) start: f64,
    pub(crate) start_date: SystemTime,
    pub(crate) default_step: Duration,
    pub(crate) queue: ScheduleQueue,
    pub(crate) events: Vec<EventState<T>>,
    pub(crate) processes: Vec<ProcessState<T>>,
    pub(crate) resources: Vec<Box<dyn Resource<T>>>,
    pub(crate) containers: Vec<ContainerState>,
    pub(crate) stores: Vec<StoreState<T>>,
    pub(crate) rng: SmallRng,
    pub(crate) active: Option<ProcessId>,
    pub(crate) processed: u64,
    pub(crate) request_seq: u64,
    pub(crate) callback_seq: CallbackId,
    pub(crate) running: bool,
    pub(crate) stop_value: Option<Option<T>>,
    pub(crate) stop_flag: Arc<AtomicBool>,
    pub(crate) inbox: Option<Receiver<Command<T>>>,
    pub(crate) injector_tx: Option<Sender<Command<T>>>,
    pub(crate) run_started: Option<Box<dyn FnMut(f64)>>,
    pub(crate) run_finished: Option<Box<dyn FnMut(f64)>>,
    pub(crate) monitor: Option<Box<dyn FnMut(f64, &Sample)>>,
    pub(crate) samples: Vec<(f64, Sample)>,
    pub(crate) log_sink: Option<Box<dyn Write>>,
}

impl<T: Clone + 'static> Core<T> {
    pub(crate) fn new_event(&mut self) -> EventId {
        let id = self.events.len();
        self.events.push(EventState::new());
        id
    }

    pub(crate) fn next_request_seq(&mut self) -> u64 {
        let seq = self.request_seq;
        self.request_seq += 1;
        seq
    }

    /// Decide the event's outcome as a success and schedule it.
    pub(crate) fn succeed_event(
        &mut self,
        event: EventId,
        value: Option<T>,
        priority: Priority,
    ) -> Result<()> {
        if self.events[event].triggered {
            return Err(Error::AlreadyTriggered(event));
        }
        let state = &mut self.events[event];
        state.triggered = true;
        state.ok = true;
        state.value = value;
        self.queue.enqueue(self.now, priority, event);
        Ok(())
    }

    /// Decide the event's outcome as a failure and schedule it.
    pub(crate) fn fail_event(
        &mut self,
        event: EventId,
        fault: Fault<T>,
        priority: Priority,
    ) -> Result<()> {
        if self.events[event].triggered {
            return Err(Error::AlreadyTriggered(event));
        }
        let state = &mut self.events[event];
        state.triggered = true;
        state.ok = false;
        state.fault = Some(fault);
        self.queue.enqueue(self.now, priority, event);
        Ok(())
    }

    /// Create an already-triggered event scheduled `delay` units from now.
    /// The caller validates the delay.
    pub(crate) fn new_timeout(
        &mut self,
        delay: f64,
        priority: Priority,
        value: Option<T>,
    ) -> EventId {
        let event = self.new_event();
        let state = &mut self.events[event];
        state.triggered = true;
        state.ok = true;
        state.value = value;
        let at = self.now + delay;
        self.queue.enqueue(at, priority, event);
        event
    }

    pub(crate) fn new_condition(&mut self, kind: ConditionKind, children: &[EventId]) -> EventId {
        let cond = self.new_event();
        self.events[cond].condition = Some(ConditionState {
            kind,
            children: children.to_vec(),
            fired: Vec::new(),
        });
        for &child in children {
            if !self.events[child].processed {
                self.events[child].callbacks.push(Callback::Evaluate(cond));
            }
        }
        // The predicate may hold right away, e.g. for an empty child list
        // or when every child already ran.
        self.evaluate_condition(cond)
            .expect("a fresh condition event cannot be triggered yet");
        cond
    }

    /// Re-check a condition's predicate over its children. Called once at
    /// construction and from the `Evaluate` callback of each child.
    pub(crate) fn evaluate_condition(&mut self, cond: EventId) -> Result<()> {
        if self.events[cond].triggered {
            return Ok(());
        }
        let (kind, children) = {
            let state = self.events[cond]
                .condition
                .as_ref()
                .expect("evaluate_condition on a plain event");
            (state.kind, state.children.clone())
        };
        let mut fired = 0usize;
        let mut fault = None;
        for &child in &children {
            let state = &self.events[child];
            if state.processed {
                if state.ok {
                    fired += 1;
                } else if fault.is_none() {
                    fault = Some(state.fault.clone().unwrap_or(Fault::Canceled));
                }
            }
        }
        if let Some(fault) = fault {
            self.detach_condition(cond, &children);
            return self.fail_event(cond, fault, 0);
        }
        let satisfied = match kind {
            ConditionKind::Any => children.is_empty() || fired >= 1,
            ConditionKind::All => fired == children.len(),
        };
        if satisfied {
            let snapshot: Vec<EventId> = children
                .iter()
                .copied()
                .filter(|&child| self.events[child].processed)
                .collect();
            if let Some(state) = self.events[cond].condition.as_mut() {
                state.fired = snapshot;
            }
            self.detach_condition(cond, &children);
            return self.succeed_event(cond, None, 0);
        }
        Ok(())
    }

    fn detach_condition(&mut self, cond: EventId, children: &[EventId]) {
        for &child in children {
            self.events[child]
                .callbacks
                .retain(|cb| !matches!(cb, Callback::Evaluate(c) if *c == cond));
        }
    }

    pub(crate) fn emit_sample(&mut self, sample: Sample) {
        if self.monitor.is_some() {
            self.samples.push((self.now, sample));
        }
    }
}

/// This struct provides the methods to create and run the simulation in a
/// single thread.
///
/// It provides methods to create events, processes and the finite
/// resources, containers and stores that must be shared among them.
///
/// See the crate-level documentation for more information about how the
/// simulation framework works.
pub struct Simulation<T = ()> {
    pub(crate) core: Rc<RefCell<Core<T>>>,
}

impl<T> Clone for Simulation<T> {
    fn clone(&self) -> Self {
        Simulation {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: Clone + 'static> Default for Simulation<T> {
    fn default() -> Self {
        Simulation::with_config(Config::default())
    }
}

impl<T: Clone + 'static> Simulation<T> {
    /// Create a new `Simulation` environment with the default [`Config`].
    pub fn new() -> Simulation<T> {
        Simulation::default()
    }

    /// Create a new `Simulation` environment from explicit options.
    pub fn with_config(config: Config) -> Simulation<T> {
        let (inbox, injector_tx) = if config.thread_safe {
            let (tx, rx) = channel();
            (Some(rx), Some(tx))
        } else {
            (None, None)
        };
        Simulation {
            core: Rc::new(RefCell::new(Core {
                now: config.start,
                start: config.start,
                start_date: config.start_date,
                default_step: config.default_step,
                queue: ScheduleQueue::new(),
                events: Vec::new(),
                processes: Vec::new(),
                resources: Vec::new(),
                containers: Vec::new(),
                stores: Vec::new(),
                rng: SmallRng::seed_from_u64(config.seed),
                active: None,
                processed: 0,
                request_seq: 0,
                callback_seq: 0,
                running: false,
                stop_value: None,
                stop_flag: Arc::new(AtomicBool::new(false)),
                inbox,
                injector_tx,
                run_started: None,
                run_finished: None,
                monitor: None,
                samples: Vec::new(),
                log_sink: None,
            })),
        }
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.core.borrow().now
    }

    /// Returns the time of the next scheduled event, or infinity when the
    /// schedule is empty.
    pub fn peek(&self) -> f64 {
        self.core.borrow().queue.peek_time().unwrap_or(f64::INFINITY)
    }

    /// Number of events processed since construction or the last
    /// [`reset`](Simulation::reset).
    pub fn processed_count(&self) -> u64 {
        self.core.borrow().processed
    }

    /// The process currently executing a step, if any.
    pub fn active_process(&self) -> Option<ProcessId> {
        self.core.borrow().active
    }

    /// The wall-clock instant corresponding to the current virtual time.
    pub fn now_as_date(&self) -> SystemTime {
        let core = self.core.borrow();
        core.start_date + core.default_step.mul_f64(core.now - core.start)
    }

    /// Run a closure against the simulation-owned random number generator.
    pub fn random<R>(&self, f: impl FnOnce(&mut SmallRng) -> R) -> R {
        f(&mut self.core.borrow_mut().rng)
    }

    // ---- events ----------------------------------------------------

    /// Create a fresh, untriggered event.
    pub fn create_event(&self) -> EventId {
        self.core.borrow_mut().new_event()
    }

    /// Create an event that is already triggered and will be processed
    /// after `delay` units of simulation time.
    pub fn timeout(&self, delay: f64) -> Result<EventId> {
        self.timeout_with(delay, 0, None)
    }

    /// [`timeout`](Simulation::timeout) with an explicit priority and a
    /// value carried to every subscriber.
    pub fn timeout_with(
        &self,
        delay: f64,
        priority: Priority,
        value: Option<T>,
    ) -> Result<EventId> {
        check_delay(delay)?;
        Ok(self.core.borrow_mut().new_timeout(delay, priority, value))
    }

    /// Decide the event's outcome as a success. The event is scheduled at
    /// the current time; its subscribers run when it is processed.
    pub fn succeed(&self, event: EventId) -> Result<()> {
        self.succeed_with(event, None, 0)
    }

    /// [`succeed`](Simulation::succeed) with a value and priority.
    pub fn succeed_with(&self, event: EventId, value: Option<T>, priority: Priority) -> Result<()> {
        self.core.borrow_mut().succeed_event(event, value, priority)
    }

    /// Decide the event's outcome as a failure carrying `cause`.
    pub fn fail(&self, event: EventId, cause: Option<T>) -> Result<()> {
        self.core
            .borrow_mut()
            .fail_event(event, Fault::Failed(cause), 0)
    }

    /// Subscribe a one-shot callback, run when the event is processed.
    /// Fails with [`Error::AlreadyProcessed`] once the callbacks of the
    /// event have been drained.
    pub fn add_callback(
        &self,
        event: EventId,
        f: impl FnOnce(&Simulation<T>, EventId) + 'static,
    ) -> Result<CallbackId> {
        let mut core = self.core.borrow_mut();
        if core.events[event].processed {
            return Err(Error::AlreadyProcessed(event));
        }
        core.callback_seq += 1;
        let id = core.callback_seq;
        core.events[event].callbacks.push(Callback::Hook {
            id,
            f: Box::new(f),
        });
        Ok(id)
    }

    /// Remove a callback added with [`add_callback`](Simulation::add_callback).
    /// Returns whether the callback was still subscribed.
    pub fn remove_callback(&self, event: EventId, id: CallbackId) -> Result<bool> {
        let mut core = self.core.borrow_mut();
        if core.events[event].processed {
            return Err(Error::AlreadyProcessed(event));
        }
        let before = core.events[event].callbacks.len();
        core.events[event]
            .callbacks
            .retain(|cb| !matches!(cb, Callback::Hook { id: i, .. } if *i == id));
        Ok(core.events[event].callbacks.len() != before)
    }

    pub fn is_triggered(&self, event: EventId) -> bool {
        self.core.borrow().events[event].triggered
    }

    pub fn is_processed(&self, event: EventId) -> bool {
        self.core.borrow().events[event].processed
    }

    pub fn is_ok(&self, event: EventId) -> bool {
        self.core.borrow().events[event].ok
    }

    /// The value carried by the event, if any was attached.
    pub fn value(&self, event: EventId) -> Option<T> {
        self.core.borrow().events[event].value.clone()
    }

    /// The fault carried by the event if it failed.
    pub fn fault_value(&self, event: EventId) -> Option<Fault<T>> {
        self.core.borrow().events[event].fault.clone()
    }

    // ---- conditions ------------------------------------------------

    /// An event that fires as soon as any child fires; fires immediately
    /// for an empty list. A failing child fails the condition.
    pub fn any_of(&self, children: &[EventId]) -> EventId {
        self.core
            .borrow_mut()
            .new_condition(ConditionKind::Any, children)
    }

    /// An event that fires once every child has fired. A failing child
    /// fails the condition.
    pub fn all_of(&self, children: &[EventId]) -> EventId {
        self.core
            .borrow_mut()
            .new_condition(ConditionKind::All, children)
    }

    /// The children of a condition that had fired (been processed) by the
    /// time the condition fired, in child order.
    pub fn fired_children(&self, cond: EventId) -> Vec<EventId> {
        self.core.borrow().events[cond]
            .condition
            .as_ref()
            .map(|state| state.fired.clone())
            .unwrap_or_default()
    }

    /// The `(child, value)` mapping of a fired condition.
    pub fn condition_value(&self, cond: EventId) -> Vec<(EventId, Option<T>)> {
        let core = self.core.borrow();
        core.events[cond]
            .condition
            .as_ref()
            .map(|state| {
                state
                    .fired
                    .iter()
                    .map(|&child| (child, core.events[child].value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- scheduling and the run loop -------------------------------

    /// Enqueue an untriggered event at the current time; it becomes
    /// triggered (successfully, without a value) when processed.
    pub fn schedule(&self, event: EventId, priority: Priority) -> Result<()> {
        self.schedule_after(0.0, event, priority)
    }

    /// Enqueue an untriggered event `delay` units from now.
    pub fn schedule_after(&self, delay: f64, event: EventId, priority: Priority) -> Result<()> {
        check_delay(delay)?;
        let mut core = self.core.borrow_mut();
        if core.events[event].triggered {
            return Err(Error::AlreadyTriggered(event));
        }
        let at = core.now + delay;
        core.queue.enqueue(at, priority, event);
        Ok(())
    }

    /// Proceed in the simulation by one step. Returns `false` when the
    /// schedule is empty.
    pub fn step(&self) -> Result<bool> {
        self.drain_inbox();
        let entry = {
            let mut core = self.core.borrow_mut();
            match core.queue.dequeue() {
                Ok(entry) => {
                    debug_assert!(entry.time >= core.now, "the clock must not run backwards");
                    core.now = entry.time;
                    entry
                }
                Err(Error::EmptySchedule) => return Ok(false),
                Err(other) => return Err(other),
            }
        };
        tracing::trace!(
            time = entry.time,
            event = entry.event,
            "processing event"
        );
        self.dispatch_event(entry.event)?;
        self.core.borrow_mut().processed += 1;
        self.flush_monitor();
        Ok(true)
    }

    /// Run the simulation until an ending condition is met.
    ///
    /// With [`EndCondition::Event`] the value of the stop event is
    /// returned; the other conditions return `None`. The hooks registered
    /// with [`on_run_started`](Simulation::on_run_started) and
    /// [`on_run_finished`](Simulation::on_run_finished) fire once per call.
    pub fn run(&self, until: EndCondition) -> Result<Option<T>> {
        {
            let mut core = self.core.borrow_mut();
            if core.running {
                return Err(Error::InvalidOperation(
                    "the simulation is already running".into(),
                ));
            }
            core.running = true;
            core.stop_value = None;
        }
        self.fire_run_hook(true);
        tracing::debug!(?until, "run started");
        let outcome = self.run_loop(until);
        self.core.borrow_mut().running = false;
        self.fire_run_hook(false);
        tracing::debug!("run finished");
        outcome
    }

    fn run_loop(&self, until: EndCondition) -> Result<Option<T>> {
        let mut remaining = None;
        let mut stop_event = None;
        match until {
            EndCondition::NoEvents => {}
            EndCondition::NSteps(n) => remaining = Some(n),
            EndCondition::Time(at) => {
                let mut core = self.core.borrow_mut();
                if !(at >= core.now) {
                    return Err(Error::InvalidArgument(format!(
                        "cannot run until {} which lies in the past of {}",
                        at, core.now
                    )));
                }
                let event = core.new_event();
                let state = &mut core.events[event];
                state.triggered = true;
                state.ok = true;
                state.callbacks.push(Callback::Stop);
                core.queue.enqueue_first(at, event);
            }
            EndCondition::Event(event) => {
                let mut core = self.core.borrow_mut();
                if core.events[event].processed {
                    return Ok(core.events[event].value.clone());
                }
                core.events[event].callbacks.push(Callback::Stop);
                stop_event = Some(event);
            }
        }
        loop {
            {
                let core = self.core.borrow();
                if core.stop_flag.load(AtomicOrdering::SeqCst) {
                    core.stop_flag.store(false, AtomicOrdering::SeqCst);
                    return Ok(None);
                }
            }
            if let Some(value) = self.core.borrow_mut().stop_value.take() {
                return Ok(value);
            }
            if remaining == Some(0) {
                return Ok(None);
            }
            if !self.step()? {
                if stop_event.is_some() {
                    return Err(Error::InvalidOperation(
                        "the schedule ran dry before the stop event fired".into(),
                    ));
                }
                return Ok(None);
            }
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
        }
    }

    /// A clonable handle that requests a stop of [`run`](Simulation::run),
    /// observed between steps. May be invoked from any thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.core.borrow().stop_flag),
        }
    }

    /// The external scheduling handle, present in thread-safe mode.
    pub fn injector(&self) -> Option<Injector<T>> {
        self.core
            .borrow()
            .injector_tx
            .as_ref()
            .map(|tx| Injector { tx: tx.clone() })
    }

    /// Rewind the clock to the start, clear the schedule, re-seed the
    /// random number generator and zero the processed-event count.
    /// Suspended process coroutines are dropped.
    pub fn reset(&self, seed: u64) {
        let dropped: Vec<_> = {
            let mut core = self.core.borrow_mut();
            core.now = core.start;
            core.queue.clear();
            core.rng = SmallRng::seed_from_u64(seed);
            core.processed = 0;
            core.stop_value = None;
            core.active = None;
            core.stop_flag.store(false, AtomicOrdering::SeqCst);
            core.processes
                .iter_mut()
                .filter_map(|process| process.gen.take())
                .collect()
        };
        // Coroutines may own resource guards that release on drop; the
        // core must not be borrowed while they unwind.
        drop(dropped);
    }

    // ---- hooks, monitor, log sink ----------------------------------

    /// Register a hook fired once at the beginning of every run.
    pub fn on_run_started(&self, f: impl FnMut(f64) + 'static) {
        self.core.borrow_mut().run_started = Some(Box::new(f));
    }

    /// Register a hook fired once at the end of every run.
    pub fn on_run_finished(&self, f: impl FnMut(f64) + 'static) {
        self.core.borrow_mut().run_finished = Some(Box::new(f));
    }

    /// Register the monitor callback receiving a [`Sample`] for every
    /// state change of a resource, container or store.
    pub fn set_monitor(&self, f: impl FnMut(f64, &Sample) + 'static) {
        self.core.borrow_mut().monitor = Some(Box::new(f));
    }

    /// Install the line-oriented sink written by [`log`](Simulation::log).
    pub fn set_log_sink(&self, sink: Box<dyn Write>) {
        self.core.borrow_mut().log_sink = Some(sink);
    }

    /// Write one line to the injected sink, verbatim. Does nothing when no
    /// sink is installed.
    pub fn log(&self, line: &str) {
        let mut core = self.core.borrow_mut();
        if let Some(sink) = core.log_sink.as_mut() {
            let _ = writeln!(sink, "{}", line);
        }
    }

    // ---- internals -------------------------------------------------

    /// Process one event: mark it processed, then drain its callbacks in
    /// insertion order. Untriggered events that were raw-scheduled become
    /// triggered successes here.
    pub(crate) fn dispatch_event(&self, event: EventId) -> Result<()> {
        let callbacks = {
            let mut core = self.core.borrow_mut();
            let state = &mut core.events[event];
            if state.processed {
                return Err(Error::AlreadyProcessed(event));
            }
            if !state.triggered {
                state.triggered = true;
                state.ok = true;
            }
            state.processed = true;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            match callback {
                Callback::Resume(process) => self.resume_process(process, event)?,
                Callback::Evaluate(cond) => self.core.borrow_mut().evaluate_condition(cond)?,
                Callback::Stop => {
                    let mut core = self.core.borrow_mut();
                    let value = core.events[event].value.clone();
                    core.stop_value = Some(value);
                }
                Callback::Hook { f, .. } => f(self, event),
            }
        }
        Ok(())
    }

    fn drain_inbox(&self) {
        let inbox = self.core.borrow_mut().inbox.take();
        let Some(inbox) = inbox else { return };
        while let Ok(command) = inbox.try_recv() {
            let outcome = match command {
                Command::Succeed { event, value } => {
                    self.core.borrow_mut().succeed_event(event, value, 0)
                }
                Command::Fail { event } => {
                    self.core.borrow_mut().fail_event(event, Fault::Failed(None), 0)
                }
                Command::ScheduleAfter {
                    delay,
                    event,
                    priority,
                } => self.schedule_after(delay, event, priority),
            };
            if let Err(err) = outcome {
                tracing::warn!(%err, "discarded external command");
            }
        }
        self.core.borrow_mut().inbox = Some(inbox);
    }

    fn fire_run_hook(&self, started: bool) {
        let (hook, time) = {
            let mut core = self.core.borrow_mut();
            let slot = if started {
                &mut core.run_started
            } else {
                &mut core.run_finished
            };
            (slot.take(), core.now)
        };
        if let Some(mut hook) = hook {
            hook(time);
            let mut core = self.core.borrow_mut();
            let slot = if started {
                &mut core.run_started
            } else {
                &mut core.run_finished
            };
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    /// Deliver buffered monitor samples. Runs with the core unborrowed so
    /// the callback may query the simulation.
    pub(crate) fn flush_monitor(&self) {
        loop {
            let (monitor, samples) = {
                let mut core = self.core.borrow_mut();
                if core.monitor.is_none() || core.samples.is_empty() {
                    return;
                }
                (core.monitor.take(), std::mem::take(&mut core.samples))
            };
            let mut monitor = monitor.expect("checked above");
            for (time, sample) in &samples {
                monitor(*time, sample);
            }
            let mut core = self.core.borrow_mut();
            if core.monitor.is_none() {
                core.monitor = Some(monitor);
            }
        }
    }
}

fn check_delay(delay: f64) -> Result<()> {
    if delay >= 0.0 && delay.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "delay must be finite and non-negative, got {}",
            delay
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> Simulation<u32> {
        Simulation::new()
    }

    #[test]
    fn clock_is_monotonic() {
        let s = sim();
        s.timeout(3.0).unwrap();
        s.timeout(1.0).unwrap();
        s.timeout(2.0).unwrap();
        let mut last = s.time();
        while s.step().unwrap() {
            assert!(s.time() >= last);
            last = s.time();
        }
        assert_eq!(s.time(), 3.0);
    }

    #[test]
    fn retriggering_is_rejected() {
        let s = sim();
        let e = s.create_event();
        s.succeed(e).unwrap();
        assert!(matches!(s.fail(e, None), Err(Error::AlreadyTriggered(_))));
        assert!(matches!(s.succeed(e), Err(Error::AlreadyTriggered(_))));
    }

    #[test]
    fn callbacks_run_in_registration_order_exactly_once() {
        let s = sim();
        let order = Rc::new(RefCell::new(Vec::new()));
        let e = s.create_event();
        for tag in 0..3 {
            let order = Rc::clone(&order);
            s.add_callback(e, move |_, _| order.borrow_mut().push(tag))
                .unwrap();
        }
        s.succeed(e).unwrap();
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(matches!(
            s.add_callback(e, |_, _| ()),
            Err(Error::AlreadyProcessed(_))
        ));
    }

    #[test]
    fn removed_callback_does_not_run() {
        let s = sim();
        let hits = Rc::new(RefCell::new(0));
        let e = s.create_event();
        let hits2 = Rc::clone(&hits);
        let id = s
            .add_callback(e, move |_, _| *hits2.borrow_mut() += 1)
            .unwrap();
        assert!(s.remove_callback(e, id).unwrap());
        assert!(!s.remove_callback(e, id).unwrap());
        s.succeed(e).unwrap();
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn succeed_fires_after_work_already_queued_at_now() {
        let s = sim();
        let order = Rc::new(RefCell::new(Vec::new()));
        let first = s.timeout(0.0).unwrap();
        let o = Rc::clone(&order);
        s.add_callback(first, move |_, _| o.borrow_mut().push("timeout"))
            .unwrap();
        let e = s.create_event();
        let o = Rc::clone(&order);
        s.add_callback(e, move |_, _| o.borrow_mut().push("event"))
            .unwrap();
        s.succeed(e).unwrap();
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(*order.borrow(), vec!["timeout", "event"]);
    }

    #[test]
    fn negative_and_nan_delays_are_rejected() {
        let s = sim();
        assert!(matches!(
            s.timeout(-1.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            s.timeout(f64::NAN),
            Err(Error::InvalidArgument(_))
        ));
        let e = s.create_event();
        assert!(matches!(
            s.schedule_after(-0.5, e, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn any_of_empty_fires_immediately() {
        let s = sim();
        let c = s.any_of(&[]);
        assert!(s.is_triggered(c));
        s.run(EndCondition::NoEvents).unwrap();
        assert!(s.is_processed(c));
        assert!(s.fired_children(c).is_empty());
    }

    #[test]
    fn any_of_fires_on_first_child() {
        let s = sim();
        let slow = s.timeout(10.0).unwrap();
        let fast = s.timeout_with(2.0, 0, Some(7)).unwrap();
        let c = s.any_of(&[slow, fast]);
        s.run(EndCondition::Event(c)).unwrap();
        assert_eq!(s.time(), 2.0);
        assert_eq!(s.fired_children(c), vec![fast]);
        assert_eq!(s.condition_value(c), vec![(fast, Some(7))]);
    }

    #[test]
    fn all_of_waits_for_every_child() {
        let s = sim();
        let a = s.timeout(1.0).unwrap();
        let b = s.timeout(4.0).unwrap();
        let c = s.all_of(&[a, b]);
        s.run(EndCondition::Event(c)).unwrap();
        assert_eq!(s.time(), 4.0);
        assert_eq!(s.fired_children(c), vec![a, b]);
    }

    #[test]
    fn failing_child_fails_the_condition() {
        let s = sim();
        let a = s.timeout(5.0).unwrap();
        let b = s.create_event();
        let c = s.all_of(&[a, b]);
        s.fail(b, Some(9)).unwrap();
        while s.step().unwrap() {}
        assert!(s.is_triggered(c));
        assert!(!s.is_ok(c));
        assert!(matches!(s.fault_value(c), Some(Fault::Failed(Some(9)))));
    }

    #[test]
    fn run_until_time_stops_before_events_at_that_time() {
        let s = sim();
        let to = s.timeout(10.0).unwrap();
        s.run(EndCondition::Time(10.0)).unwrap();
        assert_eq!(s.time(), 10.0);
        // Only the stop event itself was processed; the timeout is still
        // queued, triggered but unprocessed.
        assert_eq!(s.processed_count(), 1);
        assert!(s.is_triggered(to));
        assert!(!s.is_processed(to));
        assert_eq!(s.peek(), 10.0);
    }

    #[test]
    fn run_until_event_returns_its_value() {
        let s = sim();
        let e = s.timeout_with(4.0, 0, Some(11)).unwrap();
        s.timeout(9.0).unwrap();
        let got = s.run(EndCondition::Event(e)).unwrap();
        assert_eq!(got, Some(11));
        assert_eq!(s.time(), 4.0);
        // A second run on the processed stop event returns right away.
        let again = s.run(EndCondition::Event(e)).unwrap();
        assert_eq!(again, Some(11));
        assert_eq!(s.time(), 4.0);
    }

    #[test]
    fn exhausted_schedule_with_pending_stop_event_is_an_error() {
        let s = sim();
        let never = s.create_event();
        s.timeout(1.0).unwrap();
        assert!(matches!(
            s.run(EndCondition::Event(never)),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn run_within_run_is_rejected() {
        let s = sim();
        let e = s.timeout(1.0).unwrap();
        let s2 = s.clone();
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        s.add_callback(e, move |_, _| {
            *seen2.borrow_mut() = Some(matches!(
                s2.run(EndCondition::NoEvents),
                Err(Error::InvalidOperation(_))
            ));
        })
        .unwrap();
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(*seen.borrow(), Some(true));
    }

    #[test]
    fn nsteps_executes_exactly_n() {
        let s = sim();
        for _ in 0..5 {
            s.timeout(1.0).unwrap();
        }
        s.run(EndCondition::NSteps(3)).unwrap();
        assert_eq!(s.processed_count(), 3);
        s.run(EndCondition::NSteps(100)).unwrap();
        assert_eq!(s.processed_count(), 5);
    }

    #[test]
    fn run_hooks_fire_once_per_run() {
        let s = sim();
        let counts = Rc::new(RefCell::new((0, 0)));
        let c = Rc::clone(&counts);
        s.on_run_started(move |_| c.borrow_mut().0 += 1);
        let c = Rc::clone(&counts);
        s.on_run_finished(move |_| c.borrow_mut().1 += 1);
        s.timeout(1.0).unwrap();
        s.run(EndCondition::NoEvents).unwrap();
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(*counts.borrow(), (2, 2));
    }

    #[test]
    fn stop_handle_halts_between_steps() {
        let s = sim();
        let halt = s.stop_handle();
        let e = s.timeout(1.0).unwrap();
        s.timeout(2.0).unwrap();
        s.add_callback(e, move |_, _| halt.stop()).unwrap();
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(s.time(), 1.0);
        assert_eq!(s.processed_count(), 1);
    }

    #[test]
    fn injector_triggers_events_from_outside() {
        let s: Simulation<u32> = Simulation::with_config(Config {
            thread_safe: true,
            ..Config::default()
        });
        let e = s.create_event();
        let injector = s.injector().expect("thread-safe mode");
        let handle = std::thread::spawn(move || {
            injector.succeed(e, Some(3)).unwrap();
        });
        handle.join().unwrap();
        s.timeout(1.0).unwrap();
        let got = s.run(EndCondition::Event(e)).unwrap();
        assert_eq!(got, Some(3));
    }

    #[test]
    fn reset_rewinds_clock_queue_and_counter() {
        let s = sim();
        s.timeout(5.0).unwrap();
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(s.time(), 5.0);
        s.reset(42);
        assert_eq!(s.time(), 0.0);
        assert_eq!(s.processed_count(), 0);
        assert_eq!(s.peek(), f64::INFINITY);
    }

    #[test]
    fn identical_seeds_produce_identical_trajectories() {
        fn trajectory(seed: u64) -> Vec<f64> {
            let s: Simulation<u32> = Simulation::with_config(Config {
                seed,
                ..Config::default()
            });
            for _ in 0..20 {
                let delay = s.random(|rng| rand::Rng::gen_range(rng, 0.0..10.0));
                s.timeout(delay).unwrap();
            }
            let mut times = Vec::new();
            while s.step().unwrap() {
                times.push(s.time());
            }
            times
        }
        assert_eq!(trajectory(7), trajectory(7));
        assert_ne!(trajectory(7), trajectory(8));
    }

    #[test]
    fn log_lines_reach_the_injected_sink() {
        struct Shared(Rc<RefCell<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let s = sim();
        let buffer = Rc::new(RefCell::new(Vec::new()));
        s.set_log_sink(Box::new(Shared(Rc::clone(&buffer))));
        s.log("machine 3 seized");
        assert_eq!(&*buffer.borrow(), b"machine 3 seized\n");
    }
}
