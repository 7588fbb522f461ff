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

//! Processes: coroutines driven by the event loop.
//!
//! A process wraps a coroutine that yields [`Effect`]s. Creating one
//! schedules its initialization at the current time; every time an awaited
//! event is processed the coroutine advances by one step and the next
//! yielded effect decides what it waits for. The process is itself an
//! event ([`Simulation::process_event`]) that succeeds with the value of
//! the last awaited event when the coroutine returns, so processes can be
//! awaited and composed like any other event.
//!
//! Rust has no way to throw into a suspended coroutine, so interruption is
//! a flag protocol: the awaited event fails, the process is resumed with
//! `ok == false`, and its very next step must either acknowledge the fault
//! through [`Simulation::handle_fault`] or terminate. Yielding again with
//! the fault still pending is reported as [`Error::UnhandledFault`].

use std::ops::CoroutineState;
use std::pin::Pin;

use crate::error::{Error, Result};
use crate::event::{Callback, Fault};
use crate::simulation::{Core, Simulation};
use crate::{Effect, EventId, Priority, ProcessId, SimContext, SimGen};

pub(crate) struct ProcessState<T> {
    /// The event representing the process itself.
    pub(crate) event: EventId,
    /// The coroutine, absent once the process terminated (or while it is
    /// being resumed).
    pub(crate) gen: Option<Box<SimGen<T>>>,
    /// Event the process is currently subscribed to.
    pub(crate) target: Option<EventId>,
    /// Fault delivered by the last awaited event, pending acknowledgement.
    pub(crate) fault: Option<Fault<T>>,
    /// Value of the last awaited event; becomes the process value when the
    /// coroutine returns.
    pub(crate) last_value: Option<T>,
}

impl<T: Clone + 'static> Core<T> {
    /// Fail a synthetic event and reroute the process's resumption through
    /// it. Used by `interrupt` and by preemption.
    pub(crate) fn inject_fault(
        &mut self,
        process: ProcessId,
        fault: Fault<T>,
        priority: Priority,
    ) -> Result<()> {
        if self.active == Some(process) {
            return Err(Error::InvalidOperation(
                "a process cannot interrupt itself".into(),
            ));
        }
        let pevent = self.processes[process].event;
        if self.events[pevent].triggered {
            return Err(Error::InvalidOperation(
                "cannot interrupt a terminated process".into(),
            ));
        }
        if let Some(target) = self.processes[process].target {
            self.events[target]
                .callbacks
                .retain(|cb| !matches!(cb, Callback::Resume(p) if *p == process));
        }
        let synthetic = self.new_event();
        self.events[synthetic].callbacks.push(Callback::Resume(process));
        self.processes[process].target = Some(synthetic);
        self.fail_event(synthetic, fault, priority)
    }
}

enum Step {
    /// The coroutine returned; the process event was decided.
    Finished,
    /// The step decided the process event through `succeed_process` or
    /// `fail_process`.
    SelfTriggered,
    /// Subscribed to the next target, or suspended on `Effect::Wait`.
    Suspended,
    /// The next target was already processed; advance again through it.
    Advance(EventId),
}

impl<T: Clone + 'static> Simulation<T> {
    /// Create a process from a coroutine and schedule its first step at
    /// the current time.
    ///
    /// For more information about a process, see the crate level
    /// documentation.
    ///
    /// Returns the identifier of the process.
    pub fn create_process(&self, gen: Box<SimGen<T>>) -> ProcessId {
        self.create_process_with(gen, 0)
    }

    /// [`create_process`](Simulation::create_process) with an explicit
    /// priority for the initialization event.
    pub fn create_process_with(&self, gen: Box<SimGen<T>>, priority: Priority) -> ProcessId {
        let mut core = self.core.borrow_mut();
        let pevent = core.new_event();
        let init = core.new_event();
        let process = core.processes.len();
        core.processes.push(ProcessState {
            event: pevent,
            gen: Some(gen),
            target: Some(init),
            fault: None,
            last_value: None,
        });
        let state = &mut core.events[init];
        state.triggered = true;
        state.ok = true;
        state.callbacks.push(Callback::Resume(process));
        let now = core.now;
        core.queue.enqueue(now, priority, init);
        process
    }

    /// The event that fires when the process terminates. Await it to join
    /// the process; its value is the process outcome.
    pub fn process_event(&self, process: ProcessId) -> EventId {
        self.core.borrow().processes[process].event
    }

    /// Whether the process has terminated (its event was decided).
    pub fn is_terminated(&self, process: ProcessId) -> bool {
        let core = self.core.borrow();
        let pevent = core.processes[process].event;
        core.events[pevent].triggered
    }

    /// Interrupt another process: its current wait is abandoned and it is
    /// resumed at the current time with a pending
    /// [`Fault::Interrupted`].
    ///
    /// Interrupting oneself or a terminated process fails with
    /// [`Error::InvalidOperation`].
    pub fn interrupt(&self, process: ProcessId) -> Result<()> {
        self.core
            .borrow_mut()
            .inject_fault(process, Fault::Interrupted(None), 0)
    }

    /// [`interrupt`](Simulation::interrupt) with a cause delivered inside
    /// the fault.
    pub fn interrupt_with(&self, process: ProcessId, cause: T) -> Result<()> {
        self.core
            .borrow_mut()
            .inject_fault(process, Fault::Interrupted(Some(cause)), 0)
    }

    /// [`interrupt_with`](Simulation::interrupt_with) with an explicit
    /// scheduling priority for the interrupting event.
    pub fn interrupt_with_priority(
        &self,
        process: ProcessId,
        cause: Option<T>,
        priority: Priority,
    ) -> Result<()> {
        self.core
            .borrow_mut()
            .inject_fault(process, Fault::Interrupted(cause), priority)
    }

    /// Acknowledge and clear the pending fault of the process currently
    /// executing. Returns the fault, or `None` when there was nothing to
    /// handle.
    ///
    /// A process resumed by a failed event must call this (or terminate)
    /// before yielding again.
    pub fn handle_fault(&self) -> Option<Fault<T>> {
        let mut core = self.core.borrow_mut();
        let active = core.active?;
        core.processes[active].fault.take()
    }

    /// Terminate a process from the outside (or from itself), deciding its
    /// event as a success carrying `value`.
    pub fn succeed_process(&self, process: ProcessId, value: Option<T>) -> Result<()> {
        let dropped = {
            let mut core = self.core.borrow_mut();
            let pevent = core.processes[process].event;
            core.detach_waiter(process)?;
            core.succeed_event(pevent, value, 0)?;
            core.take_gen_unless_active(process)
        };
        drop(dropped);
        Ok(())
    }

    /// Terminate a process from the outside (or from itself), deciding its
    /// event as a failure carrying `cause`.
    pub fn fail_process(&self, process: ProcessId, cause: Option<T>) -> Result<()> {
        let dropped = {
            let mut core = self.core.borrow_mut();
            let pevent = core.processes[process].event;
            core.detach_waiter(process)?;
            core.fail_event(pevent, Fault::Failed(cause), 0)?;
            core.take_gen_unless_active(process)
        };
        drop(dropped);
        Ok(())
    }

    /// Advance a process through the event that woke it, then through any
    /// already-processed targets it yields, until it subscribes, suspends
    /// or terminates.
    pub(crate) fn resume_process(&self, process: ProcessId, event: EventId) -> Result<()> {
        {
            let core = self.core.borrow();
            let state = &core.processes[process];
            // A stale wakeup: the process was detached from this event
            // (interrupted or terminated) after the event began processing.
            if state.gen.is_none() || state.target != Some(event) {
                return Ok(());
            }
        }
        let mut event = event;
        loop {
            let (ctx, faulted) = {
                let mut core = self.core.borrow_mut();
                let ok = core.events[event].ok;
                let value = core.events[event].value.clone();
                let fault = core.events[event].fault.clone();
                let now = core.now;
                let state = &mut core.processes[process];
                if !ok {
                    state.fault = fault.clone();
                }
                state.last_value = value.clone();
                core.active = Some(process);
                let ctx = SimContext {
                    time: now,
                    event: Some(event),
                    ok,
                    value,
                    fault,
                };
                (ctx, !ok)
            };
            let gen = self.core.borrow_mut().processes[process].gen.take();
            let Some(mut gen) = gen else {
                self.core.borrow_mut().active = None;
                return Ok(());
            };
            // The coroutine runs with the core unborrowed: the model is
            // free to create events, request resources and spawn processes
            // from inside the step.
            let step = Pin::new(gen.as_mut()).resume(ctx);
            let outcome = {
                let mut core = self.core.borrow_mut();
                core.active = None;
                let pevent = core.processes[process].event;
                if core.events[pevent].triggered {
                    Step::SelfTriggered
                } else if faulted
                    && core.processes[process].fault.is_some()
                    && matches!(step, CoroutineState::Yielded(_))
                {
                    return Err(Error::UnhandledFault(process));
                } else {
                    match step {
                        CoroutineState::Complete(()) => {
                            let fault = core.processes[process].fault.take();
                            let value = core.processes[process].last_value.clone();
                            core.processes[process].target = None;
                            match fault {
                                Some(fault) => core.fail_event(pevent, fault, 0)?,
                                None => core.succeed_event(pevent, value, 0)?,
                            }
                            Step::Finished
                        }
                        CoroutineState::Yielded(effect) => {
                            let target = match effect {
                                Effect::TimeOut(delay) => {
                                    if !(delay >= 0.0 && delay.is_finite()) {
                                        return Err(Error::InvalidArgument(format!(
                                            "process {} yielded a timeout of {}",
                                            process, delay
                                        )));
                                    }
                                    Some(core.new_timeout(delay, 0, None))
                                }
                                Effect::Event(id) => Some(id),
                                Effect::Wait => None,
                            };
                            core.processes[process].gen = Some(gen);
                            match target {
                                None => {
                                    core.processes[process].target = None;
                                    Step::Suspended
                                }
                                Some(target) => {
                                    core.processes[process].target = Some(target);
                                    if core.events[target].processed {
                                        Step::Advance(target)
                                    } else {
                                        core.events[target]
                                            .callbacks
                                            .push(Callback::Resume(process));
                                        Step::Suspended
                                    }
                                }
                            }
                        }
                    }
                }
            };
            match outcome {
                Step::Advance(next) => {
                    event = next;
                }
                Step::Finished | Step::SelfTriggered | Step::Suspended => return Ok(()),
            }
        }
    }
}

impl<T: Clone + 'static> Core<T> {
    /// Unsubscribe the process from its target; error if it already
    /// terminated.
    fn detach_waiter(&mut self, process: ProcessId) -> Result<()> {
        let pevent = self.processes[process].event;
        if self.events[pevent].triggered {
            return Err(Error::AlreadyTriggered(pevent));
        }
        if let Some(target) = self.processes[process].target {
            self.events[target]
                .callbacks
                .retain(|cb| !matches!(cb, Callback::Resume(p) if *p == process));
        }
        self.processes[process].target = None;
        Ok(())
    }

    /// Take the coroutine for dropping outside the borrow. While the
    /// process is the active one its coroutine is already out on the
    /// stack; the resume loop notices the decided event when the step
    /// returns.
    fn take_gen_unless_active(&mut self, process: ProcessId) -> Option<Box<SimGen<T>>> {
        if self.active == Some(process) {
            None
        } else {
            self.processes[process].gen.take()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn process_succeeds_with_the_last_awaited_value() {
        let s: Simulation<u32> = Simulation::new();
        let s2 = s.clone();
        let p = s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| {
                yield Effect::TimeOut(2.0);
                let last = s2.timeout_with(1.0, 0, Some(42)).unwrap();
                yield Effect::Event(last);
            },
        ));
        let done = s.process_event(p);
        let value = s.run(EndCondition::Event(done)).unwrap();
        assert_eq!(value, Some(42));
        assert_eq!(s.time(), 3.0);
        assert!(s.is_terminated(p));
    }

    #[test]
    fn interruption() {
        let s: Simulation<u32> = Simulation::new();
        let s1 = s.clone();
        let p1 = s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| {
                yield Effect::TimeOut(1.0);
                assert!(s1.handle_fault().is_none());
                assert_eq!(s1.time(), 1.0);

                let ctx = yield Effect::TimeOut(1.0);
                assert!(!ctx.ok());
                assert!(matches!(
                    s1.handle_fault(),
                    Some(Fault::Interrupted(Some(9)))
                ));
                assert_eq!(s1.time(), 1.1);
            },
        ));
        let s2 = s.clone();
        s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| {
                yield Effect::TimeOut(1.1);
                s2.interrupt_with(p1, 9).unwrap();
            },
        ));
        s.run(EndCondition::NoEvents).unwrap();
        assert!(s.is_terminated(p1));
        // The abandoned timeout of p1 must not have resumed it a second
        // time: p1 ended at 1.1 and the schedule drained at 2.0.
        assert_eq!(s.time(), 2.0);
    }

    #[test]
    fn interrupting_a_terminated_process_is_rejected() {
        let s: Simulation = Simulation::new();
        let p = s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext| {
                yield Effect::TimeOut(1.0);
            },
        ));
        s.run(EndCondition::NoEvents).unwrap();
        assert!(s.is_terminated(p));
        assert!(matches!(
            s.interrupt(p),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn self_interruption_is_rejected() {
        let s: Simulation = Simulation::new();
        let outcome = Rc::new(RefCell::new(None));
        let s2 = s.clone();
        let o = Rc::clone(&outcome);
        let p = s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext| {
                let me = s2.active_process().unwrap();
                *o.borrow_mut() = Some(matches!(
                    s2.interrupt(me),
                    Err(Error::InvalidOperation(_))
                ));
                yield Effect::TimeOut(0.0);
            },
        ));
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(*outcome.borrow(), Some(true));
        assert!(s.is_terminated(p));
    }

    #[test]
    fn ignoring_a_fault_is_fatal() {
        let s: Simulation = Simulation::new();
        let p1 = s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext| {
                yield Effect::TimeOut(5.0);
                // Interrupted here, but this process never checks.
                yield Effect::TimeOut(5.0);
            },
        ));
        let s2 = s.clone();
        s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext| {
                yield Effect::TimeOut(1.0);
                s2.interrupt(p1).unwrap();
            },
        ));
        assert!(matches!(
            s.run(EndCondition::NoEvents),
            Err(Error::UnhandledFault(p)) if p == p1
        ));
    }

    #[test]
    fn terminating_while_faulted_fails_the_process_event() {
        let s: Simulation = Simulation::new();
        let p1 = s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext| {
                yield Effect::TimeOut(5.0);
                // Interrupted; terminating without handling is legal and
                // propagates the fault to joiners.
            },
        ));
        let s2 = s.clone();
        s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext| {
                yield Effect::TimeOut(1.0);
                s2.interrupt(p1).unwrap();
            },
        ));
        s.run(EndCondition::NoEvents).unwrap();
        let done = s.process_event(p1);
        assert!(s.is_processed(done));
        assert!(!s.is_ok(done));
        assert!(matches!(
            s.fault_value(done),
            Some(Fault::Interrupted(None))
        ));
    }

    #[test]
    fn wait_suspends_until_terminated_from_outside() {
        let s: Simulation<u32> = Simulation::new();
        let waiter = s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| loop {
                yield Effect::Wait;
            },
        ));
        let s2 = s.clone();
        s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| {
                yield Effect::TimeOut(2.0);
                s2.succeed_process(waiter, Some(5)).unwrap();
            },
        ));
        s.run(EndCondition::NoEvents).unwrap();
        let done = s.process_event(waiter);
        assert!(s.is_processed(done));
        assert_eq!(s.value(done), Some(5));
        assert_eq!(s.time(), 2.0);
    }

    #[test]
    fn a_process_can_join_another() {
        let s: Simulation<u32> = Simulation::new();
        let s1 = s.clone();
        let worker = s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| {
                let done = s1.timeout_with(3.0, 0, Some(8)).unwrap();
                yield Effect::Event(done);
            },
        ));
        let s2 = s.clone();
        let joined = Rc::new(RefCell::new(None));
        let j = Rc::clone(&joined);
        s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| {
                let ctx = yield Effect::Event(s2.process_event(worker));
                *j.borrow_mut() = Some((s2.time(), ctx.value().copied()));
            },
        ));
        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(*joined.borrow(), Some((3.0, Some(8))));
    }
}
