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

//! This crate implements a process-oriented discrete event simulation
//! kernel inspired by the SimPy library for Python. It uses the coroutine
//! feature that is nightly. Once the feature is stabilized, also this
//! crate will use stable. Coroutines will be the only nightly feature
//! used in this crate.
//!
//! # Simulation
//! A simulation is performed scheduling one or more processes that
//! model the environment you are going to simulate. Your model may
//! consider some kind of finite resource that must be shared among
//! the processes, e.g. a bunch of servers in a simulation on queues,
//! a tank holding a continuous quantity, or a buffer of discrete items.
//!
//! After setting up the simulation, it can be run step-by-step, using
//! the `step()` method, or all at once, with `run()`, until an ending
//! condition is met.
//!
//! # Events
//! The unit of synchronization is the event: an object that is triggered
//! at most once, carries a value or a fault, and resumes its subscribers
//! in registration order when the scheduler processes it. Timeouts are
//! events scheduled after a delay; conditions ([`Simulation::any_of`],
//! [`Simulation::all_of`]) are events composed over other events;
//! resource requests, releases, puts and gets are events too, which is
//! what makes waiting with a timeout and reneging possible.
//!
//! # Process
//! A process is implemented using the rust coroutines syntax.
//! This lets us avoid the overhead of spawning a new thread for each
//! process, while still keeping the use of this framework quite simple.
//!
//! When a new process is created in the simulation, an identifier, of
//! type `ProcessId` is assigned to it. That id can be used to interrupt
//! the process or to wait for its termination, since a process is an
//! event as well.
//!
//! A process can be stopped and resumed later on. To stop the process,
//! the coroutine yields an [`Effect`] that specifies what event it wants
//! to wait for. For example, a coroutine can set a timeout after which it
//! is executed again. The process may also return. In that case it can
//! not be resumed anymore.
//!
//! A process that is resumed by a failed event (it was interrupted, or
//! preempted from a resource) must acknowledge the fault with
//! [`Simulation::handle_fault`] before yielding again, or terminate.
//!
//! # Resource
//! A resource is a finite amount of slots that can be used by one process
//! a time. When all the instances of the resource of interest are being
//! used by a process, the requiring one is enqueued and resumed when the
//! resource becomes available again. When the process does not need the
//! resource anymore, it must release it; the scope guard returned by
//! [`Simulation::request_guard`] does that on every exit path.
//!
//! A resource can be registered in the simulation using the
//! `create_resource` method, which takes the resource policy (simple,
//! priority ordered, preemptive, or an object pool) and returns an
//! identifier for that resource that can be used to request and release
//! it. Containers (continuous quantities) and stores (discrete items)
//! follow the same pattern with `create_container` and `create_store`.

#![feature(coroutines, coroutine_trait, stmt_expr_attributes)]

use std::ops::Coroutine;

pub mod container;
pub mod error;
mod event;
pub mod prelude;
mod process;
pub mod resources;
pub mod simulation;
pub mod store;

pub use error::{Error, Result};
pub use event::{CallbackId, Fault};
pub use resources::{
    Acquired, PreemptiveResource, PriorityResource, RequestOptions, Resource, ResourcePool,
    SimpleResource,
};
pub use simulation::{Config, EndCondition, Injector, Sample, Simulation, StopHandle};
pub use store::{FilterStore, PriorityStore, SimpleStore, Store};

/// Identifies an event. Can be used to await, trigger and compose it.
pub type EventId = usize;
/// Identifies a process. Can be used to interrupt it and to await its
/// termination.
pub type ProcessId = usize;
/// Identifies a resource. Can be used to request and release it.
pub type ResourceId = usize;
/// Identifies a container. Can be used to put and get amounts.
pub type ContainerId = usize;
/// Identifies a store. Can be used to put and get items.
pub type StoreId = usize;
/// Scheduling priority of an event; a lower number fires first among
/// events scheduled for the same time.
pub type Priority = i32;

/// The effect is yielded by a process coroutine to
/// interact with the simulation environment.
#[derive(Debug, Copy, Clone)]
pub enum Effect {
    /// The process that yields this effect will be resumed
    /// after the specified time
    TimeOut(f64),
    /// Wait for the given event: a timeout created with a value, a
    /// resource request, a condition over many events, another process.
    Event(EventId),
    /// Keep the process' state until it is interrupted or terminated by
    /// another process.
    Wait,
}

/// The type of each process coroutine.
pub type SimGen<T> = dyn Coroutine<SimContext<T>, Yield = Effect, Return = ()> + Unpin;

/// The Simulation Context is the argument used to resume the coroutine.
/// It can be used to retrieve the simulation time and the outcome of the
/// event that caused the process' wake up.
#[derive(Debug, Clone)]
pub struct SimContext<T = ()> {
    pub(crate) time: f64,
    pub(crate) event: Option<EventId>,
    pub(crate) ok: bool,
    pub(crate) value: Option<T>,
    pub(crate) fault: Option<Fault<T>>,
}

impl<T> SimContext<T> {
    /// Returns current simulation time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Returns the event that caused the process to wake up. On the first
    /// step this is the initialization event of the process.
    pub fn event(&self) -> Option<EventId> {
        self.event
    }

    /// Whether the waking event succeeded. When `false`, the process has
    /// a pending fault it must handle or terminate on.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Returns the value carried by the waking event.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Consumes the context, returning the value of the waking event.
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Returns the fault carried by the waking event, when it failed.
    pub fn fault(&self) -> Option<&Fault<T>> {
        self.fault.as_ref()
    }
}
