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

//! Error type returned by the fallible operations of the kernel.

use crate::{EventId, ProcessId};

/// Everything that can go wrong while building or running a simulation.
///
/// Misuse of the event lifecycle and of the process API is reported through
/// this enum rather than by panicking, so that a model driving the
/// simulation from the outside can react to it. Faults that travel *inside*
/// the simulation (an interrupted or preempted process, a canceled request)
/// are not errors: they are carried by the failed event itself, see
/// [`Fault`](crate::Fault).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument failed validation at the API boundary: a negative or
    /// non-finite delay, a non-positive capacity, an amount exceeding a
    /// container's capacity.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `succeed` or `fail` was called on an event whose outcome was already
    /// decided.
    #[error("event {0} was already triggered")]
    AlreadyTriggered(EventId),

    /// A callback was added to (or removed from) an event whose callbacks
    /// have already been drained.
    #[error("event {0} was already processed")]
    AlreadyProcessed(EventId),

    /// The operation is not legal in the current state: a process
    /// interrupting itself, interrupting a terminated process, running a
    /// simulation from within its own run loop, or exhausting the schedule
    /// while a stop event is still pending.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The schedule queue was empty when an event was asked for.
    #[error("the schedule queue is empty")]
    EmptySchedule,

    /// A process was resumed with a fault, neither handled it nor
    /// terminated, and yielded again. This is a bug in the model and the
    /// kernel fails loudly instead of resuming the process once more.
    #[error("process {0} kept yielding after an unhandled fault")]
    UnhandledFault(ProcessId),
}

pub type Result<T> = std::result::Result<T, Error>;
