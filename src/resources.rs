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

//! Capacity-bounded resources shared among processes.
//!
//! Every resource follows the same protocol: [`Simulation::request`]
//! appends to the waiting queue and runs the trigger scan, which grants
//! requests in the policy order of the concrete resource until one cannot
//! be satisfied; [`Simulation::release`] frees a slot and runs the scan
//! again. Requests and releases are ordinary events, so a process can
//! combine a request with a timeout and renege when the timeout wins. The
//! visible guarantee everywhere is FIFO among requests of equal priority.
//!
//! Resource kinds are values implementing [`Resource`], registered with
//! [`Simulation::create_resource`]:
//!
//! * [`SimpleResource`] — plain counting resource, strict FIFO;
//! * [`PriorityResource`] — lower priority number goes first, no eviction;
//! * [`PreemptiveResource`] — additionally evicts a strictly worse holder
//!   when a request carries the preempt flag;
//! * [`ResourcePool`] — distinguishable objects matched by request filter.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use crate::error::{Error, Result};
use crate::event::Fault;
use crate::simulation::{Core, Sample, Simulation};
use crate::{EventId, Priority, ProcessId, ResourceId};

/// Filter deciding which pool objects can satisfy a request.
pub type RequestFilter<T> = Box<dyn Fn(&T) -> bool>;

/// A submitted request, while waiting and while granted.
pub struct RequestInfo<T> {
    /// The event that fires when the request is granted.
    pub event: EventId,
    /// Scheduling priority; lower goes first.
    pub priority: Priority,
    /// Whether this request may evict a worse holder from a preemptive
    /// resource.
    pub preempt: bool,
    /// Process that submitted the request, when submitted from inside one.
    pub owner: Option<ProcessId>,
    /// Submission time.
    pub time: f64,
    /// Time the request was granted; meaningful only while in use.
    pub granted_at: f64,
    /// Global submission sequence number, the final FIFO tie-breaker.
    pub insertion: u64,
    /// Object filter, honored by pools.
    pub filter: Option<RequestFilter<T>>,
}

/// What a trigger scan decided; applied by the simulation after the scan.
pub enum ResourceAction<T> {
    /// Satisfy a request, carrying the granted object for pools.
    Grant { event: EventId, value: Option<T> },
    /// Evict a holder to make room for a preempting request.
    Evict {
        process: Option<ProcessId>,
        fault: Fault<T>,
    },
}

/// Where a removed request was found.
pub enum RemoveOutcome {
    /// It was in use; the slot is free again.
    Granted,
    /// It was still waiting; the caller cancels its event.
    Waiting,
    /// Not found: already released or canceled. Removal is a no-op.
    Unknown,
}

/// A capacity-bounded resource usable with
/// [`Simulation::create_resource`].
///
/// Implementations own their waiting queue and their set of granted
/// requests; the simulation drives them through
/// [`enqueue`](Resource::enqueue), [`remove`](Resource::remove) and
/// [`trigger`](Resource::trigger) and applies the returned actions.
pub trait Resource<T> {
    fn capacity(&self) -> usize;
    /// Number of granted requests.
    fn users(&self) -> usize;
    /// Number of waiting requests.
    fn queued(&self) -> usize;
    /// Free slots, or objects accepted by `filter`, available right now.
    fn available(&self, filter: Option<&dyn Fn(&T) -> bool>) -> usize;
    fn enqueue(&mut self, request: RequestInfo<T>);
    fn remove(&mut self, request: EventId) -> RemoveOutcome;
    /// Scan the waiting queue in policy order, granting while possible.
    fn trigger(&mut self, now: f64, actions: &mut Vec<ResourceAction<T>>);
}

fn remove_from<T>(queue: &mut VecDeque<RequestInfo<T>>, request: EventId) -> bool {
    match queue.iter().position(|info| info.event == request) {
        Some(at) => {
            queue.remove(at);
            true
        }
        None => false,
    }
}

fn remove_user<T>(users: &mut Vec<RequestInfo<T>>, request: EventId) -> bool {
    match users.iter().position(|info| info.event == request) {
        Some(at) => {
            users.swap_remove(at);
            true
        }
        None => false,
    }
}

/// Mutual exclusion counter with a strict FIFO queue.
pub struct SimpleResource<T> {
    capacity: usize,
    users: Vec<RequestInfo<T>>,
    queue: VecDeque<RequestInfo<T>>,
}

impl<T> SimpleResource<T> {
    pub fn new(capacity: usize) -> SimpleResource<T> {
        SimpleResource {
            capacity,
            users: Vec::new(),
            queue: VecDeque::new(),
        }
    }
}

impl<T> Resource<T> for SimpleResource<T> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn users(&self) -> usize {
        self.users.len()
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }

    fn available(&self, _filter: Option<&dyn Fn(&T) -> bool>) -> usize {
        self.capacity - self.users.len()
    }

    fn enqueue(&mut self, request: RequestInfo<T>) {
        self.queue.push_back(request);
    }

    fn remove(&mut self, request: EventId) -> RemoveOutcome {
        if remove_user(&mut self.users, request) {
            RemoveOutcome::Granted
        } else if remove_from(&mut self.queue, request) {
            RemoveOutcome::Waiting
        } else {
            RemoveOutcome::Unknown
        }
    }

    fn trigger(&mut self, now: f64, actions: &mut Vec<ResourceAction<T>>) {
        while self.users.len() < self.capacity {
            match self.queue.pop_front() {
                Some(mut request) => {
                    request.granted_at = now;
                    actions.push(ResourceAction::Grant {
                        event: request.event,
                        value: None,
                    });
                    self.users.push(request);
                }
                None => break,
            }
        }
    }
}

/// Counting resource whose queue is scanned in ascending priority order,
/// FIFO within one priority. Never evicts a holder.
pub struct PriorityResource<T> {
    capacity: usize,
    users: Vec<RequestInfo<T>>,
    queue: BTreeMap<Priority, VecDeque<RequestInfo<T>>>,
}

impl<T> PriorityResource<T> {
    pub fn new(capacity: usize) -> PriorityResource<T> {
        PriorityResource {
            capacity,
            users: Vec::new(),
            queue: BTreeMap::new(),
        }
    }

    fn queue_len(&self) -> usize {
        self.queue.values().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self, now: f64) -> Option<RequestInfo<T>> {
        let priority = *self.queue.keys().next()?;
        let bucket = self.queue.get_mut(&priority).expect("bucket exists");
        let mut request = bucket.pop_front().expect("buckets are never left empty");
        if bucket.is_empty() {
            self.queue.remove(&priority);
        }
        request.granted_at = now;
        Some(request)
    }

    fn enqueue_request(&mut self, request: RequestInfo<T>) {
        self.queue
            .entry(request.priority)
            .or_insert_with(VecDeque::new)
            .push_back(request);
    }

    fn remove_request(&mut self, request: EventId) -> RemoveOutcome {
        if remove_user(&mut self.users, request) {
            return RemoveOutcome::Granted;
        }
        let mut found = None;
        for (&priority, bucket) in self.queue.iter_mut() {
            if remove_from(bucket, request) {
                found = Some((priority, bucket.is_empty()));
                break;
            }
        }
        match found {
            Some((priority, emptied)) => {
                if emptied {
                    self.queue.remove(&priority);
                }
                RemoveOutcome::Waiting
            }
            None => RemoveOutcome::Unknown,
        }
    }
}

impl<T> Resource<T> for PriorityResource<T> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn users(&self) -> usize {
        self.users.len()
    }

    fn queued(&self) -> usize {
        self.queue_len()
    }

    fn available(&self, _filter: Option<&dyn Fn(&T) -> bool>) -> usize {
        self.capacity - self.users.len()
    }

    fn enqueue(&mut self, request: RequestInfo<T>) {
        self.enqueue_request(request);
    }

    fn remove(&mut self, request: EventId) -> RemoveOutcome {
        self.remove_request(request)
    }

    fn trigger(&mut self, now: f64, actions: &mut Vec<ResourceAction<T>>) {
        while self.users.len() < self.capacity {
            match self.pop_next(now) {
                Some(request) => {
                    actions.push(ResourceAction::Grant {
                        event: request.event,
                        value: None,
                    });
                    self.users.push(request);
                }
                None => break,
            }
        }
    }
}

/// Compare two holders for eviction; the maximum is the most evictable.
/// Worse priority loses, then later admission, then not being preemptive
/// itself, then later submission.
fn eviction_order<T>(a: &RequestInfo<T>, b: &RequestInfo<T>) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(
            a.granted_at
                .partial_cmp(&b.granted_at)
                .unwrap_or(Ordering::Equal),
        )
        .then((!a.preempt).cmp(&!b.preempt))
        .then(a.insertion.cmp(&b.insertion))
}

/// [`PriorityResource`] that additionally evicts: a request carrying the
/// preempt flag removes the most evictable holder when that holder's
/// priority is strictly worse than the request's. The evicted process is
/// interrupted with [`Fault::Preempted`]; the waiting queue is never
/// reordered.
pub struct PreemptiveResource<T> {
    inner: PriorityResource<T>,
}

impl<T> PreemptiveResource<T> {
    pub fn new(capacity: usize) -> PreemptiveResource<T> {
        PreemptiveResource {
            inner: PriorityResource::new(capacity),
        }
    }

    fn head(&self) -> Option<(Priority, bool, Option<ProcessId>)> {
        let (_, bucket) = self.inner.queue.iter().next()?;
        let request = bucket.front()?;
        Some((request.priority, request.preempt, request.owner))
    }
}

impl<T> Resource<T> for PreemptiveResource<T> {
    fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn users(&self) -> usize {
        self.inner.users.len()
    }

    fn queued(&self) -> usize {
        self.inner.queue_len()
    }

    fn available(&self, filter: Option<&dyn Fn(&T) -> bool>) -> usize {
        self.inner.available(filter)
    }

    fn enqueue(&mut self, request: RequestInfo<T>) {
        self.inner.enqueue_request(request);
    }

    fn remove(&mut self, request: EventId) -> RemoveOutcome {
        self.inner.remove_request(request)
    }

    fn trigger(&mut self, now: f64, actions: &mut Vec<ResourceAction<T>>) {
        loop {
            if self.inner.users.len() < self.inner.capacity {
                match self.inner.pop_next(now) {
                    Some(request) => {
                        actions.push(ResourceAction::Grant {
                            event: request.event,
                            value: None,
                        });
                        self.inner.users.push(request);
                        continue;
                    }
                    None => break,
                }
            }
            let Some((priority, preempt, by)) = self.head() else {
                break;
            };
            if !preempt {
                break;
            }
            let victim = self
                .inner
                .users
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| eviction_order(*a, *b))
                .map(|(at, _)| at);
            let Some(at) = victim else { break };
            if self.inner.users[at].priority <= priority {
                break;
            }
            let evicted = self.inner.users.swap_remove(at);
            actions.push(ResourceAction::Evict {
                process: evicted.owner,
                fault: Fault::Preempted {
                    by,
                    usage_since: evicted.granted_at,
                },
            });
        }
    }
}

/// Resource whose slots are distinguishable objects. A request is
/// satisfied by the first object its filter accepts; the scan keeps
/// looking at later requests when one cannot be matched and stops once no
/// objects remain. Releasing a request returns its object to the pool.
pub struct ResourcePool<T> {
    items: Vec<T>,
    capacity: usize,
    users: Vec<(RequestInfo<T>, T)>,
    queue: VecDeque<RequestInfo<T>>,
}

impl<T> ResourcePool<T> {
    pub fn new(items: Vec<T>) -> ResourcePool<T> {
        let capacity = items.len();
        ResourcePool {
            items,
            capacity,
            users: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    fn matches(request: &RequestInfo<T>, item: &T) -> bool {
        request.filter.as_ref().map_or(true, |filter| filter(item))
    }
}

impl<T: Clone> Resource<T> for ResourcePool<T> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn users(&self) -> usize {
        self.users.len()
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }

    fn available(&self, filter: Option<&dyn Fn(&T) -> bool>) -> usize {
        match filter {
            Some(filter) => self.items.iter().filter(|item| filter(*item)).count(),
            None => self.items.len(),
        }
    }

    fn enqueue(&mut self, request: RequestInfo<T>) {
        self.queue.push_back(request);
    }

    fn remove(&mut self, request: EventId) -> RemoveOutcome {
        if let Some(at) = self.users.iter().position(|(info, _)| info.event == request) {
            let (_, item) = self.users.swap_remove(at);
            self.items.push(item);
            return RemoveOutcome::Granted;
        }
        if remove_from(&mut self.queue, request) {
            RemoveOutcome::Waiting
        } else {
            RemoveOutcome::Unknown
        }
    }

    fn trigger(&mut self, now: f64, actions: &mut Vec<ResourceAction<T>>) {
        let mut at = 0;
        while at < self.queue.len() {
            if self.items.is_empty() {
                break;
            }
            let matched = {
                let request = &self.queue[at];
                self.items
                    .iter()
                    .position(|item| Self::matches(request, item))
            };
            match matched {
                Some(found) => {
                    let mut request = self.queue.remove(at).expect("index in bounds");
                    let item = self.items.remove(found);
                    request.granted_at = now;
                    actions.push(ResourceAction::Grant {
                        event: request.event,
                        value: Some(item.clone()),
                    });
                    self.users.push((request, item));
                }
                None => at += 1,
            }
        }
    }
}

/// Options of a [`Simulation::request_with`] call.
pub struct RequestOptions<T> {
    pub priority: Priority,
    pub preempt: bool,
    pub filter: Option<RequestFilter<T>>,
}

impl<T> Default for RequestOptions<T> {
    fn default() -> Self {
        RequestOptions {
            priority: 0,
            preempt: false,
            filter: None,
        }
    }
}

impl<T> RequestOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn preempt(mut self, preempt: bool) -> Self {
        self.preempt = preempt;
        self
    }

    pub fn filter(mut self, filter: impl Fn(&T) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }
}

/// A request bound to a scope: dropping the guard releases the slot, or
/// cancels the request if it was never granted. Obtained through
/// [`Simulation::request_guard`].
pub struct Acquired<T: Clone + 'static> {
    sim: Simulation<T>,
    resource: ResourceId,
    request: EventId,
    released: Cell<bool>,
}

impl<T: Clone + 'static> Acquired<T> {
    /// The request event, to be awaited or composed into conditions.
    pub fn event(&self) -> EventId {
        self.request
    }

    /// Release explicitly, returning the release event.
    pub fn release(&self) -> Result<EventId> {
        self.released.set(true);
        self.sim.release(self.resource, self.request)
    }
}

impl<T: Clone + 'static> Drop for Acquired<T> {
    fn drop(&mut self) {
        if self.released.get() {
            return;
        }
        // During simulation teardown the core may be mid-borrow; releasing
        // is pointless then and skipped.
        if self.sim.core.try_borrow_mut().is_ok() {
            let _ = self.sim.release(self.resource, self.request);
        }
    }
}

impl<T: Clone + 'static> Core<T> {
    pub(crate) fn trigger_resource(&mut self, resource: ResourceId) -> Result<()> {
        let mut actions = Vec::new();
        let now = self.now;
        self.resources[resource].trigger(now, &mut actions);
        for action in actions {
            match action {
                ResourceAction::Grant { event, value } => {
                    self.succeed_event(event, value, 0)?;
                }
                ResourceAction::Evict { process, fault } => {
                    if let Some(process) = process {
                        self.inject_fault(process, fault, 0)?;
                    }
                }
            }
        }
        let users = self.resources[resource].users();
        let capacity = self.resources[resource].capacity();
        let waiting = self.resources[resource].queued();
        self.emit_sample(Sample::ResourceUsers {
            resource,
            users,
            capacity,
        });
        self.emit_sample(Sample::ResourceQueue { resource, waiting });
        Ok(())
    }
}

impl<T: Clone + 'static> Simulation<T> {
    /// Register a resource.
    ///
    /// For more information about a resource, see the crate level
    /// documentation.
    ///
    /// Returns the identifier of the resource.
    pub fn create_resource(&self, resource: Box<dyn Resource<T>>) -> Result<ResourceId> {
        if resource.capacity() == 0 {
            return Err(Error::InvalidArgument(
                "resource capacity must be positive".into(),
            ));
        }
        let mut core = self.core.borrow_mut();
        let id = core.resources.len();
        core.resources.push(resource);
        Ok(id)
    }

    /// Submit a request with default options. The returned event fires
    /// when a slot is granted.
    pub fn request(&self, resource: ResourceId) -> Result<EventId> {
        self.request_with(resource, RequestOptions::default())
    }

    /// Submit a request with explicit priority, preempt flag and filter.
    pub fn request_with(
        &self,
        resource: ResourceId,
        options: RequestOptions<T>,
    ) -> Result<EventId> {
        let event = {
            let mut core = self.core.borrow_mut();
            let event = core.new_event();
            let time = core.now;
            let insertion = core.next_request_seq();
            let owner = core.active;
            core.resources[resource].enqueue(RequestInfo {
                event,
                priority: options.priority,
                preempt: options.preempt,
                owner,
                time,
                granted_at: time,
                insertion,
                filter: options.filter,
            });
            core.trigger_resource(resource)?;
            event
        };
        self.flush_monitor();
        Ok(event)
    }

    /// [`request`](Simulation::request) wrapped in a scope guard that
    /// releases on drop.
    pub fn request_guard(&self, resource: ResourceId) -> Result<Acquired<T>> {
        self.request_guard_with(resource, RequestOptions::default())
    }

    /// [`request_with`](Simulation::request_with) wrapped in a scope guard.
    pub fn request_guard_with(
        &self,
        resource: ResourceId,
        options: RequestOptions<T>,
    ) -> Result<Acquired<T>> {
        let request = self.request_with(resource, options)?;
        Ok(Acquired {
            sim: self.clone(),
            resource,
            request,
            released: Cell::new(false),
        })
    }

    /// Release a granted request, freeing its slot, or withdraw a waiting
    /// one, failing its event with [`Fault::Canceled`]. Releasing twice is
    /// a no-op. Returns the release event, processed at the current time.
    pub fn release(&self, resource: ResourceId, request: EventId) -> Result<EventId> {
        let event = {
            let mut core = self.core.borrow_mut();
            let release = core.new_event();
            match core.resources[resource].remove(request) {
                RemoveOutcome::Waiting => {
                    core.fail_event(request, Fault::Canceled, 0)?;
                }
                RemoveOutcome::Granted | RemoveOutcome::Unknown => {}
            }
            core.succeed_event(release, None, 0)?;
            core.trigger_resource(resource)?;
            release
        };
        self.flush_monitor();
        Ok(event)
    }

    /// Number of granted requests.
    pub fn resource_users(&self, resource: ResourceId) -> usize {
        self.core.borrow().resources[resource].users()
    }

    /// Number of waiting requests.
    pub fn resource_queued(&self, resource: ResourceId) -> usize {
        self.core.borrow().resources[resource].queued()
    }

    /// Non-blocking availability query: free slots, or objects matching
    /// `filter` for pools.
    pub fn resource_available(
        &self,
        resource: ResourceId,
        filter: Option<&dyn Fn(&T) -> bool>,
    ) -> usize {
        self.core.borrow().resources[resource].available(filter)
    }
}
