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

//! Stores: bounded buffers of discrete items.
//!
//! A store holds up to `capacity` items of the simulation's payload type.
//! [`Simulation::store_put`] inserts once a slot is free,
//! [`Simulation::store_get`] removes an item and delivers it as the value
//! of the get event. Gets may carry a filter
//! ([`Simulation::store_get_where`]); the get scan skips gets whose filter
//! matches nothing and stops only when the store is empty, so one picky
//! consumer does not starve the rest. Puts are strictly FIFO and block at
//! the head when the store is full.
//!
//! The item discipline is pluggable through the [`Store`] trait:
//! [`SimpleStore`] is FIFO, [`PriorityStore`] hands out the lowest
//! priority number first. A get with a filter on a [`SimpleStore`] is
//! exactly the classic filter store, hence the [`FilterStore`] alias.
//!
//! Stores also expose one-shot hook events —
//! [`when_new`](Simulation::when_new), [`when_any`](Simulation::when_any),
//! [`when_full`](Simulation::when_full),
//! [`when_empty`](Simulation::when_empty) and
//! [`when_change`](Simulation::when_change) — for processes that watch a
//! store without consuming from it.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::simulation::{Core, Sample, Simulation};
use crate::{EventId, Priority, StoreId};

/// Filter deciding which items can satisfy a get.
pub type ItemFilter<T> = Box<dyn Fn(&T) -> bool>;

/// Item discipline of a store, usable with
/// [`Simulation::create_store`].
pub trait Store<T> {
    fn capacity(&self) -> usize;
    fn len(&self) -> usize;
    /// Add an item. `priority` is meaningful only to priority disciplines.
    fn insert(&mut self, item: T, priority: Priority);
    /// Remove and return the first item accepted by `filter` (or simply
    /// the next item), if any.
    fn take(&mut self, filter: Option<&dyn Fn(&T) -> bool>) -> Option<T>;
    /// The items currently held, in take order.
    fn snapshot(&self) -> Vec<T>;
}

/// First-in-first-out store.
pub struct SimpleStore<T> {
    capacity: usize,
    items: VecDeque<T>,
}

/// A get with a filter against a [`SimpleStore`] takes the first matching
/// item in insertion order, which is the classic filter store.
pub type FilterStore<T> = SimpleStore<T>;

impl<T> SimpleStore<T> {
    pub fn new(capacity: usize) -> SimpleStore<T> {
        SimpleStore {
            capacity,
            items: VecDeque::new(),
        }
    }
}

impl<T: Clone> Store<T> for SimpleStore<T> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn insert(&mut self, item: T, _priority: Priority) {
        self.items.push_back(item);
    }

    fn take(&mut self, filter: Option<&dyn Fn(&T) -> bool>) -> Option<T> {
        match filter {
            None => self.items.pop_front(),
            Some(filter) => {
                let at = self.items.iter().position(|item| filter(item))?;
                self.items.remove(at)
            }
        }
    }

    fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Store handing out the item with the lowest priority number first, FIFO
/// among equal priorities.
pub struct PriorityStore<T> {
    capacity: usize,
    seq: u64,
    items: Vec<(Priority, u64, T)>,
}

impl<T> PriorityStore<T> {
    pub fn new(capacity: usize) -> PriorityStore<T> {
        PriorityStore {
            capacity,
            seq: 0,
            items: Vec::new(),
        }
    }

    fn best_matching(&self, filter: Option<&dyn Fn(&T) -> bool>) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, (_, _, item))| filter.map_or(true, |filter| filter(item)))
            .min_by_key(|(_, (priority, seq, _))| (*priority, *seq))
            .map(|(at, _)| at)
    }
}

impl<T: Clone> Store<T> for PriorityStore<T> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn insert(&mut self, item: T, priority: Priority) {
        let seq = self.seq;
        self.seq += 1;
        self.items.push((priority, seq, item));
    }

    fn take(&mut self, filter: Option<&dyn Fn(&T) -> bool>) -> Option<T> {
        let at = self.best_matching(filter)?;
        Some(self.items.remove(at).2)
    }

    fn snapshot(&self) -> Vec<T> {
        let mut ordered: Vec<_> = self.items.iter().collect();
        ordered.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        ordered.into_iter().map(|(_, _, item)| item.clone()).collect()
    }
}

struct StorePut<T> {
    event: EventId,
    /// Taken out when the item is inserted.
    item: Option<T>,
    priority: Priority,
}

struct StoreGet<T> {
    event: EventId,
    filter: Option<ItemFilter<T>>,
}

pub(crate) struct StoreState<T> {
    imp: Box<dyn Store<T>>,
    put_queue: VecDeque<StorePut<T>>,
    get_queue: VecDeque<StoreGet<T>>,
    when_new: Vec<EventId>,
    when_any: Vec<EventId>,
    when_full: Vec<EventId>,
    when_empty: Vec<EventId>,
    when_change: Vec<EventId>,
}

impl<T: Clone + 'static> Core<T> {
    pub(crate) fn trigger_store(&mut self, store: StoreId) -> Result<()> {
        let mut puts = 0usize;
        let mut gets = 0usize;
        loop {
            let mut progressed = false;
            // Puts are FIFO and block at the head when full.
            loop {
                let insertable = {
                    let state = &self.stores[store];
                    !state.put_queue.is_empty() && state.imp.len() < state.imp.capacity()
                };
                if !insertable {
                    break;
                }
                let mut put = self.stores[store]
                    .put_queue
                    .pop_front()
                    .expect("checked non-empty");
                let item = put.item.take().expect("puts hold their item until inserted");
                self.stores[store].imp.insert(item, put.priority);
                self.succeed_event(put.event, None, 0)?;
                puts += 1;
                progressed = true;
            }
            // Gets are scanned in order; an unmatched filter is skipped,
            // the scan ends when no items remain.
            let mut at = 0;
            loop {
                let state = &mut self.stores[store];
                if at >= state.get_queue.len() || state.imp.len() == 0 {
                    break;
                }
                let taken = {
                    let filter = state.get_queue[at].filter.as_deref();
                    state.imp.take(filter)
                };
                match taken {
                    Some(item) => {
                        let get = state.get_queue.remove(at).expect("index in bounds");
                        self.succeed_event(get.event, Some(item), 0)?;
                        gets += 1;
                        progressed = true;
                    }
                    None => at += 1,
                }
            }
            if !progressed {
                break;
            }
        }
        self.fire_store_hooks(store, puts, gets)?;
        let items = self.stores[store].imp.len();
        let capacity = self.stores[store].imp.capacity();
        self.emit_sample(Sample::StoreCount {
            store,
            items,
            capacity,
        });
        Ok(())
    }

    fn fire_store_hooks(&mut self, store: StoreId, puts: usize, gets: usize) -> Result<()> {
        let len = self.stores[store].imp.len();
        let capacity = self.stores[store].imp.capacity();
        if puts > 0 {
            let waiters = std::mem::take(&mut self.stores[store].when_new);
            self.fire_hooks(waiters)?;
        }
        if puts + gets > 0 {
            let waiters = std::mem::take(&mut self.stores[store].when_change);
            self.fire_hooks(waiters)?;
        }
        if len > 0 {
            let waiters = std::mem::take(&mut self.stores[store].when_any);
            self.fire_hooks(waiters)?;
        }
        if len == capacity {
            let waiters = std::mem::take(&mut self.stores[store].when_full);
            self.fire_hooks(waiters)?;
        }
        if len == 0 && gets > 0 {
            let waiters = std::mem::take(&mut self.stores[store].when_empty);
            self.fire_hooks(waiters)?;
        }
        Ok(())
    }

    fn fire_hooks(&mut self, waiters: Vec<EventId>) -> Result<()> {
        for event in waiters {
            self.succeed_event(event, None, 0)?;
        }
        Ok(())
    }
}

impl<T: Clone + 'static> Simulation<T> {
    /// Register a store.
    ///
    /// For more information about a store, see the crate level
    /// documentation.
    ///
    /// Returns the identifier of the store.
    pub fn create_store(&self, store: Box<dyn Store<T>>) -> Result<StoreId> {
        if store.capacity() == 0 {
            return Err(Error::InvalidArgument(
                "store capacity must be positive".into(),
            ));
        }
        let mut core = self.core.borrow_mut();
        let id = core.stores.len();
        core.stores.push(StoreState {
            imp: store,
            put_queue: VecDeque::new(),
            get_queue: VecDeque::new(),
            when_new: Vec::new(),
            when_any: Vec::new(),
            when_full: Vec::new(),
            when_empty: Vec::new(),
            when_change: Vec::new(),
        });
        Ok(id)
    }

    /// Insert an item. The returned event fires once the item is in the
    /// store.
    pub fn store_put(&self, store: StoreId, item: T) -> Result<EventId> {
        self.store_put_with(store, item, 0)
    }

    /// [`store_put`](Simulation::store_put) with an item priority, honored
    /// by priority disciplines.
    pub fn store_put_with(&self, store: StoreId, item: T, priority: Priority) -> Result<EventId> {
        let event = {
            let mut core = self.core.borrow_mut();
            let event = core.new_event();
            core.stores[store].put_queue.push_back(StorePut {
                event,
                item: Some(item),
                priority,
            });
            core.trigger_store(store)?;
            event
        };
        self.flush_monitor();
        Ok(event)
    }

    /// Remove the next item. The returned event fires with the item as its
    /// value.
    pub fn store_get(&self, store: StoreId) -> Result<EventId> {
        self.store_get_impl(store, None)
    }

    /// Remove the first item accepted by `filter`, in the take order of
    /// the store's discipline.
    pub fn store_get_where(
        &self,
        store: StoreId,
        filter: impl Fn(&T) -> bool + 'static,
    ) -> Result<EventId> {
        self.store_get_impl(store, Some(Box::new(filter)))
    }

    fn store_get_impl(&self, store: StoreId, filter: Option<ItemFilter<T>>) -> Result<EventId> {
        let event = {
            let mut core = self.core.borrow_mut();
            let event = core.new_event();
            core.stores[store]
                .get_queue
                .push_back(StoreGet { event, filter });
            core.trigger_store(store)?;
            event
        };
        self.flush_monitor();
        Ok(event)
    }

    /// Number of items currently held.
    pub fn store_count(&self, store: StoreId) -> usize {
        self.core.borrow().stores[store].imp.len()
    }

    /// The items currently held, in take order.
    pub fn store_items(&self, store: StoreId) -> Vec<T> {
        self.core.borrow().stores[store].imp.snapshot()
    }

    /// One-shot event firing on the next successful put.
    pub fn when_new(&self, store: StoreId) -> EventId {
        let mut core = self.core.borrow_mut();
        let event = core.new_event();
        core.stores[store].when_new.push(event);
        event
    }

    /// One-shot event firing when the store holds any item; immediate if
    /// it already does.
    pub fn when_any(&self, store: StoreId) -> EventId {
        let mut core = self.core.borrow_mut();
        let event = core.new_event();
        if core.stores[store].imp.len() > 0 {
            core.succeed_event(event, None, 0)
                .expect("a fresh event cannot be triggered");
        } else {
            core.stores[store].when_any.push(event);
        }
        event
    }

    /// One-shot event firing when the store is full; immediate if it
    /// already is.
    pub fn when_full(&self, store: StoreId) -> EventId {
        let mut core = self.core.borrow_mut();
        let event = core.new_event();
        if core.stores[store].imp.len() == core.stores[store].imp.capacity() {
            core.succeed_event(event, None, 0)
                .expect("a fresh event cannot be triggered");
        } else {
            core.stores[store].when_full.push(event);
        }
        event
    }

    /// One-shot event firing when the store is empty; immediate if it
    /// already is.
    pub fn when_empty(&self, store: StoreId) -> EventId {
        let mut core = self.core.borrow_mut();
        let event = core.new_event();
        if core.stores[store].imp.len() == 0 {
            core.succeed_event(event, None, 0)
                .expect("a fresh event cannot be triggered");
        } else {
            core.stores[store].when_empty.push(event);
        }
        event
    }

    /// One-shot event firing on the next level change in either direction.
    pub fn when_change(&self, store: StoreId) -> EventId {
        let mut core = self.core.borrow_mut();
        let event = core.new_event();
        core.stores[store].when_change.push(event);
        event
    }
}
