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

//! Containers: bounded buffers of a continuous quantity.
//!
//! A container holds a real-valued level between zero and its capacity.
//! [`Simulation::put`] fires once the amount fits under the capacity,
//! [`Simulation::get`] once the level covers the amount. Both sides are
//! FIFO and block at the head: a request that cannot be satisfied keeps
//! every request behind it waiting, and an amount is never split across
//! several partial satisfactions.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::simulation::{Core, Sample, Simulation};
use crate::{ContainerId, EventId};

struct AmountRequest {
    event: EventId,
    amount: f64,
}

pub(crate) struct ContainerState {
    capacity: f64,
    level: f64,
    put_queue: VecDeque<AmountRequest>,
    get_queue: VecDeque<AmountRequest>,
}

impl ContainerState {
    fn head_put_fits(&self) -> bool {
        match self.put_queue.front() {
            Some(request) => self.level + request.amount <= self.capacity,
            None => false,
        }
    }

    fn head_get_covered(&self) -> bool {
        match self.get_queue.front() {
            Some(request) => self.level >= request.amount,
            None => false,
        }
    }
}

impl<T: Clone + 'static> Core<T> {
    /// Alternate the two scans until neither side makes progress: a
    /// satisfied get may make room for a put and the other way round.
    pub(crate) fn trigger_container(&mut self, container: ContainerId) -> Result<()> {
        loop {
            let mut progressed = false;
            while self.containers[container].head_put_fits() {
                let request = self.containers[container]
                    .put_queue
                    .pop_front()
                    .expect("head was checked");
                self.containers[container].level += request.amount;
                self.succeed_event(request.event, None, 0)?;
                progressed = true;
            }
            while self.containers[container].head_get_covered() {
                let request = self.containers[container]
                    .get_queue
                    .pop_front()
                    .expect("head was checked");
                self.containers[container].level -= request.amount;
                self.succeed_event(request.event, None, 0)?;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        let level = self.containers[container].level;
        let capacity = self.containers[container].capacity;
        self.emit_sample(Sample::ContainerLevel {
            container,
            level,
            capacity,
        });
        Ok(())
    }
}

impl<T: Clone + 'static> Simulation<T> {
    /// Register a container with the given capacity and initial level.
    ///
    /// Returns the identifier of the container.
    pub fn create_container(&self, capacity: f64, initial: f64) -> Result<ContainerId> {
        if !(capacity > 0.0 && capacity.is_finite()) {
            return Err(Error::InvalidArgument(format!(
                "container capacity must be positive and finite, got {}",
                capacity
            )));
        }
        if !(initial >= 0.0 && initial <= capacity) {
            return Err(Error::InvalidArgument(format!(
                "initial level {} outside [0, {}]",
                initial, capacity
            )));
        }
        let mut core = self.core.borrow_mut();
        let id = core.containers.len();
        core.containers.push(ContainerState {
            capacity,
            level: initial,
            put_queue: VecDeque::new(),
            get_queue: VecDeque::new(),
        });
        Ok(id)
    }

    /// Deposit `amount` into the container. The returned event fires once
    /// the whole amount fits.
    pub fn put(&self, container: ContainerId, amount: f64) -> Result<EventId> {
        let event = {
            let mut core = self.core.borrow_mut();
            check_amount(amount, core.containers[container].capacity)?;
            let event = core.new_event();
            core.containers[container]
                .put_queue
                .push_back(AmountRequest { event, amount });
            core.trigger_container(container)?;
            event
        };
        self.flush_monitor();
        Ok(event)
    }

    /// Withdraw `amount` from the container. The returned event fires once
    /// the level covers the whole amount.
    pub fn get(&self, container: ContainerId, amount: f64) -> Result<EventId> {
        let event = {
            let mut core = self.core.borrow_mut();
            check_amount(amount, core.containers[container].capacity)?;
            let event = core.new_event();
            core.containers[container]
                .get_queue
                .push_back(AmountRequest { event, amount });
            core.trigger_container(container)?;
            event
        };
        self.flush_monitor();
        Ok(event)
    }

    /// The current level of the container.
    pub fn container_level(&self, container: ContainerId) -> f64 {
        self.core.borrow().containers[container].level
    }

    /// The capacity of the container.
    pub fn container_capacity(&self, container: ContainerId) -> f64 {
        self.core.borrow().containers[container].capacity
    }
}

fn check_amount(amount: f64, capacity: f64) -> Result<()> {
    if !(amount > 0.0 && amount.is_finite()) {
        return Err(Error::InvalidArgument(format!(
            "amount must be positive and finite, got {}",
            amount
        )));
    }
    if amount > capacity {
        return Err(Error::InvalidArgument(format!(
            "amount {} exceeds the container capacity {}",
            amount, capacity
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn invalid_capacities_and_amounts_are_rejected() {
        let s: Simulation<u32> = Simulation::new();
        assert!(matches!(
            s.create_container(0.0, 0.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            s.create_container(2.0, 3.0),
            Err(Error::InvalidArgument(_))
        ));
        let c = s.create_container(2.0, 0.0).unwrap();
        assert!(matches!(s.put(c, 0.0), Err(Error::InvalidArgument(_))));
        assert!(matches!(s.put(c, -1.0), Err(Error::InvalidArgument(_))));
        assert!(matches!(s.put(c, 3.0), Err(Error::InvalidArgument(_))));
        assert!(matches!(s.get(c, 3.0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn producer_and_getter_alternate() {
        let s: Simulation<u32> = Simulation::new();
        let c = s.create_container(2.0, 0.0).unwrap();
        let log: Rc<RefCell<Vec<(char, f64)>>> = Rc::new(RefCell::new(Vec::new()));

        let s2 = s.clone();
        let l = Rc::clone(&log);
        s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| {
                yield Effect::TimeOut(1.0);
                let put = s2.put(c, 2.0).unwrap();
                yield Effect::Event(put);
                l.borrow_mut().push(('p', s2.time()));
                yield Effect::TimeOut(1.0);
                let put = s2.put(c, 2.0).unwrap();
                yield Effect::Event(put);
                l.borrow_mut().push(('p', s2.time()));
            },
        ));

        let s2 = s.clone();
        let l = Rc::clone(&log);
        s.create_process(Box::new(
            #[coroutine]
            move |_: SimContext<u32>| {
                let get = s2.get(c, 1.0).unwrap();
                yield Effect::Event(get);
                l.borrow_mut().push(('g', s2.time()));
                yield Effect::TimeOut(1.0);
                let get = s2.get(c, 1.0).unwrap();
                yield Effect::Event(get);
                l.borrow_mut().push(('g', s2.time()));
            },
        ));

        s.run(EndCondition::NoEvents).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![('p', 1.0), ('g', 1.0), ('g', 2.0), ('p', 2.0)]
        );
        assert_eq!(s.container_level(c), 2.0);
    }

    #[test]
    fn a_blocked_head_get_holds_back_smaller_ones() {
        let s: Simulation<u32> = Simulation::new();
        let c = s.create_container(10.0, 1.0).unwrap();
        let big = s.get(c, 2.0).unwrap();
        let small = s.get(c, 1.0).unwrap();
        // The level would cover the second get, but the head blocks.
        assert!(!s.is_triggered(big));
        assert!(!s.is_triggered(small));
        s.put(c, 2.0).unwrap();
        assert!(s.is_triggered(big));
        assert!(s.is_triggered(small));
        assert_eq!(s.container_level(c), 0.0);
    }

    #[test]
    fn amounts_are_never_split() {
        let s: Simulation<u32> = Simulation::new();
        let c = s.create_container(4.0, 0.0).unwrap();
        let get = s.get(c, 4.0).unwrap();
        s.put(c, 2.0).unwrap();
        assert!(!s.is_triggered(get));
        assert_eq!(s.container_level(c), 2.0);
        s.put(c, 2.0).unwrap();
        assert!(s.is_triggered(get));
        assert_eq!(s.container_level(c), 0.0);
    }

    #[test]
    fn put_and_get_totals_match_the_level() {
        let s: Simulation<u32> = Simulation::new();
        let c = s.create_container(100.0, 50.0).unwrap();
        let mut balance = 0.0;
        for round in 0..30 {
            let amount = s.random(|rng| rand::Rng::gen_range(rng, 0.1..5.0));
            if round % 2 == 0 {
                s.put(c, amount).unwrap();
                balance += amount;
            } else {
                s.get(c, amount).unwrap();
                balance -= amount;
            }
        }
        s.run(EndCondition::NoEvents).unwrap();
        // Far from the bounds every request was satisfied immediately, so
        // the level moved by exactly the put/get balance.
        assert!((s.container_level(c) - (50.0 + balance)).abs() < 1e-9);
    }
}
