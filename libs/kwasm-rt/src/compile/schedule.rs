// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Holds executed compilation units until they are finished.
///
/// With throttling enabled the schedule tracks the memory held by its units:
/// producers stop once it exceeds `max_memory` and resume once it has dropped
/// to half of that. Units are picked at random rather than in order.
#[derive(Debug)]
pub(crate) struct CodeGenerationSchedule<T> {
    schedule: Vec<(T, usize)>,
    rng: SmallRng,
    allocated_memory: usize,
    max_memory: usize,
    throttle: bool,
}

impl<T> CodeGenerationSchedule<T> {
    pub(crate) fn new(seed: u64, max_memory: usize) -> Self {
        Self {
            schedule: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
            allocated_memory: 0,
            max_memory,
            throttle: false,
        }
    }

    pub(crate) fn schedule(&mut self, item: T, memory_cost: usize) {
        self.allocated_memory += memory_cost;
        self.schedule.push((item, memory_cost));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.schedule.len()
    }

    pub(crate) fn get_next(&mut self) -> Option<T> {
        if self.schedule.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..self.schedule.len());
        let (item, cost) = self.schedule.swap_remove(index);
        self.allocated_memory -= cost;
        Some(item)
    }

    pub(crate) fn can_accept_work(&self) -> bool {
        !self.throttle || self.allocated_memory <= self.max_memory
    }

    pub(crate) fn should_increase_workload(&self) -> bool {
        !self.throttle || self.allocated_memory <= self.max_memory / 2
    }

    pub(crate) fn enable_throttling(&mut self) {
        self.throttle = true;
    }

    pub(crate) fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn watermarks() {
        let mut schedule = CodeGenerationSchedule::new(1, 100);
        schedule.schedule(0, 80);
        assert!(schedule.can_accept_work());

        schedule.schedule(1, 80);
        // unthrottled schedules accept anything
        assert!(schedule.can_accept_work());

        schedule.enable_throttling();
        assert!(!schedule.can_accept_work());
        assert!(!schedule.should_increase_workload());

        schedule.get_next().unwrap();
        assert!(schedule.can_accept_work());
        assert!(!schedule.should_increase_workload());

        schedule.get_next().unwrap();
        assert!(schedule.should_increase_workload());
        assert!(schedule.get_next().is_none());
    }

    proptest! {
        #[test]
        fn drains_every_item(costs in proptest::collection::vec(0usize..1000, 0..64), seed: u64) {
            let mut schedule = CodeGenerationSchedule::new(seed, 4096);
            schedule.enable_throttling();
            for (i, cost) in costs.iter().enumerate() {
                schedule.schedule(i, *cost);
            }
            prop_assert_eq!(schedule.allocated_memory(), costs.iter().sum::<usize>());

            let mut seen = Vec::new();
            while let Some(item) = schedule.get_next() {
                seen.push(item);
            }
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..costs.len()).collect::<Vec<_>>());
            prop_assert_eq!(schedule.allocated_memory(), 0);
            prop_assert!(schedule.can_accept_work());
        }
    }
}
