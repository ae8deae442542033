//! # Observation history
//!
//! A bounded buffer of the most recent observations, used to build the
//! conditioning at inference time.

use std::collections::VecDeque;
use tch::Tensor;

/// A bounded-length ordered buffer of observation tensors, each shaped
/// `(num_envs, obs_dim)`.
///
/// Pushing past capacity evicts the oldest entry. Reading always yields
/// exactly `capacity` steps: before the buffer has filled up after a reset,
/// the missing prefix is zero-filled, matching the zero padding at episode
/// starts in the training data.
#[derive(Debug)]
pub struct ContextBuffer {
    capacity: usize,
    entries: VecDeque<Tensor>,
}

impl ContextBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    /// Appends an observation, evicting the oldest entry once full.
    pub fn push(&mut self, observation: Tensor) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(observation);
    }

    /// Empties the buffer, e.g. at an episode boundary.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The history stacked along a new time axis, `(num_envs, capacity,
    /// obs_dim)`, oldest first. At least one observation must have been
    /// pushed since the last reset.
    pub fn stacked(&self) -> Tensor {
        let newest = self.entries.back().expect("context buffer read before any push");
        let padding = newest.zeros_like();
        let mut steps: Vec<Tensor> = Vec::with_capacity(self.capacity);
        for _ in self.entries.len()..self.capacity {
            steps.push(padding.shallow_clone());
        }
        for entry in self.entries.iter() {
            steps.push(entry.shallow_clone());
        }
        Tensor::stack(&steps, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn obs(value: f64) -> Tensor {
        Tensor::full([2, 3], value, (Kind::Float, Device::Cpu))
    }

    // The constant value stored at each timestep of the first environment.
    fn timestep_values(stacked: &Tensor) -> Vec<f64> {
        (0..stacked.size()[1])
            .map(|i| f64::try_from(stacked.get(0).get(i).mean(Kind::Float)).unwrap())
            .collect()
    }

    #[test]
    fn returns_entries_in_push_order() {
        let mut buffer = ContextBuffer::new(3);
        for value in [1., 2., 3.] {
            buffer.push(obs(value));
        }
        let stacked = buffer.stacked();
        assert_eq!(stacked.size(), vec![2, 3, 3]);
        assert_eq!(timestep_values(&stacked), vec![1., 2., 3.]);
    }

    #[test]
    fn eviction_keeps_the_most_recent_window() {
        let mut buffer = ContextBuffer::new(2);
        for value in [1., 2., 3.] {
            buffer.push(obs(value));
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(timestep_values(&buffer.stacked()), vec![2., 3.]);
    }

    #[test]
    fn cold_start_is_zero_padded() {
        let mut buffer = ContextBuffer::new(4);
        buffer.push(obs(5.));
        let stacked = buffer.stacked();
        assert_eq!(stacked.size(), vec![2, 4, 3]);
        assert_eq!(timestep_values(&stacked), vec![0., 0., 0., 5.]);
    }

    #[test]
    fn reset_empties_the_buffer() {
        let mut buffer = ContextBuffer::new(3);
        buffer.push(obs(1.));
        buffer.push(obs(2.));
        buffer.reset();
        assert!(buffer.is_empty());
        buffer.push(obs(7.));
        assert_eq!(timestep_values(&buffer.stacked()), vec![0., 0., 7.]);
    }
}
