use super::comm::{Resized, MASTER};

/// The members of one pool generation as seen by one rank.
///
/// A resize never mutates a pool in place, it produces the next generation. Anything that
/// refers to "the current pool" carries the generation so stale membership is detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    generation: u64,
    size: usize,
}

impl WorkerPool {
    pub fn new(generation: u64, size: usize) -> Self {
        debug_assert!(size > 0, "a pool has at least the master");

        Self { generation, size }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// number of ranks besides the master
    pub fn workers(&self) -> usize {
        self.size - 1
    }

    pub fn worker_ranks(&self) -> impl Iterator<Item = usize> {
        MASTER + 1..self.size
    }

    /// the generation produced by a resize
    pub fn advance(&self, resized: &Resized) -> Self {
        debug_assert_eq!(resized.generation, self.generation + 1);

        Self {
            generation: resized.generation,
            size: resized.size,
        }
    }
}
