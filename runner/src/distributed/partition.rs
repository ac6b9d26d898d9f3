use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive range of grid point sequence indices, possibly empty.
///
/// An empty range is what the static partition hands to ranks that have nothing to do,
/// every consumer treats it as a no-op.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SeqRange {
    start: u64,
    count: u64,
}

impl SeqRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    /// `[min, max]`, where `max == min - 1` denotes the empty range starting at `min`
    pub fn inclusive(min: u64, max: u64) -> Self {
        Self {
            start: min,
            count: (max + 1).saturating_sub(min),
        }
    }

    pub fn empty(start: u64) -> Self {
        Self { start, count: 0 }
    }

    pub fn min(&self) -> u64 {
        self.start
    }

    /// last index of the range, `None` if the range is empty
    pub fn max(&self) -> Option<u64> {
        self.count.checked_sub(1).map(|last| self.start + last)
    }

    /// one past the last index
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> std::ops::Range<u64> {
        self.start..self.end()
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max() {
            Some(max) => write!(f, "[{}, {}]", self.start, max),
            None => write!(f, "[{}, -]", self.start),
        }
    }
}

/// Contiguous share of `global` for `rank` out of `size` ranks.
///
/// The first `count % size` ranks receive one extra item, so the shares of all ranks cover
/// `global` exactly once. With fewer items than ranks the trailing ranks get empty ranges.
pub fn local_range(global: SeqRange, size: usize, rank: usize) -> SeqRange {
    debug_assert!(size > 0, "a pool has at least one rank");
    debug_assert!(rank < size, "rank {rank} is outside a pool of {size}");

    let size = size as u64;
    let rank = rank as u64;
    let trunk = global.len() / size;
    let rest = global.len() % size;

    if rank < rest {
        SeqRange::new(global.min() + rank * (trunk + 1), trunk + 1)
    } else {
        SeqRange::new(global.min() + rank * trunk + rest, trunk)
    }
}
