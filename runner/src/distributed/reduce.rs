use super::comm::{CommError, Communicator};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Highest posterior seen so far and the sequence index of the point it belongs to.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct GlobalBest {
    pub value: f64,
    pub index: u64,
}

impl Default for GlobalBest {
    fn default() -> Self {
        Self {
            value: f64::NEG_INFINITY,
            index: 0,
        }
    }
}

impl GlobalBest {
    /// record a freshly computed point, only strictly better values replace the current best
    pub fn offer(&mut self, value: f64, index: u64) -> bool {
        if value > self.value {
            self.value = value;
            self.index = index;

            true
        } else {
            false
        }
    }

    pub fn is_set(&self) -> bool {
        self.value > f64::NEG_INFINITY
    }
}

/// Combine the local bests of all ranks into one result held identically by every rank.
///
/// Only the value and the index travel through the collectives, coordinates and outputs
/// are recovered from the shared state files by index.
#[instrument(level = "debug", skip(comm))]
pub fn reduce_global_best<C: Communicator>(
    comm: &C,
    local: GlobalBest,
) -> Result<GlobalBest, CommError> {
    if comm.size() <= 1 {
        return Ok(local);
    }

    let (value, owner) = comm.all_reduce_max_loc(local.value)?;
    let index = comm.broadcast(owner, local.index)?;

    debug!(value = value, owner = owner, index = index, "Reduced global best");

    Ok(GlobalBest { value, index })
}
