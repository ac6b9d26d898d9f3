pub mod adapt;
pub mod comm;
pub mod fs;
pub mod jobs;
pub mod local;
pub mod message;
pub mod partition;
pub mod pool;
pub mod protocol;
pub mod reduce;

#[cfg(test)]
mod adapt_test;
#[cfg(test)]
mod fs_test;
#[cfg(test)]
mod jobs_test;

/*
 * Distributed evaluation of grid points: two operating modes
 * -> static: every rank computes its contiguous share of the pass range, no messaging
 * -> master-worker: rank 0 hands out fixed-size jobs on request, the pool may grow or
 *    shrink between jobs
 *
 * In both modes results never travel through messages. Every rank writes its records
 * into the shared-state files and everybody reads them back by index after the barrier.
 */

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Static,
    #[default]
    MasterWorker,
}
