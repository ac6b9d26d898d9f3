use super::{
    comm::{CommError, Communicator, Membership, Resized},
    jobs::JobQueue,
    message::Message,
    pool::WorkerPool,
    protocol::RangeCompute,
    reduce::reduce_global_best,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptDecision {
    Keep,
    /// grow (positive) or shrink (negative) the pool by this many ranks
    Resize(i64),
}

/// Everything a policy gets to see at an adaptation check.
#[derive(Debug, Clone, Copy)]
pub struct AdaptContext {
    pub pool: WorkerPool,
    pub pending_jobs: usize,
    pub done_jobs: usize,
    /// forward simulations per second since the last check
    pub throughput: f64,
    /// number of checks before this one
    pub checks: usize,
}

/// The external decision whether the pool should change size.
pub trait AdaptPolicy: Send {
    fn decide(&mut self, context: &AdaptContext) -> AdaptDecision;
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(tag = "name", rename_all = "snake_case", deny_unknown_fields)]
pub enum PolicyConfig {
    #[default]
    Never,
    /// one delta per check, checks beyond the script keep the pool as is
    Scripted { steps: Vec<i64> },
    /// move the pool to a fixed size at the first check
    Target { size: usize },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AdaptConfig {
    // milliseconds between two checks
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
            policy: PolicyConfig::default(),
        }
    }
}

fn default_frequency() -> u64 {
    10_000
}

#[derive(Debug, Clone)]
pub enum Policies {
    Never,
    Scripted { steps: Vec<i64> },
    Target { size: usize },
}

impl From<&PolicyConfig> for Policies {
    fn from(config: &PolicyConfig) -> Self {
        match config {
            PolicyConfig::Never => Self::Never,
            PolicyConfig::Scripted { steps } => Self::Scripted {
                steps: steps.clone(),
            },
            PolicyConfig::Target { size } => Self::Target { size: *size },
        }
    }
}

impl AdaptPolicy for Policies {
    fn decide(&mut self, context: &AdaptContext) -> AdaptDecision {
        match self {
            Self::Never => AdaptDecision::Keep,
            Self::Scripted { steps } => match steps.get(context.checks) {
                Some(&0) | None => AdaptDecision::Keep,
                Some(&delta) => AdaptDecision::Resize(delta),
            },
            Self::Target { size } => {
                let delta = *size as i64 - context.pool.size() as i64;

                if delta == 0 {
                    AdaptDecision::Keep
                } else {
                    AdaptDecision::Resize(delta)
                }
            }
        }
    }
}

/// Master side timer deciding when the pool may be resized.
pub struct AdaptationController {
    frequency: Duration,
    policy: Box<dyn AdaptPolicy>,
    max_ranks: usize,
    chunk_size: u64,
    tic: Instant,
    jobs_per_tic: usize,
    checks: usize,
}

impl AdaptationController {
    pub fn new(config: &AdaptConfig, chunk_size: u64, max_ranks: usize) -> Self {
        Self::with_policy(
            Duration::from_millis(config.frequency),
            Box::new(Policies::from(&config.policy)),
            chunk_size,
            max_ranks,
        )
    }

    pub fn with_policy(
        frequency: Duration,
        policy: Box<dyn AdaptPolicy>,
        chunk_size: u64,
        max_ranks: usize,
    ) -> Self {
        Self {
            frequency,
            policy,
            max_ranks: max_ranks.max(1),
            chunk_size,
            tic: Instant::now(),
            jobs_per_tic: 0,
            checks: 0,
        }
    }

    /// controller that never resizes, used by the static scheme and fixed pools
    pub fn disabled(chunk_size: u64) -> Self {
        Self::with_policy(Duration::MAX, Box::new(Policies::Never), chunk_size, 1)
    }

    /// restart the timer, a pass never inherits the throughput of the previous one
    pub fn start_pass(&mut self) {
        self.tic = Instant::now();
        self.jobs_per_tic = 0;
    }

    pub fn record_job(&mut self) {
        self.jobs_per_tic += 1;
    }

    /// Check whether the pool should be resized now, returns the effective size delta.
    ///
    /// Only called between jobs. The timer restarts after every check, a check without
    /// pending jobs never resizes.
    pub fn poll(&mut self, pool: &WorkerPool, queue: &JobQueue) -> Option<i64> {
        let toc = self.tic.elapsed();

        if toc < self.frequency {
            return None;
        }

        let throughput =
            (self.jobs_per_tic as u64 * self.chunk_size) as f64 / toc.as_secs_f64().max(1e-9);
        info!(
            throughput = throughput,
            "Forward simulations per second: {throughput:.6}"
        );

        let decision = if queue.has_pending() {
            let context = AdaptContext {
                pool: *pool,
                pending_jobs: queue.pending(),
                done_jobs: queue.done(),
                throughput,
                checks: self.checks,
            };

            self.checks += 1;
            self.policy.decide(&context)
        } else {
            debug!("No pending jobs, skipping adaptation");
            AdaptDecision::Keep
        };

        self.tic = Instant::now();
        self.jobs_per_tic = 0;

        match decision {
            AdaptDecision::Keep => None,
            AdaptDecision::Resize(delta) => {
                let size = (pool.size() as i64)
                    .saturating_add(delta)
                    .clamp(1, self.max_ranks as i64);
                let effective = size - pool.size() as i64;

                if effective == 0 {
                    debug!(delta = delta, "Resize is clamped to the current size, skipping");

                    None
                } else {
                    Some(effective)
                }
            }
        }
    }
}

/// Master side of a resize.
///
/// Drains every outstanding job first, so nothing is in flight while the membership
/// changes, then walks all current members through the reduction and the resize collective.
#[instrument(level = "info", skip(comm, queue, compute), fields(size = pool.size()))]
pub fn lead_resize<C, R>(
    comm: &mut C,
    pool: WorkerPool,
    queue: &mut JobQueue,
    compute: &mut R,
    delta: i64,
) -> Result<WorkerPool, R::Error>
where
    C: Communicator + Membership,
    R: RangeCompute,
{
    while queue.in_flight() > 0 {
        let (source, message) = comm.recv()?;

        match message {
            Message::Done(job) => queue.mark_done(job, source)?,
            Message::Work(_) | Message::Terminate | Message::AdaptSignal => {
                return Err(CommError::unexpected(comm.rank(), source, message.tag()).into());
            }
        }
    }

    for worker in pool.worker_ranks() {
        comm.send(worker, Message::AdaptSignal)?;
    }

    // departing ranks hand their best over before they leave
    let best = reduce_global_best(&*comm, compute.local_best())?;
    compute.set_local_best(best);

    let resized = comm.request_resize(Some(delta))?;
    let next = pool.advance(&resized);
    comm.join_barrier()?;

    info!(
        generation = next.generation(),
        previous_size = resized.previous_size,
        size = next.size(),
        pending = queue.pending(),
        "Resized pool"
    );

    Ok(next)
}

/// Worker side of a resize, `None` if the worker is not part of the new pool.
pub fn follow_resize<C, R>(
    comm: &mut C,
    pool: WorkerPool,
    compute: &mut R,
) -> Result<Option<WorkerPool>, R::Error>
where
    C: Communicator + Membership,
    R: RangeCompute,
{
    let best = reduce_global_best(&*comm, compute.local_best())?;
    compute.set_local_best(best);

    let resized = comm.request_resize(None)?;
    if resized.departed {
        return Ok(None);
    }

    let next = pool.advance(&resized);
    comm.join_barrier()?;

    Ok(Some(next))
}

/// Bootstrap of a rank spawned by a resize, it enters the pool with the generation it was
/// spawned into.
pub fn join_pool<C: Membership>(comm: &C, resized: &Resized) -> Result<WorkerPool, CommError> {
    comm.join_barrier()?;

    debug!(
        generation = resized.generation,
        size = resized.size,
        "Joined pool"
    );

    Ok(WorkerPool::new(resized.generation, resized.size))
}
