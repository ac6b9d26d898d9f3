use super::{
    adapt::{follow_resize, lead_resize, AdaptationController},
    comm::{CommError, Communicator, Membership, MASTER},
    jobs::{JobLayout, JobQueue},
    message::Message,
    partition::SeqRange,
    pool::WorkerPool,
    reduce::GlobalBest,
};
use tracing::{debug, info, instrument, trace};

/// Evaluation of a contiguous range of grid points on the calling rank.
///
/// Implementations write their records to the shared state before returning and track the
/// best posterior they have seen, the protocol never looks at the records themselves.
pub trait RangeCompute {
    type Error: From<CommError>;

    /// evaluate every index of `range`, empty ranges are a no-op
    fn compute_range(&mut self, range: SeqRange) -> Result<(), Self::Error>;

    fn local_best(&self) -> GlobalBest;

    /// replace the local best with a reduced one, done at every resize
    fn set_local_best(&mut self, best: GlobalBest);
}

/// What the master did during one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterReport {
    pub jobs: usize,
    /// jobs the master computed itself because the pool had no workers
    pub local_jobs: usize,
    pub terminations: usize,
    pub adaptations: usize,
    /// pool generation the pass ended with
    pub pool: WorkerPool,
}

/// hand one job to every idle worker, returns the number of jobs sent
pub fn seed_workers<C: Communicator>(
    comm: &C,
    pool: &WorkerPool,
    queue: &mut JobQueue,
) -> Result<usize, CommError> {
    let mut seeded = 0;

    for worker in pool.worker_ranks() {
        if queue.held_by(worker).is_some() {
            continue;
        }

        let Some(job) = queue.assign_next(worker)? else {
            break;
        };

        comm.send(worker, Message::Work(job.id))?;
        seeded += 1;
    }

    trace!(seeded = seeded, workers = pool.workers(), "Seeded workers");

    Ok(seeded)
}

/// Drive one pass as the master.
///
/// Jobs go out in ascending id order, one per worker, the next one as soon as the worker
/// acknowledges the previous. Without workers the master works through the queue itself.
/// The adaptation controller is consulted after every finished job and may resize the pool
/// between jobs.
#[instrument(level = "debug", skip(comm, compute, controller), fields(pass = %layout.pass()))]
pub fn master_compute<C, R>(
    comm: &mut C,
    pool: WorkerPool,
    layout: JobLayout,
    compute: &mut R,
    controller: &mut AdaptationController,
) -> Result<MasterReport, R::Error>
where
    C: Communicator + Membership,
    R: RangeCompute,
{
    let mut queue = JobQueue::new(layout);
    let mut pool = pool;
    let mut local_jobs = 0;
    let mut adaptations = 0;

    debug!(jobs = queue.len(), workers = pool.workers(), "Starting pass");
    controller.start_pass();

    while !queue.is_complete() {
        if pool.workers() == 0 {
            let Some(job) = queue.take_local() else {
                return Err(CommError::violation(
                    MASTER,
                    "queue is incomplete but holds no pending job",
                )
                .into());
            };

            compute.compute_range(job.range)?;
            queue.complete_local(job.id)?;
            local_jobs += 1;
        } else {
            // right after a resize nothing is in flight
            if queue.in_flight() == 0 {
                seed_workers(&*comm, &pool, &mut queue)?;
            }

            let (source, message) = comm.recv()?;

            match message {
                Message::Done(job) => {
                    queue.mark_done(job, source)?;
                    trace!(job = job, worker = source, "Job done");

                    if let Some(next) = queue.assign_next(source)? {
                        comm.send(source, Message::Work(next.id))?;
                    }
                }
                Message::Work(_) | Message::Terminate | Message::AdaptSignal => {
                    return Err(CommError::unexpected(MASTER, source, message.tag()).into());
                }
            }
        }

        controller.record_job();

        if let Some(delta) = controller.poll(&pool, &queue) {
            pool = lead_resize(comm, pool, &mut queue, compute, delta)?;
            adaptations += 1;
        }
    }

    for worker in pool.worker_ranks() {
        comm.send(worker, Message::Terminate)?;
    }

    let report = MasterReport {
        jobs: queue.done(),
        local_jobs,
        terminations: pool.workers(),
        adaptations,
        pool,
    };

    info!(
        jobs = report.jobs,
        local_jobs = report.local_jobs,
        adaptations = report.adaptations,
        size = pool.size(),
        "Pass complete"
    );

    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// the pass is over, the worker is a member of the returned pool
    Terminated(WorkerPool),
    /// the worker left the pool during a resize
    Departed,
}

/// Serve jobs until the master terminates the pass or the worker departs in a resize.
#[instrument(level = "debug", skip(comm, compute), fields(rank = comm.rank()))]
pub fn worker_compute<C, R>(
    comm: &mut C,
    pool: WorkerPool,
    layout: JobLayout,
    compute: &mut R,
) -> Result<WorkerExit, R::Error>
where
    C: Communicator + Membership,
    R: RangeCompute,
{
    let mut pool = pool;
    let mut jobs = 0usize;

    loop {
        let (source, message) = comm.recv()?;

        if source != MASTER {
            return Err(CommError::unexpected(comm.rank(), source, message.tag()).into());
        }

        match message {
            Message::Work(job) => {
                if job >= layout.job_count() {
                    return Err(CommError::violation(
                        comm.rank(),
                        format!("job {job} is outside of the pass ({} jobs)", layout.job_count()),
                    )
                    .into());
                }

                compute.compute_range(layout.range(job))?;
                comm.send(MASTER, Message::Done(job))?;
                jobs += 1;
            }
            Message::Terminate => {
                debug!(jobs = jobs, "Worker terminated");

                return Ok(WorkerExit::Terminated(pool));
            }
            Message::AdaptSignal => match follow_resize(comm, pool, compute)? {
                Some(next) => pool = next,
                None => {
                    debug!(jobs = jobs, "Worker departed");

                    return Ok(WorkerExit::Departed);
                }
            },
            Message::Done(_) => {
                return Err(CommError::unexpected(comm.rank(), source, message.tag()).into());
            }
        }
    }
}
