use super::{comm::CommError, partition::SeqRange};
use tracing::trace;

pub type JobId = usize;

/// Pure mapping of job ids onto a pass range.
///
/// Every rank can rebuild the layout from the pass range and the chunk size, so only job ids
/// ever travel through messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLayout {
    pass: SeqRange,
    chunk_size: u64,
}

impl JobLayout {
    pub fn new(pass: SeqRange, chunk_size: u64) -> Self {
        debug_assert!(chunk_size > 0, "chunk size must be positive");

        Self {
            pass,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn pass(&self) -> SeqRange {
        self.pass
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(len / chunk_size)`
    pub fn job_count(&self) -> usize {
        self.pass.len().div_ceil(self.chunk_size) as usize
    }

    /// the last job may be shorter than `chunk_size`, ids beyond the count map to empty ranges
    pub fn range(&self, job: JobId) -> SeqRange {
        let offset = (job as u64).saturating_mul(self.chunk_size);

        if offset >= self.pass.len() {
            return SeqRange::empty(self.pass.end());
        }

        let count = self.chunk_size.min(self.pass.len() - offset);

        SeqRange::new(self.pass.min() + offset, count)
    }

    pub fn jobs(&self) -> impl Iterator<Item = Job> + '_ {
        (0..self.job_count()).map(|id| Job {
            id,
            range: self.range(id),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub range: SeqRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    InFlight { worker: usize },
    Done,
}

/// Scheduler state of one pass, owned by the master.
///
/// Jobs are handed out strictly in ascending id order, independent of which worker asks.
#[derive(Debug, Clone)]
pub struct JobQueue {
    layout: JobLayout,
    states: Vec<JobState>,
    next: JobId,
    in_flight: usize,
    done: usize,
}

impl JobQueue {
    pub fn new(layout: JobLayout) -> Self {
        Self {
            states: vec![JobState::Pending; layout.job_count()],
            layout,
            next: 0,
            in_flight: 0,
            done: 0,
        }
    }

    pub fn layout(&self) -> JobLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, job: JobId) -> Option<JobState> {
        self.states.get(job).copied()
    }

    /// id of the next job to hand out, if any
    pub fn next_pending(&self) -> Option<JobId> {
        (self.next < self.states.len()).then_some(self.next)
    }

    pub fn has_pending(&self) -> bool {
        self.next_pending().is_some()
    }

    pub fn pending(&self) -> usize {
        self.states.len() - self.next
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn is_complete(&self) -> bool {
        self.done == self.states.len()
    }

    /// job currently held by `worker`
    pub fn held_by(&self, worker: usize) -> Option<JobId> {
        self.states
            .iter()
            .position(|state| *state == JobState::InFlight { worker })
    }

    /// hand the next pending job to `worker`
    pub fn assign_next(&mut self, worker: usize) -> Result<Option<Job>, CommError> {
        let Some(id) = self.next_pending() else {
            return Ok(None);
        };

        if let Some(held) = self.held_by(worker) {
            return Err(CommError::violation(
                worker,
                format!("worker already holds job {held}, refusing to assign job {id}"),
            ));
        }

        self.states[id] = JobState::InFlight { worker };
        self.next += 1;
        self.in_flight += 1;
        trace!(job = id, worker = worker, "Assigned job");

        Ok(Some(Job {
            id,
            range: self.layout.range(id),
        }))
    }

    /// acknowledge a job that was in flight on `worker`
    pub fn mark_done(&mut self, job: JobId, worker: usize) -> Result<(), CommError> {
        match self.states.get(job) {
            Some(JobState::InFlight { worker: holder }) if *holder == worker => {
                self.states[job] = JobState::Done;
                self.in_flight -= 1;
                self.done += 1;

                Ok(())
            }
            Some(state) => Err(CommError::violation(
                worker,
                format!("acknowledged job {job} which is {state:?}"),
            )),
            None => Err(CommError::violation(
                worker,
                format!("acknowledged unknown job {job} (queue holds {})", self.len()),
            )),
        }
    }

    /// take the next pending job and execute it in place, used when the pool has no workers
    pub fn take_local(&mut self) -> Option<Job> {
        let id = self.next_pending()?;

        self.states[id] = JobState::InFlight { worker: super::comm::MASTER };
        self.next += 1;
        self.in_flight += 1;

        Some(Job {
            id,
            range: self.layout.range(id),
        })
    }

    /// finish a job taken with `take_local`
    pub fn complete_local(&mut self, job: JobId) -> Result<(), CommError> {
        self.mark_done(job, super::comm::MASTER)
    }
}
