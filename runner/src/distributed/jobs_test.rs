use super::{
    jobs::{JobLayout, JobQueue, JobState},
    partition::SeqRange,
};
use proptest::prelude::*;

#[test]
pub fn twenty_three_points_chunks_of_five() {
    let layout = JobLayout::new(SeqRange::new(0, 23), 5);

    assert_eq!(layout.job_count(), 5);
    assert_eq!(layout.range(0), SeqRange::inclusive(0, 4));
    assert_eq!(layout.range(4), SeqRange::inclusive(20, 22));
    assert_eq!(layout.range(4).len(), 3);
}

#[test]
pub fn offset_pass_after_refinement() {
    // 10 points were computed before, the refinement added 7 more
    let layout = JobLayout::new(SeqRange::inclusive(10, 16), 3);

    let ranges: Vec<_> = layout.jobs().map(|job| job.range).collect();
    assert_eq!(
        ranges,
        vec![
            SeqRange::inclusive(10, 12),
            SeqRange::inclusive(13, 15),
            SeqRange::inclusive(16, 16),
        ]
    );
}

#[test]
pub fn empty_pass_has_no_jobs() {
    let queue = JobQueue::new(JobLayout::new(SeqRange::empty(42), 8));

    assert!(queue.is_empty());
    assert!(queue.is_complete());
    assert_eq!(queue.next_pending(), None);
}

#[test]
pub fn jobs_are_assigned_in_ascending_order() {
    let mut queue = JobQueue::new(JobLayout::new(SeqRange::new(0, 10), 2));

    let first = queue.assign_next(3).unwrap().unwrap();
    let second = queue.assign_next(1).unwrap().unwrap();

    assert_eq!(first.id, 0);
    assert_eq!(second.id, 1);
    assert_eq!(queue.state(0), Some(JobState::InFlight { worker: 3 }));
    assert_eq!(queue.in_flight(), 2);
    assert_eq!(queue.pending(), 3);
}

#[test]
pub fn worker_holds_at_most_one_job() {
    let mut queue = JobQueue::new(JobLayout::new(SeqRange::new(0, 10), 2));

    queue.assign_next(1).unwrap();
    assert!(queue.assign_next(1).is_err());

    queue.mark_done(0, 1).unwrap();
    assert_eq!(queue.assign_next(1).unwrap().map(|job| job.id), Some(1));
}

#[test]
pub fn done_requires_the_holding_worker() {
    let mut queue = JobQueue::new(JobLayout::new(SeqRange::new(0, 4), 2));

    queue.assign_next(2).unwrap();

    assert!(queue.mark_done(0, 1).is_err());
    assert!(queue.mark_done(1, 2).is_err());
    assert!(queue.mark_done(7, 2).is_err());
    queue.mark_done(0, 2).unwrap();
    // double acknowledgement
    assert!(queue.mark_done(0, 2).is_err());
}

#[test]
pub fn local_execution_completes_queue() {
    let mut queue = JobQueue::new(JobLayout::new(SeqRange::new(0, 7), 3));
    let mut seen = Vec::new();

    while let Some(job) = queue.take_local() {
        seen.push(job.range);
        queue.complete_local(job.id).unwrap();
    }

    assert!(queue.is_complete());
    assert_eq!(seen.len(), 3);
}

proptest! {
    #[test]
    fn prop_jobs_partition_pass(offset in 0u64..100, len in 0u64..400, chunk in 1u64..40) {
        let layout = JobLayout::new(SeqRange::new(offset, len), chunk);
        let jobs: Vec<_> = layout.jobs().collect();

        prop_assert_eq!(jobs.len() as u64, len.div_ceil(chunk));

        let mut next = offset;
        for job in jobs.iter() {
            prop_assert!(!job.range.is_empty());
            prop_assert!(job.range.len() <= chunk);
            prop_assert_eq!(job.range.min(), next);
            next = job.range.end();
        }
        prop_assert_eq!(next, offset + len);
    }
}
