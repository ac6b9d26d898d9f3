use super::{
    adapt::{
        join_pool, AdaptContext, AdaptDecision, AdaptPolicy, AdaptationController, Policies,
        PolicyConfig,
    },
    comm::{CommError, Communicator, Membership},
    jobs::{JobLayout, JobQueue},
    local::LocalCluster,
    partition::SeqRange,
    pool::WorkerPool,
    protocol::{master_compute, worker_compute, MasterReport, RangeCompute, WorkerExit},
    protocol_test::{assert_partitioned, Recorder},
    reduce::{reduce_global_best, GlobalBest},
};
use std::time::Duration;

fn context(size: usize, checks: usize) -> AdaptContext {
    AdaptContext {
        pool: WorkerPool::new(0, size),
        pending_jobs: 10,
        done_jobs: 1,
        throughput: 1.0,
        checks,
    }
}

#[test]
pub fn scripted_policy_follows_its_steps() {
    let mut policy = Policies::from(&PolicyConfig::Scripted {
        steps: vec![2, 0, -1],
    });

    assert_eq!(policy.decide(&context(2, 0)), AdaptDecision::Resize(2));
    assert_eq!(policy.decide(&context(4, 1)), AdaptDecision::Keep);
    assert_eq!(policy.decide(&context(4, 2)), AdaptDecision::Resize(-1));
    assert_eq!(policy.decide(&context(3, 3)), AdaptDecision::Keep);
}

#[test]
pub fn target_policy_moves_to_size() {
    let mut policy = Policies::from(&PolicyConfig::Target { size: 3 });

    assert_eq!(policy.decide(&context(5, 0)), AdaptDecision::Resize(-2));
    assert_eq!(policy.decide(&context(3, 1)), AdaptDecision::Keep);
}

struct Always(i64);

impl AdaptPolicy for Always {
    fn decide(&mut self, _: &AdaptContext) -> AdaptDecision {
        AdaptDecision::Resize(self.0)
    }
}

#[test]
pub fn controller_clamps_to_pool_bounds() {
    let queue = JobQueue::new(JobLayout::new(SeqRange::new(0, 10), 1));
    let pool = WorkerPool::new(0, 3);

    let mut grow = AdaptationController::with_policy(Duration::ZERO, Box::new(Always(10)), 1, 4);
    assert_eq!(grow.poll(&pool, &queue), Some(1));

    let mut shrink =
        AdaptationController::with_policy(Duration::ZERO, Box::new(Always(-10)), 1, 4);
    assert_eq!(shrink.poll(&pool, &queue), Some(-2));

    let mut stuck = AdaptationController::with_policy(Duration::ZERO, Box::new(Always(1)), 1, 3);
    assert_eq!(stuck.poll(&pool, &queue), None);
}

#[test]
pub fn controller_waits_for_frequency() {
    let queue = JobQueue::new(JobLayout::new(SeqRange::new(0, 10), 1));
    let pool = WorkerPool::new(0, 2);
    let mut controller =
        AdaptationController::with_policy(Duration::from_secs(3600), Box::new(Always(1)), 1, 4);

    controller.record_job();
    assert_eq!(controller.poll(&pool, &queue), None);
}

#[test]
pub fn controller_skips_without_pending_jobs() {
    let mut queue = JobQueue::new(JobLayout::new(SeqRange::new(0, 1), 1));
    let pool = WorkerPool::new(0, 1);
    let job = queue.take_local().unwrap();
    queue.complete_local(job.id).unwrap();

    let mut controller =
        AdaptationController::with_policy(Duration::ZERO, Box::new(Always(1)), 1, 4);
    assert_eq!(controller.poll(&pool, &queue), None);
}

struct Outcome {
    rank: usize,
    ranges: Vec<SeqRange>,
    report: Option<MasterReport>,
    departed: bool,
    joined: bool,
    best: GlobalBest,
}

/// one pass where the master resizes the pool at every job according to `steps`
fn elastic_pass(
    size: usize,
    max_ranks: usize,
    layout: JobLayout,
    steps: Vec<i64>,
    value_of: fn(SeqRange) -> f64,
) -> Result<Vec<Outcome>, CommError> {
    LocalCluster::run(size, max_ranks, move |mut comm| -> Result<Outcome, CommError> {
        let mut recorder = Recorder::with_values(value_of);
        let mut report = None;
        let joined = comm.joined();

        let exit = if let Some(resized) = joined {
            let pool = join_pool(&comm, &resized)?;

            Some(worker_compute(&mut comm, pool, layout, &mut recorder)?)
        } else if comm.is_master() {
            let mut controller = AdaptationController::with_policy(
                Duration::ZERO,
                Box::new(Policies::Scripted {
                    steps: steps.clone(),
                }),
                layout.chunk_size(),
                max_ranks,
            );
            report = Some(master_compute(
                &mut comm,
                WorkerPool::new(0, size),
                layout,
                &mut recorder,
                &mut controller,
            )?);

            None
        } else {
            Some(worker_compute(
                &mut comm,
                WorkerPool::new(0, size),
                layout,
                &mut recorder,
            )?)
        };

        let departed = exit == Some(WorkerExit::Departed);
        let best = if departed {
            recorder.local_best()
        } else {
            comm.barrier()?;
            reduce_global_best(&comm, recorder.local_best())?
        };

        Ok(Outcome {
            rank: comm.rank(),
            ranges: recorder.ranges,
            report,
            departed,
            joined: joined.is_some(),
            best,
        })
    })
}

fn all_ranges(outcomes: &[Outcome]) -> Vec<SeqRange> {
    outcomes
        .iter()
        .flat_map(|outcome| outcome.ranges.iter().copied())
        .collect()
}

#[test]
pub fn grow_mid_pass() {
    let layout = JobLayout::new(SeqRange::new(0, 40), 2);
    let outcomes = elastic_pass(2, 4, layout, vec![2], |range| range.min() as f64).unwrap();

    let report = outcomes[0].report.unwrap();
    assert_eq!(report.adaptations, 1);
    assert_eq!(report.pool.size(), 4);
    assert_eq!(report.pool.generation(), 1);
    assert_eq!(report.terminations, 3);

    assert_eq!(outcomes.iter().filter(|outcome| outcome.joined).count(), 2);
    assert!(outcomes.iter().all(|outcome| !outcome.departed));
    assert_partitioned(layout, all_ranges(&outcomes));

    // the last job holds the highest value
    for outcome in &outcomes {
        assert_eq!(
            outcome.best,
            GlobalBest {
                value: 38.0,
                index: 38
            }
        );
    }
}

#[test]
pub fn shrink_mid_pass_keeps_departed_best() {
    let layout = JobLayout::new(SeqRange::new(0, 40), 2);
    // job 1 is seeded to rank 2, which leaves at the first check
    let outcomes = elastic_pass(4, 4, layout, vec![-2], |range| {
        if range.min() == 2 {
            100.0
        } else {
            0.0
        }
    })
    .unwrap();

    let report = outcomes[0].report.unwrap();
    assert_eq!(report.adaptations, 1);
    assert_eq!(report.pool.size(), 2);
    assert_eq!(report.terminations, 1);

    let departed: Vec<_> = outcomes
        .iter()
        .filter(|outcome| outcome.departed)
        .map(|outcome| outcome.rank)
        .collect();
    assert_eq!(departed, vec![2, 3]);
    assert_partitioned(layout, all_ranges(&outcomes));

    for outcome in outcomes.iter().filter(|outcome| !outcome.departed) {
        assert_eq!(
            outcome.best,
            GlobalBest {
                value: 100.0,
                index: 2
            }
        );
    }
}

#[test]
pub fn shrink_to_master_falls_back_to_serial() {
    let layout = JobLayout::new(SeqRange::new(0, 30), 3);
    let outcomes = elastic_pass(3, 3, layout, vec![-5], |range| range.min() as f64).unwrap();

    let report = outcomes[0].report.unwrap();
    assert_eq!(report.pool.size(), 1);
    assert_eq!(report.terminations, 0);
    assert!(report.local_jobs > 0);
    assert_partitioned(layout, all_ranges(&outcomes));
}

#[test]
pub fn grow_from_single_rank() {
    let layout = JobLayout::new(SeqRange::new(0, 30), 3);
    let outcomes = elastic_pass(1, 3, layout, vec![2], |range| range.min() as f64).unwrap();

    let report = outcomes[0].report.unwrap();
    assert_eq!(report.local_jobs, 1);
    assert_eq!(report.pool.size(), 3);
    assert_eq!(report.terminations, 2);
    assert_partitioned(layout, all_ranges(&outcomes));
}

#[test]
pub fn scripted_grow_and_shrink() {
    let layout = JobLayout::new(SeqRange::new(0, 64), 2);
    let outcomes =
        elastic_pass(2, 5, layout, vec![0, 3, 0, -2, 1], |range| range.min() as f64).unwrap();

    let report = outcomes[0].report.unwrap();
    assert_eq!(report.adaptations, 3);
    assert_eq!(report.pool.size(), 4);
    assert_eq!(report.pool.generation(), 3);
    assert_partitioned(layout, all_ranges(&outcomes));
}
