use crate::{
    config::RunnerConfig,
    distributed::{
        adapt::{join_pool, AdaptConfig, AdaptationController},
        comm::{CommError, Communicator, Membership},
        fs::{Checkpoint, SharedState},
        jobs::JobLayout,
        local::LocalCluster,
        partition::{local_range, SeqRange},
        pool::WorkerPool,
        protocol::{master_compute, worker_compute, RangeCompute, WorkerExit},
        reduce::{reduce_global_best, GlobalBest},
        Scheme,
    },
    executors::{Evaluator, ExecutorError},
    grid::{Grid, SparseGrid},
    model::{ForwardModel, Models, Posterior},
};
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info, instrument};

/// Run parameters every rank needs, derived from the config.
#[derive(Debug, Clone)]
pub struct Settings {
    pub output: PathBuf,
    pub scheme: Scheme,
    pub chunk_size: u64,
    pub refine_portion: f64,
    pub refinements: usize,
    pub max_ranks: usize,
    pub adapt: AdaptConfig,
}

impl From<&RunnerConfig> for Settings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            output: config.output.clone(),
            scheme: config.scheme,
            chunk_size: config.chunk_size,
            refine_portion: config.grid.refine_portion,
            refinements: config.grid.refinements,
            max_ranks: config.max_ranks(),
            adapt: config.adapt.clone(),
        }
    }
}

/// Result of a build as held by every rank that stayed until the end.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub rank: usize,
    /// passes computed, the initial build included
    pub rounds: usize,
    pub points: u64,
    pub best: GlobalBest,
    /// coordinates of the point with the highest posterior
    pub coordinates: Vec<f64>,
    pub generation: u64,
    pub size: usize,
}

struct RankState<G> {
    grid: G,
    pool: WorkerPool,
    best: GlobalBest,
    shared: SharedState,
}

/// Builds the surrogate grid round by round: the initial regular grid, then one refinement
/// per round. Every rank runs the same driver, roles only differ inside the compute passes.
pub struct Surrogate<G, M> {
    settings: Settings,
    grid: G,
    model: M,
    posterior: Posterior,
}

impl<G, M> Surrogate<G, M>
where
    G: Grid + Clone,
    M: ForwardModel,
{
    /// `grid` is the initial grid, identical on every rank
    pub fn new(settings: Settings, grid: G, model: M, posterior: Posterior) -> Self {
        Self {
            settings,
            grid,
            model,
            posterior,
        }
    }

    /// Run the whole build on the calling rank, `None` if the rank left the pool on the way.
    #[instrument(level = "debug", skip_all, fields(rank = comm.rank()))]
    pub fn run<C>(&self, comm: &mut C) -> Result<Option<RunSummary>, ExecutorError>
    where
        C: Communicator + Membership,
    {
        let output_size = self.model.output_size();
        let mut controller = AdaptationController::new(
            &self.settings.adapt,
            self.settings.chunk_size,
            self.settings.max_ranks,
        );

        let (mut state, mut round, mut resume) = match comm.joined() {
            Some(resized) => {
                let shared = SharedState::open(&self.settings.output, output_size);
                let checkpoint = shared.read_checkpoint()?;

                if checkpoint.generation > resized.generation {
                    return Err(CommError::violation(
                        comm.rank(),
                        format!(
                            "checkpoint of generation {} is newer than the joined generation {}",
                            checkpoint.generation, resized.generation
                        ),
                    )
                    .into());
                }

                let grid = G::deserialize(&checkpoint.topology)?;
                if grid.dimension() != self.model.input_size() {
                    return Err(CommError::violation(
                        comm.rank(),
                        format!(
                            "checkpoint grid has {} dimensions, the model takes {} inputs",
                            grid.dimension(),
                            self.model.input_size()
                        ),
                    )
                    .into());
                }

                let pool = join_pool(&*comm, &resized)?;
                info!(
                    round = checkpoint.round,
                    pass = %checkpoint.pass,
                    generation = pool.generation(),
                    "Joined running build"
                );

                let state = RankState {
                    grid,
                    pool,
                    best: checkpoint.best,
                    shared,
                };

                (state, checkpoint.round, Some(checkpoint.pass))
            }
            None => {
                let shared = if comm.is_master() {
                    SharedState::create(&self.settings.output, output_size)?
                } else {
                    SharedState::open(&self.settings.output, output_size)
                };
                // nobody touches the files before the master truncated them
                comm.barrier()?;

                let state = RankState {
                    grid: self.grid.clone(),
                    pool: WorkerPool::new(comm.generation(), comm.current_size()),
                    best: GlobalBest::default(),
                    shared,
                };

                (state, 0, None)
            }
        };

        while round <= self.settings.refinements {
            let pass = match resume.take() {
                Some(pass) => pass,
                None => {
                    let pass = self.prepare_round(round, &mut state)?;

                    if comm.is_master() {
                        state.shared.write_checkpoint(&Checkpoint {
                            round,
                            pass,
                            generation: comm.generation(),
                            best: state.best,
                            topology: state.grid.serialize()?,
                        })?;
                    }

                    pass
                }
            };

            if !self.compute_pass(comm, &mut state, pass, &mut controller)? {
                return Ok(None);
            }

            if comm.is_master() {
                self.report(round, &state)?;
            }

            round += 1;
        }

        // every rank is past the last barrier, nobody joins anymore
        if comm.is_master() {
            state.shared.remove_checkpoint()?;
        }

        let coordinates = if state.best.is_set() {
            state.grid.coordinates_of(state.best.index)?
        } else {
            Vec::new()
        };

        Ok(Some(RunSummary {
            rank: comm.rank(),
            rounds: round,
            points: state.grid.size(),
            best: state.best,
            coordinates,
            generation: state.pool.generation(),
            size: state.pool.size(),
        }))
    }

    /// range of grid points the round has to compute, refines the grid after round 0
    fn prepare_round(&self, round: usize, state: &mut RankState<G>) -> Result<SeqRange, ExecutorError> {
        let size = state.grid.size();

        if round == 0 {
            return Ok(SeqRange::new(0, size));
        }

        let all = SeqRange::new(0, size);
        let posterior = state.shared.read_posterior(all)?;
        let data = state.shared.read_data(all)?;

        let scores: Vec<f64> = data
            .chunks_exact(self.model.output_size())
            .zip(posterior.iter())
            .map(|(output, posterior)| {
                output.iter().map(|value| value * value).sum::<f64>().sqrt() * posterior
            })
            .collect();

        let count = (size as f64 * self.settings.refine_portion).ceil() as usize;
        let added = state.grid.refine(&scores, count)?;
        debug!(round = round, refined = count, added = added, "Refined grid");

        Ok(SeqRange::new(size, added))
    }

    /// Compute one pass and reduce the global best, false if the rank departed.
    fn compute_pass<C>(
        &self,
        comm: &mut C,
        state: &mut RankState<G>,
        pass: SeqRange,
        controller: &mut AdaptationController,
    ) -> Result<bool, ExecutorError>
    where
        C: Communicator + Membership,
    {
        let layout = JobLayout::new(pass, self.settings.chunk_size);
        let mut evaluator = Evaluator::new(
            &state.grid,
            &self.model,
            &self.posterior,
            &state.shared,
            state.best,
        );

        let pool = match self.settings.scheme {
            Scheme::Static => {
                evaluator.compute_range(local_range(pass, comm.size(), comm.rank()))?;

                state.pool
            }
            Scheme::MasterWorker if comm.is_master() => {
                master_compute(comm, state.pool, layout, &mut evaluator, controller)?.pool
            }
            Scheme::MasterWorker => match worker_compute(comm, state.pool, layout, &mut evaluator)? {
                WorkerExit::Terminated(pool) => pool,
                WorkerExit::Departed => {
                    info!("Left the pool");

                    return Ok(false);
                }
            },
        };

        let local = evaluator.local_best();

        // every record of the pass is durable once everybody passed the barrier
        comm.barrier()?;
        state.best = reduce_global_best(&*comm, local)?;
        state.pool = pool;

        Ok(true)
    }

    fn report(&self, round: usize, state: &RankState<G>) -> Result<(), ExecutorError> {
        if !state.best.is_set() {
            info!(round = round, points = state.grid.size(), "Round complete, no points yet");

            return Ok(());
        }

        let coordinates = state.grid.coordinates_of(state.best.index)?;
        info!(
            round = round,
            points = state.grid.size(),
            size = state.pool.size(),
            index = state.best.index,
            posterior = state.best.value,
            coordinates = ?coordinates,
            "Max posterior"
        );

        Ok(())
    }
}

/// Build the surrogate described by `config` on the in-process cluster, returns the
/// master's summary.
pub fn run_local(config: &RunnerConfig) -> Result<RunSummary, ExecutorError> {
    let model = Models::load(&config.model)?;
    let posterior = Posterior::new(config.observed.clone(), config.noise)?;
    let bounds = (0..model.input_size())
        .map(|dim| model.input_space(dim))
        .collect();
    let grid = SparseGrid::regular(config.grid.level, bounds);
    let surrogate = Arc::new(Surrogate::new(
        Settings::from(config),
        grid,
        model,
        posterior,
    ));

    let results = LocalCluster::run(config.ranks, config.max_ranks(), move |mut comm| {
        surrogate.run(&mut comm)
    })?;

    results
        .into_iter()
        .flatten()
        .find(|summary| summary.rank == 0)
        .ok_or_else(|| CommError::violation(0, "master finished without a summary").into())
}
