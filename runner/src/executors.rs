use crate::{
    config::ConfigErrors,
    distributed::{
        comm::CommError, fs::ChannelError, fs::SharedState, partition::SeqRange,
        protocol::RangeCompute, reduce::GlobalBest,
    },
    grid::{Grid, GridError},
    model::{ForwardModel, ModelError, Posterior},
};
use thiserror::Error;
use tracing::{instrument, trace};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("Forward model failed at grid point {index}: {source}")]
    Model { index: u64, source: ModelError },
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Evaluates grid points on the calling rank and stores their records in the shared state.
pub struct Evaluator<'a, G, M> {
    grid: &'a G,
    model: &'a M,
    posterior: &'a Posterior,
    shared: &'a SharedState,
    best: GlobalBest,
}

impl<'a, G: Grid, M: ForwardModel> Evaluator<'a, G, M> {
    pub fn new(
        grid: &'a G,
        model: &'a M,
        posterior: &'a Posterior,
        shared: &'a SharedState,
        best: GlobalBest,
    ) -> Self {
        Self {
            grid,
            model,
            posterior,
            shared,
            best,
        }
    }
}

impl<'a, G: Grid, M: ForwardModel> RangeCompute for Evaluator<'a, G, M> {
    type Error = ExecutorError;

    #[instrument(level = "trace", skip(self), fields(range = %range))]
    fn compute_range(&mut self, range: SeqRange) -> Result<(), ExecutorError> {
        if range.is_empty() {
            return Ok(());
        }

        let mut data = Vec::with_capacity(range.len() as usize * self.model.output_size());
        let mut posterior = Vec::with_capacity(range.len() as usize);

        for index in range.iter() {
            let input = self.grid.coordinates_of(index)?;
            let output = self
                .model
                .run(&input)
                .map_err(|source| ExecutorError::Model { index, source })?;
            let value = self.posterior.evaluate(&output);

            if self.best.offer(value, index) {
                trace!(index = index, posterior = value, "New local best");
            }

            data.extend(output);
            posterior.push(value);
        }

        self.shared.write_records(range, &data, &posterior)?;

        Ok(())
    }

    fn local_best(&self) -> GlobalBest {
        self.best
    }

    fn set_local_best(&mut self, best: GlobalBest) {
        self.best = best;
    }
}
