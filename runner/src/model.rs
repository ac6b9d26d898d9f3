pub mod analytic;
pub mod exec;

use crate::config::ConfigErrors;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to spawn forward model")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to talk to the forward model process")]
    ChildIo(#[from] std::io::Error),
    #[error("Failed to (de)serialize forward model data")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Forward model timeout")]
    ChildTimeout,
    #[error("Forward model exited with status {status}: {stderr}")]
    ChildFailed { status: i32, stderr: String },
    #[error("Forward model expects {expected} inputs, got {actual}")]
    InputSize { expected: usize, actual: usize },
    #[error("Forward model promised {expected} outputs, produced {actual}")]
    OutputSize { expected: usize, actual: usize },
}

/// The expensive simulation the surrogate stands in for.
///
/// Implementations must be deterministic: equal inputs produce bit-identical outputs, no
/// matter which rank runs them.
pub trait ForwardModel: Send + Sync {
    fn input_size(&self) -> usize;

    fn output_size(&self) -> usize;

    /// closed interval of valid values for input dimension `dim`
    fn input_space(&self, dim: usize) -> (f64, f64);

    fn run(&self, input: &[f64]) -> Result<Vec<f64>, ModelError>;
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "name", rename_all = "snake_case", deny_unknown_fields)]
pub enum ModelConfig {
    /// closed form test functions, cheap enough for smoke runs and tests
    Analytic {
        function: analytic::AnalyticFunction,
        input_size: usize,
        output_size: usize,
        #[serde(default)]
        input_space: Vec<(f64, f64)>,
    },
    /// external executable reading the input vector from stdin and writing the output
    /// vector to stdout, both as YAML sequences
    Exec {
        exec: PathBuf,
        #[serde(default)]
        params: Vec<String>,
        // milliseconds
        #[serde(default = "default_model_timeout")]
        timeout: u64,
        input_size: usize,
        output_size: usize,
        #[serde(default)]
        input_space: Vec<(f64, f64)>,
    },
}

fn default_model_timeout() -> u64 {
    60_000
}

impl ModelConfig {
    pub fn input_size(&self) -> usize {
        match self {
            Self::Analytic { input_size, .. } | Self::Exec { input_size, .. } => *input_size,
        }
    }

    pub fn output_size(&self) -> usize {
        match self {
            Self::Analytic { output_size, .. } | Self::Exec { output_size, .. } => *output_size,
        }
    }
}

/// bounds per input dimension, `[0, 1]` where the config leaves them out
pub fn input_space_or_unit(bounds: &[(f64, f64)], input_size: usize) -> Vec<(f64, f64)> {
    (0..input_size)
        .map(|dim| bounds.get(dim).copied().unwrap_or((0.0, 1.0)))
        .collect()
}

#[derive(Debug, Clone)]
pub enum Models {
    Analytic(analytic::AnalyticModel),
    Exec(exec::ExecModel),
}

impl Models {
    pub fn load(config: &ModelConfig) -> Result<Self, ConfigErrors> {
        match config {
            ModelConfig::Analytic { .. } => analytic::AnalyticModel::load(config).map(Self::Analytic),
            ModelConfig::Exec { .. } => exec::ExecModel::load(config).map(Self::Exec),
        }
    }
}

impl ForwardModel for Models {
    fn input_size(&self) -> usize {
        match self {
            Self::Analytic(model) => model.input_size(),
            Self::Exec(model) => model.input_size(),
        }
    }

    fn output_size(&self) -> usize {
        match self {
            Self::Analytic(model) => model.output_size(),
            Self::Exec(model) => model.output_size(),
        }
    }

    fn input_space(&self, dim: usize) -> (f64, f64) {
        match self {
            Self::Analytic(model) => model.input_space(dim),
            Self::Exec(model) => model.input_space(dim),
        }
    }

    fn run(&self, input: &[f64]) -> Result<Vec<f64>, ModelError> {
        match self {
            Self::Analytic(model) => model.run(input),
            Self::Exec(model) => model.run(input),
        }
    }
}

/// Gaussian likelihood of a model output given the observed data.
#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    observed: Vec<f64>,
    sigma: f64,
}

impl Posterior {
    /// `sigma = noise * |observed| / sqrt(n)`
    pub fn new(observed: Vec<f64>, noise: f64) -> Result<Self, ConfigErrors> {
        let norm = observed.iter().map(|value| value * value).sum::<f64>().sqrt();
        let sigma = noise * norm / (observed.len() as f64).sqrt();

        if sigma.is_finite() && sigma > 0.0 {
            Ok(Self { observed, sigma })
        } else {
            error!(
                noise = noise,
                norm = norm,
                "Posterior sigma must be positive, check `noise` and `observed`"
            );

            Err(ConfigErrors::InvalidPosterior { noise, norm })
        }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// `exp(-|output - observed|^2 / (2 sigma^2))`
    pub fn evaluate(&self, output: &[f64]) -> f64 {
        let misfit: f64 = output
            .iter()
            .zip(self.observed.iter())
            .map(|(d, o)| (d - o) * (d - o))
            .sum();

        (-misfit / (2.0 * self.sigma * self.sigma)).exp()
    }
}
