use crate::{
    distributed::{
        adapt::{AdaptConfig, PolicyConfig},
        Scheme,
    },
    model::ModelConfig,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config could not be parsed")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config failed the preflight checks")]
    Preflight,
    #[error("Forward model failed to load")]
    FailedLoadModel,
    #[error("Posterior sigma is not positive (noise {noise}, |observed| {norm})")]
    InvalidPosterior { noise: f64, norm: f64 },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // directory holding the shared state files of the run
    #[serde(default = "default_output_path")]
    pub output: PathBuf,
    // pool size at launch
    #[serde(default = "default_ranks")]
    pub ranks: usize,
    // upper bound for elastic growth, defaults to `ranks`
    #[serde(default)]
    pub max_ranks: Option<usize>,
    #[serde(default)]
    pub scheme: Scheme,
    // grid points per master-worker job
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    pub grid: GridConfig,
    pub model: ModelConfig,
    // observed data the posterior compares model outputs against
    pub observed: Vec<f64>,
    pub noise: f64,
    #[serde(default)]
    pub adapt: AdaptConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    // level of the initial regular grid
    pub level: u32,
    // share of the grid points refined per round
    #[serde(default)]
    pub refine_portion: f64,
    #[serde(default)]
    pub refinements: usize,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            error!(path = ?path, "Config file not found");

            return Err(ConfigErrors::FileNotFound);
        }

        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn max_ranks(&self) -> usize {
        self.max_ranks.unwrap_or(self.ranks).max(self.ranks)
    }

    /// Check the whole config and log every problem, returns true if any error was found.
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.ranks == 0 {
            error!("ranks must be at least 1, the master is a rank too");
            contains_error = true;
        }

        if let Some(max_ranks) = self.max_ranks {
            if max_ranks < self.ranks {
                error!("max_ranks ({max_ranks}) is smaller than ranks ({})", self.ranks);
                contains_error = true;
            }
        }

        if self.chunk_size == 0 {
            error!("chunk_size must be at least 1");
            contains_error = true;
        }

        if self.grid.level == 0 {
            error!("grid.level must be at least 1");
            contains_error = true;
        }

        if !(self.grid.refine_portion >= 0.0) {
            warn!(
                "grid.refine_portion ({}) is negative. Falling back to 0",
                self.grid.refine_portion
            );
            self.grid.refine_portion = 0.0;
        }

        if self.grid.refinements > 0 && self.grid.refine_portion == 0.0 {
            warn!("grid.refinements is set but grid.refine_portion is 0, refinements will add no points");
        }

        let (input_size, output_size, bounds) = match &self.model {
            ModelConfig::Analytic {
                input_size,
                output_size,
                input_space,
                ..
            } => (*input_size, *output_size, input_space),
            ModelConfig::Exec {
                input_size,
                output_size,
                input_space,
                exec,
                ..
            } => {
                match check_executable(exec) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            "model.exec {} is not executable",
                            exec.to_string_lossy()
                        );
                        contains_error = true;
                    }
                    Err(e) => {
                        error!(
                            "Failed to determine if model.exec ({}) is an executable: {e}",
                            exec.to_string_lossy()
                        );
                        contains_error = true;
                    }
                }

                (*input_size, *output_size, input_space)
            }
        };

        if input_size == 0 || output_size == 0 {
            error!("model.input_size and model.output_size must both be at least 1");
            contains_error = true;
        }

        if bounds.len() > input_size {
            warn!(
                "model.input_space has {} entries for {input_size} inputs, the rest is ignored",
                bounds.len()
            );
        }

        for (dim, (min, max)) in bounds.iter().enumerate() {
            if !(min < max) {
                error!("model.input_space[{dim}] = [{min}, {max}] is empty");
                contains_error = true;
            }
        }

        if self.observed.len() != output_size {
            error!(
                "observed holds {} values but the model produces {output_size}",
                self.observed.len()
            );
            contains_error = true;
        }

        if !(self.noise > 0.0) {
            error!("noise ({}) must be positive", self.noise);
            contains_error = true;
        }

        if self.adapt.policy != PolicyConfig::Never && self.scheme == Scheme::Static {
            error!("adapt.policy requires scheme `master_worker`, the static scheme never resizes");
            contains_error = true;
        }

        contains_error
    }
}

fn default_output_path() -> PathBuf {
    PathBuf::from("sgi-output")
}

fn default_ranks() -> usize {
    1
}

fn default_chunk_size() -> u64 {
    8
}
