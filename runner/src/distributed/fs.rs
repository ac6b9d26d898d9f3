use super::{partition::SeqRange, reduce::GlobalBest};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, trace};

pub const DATA_FILE: &str = "data.bin";
pub const POSTERIOR_FILE: &str = "posterior.bin";
pub const CHECKPOINT_FILE: &str = "grid.bin";

const F64_SIZE: u64 = std::mem::size_of::<f64>() as u64;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to access shared state file {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Record buffer holds {actual} values, range {range} needs {expected}")]
    LengthMismatch {
        range: SeqRange,
        expected: usize,
        actual: usize,
    },
    #[error("Checkpoint {path:?} is malformed: {reason}")]
    MalformedCheckpoint { path: PathBuf, reason: String },
    #[error("Failed to (de)serialize checkpoint")]
    Serialize(#[from] serde_yaml::Error),
}

/// Snapshot of everything a joining rank needs to take part in the current pass.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Checkpoint {
    /// refinement round the pass belongs to, 0 is the initial build
    pub round: usize,
    /// range of grid points computed by the pass
    pub pass: SeqRange,
    pub generation: u64,
    pub best: GlobalBest,
    /// serialized grid topology
    pub topology: String,
}

/// File backed exchange of per-point records between ranks.
///
/// Records live at fixed offsets derived from the sequence index, so ranks writing disjoint
/// ranges never need a lock. Every write is synced before it returns, the caller takes a
/// barrier before anybody reads records of another rank.
#[derive(Debug, Clone)]
pub struct SharedState {
    dir: PathBuf,
    output_size: usize,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ChannelError + '_ {
    move |source| {
        error!(path = ?path, error = ?source, "Shared state file access failed");

        ChannelError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl SharedState {
    /// create the directory and truncate all files of a previous run, done by the master only
    pub fn create(dir: impl Into<PathBuf>, output_size: usize) -> Result<Self, ChannelError> {
        let state = Self::open(dir, output_size);

        fs::create_dir_all(&state.dir).map_err(io_error(&state.dir))?;

        for path in [state.data_path(), state.posterior_path()] {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .and_then(|file| file.sync_all())
                .map_err(io_error(&path))?;
        }

        state.remove_checkpoint()?;

        debug!(dir = ?state.dir, "Created shared state files");

        Ok(state)
    }

    /// attach to files created by the master
    pub fn open(dir: impl Into<PathBuf>, output_size: usize) -> Self {
        Self {
            dir: dir.into(),
            output_size,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    pub fn posterior_path(&self) -> PathBuf {
        self.dir.join(POSTERIOR_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    fn data_record_size(&self) -> u64 {
        self.output_size as u64 * F64_SIZE
    }

    /// write the output vectors and posteriors of `range`, data is row major per point
    pub fn write_records(
        &self,
        range: SeqRange,
        data: &[f64],
        posterior: &[f64],
    ) -> Result<(), ChannelError> {
        if range.is_empty() {
            return Ok(());
        }

        check_len(range, range.len() as usize * self.output_size, data.len())?;
        check_len(range, range.len() as usize, posterior.len())?;

        write_at(
            &self.data_path(),
            range.min() * self.data_record_size(),
            data,
        )?;
        write_at(&self.posterior_path(), range.min() * F64_SIZE, posterior)?;
        trace!(range = %range, "Wrote records");

        Ok(())
    }

    pub fn read_data(&self, range: SeqRange) -> Result<Vec<f64>, ChannelError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        read_at(
            &self.data_path(),
            range.min() * self.data_record_size(),
            range.len() as usize * self.output_size,
        )
    }

    pub fn read_posterior(&self, range: SeqRange) -> Result<Vec<f64>, ChannelError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        read_at(
            &self.posterior_path(),
            range.min() * F64_SIZE,
            range.len() as usize,
        )
    }

    /// replace the checkpoint wholesale: write a temporary file, sync it and rename it over
    /// the old one, so readers never observe a half written topology
    pub fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), ChannelError> {
        let path = self.checkpoint_path();
        let tmp_path = path.with_extension("bin.tmp");
        let body = serde_yaml::to_string(checkpoint)?;

        let mut file = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
        file.write_all(&(body.len() as u64).to_le_bytes())
            .and_then(|_| file.write_all(body.as_bytes()))
            .and_then(|_| file.sync_all())
            .map_err(io_error(&tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(io_error(&path))?;
        debug!(
            path = ?path,
            round = checkpoint.round,
            pass = %checkpoint.pass,
            "Wrote checkpoint"
        );

        Ok(())
    }

    /// scratch file only, gone once the build is over, a missing file is fine
    pub fn remove_checkpoint(&self) -> Result<(), ChannelError> {
        let path = self.checkpoint_path();

        match fs::remove_file(&path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(io_error(&path)(error)),
            _ => Ok(()),
        }
    }

    pub fn read_checkpoint(&self) -> Result<Checkpoint, ChannelError> {
        let path = self.checkpoint_path();
        let mut file = File::open(&path).map_err(io_error(&path))?;

        let mut prefix = [0u8; 8];
        file.read_exact(&mut prefix).map_err(io_error(&path))?;
        let len = u64::from_le_bytes(prefix) as usize;

        let mut body = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut body)
            .map_err(io_error(&path))?;

        if body.len() != len {
            return Err(ChannelError::MalformedCheckpoint {
                path,
                reason: format!("length prefix says {len} bytes, found {}", body.len()),
            });
        }

        Ok(serde_yaml::from_slice(&body)?)
    }
}

fn check_len(range: SeqRange, expected: usize, actual: usize) -> Result<(), ChannelError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ChannelError::LengthMismatch {
            range,
            expected,
            actual,
        })
    }
}

fn write_at(path: &Path, offset: u64, values: &[f64]) -> Result<(), ChannelError> {
    let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_le_bytes()).collect();

    // files are opened per access, every rank owns its handle
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(io_error(path))?;

    file.write_all_at(&bytes, offset)
        .and_then(|_| file.sync_data())
        .map_err(io_error(path))
}

fn read_at(path: &Path, offset: u64, count: usize) -> Result<Vec<f64>, ChannelError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut bytes = vec![0u8; count * F64_SIZE as usize];

    file.read_exact_at(&mut bytes, offset)
        .map_err(io_error(path))?;

    Ok(bytes
        .chunks_exact(F64_SIZE as usize)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect())
}
