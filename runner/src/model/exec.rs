use super::{input_space_or_unit, ForwardModel, ModelConfig, ModelError};
use crate::config::{check_executable, ConfigErrors};
use std::{
    ffi::OsString,
    io::{self, Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, trace, warn};
use tracing_unwrap::OptionExt;
use wait_timeout::ChildExt;

/// Forward model living in an external executable.
///
/// Protocol: the input vector is written to stdin as a YAML sequence, stdin is closed and the
/// model answers with the output vector as a YAML sequence on stdout.
#[derive(Debug, Clone)]
pub struct ExecModel {
    pub exec: PathBuf,
    pub params: Vec<OsString>,
    pub timeout: Duration,
    output_size: usize,
    input_space: Vec<(f64, f64)>,
}

impl ExecModel {
    pub fn load(config: &ModelConfig) -> Result<Self, ConfigErrors> {
        match config {
            ModelConfig::Exec {
                exec,
                params,
                timeout,
                input_size,
                output_size,
                input_space,
            } => {
                if !check_executable(exec)? {
                    error!(exec = ?exec, "Forward model is not executable");

                    return Err(ConfigErrors::FailedLoadModel);
                }

                if *timeout == 0 {
                    warn!("Forward model timeout must be a natural number");

                    return Err(ConfigErrors::FailedLoadModel);
                }

                Ok(Self {
                    exec: exec.clone(),
                    params: params.iter().map(OsString::from).collect(),
                    timeout: Duration::from_millis(*timeout),
                    output_size: *output_size,
                    input_space: input_space_or_unit(input_space, *input_size),
                })
            }
            other => {
                error!("Exec model cannot be loaded from {other:?}");

                Err(ConfigErrors::FailedLoadModel)
            }
        }
    }
}

impl ForwardModel for ExecModel {
    fn input_size(&self) -> usize {
        self.input_space.len()
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn input_space(&self, dim: usize) -> (f64, f64) {
        self.input_space.get(dim).copied().unwrap_or((0.0, 1.0))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn run(&self, input: &[f64]) -> Result<Vec<f64>, ModelError> {
        if input.len() != self.input_size() {
            return Err(ModelError::InputSize {
                expected: self.input_size(),
                actual: input.len(),
            });
        }

        let mut handle = Command::new(&self.exec)
            .args(&self.params)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(ModelError::Spawn)?;

        // both pipes are drained while the model runs, a full pipe would block it
        let stdout = drain(handle.stdout.take().unwrap_or_log());
        let stderr = drain(handle.stderr.take().unwrap_or_log());

        let mut stdin = handle.stdin.take().unwrap_or_log();
        stdin.write_all(serde_yaml::to_string(input)?.as_bytes())?;
        // Dropping stdin here will close the underlying file descriptor
        // this gives the model a clear end of input
        drop(stdin);

        trace!("Forward model waiting on {}", handle.id());
        let status = match handle.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                debug!("Forward model ran into timeout, killing it");
                handle.kill()?;
                handle.wait()?;

                // the readers are left behind, a leftover grandchild may still hold the pipes
                return Err(ModelError::ChildTimeout);
            }
        };

        let buffer = collect(stdout)?;
        let stderr_buffer = collect(stderr)?;

        if !status.success() {
            return Err(ModelError::ChildFailed {
                status: status.code().unwrap_or(-1),
                stderr: stderr_buffer,
            });
        }

        if !stderr_buffer.is_empty() {
            trace!(stderr = %stderr_buffer.trim_end(), "Forward model wrote to stderr");
        }

        let output: Vec<f64> = serde_yaml::from_str(&buffer)?;
        if output.len() != self.output_size {
            return Err(ModelError::OutputSize {
                expected: self.output_size,
                actual: output.len(),
            });
        }

        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = String::new();
        pipe.read_to_string(&mut buffer)?;

        Ok(buffer)
    })
}

fn collect(reader: JoinHandle<io::Result<String>>) -> Result<String, ModelError> {
    let buffer = reader
        .join()
        .map_err(|_| io::Error::other("forward model pipe reader panicked"))??;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    // run through `sh` instead of executing the script directly, a freshly written
    // executable can still be busy while other test threads fork
    fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("model.sh");
        fs::write(&path, format!("{body}\n")).unwrap();

        path
    }

    fn config(script: PathBuf, output_size: usize) -> ModelConfig {
        ModelConfig::Exec {
            exec: PathBuf::from("/bin/sh"),
            params: vec![script.to_string_lossy().into_owned()],
            timeout: 5_000,
            input_size: 2,
            output_size,
            input_space: Vec::new(),
        }
    }

    #[test]
    fn reads_yaml_output() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(&dir, "cat > /dev/null\necho '[1.5, -2.0]'");
        let model = ExecModel::load(&config(exec, 2)).unwrap();

        assert_eq!(model.run(&[0.1, 0.2]).unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn failing_model_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(&dir, "cat > /dev/null\necho boom >&2\nexit 3");
        let model = ExecModel::load(&config(exec, 2)).unwrap();

        match model.run(&[0.1, 0.2]) {
            Err(ModelError::ChildFailed { status, stderr }) => {
                assert_eq!(status, 3);
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn large_output_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        // about 140 KiB on stdout and 400 KiB on stderr, far beyond a pipe buffer
        let exec = script(
            &dir,
            "cat > /dev/null\n\
             i=0; while [ $i -lt 20000 ]; do echo '- 1.25'; echo 'chatty model output' >&2; i=$((i + 1)); done",
        );
        let model = ExecModel::load(&config(exec, 20000)).unwrap();

        let output = model.run(&[0.1, 0.2]).unwrap();

        assert_eq!(output.len(), 20000);
        assert!(output.iter().all(|value| *value == 1.25));
    }

    #[test]
    fn slow_model_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(&dir, "cat > /dev/null\nexec sleep 10");
        let mut model = ExecModel::load(&config(exec, 2)).unwrap();
        model.timeout = Duration::from_millis(200);

        assert!(matches!(model.run(&[0.1, 0.2]), Err(ModelError::ChildTimeout)));
    }

    #[test]
    fn output_size_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(&dir, "cat > /dev/null\necho '[1.0]'");
        let model = ExecModel::load(&config(exec, 2)).unwrap();

        assert!(matches!(
            model.run(&[0.1, 0.2]),
            Err(ModelError::OutputSize {
                expected: 2,
                actual: 1
            })
        ));
    }
}
