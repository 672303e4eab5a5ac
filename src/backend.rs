use anyhow::{Result, anyhow};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use wait_timeout::ChildExt;

use crate::types::ErrorState;

/// Exit code the engine uses when it gave up on the datasource.
pub const ABORT_EXIT_CODE: i32 = 18;

/// Captured engine stdout and stderr, relative to the log dir.
pub const ENGINE_OUTPUT_FILE: &str = "engine_output.txt";

/// One engine run for a work item.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub command_line: Vec<String>,
    /// Fixtures listed in the test list file, in order.
    pub test_files: Vec<PathBuf>,
    pub logical: bool,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub output: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("could not start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("engine timed out after {} s", .0.as_secs())]
    Timeout(Duration),
    #[error("engine exited with {}", exit_code_label(.code))]
    Failed { code: Option<i32>, output: String },
    #[error("engine i/o: {0}")]
    Io(#[from] io::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "no exit code".to_string(),
    }
}

impl EngineError {
    /// Process output captured before the failure, if any.
    pub fn output(&self) -> &str {
        match self {
            EngineError::Failed { output, .. } => output,
            _ => "",
        }
    }

    /// Maps a failed run to the state its results carry. A configured
    /// expected message wins over everything else.
    pub fn classify(&self, expected_message: Option<&str>) -> ErrorState {
        if let Some(expected) = expected_message.filter(|m| !m.is_empty()) {
            if self.output().contains(expected) || self.to_string().contains(expected) {
                return ErrorState::ExpectedFailure;
            }
        }
        match self {
            EngineError::Failed { code: Some(ABORT_EXIT_CODE), .. } => ErrorState::Aborted,
            EngineError::Timeout(_) => ErrorState::Timeout,
            _ => ErrorState::Other,
        }
    }

    /// Text saved on the first result of the item.
    pub fn saved_message(&self) -> String {
        let output = self.output().trim();
        if output.is_empty() {
            self.to_string()
        } else {
            format!("{self}\n{output}")
        }
    }
}

/// Runs the query engine for one work item.
pub trait Engine: Send + Sync {
    fn execute(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError>;
    fn validate(&self) -> Result<()>;
}

/// Spawns the engine named by the first command line element.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    pub program: String,
    pub quiet: bool,
}

impl ExternalEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            quiet: true,
        }
    }
}

fn read_lossy(path: &Path) -> String {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

impl Engine for ExternalEngine {
    fn execute(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError> {
        let (program, args) = request.command_line.split_first().ok_or(EngineError::EmptyCommand)?;

        fs::create_dir_all(&request.log_dir)?;
        let capture_path = request.log_dir.join(ENGINE_OUTPUT_FILE);
        let capture = File::create(&capture_path)?;
        let capture_err = capture.try_clone()?;

        debug!("Running {}", request.command_line.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(capture))
            .stderr(Stdio::from(capture_err))
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let status = match child.wait_timeout(request.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Timeout(request.timeout));
            }
        };

        let output = read_lossy(&capture_path);
        if !self.quiet && !output.is_empty() {
            eprint!("{output}");
        }
        if !status.success() {
            return Err(EngineError::Failed {
                code: status.code(),
                output,
            });
        }
        Ok(EngineOutput { output })
    }

    fn validate(&self) -> Result<()> {
        if Path::new(&self.program).is_file() {
            return Ok(());
        }
        which::which(&self.program).map(|_| ()).map_err(|e| {
            anyhow!(
                "Engine '{}' does not exist or is not executable. Check that it is installed and in PATH: {}",
                self.program,
                e
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_message_beats_exit_code() {
        let err = EngineError::Failed {
            code: Some(ABORT_EXIT_CODE),
            output: "Connection refused by server".into(),
        };
        assert_eq!(err.classify(Some("refused")), ErrorState::ExpectedFailure);
        assert_eq!(err.classify(Some("something else")), ErrorState::Aborted);
        assert_eq!(err.classify(None), ErrorState::Aborted);
    }

    #[test]
    fn timeout_and_other() {
        assert_eq!(EngineError::Timeout(Duration::from_secs(1)).classify(None), ErrorState::Timeout);
        let err = EngineError::Failed { code: Some(1), output: String::new() };
        assert_eq!(err.classify(None), ErrorState::Other);
        assert_eq!(EngineError::EmptyCommand.classify(None), ErrorState::Other);
    }
}
