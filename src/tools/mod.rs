//! External process invocation for the execution bodies.
//!
//! Bodies never spawn processes themselves; they describe a [`ToolInvocation`]
//! and hand it to a [`ToolRunner`], which is swapped for a scripted fake in
//! tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const STDERR_TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error("IO error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync + 'static {
    /// Runs to completion. A non-zero exit is [`ToolError::Failed`].
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError>;

    /// Whether `program` can be started at all.
    async fn probe(&self, program: &str, version_arg: &str) -> Result<String, ToolError> {
        let output = self
            .run(
                &ToolInvocation::new(program).arg(version_arg),
                &CancellationToken::new(),
            )
            .await?;
        let banner = if output.stdout.trim().is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        Ok(banner.lines().next().unwrap_or_default().trim().to_string())
    }
}

/// Spawns real child processes with `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(6 * 3600))
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let program = invocation.program.clone();
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(program));
        }

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        debug!("Running tool: {}", invocation.display());
        let child = command.spawn().map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;

        // dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|source| ToolError::Io {
                program: program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                warn!("Tool {} cancelled, killing child", program);
                return Err(ToolError::Cancelled(program));
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!("Tool {} exceeded {:?}, killing child", program, self.timeout);
                return Err(ToolError::TimedOut { program, timeout: self.timeout });
            }
        };

        let result = ToolOutput {
            // killed by signal has no code
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            return Err(ToolError::Failed {
                program,
                code: result.exit_code,
                stderr: tail(&result.stderr),
            });
        }
        Ok(result)
    }
}
