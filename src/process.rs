//! Subprocess execution for container runtime CLIs.
//!
//! Backends never spawn processes directly. They build an [`Invocation`]
//! and hand it to a [`CommandExecutor`], which lets tests substitute a
//! recording executor for the real [`ProcessExecutor`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A single external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment set for this invocation only.
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// File that receives combined stdout and stderr.
    pub output_log: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
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

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn output_log(mut self, path: Option<PathBuf>) -> Self {
        self.output_log = path;
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<ExecOutput>;
}

/// Runs an invocation and converts a non-zero exit into [`Error::Execution`].
pub async fn run_checked(executor: &dyn CommandExecutor, invocation: &Invocation) -> Result<ExecOutput> {
    let output = executor.execute(invocation).await?;
    if !output.success() {
        return Err(Error::Execution(format!(
            "'{}' exited with code {}: {}",
            invocation.display(),
            output.exit_code,
            output.output.trim()
        )));
    }
    Ok(output)
}

/// [`CommandExecutor`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<ExecOutput> {
        debug!("Running: {}", invocation.display());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.envs(&invocation.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let spawn_error = |e: std::io::Error| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Execution(format!("executable '{}' not found", invocation.program))
            } else {
                Error::Execution(format!("failed to run '{}': {}", invocation.program, e))
            }
        };

        let output = match invocation.timeout {
            Some(limit) => timeout(limit, cmd.output())
                .await
                .map_err(|_| Error::Timeout {
                    operation: invocation.display(),
                    duration: limit,
                })?
                .map_err(spawn_error)?,
            None => cmd.output().await.map_err(spawn_error)?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if let Some(log) = &invocation.output_log {
            if let Some(parent) = log.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if let Err(e) = tokio::fs::write(log, combined.as_bytes()).await {
                warn!("Failed to write output log {}: {}", log.display(), e);
            }
        }

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::new("docker").args(["run", "--rm", "alpine"]);
        assert_eq!(inv.display(), "docker run --rm alpine");
    }

    #[tokio::test]
    async fn test_missing_executable_is_execution_error() {
        let inv = Invocation::new("cubexec-definitely-missing-binary");
        let err = ProcessExecutor::new().execute(&inv).await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let inv = Invocation::new("sh").args(["-c", "echo boom; exit 3"]);
        let err = run_checked(&ProcessExecutor::new(), &inv).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let inv = Invocation::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50));
        let err = ProcessExecutor::new().execute(&inv).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
