//! Subprocess runner
//!
//! Every external binary (docker, podman, git, sh) is invoked through
//! [`CommandRunner`] so that tests can substitute scripted output.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::trace;

/// One subprocess invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Bounded wait; `None` waits for exit
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `program arg1 arg2 ...` (for logs and error messages)
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished subprocess
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code (`None` if killed by a signal)
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stderr if non-empty, else stdout (engines are inconsistent)
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// The process could not be run to completion
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{command} timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;
}

/// Runs commands with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        trace!(command = %spec.display(), "Running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let spawn_error = |e: std::io::Error| ProcessError::Spawn {
            program: spec.program.clone(),
            message: e.to_string(),
        };

        let output = match spec.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| ProcessError::TimedOut {
                    command: spec.display(),
                    timeout,
                })?
                .map_err(spawn_error)?,
            None => cmd.output().await.map_err(spawn_error)?,
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_display() {
        let spec = CommandSpec::new("docker")
            .args(["stop", "-t", "10"])
            .arg("abc");
        assert_eq!(spec.display(), "docker stop -t 10 abc");
    }

    #[test]
    fn test_error_text_prefers_stderr() {
        let out = CommandOutput {
            status: Some(1),
            stdout: "out".to_string(),
            stderr: "  boom \n".to_string(),
        };
        assert_eq!(out.error_text(), "boom");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_real_process() {
        let out = TokioCommandRunner::new()
            .run(&CommandSpec::new("sh").args(["-c", "echo hi; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = TokioCommandRunner::new()
            .run(&CommandSpec::new("apex-definitely-not-installed").arg("--version"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let err = TokioCommandRunner::new()
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "sleep 5"])
                    .timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }
}
