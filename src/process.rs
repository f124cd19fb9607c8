//! External process execution.
//!
//! Executors and tool discovery never spawn processes directly; they go
//! through [`ProcessRunner`] so that tests can script tool behaviour.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-invocation settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Let the child write straight to the terminal instead of capturing.
    pub stream_output: bool,
}

impl RunOptions {
    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn streaming(mut self, stream_output: bool) -> Self {
        self.stream_output = stream_output;
        self
    }
}

/// Failures that callers classify differently from a plain non-zero exit.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("'{program}' could not be started: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("'{program}' was cancelled")]
    Cancelled { program: String },
}

/// Trait for running system processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs a program to completion and returns its output, whatever the
    /// exit status. Only failures to run at all are errors.
    async fn run(&self, program: &str, args: &[String], options: &RunOptions) -> Result<Output>;

    /// Checks if a program exists in PATH.
    fn program_exists(&self, program: &str) -> bool;
}

/// Default process runner using tokio's process support.
pub struct SystemProcessRunner;

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, program: &str, args: &[String], options: &RunOptions) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true).stdin(Stdio::null());
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        if options.stream_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        info!("Executing: {} {:?}", program, args);
        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let wait = child.wait_with_output();
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match options.timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending().await,
            }
        };

        // Dropping `wait` kills the child.
        tokio::select! {
            output = wait => {
                let output = output?;
                debug!("'{}' exited with {}", program, output.status);
                Ok(output)
            }
            _ = cancelled => Err(ProcessError::Cancelled { program: program.to_string() }.into()),
            _ = deadline => Err(ProcessError::TimedOut {
                program: program.to_string(),
                after: options.timeout.unwrap_or_default(),
            }
            .into()),
        }
    }

    fn program_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Output as text, stdout then stderr, trimmed.
pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.trim().is_empty() {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text.trim().to_string()
}


#[cfg(test)]
mod tests {
    use super::testing::{failure, success};
    use super::*;

    #[test]
    fn test_combined_output_joins_streams() {
        let mut output = success("go version go1.21.0 linux/amd64\n");
        output.stderr = b"warning: GOPATH unset\n".to_vec();
        assert_eq!(
            combined_output(&output),
            "go version go1.21.0 linux/amd64\nwarning: GOPATH unset"
        );
        assert_eq!(combined_output(&failure("  boom \n")), "boom");
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let output = SystemProcessRunner
            .run("sh", &["-c".to_string(), "echo hello".to_string()], &RunOptions::default())
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(combined_output(&output), "hello");
    }

    #[tokio::test]
    async fn test_system_runner_missing_program_is_spawn_error() {
        let err = SystemProcessRunner
            .run("stratum-no-such-program", &[], &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::Spawn { .. })
        ));
        assert!(!SystemProcessRunner.program_exists("stratum-no-such-program"));
    }

    #[tokio::test]
    async fn test_system_runner_honours_timeout() {
        let options = RunOptions::default().with_timeout(Duration::from_millis(50));
        let err = SystemProcessRunner
            .run("sleep", &["5".to_string()], &options)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::TimedOut { .. })
        ));
    }

    #[tokio::test]
    async fn test_system_runner_honours_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let options = RunOptions::default().with_cancel(token);
        let err = SystemProcessRunner
            .run("sleep", &["5".to_string()], &options)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::Cancelled { .. })
        ));
    }
}
