//! Running child processes under a deadline.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Ways a child process run via [`CommandRunExt`] can fail.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be started at all.
    #[error("Spawning {program} failed: {source}")]
    Spawn {
        /// The program name
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Talking to the child over its pipes failed.
    #[error("I/O with {program} failed: {source}")]
    Io {
        /// The program name
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The deadline passed; the child has been killed.
    #[error("{program} timed out after {timeout:?}")]
    Timeout {
        /// The program name
        program: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },
    /// The child ran and exited unsuccessfully.
    #[error("{program} exited with {}: {}", describe_code(.code), .output.trim())]
    Failed {
        /// The program name
        program: String,
        /// Exit code; `None` if killed by a signal
        code: Option<i32>,
        /// Captured stdout followed by stderr
        output: String,
    },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "signal".into(),
    }
}

impl CommandError {
    /// Whether this failure was the deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Helpers intended for [`tokio::process::Command`].
#[allow(async_fn_in_trait)]
pub trait CommandRunExt {
    /// Run the command to completion within `timeout`, optionally feeding
    /// `input` on stdin, and return its stdout. The child is killed if the
    /// deadline passes.
    async fn run_capture(
        &mut self,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, CommandError>;
}

impl CommandRunExt for Command {
    async fn run_capture(
        &mut self,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let program = self.as_std().get_program().to_string_lossy().into_owned();
        // Default to noninteractive
        let stdin = if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        self.stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tracing::debug!("exec: {:?}", self.as_std());
        let mut child = self.spawn().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;
        let child_stdin = child.stdin.take();
        let run = async move {
            if let (Some(mut child_stdin), Some(input)) = (child_stdin, input) {
                child_stdin.write_all(input).await?;
                child_stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };
        // On timeout the future (and thus the child) is dropped, which kills it.
        let o = match tokio::time::timeout(timeout, run).await {
            Ok(r) => r.map_err(|source| CommandError::Io {
                program: program.clone(),
                source,
            })?,
            Err(_) => return Err(CommandError::Timeout { program, timeout }),
        };
        if !o.status.success() {
            let mut output = String::from_utf8_lossy(&o.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&o.stderr));
            return Err(CommandError::Failed {
                program,
                code: o.status.code(),
                output,
            });
        }
        Ok(String::from_utf8_lossy(&o.stdout).into_owned())
    }
}
