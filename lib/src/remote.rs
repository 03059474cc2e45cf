//! Running commands on a remote host over ssh.
//!
//! The same channel type is used for the control host (to drive the flash)
//! and for the device under test once it has booted; only the destination
//! differs.

use std::time::Duration;

use labflash_utils::{CommandError, CommandRunExt};
use tokio::process::Command;

/// Deadline for short remote commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for the lab trust model: hosts are reflashed constantly, so
/// their keys change and must not be pinned.
pub const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

/// Failure of a remote command.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The command did not finish in time; the local ssh process is gone.
    #[error("Timed out after {timeout:?} running `{command}` on {destination}")]
    Timeout {
        /// `user@host`
        destination: String,
        /// The remote command line
        command: String,
        /// The deadline that passed
        timeout: Duration,
    },
    /// The command (or the connection) exited unsuccessfully.
    #[error("Running `{command}` on {destination} failed: {output}")]
    Command {
        /// `user@host`
        destination: String,
        /// The remote command line
        command: String,
        /// Exit status, 255 for ssh transport failures
        code: Option<i32>,
        /// Captured stdout and stderr
        output: String,
    },
    /// ssh itself could not be run.
    #[error("Running ssh to {destination} failed")]
    Transport {
        /// `user@host`
        destination: String,
        /// Underlying error
        #[source]
        source: CommandError,
    },
}

/// A host that accepts shell commands.
#[allow(async_fn_in_trait)]
pub trait RemoteShell {
    /// `user@host`, for messages.
    fn destination(&self) -> String;

    /// Run `command` through the remote login shell, feeding `input` on
    /// stdin if given, and return stdout.
    async fn run_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, RemoteError>;

    /// Run `command` with stdin closed.
    async fn run(&self, command: &str, timeout: Duration) -> Result<String, RemoteError> {
        self.run_with_input(command, None, timeout).await
    }
}

/// Remote shell via the system `ssh` client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshChannel {
    user: String,
    host: String,
}

impl SshChannel {
    /// Create a channel to `user@host`.
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }

    /// The full argument vector passed to `ssh`.
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        SSH_OPTIONS
            .iter()
            .map(|s| s.to_string())
            .chain([self.destination(), command.to_owned()])
            .collect()
    }
}

impl RemoteShell for SshChannel {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    async fn run_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, RemoteError> {
        tracing::debug!("{}: {command}", self.destination());
        let r = Command::new("ssh")
            .args(self.ssh_args(command))
            .run_capture(input, timeout)
            .await;
        r.map_err(|e| match e {
            CommandError::Timeout { timeout, .. } => RemoteError::Timeout {
                destination: self.destination(),
                command: command.to_owned(),
                timeout,
            },
            CommandError::Failed { code, output, .. } => RemoteError::Command {
                destination: self.destination(),
                command: command.to_owned(),
                code,
                output,
            },
            source => RemoteError::Transport {
                destination: self.destination(),
                source,
            },
        })
    }
}
