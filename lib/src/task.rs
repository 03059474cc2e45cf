//! Commands run on the agent host itself, such as lab power switches and
//! boot-select relays, as opposed to commands on the control host.

use std::time::Duration;

use anyhow::Result;
use labflash_utils::{CommandError, CommandRunExt};
use tokio::process::Command;

/// Default deadline for a local task.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A local command with a description and deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Human readable description, logged before running
    pub description: String,
    /// Program and arguments
    pub argv: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Deadline for the whole command
    pub timeout: Duration,
}

impl Task {
    /// Create a task from an argument vector.
    pub fn new<S: Into<String>>(
        description: impl Into<String>,
        argv: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            description: description.into(),
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a task from a configured command line, split with shell
    /// word rules. The line itself is used as the description.
    pub fn parse(cmdline: &str) -> Result<Self> {
        let argv = labflash_utils::shell_split(cmdline)?;
        Ok(Self::new(format!("Running {cmdline}"), argv))
    }

    /// Override the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.push((k.into(), v.into()));
        self
    }

    /// The program name, for messages.
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

/// Something that can execute a [`Task`].
#[allow(async_fn_in_trait)]
pub trait TaskRunner {
    /// Run the task to completion, returning its stdout.
    async fn run(&self, task: &Task) -> Result<String, CommandError>;
}

/// Runs tasks as child processes of this agent.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl TaskRunner for HostRunner {
    async fn run(&self, task: &Task) -> Result<String, CommandError> {
        let Some((exe, args)) = task.argv.split_first() else {
            return Err(CommandError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        tracing::info!("{}", task.description);
        let mut cmd = Command::new(exe);
        cmd.args(args);
        cmd.envs(task.env.iter().map(|(k, v)| (k, v)));
        cmd.run_capture(None, task.timeout).await
    }
}
