//! Selecting which image the device boots next, via local lab hardware.

use std::time::Duration;

use anyhow::Context;

use crate::config::DeviceConfig;
use crate::error::ResultExt;
use crate::task::{Task, TaskRunner};
use crate::Result;

const SETBOOT_TIMEOUT: Duration = Duration::from_secs(60);
const RESET_TIMEOUT: Duration = Duration::from_secs(120);

/// The two boot personalities a device can be switched between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    /// The known-good control (master) image
    Control,
    /// The freshly written test image
    Test,
}

/// Runs the configured boot-select and reset commands.
#[derive(Debug)]
pub struct BootModeController<'a, L> {
    runner: &'a L,
    config: &'a DeviceConfig,
}

impl<'a, L: TaskRunner> BootModeController<'a, L> {
    /// Create a controller for `config`.
    pub fn new(runner: &'a L, config: &'a DeviceConfig) -> Self {
        Self { runner, config }
    }

    async fn run_script(&self, script: &[String], timeout: Duration) -> anyhow::Result<()> {
        for line in script {
            let task = Task::parse(line)?.timeout(timeout);
            self.runner
                .run(&task)
                .await
                .with_context(|| format!("Running {line:?}"))?;
        }
        Ok(())
    }

    /// Make the next boot use `target`.
    pub async fn setboot(&self, target: BootTarget) -> Result<()> {
        tracing::info!("Selecting {target:?} boot mode");
        let script = match target {
            BootTarget::Control => &self.config.select_master_script,
            BootTarget::Test => &self.config.select_test_script,
        };
        self.run_script(script, SETBOOT_TIMEOUT)
            .await
            .context("timeout reaching control host")
            .or_provisioning()
    }

    /// Power cycle the device.
    pub async fn hard_reset(&self) -> Result<()> {
        tracing::info!("Hard resetting device");
        self.run_script(&self.config.reboot_script, RESET_TIMEOUT)
            .await
            .context("Hard reset failed")
            .or_recovery()
    }
}
