//! # Provisioning a device with a test image
//!
//! The orchestrator walks a device through a fixed sequence of stages:
//! the image is served and flashed through the control host, the result
//! is classified and seeded with a login, and the device is rebooted into
//! it. If any stage fails the target device is wiped, so that the next
//! power cycle falls back to the control image.

use std::cell::Cell;
use std::time::Duration;

use camino::Utf8Path;

use crate::bootmode::{BootModeController, BootTarget};
use crate::budget::RetryBudget;
use crate::config::{Credentials, DeviceConfig, JobRequest};
use crate::error::ResultExt;
use crate::inspect::ImageFamily;
use crate::remote::{RemoteShell, SshChannel};
use crate::task::{HostRunner, Task, TaskRunner};
use crate::verify::BootVerifier;
use crate::{flash, image, imageserver, inspect, recovery, seed};
use crate::{Error, Result};

const POST_PROVISION_TIMEOUT: Duration = Duration::from_secs(60);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(60);
const WIPE_TIMEOUT: Duration = Duration::from_secs(60);
const COPY_ID_TIMEOUT: Duration = Duration::from_secs(60);
// No BatchMode here: the password is the whole point.
const COPY_ID_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// Where the orchestrator is in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing started yet
    Idle,
    /// Serving and writing the image
    Flashing,
    /// Classifying the written image
    Inspecting,
    /// Writing first-boot login data
    Seeding,
    /// Running site specific commands on the control host
    PostProvision,
    /// Switching to and waiting for the test image
    BootingTest,
    /// The test image is up
    Verified,
    /// Cleaning up after a failure, or forcing the control image
    Recovering,
}

/// Waits used by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Pause after rebooting into the test image, before polling
    pub settle: Duration,
    /// Polling for the test image
    pub test_boot: RetryBudget,
    /// Polling for the control image during recovery
    pub control_boot: RetryBudget,
    /// How long the image server may take to see the client hang up
    pub server_drain: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(60),
            test_boot: RetryBudget::from_secs(600, 10),
            control_boot: recovery::CONTROL_BOOT_BUDGET,
            server_drain: Duration::from_secs(60),
        }
    }
}

/// Drives one device through provisioning or recovery.
#[derive(Debug)]
pub struct Provisioner<R, L> {
    config: DeviceConfig,
    job: JobRequest,
    control: R,
    test: R,
    runner: L,
    timings: Timings,
    stage: Cell<Stage>,
}

impl Provisioner<SshChannel, HostRunner> {
    /// Set up ssh channels for the control host and the test account.
    pub fn from_config(config: DeviceConfig, job: JobRequest) -> Self {
        let control = SshChannel::new(&config.control_user, &config.device_ip);
        let test = SshChannel::new(&job.test_data.test_username, &config.device_ip);
        Self::with_parts(config, job, control, test, HostRunner, Timings::default())
    }
}

impl<R: RemoteShell, L: TaskRunner> Provisioner<R, L> {
    /// Assemble an orchestrator from its collaborators.
    pub fn with_parts(
        config: DeviceConfig,
        job: JobRequest,
        control: R,
        test: R,
        runner: L,
        timings: Timings,
    ) -> Self {
        Self {
            config,
            job,
            control,
            test,
            runner,
            timings,
            stage: Cell::new(Stage::Idle),
        }
    }

    /// The current stage.
    pub fn stage(&self) -> Stage {
        self.stage.get()
    }

    fn enter(&self, stage: Stage) {
        tracing::debug!("{:?} -> {stage:?}", self.stage.get());
        self.stage.set(stage);
    }

    fn boot(&self) -> BootModeController<'_, L> {
        BootModeController::new(&self.runner, &self.config)
    }

    fn verifier(&self) -> BootVerifier<'_, R> {
        BootVerifier::new(&self.control, &self.test)
    }

    /// Force the device back to its control image.
    pub async fn ensure_control_image(&self) -> Result<()> {
        self.enter(Stage::Recovering);
        recovery::ensure_control_image(&self.boot(), &self.verifier(), self.timings.control_boot)
            .await?;
        self.enter(Stage::Idle);
        Ok(())
    }

    /// The job's image URL; a job without one is rejected.
    pub fn image_url(&self) -> Result<&str> {
        self.job.provision_data.url.as_deref().ok_or_else(|| {
            tracing::error!("Bad data passed for provisioning");
            Error::provisioning_msg("Error provisioning system")
        })
    }

    /// Bring the device to its control image, fetch the job's image into
    /// `workdir` and provision it. The job is checked before any hardware
    /// is touched.
    pub async fn run(&self, workdir: &Utf8Path) -> Result<()> {
        let url = self.image_url()?;
        self.ensure_control_image().await?;
        let image = image::prepare(url, workdir).await.or_provisioning()?;
        self.provision_image(&image).await
    }

    /// Provision the gzip-compressed image at `image`. On failure the
    /// target device is wiped and the original error returned.
    pub async fn provision_image(&self, image: &Utf8Path) -> Result<()> {
        let dev = self.config.test_device()?;
        let creds = self.job.credentials().or_provisioning()?;
        match self.run_stages(image, &creds).await {
            Ok(()) => {
                self.enter(Stage::Verified);
                tracing::info!("Provisioning complete");
                Ok(())
            }
            Err(e) => {
                self.enter(Stage::Recovering);
                tracing::error!("Failed to write image, cleaning up...");
                self.wipe(dev).await;
                Err(e)
            }
        }
    }

    async fn run_stages(&self, image: &Utf8Path, creds: &Credentials) -> Result<()> {
        self.enter(Stage::Flashing);
        self.flash_image(image).await?;

        self.enter(Stage::Inspecting);
        let dev = self.config.test_device()?;
        let detected = inspect::detect(&self.control, dev).await?;
        if detected.family == ImageFamily::Unknown {
            tracing::warn!(
                "Unrecognized image layout on {}; seeding it as a classic image",
                detected.partition
            );
        }

        self.enter(Stage::Seeding);
        seed::seed(&self.control, &detected, creds).await?;

        self.enter(Stage::PostProvision);
        self.run_post_provision().await;

        self.enter(Stage::BootingTest);
        self.boot_test_image(creds).await
    }

    async fn flash_image(&self, image: &Utf8Path) -> Result<()> {
        let server = match self.config.agent_ip {
            Some(ip) => ip,
            None => image::local_addr_toward(&self.config.device_ip).or_provisioning()?,
        };
        let session = imageserver::serve(image).await.or_provisioning()?;
        // If flashing fails the session is dropped here, which stops the server
        flash::flash(&self.control, &self.config, server, session.port()).await?;
        let sent = session
            .finish(self.timings.server_drain)
            .await
            .or_provisioning()?;
        tracing::info!("Image transfer complete ({sent} bytes)");
        Ok(())
    }

    async fn run_post_provision(&self) {
        for cmd in &self.config.post_provision_script {
            tracing::info!("Running {cmd}");
            if let Err(e) = self.control.run(cmd, POST_PROVISION_TIMEOUT).await {
                tracing::warn!("Error running {cmd}: {e}");
            }
        }
    }

    async fn boot_test_image(&self, creds: &Credentials) -> Result<()> {
        tracing::info!("Booting the test image");
        self.boot().setboot(BootTarget::Test).await?;
        // The connection usually drops before ssh sees an exit status
        if let Err(e) = self.control.run("sudo /sbin/reboot", REBOOT_TIMEOUT).await {
            tracing::debug!("Reboot: {e}");
        }
        tokio::time::sleep(self.timings.settle).await;

        let this = self;
        let verifier = &self.verifier();
        let booted = self
            .timings
            .test_boot
            .poll(move || async move {
                this.login_handshake(creds).await && verifier.is_test_booted().await
            })
            .await;
        if !booted {
            return Err(Error::provisioning_msg("Failed to boot test image"));
        }
        Ok(())
    }

    /// Install our key for the test account, authenticating with its
    /// password.
    async fn login_handshake(&self, creds: &Credentials) -> bool {
        let destination = format!("{}@{}", creds.username, self.config.device_ip);
        let mut argv = vec!["sshpass", "-e", "ssh-copy-id"];
        argv.extend_from_slice(COPY_ID_OPTIONS);
        argv.push(&destination);
        let task = Task::new(format!("Copying ssh key to {destination}"), argv)
            .env("SSHPASS", &creds.password)
            .timeout(COPY_ID_TIMEOUT);
        match self.runner.run(&task).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("{e}");
                false
            }
        }
    }

    async fn wipe(&self, dev: &Utf8Path) {
        let cmd = match labflash_utils::shell_join(["sudo", "wipefs", "-af", dev.as_str()]) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Not wiping {dev}: {e}");
                return;
            }
        };
        if let Err(e) = self.control.run(&cmd, WIPE_TIMEOUT).await {
            tracing::warn!("Wiping {dev} failed: {e}");
        }
    }
}
