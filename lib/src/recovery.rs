//! Forcing a device back into its control image.

use crate::bootmode::{BootModeController, BootTarget};
use crate::budget::RetryBudget;
use crate::remote::RemoteShell;
use crate::task::TaskRunner;
use crate::verify::{BootPersonality, BootVerifier};
use crate::{Error, Result};

/// Polling for the control image after a reset.
pub const CONTROL_BOOT_BUDGET: RetryBudget = RetryBudget::from_secs(300, 10);
/// Upper bound on power cycles in one recovery.
pub const MAX_HARD_RESETS: u32 = 2;

/// Make sure the device is running its control image, switching the boot
/// mode and power cycling it as needed.
///
/// A device already on the control image is left alone. Otherwise the
/// device is reset (after selecting the control image, if the test image
/// is what is running) and polled; a test image seen while polling means
/// the boot switch did not happen yet, so it is selected and the device
/// reset again. Once the control image has been selected, a single reset
/// must bring it up. Boot-select failures are returned as they are.
pub async fn ensure_control_image<L, R>(
    boot: &BootModeController<'_, L>,
    verifier: &BootVerifier<'_, R>,
    budget: RetryBudget,
) -> Result<()>
where
    L: TaskRunner,
    R: RemoteShell,
{
    let mut switch = false;
    if verifier.is_test_booted().await {
        switch = true;
    } else if verifier.is_control_booted().await {
        tracing::debug!("Control image already booted");
        return Ok(());
    } else {
        tracing::warn!("Device is in an unknown state, attempting recovery");
    }

    for attempt in 1..=MAX_HARD_RESETS {
        if switch {
            boot.setboot(BootTarget::Control).await?;
        }
        boot.hard_reset().await?;
        let seen = budget
            .poll_for(move || async move {
                if verifier.is_control_booted().await {
                    Some(BootPersonality::Control)
                } else if !switch && verifier.is_test_booted().await {
                    Some(BootPersonality::Test)
                } else {
                    None
                }
            })
            .await;
        match seen {
            Some(BootPersonality::Control) => {
                tracing::info!("Control image booted after {attempt} reset(s)");
                return Ok(());
            }
            Some(_) => {
                tracing::info!("Test image came back; selecting control boot mode");
                switch = true;
            }
            None if switch => {
                return Err(Error::recovery_msg("Could not reboot to control image"));
            }
            None => tracing::warn!("No response after reset {attempt}"),
        }
    }
    Err(Error::recovery_msg(
        "Device is in an unknown state, may require manual recovery",
    ))
}
