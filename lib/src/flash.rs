//! Writing the served image onto the target block device.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8Path;
use labflash_utils::{shell_join, shell_quote};

use crate::config::DeviceConfig;
use crate::error::ResultExt;
use crate::remote::{RemoteError, RemoteShell};
use crate::{Error, Result};

const UMOUNT_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the whole download-decompress-write pipeline.
pub const FLASH_TIMEOUT: Duration = Duration::from_secs(1800);
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_SETTLE: Duration = Duration::from_secs(30);
const RESCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// The pipeline that pulls the image from `server:port`, decompresses it
/// and writes it to `dev`. Run under `bash -o pipefail` so a failure in
/// any stage fails the whole command.
pub fn flash_command(server: IpAddr, port: u16, dev: &Utf8Path) -> anyhow::Result<String> {
    let pipeline = format!(
        "nc.traditional {} {port} | gunzip -c | sudo dd of={} bs=16M",
        shell_quote(&server.to_string())?,
        shell_quote(dev.as_str())?
    );
    shell_join(["bash", "-o", "pipefail", "-c", pipeline.as_str()])
}

/// Flash the image served at `server:port` onto the configured test device.
pub async fn flash<R: RemoteShell>(
    control: &R,
    config: &DeviceConfig,
    server: IpAddr,
    port: u16,
) -> Result<()> {
    let dev = config.test_device()?;
    let quoted = shell_quote(dev.as_str()).or_provisioning()?;

    // Anything still mounted from the old image would make the rescan fail
    if let Err(e) = control
        .run(&format!("sudo umount {quoted}*"), UMOUNT_TIMEOUT)
        .await
    {
        tracing::warn!("Unmounting {dev}: {e}");
    }

    tracing::info!("Flashing {dev} from {server}:{port}");
    let cmd = flash_command(server, port, dev).or_provisioning()?;
    match control.run(&cmd, FLASH_TIMEOUT).await {
        Ok(_) => {}
        Err(e @ RemoteError::Timeout { .. }) => {
            return Err(Error::provisioning(
                anyhow::Error::new(e).context("timeout reached while flashing image"),
            ))
        }
        Err(e) => {
            return Err(Error::provisioning(
                anyhow::Error::new(e).context("Error while flashing image"),
            ))
        }
    }

    if let Err(e) = control.run("sync", SYNC_TIMEOUT).await {
        tracing::warn!("sync failed: {e}");
        tokio::time::sleep(SYNC_SETTLE).await;
    }

    control
        .run(&format!("sudo hdparm -z {quoted}"), RESCAN_TIMEOUT)
        .await
        .context("Unable to run hdparm to rescan partitions")
        .or_provisioning()?;
    Ok(())
}
