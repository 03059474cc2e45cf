//! Scoped mounts on the control host.

use std::future::Future;

use anyhow::{Context, Result};
use labflash_blockdev::validate_device_name;
use labflash_utils::shell_join;

use crate::remote::{RemoteShell, DEFAULT_TIMEOUT};

/// Where partitions of the target device are mounted on the control host.
pub(crate) const MOUNT_POINT: &str = "/mnt";

/// Mount `/dev/<partition>` at [`MOUNT_POINT`], run `f`, then unmount.
///
/// The unmount is attempted whenever the mount succeeded, whatever `f`
/// returned. If `f` failed, that error wins and an unmount failure is only
/// logged.
pub(crate) async fn with_mount<R, F, Fut, T>(control: &R, partition: &str, f: F) -> Result<T>
where
    R: RemoteShell,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    validate_device_name(partition)?;
    let dev = format!("/dev/{partition}");
    let mount = shell_join(["sudo", "mount", dev.as_str(), MOUNT_POINT])?;
    let umount = shell_join(["sudo", "umount", MOUNT_POINT])?;

    control
        .run(&mount, DEFAULT_TIMEOUT)
        .await
        .with_context(|| format!("Mounting {dev}"))?;
    let r = f().await;
    let unmounted = control.run(&umount, DEFAULT_TIMEOUT).await;
    match (r, unmounted) {
        (Ok(v), Ok(_)) => Ok(v),
        (Ok(_), Err(e)) => Err(e).with_context(|| format!("Unmounting {MOUNT_POINT}")),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(ue)) => {
            tracing::warn!("Unmounting {MOUNT_POINT}: {ue}");
            Err(e)
        }
    }
}
