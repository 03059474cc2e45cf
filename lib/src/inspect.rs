//! Classifying the image that was just written.
//!
//! Each partition of the target device is mounted in turn and its top
//! level listed; the first partition carrying a known marker directory
//! decides the image family.

use std::fmt;

use anyhow::Context;
use camino::Utf8Path;

use crate::error::ResultExt;
use crate::mount::{with_mount, MOUNT_POINT};
use crate::remote::{RemoteShell, DEFAULT_TIMEOUT};
use crate::Result;

/// Layout families of the images we know how to seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFamily {
    /// A classic Ubuntu root filesystem
    LegacyClassic,
    /// An Ubuntu Core (16/18) writable partition
    Core,
    /// An Ubuntu Core 20 (or later) data partition
    Core20,
    /// None of the above
    Unknown,
}

impl ImageFamily {
    /// Families in detection priority order.
    pub const DETECTION_ORDER: [ImageFamily; 3] =
        [ImageFamily::LegacyClassic, ImageFamily::Core, ImageFamily::Core20];

    /// Top level directory identifying this family.
    pub fn marker(self) -> Option<&'static str> {
        match self {
            ImageFamily::LegacyClassic => Some("etc"),
            ImageFamily::Core => Some("system-data"),
            ImageFamily::Core20 => Some("snaps"),
            ImageFamily::Unknown => None,
        }
    }

    /// Classify a partition from its top level entries.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let entries: Vec<&str> = entries.into_iter().collect();
        Self::DETECTION_ORDER
            .into_iter()
            .find(|f| f.marker().map_or(false, |m| entries.contains(&m)))
    }
}

impl fmt::Display for ImageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageFamily::LegacyClassic => "legacy-classic",
            ImageFamily::Core => "core",
            ImageFamily::Core20 => "core20",
            ImageFamily::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of inspecting the target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    /// The image family found
    pub family: ImageFamily,
    /// Kernel name of the partition it was found on (or the last one
    /// examined)
    pub partition: String,
}

/// Determine which image family landed on `dev`.
pub async fn detect<R: RemoteShell>(control: &R, dev: &Utf8Path) -> Result<Detected> {
    let cmd = labflash_blockdev::list_command(dev).or_provisioning()?;
    let out = control
        .run(&cmd, DEFAULT_TIMEOUT)
        .await
        .with_context(|| format!("Listing partitions of {dev}"))
        .or_provisioning()?;
    let disk = labflash_blockdev::parse_list(&out).or_provisioning()?;

    let names = if disk.has_children() {
        disk.child_names()
    } else {
        vec![disk.name.as_str()]
    };
    for name in names.iter().copied() {
        let listing = with_mount(control, name, || async {
            control
                .run(&format!("ls {MOUNT_POINT}"), DEFAULT_TIMEOUT)
                .await
                .map_err(anyhow::Error::from)
        })
        .await;
        let listing = match listing {
            Ok(l) => l,
            Err(e) => {
                tracing::debug!("Skipping {name}: {e:#}");
                continue;
            }
        };
        if let Some(family) = ImageFamily::from_entries(listing.split_whitespace()) {
            tracing::info!("Image type detected: {family} on {name}");
            return Ok(Detected {
                family,
                partition: name.to_owned(),
            });
        }
    }

    let partition = names.last().copied().unwrap_or(disk.name.as_str()).to_owned();
    Ok(Detected {
        family: ImageFamily::Unknown,
        partition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fake, Reply};

    const DISK: &str = r#"{"blockdevices": [{"name": "sda", "type": "disk",
        "children": [{"name": "sda1", "type": "part"}, {"name": "sda2", "type": "part"}]}]}"#;

    fn script(fake: &Fake, listings: &[&str]) {
        fake.on("lsblk", [Reply::ok(DISK)]);
        fake.on("ls /mnt", listings.iter().map(|l| Reply::ok(l)));
    }

    #[test]
    fn test_marker_priority() {
        use ImageFamily::*;
        assert_eq!(ImageFamily::from_entries(["boot", "etc", "usr"]), Some(LegacyClassic));
        assert_eq!(
            ImageFamily::from_entries(["snaps", "system-data", "etc"]),
            Some(LegacyClassic)
        );
        assert_eq!(ImageFamily::from_entries(["snaps", "system-data"]), Some(Core));
        assert_eq!(ImageFamily::from_entries(["snaps"]), Some(Core20));
        assert_eq!(ImageFamily::from_entries(["lost+found"]), None);
        assert_eq!(Core20.to_string(), "core20");
    }

    #[tokio::test]
    async fn test_detect_second_partition() {
        let fake = Fake::new();
        script(&fake, &["overlays\nstart.elf\n", "snaps\nsystem-data\n"]);
        let d = detect(&fake.shell("pi@ctl"), Utf8Path::new("/dev/sda"))
            .await
            .unwrap();
        assert_eq!(d.family, ImageFamily::Core);
        assert_eq!(d.partition, "sda2");
        // Every mount was paired with an unmount
        assert_eq!(fake.count("sudo mount"), 2);
        assert_eq!(fake.count("sudo umount /mnt"), 2);
    }

    #[tokio::test]
    async fn test_skips_unmountable() {
        let fake = Fake::new();
        fake.on("mount /dev/sda1", [Reply::Fail]);
        script(&fake, &["etc\nhome\n"]);
        let d = detect(&fake.shell("pi@ctl"), Utf8Path::new("/dev/sda"))
            .await
            .unwrap();
        assert_eq!(d.family, ImageFamily::LegacyClassic);
        assert_eq!(d.partition, "sda2");
        assert_eq!(fake.count("sudo umount /mnt"), 1);
    }

    #[tokio::test]
    async fn test_unknown_uses_last_partition() {
        let fake = Fake::new();
        script(&fake, &["lost+found\n"]);
        let d = detect(&fake.shell("pi@ctl"), Utf8Path::new("/dev/sda"))
            .await
            .unwrap();
        assert_eq!(
            d,
            Detected {
                family: ImageFamily::Unknown,
                partition: "sda2".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unpartitioned_disk() {
        let fake = Fake::new();
        fake.on("lsblk", [Reply::ok(r#"{"blockdevices": [{"name": "sdb"}]}"#)]);
        fake.on("ls /mnt", [Reply::ok("snaps\n")]);
        let d = detect(&fake.shell("pi@ctl"), Utf8Path::new("/dev/sdb"))
            .await
            .unwrap();
        assert_eq!(d.family, ImageFamily::Core20);
        assert_eq!(d.partition, "sdb");
    }

    #[tokio::test]
    async fn test_lsblk_failure() {
        let fake = Fake::new();
        fake.on("lsblk", [Reply::Fail]);
        let e = detect(&fake.shell("pi@ctl"), Utf8Path::new("/dev/sda"))
            .await
            .unwrap_err();
        assert!(!e.is_recovery());

        let fake = Fake::new();
        fake.on("lsblk", [Reply::ok("not json")]);
        let e = detect(&fake.shell("pi@ctl"), Utf8Path::new("/dev/sda"))
            .await
            .unwrap_err();
        assert!(!e.is_recovery());
    }
}
