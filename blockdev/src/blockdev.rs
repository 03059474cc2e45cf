//! Model of `lsblk` output for a block device on a lab control host.
//!
//! The control host is a different machine from the one running the agent,
//! so nothing here executes commands: callers run [`list_command`] over their
//! remote channel and hand the output to [`parse_list`].

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device or one of its partitions.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Device {
    /// Kernel name, e.g. `sda1` or `mmcblk0p2`
    pub name: String,
    /// `disk`, `part`, ...
    #[serde(rename = "type")]
    pub devtype: Option<String>,
    /// Filesystem type, if any was detected
    pub fstype: Option<String>,
    /// Filesystem label
    pub label: Option<String>,
    /// Partitions, in table order
    pub children: Option<Vec<Device>>,
}

impl Device {
    // Older lsblk doesn't have PATH, so we do it
    /// The device node path.
    pub fn path(&self) -> String {
        format!("/dev/{}", &self.name)
    }

    /// Whether the device has any partitions.
    pub fn has_children(&self) -> bool {
        self.children.as_ref().map_or(false, |v| !v.is_empty())
    }

    /// Names of the direct children, in enumeration order.
    pub fn child_names(&self) -> Vec<&str> {
        self.children
            .iter()
            .flatten()
            .map(|c| c.name.as_str())
            .filter(|n| !n.is_empty())
            .collect()
    }
}

/// The command line that lists `dev` and its partitions as JSON.
pub fn list_command(dev: &Utf8Path) -> Result<String> {
    validate_device_path(dev)?;
    labflash_utils::shell_join(["lsblk", "-J", "-o", "NAME,TYPE,FSTYPE,LABEL", dev.as_str()])
}

/// Parse the output of [`list_command`], returning the listed device.
#[context("Parsing lsblk output")]
pub fn parse_list(output: &str) -> Result<Device> {
    let devs: DevicesOutput = serde_json::from_str(output)?;
    let dev = devs
        .blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk"))?;
    tracing::debug!("Found {} with {} children", dev.name, dev.child_names().len());
    for name in dev.child_names() {
        validate_device_name(name)?;
    }
    validate_device_name(&dev.name)?;
    Ok(dev)
}

fn is_device_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

/// Verify a kernel device name (as printed by lsblk) is a plain name
/// that is safe to splice under `/dev/`.
pub fn validate_device_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(is_device_char) {
        anyhow::bail!("Invalid block device name {name:?}");
    }
    Ok(())
}

/// Verify a configured device path is an absolute path under `/dev`.
pub fn validate_device_path(dev: &Utf8Path) -> Result<()> {
    let rest = dev
        .as_str()
        .strip_prefix("/dev/")
        .ok_or_else(|| anyhow!("Block device {dev} is not under /dev"))?;
    for component in rest.split('/') {
        if component == ".." {
            anyhow::bail!("Block device {dev} escapes /dev");
        }
        validate_device_name(component).with_context(|| format!("Validating {dev}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const SD_CARD: &str = indoc! {r#"
        {
           "blockdevices": [
              {"name":"sda", "type":"disk", "fstype":null, "label":null,
                 "children": [
                    {"name":"sda1", "type":"part", "fstype":"vfat", "label":"system-boot"},
                    {"name":"sda2", "type":"part", "fstype":"ext4", "label":"writable"}
                 ]
              }
           ]
        }
    "#};

    #[test]
    fn test_parse_children() {
        let dev = parse_list(SD_CARD).unwrap();
        assert_eq!(dev.path(), "/dev/sda");
        assert!(dev.has_children());
        assert_eq!(dev.child_names(), ["sda1", "sda2"]);
        let children = dev.children.as_ref().unwrap();
        assert_eq!(children[1].label.as_deref(), Some("writable"));
        assert_eq!(children[0].devtype.as_deref(), Some("part"));
    }

    #[test]
    fn test_parse_no_children() {
        let dev = parse_list(r#"{"blockdevices": [{"name":"mmcblk0","type":"disk"}]}"#).unwrap();
        assert!(!dev.has_children());
        assert!(dev.child_names().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_list(r#"{"blockdevices": []}"#).is_err());
        assert!(parse_list("not json").is_err());
        let hostile = r#"{"blockdevices": [{"name":"sda", "children": [{"name":"sda1;reboot"}]}]}"#;
        assert!(parse_list(hostile).is_err());
    }

    #[test]
    fn test_device_paths() {
        for ok in ["/dev/sda", "/dev/mmcblk0", "/dev/disk/by-id/usb-SanDisk_3.2Gen1-0:0"] {
            validate_device_path(Utf8Path::new(ok)).unwrap();
        }
        for bad in ["sda", "/dev/", "/dev/../etc/passwd", "/dev/sda b", "/tmp/sda", "/dev/sda*"] {
            assert!(validate_device_path(Utf8Path::new(bad)).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_list_command() {
        let cmd = list_command(Utf8Path::new("/dev/sda")).unwrap();
        assert_eq!(
            labflash_utils::shell_split(&cmd).unwrap(),
            ["lsblk", "-J", "-o", "NAME,TYPE,FSTYPE,LABEL", "/dev/sda"]
        );
        assert!(list_command(Utf8Path::new("/dev/sda;id")).is_err());
    }
}
