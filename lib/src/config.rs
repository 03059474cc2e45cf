//! # Device and job configuration
//!
//! The device configuration is a YAML document describing one lab device:
//! how to reach its control host and which local commands flip its boot
//! mode. The job is a JSON document naming the image to provision and the
//! credentials for the test account.

use std::net::IpAddr;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Login user on the control image when none is configured.
pub const DEFAULT_CONTROL_USER: &str = "pi";
/// Fleet-API distro series when the job names none.
pub const DEFAULT_DISTRO: &str = "xenial";
const DEFAULT_TEST_USER: &str = "ubuntu";
const DEFAULT_TEST_PASSWORD: &str = "ubuntu";

fn default_control_user() -> String {
    DEFAULT_CONTROL_USER.to_owned()
}

/// Static description of a lab device, loaded once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Name used to tag log output
    pub agent_name: Option<String>,
    /// Address of the device (its control image, and later the test image)
    pub device_ip: String,
    /// Login user on the control image
    #[serde(default = "default_control_user")]
    pub control_user: String,
    /// Address the control host should use to reach this agent
    pub agent_ip: Option<IpAddr>,
    /// Block device the test image is written to, as seen from the control
    /// image
    pub test_device: Option<Utf8PathBuf>,
    /// Local commands that make the next boot use the control image
    #[serde(default, alias = "select_control_script")]
    pub select_master_script: Vec<String>,
    /// Local commands that make the next boot use the test image
    #[serde(default)]
    pub select_test_script: Vec<String>,
    /// Local commands that power cycle the device
    #[serde(default)]
    pub reboot_script: Vec<String>,
    /// Commands run on the control host after the image is seeded
    #[serde(default)]
    pub post_provision_script: Vec<String>,
    /// Fleet-API user
    pub maas_user: Option<String>,
    /// Fleet-API machine id
    pub node_id: Option<String>,
}

impl DeviceConfig {
    /// Load and validate a config file.
    #[context("Loading device config {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    /// Parse and validate a config document. Unknown keys are warned about.
    pub fn parse(buf: &str) -> Result<Self> {
        let de = serde_yaml::Deserializer::from_str(buf);
        let mut unused = std::collections::BTreeSet::new();
        let c: Self = serde_ignored::deserialize(de, |path| {
            unused.insert(path.to_string());
        })
        .context("Parsing device config")?;
        for key in unused {
            tracing::warn!("Unknown key in device config: {key}");
        }
        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.device_ip.is_empty() || !self.device_ip.chars().all(is_host_char) {
            anyhow::bail!("Invalid device_ip {:?}", self.device_ip);
        }
        validate_username(&self.control_user).context("Validating control_user")?;
        if let Some(dev) = self.test_device.as_deref() {
            labflash_blockdev::validate_device_path(dev)?;
        }
        Ok(())
    }

    /// The target block device; destructive steps must call this first.
    pub fn test_device(&self) -> crate::Result<&Utf8Path> {
        let dev = self
            .test_device
            .as_deref()
            .ok_or_else(|| crate::Error::recovery_msg("Device config missing test_device"))?;
        labflash_blockdev::validate_device_path(dev).map_err(crate::Error::recovery)?;
        Ok(dev)
    }

    /// Name for the log span.
    pub fn agent_name(&self) -> &str {
        self.agent_name.as_deref().unwrap_or(&self.device_ip)
    }
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_')
}

fn validate_username(user: &str) -> Result<()> {
    let valid = !user.is_empty()
        && !user.starts_with('-')
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        anyhow::bail!("Invalid user name {user:?}");
    }
    Ok(())
}

/// Login for the test account seeded into the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Plain text password
    pub password: String,
}

/// What to provision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRequest {
    /// Image location
    #[serde(default)]
    pub provision_data: ProvisionData,
    /// Credentials for the test account
    #[serde(default)]
    pub test_data: TestData,
}

/// The `provision_data` section of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionData {
    /// URL of the raw disk image
    pub url: Option<String>,
    /// Distro series for the fleet-API variant
    pub distro: Option<String>,
}

/// The `test_data` section of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestData {
    /// Test account name
    pub test_username: String,
    /// Test account password
    pub test_password: String,
}

impl Default for TestData {
    fn default() -> Self {
        Self {
            test_username: DEFAULT_TEST_USER.to_owned(),
            test_password: DEFAULT_TEST_PASSWORD.to_owned(),
        }
    }
}

impl JobRequest {
    /// Load a job file.
    #[context("Loading job data {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    /// Parse a job document.
    pub fn parse(buf: &str) -> Result<Self> {
        serde_json::from_str(buf).context("Parsing job data")
    }

    /// The test account credentials, validated.
    pub fn credentials(&self) -> Result<Credentials> {
        let TestData {
            test_username,
            test_password,
        } = &self.test_data;
        validate_username(test_username).context("Validating test_username")?;
        Ok(Credentials {
            username: test_username.clone(),
            password: test_password.clone(),
        })
    }

    /// Distro series for the fleet-API variant.
    pub fn distro(&self) -> &str {
        self.provision_data
            .distro
            .as_deref()
            .unwrap_or(DEFAULT_DISTRO)
    }
}
