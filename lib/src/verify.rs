//! Probing which image the device is currently running.

use std::time::Duration;

use crate::remote::RemoteShell;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
/// Command that only succeeds on a booted test image.
pub const TEST_PROBE: &str = "snap -h";
/// The control image is a stock Debian-family system.
const CONTROL_ISSUE_MARKER: &str = "GNU";

/// What the device was found to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPersonality {
    /// The control image answered
    Control,
    /// The test image answered
    Test,
    /// Neither did
    Unknown,
}

/// Probes over the control channel and the test-account channel. Probe
/// failures of any kind read as "not booted".
#[derive(Debug)]
pub struct BootVerifier<'a, R> {
    control: &'a R,
    test: &'a R,
}

impl<'a, R: RemoteShell> BootVerifier<'a, R> {
    /// Create a verifier using the given channels.
    pub fn new(control: &'a R, test: &'a R) -> Self {
        Self { control, test }
    }

    /// Whether the test image is up and reachable as the test user.
    pub async fn is_test_booted(&self) -> bool {
        match self.test.run(TEST_PROBE, PROBE_TIMEOUT).await {
            Ok(_) => {
                tracing::info!("Test image booted on {}", self.test.destination());
                true
            }
            Err(e) => {
                tracing::debug!("Test image probe: {e}");
                false
            }
        }
    }

    /// Whether the control image is up.
    pub async fn is_control_booted(&self) -> bool {
        match self.control.run("cat /etc/issue", PROBE_TIMEOUT).await {
            Ok(issue) => issue.contains(CONTROL_ISSUE_MARKER),
            Err(e) => {
                tracing::debug!("Control image probe: {e}");
                false
            }
        }
    }

    /// Probe both personalities, test first.
    pub async fn personality(&self) -> BootPersonality {
        if self.is_test_booted().await {
            BootPersonality::Test
        } else if self.is_control_booted().await {
            BootPersonality::Control
        } else {
            BootPersonality::Unknown
        }
    }
}
