//! The two failure kinds callers act on.

use std::fmt::Display;

/// Process exit code for a failed job on a device that may still be usable.
pub const PROVISIONING_EXIT_CODE: i32 = 1;
/// Process exit code for a device that needs an operator.
pub const RECOVERY_EXIT_CODE: i32 = 46;

/// Top-level error for provisioning and recovery operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested job failed; a later recovery run may still salvage
    /// the device.
    #[error("Provisioning failed: {0:#}")]
    Provisioning(anyhow::Error),
    /// The device could not be returned to a known-good state.
    #[error("Recovery failed: {0:#}")]
    Recovery(anyhow::Error),
}

/// Result alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an error as a provisioning failure.
    pub fn provisioning(e: impl Into<anyhow::Error>) -> Self {
        Self::Provisioning(e.into())
    }

    /// Wrap an error as a recovery failure.
    pub fn recovery(e: impl Into<anyhow::Error>) -> Self {
        Self::Recovery(e.into())
    }

    /// A provisioning failure with just a message.
    pub fn provisioning_msg(msg: impl Display) -> Self {
        Self::Provisioning(anyhow::anyhow!("{msg}"))
    }

    /// A recovery failure with just a message.
    pub fn recovery_msg(msg: impl Display) -> Self {
        Self::Recovery(anyhow::anyhow!("{msg}"))
    }

    /// Whether the device needs manual intervention.
    pub fn is_recovery(&self) -> bool {
        matches!(self, Self::Recovery(_))
    }

    /// The exit code the CLI uses for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Provisioning(_) => PROVISIONING_EXIT_CODE,
            Self::Recovery(_) => RECOVERY_EXIT_CODE,
        }
    }
}

/// Map any error into one of the [`Error`] kinds.
pub(crate) trait ResultExt<T> {
    fn or_provisioning(self) -> Result<T>;
    fn or_recovery(self) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for std::result::Result<T, E> {
    fn or_provisioning(self) -> Result<T> {
        self.map_err(Error::provisioning)
    }

    fn or_recovery(self) -> Result<T> {
        self.map_err(Error::recovery)
    }
}

#[test]
fn test_exit_codes() {
    let e = Error::provisioning_msg("flash failed");
    assert_eq!(e.exit_code(), PROVISIONING_EXIT_CODE);
    assert!(!e.is_recovery());
    assert_eq!(e.to_string(), "Provisioning failed: flash failed");
    let e = Error::recovery(anyhow::anyhow!("reset failed").context("Hard reset"));
    assert_eq!(e.exit_code(), RECOVERY_EXIT_CODE);
    assert_eq!(e.to_string(), "Recovery failed: Hard reset: reset failed");
}
