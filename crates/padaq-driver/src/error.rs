//! Error types for driver operations.

use padaq_board::Family;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Errors that can occur while driving the boards.
#[derive(Debug, Error)]
pub enum DaqError {
    /// Device node not present at the expected path.
    #[error("device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked.
        path: PathBuf,
    },

    /// Another process holds the advisory lock on the device.
    #[error("device locked by another process: {path}")]
    DeviceLocked {
        /// Path of the contested device.
        path: PathBuf,
    },

    /// I/O error during device communication.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A transfer moved fewer bytes than expected, or a register response
    /// did not echo the requested address.
    #[error("transfer failed: {reason}")]
    Transfer {
        /// Reason for failure.
        reason: String,
    },

    /// Another thread is already inside the wait primitive.
    #[error("a wait is already in progress")]
    Busy,

    /// The wait was cancelled before it started; the cancellation has been
    /// consumed and the wait may be retried.
    #[error("wait cancelled before it started")]
    Cancelled,

    /// The wait was cancelled while blocked.
    #[error("wait interrupted")]
    Interrupted,

    /// Operation not available on this hardware generation.
    #[error("{what} is not available on {family} boards")]
    Unsupported {
        /// The rejected operation.
        what: &'static str,
        /// Generation of the open device.
        family: Family,
    },

    /// ADC delay alignment did not converge.
    #[error("ADC alignment gave up after {attempts} attempts")]
    CalibrationFailed {
        /// Alignment attempts made before giving up.
        attempts: u32,
    },

    /// A mandatory reset step failed.
    #[error("reset failed: {reason}")]
    ResetFailed {
        /// Step that failed.
        reason: String,
    },
}

impl From<rustix::io::Errno> for DaqError {
    fn from(errno: rustix::io::Errno) -> Self {
        Self::Io {
            source: errno.into(),
        }
    }
}

impl DaqError {
    /// Create a transfer-failed error.
    pub fn transfer(reason: impl Into<String>) -> Self {
        Self::Transfer {
            reason: reason.into(),
        }
    }

    /// Create a reset-failed error.
    pub fn reset_failed(reason: impl Into<String>) -> Self {
        Self::ResetFailed {
            reason: reason.into(),
        }
    }

    /// Create an unsupported-operation error.
    #[must_use]
    pub const fn unsupported(what: &'static str, family: Family) -> Self {
        Self::Unsupported { what, family }
    }
}
