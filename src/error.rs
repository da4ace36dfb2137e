//! Unified error type for the bypass engine and its coordinator.
//!
//! `BypassError` is returned by every operation that may propagate to a caller.
//! Only precondition failures and unexpected state-transition violations reach
//! the caller; transient I/O and best-effort failures are logged and absorbed.
//! It serializes as `{ "kind": "...", "message": "..." }` so a front end can
//! distinguish error categories without string matching.

use serde::ser::SerializeStruct;

/// Engine-level error.
#[derive(Debug, thiserror::Error)]
pub enum BypassError {
    /// The current platform has no packet interception backend.
    #[error("{0}")]
    Platform(String),

    /// The process lacks the privilege required to open a driver handle.
    #[error("{0}")]
    Privilege(String),

    /// The interception driver library or kernel driver is not installed.
    #[error("{0}")]
    DriverMissing(String),

    /// A driver handle could not be opened (bad filter, driver refused, ...).
    #[error("{0}")]
    HandleOpen(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("{0}")]
    InvalidState(String),

    /// Invalid or missing caller input.
    #[error("{0}")]
    InvalidInput(String),

    /// The operation observed its cancellation signal and rolled back.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O and OS-level errors (filesystem, sockets, send failures).
    #[error("{0}")]
    Io(String),
}

impl BypassError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            BypassError::Platform(_) => "Platform",
            BypassError::Privilege(_) => "Privilege",
            BypassError::DriverMissing(_) => "DriverMissing",
            BypassError::HandleOpen(_) => "HandleOpen",
            BypassError::InvalidState(_) => "InvalidState",
            BypassError::InvalidInput(_) => "InvalidInput",
            BypassError::Cancelled => "Cancelled",
            BypassError::Io(_) => "Io",
        }
    }

    /// True for failures that must abort `enable` before any handle is opened.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BypassError::Platform(_) | BypassError::Privilege(_) | BypassError::DriverMissing(_)
        )
    }
}

impl serde::Serialize for BypassError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("BypassError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

impl From<std::io::Error> for BypassError {
    fn from(err: std::io::Error) -> Self {
        BypassError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for BypassError {
    fn from(err: anyhow::Error) -> Self {
        BypassError::Io(format!("{err:#}"))
    }
}

/// Human-readable hint for a Win32 error code returned while opening a driver handle.
pub fn driver_error_hint(code: i32) -> &'static str {
    match code {
        2 => "ERROR_FILE_NOT_FOUND (driver files missing next to the executable)",
        5 => "ERROR_ACCESS_DENIED (run as administrator)",
        87 => "ERROR_INVALID_PARAMETER (invalid filter/priority/flags)",
        577 => "ERROR_INVALID_IMAGE_HASH (driver signature rejected)",
        654 => "ERROR_DRIVER_FAILED_PRIOR_UNLOAD (incompatible driver version still loaded)",
        1060 => "ERROR_SERVICE_DOES_NOT_EXIST (driver service not installed)",
        1275 => "ERROR_DRIVER_BLOCKED (driver blocked by security software)",
        1753 => "EPT_S_NOT_REGISTERED (base filtering engine is disabled)",
        _ => "unknown driver error",
    }
}
