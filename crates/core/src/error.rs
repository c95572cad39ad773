//! Error types for hidport-core.

use thiserror::Error;

/// Core library error type.
///
/// Variants carry rendered messages rather than source errors so that a
/// failure observed by a reader thread can be handed to every caller that
/// reads from the same handle afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No backend pair (or no usable backend) for the requested platform.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Device not found during enumeration or open.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The handle was closed, either before the call or while it was blocked.
    #[error("device handle is closed")]
    HandleClosed,

    /// An underlying OS or HID SDK call failed.
    #[error("I/O failure: {0}")]
    Io(String),

    /// The caller passed an argument the device layer cannot act on.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The active source has no way to perform the operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of errors and wait outcomes.
///
/// `Timeout` never comes out of [`Error::kind`]: a timeout is a normal
/// outcome reported through `WaitStatus::TimedOut` or a zero-length read.
/// It is listed so callers can classify both in one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    DeviceNotFound,
    HandleClosed,
    Timeout,
    IoFailure,
    InvalidInput,
    Unsupported,
}

impl Error {
    /// Classify an error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Error::HandleClosed => ErrorKind::HandleClosed,
            Error::Io(_) => ErrorKind::IoFailure,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Add context to an I/O failure without changing its kind.
    pub fn context(self, what: &str) -> Self {
        match self {
            Error::Io(msg) => Error::Io(format!("{what}: {msg}")),
            Error::DeviceNotFound(msg) => Error::DeviceNotFound(format!("{what}: {msg}")),
            other => other,
        }
    }

    /// Build an I/O failure from the calling thread's last OS error.
    pub fn last_os_error(what: &str) -> Self {
        Error::Io(format!("{what}: {}", std::io::Error::last_os_error()))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::DeviceNotFound(e.to_string()),
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<hidapi::HidError> for Error {
    fn from(e: hidapi::HidError) -> Self {
        let msg = e.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("no such device") || lower.contains("not found") {
            Error::DeviceNotFound(msg)
        } else {
            Error::Io(msg)
        }
    }
}

/// Build an [`Error::Io`] from a format string.
///
/// The arguments are checked against the format string by the compiler, so a
/// mismatched diagnostic is a build error rather than a garbled message.
#[macro_export]
macro_rules! io_failure {
    ($($arg:tt)*) => {
        $crate::error::Error::Io(::std::format!($($arg)*))
    };
}
