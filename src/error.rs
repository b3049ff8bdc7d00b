//! Error types for member discovery and registration.

use crate::address::AddressParseError;
use std::fmt;

/// Result type alias for rendezvous operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by registry and lock backends.
///
/// Backends run inside the host's own transaction/retry wrapper, so their
/// failures stay opaque here and are simply carried upward.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during discovery and registration operations.
#[derive(Debug)]
pub enum Error {
    /// Configuration error. Fails fast at initialization.
    Config(String),

    /// A registry backend read or write failed.
    Store(StoreError),

    /// A distributed lock could not be acquired within the configured attempts.
    ///
    /// Only surfaced where the caller cannot proceed without the lock
    /// (startup self-registration); routine reconciliation treats contention
    /// as a skip, not an error.
    LockAcquisition {
        /// Name of the contended lock.
        name: String,
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// An address string could not be parsed.
    AddressParse(AddressParseError),
}

/// Broad classification of an error for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retrying the operation may succeed.
    Transient,
    /// Retrying will not help; the input or configuration must change.
    Permanent,
}

impl Error {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Transient - the store may recover, the lock may free up
            Error::Store(_) => ErrorKind::Transient,
            Error::LockAcquisition { .. } => ErrorKind::Transient,

            // Permanent - configuration or data must change
            Error::Config(_) => ErrorKind::Permanent,
            Error::AddressParse(_) => ErrorKind::Permanent,
        }
    }

    /// Check if this error is transient (may succeed if retried).
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this error is permanent (will not succeed with retries).
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => {
                write!(f, "configuration error: {}", msg)
            }
            Error::Store(err) => {
                write!(f, "registry store error: {}", err)
            }
            Error::LockAcquisition { name, attempts } => {
                write!(
                    f,
                    "failed to acquire lock '{}' after {} attempts",
                    name, attempts
                )
            }
            Error::AddressParse(err) => {
                write!(f, "{}", err)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(err) => Some(err.as_ref()),
            Error::AddressParse(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AddressParseError> for Error {
    fn from(err: AddressParseError) -> Self {
        Error::AddressParse(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}
