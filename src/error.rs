//! Error types for the NV store.

use crate::store::NvIndex;
use thiserror::Error;

/// Result type alias for NV store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in NV store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Target index lies outside the user-writable band.
    #[error("NV index {index} is outside the user-writable range [{low}, {high}]")]
    OutOfRange {
        index: NvIndex,
        low: NvIndex,
        high: NvIndex,
    },

    /// Value is larger than the device accepts in one slot or one transfer.
    #[error("Value of {len} bytes exceeds the device limit of {limit} bytes ({which})")]
    ValueTooLarge {
        len: usize,
        limit: u32,
        which: &'static str,
    },

    /// Value is empty; NV indices cannot be defined with size 0.
    #[error("Value is empty: an NV index must hold at least one byte")]
    EmptyValue,

    /// Index is already allocated on the device.
    #[error("NV index {0} is already defined; refusing to overwrite")]
    DuplicateAddress(NvIndex),

    /// Password does not satisfy the minimum length policy.
    #[error("Password is too short: {len} chars, minimum is {min}")]
    WeakCredential { len: usize, min: usize },

    /// Device reported a different index than the one requested at define time.
    #[error("Define of NV index {requested} returned index {reported}")]
    AllocationMismatch {
        requested: NvIndex,
        reported: NvIndex,
    },

    /// Read-back after write did not match the value written.
    #[error("Verification of NV index {index} failed: {reason}; the index is left defined")]
    WriteVerification { index: NvIndex, reason: String },

    /// Device rejected the supplied authorization value.
    #[error("Authorization failed for NV index {index}: {diagnostic}")]
    Authentication { index: NvIndex, diagnostic: String },

    /// Index is not allocated on the device.
    #[error("NV index {0} does not exist")]
    NotFound(NvIndex),

    /// Device or transport failure.
    #[error("Device command `{command}` failed: {diagnostic}")]
    DeviceCommand { command: String, diagnostic: String },

    /// A device report is missing fields or has the wrong shape.
    #[error("Malformed device report from `{command}`: {reason}")]
    Report { command: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid store configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this error was raised by a pre-mutation check, before any
    /// device state could have changed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange { .. }
                | Error::ValueTooLarge { .. }
                | Error::EmptyValue
                | Error::DuplicateAddress(_)
                | Error::WeakCredential { .. }
        )
    }

    /// Index left defined on the device in a state the caller did not ask for.
    ///
    /// The store never cleans these up itself; callers decide whether to
    /// delete the slot.
    pub fn orphaned_index(&self) -> Option<NvIndex> {
        match self {
            Error::AllocationMismatch { requested, .. } => Some(*requested),
            Error::WriteVerification { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub(crate) fn device(command: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Error::DeviceCommand {
            command: command.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub(crate) fn report(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Report {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
