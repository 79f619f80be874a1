//! Error identifiers surfaced to callers, and the close-reason taxonomy.
//!
//! Every fallible operation on the device layer returns one of these stable
//! variants so upstream routers can match on the failure class:
//!
//! - **validation** — [`DeviceError::InvalidDeviceName`]: rejected input.
//! - **capacity** — [`DeviceError::DeviceBusy`], [`DeviceError::TooManyDevices`]:
//!   transient, the caller may retry elsewhere.
//! - **state** — [`DeviceError::DeviceClosed`], [`TransactionError::NoSuchTransactionKey`]:
//!   terminal for that attempt.
//!
//! I/O errors on a connection never surface here; the pumps demote them to a
//! [`CloseReason`] and report them through `MessageFailed`/`Disconnect` events.

use serde::Serialize;
use thiserror::Error;

/// Errors returned by the device layer (registry, device, manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device name failed canonicalisation (unknown scheme, malformed
    /// MAC, or empty value).
    #[error("invalid device name")]
    InvalidDeviceName,
    /// No connected device matches the requested identifier.
    #[error("device not found")]
    DeviceNotFound,
    /// A device with this identifier is already connected and the registry is
    /// configured to reject duplicates.
    #[error("a device with this id is already connected")]
    NonUniqueId,
    /// A device with this identifier *and* routing key is already registered.
    #[error("a device with this key is already connected")]
    DuplicateKey,
    /// Admitting the device would exceed the registry capacity.
    #[error("device registry is full")]
    TooManyDevices,
    /// The device's send queue is full; enqueueing would block.
    #[error("device send queue is full")]
    DeviceBusy,
    /// The device has been closed; no further sends will succeed.
    #[error("device closed")]
    DeviceClosed,
    /// The request's deadline expired before it was accepted or answered.
    #[error("send timed out")]
    Timeout,
    /// A transaction response carried no contents to return.
    #[error("response has no contents")]
    ResponseNoContents,
    /// The connect filter rejected this device.
    #[error("connection rejected by filter")]
    FilterRejected,
    /// A transaction-table failure surfaced through a device send.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Errors returned by the transaction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// Transaction keys must be non-empty strings.
    #[error("transaction key is empty")]
    InvalidTransactionKey,
    /// `complete` was called for a key with no registered waiter.
    #[error("no such transaction key")]
    NoSuchTransactionKey,
    /// `register` was called for a key that already has a waiter.
    #[error("transaction key already registered")]
    TransactionAlreadyRegistered,
    /// The transaction was cancelled before a response arrived.
    #[error("transaction cancelled")]
    TransactionCancelled,
}

/// Why a device was disconnected.
///
/// Recorded on the device at close time and carried in the `Disconnect` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseReason {
    WriteError,
    ReadError,
    Inactivity,
    DuplicateConnection,
    Shutdown,
    GoAway,
    Rehash,
    ServiceClosing,
    UnknownError,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WriteError => "writeError",
            Self::ReadError => "readError",
            Self::Inactivity => "inactivity",
            Self::DuplicateConnection => "duplicateConnection",
            Self::Shutdown => "shutdown",
            Self::GoAway => "goAway",
            Self::Rehash => "rehash",
            Self::ServiceClosing => "serviceClosing",
            Self::UnknownError => "unknownError",
        }
    }

    /// Parse from the camelCase wire form (e.g. the operator disconnect API).
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "writeError" => Some(Self::WriteError),
            "readError" => Some(Self::ReadError),
            "inactivity" => Some(Self::Inactivity),
            "duplicateConnection" => Some(Self::DuplicateConnection),
            "shutdown" => Some(Self::Shutdown),
            "goAway" => Some(Self::GoAway),
            "rehash" => Some(Self::Rehash),
            "serviceClosing" => Some(Self::ServiceClosing),
            "unknownError" => Some(Self::UnknownError),
            _ => None,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
