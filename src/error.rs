//! Error taxonomy for the fleet dispatcher.
//!
//! Transport/device errors are surfaced to the caller as-is for one call;
//! retrying across calls is the Connection's job (reconnect backoff), not
//! the caller's.

use thiserror::Error;

/// A numeric error code reported by a Global Cache device (`ERR_<m>:<p>,<code>`
/// or `ERR <code>`).
pub type DeviceErrorCode = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("bad keyset: {0}")]
    BadKeyset(String),

    #[error("bad config: {0}")]
    BadConfig(String),

    #[error("unknown slot {0}")]
    UnknownSlot(u32),

    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error("unknown key {key:?} on device {device:?}")]
    UnknownKey { device: String, key: String },

    #[error("connection not ready")]
    NotReady,

    #[error("device port busy")]
    DeviceBusy,

    #[error("device reported error code {0}")]
    DeviceError(DeviceErrorCode),

    #[error("request timed out")]
    Timeout,

    #[error("link lost")]
    LinkLost,

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl DispatchError {
    /// Whether this error kind is locally retriable by the Connection's own
    /// reconnect/backoff logic (as opposed to being terminal for the call
    /// that observed it).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DispatchError::NotReady
                | DispatchError::DeviceBusy
                | DispatchError::Timeout
                | DispatchError::LinkLost
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
