use crate::core::transport::TransportError;

/// Failure taxonomy for gateway-routed device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// No session exists for the requested device (never registered, or
    /// already torn down and dropped from the registry).
    #[error("device not initialized")]
    NotInitialized,

    /// The transport was invalidated by a concurrent removal. The check is
    /// made after the device lock is acquired, so an operation that lost the
    /// race to a teardown fails here instead of touching a freed transport.
    #[error("device is gone")]
    DeviceGone,

    /// The device was live but the native call reported a protocol error.
    #[error("transport call failed (native code {code})")]
    Transport { code: i32 },
}

impl From<TransportError> for DeviceError {
    fn from(err: TransportError) -> Self {
        DeviceError::Transport { code: err.code }
    }
}
