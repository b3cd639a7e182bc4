//! Error types for session orchestration.

use cashpoint_hardware::DeviceError;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by session lifecycle operations.
///
/// Note that `dispense()` itself does not return these: transaction
/// outcomes, including faults, are carried in the settlement record.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session configuration is invalid; reported before any
    /// hardware command is issued.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Device bring-up failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// The session was closed and must not be reused.
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_display() {
        let err = SessionError::configuration("dispense limit must be positive");
        assert_eq!(
            err.to_string(),
            "configuration error: dispense limit must be positive"
        );
    }

    #[test]
    fn device_error_converts() {
        let err: SessionError = DeviceError::NotInitialized.into();
        assert!(matches!(err, SessionError::Device(_)));
    }
}
