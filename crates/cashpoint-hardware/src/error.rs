//! Error types for device driver operations.

use cashpoint_protocol::TransportError;

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors that can occur while driving a cash unit.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The serial link failed (timeout, checksum exhaustion, framing,
    /// closed stream) or the device refused/faulted on a command.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A response carried data the driver cannot interpret.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// The device rejected the operator licence token.
    #[error("licence rejected: {message}")]
    License { message: String },

    /// The cassette layout is unsupported by the device or the driver.
    #[error("unsupported cassette layout: {message}")]
    UnsupportedLayout { message: String },

    /// An operation was issued before `initialize()` completed.
    #[error("device not initialized")]
    NotInitialized,

    /// An operation was issued on a closed session.
    #[error("device session is closed")]
    Closed,
}

impl DeviceError {
    /// Create a protocol-violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a licence-rejected error.
    pub fn license(message: impl Into<String>) -> Self {
        Self::License {
            message: message.into(),
        }
    }

    /// Create an unsupported-layout error.
    pub fn unsupported_layout(message: impl Into<String>) -> Self {
        Self::UnsupportedLayout {
            message: message.into(),
        }
    }

    /// True when the underlying serial link itself failed, meaning the
    /// session must stop issuing commands. Device-reported faults and
    /// refusals are not link failures.
    #[must_use]
    pub fn is_link_failure(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_link_failure(),
            _ => false,
        }
    }

    /// The device fault code, when the device reported one.
    #[must_use]
    pub fn fault_code(&self) -> Option<u16> {
        match self {
            Self::Transport(TransportError::Device { code, .. }) => Some(*code),
            _ => None,
        }
    }
}
