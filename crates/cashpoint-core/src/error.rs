//! Shared error type for the protocol and domain layers.
//!
//! Frame-level and domain-validation failures are reported through one enum
//! so the protocol crate and the drivers agree on what a malformed frame or
//! an invalid denomination looks like. Layer-specific failures (transport
//! timeouts, device faults, session faults) live in their own crates.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by frame parsing and domain-type validation.
#[derive(Debug, Error)]
pub enum Error {
    /// A byte at a fixed header position did not match the protocol.
    #[error("framing error at {position}: expected {expected:#04x}, got {found:#04x}")]
    UnexpectedByte {
        /// Which header position was being read.
        position: &'static str,
        /// The byte the protocol requires at that position.
        expected: u8,
        /// The byte actually received.
        found: u8,
    },

    /// The length field is outside the legal range.
    #[error("invalid length field {len} (allowed {min}..={max})")]
    InvalidLength { len: usize, min: usize, max: usize },

    /// The declared length does not match the serialized body.
    #[error("length mismatch: declared {declared}, body carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// XOR checksum over the frame did not verify.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// A frame terminator was missing where the length field placed it.
    #[error("missing ETX terminator, found {found:#04x}")]
    MissingEtx { found: u8 },

    /// Unknown command code byte.
    #[error("invalid command code {code:#04x}")]
    InvalidCommandCode { code: u8 },

    /// A response body was too short or carried an unknown status tag.
    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    /// A frame payload exceeds the protocol maximum.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Domain validation failure on a denomination, plan, or batch.
    #[error("invalid denomination data: {message}")]
    InvalidDenomination { message: String },

    /// Generic I/O failure bubbling up from the byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a malformed-response error.
    pub fn malformed_response(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Create an invalid-denomination error.
    pub fn invalid_denomination(message: impl Into<String>) -> Self {
        Self::InvalidDenomination {
            message: message.into(),
        }
    }

    /// True when the failure is a checksum mismatch, which the transport
    /// recovers from with a NAK/retransmit cycle rather than failing the
    /// call outright.
    pub fn is_checksum(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }
}
