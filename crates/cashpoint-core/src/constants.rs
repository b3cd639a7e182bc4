//! Protocol-level constants for the cash unit serial protocol.
//!
//! This module defines every byte value, frame-geometry figure, and timing
//! default used by the framed transport and the device drivers. Centralizing
//! them here keeps the wire layer and the drivers in agreement about the
//! protocol shape.
//!
//! # Frame Layout
//!
//! Command and response frames share one binary layout:
//!
//! ```text
//! STX  ADDR  LEN_HI  LEN_LO  CMD  PARAM  payload...  ETX  BCC
//! 0x02 0x00  --------------  -----------------------  0x03 xor
//! ```
//!
//! `LEN` is a big-endian 16-bit count of the bytes from `CMD` through `ETX`
//! inclusive. `BCC` is the running XOR of every byte from `STX` through
//! `ETX`. Single control bytes (`ACK`, `NAK`) travel outside any frame.
//!
//! # Response Status Tags
//!
//! The first payload byte of a response (after the CMD/PARAM echo) is a
//! status tag:
//!
//! | Tag | Byte | Meaning |
//! |-----|------|---------|
//! | `PMT` | 0x50 | Positive completion; data follows |
//! | `EMT` | 0x45 | Device error; 2-byte error code follows |
//! | `NEG` | 0x4E | Negative acknowledgement; 2-byte error code follows |
//!
//! # Usage
//!
//! ```
//! use cashpoint_core::constants::*;
//!
//! // Frame geometry
//! let payload_len = 4usize;
//! let len_field = payload_len + LEN_BASE;
//! assert_eq!(len_field, 7);
//!
//! // Timeout configuration
//! use std::time::Duration;
//! let ack_wait = Duration::from_millis(ACK_TIMEOUT_MS);
//! assert_eq!(ack_wait.as_millis(), 300);
//! ```

// ============================================================================
// Control Bytes
// ============================================================================

/// Start-of-frame marker.
pub const STX: u8 = 0x02;

/// End-of-frame terminator, last byte covered by the length field.
pub const ETX: u8 = 0x03;

/// Positive acknowledgement control byte.
///
/// Sent by the device after receiving a well-formed command frame, and by
/// the host after receiving a response frame whose BCC verifies.
pub const ACK: u8 = 0x06;

/// Negative acknowledgement control byte.
///
/// Sent when a received frame fails BCC verification; the peer is expected
/// to retransmit the frame once.
pub const NAK: u8 = 0x15;

/// Address byte expected on every response frame.
///
/// Cash units on a point-to-point serial link always answer with address
/// zero; any other value at the address position is a framing error.
pub const RESPONSE_ADDR: u8 = 0x00;

// ============================================================================
// Response Status Tags
// ============================================================================

/// Positive completion tag (`PMT`).
pub const STATUS_PMT: u8 = 0x50;

/// Device error tag (`EMT`). Followed by a 2-byte big-endian error code.
pub const STATUS_EMT: u8 = 0x45;

/// Negative acknowledgement tag (`NEG`). Followed by a 2-byte big-endian
/// error code.
pub const STATUS_NEG: u8 = 0x4E;

/// Offset of the 2-byte error code inside an `EMT`/`NEG` response body,
/// counted from the status tag.
pub const ERROR_CODE_OFFSET: usize = 1;

// ============================================================================
// Frame Geometry
// ============================================================================

/// Bytes counted by `LEN` in addition to the payload: CMD, PARAM, ETX.
pub const LEN_BASE: usize = 3;

/// Fixed bytes surrounding the length-counted region: STX, ADDR, LEN_HI,
/// LEN_LO, BCC.
pub const FRAME_OVERHEAD: usize = 5;

/// Largest payload a single frame may carry.
///
/// The reference cash units never exceed a few dozen bytes; this bound
/// exists so a corrupted length field cannot make the reader accumulate
/// unbounded garbage.
pub const MAX_PAYLOAD_LEN: usize = 512;

/// Smallest legal value of the `LEN` field (empty payload: CMD+PARAM+ETX).
pub const MIN_LEN_FIELD: usize = LEN_BASE;

/// Largest legal value of the `LEN` field.
pub const MAX_LEN_FIELD: usize = MAX_PAYLOAD_LEN + LEN_BASE;

// ============================================================================
// Timing
// ============================================================================

/// How long the transport waits for `ACK`/`NAK` after transmitting a
/// command frame, in milliseconds.
pub const ACK_TIMEOUT_MS: u64 = 300;

/// Default deadline for a response frame after the command was
/// acknowledged, in milliseconds.
pub const RESPONSE_TIMEOUT_MS: u64 = 10_000;

/// Response deadline for mechanical operations (dispense, present,
/// retract), in milliseconds. Covers the customer take-cash window plus
/// shutter mechanics.
pub const MECHANICAL_TIMEOUT_MS: u64 = 35_000;

/// How long a recycler presents dispensed cash before retracting it, in
/// milliseconds.
pub const PRESENT_WINDOW_MS: u64 = 30_000;

// ============================================================================
// Device Limits
// ============================================================================

/// Maximum number of physical cassettes a supported cash unit carries.
pub const MAX_CASSETTES: usize = 8;

/// Largest note count a single batch may request from the mechanism when
/// no explicit limit is configured by the operator.
pub const DEFAULT_DISPENSE_LIMIT: u32 = 20;

/// Number of checksum retransmissions the transport attempts before
/// surfacing a checksum error.
pub const MAX_NAK_RETRIES: u8 = 1;
