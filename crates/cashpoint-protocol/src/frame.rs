//! Command and response frames in their binary wire format.
//!
//! # Wire Format
//!
//! Both directions share one layout:
//!
//! ```text
//! STX  ADDR  LEN_HI  LEN_LO  CMD  PARAM  payload...  ETX  BCC
//! ```
//!
//! `LEN` is a big-endian 16-bit count of the bytes from `CMD` through
//! `ETX` inclusive; `BCC` is the XOR of every byte from `STX` through
//! `ETX`. Responses additionally carry a status tag as the first payload
//! byte — `PMT` for success, `EMT`/`NEG` for faults with a 2-byte error
//! code — which [`ResponseFrame`] strips into [`ResponseStatus`].
//!
//! Frames are immutable once built; encoding always produces the same
//! bytes for the same frame.
//!
//! # Examples
//!
//! ```
//! use cashpoint_protocol::{CommandCode, Frame};
//!
//! let frame = Frame::new(0x00, CommandCode::Status, 0x00, &[]).unwrap();
//! let bytes = frame.encode();
//!
//! assert_eq!(bytes[0], 0x02); // STX
//! assert_eq!(&bytes[2..4], &[0x00, 0x03]); // LEN: CMD+PARAM+ETX
//! let parsed = Frame::parse(&bytes).unwrap();
//! assert_eq!(parsed.command(), CommandCode::Status);
//! ```

use crate::commands::CommandCode;
use bytes::{BufMut, Bytes, BytesMut};
use cashpoint_core::constants::*;
use cashpoint_core::{Error, Result};
use std::fmt;

/// XOR checksum over a byte run.
#[must_use]
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// An immutable command frame addressed to a cash unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    address: u8,
    command: CommandCode,
    parameter: u8,
    payload: Bytes,
}

impl Frame {
    /// Build a command frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] when the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn new(
        address: u8,
        command: CommandCode,
        parameter: u8,
        payload: &[u8],
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self {
            address,
            command,
            parameter,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Device address this frame is directed at.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Command code.
    #[must_use]
    pub fn command(&self) -> CommandCode {
        self.command
    }

    /// Command parameter byte.
    #[must_use]
    pub fn parameter(&self) -> u8 {
        self.parameter
    }

    /// Payload bytes (excluding CMD/PARAM).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to wire bytes, appending the checksum.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let len = self.payload.len() + LEN_BASE;
        let mut buf = BytesMut::with_capacity(len + FRAME_OVERHEAD);

        buf.put_u8(STX);
        buf.put_u8(self.address);
        buf.put_u16(len as u16);
        buf.put_u8(self.command.as_u8());
        buf.put_u8(self.parameter);
        buf.put_slice(&self.payload);
        buf.put_u8(ETX);
        let checksum = bcc(&buf);
        buf.put_u8(checksum);

        buf.freeze()
    }

    /// Parse a complete command frame from wire bytes.
    ///
    /// Used by device-side code (the mock cash unit) and round-trip tests;
    /// the host side receives responses through the incremental wire
    /// decoder instead.
    ///
    /// # Errors
    ///
    /// Any header deviation, length inconsistency, missing terminator, or
    /// checksum mismatch is a typed [`Error`]; parsing never panics on
    /// malformed input.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_LEN_FIELD + FRAME_OVERHEAD {
            return Err(Error::LengthMismatch {
                declared: MIN_LEN_FIELD,
                actual: bytes.len(),
            });
        }
        if bytes[0] != STX {
            return Err(Error::UnexpectedByte {
                position: "STX",
                expected: STX,
                found: bytes[0],
            });
        }

        let address = bytes[1];
        let len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        if !(MIN_LEN_FIELD..=MAX_LEN_FIELD).contains(&len) {
            return Err(Error::InvalidLength {
                len,
                min: MIN_LEN_FIELD,
                max: MAX_LEN_FIELD,
            });
        }
        if bytes.len() != len + FRAME_OVERHEAD {
            return Err(Error::LengthMismatch {
                declared: len + FRAME_OVERHEAD,
                actual: bytes.len(),
            });
        }

        let etx_pos = 4 + len - 1;
        if bytes[etx_pos] != ETX {
            return Err(Error::MissingEtx {
                found: bytes[etx_pos],
            });
        }

        let expected = bcc(&bytes[..etx_pos + 1]);
        let actual = bytes[etx_pos + 1];
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let command = CommandCode::from_u8(bytes[4])?;
        let parameter = bytes[5];
        let payload = &bytes[6..etx_pos];

        Frame::new(address, command, parameter, payload)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame[addr={:#04x}, cmd={}, param={:#04x}, payload={}B]",
            self.address,
            self.command,
            self.parameter,
            self.payload.len()
        )
    }
}

/// Outcome tag of a response, with fault codes already extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// `PMT`: the command completed; data follows.
    Positive,

    /// `EMT`: the device hit a fault executing the command.
    Error { code: u16 },

    /// `NEG`: the device refused the command.
    Negative { code: u16 },
}

impl ResponseStatus {
    /// Wire tag byte for this status.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Positive => STATUS_PMT,
            Self::Error { .. } => STATUS_EMT,
            Self::Negative { .. } => STATUS_NEG,
        }
    }

    /// Fault code for `EMT`/`NEG`, `None` for `PMT`.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Positive => None,
            Self::Error { code } | Self::Negative { code } => Some(*code),
        }
    }
}

/// A response frame with the status tag and CMD/PARAM echo stripped out.
///
/// `payload` holds only the data bytes after the status tag (and after
/// the error code, for `EMT`/`NEG`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    address: u8,
    command_echo: u8,
    parameter_echo: u8,
    status: ResponseStatus,
    payload: Bytes,
}

impl ResponseFrame {
    /// Build a response frame (device-side; the mock cash unit and tests
    /// use this to answer commands).
    pub fn new(
        address: u8,
        command_echo: u8,
        parameter_echo: u8,
        status: ResponseStatus,
        payload: &[u8],
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self {
            address,
            command_echo,
            parameter_echo,
            status,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Parse the length-counted body of a response frame (CMD through the
    /// byte before ETX), as collected by the wire decoder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] when the body is shorter than
    /// CMD+PARAM+tag, carries an unknown status tag, or an `EMT`/`NEG`
    /// body is too short for its error code.
    pub fn from_body(address: u8, body: &[u8]) -> Result<Self> {
        if body.len() < 3 {
            return Err(Error::malformed_response(format!(
                "body too short: {} bytes",
                body.len()
            )));
        }
        let command_echo = body[0];
        let parameter_echo = body[1];
        let tag = body[2];
        let rest = &body[3..];

        let (status, payload) = match tag {
            STATUS_PMT => (ResponseStatus::Positive, rest),
            STATUS_EMT | STATUS_NEG => {
                if rest.len() < ERROR_CODE_OFFSET + 1 {
                    return Err(Error::malformed_response(
                        "fault response missing error code",
                    ));
                }
                let code = u16::from_be_bytes([
                    rest[ERROR_CODE_OFFSET - 1],
                    rest[ERROR_CODE_OFFSET],
                ]);
                let status = if tag == STATUS_EMT {
                    ResponseStatus::Error { code }
                } else {
                    ResponseStatus::Negative { code }
                };
                (status, &rest[ERROR_CODE_OFFSET + 1..])
            }
            other => {
                return Err(Error::malformed_response(format!(
                    "unknown status tag {other:#04x}"
                )));
            }
        };

        ResponseFrame::new(address, command_echo, parameter_echo, status, payload)
    }

    /// Serialize to wire bytes, including status tag, error code, and
    /// checksum. Inverse of decoding through the wire decoder.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let code_len = if self.status.code().is_some() { 2 } else { 0 };
        let len = 1 + code_len + self.payload.len() + LEN_BASE;
        let mut buf = BytesMut::with_capacity(len + FRAME_OVERHEAD);

        buf.put_u8(STX);
        buf.put_u8(self.address);
        buf.put_u16(len as u16);
        buf.put_u8(self.command_echo);
        buf.put_u8(self.parameter_echo);
        buf.put_u8(self.status.tag());
        if let Some(code) = self.status.code() {
            buf.put_u16(code);
        }
        buf.put_slice(&self.payload);
        buf.put_u8(ETX);
        let checksum = bcc(&buf);
        buf.put_u8(checksum);

        buf.freeze()
    }

    /// Address byte the device answered with.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Echoed command byte.
    #[must_use]
    pub fn command_echo(&self) -> u8 {
        self.command_echo
    }

    /// Echoed parameter byte.
    #[must_use]
    pub fn parameter_echo(&self) -> u8 {
        self.parameter_echo
    }

    /// Response status with any fault code.
    #[must_use]
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// Data bytes after the status tag and error code.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl fmt::Display for ResponseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response[addr={:#04x}, cmd_echo={:#04x}, status={:?}, payload={}B]",
            self.address,
            self.command_echo,
            self.status,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_bit_exact() {
        let frame = Frame::new(0x00, CommandCode::Dispense, 0x01, &[0x05, 0x02]).unwrap();
        let bytes = frame.encode();

        // STX ADDR LEN_HI LEN_LO CMD PARAM p0 p1 ETX BCC
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[0], STX);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 5); // 2 payload + 3
        assert_eq!(bytes[4], CommandCode::Dispense.as_u8());
        assert_eq!(bytes[5], 0x01);
        assert_eq!(&bytes[6..8], &[0x05, 0x02]);
        assert_eq!(bytes[8], ETX);
        assert_eq!(bytes[9], bcc(&bytes[..9]));
    }

    #[test]
    fn command_round_trip() {
        let frame = Frame::new(0x00, CommandCode::SetCassettes, 0x02, &[1, 2, 3, 4]).unwrap();
        let parsed = Frame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn empty_payload_round_trip() {
        let frame = Frame::new(0x00, CommandCode::Status, 0x00, &[]).unwrap();
        let parsed = Frame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed.payload(), &[] as &[u8]);
    }

    #[test]
    fn parse_rejects_flipped_payload_bit() {
        let frame = Frame::new(0x00, CommandCode::Dispense, 0x00, &[0x10, 0x20]).unwrap();
        let mut bytes = frame.encode().to_vec();
        bytes[6] ^= 0x01;

        let err = Frame::parse(&bytes).unwrap_err();
        assert!(err.is_checksum());
    }

    #[test]
    fn parse_rejects_bad_stx() {
        let frame = Frame::new(0x00, CommandCode::Status, 0x00, &[]).unwrap();
        let mut bytes = frame.encode().to_vec();
        bytes[0] = 0x7F;

        assert!(matches!(
            Frame::parse(&bytes),
            Err(Error::UnexpectedByte {
                position: "STX",
                ..
            })
        ));
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let frame = Frame::new(0x00, CommandCode::Status, 0x00, &[1, 2]).unwrap();
        let mut bytes = frame.encode().to_vec();
        bytes.truncate(bytes.len() - 2);

        assert!(matches!(
            Frame::parse(&bytes),
            Err(Error::LengthMismatch { .. })
        ));
    }

    #[test]
    fn parse_rejects_missing_etx() {
        let frame = Frame::new(0x00, CommandCode::Status, 0x00, &[1]).unwrap();
        let mut bytes = frame.encode().to_vec();
        let etx_pos = bytes.len() - 2;
        bytes[etx_pos] = 0x00;
        // Recompute the checksum so only the terminator is wrong.
        let last = bytes.len() - 1;
        bytes[last] = bcc(&bytes[..last]);

        assert!(matches!(Frame::parse(&bytes), Err(Error::MissingEtx { .. })));
    }

    #[test]
    fn oversized_payload_is_rejected_at_construction() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            Frame::new(0x00, CommandCode::Dispense, 0x00, &payload),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn positive_response_round_trip() {
        let response = ResponseFrame::new(
            RESPONSE_ADDR,
            CommandCode::Dispense.as_u8(),
            0x01,
            ResponseStatus::Positive,
            &[3, 0, 2, 1],
        )
        .unwrap();

        let bytes = response.encode();
        // Body runs from CMD (index 4) to the byte before ETX.
        let len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        let body = &bytes[4..4 + len - 1];
        let parsed = ResponseFrame::from_body(bytes[1], body).unwrap();

        assert_eq!(parsed, response);
        assert_eq!(parsed.status(), ResponseStatus::Positive);
        assert_eq!(parsed.payload().as_ref(), &[3, 0, 2, 1]);
    }

    #[test]
    fn fault_response_carries_error_code() {
        let response = ResponseFrame::new(
            RESPONSE_ADDR,
            CommandCode::Dispense.as_u8(),
            0x00,
            ResponseStatus::Error { code: 0x0203 },
            &[],
        )
        .unwrap();

        let bytes = response.encode();
        let len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        let body = &bytes[4..4 + len - 1];
        let parsed = ResponseFrame::from_body(bytes[1], body).unwrap();

        assert_eq!(parsed.status(), ResponseStatus::Error { code: 0x0203 });
        assert_eq!(parsed.status().code(), Some(0x0203));
        assert!(parsed.payload().is_empty());
    }

    #[test]
    fn unknown_status_tag_is_malformed() {
        let body = [CommandCode::Status.as_u8(), 0x00, 0x7A];
        assert!(matches!(
            ResponseFrame::from_body(RESPONSE_ADDR, &body),
            Err(Error::MalformedResponse { .. })
        ));
    }

    #[test]
    fn truncated_fault_body_is_malformed() {
        let body = [CommandCode::Status.as_u8(), 0x00, STATUS_EMT, 0x01];
        assert!(matches!(
            ResponseFrame::from_body(RESPONSE_ADDR, &body),
            Err(Error::MalformedResponse { .. })
        ));
    }
}
