//! Incremental wire decoder and encoder for the cash unit serial link.
//!
//! A serial read can deliver a lone control byte, half a response frame,
//! or several frames back to back. [`WireCodec`] turns that stream into
//! discrete [`WireEvent`]s through a byte-position state machine, and
//! encodes outgoing command frames and control bytes.
//!
//! # Decoder State Machine
//!
//! ```text
//! ┌─────────┐ STX  ┌─────────┐ 0x00 ┌───────┐      ┌───────┐
//! │ Control │─────>│ Address │─────>│ LenHi │─────>│ LenLo │
//! └─────────┘      └─────────┘      └───────┘      └───────┘
//!   │   │                                              │
//!   │   │ ACK / NAK                          LEN bytes │
//!   │   ▼                                              ▼
//!   │  event                              ┌──────┐   ┌──────┐
//!   │                                     │ Bcc  │<──│ Body │
//!   └── any other byte: Corrupt event     └──────┘   └──────┘
//! ```
//!
//! Every position is strict: a byte that deviates from what the protocol
//! requires at that position produces a [`WireEvent::Corrupt`] and resets
//! the machine to `Control`. The decoder never resynchronizes silently
//! mid-frame — the transport layer decides whether a corruption is
//! retryable (checksum) or terminal (framing).
//!
//! # Checksum Handling
//!
//! The running XOR is accumulated from STX onward; when the BCC byte
//! arrives it is compared against the accumulator. A mismatch surfaces as
//! [`CorruptKind::Checksum`] so the transport can answer `NAK` and await
//! retransmission instead of failing the call outright.

use crate::frame::{Frame, ResponseFrame};
use bytes::{Buf, BufMut, BytesMut};
use cashpoint_core::constants::*;
use cashpoint_core::{Error, Result};
use tokio_util::codec::{Decoder, Encoder};

/// One decoded unit from the device byte stream.
#[derive(Debug)]
pub enum WireEvent {
    /// Positive acknowledgement control byte.
    Ack,

    /// Negative acknowledgement control byte.
    Nak,

    /// A complete, checksum-verified response frame.
    Response(ResponseFrame),

    /// A corrupted or protocol-violating byte sequence.
    Corrupt(CorruptKind),
}

/// How a received sequence was corrupt, split by recovery strategy.
#[derive(Debug)]
pub enum CorruptKind {
    /// Header/terminator/body violation; terminal for the pending call.
    Framing(Error),

    /// BCC mismatch on an otherwise well-formed frame; recoverable with a
    /// `NAK`/retransmit cycle.
    Checksum { expected: u8, actual: u8 },
}

/// Bytes the transport writes to the device.
#[derive(Debug)]
pub enum Outgoing {
    /// A framed command.
    Command(Frame),

    /// A bare control byte (`ACK` or `NAK`).
    Control(u8),
}

#[derive(Debug)]
enum DecoderState {
    /// Expecting a control byte or the STX of a response frame.
    Control,

    /// Expecting the address byte (always [`RESPONSE_ADDR`]).
    Address,

    /// Expecting the high byte of the length field.
    LenHi,

    /// Expecting the low byte of the length field.
    LenLo { hi: u8 },

    /// Accumulating `len` body bytes (CMD through ETX).
    Body { len: usize, body: BytesMut },

    /// Expecting the checksum byte.
    Bcc { body: BytesMut },
}

/// Tokio codec for the cash unit wire protocol.
///
/// Decoder item is [`WireEvent`]; encoder input is [`Outgoing`]. State
/// carries across `decode` calls so partial frames are handled naturally.
#[derive(Debug)]
pub struct WireCodec {
    state: DecoderState,

    /// Running XOR from STX through the last byte consumed.
    acc: u8,
}

impl WireCodec {
    /// Create a codec in the initial state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecoderState::Control,
            acc: 0,
        }
    }

    /// Drop any partially decoded frame and return to the initial state.
    ///
    /// The transport calls this after a failed exchange so a half-frame
    /// from a timed-out call cannot leak into the next one.
    pub fn reset(&mut self) {
        self.state = DecoderState::Control;
        self.acc = 0;
    }

    fn corrupt(&mut self, kind: CorruptKind) -> WireEvent {
        self.reset();
        WireEvent::Corrupt(kind)
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = WireEvent;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireEvent>> {
        while src.has_remaining() {
            let byte = src.get_u8();

            match &mut self.state {
                DecoderState::Control => match byte {
                    ACK => return Ok(Some(WireEvent::Ack)),
                    NAK => return Ok(Some(WireEvent::Nak)),
                    STX => {
                        self.acc = STX;
                        self.state = DecoderState::Address;
                    }
                    other => {
                        return Ok(Some(self.corrupt(CorruptKind::Framing(
                            Error::UnexpectedByte {
                                position: "STX",
                                expected: STX,
                                found: other,
                            },
                        ))));
                    }
                },

                DecoderState::Address => {
                    self.acc ^= byte;
                    if byte == RESPONSE_ADDR {
                        self.state = DecoderState::LenHi;
                    } else {
                        return Ok(Some(self.corrupt(CorruptKind::Framing(
                            Error::UnexpectedByte {
                                position: "ADDR",
                                expected: RESPONSE_ADDR,
                                found: byte,
                            },
                        ))));
                    }
                }

                DecoderState::LenHi => {
                    self.acc ^= byte;
                    self.state = DecoderState::LenLo { hi: byte };
                }

                DecoderState::LenLo { hi } => {
                    let len = usize::from(u16::from_be_bytes([*hi, byte]));
                    self.acc ^= byte;
                    if (MIN_LEN_FIELD..=MAX_LEN_FIELD).contains(&len) {
                        self.state = DecoderState::Body {
                            len,
                            body: BytesMut::with_capacity(len),
                        };
                    } else {
                        return Ok(Some(self.corrupt(CorruptKind::Framing(
                            Error::InvalidLength {
                                len,
                                min: MIN_LEN_FIELD,
                                max: MAX_LEN_FIELD,
                            },
                        ))));
                    }
                }

                DecoderState::Body { len, body } => {
                    self.acc ^= byte;
                    body.put_u8(byte);
                    if body.len() == *len {
                        if byte != ETX {
                            return Ok(Some(self.corrupt(CorruptKind::Framing(
                                Error::MissingEtx { found: byte },
                            ))));
                        }
                        let body = std::mem::take(body);
                        self.state = DecoderState::Bcc { body };
                    }
                }

                DecoderState::Bcc { body } => {
                    let expected = self.acc;
                    if byte != expected {
                        return Ok(Some(self.corrupt(CorruptKind::Checksum {
                            expected,
                            actual: byte,
                        })));
                    }
                    // Strip the ETX terminator; from_body wants CMD..data.
                    let body = std::mem::take(body);
                    let event = match ResponseFrame::from_body(
                        RESPONSE_ADDR,
                        &body[..body.len() - 1],
                    ) {
                        Ok(response) => {
                            self.reset();
                            WireEvent::Response(response)
                        }
                        Err(e) => self.corrupt(CorruptKind::Framing(e)),
                    };
                    return Ok(Some(event));
                }
            }
        }

        Ok(None)
    }
}

impl Encoder<Outgoing> for WireCodec {
    type Error = Error;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<()> {
        match item {
            Outgoing::Command(frame) => dst.extend_from_slice(&frame.encode()),
            Outgoing::Control(byte) => dst.put_u8(byte),
        }
        Ok(())
    }
}
