//! Byte-exact serial protocol for cash units.
//!
//! This crate owns everything between a raw byte stream and a validated
//! request/response exchange:
//!
//! - [`frame`]: immutable command and response frames, binary encoding
//!   with length prefix and XOR checksum (BCC).
//! - [`wire`]: an incremental decoder turning stream bytes into wire
//!   events (`ACK`, `NAK`, complete response frames, corruption reports),
//!   plus the matching encoder, both pluggable into Tokio's `Framed`.
//! - [`transport`]: the framed transport actor implementing the
//!   acknowledge/response cycle with per-phase timeouts, one checksum
//!   retransmission, and at-most-one-outstanding-request per handle.
//!
//! No business knowledge lives here: the crate does not know what a
//! denomination or a cassette is, only bytes, frames, and deadlines.

pub mod commands;
pub mod frame;
pub mod transport;
pub mod wire;

pub use commands::CommandCode;
pub use frame::{Frame, ResponseFrame, ResponseStatus};
pub use transport::{Transport, TransportConfig, TransportError, TransportHandle};
pub use wire::{CorruptKind, Outgoing, WireCodec, WireEvent};
