//! Framed transport actor for one cash unit handle.
//!
//! The transport owns the serial byte stream exclusively and runs the
//! acknowledge/response cycle for one command at a time:
//!
//! ```text
//! Idle ──command──> WaitForAck ──ACK──> WaitForResponse ──frame──> Idle
//!                       │ NAK / timeout                   │ BCC bad: NAK, wait again (once)
//!                       └──────────> error                └──────> error after retry
//! ```
//!
//! Callers talk to the actor through a cloneable [`TransportHandle`].
//! Each `send_command` call is queued on an mpsc channel and answered
//! over a oneshot; the actor processes exactly one request at a time, so
//! at most one command is ever outstanding on the wire and a second call
//! issued while the first is in flight is transmitted only after the
//! first resolves or times out.
//!
//! A timeout or framing failure ends only the current call: the codec
//! state and read buffer are cleared afterwards so a half-received frame
//! cannot leak into the next exchange, and the handle stays usable.
//!
//! # Examples
//!
//! ```no_run
//! use cashpoint_protocol::{CommandCode, Transport, TransportConfig};
//! use tokio::net::TcpStream;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Any AsyncRead + AsyncWrite works: a TCP-bridged serial server here,
//! // a tokio duplex pipe in tests.
//! let stream = TcpStream::connect("127.0.0.1:7100").await?;
//! let (handle, _task) = Transport::spawn(stream, TransportConfig::default());
//!
//! let status = handle
//!     .send_command(CommandCode::Status, 0x00, &[])
//!     .await?;
//! println!("status payload: {status:?}");
//! # Ok(())
//! # }
//! ```

use crate::commands::CommandCode;
use crate::frame::{Frame, ResponseFrame, ResponseStatus};
use crate::wire::{CorruptKind, Outgoing, WireCodec, WireEvent};
use bytes::Bytes;
use cashpoint_core::constants::*;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::codec::Framed;
use tracing::{debug, error, trace, warn};

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Protocol phase a timeout occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for ACK/NAK after transmitting a command.
    Ack,

    /// Waiting for the response frame after the command was acknowledged.
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Ack => write!(f, "acknowledgement"),
            Phase::Response => write!(f, "response"),
        }
    }
}

/// Which fault tag a device answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTag {
    /// `EMT`: the device failed executing the command.
    Error,

    /// `NEG`: the device refused the command.
    Negative,
}

impl fmt::Display for FaultTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultTag::Error => write!(f, "EMT"),
            FaultTag::Negative => write!(f, "NEG"),
        }
    }
}

/// Errors surfaced by [`TransportHandle::send_command`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The device answered `NAK` to the command frame. The caller decides
    /// whether to retry the whole command.
    #[error("device rejected command frame with NAK")]
    Nak,

    /// No ACK or response arrived within the phase deadline. Terminal for
    /// this call only; the handle remains usable.
    #[error("timeout after {elapsed_ms}ms waiting for {phase}")]
    Timeout { phase: Phase, elapsed_ms: u64 },

    /// The response failed BCC verification even after retransmission.
    #[error("checksum failure persisted after {retries} retransmission(s)")]
    Checksum { retries: u8 },

    /// A malformed header or body that the protocol cannot recover from.
    #[error("framing error: {0}")]
    Framing(cashpoint_core::Error),

    /// The device reported a fault (`EMT`/`NEG`) with an error code.
    #[error("device reported {tag} fault, code {code:#06x}")]
    Device { tag: FaultTag, code: u16 },

    /// The transport task has shut down (stream closed or handle
    /// dropped).
    #[error("transport is closed")]
    Closed,

    /// I/O failure on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    fn timeout(phase: Phase, elapsed: Duration) -> Self {
        Self::Timeout {
            phase,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    fn from_core(err: cashpoint_core::Error) -> Self {
        match err {
            cashpoint_core::Error::Io(io) => Self::Io(io),
            other => Self::Framing(other),
        }
    }

    /// True for failures of the link itself (as opposed to a fault the
    /// device reported). Drivers stop a transaction on these.
    #[must_use]
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Checksum { .. } | Self::Framing(_) | Self::Closed | Self::Io(_)
        )
    }
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address byte stamped on outgoing command frames.
    pub address: u8,

    /// How long to wait for ACK/NAK after transmitting.
    pub ack_timeout: Duration,

    /// Default deadline for the response frame.
    pub response_timeout: Duration,

    /// Depth of the pending-command queue.
    pub queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: RESPONSE_ADDR,
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MS),
            response_timeout: Duration::from_millis(RESPONSE_TIMEOUT_MS),
            queue_depth: 8,
        }
    }
}

struct Request {
    command: CommandCode,
    parameter: u8,
    payload: Bytes,
    response_timeout: Duration,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// Cloneable handle to a running transport actor.
///
/// All clones feed the same queue; requests are served strictly in
/// arrival order, one at a time.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<Request>,
    default_response_timeout: Duration,
}

impl TransportHandle {
    /// Send a command and wait for its response payload.
    ///
    /// Resolves with the response payload stripped of the status tag and
    /// CMD/PARAM echo, or with a typed [`TransportError`]. Suspends the
    /// caller without blocking the byte stream or the timeout clock.
    pub async fn send_command(
        &self,
        command: CommandCode,
        parameter: u8,
        payload: &[u8],
    ) -> Result<Bytes> {
        self.send_command_with_deadline(command, parameter, payload, self.default_response_timeout)
            .await
    }

    /// Like [`send_command`](Self::send_command) with an explicit
    /// response deadline, for mechanically slow operations (dispense,
    /// present, retract).
    pub async fn send_command_with_deadline(
        &self,
        command: CommandCode,
        parameter: u8,
        payload: &[u8],
        response_timeout: Duration,
    ) -> Result<Bytes> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            command,
            parameter,
            payload: Bytes::copy_from_slice(payload),
            response_timeout,
            reply: reply_tx,
        };

        self.tx
            .send(request)
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }
}

/// Factory for transport actors.
pub struct Transport;

impl Transport {
    /// Spawn the transport actor over a byte stream.
    ///
    /// Returns the command handle and the actor's join handle. The actor
    /// runs until every [`TransportHandle`] clone is dropped or the
    /// stream closes.
    pub fn spawn<S>(io: S, config: TransportConfig) -> (TransportHandle, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let handle = TransportHandle {
            tx,
            default_response_timeout: config.response_timeout,
        };

        let actor = Actor {
            framed: Framed::new(io, WireCodec::new()),
            config,
        };
        let task = tokio::spawn(actor.run(rx));

        (handle, task)
    }
}

struct Actor<S> {
    framed: Framed<S, WireCodec>,
    config: TransportConfig,
}

impl<S> Actor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        debug!(address = self.config.address, "transport actor started");

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    let command = request.command;
                    let result = self.execute(&request).await;
                    if let Err(e) = &result {
                        // Make sure a partial frame from a failed exchange
                        // cannot bleed into the next command.
                        self.framed.codec_mut().reset();
                        self.framed.read_buffer_mut().clear();
                        debug!(%command, error = %e, "command failed");
                    }
                    let _ = request.reply.send(result);
                }
                event = self.framed.next() => {
                    match event {
                        Some(Ok(event)) => {
                            warn!(?event, "unsolicited bytes while idle, discarding");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "stream error while idle");
                        }
                        None => {
                            debug!("byte stream closed, stopping transport actor");
                            break;
                        }
                    }
                }
            }
        }

        debug!("transport actor stopped");
    }

    /// Run one full command exchange: transmit, await ACK, await the
    /// response frame, acknowledge it.
    async fn execute(&mut self, request: &Request) -> Result<Bytes> {
        let frame = Frame::new(
            self.config.address,
            request.command,
            request.parameter,
            &request.payload,
        )
        .map_err(TransportError::from_core)?;

        trace!(command = %request.command, payload_len = request.payload.len(), "transmitting");
        self.framed
            .send(Outgoing::Command(frame))
            .await
            .map_err(TransportError::from_core)?;

        self.wait_for_ack().await?;
        let response = self.wait_for_response(request.response_timeout).await?;

        // Echo sanity: a response for a different command means the device
        // and host disagree about what is outstanding.
        if response.command_echo() != request.command.as_u8() {
            warn!(
                expected = request.command.as_u8(),
                got = response.command_echo(),
                "response echoes a different command"
            );
            return Err(TransportError::Framing(
                cashpoint_core::Error::malformed_response("command echo mismatch"),
            ));
        }

        match response.status() {
            ResponseStatus::Positive => Ok(response.payload().clone()),
            ResponseStatus::Error { code } => Err(TransportError::Device {
                tag: FaultTag::Error,
                code,
            }),
            ResponseStatus::Negative { code } => Err(TransportError::Device {
                tag: FaultTag::Negative,
                code,
            }),
        }
    }

    async fn wait_for_ack(&mut self) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.config.ack_timeout;

        match timeout_at(deadline, self.framed.next()).await {
            Err(_) => Err(TransportError::timeout(Phase::Ack, started.elapsed())),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(Err(e))) => Err(TransportError::from_core(e)),
            Ok(Some(Ok(WireEvent::Ack))) => Ok(()),
            Ok(Some(Ok(WireEvent::Nak))) => {
                warn!("device answered NAK");
                Err(TransportError::Nak)
            }
            Ok(Some(Ok(WireEvent::Response(_)))) => Err(TransportError::Framing(
                cashpoint_core::Error::malformed_response("response frame before ACK"),
            )),
            Ok(Some(Ok(WireEvent::Corrupt(kind)))) => Err(corrupt_to_error(kind)),
        }
    }

    async fn wait_for_response(&mut self, response_timeout: Duration) -> Result<ResponseFrame> {
        let started = Instant::now();
        let deadline = started + response_timeout;
        let mut nak_retries: u8 = 0;

        loop {
            match timeout_at(deadline, self.framed.next()).await {
                Err(_) => {
                    return Err(TransportError::timeout(Phase::Response, started.elapsed()));
                }
                Ok(None) => return Err(TransportError::Closed),
                Ok(Some(Err(e))) => return Err(TransportError::from_core(e)),
                Ok(Some(Ok(WireEvent::Response(response)))) => {
                    trace!(%response, "response verified, acknowledging");
                    self.framed
                        .send(Outgoing::Control(ACK))
                        .await
                        .map_err(TransportError::from_core)?;
                    return Ok(response);
                }
                Ok(Some(Ok(WireEvent::Corrupt(CorruptKind::Checksum { expected, actual })))) => {
                    if nak_retries >= MAX_NAK_RETRIES {
                        error!(retries = nak_retries, "checksum failure persisted");
                        return Err(TransportError::Checksum {
                            retries: nak_retries,
                        });
                    }
                    nak_retries += 1;
                    warn!(
                        expected,
                        actual, "response checksum mismatch, requesting retransmission"
                    );
                    self.framed
                        .send(Outgoing::Control(NAK))
                        .await
                        .map_err(TransportError::from_core)?;
                }
                Ok(Some(Ok(WireEvent::Corrupt(CorruptKind::Framing(e))))) => {
                    return Err(TransportError::Framing(e));
                }
                Ok(Some(Ok(WireEvent::Ack | WireEvent::Nak))) => {
                    return Err(TransportError::Framing(
                        cashpoint_core::Error::malformed_response(
                            "control byte while awaiting response frame",
                        ),
                    ));
                }
            }
        }
    }
}

fn corrupt_to_error(kind: CorruptKind) -> TransportError {
    match kind {
        CorruptKind::Framing(e) => TransportError::Framing(e),
        CorruptKind::Checksum { .. } => TransportError::Checksum { retries: 0 },
    }
}
