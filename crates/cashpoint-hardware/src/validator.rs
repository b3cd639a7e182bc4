//! Bill validator state machine and driver.
//!
//! The state machine is an explicit tagged enum with a pure transition
//! function: `(state, input) -> (state, emitted domain event)`. Illegal
//! transitions are logged and ignored, never panicked on — a confused
//! device must not crash the kiosk, and a misattributed accept event is
//! worse than a dropped one. The driver wraps the machine with the
//! framed transport, translating status responses into inputs and
//! commands into the bring-up/enable/stack choreography.
//!
//! # States
//!
//! Bring-up runs `Start → Connected → Denominations → Initialize →
//! Disable`, then normal operation cycles `Disable ⇄ Enable → Accepting
//! → Escrow → {Stacking → Stacked → Enable | Returning → Disable}`.
//! Fault states (`Rejecting`, `StackerOpen`, `StackerFull`,
//! `AcceptorJam`, `Failure`, `BadFrame`, `Paused`) are reachable from
//! any post-connect state via device-reported faults and recovered by
//! explicit disable/reset/restart, not exceptions.
//!
//! # Deferred Disable
//!
//! A `disable()` issued while a note is already in flight would abort
//! the read mid-way; the driver instead raises a pending-disable flag
//! and applies it when the device naturally returns to `Enable`. The
//! in-flight note still produces its `bill_read` (and later
//! `bill_accepted`/`bill_rejected`) events.

use crate::error::{DeviceError, Result};
use crate::events::{DomainEvent, RejectReason, ValidatorInput};
use crate::traits::NoteAcceptor;
use bytes::Bytes;
use cashpoint_protocol::{CommandCode, TransportError, TransportHandle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Maximum number of state transitions kept for diagnostics.
const MAX_HISTORY_SIZE: usize = 64;

/// Status codes reported in the first byte of a `Status` response.
pub mod status_code {
    pub const DISABLED: u8 = 0x12;
    pub const ENABLED: u8 = 0x13;
    pub const ACCEPTING: u8 = 0x14;
    pub const ESCROW: u8 = 0x15;
    pub const STACKING: u8 = 0x16;
    pub const STACKED: u8 = 0x17;
    pub const RETURNING: u8 = 0x18;
    pub const RETURNED: u8 = 0x19;
    pub const REJECTING: u8 = 0x1A;
    pub const STACKER_OPEN: u8 = 0x20;
    pub const STACKER_FULL: u8 = 0x21;
    pub const JAM: u8 = 0x22;
    pub const FAULT: u8 = 0x23;
    pub const PAUSED: u8 = 0x24;
}

/// All states a bill validator can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorState {
    /// Not yet talked to; also the state after a restart.
    Start,

    /// The transport answered; device identity unknown beyond that.
    Connected,

    /// The denomination table is loaded.
    Denominations,

    /// The mechanism completed its reset.
    Initialize,

    /// Idle, not accepting notes.
    Disable,

    /// Idle, accepting notes.
    Enable,

    /// A note is entering the acceptor.
    Accepting,

    /// A recognized note is held in escrow, returnable.
    Escrow,

    /// The escrowed note travels to the stacker.
    Stacking,

    /// The note is committed to the stacker.
    Stacked,

    /// The escrowed note travels back to the customer.
    Returning,

    /// A note is being rejected.
    Rejecting,

    /// Stacker door open.
    StackerOpen,

    /// Stacker full.
    StackerFull,

    /// Note jammed in the acceptor path.
    AcceptorJam,

    /// Hard device fault; requires restart.
    Failure,

    /// Persistent framing trouble on the link; requires restart.
    BadFrame,

    /// Device paused itself.
    Paused,
}

impl fmt::Display for ValidatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "Start",
            Self::Connected => "Connected",
            Self::Denominations => "Denominations",
            Self::Initialize => "Initialize",
            Self::Disable => "Disable",
            Self::Enable => "Enable",
            Self::Accepting => "Accepting",
            Self::Escrow => "Escrow",
            Self::Stacking => "Stacking",
            Self::Stacked => "Stacked",
            Self::Returning => "Returning",
            Self::Rejecting => "Rejecting",
            Self::StackerOpen => "StackerOpen",
            Self::StackerFull => "StackerFull",
            Self::AcceptorJam => "AcceptorJam",
            Self::Failure => "Failure",
            Self::BadFrame => "BadFrame",
            Self::Paused => "Paused",
        };
        write!(f, "{name}")
    }
}

/// Result of applying one input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The input was legal; the machine moved (possibly to the same
    /// state) and emitted at most one domain event.
    Transitioned {
        from: ValidatorState,
        event: Option<DomainEvent>,
    },

    /// The input was illegal from the current state and was ignored.
    Ignored,
}

impl ApplyOutcome {
    /// The emitted event, if the input transitioned and produced one.
    #[must_use]
    pub fn event(&self) -> Option<&DomainEvent> {
        match self {
            Self::Transitioned { event, .. } => event.as_ref(),
            Self::Ignored => None,
        }
    }
}

/// What a disable request amounts to in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableAction {
    /// The device is idle-enabled; disable can be sent immediately.
    SendNow,

    /// A note is in flight; the disable is deferred until the device
    /// returns to `Enable`.
    Deferred,

    /// Already disabled; nothing to do.
    AlreadyDisabled,

    /// The device is faulted or not brought up; disable is meaningless.
    Unavailable,
}

/// One recorded transition, for diagnostics.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ValidatorState,
    pub to: ValidatorState,
    pub input: &'static str,
    pub at: Instant,
}

/// The result of a legal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Transition {
    next: ValidatorState,
    event: Option<DomainEvent>,
}

/// Pure transition function: `None` means the move is illegal.
///
/// Same-state notifications (a poll observing the state it already
/// knows) are legal no-ops that emit nothing, so events fire exactly
/// once per entry into a state.
fn transition(state: ValidatorState, input: &ValidatorInput) -> Option<Transition> {
    use ValidatorInput as I;
    use ValidatorState as S;

    let to = |next: ValidatorState, event: Option<DomainEvent>| Some(Transition { next, event });

    match (state, input) {
        // Bring-up sequence.
        (S::Start, I::LinkEstablished) => to(S::Connected, None),
        (S::Connected, I::TableLoaded) => to(S::Denominations, None),
        (S::Denominations, I::ResetCompleted) => to(S::Initialize, None),
        (S::Initialize, I::Disabled) => to(S::Disable, Some(DomainEvent::Standby)),

        // Idle cycle.
        (S::Disable, I::Enabled) => to(S::Enable, Some(DomainEvent::Ready)),
        (S::Enable, I::Disabled) => to(S::Disable, Some(DomainEvent::Standby)),

        // Note acceptance.
        (S::Enable, I::Accepting) => to(S::Accepting, None),
        (S::Accepting, I::Escrow { denomination }) => to(
            S::Escrow,
            Some(DomainEvent::BillRead {
                denomination: *denomination,
            }),
        ),
        (S::Accepting | S::Escrow, I::Rejecting { code }) => to(
            S::Rejecting,
            Some(DomainEvent::BillRejected {
                reason: RejectReason::from_code(*code),
                code: *code,
            }),
        ),
        (S::Escrow, I::Stacking) => to(S::Stacking, None),
        (S::Escrow, I::Returning) => to(S::Returning, None),
        (S::Stacking, I::Stacked { denomination }) => to(
            S::Stacked,
            Some(DomainEvent::BillAccepted {
                denomination: *denomination,
            }),
        ),
        (S::Stacked, I::Enabled) => to(S::Enable, Some(DomainEvent::Ready)),
        (S::Returning, I::Returned) => to(S::Disable, Some(DomainEvent::Standby)),
        (S::Rejecting, I::Enabled) => to(S::Enable, Some(DomainEvent::Ready)),
        (S::Rejecting, I::Disabled) => to(S::Disable, Some(DomainEvent::Standby)),

        // Steady-state polls: legal, silent.
        (S::Enable, I::Enabled)
        | (S::Disable, I::Disabled)
        | (S::Accepting, I::Accepting)
        | (S::Escrow, I::Escrow { .. })
        | (S::Stacking, I::Stacking)
        | (S::Stacked, I::Stacked { .. })
        | (S::Returning, I::Returning)
        | (S::Rejecting, I::Rejecting { .. })
        | (S::StackerOpen, I::StackerOpen)
        | (S::StackerFull, I::StackerFull)
        | (S::AcceptorJam, I::Jam { .. })
        | (S::Failure, I::Fault { .. })
        | (S::Paused, I::Paused) => to(state, None),

        // Fault recovery.
        (S::StackerOpen | S::StackerFull | S::Paused, I::Disabled) => {
            to(S::Disable, Some(DomainEvent::Standby))
        }
        (S::Paused, I::Enabled) => to(S::Enable, Some(DomainEvent::Ready)),
        (S::AcceptorJam, I::ResetCompleted) => to(S::Initialize, None),
        (S::Failure | S::BadFrame, I::Restarted) => to(S::Start, None),

        // Device-reported faults, reachable from any post-connect state.
        (s, I::StackerOpen) if s != S::Start => to(S::StackerOpen, Some(DomainEvent::StackerOpen)),
        (s, I::StackerFull) if s != S::Start => to(S::StackerFull, Some(DomainEvent::StackerFull)),
        (s, I::Jam { code }) if s != S::Start => {
            to(S::AcceptorJam, Some(DomainEvent::Jam { code: *code }))
        }
        (s, I::Fault { .. }) if s != S::Start => to(S::Failure, None),
        (s, I::FrameTrouble) if s != S::Start => to(S::BadFrame, None),
        (s, I::Paused) if s != S::Start => to(S::Paused, None),

        _ => None,
    }
}

/// Explicit validator state machine.
///
/// Owns the current state, the pending-disable flag, and a bounded
/// transition history. No transport, no I/O — fully unit-testable.
#[derive(Debug)]
pub struct ValidatorStateMachine {
    state: ValidatorState,
    pending_disable: bool,
    history: VecDeque<StateTransition>,
}

impl ValidatorStateMachine {
    /// Create a machine in `Start`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ValidatorState::Start,
            pending_disable: false,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current_state(&self) -> ValidatorState {
        self.state
    }

    /// Whether a disable is pending application.
    #[must_use]
    pub fn pending_disable(&self) -> bool {
        self.pending_disable
    }

    /// Recent transitions, oldest first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// Apply one input.
    ///
    /// Legal inputs move the machine and emit at most one domain event;
    /// illegal inputs are logged at `warn` and ignored.
    pub fn apply(&mut self, input: &ValidatorInput) -> ApplyOutcome {
        match transition(self.state, input) {
            Some(Transition { next, event }) => {
                let from = self.state;
                if next != from {
                    self.record(from, next, input.name());
                    debug!(%from, to = %next, input = input.name(), "validator transition");
                }
                self.state = next;
                ApplyOutcome::Transitioned { from, event }
            }
            None => {
                warn!(
                    state = %self.state,
                    input = input.name(),
                    "illegal validator transition ignored"
                );
                ApplyOutcome::Ignored
            }
        }
    }

    /// Classify a disable request against the current state and set the
    /// pending flag when the device is mid-note.
    pub fn request_disable(&mut self) -> DisableAction {
        match self.state {
            ValidatorState::Enable => DisableAction::SendNow,
            ValidatorState::Disable => DisableAction::AlreadyDisabled,
            ValidatorState::Accepting
            | ValidatorState::Escrow
            | ValidatorState::Stacking
            | ValidatorState::Stacked
            | ValidatorState::Returning
            | ValidatorState::Rejecting => {
                self.pending_disable = true;
                DisableAction::Deferred
            }
            _ => DisableAction::Unavailable,
        }
    }

    /// Consume the pending-disable flag once the device is back in
    /// `Enable`. Returns `true` when the driver should now send the
    /// disable command.
    pub fn take_pending_disable(&mut self) -> bool {
        if self.pending_disable && self.state == ValidatorState::Enable {
            self.pending_disable = false;
            true
        } else {
            false
        }
    }

    fn record(&mut self, from: ValidatorState, to: ValidatorState, input: &'static str) {
        if self.history.len() == MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from,
            to,
            input,
            at: Instant::now(),
        });
    }
}

impl Default for ValidatorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Notes fed, stacked, and rejected per denomination over a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceTally {
    fed: BTreeMap<u64, u32>,
    stacked: BTreeMap<u64, u32>,
    rejected: BTreeMap<u64, u32>,

    /// Rejects for notes whose denomination was never read.
    rejected_unattributed: u32,
}

impl AcceptanceTally {
    fn bump(map: &mut BTreeMap<u64, u32>, denomination: u64) {
        *map.entry(denomination).or_insert(0) += 1;
    }

    /// Notes read into escrow, per denomination.
    #[must_use]
    pub fn fed(&self) -> &BTreeMap<u64, u32> {
        &self.fed
    }

    /// Notes committed to the stacker, per denomination.
    #[must_use]
    pub fn stacked(&self) -> &BTreeMap<u64, u32> {
        &self.stacked
    }

    /// Rejected notes, per denomination where known.
    #[must_use]
    pub fn rejected(&self) -> &BTreeMap<u64, u32> {
        &self.rejected
    }

    /// Rejects that never got a denomination read.
    #[must_use]
    pub fn rejected_unattributed(&self) -> u32 {
        self.rejected_unattributed
    }

    /// Total value committed to the stacker.
    #[must_use]
    pub fn stacked_value(&self) -> u64 {
        self.stacked
            .iter()
            .map(|(face, count)| face * u64::from(*count))
            .sum()
    }
}

/// Bill validator driver over a framed transport.
///
/// Owns the state machine, the denomination table, and the session
/// tally. Domain events are forwarded to the mpsc channel given at
/// construction.
pub struct Validator {
    transport: TransportHandle,
    machine: ValidatorStateMachine,

    /// Channel-to-face-value table from `QueryDenominations`.
    table: Vec<(u8, u64)>,

    events: mpsc::Sender<DomainEvent>,
    tally: AcceptanceTally,

    /// Denomination of the note currently in flight, for attributing a
    /// later reject.
    last_read: Option<u64>,
}

impl Validator {
    /// Create a driver over an open transport. No hardware command is
    /// sent until [`connect`](Self::connect).
    #[must_use]
    pub fn new(transport: TransportHandle, events: mpsc::Sender<DomainEvent>) -> Self {
        Self {
            transport,
            machine: ValidatorStateMachine::new(),
            table: Vec::new(),
            events,
            tally: AcceptanceTally::default(),
            last_read: None,
        }
    }

    /// Current machine state.
    #[must_use]
    pub fn state(&self) -> ValidatorState {
        self.machine.current_state()
    }

    /// Session acceptance tally.
    #[must_use]
    pub fn tally(&self) -> &AcceptanceTally {
        &self.tally
    }

    /// The denomination table read at connect.
    #[must_use]
    pub fn denomination_table(&self) -> &[(u8, u64)] {
        &self.table
    }

    /// Bring the device up: establish the link, load the denomination
    /// table, reset the mechanism, and leave the device disabled.
    pub async fn connect(&mut self) -> Result<()> {
        self.command(CommandCode::Status, 0x00, &[]).await?;
        self.apply(&ValidatorInput::LinkEstablished).await;
        info!("validator link established");

        let table = self
            .command(CommandCode::QueryDenominations, 0x00, &[])
            .await?;
        self.table = parse_denomination_table(&table)?;
        self.apply(&ValidatorInput::TableLoaded).await;
        debug!(channels = self.table.len(), "denomination table loaded");

        self.command(CommandCode::Reset, 0x00, &[]).await?;
        self.apply(&ValidatorInput::ResetCompleted).await;

        self.command(CommandCode::Disable, 0x00, &[]).await?;
        self.apply(&ValidatorInput::Disabled).await;
        Ok(())
    }

    /// Poll the device status once and feed the result to the machine.
    ///
    /// Returns the domain event the transition emitted, if any. When a
    /// deferred disable becomes applicable it is sent before returning.
    pub async fn poll_once(&mut self) -> Result<Option<DomainEvent>> {
        let input = self.read_status().await?;
        let event = self.apply(&input).await;

        if self.machine.take_pending_disable() {
            debug!("applying deferred disable");
            self.command(CommandCode::Disable, 0x00, &[]).await?;
            self.apply(&ValidatorInput::Disabled).await;
        }

        Ok(event)
    }

    /// Restart after `Failure`/`BadFrame`: back to `Start`, then run the
    /// bring-up sequence again.
    pub async fn restart(&mut self) -> Result<()> {
        self.apply(&ValidatorInput::Restarted).await;
        self.last_read = None;
        self.connect().await
    }

    async fn read_status(&mut self) -> Result<ValidatorInput> {
        let payload = match self.command(CommandCode::Status, 0x00, &[]).await {
            Ok(payload) => payload,
            Err(DeviceError::Transport(e)) => {
                // Persistent framing/checksum trouble is a machine input,
                // not an exception path.
                if matches!(
                    e,
                    TransportError::Framing(_) | TransportError::Checksum { .. }
                ) {
                    self.apply(&ValidatorInput::FrameTrouble).await;
                } else if let TransportError::Device { code, .. } = e {
                    self.apply(&ValidatorInput::Fault { code }).await;
                }
                return Err(e.into());
            }
            Err(other) => return Err(other),
        };
        self.decode_status(&payload)
    }

    fn decode_status(&self, payload: &[u8]) -> Result<ValidatorInput> {
        let code = *payload
            .first()
            .ok_or_else(|| DeviceError::protocol("empty status payload"))?;

        let channel_face = |payload: &[u8]| -> Result<u64> {
            let channel = *payload
                .get(1)
                .ok_or_else(|| DeviceError::protocol("status missing channel byte"))?;
            self.table
                .iter()
                .find(|(ch, _)| *ch == channel)
                .map(|(_, face)| *face)
                .ok_or_else(|| DeviceError::protocol(format!("unknown channel {channel}")))
        };
        let fault_code = |payload: &[u8]| -> Result<u16> {
            let bytes: [u8; 2] = payload
                .get(1..3)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| DeviceError::protocol("status missing fault code"))?;
            Ok(u16::from_be_bytes(bytes))
        };

        Ok(match code {
            status_code::DISABLED => ValidatorInput::Disabled,
            status_code::ENABLED => ValidatorInput::Enabled,
            status_code::ACCEPTING => ValidatorInput::Accepting,
            status_code::ESCROW => ValidatorInput::Escrow {
                denomination: channel_face(payload)?,
            },
            status_code::STACKING => ValidatorInput::Stacking,
            status_code::STACKED => ValidatorInput::Stacked {
                denomination: channel_face(payload)?,
            },
            status_code::RETURNING => ValidatorInput::Returning,
            status_code::RETURNED => ValidatorInput::Returned,
            status_code::REJECTING => ValidatorInput::Rejecting {
                code: fault_code(payload)?,
            },
            status_code::STACKER_OPEN => ValidatorInput::StackerOpen,
            status_code::STACKER_FULL => ValidatorInput::StackerFull,
            status_code::JAM => ValidatorInput::Jam {
                code: fault_code(payload)?,
            },
            status_code::FAULT => ValidatorInput::Fault {
                code: fault_code(payload)?,
            },
            status_code::PAUSED => ValidatorInput::Paused,
            other => {
                return Err(DeviceError::protocol(format!(
                    "unknown status code {other:#04x}"
                )));
            }
        })
    }

    /// Apply an input, update the tally, and forward any event.
    async fn apply(&mut self, input: &ValidatorInput) -> Option<DomainEvent> {
        let outcome = self.machine.apply(input);
        let event = outcome.event().cloned();
        if let Some(event) = &event {
            self.record_event(event);
            let _ = self.events.send(event.clone()).await;
        }
        event
    }

    fn record_event(&mut self, event: &DomainEvent) {
        match event {
            DomainEvent::BillRead { denomination } => {
                AcceptanceTally::bump(&mut self.tally.fed, *denomination);
                self.last_read = Some(*denomination);
            }
            DomainEvent::BillAccepted { denomination } => {
                AcceptanceTally::bump(&mut self.tally.stacked, *denomination);
                self.last_read = None;
            }
            DomainEvent::BillRejected { .. } => {
                match self.last_read.take() {
                    Some(denomination) => {
                        AcceptanceTally::bump(&mut self.tally.rejected, denomination);
                    }
                    None => self.tally.rejected_unattributed += 1,
                }
            }
            _ => {}
        }
    }

    /// Send a command with the reference single retry on NAK.
    async fn command(&self, command: CommandCode, parameter: u8, payload: &[u8]) -> Result<Bytes> {
        match self.transport.send_command(command, parameter, payload).await {
            Err(TransportError::Nak) => {
                warn!(%command, "NAK on command, retrying once");
                Ok(self.transport.send_command(command, parameter, payload).await?)
            }
            other => Ok(other?),
        }
    }
}

impl NoteAcceptor for Validator {
    async fn enable(&mut self) -> Result<()> {
        self.command(CommandCode::Enable, 0x00, &[]).await?;
        self.apply(&ValidatorInput::Enabled).await;
        Ok(())
    }

    async fn disable(&mut self) -> Result<DisableAction> {
        // The device may already be reading a note the host has not seen
        // yet; look before committing so an in-progress read is never
        // aborted.
        if self.machine.current_state() == ValidatorState::Enable {
            let input = self.read_status().await?;
            if input != ValidatorInput::Enabled {
                self.apply(&input).await;
            }
        }

        let action = self.machine.request_disable();
        match action {
            DisableAction::SendNow => {
                self.command(CommandCode::Disable, 0x00, &[]).await?;
                self.apply(&ValidatorInput::Disabled).await;
            }
            DisableAction::Deferred => {
                debug!(state = %self.machine.current_state(), "disable deferred, note in flight");
            }
            DisableAction::AlreadyDisabled | DisableAction::Unavailable => {}
        }
        Ok(action)
    }

    async fn stack(&mut self) -> Result<()> {
        self.command(CommandCode::Stack, 0x00, &[]).await?;
        self.apply(&ValidatorInput::Stacking).await;
        Ok(())
    }

    async fn return_note(&mut self) -> Result<()> {
        self.command(CommandCode::Return, 0x00, &[]).await?;
        self.apply(&ValidatorInput::Returning).await;
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<DomainEvent>> {
        self.poll_once().await
    }
}

/// Parse the `QueryDenominations` payload: repeating
/// `[channel, face_value(u32 BE)]` records.
fn parse_denomination_table(payload: &[u8]) -> Result<Vec<(u8, u64)>> {
    if payload.is_empty() || payload.len() % 5 != 0 {
        return Err(DeviceError::protocol(format!(
            "denomination table has invalid length {}",
            payload.len()
        )));
    }
    let mut table = Vec::with_capacity(payload.len() / 5);
    for record in payload.chunks_exact(5) {
        let channel = record[0];
        let face = u32::from_be_bytes([record[1], record[2], record[3], record[4]]);
        if face == 0 {
            return Err(DeviceError::protocol(format!(
                "channel {channel} reports zero face value"
            )));
        }
        table.push((channel, u64::from(face)));
    }
    Ok(table)
}
