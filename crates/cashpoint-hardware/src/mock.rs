//! Mock cash unit for development and testing.
//!
//! `MockCashUnit` sits on the device side of an in-memory duplex pipe
//! and speaks the real wire protocol: it parses command frames, answers
//! with `ACK`/`NAK` and framed responses, and honours retransmission
//! requests. Tests drive the transport, the drivers, and whole sessions
//! against it without hardware.
//!
//! Behavior is scripted through a shared [`MockHandle`]: queue validator
//! status notifications, inject a NAK or a corrupted checksum, make the
//! licence check fail, or configure per-cassette rejects.
//!
//! # Examples
//!
//! ```
//! use cashpoint_hardware::mock::{MockBehavior, MockCashUnit};
//! use cashpoint_protocol::{CommandCode, Transport, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> cashpoint_hardware::Result<()> {
//!     let (io, handle, _task) = MockCashUnit::spawn(MockBehavior::default());
//!     let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
//!
//!     transport.send_command(CommandCode::Status, 0x00, &[]).await?;
//!     assert_eq!(handle.commands(), vec![CommandCode::Status]);
//!     Ok(())
//! }
//! ```

use crate::dispenser::DeviceClass;
use crate::validator::status_code;
use cashpoint_core::constants::{ACK, NAK, RESPONSE_ADDR};
use cashpoint_protocol::{CommandCode, Frame, ResponseFrame, ResponseStatus};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Scripted behavior of the mock unit.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Which device class the unit emulates.
    pub class: DeviceClass,

    /// Whether `VerifyLicense` succeeds.
    pub license_valid: bool,

    /// Dispenser status flag byte (residual cash bits).
    pub status_flags: u8,

    /// Answer the next command frame with `NAK` instead of `ACK`.
    pub nak_next_command: bool,

    /// Corrupt the checksum of the next response once; the good copy is
    /// sent on retransmission.
    pub corrupt_next_response: bool,

    /// Swallow commands without answering (timeout scenarios).
    pub silent: bool,

    /// Go silent after this many `Dispense` commands have been served,
    /// simulating a link dying mid-transaction.
    pub silent_after_dispenses: Option<u8>,

    /// Notes to report as mechanically rejected, per cassette index.
    pub rejects_per_cassette: BTreeMap<u8, u8>,

    /// Fail `Dispense` outright with this `EMT` code.
    pub fail_dispense_code: Option<u16>,

    /// Whether the customer takes presented cash (recycler).
    pub present_taken: bool,

    /// Channel-to-face table answered to `QueryDenominations`.
    pub denomination_table: Vec<(u8, u64)>,

    /// Queued validator status payloads, popped per `Status` command.
    pub status_queue: VecDeque<Vec<u8>>,

    /// Validator status payload when the queue is empty.
    pub idle_status: Vec<u8>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            class: DeviceClass::Dispenser,
            license_valid: true,
            status_flags: 0,
            nak_next_command: false,
            corrupt_next_response: false,
            silent: false,
            silent_after_dispenses: None,
            rejects_per_cassette: BTreeMap::new(),
            fail_dispense_code: None,
            present_taken: true,
            denomination_table: vec![(1, 2000), (2, 5000), (3, 10_000)],
            status_queue: VecDeque::new(),
            idle_status: vec![status_code::DISABLED],
        }
    }
}

impl MockBehavior {
    /// Defaults for a validator-class unit.
    #[must_use]
    pub fn validator() -> Self {
        Self {
            class: DeviceClass::Recycler,
            ..Self::default()
        }
    }
}

/// Shared control handle for a running mock unit.
#[derive(Debug, Clone)]
pub struct MockHandle {
    behavior: Arc<Mutex<MockBehavior>>,
    commands: Arc<Mutex<Vec<CommandCode>>>,
}

impl MockHandle {
    /// Commands received so far, in arrival order.
    #[must_use]
    pub fn commands(&self) -> Vec<CommandCode> {
        self.commands.lock().unwrap().clone()
    }

    /// Mutate the scripted behavior.
    pub fn configure<F: FnOnce(&mut MockBehavior)>(&self, f: F) {
        f(&mut self.behavior.lock().unwrap());
    }

    /// Queue a raw validator status payload.
    pub fn queue_status(&self, payload: Vec<u8>) {
        self.behavior.lock().unwrap().status_queue.push_back(payload);
    }

    /// Queue an `enabled` status.
    pub fn queue_enabled(&self) {
        self.queue_status(vec![status_code::ENABLED]);
    }

    /// Queue an `accepting` status.
    pub fn queue_accepting(&self) {
        self.queue_status(vec![status_code::ACCEPTING]);
    }

    /// Queue an escrow status for a channel.
    pub fn queue_escrow(&self, channel: u8) {
        self.queue_status(vec![status_code::ESCROW, channel]);
    }

    /// Queue a `stacking` status.
    pub fn queue_stacking(&self) {
        self.queue_status(vec![status_code::STACKING]);
    }

    /// Queue a stacked status for a channel.
    pub fn queue_stacked(&self, channel: u8) {
        self.queue_status(vec![status_code::STACKED, channel]);
    }

    /// Queue a rejecting status with a device code.
    pub fn queue_rejecting(&self, code: u16) {
        let [hi, lo] = code.to_be_bytes();
        self.queue_status(vec![status_code::REJECTING, hi, lo]);
    }
}

/// Factory for mock cash units.
pub struct MockCashUnit;

impl MockCashUnit {
    /// Spawn a mock unit.
    ///
    /// Returns the host end of the pipe (hand it to
    /// `Transport::spawn`), the control handle, and the unit task.
    pub fn spawn(behavior: MockBehavior) -> (DuplexStream, MockHandle, JoinHandle<()>) {
        let (host, device) = tokio::io::duplex(4096);
        let handle = MockHandle {
            behavior: Arc::new(Mutex::new(behavior)),
            commands: Arc::new(Mutex::new(Vec::new())),
        };

        let unit = Unit {
            stream: device,
            behavior: Arc::clone(&handle.behavior),
            commands: Arc::clone(&handle.commands),
        };
        let task = tokio::spawn(unit.run());

        (host, handle, task)
    }
}

struct Unit {
    stream: DuplexStream,
    behavior: Arc<Mutex<MockBehavior>>,
    commands: Arc<Mutex<Vec<CommandCode>>>,
}

impl Unit {
    async fn run(mut self) {
        debug!("mock cash unit started");
        while let Ok(frame) = self.read_command().await {
            trace!(command = %frame.command(), "mock received command");
            self.commands.lock().unwrap().push(frame.command());

            let (silent, nak) = {
                let mut behavior = self.behavior.lock().unwrap();
                if frame.command() == CommandCode::Dispense {
                    match behavior.silent_after_dispenses {
                        Some(0) => behavior.silent = true,
                        Some(remaining) => {
                            behavior.silent_after_dispenses = Some(remaining - 1);
                        }
                        None => {}
                    }
                }
                let silent = behavior.silent;
                let nak = behavior.nak_next_command;
                behavior.nak_next_command = false;
                (silent, nak)
            };

            if silent {
                continue;
            }
            if nak {
                if self.stream.write_all(&[NAK]).await.is_err() {
                    break;
                }
                continue;
            }
            if self.stream.write_all(&[ACK]).await.is_err() {
                break;
            }

            let response = self.respond(&frame);
            if self.transmit(response).await.is_err() {
                break;
            }
        }
        debug!("mock cash unit stopped");
    }

    /// Build the response for one command per the scripted behavior.
    fn respond(&self, frame: &Frame) -> ResponseFrame {
        let mut behavior = self.behavior.lock().unwrap();
        let echo = frame.command().as_u8();
        let param = frame.parameter();

        let positive = |payload: &[u8]| {
            ResponseFrame::new(RESPONSE_ADDR, echo, param, ResponseStatus::Positive, payload)
                .expect("mock response payload within bounds")
        };

        match frame.command() {
            CommandCode::Status => match behavior.class {
                DeviceClass::Dispenser => positive(&[behavior.status_flags]),
                DeviceClass::Recycler => {
                    let payload = behavior
                        .status_queue
                        .pop_front()
                        .unwrap_or_else(|| behavior.idle_status.clone());
                    positive(&payload)
                }
            },
            CommandCode::QueryDenominations => {
                let mut payload = Vec::with_capacity(behavior.denomination_table.len() * 5);
                for (channel, face) in &behavior.denomination_table {
                    payload.push(*channel);
                    payload.extend_from_slice(&(*face as u32).to_be_bytes());
                }
                positive(&payload)
            }
            CommandCode::VerifyLicense => {
                if behavior.license_valid {
                    positive(&[])
                } else {
                    ResponseFrame::new(
                        RESPONSE_ADDR,
                        echo,
                        param,
                        ResponseStatus::Negative { code: 0x0001 },
                        &[],
                    )
                    .expect("mock fault response within bounds")
                }
            }
            CommandCode::SetCassettes => positive(frame.payload()),
            CommandCode::Dispense => {
                if let Some(code) = behavior.fail_dispense_code.take() {
                    return ResponseFrame::new(
                        RESPONSE_ADDR,
                        echo,
                        param,
                        ResponseStatus::Error { code },
                        &[],
                    )
                    .expect("mock fault response within bounds");
                }
                let mut payload = Vec::new();
                for pair in frame.payload().chunks_exact(2) {
                    let (index, requested) = (pair[0], pair[1]);
                    let rejected = behavior
                        .rejects_per_cassette
                        .get(&index)
                        .copied()
                        .unwrap_or(0)
                        .min(requested);
                    payload.push(index);
                    payload.push(requested - rejected);
                    payload.push(rejected);
                }
                positive(&payload)
            }
            CommandCode::Present => positive(&[u8::from(behavior.present_taken)]),
            CommandCode::Reset
            | CommandCode::Purge
            | CommandCode::Enable
            | CommandCode::Disable
            | CommandCode::Stack
            | CommandCode::Return
            | CommandCode::Retract => positive(&[]),
        }
    }

    /// Transmit a response, honouring the corrupt-once script and the
    /// host's NAK retransmission requests.
    async fn transmit(&mut self, response: ResponseFrame) -> std::io::Result<()> {
        let good = response.encode();

        let corrupt = {
            let mut behavior = self.behavior.lock().unwrap();
            let corrupt = behavior.corrupt_next_response;
            behavior.corrupt_next_response = false;
            corrupt
        };

        if corrupt {
            let mut bad = good.to_vec();
            let last = bad.len() - 1;
            bad[last] ^= 0xFF;
            self.stream.write_all(&bad).await?;
        } else {
            self.stream.write_all(&good).await?;
        }

        // The host answers every response frame: ACK resolves the call,
        // NAK requests a retransmission of the good copy.
        loop {
            let mut control = [0u8; 1];
            self.stream.read_exact(&mut control).await?;
            match control[0] {
                b if b == ACK => return Ok(()),
                b if b == NAK => {
                    trace!("host NAKed response, retransmitting");
                    self.stream.write_all(&good).await?;
                }
                other => {
                    debug!(byte = other, "unexpected control byte after response");
                    return Ok(());
                }
            }
        }
    }

    async fn read_command(&mut self) -> std::io::Result<Frame> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));

        let mut rest = vec![0u8; len + 1];
        self.stream.read_exact(&mut rest).await?;

        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&rest);
        Frame::parse(&bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NoteDispenser;
    use crate::validator::ValidatorState;
    use crate::{Cassette, CassetteLayout, DeviceClass, Dispenser, Validator};
    use cashpoint_core::batch_from_counts;
    use cashpoint_protocol::{Transport, TransportConfig};
    use tokio::sync::mpsc;

    fn layout() -> CassetteLayout {
        CassetteLayout::new(vec![
            Cassette {
                index: 1,
                denomination: 2000,
            },
            Cassette {
                index: 2,
                denomination: 5000,
            },
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn dispenser_initialize_and_dispense_happy_path() {
        let (io, handle, _unit) = MockCashUnit::spawn(MockBehavior::default());
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let mut dispenser = Dispenser::new(transport, DeviceClass::Dispenser);

        dispenser
            .initialize(layout(), "LICENSE-TOKEN-01")
            .await
            .unwrap();

        let batch = batch_from_counts([(2000u64, 3u32), (5000, 2)]);
        let outcome = dispenser.dispense(&batch).await.unwrap();

        assert_eq!(outcome.movement_of(2000).dispensed, 3);
        assert_eq!(outcome.movement_of(5000).dispensed, 2);
        assert_eq!(outcome.rejected_count(), 0);
        assert_eq!(outcome.dispensed_value(), 3 * 2000 + 2 * 5000);

        let commands = handle.commands();
        assert_eq!(
            commands,
            vec![
                CommandCode::VerifyLicense,
                CommandCode::Status,
                CommandCode::Reset,
                CommandCode::SetCassettes,
                CommandCode::Dispense,
            ]
        );
    }

    #[tokio::test]
    async fn dispenser_purges_residual_cash_before_reset() {
        let mut behavior = MockBehavior::default();
        behavior.status_flags = 0b0000_0001; // residual in shutter
        let (io, handle, _unit) = MockCashUnit::spawn(behavior);
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let mut dispenser = Dispenser::new(transport, DeviceClass::Dispenser);

        dispenser
            .initialize(layout(), "LICENSE-TOKEN-01")
            .await
            .unwrap();

        let commands = handle.commands();
        let purge_pos = commands
            .iter()
            .position(|c| *c == CommandCode::Purge)
            .expect("purge issued");
        let reset_pos = commands
            .iter()
            .position(|c| *c == CommandCode::Reset)
            .expect("reset issued");
        assert!(purge_pos < reset_pos, "purge must precede reset");
    }

    #[tokio::test]
    async fn dispenser_partial_rejects_are_data_not_errors() {
        let mut behavior = MockBehavior::default();
        behavior.rejects_per_cassette.insert(1, 2);
        let (io, _handle, _unit) = MockCashUnit::spawn(behavior);
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let mut dispenser = Dispenser::new(transport, DeviceClass::Dispenser);

        dispenser
            .initialize(layout(), "LICENSE-TOKEN-01")
            .await
            .unwrap();

        let batch = batch_from_counts([(2000u64, 5u32)]);
        let outcome = dispenser.dispense(&batch).await.unwrap();

        assert_eq!(outcome.movement_of(2000).dispensed, 3);
        assert_eq!(outcome.movement_of(2000).rejected, 2);
    }

    #[tokio::test]
    async fn dispenser_rejects_invalid_license() {
        let mut behavior = MockBehavior::default();
        behavior.license_valid = false;
        let (io, handle, _unit) = MockCashUnit::spawn(behavior);
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let mut dispenser = Dispenser::new(transport, DeviceClass::Dispenser);

        let err = dispenser
            .initialize(layout(), "BAD-TOKEN")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::DeviceError::License { .. }));

        // No mechanical command may follow a licence refusal.
        assert_eq!(handle.commands(), vec![CommandCode::VerifyLicense]);
    }

    #[tokio::test]
    async fn dispense_before_initialize_is_rejected() {
        let (io, _handle, _unit) = MockCashUnit::spawn(MockBehavior::default());
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let mut dispenser = Dispenser::new(transport, DeviceClass::Dispenser);

        let batch = batch_from_counts([(2000u64, 1u32)]);
        let err = dispenser.dispense(&batch).await.unwrap_err();
        assert!(matches!(err, crate::DeviceError::NotInitialized));
    }

    #[tokio::test]
    async fn recycler_retracts_untaken_cash() {
        let mut behavior = MockBehavior::default();
        behavior.present_taken = false;
        let (io, handle, _unit) = MockCashUnit::spawn(behavior);
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let mut dispenser = Dispenser::new(transport, DeviceClass::Recycler);

        dispenser
            .initialize(layout(), "LICENSE-TOKEN-01")
            .await
            .unwrap();

        let batch = batch_from_counts([(2000u64, 2u32)]);
        let outcome = dispenser.dispense(&batch).await.unwrap();

        // Untaken cash was retracted: nothing settles as delivered.
        assert_eq!(outcome.dispensed_value(), 0);
        assert_eq!(outcome.movement_of(2000).rejected, 2);

        let commands = handle.commands();
        assert!(commands.contains(&CommandCode::Present));
        assert!(commands.contains(&CommandCode::Retract));
    }

    #[tokio::test]
    async fn dispenser_retries_once_after_nak() {
        let mut behavior = MockBehavior::default();
        behavior.nak_next_command = true;
        let (io, handle, _unit) = MockCashUnit::spawn(behavior);
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let mut dispenser = Dispenser::new(transport, DeviceClass::Dispenser);

        // The first VerifyLicense attempt is NAKed; the retry succeeds.
        dispenser
            .initialize(layout(), "LICENSE-TOKEN-01")
            .await
            .unwrap();

        let commands = handle.commands();
        assert_eq!(commands[0], CommandCode::VerifyLicense);
        assert_eq!(commands[1], CommandCode::VerifyLicense);
    }

    #[tokio::test]
    async fn validator_bring_up_and_accept_cycle() {
        let (io, handle, _unit) = MockCashUnit::spawn(MockBehavior::validator());
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut validator = Validator::new(transport, events_tx);

        // Bring-up leaves the device disabled.
        validator.connect().await.unwrap();
        assert_eq!(validator.state(), ValidatorState::Disable);
        assert_eq!(validator.denomination_table(), &[(1, 2000), (2, 5000), (3, 10_000)]);
        assert_eq!(events_rx.recv().await, Some(crate::DomainEvent::Standby));

        use crate::traits::NoteAcceptor;
        validator.enable().await.unwrap();
        assert_eq!(events_rx.recv().await, Some(crate::DomainEvent::Ready));

        // Script a full accept of a 5000 note on channel 2.
        handle.queue_accepting();
        handle.queue_escrow(2);
        handle.queue_stacking();
        handle.queue_stacked(2);
        handle.queue_enabled();

        let mut seen = Vec::new();
        for _ in 0..5 {
            if let Some(event) = validator.poll().await.unwrap() {
                seen.push(event);
            }
        }

        assert_eq!(
            seen,
            vec![
                crate::DomainEvent::BillRead { denomination: 5000 },
                crate::DomainEvent::BillAccepted { denomination: 5000 },
                crate::DomainEvent::Ready,
            ]
        );
        assert_eq!(validator.tally().stacked().get(&5000), Some(&1));
        assert_eq!(validator.tally().stacked_value(), 5000);
    }

    #[tokio::test]
    async fn validator_defers_disable_during_accept() {
        let (io, handle, _unit) = MockCashUnit::spawn(MockBehavior::validator());
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut validator = Validator::new(transport, events_tx);

        validator.connect().await.unwrap();
        use crate::traits::NoteAcceptor;
        validator.enable().await.unwrap();

        // Drain bring-up events.
        while events_rx.try_recv().is_ok() {}

        // A note is already entering when disable is requested: the
        // status probe sees Accepting and the disable defers.
        handle.queue_accepting();
        let action = validator.disable().await.unwrap();
        assert_eq!(action, crate::DisableAction::Deferred);
        assert_eq!(validator.state(), ValidatorState::Accepting);

        // The in-flight note still reads and stacks.
        handle.queue_escrow(1);
        assert_eq!(
            validator.poll().await.unwrap(),
            Some(crate::DomainEvent::BillRead { denomination: 2000 })
        );
        handle.queue_stacking();
        validator.poll().await.unwrap();
        handle.queue_stacked(1);
        assert_eq!(
            validator.poll().await.unwrap(),
            Some(crate::DomainEvent::BillAccepted { denomination: 2000 })
        );

        // Returning to Enable triggers the deferred disable.
        handle.queue_enabled();
        validator.poll().await.unwrap();
        assert_eq!(validator.state(), ValidatorState::Disable);

        // The disable command actually reached the device.
        assert!(handle.commands().iter().filter(|c| **c == CommandCode::Disable).count() >= 2);
    }

    #[tokio::test]
    async fn validator_reject_is_attributed_to_read_note() {
        let (io, handle, _unit) = MockCashUnit::spawn(MockBehavior::validator());
        let (transport, _actor) = Transport::spawn(io, TransportConfig::default());
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut validator = Validator::new(transport, events_tx);

        validator.connect().await.unwrap();
        use crate::traits::NoteAcceptor;
        validator.enable().await.unwrap();

        handle.queue_accepting();
        handle.queue_escrow(3);
        handle.queue_rejecting(0x0203); // doubled
        handle.queue_enabled();

        let mut rejected = None;
        for _ in 0..4 {
            if let Some(crate::DomainEvent::BillRejected { reason, code }) =
                validator.poll().await.unwrap()
            {
                rejected = Some((reason, code));
            }
        }

        assert_eq!(rejected, Some((crate::RejectReason::Doubled, 0x0203)));
        assert_eq!(validator.tally().rejected().get(&10_000), Some(&1));
        assert_eq!(validator.tally().rejected_unattributed(), 0);
    }
}
