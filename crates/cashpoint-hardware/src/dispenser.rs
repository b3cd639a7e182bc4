//! Dispenser/recycler driver.
//!
//! The dispenser is command-driven rather than notification-driven: the
//! host asks for notes and the device answers with what actually moved.
//! The driver owns the bring-up choreography (licence, residual-cash
//! purge, mechanism reset, cassette programming) and the per-batch
//! dispense cycle. Recycler-class devices add the present/retract step:
//! fed notes are offered to the customer behind the shutter, and cash
//! not taken within the present window is pulled back in before the
//! call resolves.
//!
//! Mechanical rejects never fail a dispense: a cassette that jams mid
//! batch still produces an outcome with `rejected > 0` for that
//! denomination. Only the serial link failing is an error.

use crate::error::{DeviceError, Result};
use crate::traits::NoteDispenser;
use bytes::Bytes;
use cashpoint_core::constants::{MAX_CASSETTES, MECHANICAL_TIMEOUT_MS, PRESENT_WINDOW_MS};
use cashpoint_core::{Batch, DispenseOutcome};
use cashpoint_protocol::{CommandCode, TransportError, TransportHandle};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status flag bits reported by the dispenser.
mod status_flag {
    /// Cash left in the shutter from a prior abnormal stop.
    pub const RESIDUAL_SHUTTER: u8 = 0b0000_0001;

    /// Cash left in the transport path / internal stacker.
    pub const RESIDUAL_STACKER: u8 = 0b0000_0010;

    /// Shutter failed to close.
    pub const SHUTTER_OPEN: u8 = 0b0000_0100;
}

/// Whether the unit can only pay out or also recycle deposited notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Pay-out only; notes drop straight to the delivery tray.
    Dispenser,

    /// Recycler: notes are presented behind a shutter and can be
    /// retracted if the customer walks away.
    Recycler,
}

/// One physical cassette and the denomination loaded into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cassette {
    /// Hardware cassette index.
    pub index: u8,

    /// Face value of the notes loaded, in minor units.
    pub denomination: u64,
}

/// The cassette-to-denomination mapping programmed at initialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CassetteLayout {
    cassettes: Vec<Cassette>,
}

impl CassetteLayout {
    /// Build a layout with validation.
    ///
    /// # Errors
    ///
    /// Rejects empty layouts, more cassettes than the hardware carries,
    /// duplicate cassette indexes, duplicate denominations, and zero
    /// face values.
    pub fn new(cassettes: Vec<Cassette>) -> Result<Self> {
        if cassettes.is_empty() {
            return Err(DeviceError::unsupported_layout("no cassettes configured"));
        }
        if cassettes.len() > MAX_CASSETTES {
            return Err(DeviceError::unsupported_layout(format!(
                "{} cassettes configured, device carries at most {MAX_CASSETTES}",
                cassettes.len()
            )));
        }
        for (i, cassette) in cassettes.iter().enumerate() {
            if cassette.denomination == 0 {
                return Err(DeviceError::unsupported_layout(format!(
                    "cassette {} has zero denomination",
                    cassette.index
                )));
            }
            for other in &cassettes[i + 1..] {
                if other.index == cassette.index {
                    return Err(DeviceError::unsupported_layout(format!(
                        "duplicate cassette index {}",
                        cassette.index
                    )));
                }
                if other.denomination == cassette.denomination {
                    return Err(DeviceError::unsupported_layout(format!(
                        "denomination {} loaded in two cassettes",
                        cassette.denomination
                    )));
                }
            }
        }
        Ok(Self { cassettes })
    }

    /// The cassettes in configured order.
    #[must_use]
    pub fn cassettes(&self) -> &[Cassette] {
        &self.cassettes
    }

    /// Find the cassette loaded with a denomination.
    #[must_use]
    pub fn cassette_for(&self, denomination: u64) -> Option<&Cassette> {
        self.cassettes
            .iter()
            .find(|c| c.denomination == denomination)
    }

    /// Find the denomination loaded in a cassette index.
    #[must_use]
    pub fn denomination_of(&self, index: u8) -> Option<u64> {
        self.cassettes
            .iter()
            .find(|c| c.index == index)
            .map(|c| c.denomination)
    }

    /// Serialize to the `SetCassettes` wire payload: repeating
    /// `[index, face_value(u32 BE)]` records.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.cassettes.len() * 5);
        for cassette in &self.cassettes {
            payload.push(cassette.index);
            payload.extend_from_slice(&(cassette.denomination as u32).to_be_bytes());
        }
        payload
    }
}

/// Decoded dispenser status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispenserStatus {
    flags: u8,
}

impl DispenserStatus {
    /// Wrap a raw flag byte.
    #[must_use]
    pub fn from_flags(flags: u8) -> Self {
        Self { flags }
    }

    /// Cash left in the shutter.
    #[must_use]
    pub fn residual_in_shutter(&self) -> bool {
        self.flags & status_flag::RESIDUAL_SHUTTER != 0
    }

    /// Cash left in the transport path or internal stacker.
    #[must_use]
    pub fn residual_in_stacker(&self) -> bool {
        self.flags & status_flag::RESIDUAL_STACKER != 0
    }

    /// Shutter stuck open.
    #[must_use]
    pub fn shutter_open(&self) -> bool {
        self.flags & status_flag::SHUTTER_OPEN != 0
    }

    /// Any residual cash anywhere in the mechanism.
    #[must_use]
    pub fn has_residual_cash(&self) -> bool {
        self.residual_in_shutter() || self.residual_in_stacker()
    }
}

/// Dispenser/recycler driver over a framed transport.
pub struct Dispenser {
    transport: TransportHandle,
    class: DeviceClass,
    layout: Option<CassetteLayout>,
    mechanical_timeout: Duration,
    present_window: Duration,
}

impl Dispenser {
    /// Create a driver over an open transport. No hardware command is
    /// sent until [`NoteDispenser::initialize`].
    #[must_use]
    pub fn new(transport: TransportHandle, class: DeviceClass) -> Self {
        Self {
            transport,
            class,
            layout: None,
            mechanical_timeout: Duration::from_millis(MECHANICAL_TIMEOUT_MS),
            present_window: Duration::from_millis(PRESENT_WINDOW_MS),
        }
    }

    /// Device class.
    #[must_use]
    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// The programmed layout, once initialized.
    #[must_use]
    pub fn layout(&self) -> Option<&CassetteLayout> {
        self.layout.as_ref()
    }

    fn layout_or_err(&self) -> Result<&CassetteLayout> {
        self.layout.as_ref().ok_or(DeviceError::NotInitialized)
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

    /// Like [`command`](Self::command) with the mechanical deadline for
    /// operations that physically move notes.
    async fn mechanical_command(
        &self,
        command: CommandCode,
        parameter: u8,
        payload: &[u8],
    ) -> Result<Bytes> {
        let deadline = self.mechanical_timeout;
        match self
            .transport
            .send_command_with_deadline(command, parameter, payload, deadline)
            .await
        {
            Err(TransportError::Nak) => {
                warn!(%command, "NAK on command, retrying once");
                Ok(self
                    .transport
                    .send_command_with_deadline(command, parameter, payload, deadline)
                    .await?)
            }
            other => Ok(other?),
        }
    }

    /// Offer fed notes to the customer, retracting them if the present
    /// window expires. Returns `true` when the customer took the cash.
    async fn present_and_settle(&self) -> Result<bool> {
        let deadline = self.present_window + self.mechanical_timeout;
        let payload = self
            .transport
            .send_command_with_deadline(CommandCode::Present, 0x00, &[], deadline)
            .await?;

        let taken = payload.first().copied().unwrap_or(0) == 1;
        if !taken {
            warn!("present window expired, retracting cash");
            self.mechanical_command(CommandCode::Retract, 0x00, &[])
                .await?;
        }
        Ok(taken)
    }
}

impl NoteDispenser for Dispenser {
    async fn initialize(&mut self, layout: CassetteLayout, license: &str) -> Result<()> {
        if license.is_empty() {
            return Err(DeviceError::license("empty licence token"));
        }

        // Licence first; a unit refusing the token must not be touched
        // mechanically.
        match self
            .command(CommandCode::VerifyLicense, 0x00, license.as_bytes())
            .await
        {
            Ok(_) => {}
            Err(DeviceError::Transport(TransportError::Device { code, .. })) => {
                return Err(DeviceError::license(format!(
                    "device refused licence token (code {code:#06x})"
                )));
            }
            Err(other) => return Err(other),
        }

        // Cash from a prior abnormal stop is cleared before resetting.
        let status = self.status().await?;
        if status.has_residual_cash() {
            info!(
                shutter = status.residual_in_shutter(),
                stacker = status.residual_in_stacker(),
                "residual cash found, purging before reset"
            );
            self.purge().await?;
        }

        self.mechanical_command(CommandCode::Reset, 0x00, &[])
            .await?;

        // Program the cassette table and verify the echo byte-for-byte.
        let wire = layout.to_wire();
        let echo = self
            .command(CommandCode::SetCassettes, 0x00, &wire)
            .await?;
        if echo.as_ref() != wire.as_slice() {
            return Err(DeviceError::protocol(
                "cassette layout echo does not match programmed table",
            ));
        }

        info!(
            cassettes = layout.cassettes().len(),
            class = ?self.class,
            "dispenser initialized"
        );
        self.layout = Some(layout);
        Ok(())
    }

    async fn dispense(&mut self, batch: &Batch) -> Result<DispenseOutcome> {
        let layout = self.layout_or_err()?;

        // Per-cassette request pairs, in layout order.
        let mut request = Vec::with_capacity(batch.plan().denomination_count() * 2);
        for (face, count) in batch.plan().iter() {
            let cassette = layout.cassette_for(face).ok_or_else(|| {
                DeviceError::unsupported_layout(format!(
                    "no cassette loaded with denomination {face}"
                ))
            })?;
            let count = u8::try_from(count).map_err(|_| {
                DeviceError::protocol(format!("batch count {count} exceeds a single operation"))
            })?;
            request.push(cassette.index);
            request.push(count);
        }

        debug!(notes = batch.note_count(), "dispensing batch");
        let payload = self
            .mechanical_command(CommandCode::Dispense, 0x00, &request)
            .await?;

        // Response: repeating [index, dispensed, rejected] triplets.
        if payload.len() % 3 != 0 {
            return Err(DeviceError::protocol(format!(
                "dispense result has invalid length {}",
                payload.len()
            )));
        }

        let layout = self.layout_or_err()?;
        let mut outcome = DispenseOutcome::new();
        for triplet in payload.chunks_exact(3) {
            let face = layout.denomination_of(triplet[0]).ok_or_else(|| {
                DeviceError::protocol(format!("result names unknown cassette {}", triplet[0]))
            })?;
            outcome.record(face, u32::from(triplet[1]), u32::from(triplet[2]));
        }

        if outcome.rejected_count() > 0 {
            warn!(
                rejected = outcome.rejected_count(),
                "mechanical rejects during batch"
            );
        }

        // Recyclers hold the notes behind the shutter until taken or the
        // window expires; untaken cash ends in the retract bin and must
        // not be settled as delivered.
        if self.class == DeviceClass::Recycler && outcome.dispensed_value() > 0 {
            let taken = self.present_and_settle().await?;
            if !taken {
                let mut retracted = DispenseOutcome::new();
                for (face, movement) in outcome.iter() {
                    retracted.record(face, 0, movement.dispensed + movement.rejected);
                }
                return Ok(retracted);
            }
        }

        Ok(outcome)
    }

    async fn status(&mut self) -> Result<DispenserStatus> {
        let payload = self.command(CommandCode::Status, 0x00, &[]).await?;
        let flags = *payload
            .first()
            .ok_or_else(|| DeviceError::protocol("empty status payload"))?;
        Ok(DispenserStatus::from_flags(flags))
    }

    async fn purge(&mut self) -> Result<()> {
        self.mechanical_command(CommandCode::Purge, 0x00, &[])
            .await?;
        Ok(())
    }
}
