//! Capability traits for cash devices.
//!
//! These establish the contract between the transaction layer and the
//! device drivers, so sessions can be exercised against the mock cash
//! unit exactly as against real hardware.
//!
//! All traits use native `async fn` methods (Edition 2024 RPITIT); they
//! are not object-safe, so consumers take them as generic parameters.

#![allow(async_fn_in_trait)]

use crate::dispenser::{CassetteLayout, DispenserStatus};
use crate::error::Result;
use crate::events::DomainEvent;
use crate::validator::DisableAction;
use cashpoint_core::{Batch, DispenseOutcome};

/// A note-accepting device (bill validator).
pub trait NoteAcceptor: Send {
    /// Allow the device to accept notes.
    async fn enable(&mut self) -> Result<()>;

    /// Stop accepting notes.
    ///
    /// When a note is already in flight the disable is deferred rather
    /// than aborting the read; the returned action says which happened.
    async fn disable(&mut self) -> Result<DisableAction>;

    /// Commit the escrowed note to the stacker.
    async fn stack(&mut self) -> Result<()>;

    /// Return the escrowed note to the customer.
    async fn return_note(&mut self) -> Result<()>;

    /// Poll device status once, driving the state machine.
    ///
    /// Returns the domain event that transition emitted, if any.
    async fn poll(&mut self) -> Result<Option<DomainEvent>>;
}

/// A note-dispensing device (dispenser or recycler).
pub trait NoteDispenser: Send {
    /// Bring the device up: verify the licence token, clear residual
    /// cash, reset the mechanism, and program the cassette layout.
    ///
    /// Must complete before any [`dispense`](Self::dispense) call.
    async fn initialize(&mut self, layout: CassetteLayout, license: &str) -> Result<()>;

    /// Feed one batch of notes.
    ///
    /// Mechanical rejects are part of the returned outcome, never an
    /// error; only transport/communication failure errs.
    async fn dispense(&mut self, batch: &Batch) -> Result<DispenseOutcome>;

    /// Report device status flags.
    async fn status(&mut self) -> Result<DispenserStatus>;

    /// Eject residual cash from the transport path and shutter.
    async fn purge(&mut self) -> Result<()>;
}
