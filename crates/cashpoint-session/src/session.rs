//! The cash transaction orchestrator.
//!
//! One [`DeviceSession`] exclusively owns one dispenser-class device
//! between `initialize()` and `close()`. A transaction runs:
//!
//! ```text
//! solve(amount) -> plan_batches(plan, limit) -> for each batch:
//!     device.dispense(batch), accumulating the outcome
//! ```
//!
//! Failure policy, per batch:
//! - Mechanical rejects are recorded and the next batch proceeds as
//!   planned; the session never recomputes a plan mid-transaction to
//!   compensate.
//! - A link failure stops the sequence, closes the session, and settles
//!   with everything dispensed so far plus the fault. No batch is ever
//!   retried automatically; retry policy belongs to the caller.
//!
//! Inventory is decremented only after each batch's outcome is
//! confirmed by the transport, and the solver is rebuilt from a fresh
//! snapshot afterwards so a later transaction never plans against stale
//! counts.

use crate::error::{Result, SessionError};
use crate::inventory::Inventory;
use cashpoint_core::constants::MAX_CASSETTES;
use cashpoint_core::{DispenseOutcome, SettlementFault, SettlementRecord};
use cashpoint_dispense::{DenominationModel, SolveOutcome, Solver, plan_batches};
use cashpoint_hardware::{Cassette, CassetteLayout, NoteDispenser};
use std::num::NonZeroU32;
use tracing::{debug, error, info, warn};

/// Static configuration for one device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cassette-to-denomination mapping to program into the device.
    pub cassettes: Vec<Cassette>,

    /// Per-operation mechanical note limit. `None` means the mechanism
    /// has no bound; zero is a configuration error, not "no limit".
    pub dispense_limit: Option<u32>,

    /// Opaque operator licence token, passed through to the device.
    pub license: String,
}

impl SessionConfig {
    /// Validate and split into the pieces the session needs.
    fn resolve(&self) -> Result<(CassetteLayout, Option<NonZeroU32>)> {
        if self.license.trim().is_empty() {
            return Err(SessionError::configuration("missing licence token"));
        }
        if self.cassettes.len() > MAX_CASSETTES {
            return Err(SessionError::configuration(format!(
                "{} cassettes configured, supported maximum is {MAX_CASSETTES}",
                self.cassettes.len()
            )));
        }

        let limit = match self.dispense_limit {
            None => None,
            Some(0) => {
                return Err(SessionError::configuration(
                    "dispense limit must be positive; omit it for no limit",
                ));
            }
            Some(limit) => NonZeroU32::new(limit),
        };

        let layout = CassetteLayout::new(self.cassettes.clone())
            .map_err(|e| SessionError::configuration(e.to_string()))?;

        Ok((layout, limit))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Ready,
    Closed,
}

/// A session owning one dispenser-class device.
///
/// Created once, initialized once, then serves transactions until
/// closed. Must not be reused after [`close`](Self::close).
pub struct DeviceSession<D: NoteDispenser, I: Inventory> {
    dispenser: D,
    inventory: I,
    config: SessionConfig,
    solver: Option<Solver>,
    limit: Option<NonZeroU32>,
    state: SessionState,
}

impl<D: NoteDispenser, I: Inventory> DeviceSession<D, I> {
    /// Wrap a device and an inventory. No hardware command is issued
    /// until [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(dispenser: D, inventory: I, config: SessionConfig) -> Self {
        Self {
            dispenser,
            inventory,
            config,
            solver: None,
            limit: None,
            state: SessionState::Created,
        }
    }

    /// Validate configuration, read the inventory, and bring the device
    /// up. Configuration faults are reported before any hardware
    /// command is sent.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.state {
            SessionState::Created => {}
            SessionState::Ready => return Ok(()),
            SessionState::Closed => return Err(SessionError::Closed),
        }

        let (layout, limit) = self.config.resolve()?;

        // Every stocked denomination must have a cassette behind it, or
        // solved plans could name notes the device cannot feed.
        let snapshot = self.inventory.snapshot();
        for denomination in &snapshot {
            if layout.cassette_for(denomination.face_value()).is_none() {
                return Err(SessionError::configuration(format!(
                    "denomination {} is stocked but no cassette is mapped to it",
                    denomination.face_value()
                )));
            }
        }

        self.dispenser
            .initialize(layout, &self.config.license)
            .await?;

        self.solver = Some(Solver::new(DenominationModel::prepare(&snapshot)));
        self.limit = limit;
        self.state = SessionState::Ready;
        info!(
            denominations = snapshot.len(),
            limit = ?self.limit,
            "device session ready"
        );
        Ok(())
    }

    /// Run one cash-out transaction.
    ///
    /// Always produces a settlement record; faults (infeasibility,
    /// device fault, link failure) are carried in its `error` field
    /// rather than thrown, so partial dispenses are never lost.
    pub async fn dispense(&mut self, amount: u64) -> SettlementRecord {
        let empty = DispenseOutcome::new();

        if self.state != SessionState::Ready {
            let message = match self.state {
                SessionState::Created => "session not initialized",
                _ => "session is closed",
            };
            warn!(amount, message, "dispense refused");
            return SettlementRecord::from_outcome(
                amount,
                &empty,
                Some(SettlementFault::Configuration {
                    message: message.to_string(),
                }),
            );
        }

        let Some(solver) = self.solver.as_mut() else {
            return SettlementRecord::from_outcome(
                amount,
                &empty,
                Some(SettlementFault::Configuration {
                    message: "session not initialized".to_string(),
                }),
            );
        };
        let plan = match solver.solve(amount) {
            SolveOutcome::Plan(plan) => plan,
            SolveOutcome::Infeasible => {
                info!(amount, "amount not dispensable with current stock");
                return SettlementRecord::from_outcome(
                    amount,
                    &empty,
                    Some(SettlementFault::Infeasible),
                );
            }
        };

        let batches = plan_batches(&plan, self.limit);
        debug!(
            amount,
            notes = plan.note_count(),
            batches = batches.len(),
            "transaction planned"
        );

        let mut total = DispenseOutcome::new();
        let mut fault = None;

        for (index, batch) in batches.iter().enumerate() {
            match self.dispenser.dispense(batch).await {
                Ok(outcome) => {
                    if outcome.rejected_count() > 0 {
                        warn!(
                            batch = index,
                            rejected = outcome.rejected_count(),
                            "mechanical rejects recorded, continuing"
                        );
                    }
                    // Confirmed by the transport: safe to decrement now.
                    self.inventory.record_dispense(&outcome);
                    total.merge(&outcome);
                }
                Err(e) if e.is_link_failure() => {
                    error!(batch = index, error = %e, "link failed mid-transaction, closing session");
                    fault = Some(SettlementFault::Transport {
                        message: e.to_string(),
                    });
                    self.state = SessionState::Closed;
                    break;
                }
                Err(e) => {
                    error!(batch = index, error = %e, "device fault, stopping transaction");
                    fault = Some(SettlementFault::Device {
                        code: e.fault_code().unwrap_or(0),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        // Later transactions must plan against what is actually left.
        if self.state == SessionState::Ready {
            let snapshot = self.inventory.snapshot();
            if let Some(solver) = self.solver.as_mut() {
                solver.rebuild(DenominationModel::prepare(&snapshot));
            }
        }

        SettlementRecord::from_outcome(amount, &total, fault)
    }

    /// Close the session. The device must not be reused afterwards.
    pub async fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!("closing device session");
            self.state = SessionState::Closed;
        }
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// The inventory collaborator, for reconciliation reads.
    #[must_use]
    pub fn inventory(&self) -> &I {
        &self.inventory
    }
}
