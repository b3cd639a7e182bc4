//! Domain types shared across the cash-handling core.
//!
//! Everything here is hardware-free: denominations and plans feed the
//! solver and planner, outcomes and settlement records flow back out of the
//! orchestrator. Types validate on construction and stay immutable (or
//! append-only) afterwards.

use crate::{Result, error::Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// One denomination as stocked by the cash unit.
///
/// `face_value` is expressed in minor currency units (e.g. cents) so all
/// arithmetic stays integral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denomination {
    /// Face value in minor units. Always positive.
    face_value: u64,

    /// Notes of this denomination currently available.
    available_count: u32,
}

impl Denomination {
    /// Create a denomination with validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDenomination`] if `face_value` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use cashpoint_core::Denomination;
    ///
    /// let d = Denomination::new(2000, 500).unwrap();
    /// assert_eq!(d.face_value(), 2000);
    /// assert_eq!(d.available_count(), 500);
    ///
    /// assert!(Denomination::new(0, 10).is_err());
    /// ```
    pub fn new(face_value: u64, available_count: u32) -> Result<Self> {
        if face_value == 0 {
            return Err(Error::invalid_denomination("face value must be positive"));
        }
        Ok(Self {
            face_value,
            available_count,
        })
    }

    /// Face value in minor units.
    #[must_use]
    pub fn face_value(&self) -> u64 {
        self.face_value
    }

    /// Notes currently available.
    #[must_use]
    pub fn available_count(&self) -> u32 {
        self.available_count
    }

    /// Total value of the available stock of this denomination.
    #[must_use]
    pub fn stock_value(&self) -> u64 {
        self.face_value * u64::from(self.available_count)
    }
}

impl fmt::Display for Denomination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.available_count, self.face_value)
    }
}

/// A mapping from denomination face value to note count.
///
/// The solver produces one of these per transaction; the batch planner
/// splits it; the dispenser driver consumes the batches. Iteration order is
/// stable (ascending face value) so batch composition is reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispensePlan {
    counts: BTreeMap<u64, u32>,
}

impl DispensePlan {
    /// Create an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add notes of a denomination to the plan. Zero counts are ignored so
    /// plans never carry empty entries.
    pub fn add_notes(&mut self, face_value: u64, count: u32) {
        if count > 0 {
            *self.counts.entry(face_value).or_insert(0) += count;
        }
    }

    /// Note count for a denomination (zero if absent).
    #[must_use]
    pub fn count_of(&self, face_value: u64) -> u32 {
        self.counts.get(&face_value).copied().unwrap_or(0)
    }

    /// Total monetary value of the plan.
    #[must_use]
    pub fn total_value(&self) -> u64 {
        self.counts
            .iter()
            .map(|(face, count)| face * u64::from(*count))
            .sum()
    }

    /// Total number of physical notes in the plan.
    #[must_use]
    pub fn note_count(&self) -> u32 {
        self.counts.values().sum()
    }

    /// True when the plan contains no notes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterate `(face_value, count)` pairs in ascending face-value order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.counts.iter().map(|(face, count)| (*face, *count))
    }

    /// Number of distinct denominations in the plan.
    #[must_use]
    pub fn denomination_count(&self) -> usize {
        self.counts.len()
    }
}

impl FromIterator<(u64, u32)> for DispensePlan {
    fn from_iter<I: IntoIterator<Item = (u64, u32)>>(iter: I) -> Self {
        let mut plan = Self::new();
        for (face, count) in iter {
            plan.add_notes(face, count);
        }
        plan
    }
}

/// A sub-plan sized to fit one mechanical dispense operation.
///
/// Batches are only produced by the planner, which guarantees
/// `note_count() <= limit` for the limit it was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch(DispensePlan);

impl Batch {
    /// Wrap a plan as a batch. Crate-visible so only planning code can
    /// mint batches.
    pub(crate) fn from_plan(plan: DispensePlan) -> Self {
        Self(plan)
    }

    /// The notes in this batch.
    #[must_use]
    pub fn plan(&self) -> &DispensePlan {
        &self.0
    }

    /// Total number of physical notes in this batch.
    #[must_use]
    pub fn note_count(&self) -> u32 {
        self.0.note_count()
    }
}

/// Construct a batch from raw `(face_value, count)` pairs.
///
/// Exists for the planner and for tests; the planner invariant (batch note
/// count within the mechanical limit) is enforced by the caller.
pub fn batch_from_counts<I: IntoIterator<Item = (u64, u32)>>(counts: I) -> Batch {
    Batch::from_plan(counts.into_iter().collect())
}

/// Per-denomination result of one dispense operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteMovement {
    /// Notes that physically left the cassette and reached the customer
    /// (or the present position).
    pub dispensed: u32,

    /// Notes the mechanism pulled but rejected into the reject bin.
    pub rejected: u32,
}

/// Aggregated result of one or more dispense operations.
///
/// Mechanical rejects are data, not errors: a denomination that jammed
/// still appears here with `rejected > 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseOutcome {
    movements: BTreeMap<u64, NoteMovement>,
}

impl DispenseOutcome {
    /// Create an empty outcome.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record movement for a denomination, accumulating onto any prior
    /// entry.
    pub fn record(&mut self, face_value: u64, dispensed: u32, rejected: u32) {
        let entry = self.movements.entry(face_value).or_default();
        entry.dispensed += dispensed;
        entry.rejected += rejected;
    }

    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: &DispenseOutcome) {
        for (face, movement) in &other.movements {
            self.record(*face, movement.dispensed, movement.rejected);
        }
    }

    /// Movement for one denomination (zeros if absent).
    #[must_use]
    pub fn movement_of(&self, face_value: u64) -> NoteMovement {
        self.movements.get(&face_value).copied().unwrap_or_default()
    }

    /// Total value actually dispensed.
    #[must_use]
    pub fn dispensed_value(&self) -> u64 {
        self.movements
            .iter()
            .map(|(face, m)| face * u64::from(m.dispensed))
            .sum()
    }

    /// Total number of rejected notes across all denominations.
    #[must_use]
    pub fn rejected_count(&self) -> u32 {
        self.movements.values().map(|m| m.rejected).sum()
    }

    /// Iterate `(face_value, movement)` pairs in ascending face-value
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, NoteMovement)> + '_ {
        self.movements.iter().map(|(face, m)| (*face, *m))
    }

    /// Per-denomination dispensed counts, for settlement records.
    #[must_use]
    pub fn dispensed_by_denomination(&self) -> BTreeMap<u64, u32> {
        self.movements
            .iter()
            .filter(|(_, m)| m.dispensed > 0)
            .map(|(face, m)| (*face, m.dispensed))
            .collect()
    }

    /// Per-denomination rejected counts, for settlement records.
    #[must_use]
    pub fn rejected_by_denomination(&self) -> BTreeMap<u64, u32> {
        self.movements
            .iter()
            .filter(|(_, m)| m.rejected > 0)
            .map(|(face, m)| (*face, m.rejected))
            .collect()
    }
}

/// Why a transaction ended short of full success.
///
/// This is the caller-facing fault classification carried inside a
/// [`SettlementRecord`]; the UI layer needs nothing beyond this and the
/// per-denomination counts to explain what happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementFault {
    /// No exact decomposition of the requested amount exists with the
    /// available stock. First-class outcome, not a device failure.
    Infeasible,

    /// The serial link failed mid-transaction; remaining batches were not
    /// attempted.
    Transport { message: String },

    /// The device reported a fault code that stopped the transaction.
    Device { code: u16, message: String },

    /// The session was configured incorrectly; no hardware command was
    /// issued.
    Configuration { message: String },
}

impl fmt::Display for SettlementFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infeasible => write!(f, "amount not dispensable with available stock"),
            Self::Transport { message } => write!(f, "transport failure: {message}"),
            Self::Device { code, message } => {
                write!(f, "device fault {code:#06x}: {message}")
            }
            Self::Configuration { message } => write!(f, "configuration error: {message}"),
        }
    }
}

/// Final accounting of one cash transaction.
///
/// Produced exactly once per `dispense()` call and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Unique settlement identifier.
    pub id: Uuid,

    /// Amount the caller asked for, in minor units.
    pub requested_amount: u64,

    /// Notes confirmed dispensed, per denomination.
    pub dispensed_by_denomination: BTreeMap<u64, u32>,

    /// Notes mechanically rejected, per denomination.
    pub rejected_by_denomination: BTreeMap<u64, u32>,

    /// Fault that ended the transaction early, if any.
    pub error: Option<SettlementFault>,

    /// When the record was produced.
    pub completed_at: DateTime<Utc>,
}

impl SettlementRecord {
    /// Build a settlement record from an accumulated outcome.
    #[must_use]
    pub fn from_outcome(
        requested_amount: u64,
        outcome: &DispenseOutcome,
        error: Option<SettlementFault>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requested_amount,
            dispensed_by_denomination: outcome.dispensed_by_denomination(),
            rejected_by_denomination: outcome.rejected_by_denomination(),
            error,
            completed_at: Utc::now(),
        }
    }

    /// Total value confirmed dispensed.
    #[must_use]
    pub fn dispensed_total(&self) -> u64 {
        self.dispensed_by_denomination
            .iter()
            .map(|(face, count)| face * u64::from(*count))
            .sum()
    }

    /// True when the full requested amount left the machine with no fault.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.dispensed_total() == self.requested_amount
    }
}
