//! Cassette inventory collaborator.
//!
//! The session reads counts once at initialization and notifies the
//! inventory after each confirmed dispense outcome. Only dispensed notes
//! decrement the stock: rejected notes land in the reject bin, and their
//! accounting against cassette counts is an operator reconciliation
//! concern, not the session's.

use cashpoint_core::{Denomination, DispenseOutcome};
use std::collections::BTreeMap;
use tracing::warn;

/// Read and decrement cassette note counts.
///
/// Implementations must apply [`record_dispense`](Self::record_dispense)
/// atomically with respect to the settlement the outcome came from:
/// never decrement before the transport confirmed the operation.
pub trait Inventory: Send {
    /// Current stock per denomination.
    fn snapshot(&self) -> Vec<Denomination>;

    /// Apply a confirmed dispense outcome: decrement dispensed counts,
    /// leave rejected counts untouched.
    fn record_dispense(&mut self, outcome: &DispenseOutcome);
}

/// In-memory inventory, for tests and single-process deployments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryInventory {
    counts: BTreeMap<u64, u32>,
}

impl MemoryInventory {
    /// Build from `(face_value, count)` pairs.
    #[must_use]
    pub fn new<I: IntoIterator<Item = (u64, u32)>>(counts: I) -> Self {
        Self {
            counts: counts.into_iter().collect(),
        }
    }

    /// Current count for a denomination.
    #[must_use]
    pub fn count_of(&self, face_value: u64) -> u32 {
        self.counts.get(&face_value).copied().unwrap_or(0)
    }

    /// Total value currently stocked.
    #[must_use]
    pub fn total_value(&self) -> u64 {
        self.counts
            .iter()
            .map(|(face, count)| face * u64::from(*count))
            .sum()
    }
}

impl Inventory for MemoryInventory {
    fn snapshot(&self) -> Vec<Denomination> {
        self.counts
            .iter()
            .filter_map(|(face, count)| Denomination::new(*face, *count).ok())
            .collect()
    }

    fn record_dispense(&mut self, outcome: &DispenseOutcome) {
        for (face, movement) in outcome.iter() {
            if movement.dispensed == 0 {
                continue;
            }
            match self.counts.get_mut(&face) {
                Some(count) if *count >= movement.dispensed => *count -= movement.dispensed,
                Some(count) => {
                    warn!(
                        face,
                        stocked = *count,
                        dispensed = movement.dispensed,
                        "dispense outcome exceeds stocked count, clamping to zero"
                    );
                    *count = 0;
                }
                None => {
                    warn!(face, "dispense outcome names an unstocked denomination");
                }
            }
        }
    }
}
