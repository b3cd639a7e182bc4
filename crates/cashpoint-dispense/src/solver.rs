//! Exact-change decomposition over the available cassette stock.
//!
//! The solver answers one question: which physical notes add up to the
//! requested amount, given what the cassettes currently hold? It is an
//! exact subset-sum-with-multiplicity search, not a greedy approximation:
//! the returned plan always sums to the target precisely, and when no
//! combination of available notes reaches the target the solver says so
//! instead of under- or over-shooting.
//!
//! # Canonical Decomposition
//!
//! The search walks denominations largest-first and tries multiplicities
//! from the maximum usable count downward, accepting the first complete
//! decomposition it finds. The result is therefore deterministic and
//! biased toward large notes. Receipt rendering and cash reconciliation
//! rely on this canonical shape, so the order must not be changed.
//!
//! # Memoization
//!
//! Every `(remaining, index)` outcome is memoized inside the [`Solver`],
//! success and failure alike. The memo is valid only for the stock the
//! model was prepared with; rebuild the solver whenever cassette counts
//! change.
//!
//! # Examples
//!
//! ```
//! use cashpoint_core::Denomination;
//! use cashpoint_dispense::{DenominationModel, SolveOutcome, Solver};
//!
//! let model = DenominationModel::prepare(&[
//!     Denomination::new(2000, 500).unwrap(),
//!     Denomination::new(10000, 400).unwrap(),
//! ]);
//! let mut solver = Solver::new(model);
//!
//! match solver.solve(4_986_000) {
//!     SolveOutcome::Plan(plan) => assert_eq!(plan.total_value(), 4_986_000),
//!     SolveOutcome::Infeasible => unreachable!(),
//! }
//! ```

use cashpoint_core::{Denomination, DispensePlan};
use std::collections::HashMap;
use tracing::debug;

/// One denomination with its search-time precomputation.
#[derive(Debug, Clone, Copy)]
struct PreparedDenomination {
    face_value: u64,
    available_count: u32,

    /// Total value reachable using this denomination and every smaller
    /// one at full stock. Lets the search abandon a branch the moment the
    /// remainder is out of reach.
    reachable_sum: u64,
}

/// Denomination stock prepared for searching.
///
/// Built once per inventory snapshot via [`DenominationModel::prepare`]:
/// denominations are sorted descending by face value and each entry
/// carries the cumulative reachable sum of itself and everything after
/// it. Duplicate face values are kept as separate entries; the solver is
/// multiset-agnostic.
#[derive(Debug, Clone)]
pub struct DenominationModel {
    denominations: Vec<PreparedDenomination>,
}

impl DenominationModel {
    /// Prepare a model from an inventory snapshot.
    ///
    /// Entries with zero available count are kept (they simply contribute
    /// nothing); order of the input does not matter.
    #[must_use]
    pub fn prepare(denominations: &[Denomination]) -> Self {
        let mut sorted: Vec<(u64, u32)> = denominations
            .iter()
            .map(|d| (d.face_value(), d.available_count()))
            .collect();
        sorted.sort_by(|a, b| b.0.cmp(&a.0));

        // Accumulate reachable sums from the smallest denomination up.
        let mut prepared: Vec<PreparedDenomination> = Vec::with_capacity(sorted.len());
        let mut running: u64 = 0;
        for (face_value, available_count) in sorted.into_iter().rev() {
            running += face_value * u64::from(available_count);
            prepared.push(PreparedDenomination {
                face_value,
                available_count,
                reachable_sum: running,
            });
        }
        prepared.reverse();

        Self {
            denominations: prepared,
        }
    }

    /// Total value of all available stock.
    #[must_use]
    pub fn total_stock_value(&self) -> u64 {
        self.denominations
            .first()
            .map(|d| d.reachable_sum)
            .unwrap_or(0)
    }

    /// Number of denomination entries in the model.
    #[must_use]
    pub fn len(&self) -> usize {
        self.denominations.len()
    }

    /// True when the model holds no denominations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.denominations.is_empty()
    }
}

/// Result of a solve: an exact plan or a definitive "cannot be done".
///
/// Infeasibility is a first-class outcome the caller handles (typically by
/// offering a different amount), not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    /// An exact decomposition; `plan.total_value()` equals the target.
    Plan(DispensePlan),

    /// No multiset of available notes sums exactly to the target.
    Infeasible,
}

/// Suffix decomposition memoized per `(remaining, index)` state.
#[derive(Debug, Clone)]
enum MemoEntry {
    /// Counts for `denominations[index..]`, in model order.
    Feasible(Vec<u32>),
    Infeasible,
}

/// Exact-change solver owning its memo table.
///
/// The memo is scoped to the model the solver was built with; call
/// [`Solver::rebuild`] after the inventory changes.
#[derive(Debug)]
pub struct Solver {
    model: DenominationModel,
    memo: HashMap<(u64, usize), MemoEntry>,
}

impl Solver {
    /// Create a solver over a prepared model.
    #[must_use]
    pub fn new(model: DenominationModel) -> Self {
        Self {
            model,
            memo: HashMap::new(),
        }
    }

    /// Replace the model and drop every memoized outcome.
    ///
    /// Must be called whenever cassette counts change; memo entries from
    /// an older stock snapshot would otherwise poison later solves.
    pub fn rebuild(&mut self, model: DenominationModel) {
        self.model = model;
        self.memo.clear();
    }

    /// The model this solver searches over.
    #[must_use]
    pub fn model(&self) -> &DenominationModel {
        &self.model
    }

    /// Decompose `target` into available notes, exactly.
    ///
    /// Returns [`SolveOutcome::Plan`] whose total equals `target`, or
    /// [`SolveOutcome::Infeasible`] when no combination of the available
    /// stock reaches it. A target of zero yields an empty plan.
    pub fn solve(&mut self, target: u64) -> SolveOutcome {
        match self.search(target, 0) {
            Some(counts) => {
                let mut plan = DispensePlan::new();
                for (entry, count) in self.model.denominations.iter().zip(counts) {
                    plan.add_notes(entry.face_value, count);
                }
                debug_assert_eq!(plan.total_value(), target);
                SolveOutcome::Plan(plan)
            }
            None => {
                debug!(target, "no exact decomposition");
                SolveOutcome::Infeasible
            }
        }
    }

    /// Depth-first search for a suffix decomposition of `remaining` using
    /// `denominations[index..]`. Returns counts aligned to that suffix.
    fn search(&mut self, remaining: u64, index: usize) -> Option<Vec<u32>> {
        let suffix_len = self.model.denominations.len() - index;
        if remaining == 0 {
            return Some(vec![0; suffix_len]);
        }
        if index == self.model.denominations.len() {
            return None;
        }

        if let Some(entry) = self.memo.get(&(remaining, index)) {
            return match entry {
                MemoEntry::Feasible(counts) => Some(counts.clone()),
                MemoEntry::Infeasible => None,
            };
        }

        let result = self.search_uncached(remaining, index);
        self.memo.insert(
            (remaining, index),
            match &result {
                Some(counts) => MemoEntry::Feasible(counts.clone()),
                None => MemoEntry::Infeasible,
            },
        );
        result
    }

    fn search_uncached(&mut self, remaining: u64, index: usize) -> Option<Vec<u32>> {
        let entry = self.model.denominations[index];

        // Even the full remaining stock cannot reach the target.
        if remaining > entry.reachable_sum {
            return None;
        }

        // No denomination from here on divides the remainder evenly, so no
        // final note can ever land on zero. Cassette ladders divide one
        // another (20 into 100 into ...), which makes this a cheap dead-end
        // check before recursing.
        if !self.model.denominations[index..]
            .iter()
            .any(|d| remaining % d.face_value == 0)
        {
            return None;
        }

        let max_count =
            u64::from(entry.available_count).min(remaining / entry.face_value) as u32;

        // Largest usable multiplicity first: the first hit is the canonical
        // large-note-biased decomposition.
        for count in (0..=max_count).rev() {
            let spent = entry.face_value * u64::from(count);
            if let Some(rest) = self.search(remaining - spent, index + 1) {
                let mut counts = Vec::with_capacity(rest.len() + 1);
                counts.push(count);
                counts.extend(rest);
                return Some(counts);
            }
        }

        None
    }
}
