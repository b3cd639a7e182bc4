//! Splitting a note plan into mechanically safe dispense batches.
//!
//! Cash mechanisms feed a bounded number of notes per operation; asking
//! for more either jams the transport path or silently truncates. The
//! planner takes the solver's plan and the configured per-operation limit
//! and produces an ordered batch sequence whose concatenation reproduces
//! the plan exactly.
//!
//! The limit is an `Option<NonZeroU32>`: absent means "the mechanism has
//! no per-operation bound" and the whole plan ships as one batch. A zero
//! limit is a configuration error and is made unrepresentable here; the
//! session layer rejects it before any hardware command is issued.

use cashpoint_core::{Batch, DispensePlan, batch_from_counts};
use std::num::NonZeroU32;
use tracing::trace;

/// Split `plan` into batches of at most `limit` notes each.
///
/// Without a limit the entire plan is a single batch. With a limit, each
/// batch takes per denomination (ascending face value, a fixed stable
/// order) as many notes as fit in the remaining batch capacity, until
/// every denomination is exhausted. Only the final batch may be
/// under-full.
///
/// An empty plan yields an empty sequence; there is nothing to ask the
/// mechanism for.
///
/// # Examples
///
/// ```
/// use cashpoint_core::DispensePlan;
/// use cashpoint_dispense::plan_batches;
/// use std::num::NonZeroU32;
///
/// let plan: DispensePlan = [(2000u64, 54u32), (10000, 12)].into_iter().collect();
/// let batches = plan_batches(&plan, NonZeroU32::new(20));
///
/// assert_eq!(batches.len(), 4);
/// assert!(batches.iter().all(|b| b.note_count() <= 20));
///
/// let total: u32 = batches.iter().map(|b| b.note_count()).sum();
/// assert_eq!(total, 66);
/// ```
#[must_use]
pub fn plan_batches(plan: &DispensePlan, limit: Option<NonZeroU32>) -> Vec<Batch> {
    if plan.is_empty() {
        return Vec::new();
    }

    let Some(limit) = limit else {
        return vec![batch_from_counts(plan.iter())];
    };
    let limit = limit.get();

    let mut remaining: Vec<(u64, u32)> = plan.iter().collect();
    let mut batches = Vec::new();

    while remaining.iter().any(|(_, count)| *count > 0) {
        let mut capacity = limit;
        let mut taken: Vec<(u64, u32)> = Vec::new();

        for (face, count) in remaining.iter_mut() {
            if capacity == 0 {
                break;
            }
            let take = (*count).min(capacity);
            if take > 0 {
                taken.push((*face, take));
                *count -= take;
                capacity -= take;
            }
        }

        trace!(batch = batches.len(), notes = limit - capacity, "planned batch");
        batches.push(batch_from_counts(taken));
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn plan(counts: &[(u64, u32)]) -> DispensePlan {
        counts.iter().copied().collect()
    }

    /// Multiset sum of a batch sequence, for partition checks.
    fn recombine(batches: &[Batch]) -> DispensePlan {
        let mut total = DispensePlan::new();
        for batch in batches {
            for (face, count) in batch.plan().iter() {
                total.add_notes(face, count);
            }
        }
        total
    }

    #[test]
    fn no_limit_is_the_identity() {
        let p = plan(&[(2000, 2), (10000, 6)]);
        let batches = plan_batches(&p, None);
        assert_eq!(batches.len(), 1);
        assert_eq!(*batches[0].plan(), p);
    }

    #[test]
    fn splits_across_batches_at_the_limit() {
        let p = plan(&[(2000, 54), (10000, 12)]);
        let batches = plan_batches(&p, NonZeroU32::new(20));

        assert_eq!(batches.len(), 4);
        for batch in &batches {
            assert!(batch.note_count() <= 20);
        }
        assert_eq!(recombine(&batches), p);

        // First batches fill to capacity from the smaller denomination.
        assert_eq!(batches[0].note_count(), 20);
        assert_eq!(batches[0].plan().count_of(2000), 20);
        // The crossover batch mixes denominations.
        assert_eq!(batches[2].plan().count_of(2000), 14);
        assert_eq!(batches[2].plan().count_of(10000), 6);
        // Only the final batch is under-full.
        assert_eq!(batches[3].note_count(), 6);
    }

    #[rstest]
    #[case(&[(500, 1)], 5, 1)]
    #[case(&[(500, 5)], 5, 1)]
    #[case(&[(500, 6)], 5, 2)]
    #[case(&[(500, 10), (1000, 10)], 7, 3)]
    fn batch_count_matches_capacity(
        #[case] counts: &[(u64, u32)],
        #[case] limit: u32,
        #[case] expected_batches: usize,
    ) {
        let p = plan(counts);
        let batches = plan_batches(&p, NonZeroU32::new(limit));
        assert_eq!(batches.len(), expected_batches);
        assert_eq!(recombine(&batches), p);
        for batch in &batches {
            assert!(batch.note_count() <= limit);
        }
    }

    #[test]
    fn empty_plan_yields_no_batches() {
        assert!(plan_batches(&DispensePlan::new(), None).is_empty());
        assert!(plan_batches(&DispensePlan::new(), NonZeroU32::new(10)).is_empty());
    }

    #[test]
    fn single_denomination_under_capacity_is_one_batch() {
        let p = plan(&[(10000, 3)]);
        let batches = plan_batches(&p, NonZeroU32::new(20));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].note_count(), 3);
    }

    #[test]
    fn limit_of_one_emits_one_note_per_batch() {
        let p = plan(&[(500, 2), (2000, 1)]);
        let batches = plan_batches(&p, NonZeroU32::new(1));
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert_eq!(batch.note_count(), 1);
        }
        assert_eq!(recombine(&batches), p);
    }
}
