//! Property-based tests for the exact-change solver and batch planner.
//!
//! These use proptest to generate realistic cassette ladders and verify
//! the arithmetic invariants hold across the whole input space: plans are
//! exact, infeasibility is never claimed when a decomposition exists, and
//! batch sequences partition their plan.

use cashpoint_core::{Denomination, DispensePlan};
use cashpoint_dispense::{DenominationModel, SolveOutcome, Solver, plan_batches};
use proptest::prelude::*;
use std::num::NonZeroU32;

/// Strategy for a cassette ladder: up to four denominations where each
/// face value divides the next, the way physical cassette sets are loaded
/// (e.g. 500 / 1000 / 5000 / 10000).
fn cassette_ladder() -> impl Strategy<Value = Vec<(u64, u32)>> {
    let base = prop_oneof![Just(500u64), Just(1000u64), Just(2000u64)];
    let steps = prop::collection::vec(prop_oneof![Just(2u64), Just(5u64), Just(10u64)], 0..3);
    let counts = prop::collection::vec(0u32..20, 4);

    (base, steps, counts).prop_map(|(base, steps, counts)| {
        let mut face = base;
        let mut ladder = Vec::new();
        for (i, count) in counts.iter().enumerate() {
            ladder.push((face, *count));
            face *= steps.get(i).copied().unwrap_or(2);
        }
        ladder
    })
}

/// Small ladder variant for the brute-force cross-check: face values and
/// counts kept low so exhaustive reachability stays cheap.
fn small_ladder() -> impl Strategy<Value = Vec<(u64, u32)>> {
    let base = prop_oneof![Just(5u64), Just(10u64), Just(20u64)];
    let steps = prop::collection::vec(prop_oneof![Just(2u64), Just(5u64)], 0..3);
    let counts = prop::collection::vec(0u32..8, 3);

    (base, steps, counts).prop_map(|(base, steps, counts)| {
        let mut face = base;
        let mut ladder = Vec::new();
        for (i, count) in counts.iter().enumerate() {
            ladder.push((face, *count));
            face *= steps.get(i).copied().unwrap_or(2);
        }
        ladder
    })
}

/// Independent bounded-knapsack reachability check, used to confirm
/// infeasibility claims without trusting the solver's own pruning.
fn reachable(entries: &[(u64, u32)], target: u64) -> bool {
    let target = usize::try_from(target).unwrap();
    let mut hits = vec![false; target + 1];
    hits[0] = true;
    for (face, count) in entries {
        let face = usize::try_from(*face).unwrap();
        for _ in 0..*count {
            for value in (face..=target).rev() {
                if hits[value - face] {
                    hits[value] = true;
                }
            }
        }
    }
    hits[target]
}

fn build_solver(entries: &[(u64, u32)]) -> Solver {
    let denominations: Vec<Denomination> = entries
        .iter()
        .map(|(face, count)| Denomination::new(*face, *count).unwrap())
        .collect();
    Solver::new(DenominationModel::prepare(&denominations))
}

proptest! {
    /// Property: every plan the solver returns sums to the target exactly.
    #[test]
    fn prop_plans_are_exact(ladder in cassette_ladder(), seed in 0u64..10_000) {
        let mut solver = build_solver(&ladder);
        let stock: u64 = ladder.iter().map(|(f, c)| f * u64::from(*c)).sum();
        let target = if stock == 0 { 0 } else { (seed * 500) % (stock + 500) };

        if let SolveOutcome::Plan(plan) = solver.solve(target) {
            prop_assert_eq!(plan.total_value(), target);
            // The plan never spends notes the cassettes do not hold.
            for (face, count) in plan.iter() {
                let available: u32 = ladder
                    .iter()
                    .filter(|(f, _)| *f == face)
                    .map(|(_, c)| *c)
                    .sum();
                prop_assert!(count <= available);
            }
        }
    }

    /// Property: infeasible is only reported when no decomposition exists.
    #[test]
    fn prop_infeasibility_is_genuine(ladder in small_ladder(), seed in 0u64..2_000) {
        let mut solver = build_solver(&ladder);
        let stock: u64 = ladder.iter().map(|(f, c)| f * u64::from(*c)).sum();
        let target = if stock == 0 { 0 } else { (seed * 5) % (stock + 5) };

        if solver.solve(target) == SolveOutcome::Infeasible {
            prop_assert!(!reachable(&ladder, target));
        }
    }

    /// Property: a batch sequence partitions its plan and respects the
    /// mechanical limit.
    #[test]
    fn prop_batches_partition_the_plan(
        counts in prop::collection::btree_map(
            prop_oneof![Just(500u64), Just(1000u64), Just(2000u64), Just(10_000u64)],
            1u32..120,
            1..4,
        ),
        limit in 1u32..50,
    ) {
        let plan: DispensePlan = counts.into_iter().collect();
        let batches = plan_batches(&plan, NonZeroU32::new(limit));

        let mut recombined = DispensePlan::new();
        for batch in &batches {
            prop_assert!(batch.note_count() <= limit);
            prop_assert!(batch.note_count() > 0);
            for (face, count) in batch.plan().iter() {
                recombined.add_notes(face, count);
            }
        }
        prop_assert_eq!(recombined, plan);
    }

    /// Property: absent limit, the plan ships as a single identical batch.
    #[test]
    fn prop_no_limit_is_identity(
        counts in prop::collection::btree_map(
            prop_oneof![Just(500u64), Just(2000u64)],
            1u32..50,
            1..3,
        ),
    ) {
        let plan: DispensePlan = counts.into_iter().collect();
        let batches = plan_batches(&plan, None);
        prop_assert_eq!(batches.len(), 1);
        prop_assert_eq!(batches[0].plan(), &plan);
    }
}
