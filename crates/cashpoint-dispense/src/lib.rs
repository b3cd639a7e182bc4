//! Exact-change arithmetic for the cash-handling core.
//!
//! Two pure, hardware-free pieces live here:
//!
//! - [`solver`]: decomposes a target amount into physical notes drawn from
//!   the available cassette stock, exactly or not at all.
//! - [`planner`]: splits a note plan into mechanically safe batches.
//!
//! Neither module performs I/O; the orchestrator feeds them inventory
//! snapshots and hands their output to the device drivers.

pub mod planner;
pub mod solver;

pub use planner::plan_batches;
pub use solver::{DenominationModel, SolveOutcome, Solver};
