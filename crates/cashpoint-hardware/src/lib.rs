//! Device drivers and state machines for cash units.
//!
//! Two device classes sit on top of the framed transport:
//!
//! - [`validator`]: the bill validator driver and its explicit state
//!   machine — a pure transition function over a tagged state enum, so
//!   accept/reject/stack events are never misattributed and every
//!   transition is unit-testable without hardware.
//! - [`dispenser`]: the dispenser/recycler driver — licence
//!   verification, residual-cash purge, cassette programming, and the
//!   per-batch dispense cycle with present/retract choreography.
//!
//! [`traits`] defines the capability surface the session layer consumes,
//! and [`mock`] provides a scripted cash unit speaking the real wire
//! protocol over an in-memory pipe for tests.

pub mod dispenser;
pub mod error;
pub mod events;
pub mod mock;
pub mod traits;
pub mod validator;

pub use dispenser::{Cassette, CassetteLayout, DeviceClass, Dispenser, DispenserStatus};
pub use error::{DeviceError, Result};
pub use events::{DomainEvent, RejectReason, ValidatorInput};
pub use traits::{NoteAcceptor, NoteDispenser};
pub use validator::{DisableAction, Validator, ValidatorState, ValidatorStateMachine};
