//! Domain events and state-machine inputs.
//!
//! Domain events are what the rest of the kiosk observes: a bill was
//! read, accepted, or rejected; the device became ready or went to
//! standby; a fault needs operator attention. They are emitted exactly
//! once per state transition that carries domain meaning and delivered
//! over a `tokio::sync::mpsc` channel, so consumers never register
//! callbacks into the driver.
//!
//! [`ValidatorInput`] is the other direction: everything that can move
//! the validator state machine, whether reported by the device (status
//! notifications) or caused by the driver (link established, reset
//! completed). Keeping both in one enum makes the transition function a
//! single pure match.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the validator rejected a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Note entered at an angle the head could not track.
    Skewed,

    /// Two notes fed together.
    Doubled,

    /// Security features failed verification.
    Suspect,

    /// Pattern not in the recognition table.
    Unrecognized,

    /// Note length outside tolerance.
    LengthError,

    /// Any other device-specific reject code.
    Other,
}

impl RejectReason {
    /// Map a device reject code to a reason bucket.
    ///
    /// Codes follow the reference unit's grouping: the high byte selects
    /// the category, the low byte the detail.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code >> 8 {
            0x01 => Self::Skewed,
            0x02 => Self::Doubled,
            0x03 => Self::Suspect,
            0x04 => Self::Unrecognized,
            0x05 => Self::LengthError,
            _ => Self::Other,
        }
    }
}

/// An observable event produced by a device state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A note was recognized and is held in escrow.
    BillRead { denomination: u64 },

    /// The escrowed note was committed to the stacker.
    BillAccepted { denomination: u64 },

    /// A note was rejected back to the customer.
    BillRejected { reason: RejectReason, code: u16 },

    /// The device is enabled and ready to accept notes.
    Ready,

    /// The device is disabled (standby).
    Standby,

    /// The stacker door is open.
    StackerOpen,

    /// The stacker cannot take further notes.
    StackerFull,

    /// A note is jammed in the acceptor path.
    Jam { code: u16 },
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BillRead { denomination } => write!(f, "bill_read({denomination})"),
            Self::BillAccepted { denomination } => write!(f, "bill_accepted({denomination})"),
            Self::BillRejected { reason, code } => {
                write!(f, "bill_rejected({reason:?}, {code:#06x})")
            }
            Self::Ready => write!(f, "ready"),
            Self::Standby => write!(f, "standby"),
            Self::StackerOpen => write!(f, "stacker_open"),
            Self::StackerFull => write!(f, "stacker_full"),
            Self::Jam { code } => write!(f, "jam({code:#06x})"),
        }
    }
}

/// Everything that can drive the validator state machine forward.
///
/// Driver-caused inputs (`LinkEstablished`, `TableLoaded`,
/// `ResetCompleted`, `Restarted`) mark progress through the bring-up
/// sequence; the rest mirror device status notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatorInput {
    /// The transport answered its first status query.
    LinkEstablished,

    /// The denomination table was read successfully.
    TableLoaded,

    /// The mechanism reset completed.
    ResetCompleted,

    /// The driver restarted the device after a failure.
    Restarted,

    /// Device reports it is enabled.
    Enabled,

    /// Device reports it is disabled.
    Disabled,

    /// Device reports a note entering the acceptor.
    Accepting,

    /// A note was read and is held in escrow.
    Escrow { denomination: u64 },

    /// The escrowed note is being transported to the stacker.
    Stacking,

    /// The note reached the stacker.
    Stacked { denomination: u64 },

    /// The escrowed note is being returned to the customer.
    Returning,

    /// The returned note was taken; the device disables itself.
    Returned,

    /// The note is being rejected with a device code.
    Rejecting { code: u16 },

    /// The stacker door is open.
    StackerOpen,

    /// The stacker is full.
    StackerFull,

    /// A jam in the acceptor path.
    Jam { code: u16 },

    /// A hard device fault.
    Fault { code: u16 },

    /// Persistent framing trouble on the link.
    FrameTrouble,

    /// The device paused itself (e.g. cashbox manipulation).
    Paused,
}

impl ValidatorInput {
    /// Short name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::LinkEstablished => "link_established",
            Self::TableLoaded => "table_loaded",
            Self::ResetCompleted => "reset_completed",
            Self::Restarted => "restarted",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Accepting => "accepting",
            Self::Escrow { .. } => "escrow",
            Self::Stacking => "stacking",
            Self::Stacked { .. } => "stacked",
            Self::Returning => "returning",
            Self::Returned => "returned",
            Self::Rejecting { .. } => "rejecting",
            Self::StackerOpen => "stacker_open",
            Self::StackerFull => "stacker_full",
            Self::Jam { .. } => "jam",
            Self::Fault { .. } => "fault",
            Self::FrameTrouble => "frame_trouble",
            Self::Paused => "paused",
        }
    }
}
