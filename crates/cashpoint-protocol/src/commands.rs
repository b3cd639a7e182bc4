//! Command codes understood by cash units.
//!
//! One code space covers both device classes; validators simply reject
//! dispenser-only commands with a `NEG` response and vice versa. The byte
//! values are the printable mnemonics the reference units use, which makes
//! serial captures readable.

use cashpoint_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Command byte carried at the CMD position of a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandCode {
    /// Reset the mechanism to its idle position.
    Reset = 0x52,

    /// Report the current device status byte and fault flags.
    Status = 0x53,

    /// Allow the validator to accept notes.
    Enable = 0x45,

    /// Stop accepting notes once the current read (if any) completes.
    Disable = 0x44,

    /// Commit the escrowed note to the stacker.
    Stack = 0x4B,

    /// Return the escrowed note to the customer.
    Return = 0x42,

    /// Feed notes from the cassettes; payload carries per-cassette counts.
    Dispense = 0x57,

    /// Eject residual cash left in the transport path or shutter.
    Purge = 0x47,

    /// Program the cassette-to-denomination mapping.
    SetCassettes = 0x43,

    /// Present fed notes to the customer (recycler shutter).
    Present = 0x4F,

    /// Pull presented but untaken notes back in and close the shutter.
    Retract = 0x54,

    /// Pass the operator licence token through to the device.
    VerifyLicense = 0x4C,

    /// Query the denomination table the validator recognizes.
    QueryDenominations = 0x51,
}

impl CommandCode {
    /// Parse a command byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCommandCode`] for bytes outside the command
    /// set.
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            0x52 => Ok(Self::Reset),
            0x53 => Ok(Self::Status),
            0x45 => Ok(Self::Enable),
            0x44 => Ok(Self::Disable),
            0x4B => Ok(Self::Stack),
            0x42 => Ok(Self::Return),
            0x57 => Ok(Self::Dispense),
            0x47 => Ok(Self::Purge),
            0x43 => Ok(Self::SetCassettes),
            0x4F => Ok(Self::Present),
            0x54 => Ok(Self::Retract),
            0x4C => Ok(Self::VerifyLicense),
            0x51 => Ok(Self::QueryDenominations),
            other => Err(Error::InvalidCommandCode { code: other }),
        }
    }

    /// The wire byte for this command.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable command name for logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Reset => "Reset",
            Self::Status => "Status",
            Self::Enable => "Enable",
            Self::Disable => "Disable",
            Self::Stack => "Stack",
            Self::Return => "Return",
            Self::Dispense => "Dispense",
            Self::Purge => "Purge",
            Self::SetCassettes => "SetCassettes",
            Self::Present => "Present",
            Self::Retract => "Retract",
            Self::VerifyLicense => "VerifyLicense",
            Self::QueryDenominations => "QueryDenominations",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
