use super::{Family, TapState};
use crate::FtdiError;

#[derive(Debug, thiserror::Error)]
pub enum JtagError {
    #[error("Ftdi inner error")]
    Ftdi(#[from] FtdiError),

    #[error("Invalid argument: {0}")]
    /// A primitive was called with arguments it cannot honour. Never retried.
    InvalidArgument(String),

    #[error("Batch discarded after an earlier failure: {0}")]
    Poisoned(String),

    #[error("No TMS route from {from:?} to {to:?}, go through Idle")]
    Routing { from: TapState, to: TapState },

    #[error("Scan chain is empty.")]
    NoDevices,

    #[error("Scan chain holds more than {0} devices.")]
    ChainTooLong(usize),

    #[error("Device {position} returned {idcode:#010x}, which is not an idcode.")]
    InvalidDevice { position: usize, idcode: u32 },

    #[error("Device {position} has unknown idcode {idcode:#010x}.")]
    UnknownDevice { position: usize, idcode: u32 },

    #[error("No device at chain position {0}.")]
    NoSuchDevice(usize),

    #[error("No device with idcode {0:#010x} on the chain.")]
    IdcodeNotFound(u32),

    #[error("No {0} device on the chain.")]
    FamilyNotFound(Family),

    #[error("{count} {family} devices on the chain, selection is ambiguous.")]
    AmbiguousFamily { family: Family, count: usize },
}
