use super::regs::CtrlStat;
use crate::jtag::JtagError;

#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("Jtag error: {0}")]
    Jtag(#[from] JtagError),

    #[error("Address {addr:#010x} is not word aligned.")]
    Misaligned { addr: u32 },

    #[error("Length {0} is not a whole number of words or runs past the address space.")]
    BadLength(usize),

    #[error("Target kept answering WAIT.")]
    /// The retry budget ran out. The transaction may still complete later;
    /// issue an abort before relying on the DP again.
    Timeout,

    #[error("Unexpected ACK {ack:#05b}")]
    ProtocolFault { ack: u8 },

    #[error("Sticky error flags set: {0:?}")]
    /// A previous access failed on the AP side. Cleared by
    /// [`Dap::attach`](super::Dap::attach).
    Sticky(CtrlStat),

    #[error("Debug and system power-up were never acknowledged.")]
    AttachTimeout,

    #[error("Target busy during block transfer at {addr:#010x}.")]
    Busy { addr: u32 },
}
