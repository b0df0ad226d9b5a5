use crate::ChipType;

#[derive(Debug, thiserror::Error)]
pub enum FtdiError {
    #[error("A USB transport error occurred.")]
    Usb(#[from] std::io::Error),

    #[error("Open failed: {0}")]
    /// Error occurs when open.
    OpenFailed(String),

    #[error("Unsupported chip type: {0:?}")]
    /// The connected device is not supported by the driver.
    UnsupportedChip(ChipType),

    #[error("USB transfer timed out.")]
    Timeout,

    #[error("Short read: expected {expected} bytes, got {actual}")]
    /// The device stopped answering before the whole response arrived.
    ShortRead { expected: usize, actual: usize },
}
