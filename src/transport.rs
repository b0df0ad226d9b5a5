//! The capability the JTAG layer needs from a probe driver.
//!
//! Scan primitives are queued and only run on [`Transport::commit`]. Reads
//! land in capture buffers owned by the driver: a primitive names the buffer
//! by [`CaptureId`], and the filled buffers come back from `commit` as
//! [`Captures`].

use crate::jtag::JtagError;
use std::ops::Index;

/// Handle to one capture buffer of the current batch.
///
/// Only meaningful for the [`Captures`] returned by the commit that closes
/// the batch it was allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureId(usize);

/// Filled capture buffers of a committed batch. Bit `n` of a buffer is bit
/// `n & 7` of byte `n >> 3`, in the order the bits left TDO.
#[derive(Debug, Default)]
pub struct Captures {
    bufs: Vec<Vec<u8>>,
}
impl Captures {
    /// Reserve a zeroed buffer large enough for `bits` bits.
    pub(crate) fn alloc(&mut self, bits: usize) -> CaptureId {
        self.bufs.push(vec![0; bits.div_ceil(8)]);
        CaptureId(self.bufs.len() - 1)
    }

    pub(crate) fn bytes_mut(&mut self, id: CaptureId) -> &mut [u8] {
        &mut self.bufs[id.0]
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Little-endian value of the first (up to) 8 bytes of a buffer.
    pub fn u64(&self, id: CaptureId) -> u64 {
        let mut word = [0; 8];
        let bytes = &self[id];
        let n = bytes.len().min(8);
        word[..n].copy_from_slice(&bytes[..n]);
        u64::from_le_bytes(word)
    }

    pub fn u32(&self, id: CaptureId) -> u32 {
        self.u64(id) as u32
    }
}
impl Index<CaptureId> for Captures {
    type Output = [u8];
    fn index(&self, id: CaptureId) -> &[u8] {
        &self.bufs[id.0]
    }
}

/// A probe that clocks JTAG.
///
/// Primitives only queue work. When a primitive fails, the batch is poisoned:
/// later primitives are ignored and the next [`commit`](Transport::commit)
/// reports the failure and starts a fresh batch.
pub trait Transport {
    /// Allocate a capture buffer of `bits` bits in the current batch.
    fn alloc_capture(&mut self, bits: usize) -> CaptureId;

    /// Clock `count` (1..=6) TMS bits, LSB first, holding `tdi` on TDI.
    /// With `capture`, the TDO bit sampled on the first clock is stored at
    /// bit offset `.1` of capture `.0`.
    fn scan_tms(
        &mut self,
        tdi: bool,
        count: usize,
        tms: u8,
        capture: Option<(CaptureId, usize)>,
    ) -> Result<(), JtagError>;

    /// Clock `count` bits with TMS low, LSB first. `tdi` supplies the bits to
    /// drive, `tdo` the capture buffer that receives what comes back. At least
    /// one of them is required.
    fn scan_io(
        &mut self,
        count: usize,
        tdi: Option<&[u8]>,
        tdo: Option<CaptureId>,
    ) -> Result<(), JtagError>;

    /// Run the batch and hand back its capture buffers.
    fn commit(&mut self) -> Result<Captures, JtagError>;

    /// Drop the batch without running it.
    fn discard(&mut self);

    /// Set TCK to at most `khz`, returning the frequency actually used.
    fn set_speed(&mut self, khz: u32) -> Result<u32, JtagError>;

    /// Run anything still queued and release the probe.
    fn close(self) -> Result<(), JtagError>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::Captures;

    #[test]
    fn capture_words_are_little_endian() {
        let mut captures = Captures::default();
        let id = captures.alloc(35);
        assert_eq!(captures[id].len(), 5);
        captures
            .bytes_mut(id)
            .copy_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x07]);
        assert_eq!(captures.u64(id), 0x07_7856_3412);
        assert_eq!(captures.u32(id), 0x7856_3412);
        let one = captures.alloc(1);
        assert_eq!(captures[one], [0]);
        assert_eq!(captures.len(), 2);
    }
}
