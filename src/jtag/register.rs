use super::TapState;

/// Bits shifted around the payload of a scan to fill the registers of
/// devices that are not addressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Padding {
    count: usize,
    bits: Vec<u8>,
}

impl Padding {
    pub fn new(count: usize, bits: &[u8]) -> Self {
        let mut bits = bits[..count.div_ceil(8).min(bits.len())].to_vec();
        bits.resize(count.div_ceil(8), 0);
        Self { count, bits }
    }

    /// `count` one bits, which put every bypassed device into BYPASS.
    pub fn ones(count: usize) -> Self {
        Self {
            count,
            bits: vec![0xFF; count.div_ceil(8)],
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Value of the last bit shifted.
    pub(crate) fn last_bit(&self) -> bool {
        bit(&self.bits, self.count - 1)
    }
}

pub(crate) fn bit(bits: &[u8], n: usize) -> bool {
    bits[n >> 3] >> (n & 7) & 1 == 1
}

/// How the IR or the DR is scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRegister {
    pub(crate) prefix: Padding,
    pub(crate) postfix: Padding,
    pub(crate) scan_state: TapState,
    pub(crate) idle_state: TapState,
}

impl ScanRegister {
    pub(crate) fn ir() -> Self {
        Self {
            prefix: Padding::default(),
            postfix: Padding::default(),
            scan_state: TapState::IrShift,
            idle_state: TapState::Idle,
        }
    }

    pub(crate) fn dr() -> Self {
        Self {
            scan_state: TapState::DrShift,
            ..Self::ir()
        }
    }

    pub fn prefix(&self) -> &Padding {
        &self.prefix
    }

    pub fn postfix(&self) -> &Padding {
        &self.postfix
    }

    pub fn scan_state(&self) -> TapState {
        self.scan_state
    }

    pub fn idle_state(&self) -> TapState {
        self.idle_state
    }
}
