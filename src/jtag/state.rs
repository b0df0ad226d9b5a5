//! The IEEE 1149.1 TAP controller and the TMS sequences used to move it.
use super::JtagError;

/// The 16 states of a TAP controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapState {
    Reset,
    Idle,
    DrSelect,
    DrCapture,
    DrShift,
    DrExit1,
    DrPause,
    DrExit2,
    DrUpdate,
    IrSelect,
    IrCapture,
    IrShift,
    IrExit1,
    IrPause,
    IrExit2,
    IrUpdate,
}

impl TapState {
    pub const ALL: [TapState; 16] = [
        TapState::Reset,
        TapState::Idle,
        TapState::DrSelect,
        TapState::DrCapture,
        TapState::DrShift,
        TapState::DrExit1,
        TapState::DrPause,
        TapState::DrExit2,
        TapState::DrUpdate,
        TapState::IrSelect,
        TapState::IrCapture,
        TapState::IrShift,
        TapState::IrExit1,
        TapState::IrPause,
        TapState::IrExit2,
        TapState::IrUpdate,
    ];

    /// State after one TCK with the given TMS level.
    pub const fn next(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (Reset, false) => Idle,
            (Reset, true) => Reset,
            (Idle, false) => Idle,
            (Idle, true) => DrSelect,
            (DrSelect, false) => DrCapture,
            (DrSelect, true) => IrSelect,
            (DrCapture, false) | (DrShift, false) | (DrExit2, false) => DrShift,
            (DrCapture, true) | (DrShift, true) => DrExit1,
            (DrExit1, false) | (DrPause, false) => DrPause,
            (DrExit1, true) | (DrExit2, true) => DrUpdate,
            (DrPause, true) => DrExit2,
            (DrUpdate, false) | (IrUpdate, false) => Idle,
            (DrUpdate, true) | (IrUpdate, true) => DrSelect,
            (IrSelect, false) => IrCapture,
            (IrSelect, true) => Reset,
            (IrCapture, false) | (IrShift, false) | (IrExit2, false) => IrShift,
            (IrCapture, true) | (IrShift, true) => IrExit1,
            (IrExit1, false) | (IrPause, false) => IrPause,
            (IrExit1, true) | (IrExit2, true) => IrUpdate,
            (IrPause, true) => IrExit2,
        }
    }

    pub const fn is_shift(self) -> bool {
        matches!(self, TapState::DrShift | TapState::IrShift)
    }
}

/// A TMS sequence, clocked out starting from the LSB of `bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmsPath {
    pub bits: u8,
    pub len: usize,
}

impl TmsPath {
    pub const EMPTY: TmsPath = TmsPath { bits: 0, len: 0 };
    /// Reaches RESET from anywhere, stale tracking included.
    pub const RESET: TmsPath = TmsPath {
        bits: 0b11_1111,
        len: 6,
    };

    const fn new(bits: u8, len: usize) -> Self {
        TmsPath { bits, len }
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replay the sequence on a state.
    pub fn walk(&self, mut state: TapState) -> TapState {
        for i in 0..self.len {
            state = state.next(self.bits >> i & 1 == 1);
        }
        state
    }
}

/// TMS sequence from `from` to `to`.
///
/// Only the moves a scan needs are routed; anything else has to go through
/// IDLE first.
pub fn path(from: TapState, to: TapState) -> Result<TmsPath, JtagError> {
    use TapState::*;
    // bits are written lsb first: 0b00110 clocks 0, 1, 1, 0, 0
    let path = match (from, to) {
        (_, Reset) => TmsPath::RESET,
        (from, to) if from == to => TmsPath::EMPTY,
        (Reset, Idle) => TmsPath::new(0b0, 1),
        (Reset, IrShift) => TmsPath::new(0b00110, 5),
        (Reset, DrShift) => TmsPath::new(0b0010, 4),
        (Idle, IrShift) => TmsPath::new(0b0011, 4),
        (Idle, DrShift) => TmsPath::new(0b001, 3),
        (IrShift, Idle) | (DrShift, Idle) | (IrPause, Idle) | (DrPause, Idle) => {
            TmsPath::new(0b011, 3)
        }
        (IrShift, IrPause) | (DrShift, DrPause) => TmsPath::new(0b01, 2),
        (IrPause, IrShift) | (DrPause, DrShift) => TmsPath::new(0b01, 2),
        (IrPause, DrShift) => TmsPath::new(0b00111, 5),
        (DrPause, IrShift) => TmsPath::new(0b001111, 6),
        (from, to) => return Err(JtagError::Routing { from, to }),
    };
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::{TapState, TmsPath, path};
    use itertools::iproduct;

    /// Render as the TMS levels in clock order.
    fn clocked(path: TmsPath) -> String {
        (0..path.len)
            .map(|i| if path.bits >> i & 1 == 1 { '1' } else { '0' })
            .collect()
    }

    #[test]
    fn routed_paths_match_table() {
        use TapState::*;
        let table = [
            (Reset, Idle, "0"),
            (Reset, IrShift, "01100"),
            (Reset, DrShift, "0100"),
            (Idle, IrShift, "1100"),
            (Idle, DrShift, "100"),
            (IrShift, Idle, "110"),
            (IrShift, IrPause, "10"),
            (DrShift, Idle, "110"),
            (DrShift, DrPause, "10"),
            (IrPause, Idle, "110"),
            (IrPause, IrShift, "10"),
            (IrPause, DrShift, "11100"),
            (DrPause, Idle, "110"),
            (DrPause, DrShift, "10"),
            (DrPause, IrShift, "111100"),
        ];
        for (from, to, tms) in table {
            let path = path(from, to).unwrap();
            assert_eq!(clocked(path), tms, "{from:?} -> {to:?}");
            assert_eq!(path.walk(from), to, "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn every_pair_routes_correctly_or_fails() {
        for (from, to) in iproduct!(TapState::ALL, TapState::ALL) {
            match path(from, to) {
                Ok(path) => {
                    assert!(path.len <= 6);
                    assert_eq!(path.walk(from), to, "{from:?} -> {to:?}");
                    if to == TapState::Reset {
                        assert_eq!(path, TmsPath::RESET);
                    } else if from == to {
                        assert!(path.is_empty());
                    }
                }
                Err(err) => assert!(
                    err.to_string().contains(&format!("{from:?}")),
                    "{err}"
                ),
            }
        }
    }

    #[test]
    fn reset_sequence_recovers_from_any_state() {
        for state in TapState::ALL {
            assert_eq!(TmsPath::RESET.walk(state), TapState::Reset);
        }
    }

    #[test]
    fn unrouted_pair_is_an_error() {
        assert!(path(TapState::Idle, TapState::DrPause).is_err());
        assert!(path(TapState::IrUpdate, TapState::DrShift).is_err());
    }
}
