//! JTAG scans on top of a batching [`Transport`].
//!
//! [`Jtag`] tracks the TAP state, routes between states with the shortest
//! supported TMS sequence and shifts the IR and DR of the selected device,
//! padding the registers of the other devices on the chain.
mod chain;
mod devices;
mod error;
mod register;
mod state;

pub use chain::{Device, MAX_DEVICES};
pub use devices::{DEVICES, DeviceInfo, Family, lookup};
pub use error::JtagError;
pub use register::{Padding, ScanRegister};
pub use state::{TapState, TmsPath, path};

use crate::transport::{CaptureId, Captures, Transport};
use register::bit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reg {
    Ir,
    Dr,
}

/// A JTAG session exclusively owning its transport.
pub struct Jtag<T: Transport> {
    transport: T,
    state: TapState,
    /// The tracked state may not match the TAP, e.g. after a failed commit.
    /// The next move goes through RESET first.
    stale: bool,
    ir: ScanRegister,
    dr: ScanRegister,
    devices: Vec<Device>,
}

impl<T: Transport> Jtag<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: TapState::Reset,
            stale: true,
            ir: ScanRegister::ir(),
            dr: ScanRegister::dr(),
            devices: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Tracked TAP state, as of the end of the queued batch.
    pub fn state(&self) -> TapState {
        self.state
    }

    pub fn ir(&self) -> &ScanRegister {
        &self.ir
    }

    pub fn dr(&self) -> &ScanRegister {
        &self.dr
    }

    /// Queue the TMS sequence that moves the TAP to `to`.
    pub fn goto(&mut self, to: TapState) -> Result<(), JtagError> {
        let from = if self.stale {
            TapState::Reset
        } else {
            self.state
        };
        let route = path(from, to)?;
        if self.stale && to != TapState::Reset {
            self.transport
                .scan_tms(false, TmsPath::RESET.len, TmsPath::RESET.bits, None)?;
        }
        if !route.is_empty() {
            self.transport.scan_tms(false, route.len, route.bits, None)?;
        }
        self.state = to;
        self.stale = false;
        Ok(())
    }

    fn scan(
        &mut self,
        reg: Reg,
        count: usize,
        tdi: Option<&[u8]>,
        capture: bool,
    ) -> Result<Option<CaptureId>, JtagError> {
        if count == 0 {
            return Err(JtagError::InvalidArgument("zero-length scan".to_string()));
        }
        if let Some(bits) = tdi {
            if bits.len() * 8 < count {
                return Err(JtagError::InvalidArgument(format!(
                    "{} bytes cannot supply a {count} bit scan",
                    bits.len()
                )));
            }
        }
        let (scan_state, idle_state) = match reg {
            Reg::Ir => (self.ir.scan_state, self.ir.idle_state),
            Reg::Dr => (self.dr.scan_state, self.dr.idle_state),
        };
        let exit = path(scan_state, idle_state)?;
        if exit.is_empty() {
            return Err(JtagError::InvalidArgument(format!(
                "{idle_state:?} cannot be both scan and idle state"
            )));
        }
        self.goto(scan_state)?;

        let capture = capture.then(|| self.transport.alloc_capture(count));
        let register = match reg {
            Reg::Ir => &self.ir,
            Reg::Dr => &self.dr,
        };
        let (prefix, postfix) = (&register.prefix, &register.postfix);
        if !prefix.is_empty() {
            self.transport
                .scan_io(prefix.count(), Some(prefix.bits()), None)?;
        }
        if postfix.is_empty() {
            // the last payload bit goes out with the first tms bit of the exit
            self.transport.scan_io(count - 1, tdi, capture)?;
            let last = tdi.is_some_and(|bits| bit(bits, count - 1));
            self.transport.scan_tms(
                last,
                exit.len,
                exit.bits,
                capture.map(|id| (id, count - 1)),
            )?;
        } else {
            self.transport.scan_io(count, tdi, capture)?;
            self.transport
                .scan_io(postfix.count() - 1, Some(postfix.bits()), None)?;
            self.transport
                .scan_tms(postfix.last_bit(), exit.len, exit.bits, None)?;
        }
        self.state = idle_state;
        Ok(capture)
    }

    /// Shift `count` bits of `bits` into the IR.
    pub fn ir_wr(&mut self, count: usize, bits: &[u8]) -> Result<(), JtagError> {
        self.scan(Reg::Ir, count, Some(bits), false).map(drop)
    }

    /// Shift `count` bits out of the IR.
    pub fn ir_rd(&mut self, count: usize) -> Result<CaptureId, JtagError> {
        self.scan_captured(Reg::Ir, count, None)
    }

    pub fn ir_io(&mut self, count: usize, bits: &[u8]) -> Result<CaptureId, JtagError> {
        self.scan_captured(Reg::Ir, count, Some(bits))
    }

    pub fn dr_wr(&mut self, count: usize, bits: &[u8]) -> Result<(), JtagError> {
        self.scan(Reg::Dr, count, Some(bits), false).map(drop)
    }

    pub fn dr_rd(&mut self, count: usize) -> Result<CaptureId, JtagError> {
        self.scan_captured(Reg::Dr, count, None)
    }

    pub fn dr_io(&mut self, count: usize, bits: &[u8]) -> Result<CaptureId, JtagError> {
        self.scan_captured(Reg::Dr, count, Some(bits))
    }

    fn scan_captured(
        &mut self,
        reg: Reg,
        count: usize,
        tdi: Option<&[u8]>,
    ) -> Result<CaptureId, JtagError> {
        let capture = self.scan(reg, count, tdi, true)?;
        capture.ok_or_else(|| JtagError::InvalidArgument("scan captured nothing".to_string()))
    }

    /// Run the queued scans.
    pub fn commit(&mut self) -> Result<Captures, JtagError> {
        let result = self.transport.commit();
        if let Err(err) = &result {
            log::debug!("commit failed, resynchronising TAP: {err}");
            self.stale = true;
        }
        result
    }

    /// Drop the queued scans.
    pub fn discard(&mut self) {
        self.transport.discard();
        self.stale = true;
    }

    pub fn set_speed(&mut self, khz: u32) -> Result<u32, JtagError> {
        self.transport.set_speed(khz)
    }

    /// State the TAP settles in after an IR scan. Default [`TapState::Idle`].
    pub fn set_ir_idle(&mut self, state: TapState) {
        self.ir.idle_state = state;
    }

    pub fn set_dr_idle(&mut self, state: TapState) {
        self.dr.idle_state = state;
    }

    pub fn set_ir_prefix(&mut self, count: usize, bits: &[u8]) {
        self.ir.prefix = Padding::new(count, bits);
    }

    pub fn set_ir_postfix(&mut self, count: usize, bits: &[u8]) {
        self.ir.postfix = Padding::new(count, bits);
    }

    pub fn set_dr_prefix(&mut self, count: usize, bits: &[u8]) {
        self.dr.prefix = Padding::new(count, bits);
    }

    pub fn set_dr_postfix(&mut self, count: usize, bits: &[u8]) {
        self.dr.postfix = Padding::new(count, bits);
    }

    /// Forget device selection and idle states.
    pub fn reset_registers(&mut self) {
        self.ir = ScanRegister::ir();
        self.dr = ScanRegister::dr();
    }

    pub fn close(self) -> Result<(), JtagError> {
        self.transport.close()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Jtag, TapState};
    use crate::{
        ChipType,
        mpsse::{Cable, MpsseDriver},
        sim::{SimLink, SimTap},
    };

    pub(crate) fn jtag(chain: Vec<SimTap>) -> Jtag<MpsseDriver<SimLink>> {
        let _ = env_logger::builder().is_test(true).try_init();
        let link = SimLink::new(chain);
        Jtag::new(MpsseDriver::new(link, ChipType::FT2232H, Cable::default()).unwrap())
    }

    #[test]
    fn goto_same_state_twice_queues_nothing() {
        let mut jtag = jtag(vec![SimTap::fpga(0x0372_7093)]);
        jtag.goto(TapState::Idle).unwrap();
        jtag.commit().unwrap();
        let before = jtag.transport().link().tck_count();
        jtag.goto(TapState::DrPause).unwrap_err();
        jtag.goto(TapState::Idle).unwrap();
        jtag.commit().unwrap();
        assert_eq!(jtag.transport().link().tck_count(), before);
        assert_eq!(jtag.transport().link().tap_state(), TapState::Idle);
    }

    #[test]
    fn first_move_resets_the_tap() {
        let mut jtag = jtag(vec![SimTap::fpga(0x0372_7093)]);
        jtag.transport_mut().link_mut().force_state(TapState::IrPause);
        jtag.goto(TapState::DrShift).unwrap();
        jtag.commit().unwrap();
        assert_eq!(jtag.transport().link().tap_state(), TapState::DrShift);
        assert_eq!(jtag.transport().link().tck_count(), 6 + 4);
    }

    #[test]
    fn idcode_scan_without_padding() {
        let mut jtag = jtag(vec![SimTap::fpga(0x1372_7093)]);
        jtag.goto(TapState::Reset).unwrap();
        let id = jtag.dr_rd(32).unwrap();
        let captures = jtag.commit().unwrap();
        assert_eq!(captures.u32(id), 0x1372_7093);
        assert_eq!(jtag.state(), TapState::Idle);
    }

    #[test]
    fn reads_decode_in_queue_order_around_writes() {
        let mut jtag = jtag(vec![SimTap::fpga(0x0372_7093)]);
        // USERCODE, IDCODE and BYPASS captures with writes in between
        jtag.ir_wr(6, &[0x08]).unwrap();
        let user = jtag.dr_io(32, &[0; 4]).unwrap();
        jtag.ir_wr(6, &[0x09]).unwrap();
        let idcode = jtag.dr_io(32, &[0; 4]).unwrap();
        jtag.ir_wr(6, &[0x3F]).unwrap();
        let bypass = jtag.dr_io(8, &[0xA5]).unwrap();
        let captures = jtag.commit().unwrap();
        assert_eq!(captures.u32(user), crate::sim::USERCODE);
        assert_eq!(captures.u32(idcode), 0x0372_7093);
        // bypass delays by one bit, starting from the captured zero
        assert_eq!(captures[bypass], [0x4A]);
    }

    #[test]
    fn ir_capture_reads_01_pattern() {
        let mut jtag = jtag(vec![SimTap::fpga(0x0372_7093)]);
        let ir = jtag.ir_io(6, &[0x09]).unwrap();
        let captures = jtag.commit().unwrap();
        assert_eq!(captures[ir][0] & 0b11, 0b01);
    }

    #[test]
    fn dr_pause_settle_state() {
        let mut jtag = jtag(vec![SimTap::fpga(0x0372_7093)]);
        jtag.set_dr_idle(TapState::DrPause);
        jtag.ir_wr(6, &[0x09]).unwrap();
        let first = jtag.dr_rd(32).unwrap();
        assert_eq!(jtag.state(), TapState::DrPause);
        // pause -> shift does not capture again: the zeros held on tdi
        // during the first read come back out
        let second = jtag.dr_rd(32).unwrap();
        let captures = jtag.commit().unwrap();
        assert_eq!(captures.u32(first), 0x0372_7093);
        assert_eq!(captures.u32(second), 0);
        assert_eq!(jtag.transport().link().tap_state(), TapState::DrPause);
    }

    #[test]
    fn zero_length_and_short_buffers_are_rejected() {
        let mut jtag = jtag(vec![SimTap::fpga(0x0372_7093)]);
        assert!(jtag.dr_wr(0, &[]).is_err());
        assert!(jtag.dr_wr(9, &[0xFF]).is_err());
        assert!(jtag.commit().is_ok());
    }

    #[test]
    fn failed_commit_resynchronises_through_reset() {
        let mut jtag = jtag(vec![SimTap::fpga(0x0372_7093)]);
        jtag.ir_wr(6, &[0x08]).unwrap();
        jtag.commit().unwrap();
        jtag.dr_wr(32, &[0; 4]).unwrap();
        jtag.transport_mut().link_mut().fail_next_write();
        assert!(jtag.commit().is_err());
        let id = jtag.dr_rd(32).unwrap();
        let captures = jtag.commit().unwrap();
        // the reset put IDCODE back into the IR
        assert_eq!(captures.u32(id), 0x0372_7093);
    }
}
