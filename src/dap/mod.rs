//! ARM ADIv5 debug port access over JTAG-DP.
//!
//! Every DPACC/APACC transaction is a 35-bit scan whose capture carries the
//! ACK and result of the *previous* transaction. [`Dap`] pairs each request
//! with a DPACC RDBUFF read in the same batch, retries WAIT answers a bounded
//! number of times and checks the sticky flags in CTRL/STAT after AP
//! accesses.
mod error;
mod mem;
mod probe;
pub mod regs;

pub use error::DapError;
pub use probe::{ApInfo, Component, RomEntry, RomTable};
pub use regs::{ApCsw, CtrlStat, Select};

use crate::{
    jtag::Jtag,
    transport::{CaptureId, Captures, Transport},
};
use regs::{
    ACK_OK, ACK_WAIT, DAPABORT, DP_CTRL_STAT, DP_RDBUFF, DP_SELECT, DR_LEN, IR_ABORT, IR_APACC,
    IR_DPACC, IR_LEN,
};

/// Retry budgets of the WAIT and power-up loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DapConfig {
    pub dp_read_retries: usize,
    pub dp_write_retries: usize,
    pub attach_retries: usize,
}
impl Default for DapConfig {
    fn default() -> Self {
        Self {
            dp_read_retries: 30,
            dp_write_retries: 100,
            attach_retries: 100,
        }
    }
}

/// A debug port session on the selected JTAG-DP.
///
/// The JTAG session must already address the DP, e.g. through
/// [`Jtag::select_by_family`] with [`Family::ArmDap`](crate::jtag::Family::ArmDap).
pub struct Dap<T: Transport> {
    jtag: Jtag<T>,
    config: DapConfig,
    /// Instruction last queued, `None` when unknown.
    cached_ir: Option<u8>,
    /// SELECT value last written, `None` when unknown.
    cached_select: Option<u32>,
}

impl<T: Transport> Dap<T> {
    pub fn new(jtag: Jtag<T>) -> Self {
        Self::with_config(jtag, DapConfig::default())
    }

    pub fn with_config(jtag: Jtag<T>, config: DapConfig) -> Self {
        Self {
            jtag,
            config,
            cached_ir: None,
            cached_select: None,
        }
    }

    pub fn jtag(&self) -> &Jtag<T> {
        &self.jtag
    }

    /// Raw JTAG access. Scans made here bypass the DP caches, call
    /// [`invalidate`](Self::invalidate) afterwards.
    pub fn jtag_mut(&mut self) -> &mut Jtag<T> {
        &mut self.jtag
    }

    pub fn into_jtag(self) -> Jtag<T> {
        self.jtag
    }

    pub fn config(&self) -> &DapConfig {
        &self.config
    }

    /// Forget the cached IR and SELECT values.
    pub fn invalidate(&mut self) {
        self.cached_ir = None;
        self.cached_select = None;
    }

    fn queue_ir(&mut self, ir: u8) -> Result<(), DapError> {
        if self.cached_ir != Some(ir) {
            self.queue_ir_always(ir)?;
        }
        Ok(())
    }

    /// IR scan even when the instruction is already loaded. Used for its
    /// idle clocks between streamed AP accesses.
    fn queue_ir_always(&mut self, ir: u8) -> Result<(), DapError> {
        self.jtag.ir_wr(IR_LEN, &[ir])?;
        self.cached_ir = Some(ir);
        Ok(())
    }

    fn queue_scan(&mut self, word: u64) -> Result<CaptureId, DapError> {
        Ok(self.jtag.dr_io(DR_LEN, &word.to_le_bytes()[..5])?)
    }

    /// Queue a CTRL/STAT read and the RDBUFF read returning it. The first
    /// capture holds the ACK of whatever was queued before.
    fn queue_status(&mut self) -> Result<(CaptureId, CaptureId), DapError> {
        self.queue_ir(IR_DPACC)?;
        let request = self.queue_scan(regs::read(DP_CTRL_STAT))?;
        let result = self.queue_scan(regs::read(DP_RDBUFF))?;
        Ok((request, result))
    }

    /// Check a status pair queued by [`queue_status`](Self::queue_status).
    fn check_queued_status(
        &mut self,
        captures: &Captures,
        (request, result): (CaptureId, CaptureId),
    ) -> Result<CtrlStat, DapError> {
        for id in [request, result] {
            let (ack, _) = regs::response(captures.u64(id));
            if ack != ACK_OK {
                self.invalidate();
                return Err(match ack {
                    ACK_WAIT => DapError::Timeout,
                    ack => DapError::ProtocolFault { ack },
                });
            }
        }
        let (_, data) = regs::response(captures.u64(result));
        self.check_sticky(CtrlStat::from_bits(data))
    }

    fn check_sticky(&mut self, ctrl: CtrlStat) -> Result<CtrlStat, DapError> {
        if ctrl.has_sticky() {
            log::warn!("sticky error: {ctrl:?}");
            return Err(DapError::Sticky(ctrl));
        }
        Ok(ctrl)
    }

    /// Queue with `queue`, then commit. A failed queue drops the batch; any
    /// failure leaves both caches unknown.
    fn batch<R>(
        &mut self,
        queue: impl FnOnce(&mut Self) -> Result<R, DapError>,
    ) -> Result<(R, Captures), DapError> {
        let result = match queue(self) {
            Ok(queued) => self
                .jtag
                .commit()
                .map(|captures| (queued, captures))
                .map_err(DapError::from),
            Err(err) => {
                self.jtag.discard();
                Err(err)
            }
        };
        if result.is_err() {
            self.invalidate();
        }
        result
    }

    /// Run `request` under instruction `ir` until the DP accepts and
    /// completes it. Returns the data of the completing RDBUFF read.
    ///
    /// Each attempt is one batch: the request (until its capture shows it
    /// was accepted) followed by an RDBUFF read whose capture holds the
    /// request's own ACK and result.
    fn transfer(&mut self, ir: u8, request: u64, retries: usize) -> Result<u32, DapError> {
        let mut accepted = false;
        for attempt in 0..retries {
            let ((sent, rdbuff), captures) = self.batch(|dap| {
                let sent = if accepted {
                    None
                } else {
                    dap.queue_ir(ir)?;
                    Some(dap.queue_scan(request)?)
                };
                dap.queue_ir(IR_DPACC)?;
                let rdbuff = dap.queue_scan(regs::read(DP_RDBUFF))?;
                Ok((sent, rdbuff))
            })?;
            if let Some(sent) = sent {
                match regs::response(captures.u64(sent)).0 {
                    ACK_OK => accepted = true,
                    ACK_WAIT => {
                        log::trace!("request {request:#011x} WAIT, attempt {attempt}");
                        continue;
                    }
                    ack => {
                        self.invalidate();
                        return Err(DapError::ProtocolFault { ack });
                    }
                }
            }
            match regs::response(captures.u64(rdbuff)) {
                (ACK_OK, data) => return Ok(data),
                (ACK_WAIT, _) => log::trace!("result of {request:#011x} WAIT, attempt {attempt}"),
                (ack, _) => {
                    self.invalidate();
                    return Err(DapError::ProtocolFault { ack });
                }
            }
        }
        log::warn!("request {request:#011x} still WAIT after {retries} attempts");
        Err(DapError::Timeout)
    }

    /// Read a DP register.
    pub fn dp_read(&mut self, addr: u8) -> Result<u32, DapError> {
        self.transfer(IR_DPACC, regs::read(addr), self.config.dp_read_retries)
    }

    /// Write a DP register. Writing SELECT directly invalidates the AP
    /// selection cache.
    pub fn dp_write(&mut self, addr: u8, value: u32) -> Result<(), DapError> {
        if addr == DP_SELECT {
            self.cached_select = None;
        }
        self.transfer(
            IR_DPACC,
            regs::write(addr, value),
            self.config.dp_write_retries,
        )
        .map(drop)
    }

    /// Point SELECT at AP `apnum` and the bank holding `addr`. Skipped when
    /// SELECT already holds that value.
    pub fn ap_select(&mut self, apnum: u8, addr: u8) -> Result<(), DapError> {
        let select = Select::ap(apnum, addr).into_bits();
        if self.cached_select == Some(select) {
            return Ok(());
        }
        self.dp_write(DP_SELECT, select)?;
        self.cached_select = Some(select);
        Ok(())
    }

    /// Read AP register `addr`, then check the sticky flags.
    pub fn ap_read(&mut self, apnum: u8, addr: u8) -> Result<u32, DapError> {
        self.ap_select(apnum, addr)?;
        let value = self.transfer(IR_APACC, regs::read(addr), self.config.dp_read_retries)?;
        self.status()?;
        Ok(value)
    }

    pub fn ap_write(&mut self, apnum: u8, addr: u8, value: u32) -> Result<(), DapError> {
        self.ap_select(apnum, addr)?;
        self.transfer(
            IR_APACC,
            regs::write(addr, value),
            self.config.dp_write_retries,
        )?;
        self.status().map(drop)
    }

    /// Read CTRL/STAT and fail with [`DapError::Sticky`] if an AP access
    /// went wrong since the flags were last cleared.
    pub fn status(&mut self) -> Result<CtrlStat, DapError> {
        let ctrl = CtrlStat::from_bits(self.dp_read(DP_CTRL_STAT)?);
        self.check_sticky(ctrl)
    }

    /// Abort the AP transaction in progress.
    pub fn abort(&mut self) -> Result<(), DapError> {
        let result = self.batch(|dap| {
            dap.queue_ir_always(IR_ABORT)?;
            dap.jtag
                .dr_wr(DR_LEN, &regs::write(0, DAPABORT).to_le_bytes()[..5])?;
            Ok(())
        });
        self.invalidate();
        result.map(drop)
    }

    /// Abort, clear the sticky flags and power up the debug and system
    /// domains, polling until both are acknowledged.
    pub fn attach(&mut self) -> Result<CtrlStat, DapError> {
        self.abort()?;
        let request = CtrlStat::power_up_request().into_bits();
        for _ in 0..self.config.attach_retries {
            // a DP still busy powering up is polled again, not given up on
            let ctrl = match self
                .dp_write(DP_CTRL_STAT, request)
                .and_then(|()| self.dp_read(DP_CTRL_STAT))
            {
                Ok(value) => CtrlStat::from_bits(value),
                Err(err) => {
                    log::debug!("power-up poll failed: {err}");
                    self.invalidate();
                    continue;
                }
            };
            if ctrl.is_powered() && !ctrl.has_sticky() {
                log::info!("DAP attached, CTRL/STAT {:#010x}", ctrl.into_bits());
                return Ok(ctrl);
            }
            log::debug!("waiting for power-up, CTRL/STAT {:#010x}", ctrl.into_bits());
        }
        Err(DapError::AttachTimeout)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Dap, DapConfig, DapError, regs::*};
    use crate::{
        MpsseDriver,
        jtag::{Family, tests::jtag},
        sim::{SimDap, SimLink, SimTap},
    };

    pub(crate) const DAP_IDCODE: u32 = 0x4BA0_0477;

    pub(crate) fn dap() -> Dap<MpsseDriver<SimLink>> {
        let mut jtag = jtag(vec![SimTap::fpga(0x0372_7093), SimTap::dap(DAP_IDCODE)]);
        jtag.enumerate().unwrap();
        jtag.select_by_family(Family::ArmDap).unwrap();
        Dap::new(jtag)
    }

    pub(crate) fn sim(dap: &mut Dap<MpsseDriver<SimLink>>) -> &mut SimDap {
        dap.jtag_mut()
            .transport_mut()
            .link_mut()
            .dap_mut()
            .unwrap()
    }

    fn writes(dap: &Dap<MpsseDriver<SimLink>>) -> usize {
        dap.jtag().transport().link().writes()
    }

    #[test]
    fn dp_write_then_read_echoes() {
        let mut dap = dap();
        dap.dp_write(DP_SELECT, 0x0300_00F0).unwrap();
        assert_eq!(dap.dp_read(DP_SELECT).unwrap(), 0x0300_00F0);
        assert_eq!(sim(&mut dap).select(), 0x0300_00F0);
    }

    #[test]
    fn wait_is_retried() {
        let mut dap = dap();
        dap.dp_write(DP_SELECT, 0x10).unwrap();
        sim(&mut dap).inject_wait(5);
        assert_eq!(dap.dp_read(DP_SELECT).unwrap(), 0x10);
    }

    #[test]
    fn always_wait_times_out_after_read_budget() {
        let mut dap = dap();
        sim(&mut dap).set_always_wait(true);
        let before = writes(&dap);
        assert!(matches!(dap.dp_read(DP_CTRL_STAT), Err(DapError::Timeout)));
        assert_eq!(writes(&dap) - before, 30);

        let mut dap = Dap::with_config(
            dap.into_jtag(),
            DapConfig {
                dp_write_retries: 7,
                ..DapConfig::default()
            },
        );
        let before = writes(&dap);
        assert!(matches!(
            dap.dp_write(DP_SELECT, 0),
            Err(DapError::Timeout)
        ));
        assert_eq!(writes(&dap) - before, 7);
    }

    #[test]
    fn select_is_cached_per_bank() {
        let mut dap = dap();
        dap.ap_read(0, AP_CSW).unwrap();
        dap.ap_read(0, AP_TAR).unwrap();
        assert_eq!(sim(&mut dap).select_writes(), 1);
        dap.ap_read(0, AP_IDR).unwrap();
        assert_eq!(sim(&mut dap).select_writes(), 2);
        dap.ap_read(0, AP_BASE).unwrap();
        assert_eq!(sim(&mut dap).select_writes(), 2);

        // a failed commit forgets the selection
        dap.jtag_mut().transport_mut().link_mut().fail_next_write();
        assert!(matches!(dap.ap_read(0, AP_IDR), Err(DapError::Jtag(_))));
        assert_eq!(dap.ap_read(0, AP_IDR).unwrap(), 0x2477_0011);
        assert_eq!(sim(&mut dap).select_writes(), 3);
    }

    #[test]
    fn raw_select_write_invalidates_cache() {
        let mut dap = dap();
        dap.ap_read(0, AP_IDR).unwrap();
        dap.dp_write(DP_SELECT, 0).unwrap();
        assert_eq!(dap.ap_read(0, AP_IDR).unwrap(), 0x2477_0011);
        assert_eq!(sim(&mut dap).select_writes(), 3);
    }

    #[test]
    fn ap_write_reads_back() {
        let mut dap = dap();
        dap.ap_write(0, AP_TAR, 0x2000_0040).unwrap();
        assert_eq!(dap.ap_read(0, AP_TAR).unwrap(), 0x2000_0040);
        assert_eq!(sim(&mut dap).tar_writes(), [0x2000_0040]);
    }

    #[test]
    fn sticky_flag_fails_access_until_cleared() {
        let mut dap = dap();
        sim(&mut dap).set_fault(0x4000_0000..0x4000_1000);
        dap.ap_write(0, AP_CSW, ApCsw::word_access(CSW_ADDR_INC_OFF).into_bits())
            .unwrap();
        dap.ap_write(0, AP_TAR, 0x4000_0000).unwrap();
        match dap.ap_read(0, AP_DRW) {
            Err(DapError::Sticky(ctrl)) => assert!(ctrl.sticky_err()),
            other => panic!("expected sticky error, got {other:?}"),
        }
        assert!(dap.status().is_err());
        dap.attach().unwrap();
        assert!(!dap.status().unwrap().has_sticky());
    }

    #[test]
    fn attach_powers_up() {
        let mut dap = dap();
        sim(&mut dap).set_power_up_delay(Some(3));
        let ctrl = dap.attach().unwrap();
        assert!(ctrl.csys_pwrup_ack() && ctrl.cdbg_pwrup_ack());
        assert_eq!(sim(&mut dap).aborts(), 1);

        let mut dap = self::dap();
        sim(&mut dap).set_power_up_delay(None);
        assert!(matches!(dap.attach(), Err(DapError::AttachTimeout)));
    }

    #[test]
    fn attach_outlasts_a_long_wait_burst() {
        let mut dap = dap();
        // more than one write's worth of WAIT responses
        sim(&mut dap).inject_wait(250);
        let ctrl = dap.attach().unwrap();
        assert!(ctrl.is_powered());

        let mut dap = Dap::with_config(
            self::dap().into_jtag(),
            DapConfig {
                dp_read_retries: 2,
                dp_write_retries: 2,
                attach_retries: 4,
            },
        );
        sim(&mut dap).set_always_wait(true);
        assert!(matches!(dap.attach(), Err(DapError::AttachTimeout)));
    }

    #[test]
    fn abort_forgets_caches() {
        let mut dap = dap();
        dap.ap_read(0, AP_IDR).unwrap();
        dap.abort().unwrap();
        dap.ap_read(0, AP_IDR).unwrap();
        assert_eq!(sim(&mut dap).select_writes(), 2);
    }
}
