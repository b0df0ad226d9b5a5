//! A software MPSSE probe with a simulated scan chain.
//!
//! [`SimLink`] decodes the command stream the driver writes, clocks every
//! TCK through the TAP state machine of each [`SimTap`] and answers with
//! FTDI-style packets, each led by two modem status bytes. The chain can hold
//! Xilinx 7-series style TAPs with a user debug register file, ARM JTAG-DPs
//! backed by a MEM-AP over sparse memory, and bypass-only devices.
use crate::{
    FtdiError,
    dap::regs::{
        ACK_OK, ACK_WAIT, AP_BASE, AP_CSW, AP_DRW, AP_IDR, AP_TAR, CSW_ADDR_INC_SINGLE, CtrlStat,
        DAPABORT, DP_CTRL_STAT, DP_RDBUFF, DP_SELECT, IR_ABORT, IR_APACC, IR_BYPASS, IR_DPACC,
        IR_IDCODE, ApCsw,
    },
    jtag::TapState,
    mpsse::Link,
    mpsse_cmd::{MpsseCmd, MpsseOp, MpsseOps},
};
use std::{
    collections::{BTreeMap, VecDeque},
    io,
    ops::Range,
};

/// USERCODE register content of simulated FPGAs.
pub const USERCODE: u32 = 0x2B0B_0C0D;

const FPGA_IR_LEN: usize = 6;
const FPGA_IDCODE: u8 = 0x09;
const FPGA_USERCODE: u8 = 0x08;
const FPGA_USER4: u8 = 0x23;
const FPGA_BYPASS: u8 = 0x3F;

const DAP_IR_LEN: usize = 4;

/// Answer to an opcode the engine does not know.
const BAD_COMMAND: u8 = 0xFA;
const MODEM_STATUS: [u8; 2] = [0x32, 0x60];
/// Packets handed out per bulk read.
const PACKETS_PER_READ: usize = 4;

/// Simulated MPSSE probe wired to a scan chain.
///
/// Index 0 of the chain drives TDO, TDI enters the last device.
pub struct SimLink {
    chain: Vec<SimTap>,
    state: TapState,
    /// Level held on TDI when no data is driven.
    tdi: bool,
    tck_count: u64,
    response: VecDeque<u8>,
    packet_size: usize,
    gpio_lower: (u8, u8),
    gpio_upper: (u8, u8),
    clock_divisor: Option<u16>,
    writes: usize,
    max_write: usize,
    fail_next_write: bool,
}

impl SimLink {
    pub fn new(chain: Vec<SimTap>) -> Self {
        Self {
            chain,
            state: TapState::Reset,
            tdi: false,
            tck_count: 0,
            response: VecDeque::new(),
            packet_size: 512,
            gpio_lower: (0, 0),
            gpio_upper: (0, 0),
            clock_divisor: None,
            writes: 0,
            max_write: 0,
            fail_next_write: false,
        }
    }

    /// Value and direction last written to the lower GPIO byte.
    pub fn gpio_lower(&self) -> (u8, u8) {
        self.gpio_lower
    }

    pub fn gpio_upper(&self) -> (u8, u8) {
        self.gpio_upper
    }

    pub fn clock_divisor(&self) -> Option<u16> {
        self.clock_divisor
    }

    /// Bulk writes accepted so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Largest bulk write accepted so far.
    pub fn max_write(&self) -> usize {
        self.max_write
    }

    /// Make the next bulk write fail without reaching the engine.
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    pub fn tck_count(&self) -> u64 {
        self.tck_count
    }

    pub fn tap_state(&self) -> TapState {
        self.state
    }

    /// Move the TAPs to `state` without clocking, as if something else had
    /// driven the chain.
    pub fn force_state(&mut self, state: TapState) {
        self.state = state;
    }

    pub fn chain(&self) -> &[SimTap] {
        &self.chain
    }

    /// The first debug port on the chain.
    pub fn dap(&self) -> Option<&SimDap> {
        self.chain.iter().find_map(|tap| match &tap.kind {
            Kind::Dap(dap) => Some(dap),
            _ => None,
        })
    }

    pub fn dap_mut(&mut self) -> Option<&mut SimDap> {
        self.chain.iter_mut().find_map(|tap| match &mut tap.kind {
            Kind::Dap(dap) => Some(dap),
            _ => None,
        })
    }

    /// User debug registers of the first FPGA on the chain.
    pub fn fpga_regs(&self) -> Option<&[u32; 8]> {
        self.chain.iter().find_map(|tap| match &tap.kind {
            Kind::Fpga(fpga) => Some(&fpga.regs),
            _ => None,
        })
    }

    /// One TCK with the given TMS and TDI levels, returns TDO.
    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let state = self.state;
        let mut bit = tdi;
        for tap in self.chain.iter_mut().rev() {
            bit = tap.shift(state, bit);
        }
        let next = state.next(tms);
        for tap in self.chain.iter_mut() {
            tap.enter(next);
        }
        self.state = next;
        self.tck_count += 1;
        bit
    }

    fn execute(&mut self, op: MpsseOp<'_>) {
        match op {
            MpsseOp::Bytes { cmd, len, data } => {
                debug_assert!(cmd.is_lsb());
                for i in 0..len {
                    let mut out = 0u8;
                    for b in 0..8 {
                        let tdi = match data {
                            Some(data) => data[i] >> b & 1 != 0,
                            None => self.tdi,
                        };
                        if self.clock(false, tdi) {
                            out |= 1 << b;
                        }
                        if data.is_some() {
                            self.tdi = tdi;
                        }
                    }
                    if cmd.is_tdo_read() {
                        self.response.push_back(out);
                    }
                }
            }
            MpsseOp::Bits { cmd, len, data } => {
                debug_assert!(cmd.is_lsb());
                let mut out = 0u8;
                for b in 0..len {
                    let tdi = match data {
                        Some(data) => data >> b & 1 != 0,
                        None => self.tdi,
                    };
                    out = (out >> 1) | (self.clock(false, tdi) as u8) << 7;
                    if data.is_some() {
                        self.tdi = tdi;
                    }
                }
                if cmd.is_tdo_read() {
                    self.response.push_back(out);
                }
            }
            MpsseOp::Tms { cmd, len, data } => {
                self.tdi = data & 0x80 != 0;
                let mut out = 0u8;
                for b in 0..len {
                    let tdo = self.clock(data >> b & 1 != 0, self.tdi);
                    out = (out >> 1) | (tdo as u8) << 7;
                }
                if cmd.is_tdo_read() {
                    self.response.push_back(out);
                }
            }
            MpsseOp::SetGpio { upper: false, value, direction } => {
                self.gpio_lower = (value, direction)
            }
            MpsseOp::SetGpio { upper: true, value, direction } => {
                self.gpio_upper = (value, direction)
            }
            MpsseOp::SetClock(divisor) => self.clock_divisor = Some(divisor),
            MpsseOp::Other(MpsseCmd::GetDataBitsLowbyte) => {
                self.response.push_back(self.gpio_lower.0)
            }
            MpsseOp::Other(MpsseCmd::GetDataBitsHighbyte) => {
                self.response.push_back(self.gpio_upper.0)
            }
            MpsseOp::Other(_) => {}
            MpsseOp::Invalid(opcode) => self.response.extend([BAD_COMMAND, opcode]),
            MpsseOp::Truncated(opcode) => log::warn!("sim: truncated command {opcode:02x}"),
        }
    }
}

impl Link for SimLink {
    fn write(&mut self, data: &[u8]) -> Result<(), FtdiError> {
        if self.fail_next_write {
            self.fail_next_write = false;
            return Err(FtdiError::Usb(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated transfer failure",
            )));
        }
        self.writes += 1;
        self.max_write = self.max_write.max(data.len());
        for op in MpsseOps::new(data) {
            let before = self.response.len();
            self.execute(op);
            debug_assert_eq!(self.response.len() - before, op.response_len(), "{op}");
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>, FtdiError> {
        let payload = self.packet_size - MODEM_STATUS.len();
        let mut transfer = Vec::new();
        for _ in 0..PACKETS_PER_READ {
            transfer.extend_from_slice(&MODEM_STATUS);
            let n = self.response.len().min(payload);
            transfer.extend(self.response.drain(..n));
            if self.response.is_empty() {
                break;
            }
        }
        Ok(transfer)
    }

    fn packet_size(&self) -> usize {
        self.packet_size
    }
}

/// Data register selected by the current instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataReg {
    Bypass,
    Idcode(u32),
    Usercode,
    UserDebug,
    DpAcc,
    ApAcc,
    Abort,
}
impl DataReg {
    fn len(self) -> usize {
        match self {
            DataReg::Bypass => 1,
            DataReg::Idcode(_) | DataReg::Usercode => 32,
            DataReg::UserDebug => 36,
            DataReg::DpAcc | DataReg::ApAcc | DataReg::Abort => 35,
        }
    }
}

enum Kind {
    Fpga(SimFpga),
    Dap(SimDap),
    BypassOnly,
}

/// One TAP on the simulated chain.
pub struct SimTap {
    ir_len: usize,
    ir: u8,
    ir_shift: u64,
    dr_shift: u64,
    dr_len: usize,
    kind: Kind,
}

impl SimTap {
    /// Xilinx 7-series style TAP: 6-bit IR, IDCODE, USERCODE, BYPASS and a
    /// 36-bit user debug register on USER4.
    pub fn fpga(idcode: u32) -> Self {
        Self::with_kind(
            FPGA_IR_LEN,
            Kind::Fpga(SimFpga {
                idcode,
                regs: [0; 8],
                last_read: 0,
            }),
        )
    }

    /// ARM JTAG-DP with one MEM-AP.
    pub fn dap(idcode: u32) -> Self {
        Self::with_kind(DAP_IR_LEN, Kind::Dap(SimDap::new(idcode)))
    }

    /// A TAP without IDCODE: reset selects the 1-bit bypass register.
    pub fn bypass_only() -> Self {
        Self::with_kind(DAP_IR_LEN, Kind::BypassOnly)
    }

    fn with_kind(ir_len: usize, kind: Kind) -> Self {
        let mut tap = Self {
            ir_len,
            ir: 0,
            ir_shift: 0,
            dr_shift: 0,
            dr_len: 1,
            kind,
        };
        tap.reset();
        tap
    }

    pub fn ir_len(&self) -> usize {
        self.ir_len
    }

    /// Current instruction.
    pub fn instruction(&self) -> u8 {
        self.ir
    }

    fn reset(&mut self) {
        self.ir = match self.kind {
            Kind::Fpga(_) => FPGA_IDCODE,
            Kind::Dap(_) => IR_IDCODE,
            Kind::BypassOnly => IR_BYPASS,
        };
    }

    fn data_reg(&self) -> DataReg {
        match (&self.kind, self.ir) {
            (Kind::Fpga(fpga), FPGA_IDCODE) => DataReg::Idcode(fpga.idcode),
            (Kind::Fpga(_), FPGA_USERCODE) => DataReg::Usercode,
            (Kind::Fpga(_), FPGA_USER4) => DataReg::UserDebug,
            (Kind::Fpga(_), FPGA_BYPASS) => DataReg::Bypass,
            (Kind::Dap(dap), IR_IDCODE) => DataReg::Idcode(dap.idcode),
            (Kind::Dap(_), IR_DPACC) => DataReg::DpAcc,
            (Kind::Dap(_), IR_APACC) => DataReg::ApAcc,
            (Kind::Dap(_), IR_ABORT) => DataReg::Abort,
            _ => DataReg::Bypass,
        }
    }

    /// Clock one bit through the register selected by `state`.
    fn shift(&mut self, state: TapState, tdi: bool) -> bool {
        let (reg, len) = match state {
            TapState::IrShift => (&mut self.ir_shift, self.ir_len),
            TapState::DrShift => (&mut self.dr_shift, self.dr_len),
            _ => return false,
        };
        let tdo = *reg & 1 != 0;
        *reg = (*reg >> 1) | (tdi as u64) << (len - 1);
        tdo
    }

    fn enter(&mut self, state: TapState) {
        match state {
            TapState::Reset => self.reset(),
            TapState::IrCapture => self.ir_shift = 0b01,
            TapState::IrUpdate => self.ir = (self.ir_shift & ((1 << self.ir_len) - 1)) as u8,
            TapState::DrCapture => {
                let reg = self.data_reg();
                self.dr_len = reg.len();
                self.dr_shift = match (reg, &mut self.kind) {
                    (DataReg::Idcode(idcode), _) => idcode as u64,
                    (DataReg::Usercode, _) => USERCODE as u64,
                    (DataReg::UserDebug, Kind::Fpga(fpga)) => fpga.last_read as u64,
                    (DataReg::DpAcc | DataReg::ApAcc, Kind::Dap(dap)) => dap.capture(),
                    _ => 0,
                };
            }
            TapState::DrUpdate => {
                let value = self.dr_shift & ((1 << self.dr_len) - 1);
                match (self.data_reg(), &mut self.kind) {
                    (DataReg::UserDebug, Kind::Fpga(fpga)) => fpga.update(value),
                    (DataReg::DpAcc, Kind::Dap(dap)) => dap.update(false, value),
                    (DataReg::ApAcc, Kind::Dap(dap)) => dap.update(true, value),
                    (DataReg::Abort, Kind::Dap(dap)) => dap.abort(value),
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// Eight 32-bit registers behind USER4: bits [31:0] data, [34:32] address,
/// bit 35 write.
struct SimFpga {
    idcode: u32,
    regs: [u32; 8],
    last_read: u32,
}
impl SimFpga {
    fn update(&mut self, value: u64) {
        let addr = (value >> 32 & 7) as usize;
        if value >> 35 & 1 != 0 {
            self.regs[addr] = value as u32;
        } else {
            self.last_read = self.regs[addr];
        }
    }
}

/// JTAG-DP model with AP 0 a 32-bit MEM-AP.
pub struct SimDap {
    idcode: u32,
    ctrl: CtrlStat,
    select: u32,
    /// Result of the last accepted read, returned by the next capture.
    last: u32,
    /// The last capture answered WAIT; the following update is dropped.
    stall: bool,
    wait: usize,
    always_wait: bool,
    power_up_delay: Option<usize>,
    powering: Option<usize>,
    fault: Option<Range<u32>>,
    fault_other_aps: bool,
    csw: u32,
    tar: u32,
    idr: u32,
    base: u32,
    memory: BTreeMap<u32, u32>,
    select_writes: usize,
    tar_writes: Vec<u32>,
    aborts: usize,
}

impl SimDap {
    fn new(idcode: u32) -> Self {
        Self {
            idcode,
            ctrl: CtrlStat::new(),
            select: 0,
            last: 0,
            stall: false,
            wait: 0,
            always_wait: false,
            power_up_delay: Some(0),
            powering: None,
            fault: None,
            fault_other_aps: false,
            csw: 0,
            tar: 0,
            idr: 0x2477_0011,
            base: 0xE00F_F003,
            memory: BTreeMap::new(),
            select_writes: 0,
            tar_writes: Vec::new(),
            aborts: 0,
        }
    }

    /// Answer WAIT to the next `count` DPACC/APACC scans.
    pub fn inject_wait(&mut self, count: usize) {
        self.wait = count;
    }

    pub fn set_always_wait(&mut self, always: bool) {
        self.always_wait = always;
    }

    /// CTRL/STAT reads after a power-up request before both acks are set.
    /// `None` never powers up.
    pub fn set_power_up_delay(&mut self, reads: Option<usize>) {
        self.power_up_delay = reads;
    }

    /// Memory accesses inside `range` set STICKYERR.
    pub fn set_fault(&mut self, range: Range<u32>) {
        self.fault = Some(range);
    }

    /// Accesses to any AP but 0 set STICKYERR.
    pub fn set_fault_other_aps(&mut self, fault: bool) {
        self.fault_other_aps = fault;
    }

    pub fn set_idr(&mut self, idr: u32) {
        self.idr = idr;
    }

    pub fn set_base(&mut self, base: u32) {
        self.base = base;
    }

    pub fn write_word(&mut self, addr: u32, value: u32) {
        self.memory.insert(addr, value);
    }

    pub fn read_word(&self, addr: u32) -> u32 {
        self.memory.get(&addr).copied().unwrap_or(0)
    }

    pub fn ctrl_stat(&self) -> CtrlStat {
        self.ctrl
    }

    pub fn select(&self) -> u32 {
        self.select
    }

    /// Writes to SELECT accepted so far.
    pub fn select_writes(&self) -> usize {
        self.select_writes
    }

    /// Values written to TAR, in order.
    pub fn tar_writes(&self) -> &[u32] {
        &self.tar_writes
    }

    pub fn aborts(&self) -> usize {
        self.aborts
    }

    fn capture(&mut self) -> u64 {
        if self.always_wait || self.wait > 0 {
            self.wait = self.wait.saturating_sub(1);
            self.stall = true;
            return ACK_WAIT as u64;
        }
        (self.last as u64) << 3 | ACK_OK as u64
    }

    fn update(&mut self, apacc: bool, value: u64) {
        if std::mem::take(&mut self.stall) {
            return;
        }
        let read = value & 1 != 0;
        let addr = ((value >> 1 & 3) << 2) as u8;
        let data = (value >> 3) as u32;
        match (apacc, read) {
            (false, true) => self.dp_read(addr),
            (false, false) => self.dp_write(addr, data),
            (true, true) => self.last = self.ap_read(addr),
            (true, false) => self.ap_write(addr, data),
        }
    }

    fn abort(&mut self, value: u64) {
        if (value >> 3) as u32 & DAPABORT != 0 {
            self.aborts += 1;
            self.stall = false;
        }
    }

    fn dp_read(&mut self, addr: u8) {
        match addr {
            DP_CTRL_STAT => {
                if let Some(reads) = self.powering {
                    if reads == 0 {
                        self.ctrl.set_csys_pwrup_ack(true);
                        self.ctrl.set_cdbg_pwrup_ack(true);
                        self.powering = None;
                    } else {
                        self.powering = Some(reads - 1);
                    }
                }
                self.last = self.ctrl.into_bits();
            }
            DP_SELECT => self.last = self.select,
            DP_RDBUFF => {}
            _ => self.last = 0,
        }
    }

    fn dp_write(&mut self, addr: u8, data: u32) {
        match addr {
            DP_CTRL_STAT => {
                let req = CtrlStat::from_bits(data);
                let ctrl = &mut self.ctrl;
                if req.sticky_err() {
                    ctrl.set_sticky_err(false);
                }
                if req.sticky_cmp() {
                    ctrl.set_sticky_cmp(false);
                }
                if req.sticky_orun() {
                    ctrl.set_sticky_orun(false);
                }
                ctrl.set_orun_detect(req.orun_detect());
                ctrl.set_csys_pwrup_req(req.csys_pwrup_req());
                ctrl.set_cdbg_pwrup_req(req.cdbg_pwrup_req());
                if req.csys_pwrup_req() && req.cdbg_pwrup_req() {
                    if !ctrl.is_powered() && self.powering.is_none() {
                        self.powering = self.power_up_delay;
                    }
                } else {
                    ctrl.set_csys_pwrup_ack(false);
                    ctrl.set_cdbg_pwrup_ack(false);
                    self.powering = None;
                }
            }
            DP_SELECT => {
                self.select = data;
                self.select_writes += 1;
            }
            _ => {}
        }
    }

    /// Register of AP 0 addressed through SELECT, `None` for other APs.
    fn ap_reg(&self, addr: u8) -> Option<u8> {
        (self.select >> 24 == 0).then_some((self.select & 0xF0) as u8 | addr)
    }

    fn ap_read(&mut self, addr: u8) -> u32 {
        match self.ap_reg(addr) {
            Some(AP_CSW) => self.csw,
            Some(AP_TAR) => self.tar,
            Some(AP_DRW) => {
                let value = match self.mem_fault() {
                    true => 0,
                    false => self.read_word(self.tar),
                };
                self.advance_tar();
                value
            }
            Some(AP_BASE) => self.base,
            Some(AP_IDR) => self.idr,
            Some(_) => 0,
            None => {
                self.missing_ap();
                0
            }
        }
    }

    fn ap_write(&mut self, addr: u8, data: u32) {
        match self.ap_reg(addr) {
            Some(AP_CSW) => self.csw = data,
            Some(AP_TAR) => {
                self.tar = data;
                self.tar_writes.push(data);
            }
            Some(AP_DRW) => {
                if !self.mem_fault() {
                    self.memory.insert(self.tar, data);
                }
                self.advance_tar();
            }
            Some(_) => {}
            None => self.missing_ap(),
        }
    }

    fn missing_ap(&mut self) {
        if self.fault_other_aps {
            self.ctrl.set_sticky_err(true);
        }
    }

    fn mem_fault(&mut self) -> bool {
        let fault = self
            .fault
            .as_ref()
            .is_some_and(|range| range.contains(&self.tar));
        if fault {
            self.ctrl.set_sticky_err(true);
        }
        fault
    }

    /// TAR auto-increment only wraps inside the current 1 KiB block.
    fn advance_tar(&mut self) {
        if ApCsw::from_bits(self.csw).addr_inc() == CSW_ADDR_INC_SINGLE {
            self.tar = (self.tar & !0x3FF) | (self.tar.wrapping_add(4) & 0x3FF);
        }
    }
}
