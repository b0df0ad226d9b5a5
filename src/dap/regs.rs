//! JTAG-DP instructions, DP/AP register addresses and their layouts.
use bitfield_struct::bitfield;

/// IR length of an ARM JTAG-DP.
pub const IR_LEN: usize = 4;
/// DPACC/APACC/ABORT scan length: 3 bits request or ACK, 32 bits data.
pub const DR_LEN: usize = 35;

pub const IR_ABORT: u8 = 0x8;
pub const IR_DPACC: u8 = 0xA;
pub const IR_APACC: u8 = 0xB;
pub const IR_IDCODE: u8 = 0xE;
pub const IR_BYPASS: u8 = 0xF;

pub const DP_CTRL_STAT: u8 = 0x4;
pub const DP_SELECT: u8 = 0x8;
pub const DP_RDBUFF: u8 = 0xC;

pub const AP_CSW: u8 = 0x00;
pub const AP_TAR: u8 = 0x04;
pub const AP_DRW: u8 = 0x0C;
pub const AP_BASE: u8 = 0xF8;
pub const AP_IDR: u8 = 0xFC;

/// OK/FAULT. Faults on JTAG-DP only show up as sticky flags.
pub const ACK_OK: u8 = 0b010;
pub const ACK_WAIT: u8 = 0b001;

/// ABORT register: abort the current AP transaction.
pub const DAPABORT: u32 = 1;

/// Read request for register `addr`: RnW in bit 0, A[3:2] in bits [2:1].
pub const fn read(addr: u8) -> u64 {
    ((addr as u64 >> 1) & 0b110) | 1
}

pub const fn write(addr: u8, value: u32) -> u64 {
    (value as u64) << 3 | ((addr as u64 >> 1) & 0b110)
}

/// Split a captured scan into ACK and data.
pub const fn response(word: u64) -> (u8, u32) {
    ((word & 0b111) as u8, (word >> 3) as u32)
}

/// DP CTRL/STAT.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct CtrlStat {
    pub orun_detect: bool,
    pub sticky_orun: bool,
    #[bits(2)]
    pub trn_mode: u8,
    pub sticky_cmp: bool,
    pub sticky_err: bool,
    pub read_ok: bool,
    pub wdata_err: bool,
    #[bits(4)]
    pub mask_lane: u8,
    #[bits(12)]
    pub trn_cnt: u16,
    #[bits(2)]
    __reserved: u8,
    pub cdbg_rst_req: bool,
    pub cdbg_rst_ack: bool,
    pub cdbg_pwrup_req: bool,
    pub cdbg_pwrup_ack: bool,
    pub csys_pwrup_req: bool,
    pub csys_pwrup_ack: bool,
}

impl CtrlStat {
    pub fn has_sticky(&self) -> bool {
        self.sticky_err() || self.sticky_cmp() || self.sticky_orun()
    }

    pub fn is_powered(&self) -> bool {
        self.csys_pwrup_ack() && self.cdbg_pwrup_ack()
    }

    /// Power-up request that also clears every sticky flag (write one to
    /// clear on JTAG-DP).
    pub fn power_up_request() -> Self {
        Self::new()
            .with_csys_pwrup_req(true)
            .with_cdbg_pwrup_req(true)
            .with_orun_detect(true)
            .with_sticky_err(true)
            .with_sticky_cmp(true)
            .with_sticky_orun(true)
    }
}

/// DP SELECT.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Select {
    #[bits(4)]
    pub dp_bank: u8,
    /// Bits [7:4] of the AP register address.
    #[bits(4)]
    pub ap_bank: u8,
    #[bits(16)]
    __reserved: u16,
    pub ap_sel: u8,
}

impl Select {
    pub fn ap(apnum: u8, addr: u8) -> Self {
        Self::new().with_ap_sel(apnum).with_ap_bank(addr >> 4)
    }
}

pub const CSW_SIZE_32: u8 = 0b010;
pub const CSW_ADDR_INC_OFF: u8 = 0b00;
pub const CSW_ADDR_INC_SINGLE: u8 = 0b01;

/// MEM-AP CSW.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ApCsw {
    #[bits(3)]
    pub size: u8,
    __reserved0: bool,
    #[bits(2)]
    pub addr_inc: u8,
    pub device_en: bool,
    pub tr_in_prog: bool,
    #[bits(4)]
    pub mode: u8,
    #[bits(11)]
    __reserved1: u16,
    pub spiden: bool,
    #[bits(7)]
    pub prot: u8,
    pub dbg_sw_enable: bool,
}

impl ApCsw {
    /// 32-bit accesses with the given TAR increment mode.
    pub fn word_access(addr_inc: u8) -> Self {
        Self::new()
            .with_dbg_sw_enable(true)
            .with_addr_inc(addr_inc)
            .with_size(CSW_SIZE_32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_words() {
        assert_eq!(read(DP_RDBUFF), 0b111);
        assert_eq!(read(DP_CTRL_STAT), 0b011);
        assert_eq!(read(AP_IDR), 0b111);
        assert_eq!(write(DP_SELECT, 0x0100_00F0), 0x0100_00F0 << 3 | 0b100);
        assert_eq!(write(0, DAPABORT), 8);
        assert_eq!(response(0x1234_5678 << 3 | 0b010), (ACK_OK, 0x1234_5678));
    }

    #[test]
    fn register_layouts() {
        let req = CtrlStat::power_up_request().into_bits();
        assert_eq!(req, 0x5000_0033);
        assert!(CtrlStat::from_bits(0xF000_0000).is_powered());
        assert!(CtrlStat::from_bits(1 << 5).has_sticky());
        assert!(!CtrlStat::from_bits(0xF000_0001).has_sticky());
        let reset = CtrlStat::from_bits(0x0C00_0000);
        assert!(reset.cdbg_rst_req() && reset.cdbg_rst_ack());
        assert!(!CtrlStat::from_bits(0x0300_0000).cdbg_rst_req());
        assert_eq!(CtrlStat::new().with_trn_cnt(0xFFF).into_bits(), 0x00FF_F000);
        assert_eq!(Select::ap(2, AP_IDR).into_bits(), 0x0200_00F0);
        assert_eq!(
            ApCsw::word_access(CSW_ADDR_INC_SINGLE).into_bits(),
            0x8000_0012
        );
    }
}
