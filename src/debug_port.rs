//! Debug register file in the FPGA fabric, reached through the USER4
//! instruction of a Xilinx 7-series TAP.
//!
//! The user logic behind USER4 exposes eight 32-bit registers through a
//! 36-bit data register laid out as `W | A[2:0] | D[31:0]`, bit 35 first
//! from the top. A write shifts the whole word with W set. A read shifts
//! only the upper four bits (W clear plus the address), then the next scan
//! captures the addressed register.
use crate::{
    jtag::{Family, Jtag, JtagError},
    transport::Transport,
};

/// USER4 instruction of the 6-bit 7-series IR.
pub const USER4: u8 = 0x23;
const IR_LEN: usize = 6;
const DR_LEN: usize = 36;
const WRITE: u64 = 1 << 35;

pub struct UserDebugPort<'a, T: Transport> {
    jtag: &'a mut Jtag<T>,
}

impl<'a, T: Transport> UserDebugPort<'a, T> {
    /// Select the only Xilinx 7-series device of an enumerated chain.
    pub fn open(jtag: &'a mut Jtag<T>) -> Result<Self, JtagError> {
        jtag.select_by_family(Family::Xilinx7)?;
        Ok(Self { jtag })
    }

    /// Use `jtag` as is. The caller has selected the FPGA.
    pub fn new(jtag: &'a mut Jtag<T>) -> Self {
        Self { jtag }
    }

    pub fn read(&mut self, addr: u8) -> Result<u32, JtagError> {
        self.jtag.ir_wr(IR_LEN, &[USER4])?;
        self.jtag.dr_wr(4, &[addr & 7])?;
        // shift zeros so the update that follows is a harmless read again
        let id = self.jtag.dr_io(DR_LEN, &[0; 5])?;
        let captures = self.jtag.commit()?;
        let value = captures.u32(id);
        log::debug!("user reg {addr} -> {value:08x}");
        Ok(value)
    }

    pub fn write(&mut self, addr: u8, value: u32) -> Result<(), JtagError> {
        let word = WRITE | ((addr & 7) as u64) << 32 | value as u64;
        self.jtag.ir_wr(IR_LEN, &[USER4])?;
        self.jtag.dr_wr(DR_LEN, &word.to_le_bytes()[..5])?;
        self.jtag.commit()?;
        log::debug!("user reg {addr} <- {value:08x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::UserDebugPort;
    use crate::{
        jtag::{JtagError, tests::jtag},
        sim::SimTap,
    };

    #[test]
    fn registers_round_trip_behind_a_dap() {
        let mut jtag = jtag(vec![SimTap::dap(0x4BA0_0477), SimTap::fpga(0x0372_7093)]);
        jtag.enumerate().unwrap();
        let mut port = UserDebugPort::open(&mut jtag).unwrap();
        port.write(3, 0xC0FF_EE00).unwrap();
        port.write(5, 0x1234_5678).unwrap();
        assert_eq!(port.read(3).unwrap(), 0xC0FF_EE00);
        assert_eq!(port.read(5).unwrap(), 0x1234_5678);
        assert_eq!(port.read(0).unwrap(), 0);
        // reads never disturbed the register file
        let regs = jtag.transport().link().fpga_regs().unwrap();
        assert_eq!(regs[3], 0xC0FF_EE00);
        assert_eq!(regs[0], 0);
    }

    #[test]
    fn needs_an_fpga_on_the_chain() {
        let mut jtag = jtag(vec![SimTap::dap(0x4BA0_0477)]);
        jtag.enumerate().unwrap();
        assert!(matches!(
            UserDebugPort::open(&mut jtag),
            Err(JtagError::FamilyNotFound(_))
        ));
    }
}
