//! Devices the scan chain knows how to address.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// ARM JTAG-DP fronting a CoreSight debug system.
    ArmDap,
    /// Xilinx 7-series programmable logic.
    Xilinx7,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::ArmDap => f.write_str("ARM DAP"),
            Family::Xilinx7 => f.write_str("Xilinx 7"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub idcode: u32,
    pub idmask: u32,
    /// IR length in bits.
    pub irsize: usize,
    pub name: &'static str,
    pub family: Family,
}

impl DeviceInfo {
    pub fn matches(&self, idcode: u32) -> bool {
        idcode & self.idmask == self.idcode
    }
}

/// Version bits [31:28] differ between silicon revisions.
const XILINX_MASK: u32 = 0x0FFF_FFFF;

/// Zynq-7000 PL TAP identifier for the given device code.
const fn zynq(code: u32) -> u32 {
    (0x1B << 21) | (0x9 << 17) | (code << 12) | (0x49 << 1) | 1
}

const fn xilinx7(idcode: u32, name: &'static str) -> DeviceInfo {
    DeviceInfo {
        idcode,
        idmask: XILINX_MASK,
        irsize: 6,
        name,
        family: Family::Xilinx7,
    }
}

pub static DEVICES: &[DeviceInfo] = &[
    DeviceInfo {
        idcode: 0x4BA0_0477,
        idmask: 0xFFFF_FFFF,
        irsize: 4,
        name: "Cortex A9",
        family: Family::ArmDap,
    },
    xilinx7(zynq(0x02), "xc7z010"),
    xilinx7(zynq(0x1B), "xc7z015"),
    xilinx7(zynq(0x07), "xc7z020"),
    xilinx7(zynq(0x0C), "xc7z030"),
    xilinx7(zynq(0x11), "xc7z045"),
    xilinx7(0x0362_D093, "xc7a35t"),
    xilinx7(0x0362_C093, "xc7a50t"),
    xilinx7(0x0363_1093, "xc7a100t"),
    xilinx7(0x0363_6093, "xc7a200t"),
    xilinx7(0x0365_1093, "xc7k325t"),
];

/// First catalog entry matching `idcode`.
pub fn lookup(idcode: u32) -> Option<&'static DeviceInfo> {
    DEVICES.iter().find(|device| device.matches(idcode))
}
