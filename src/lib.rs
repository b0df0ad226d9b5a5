//! ARM debug access over FTDI MPSSE JTAG probes
//!
//! The FTDI high-speed devices (FT2232H, FT4232H, FT232H) carry a
//! multi-protocol synchronous serial engine that can clock JTAG. This crate
//! drives that engine as a batching JTAG transport and layers an ARM ADIv5
//! debug port on top of it, so target memory can be read and written through
//! a MEM-AP.
//!
//! The stack, bottom to top:
//!
//! * [`ftdaye`]: raw USB link to the FTDI chip ([`nusb`] based).
//! * [`mpsse::MpsseDriver`]: queues scan primitives into one command buffer
//!   and decodes the response when the batch is committed.
//! * [`jtag::Jtag`]: TAP state routing, IR/DR scans with bypass padding,
//!   scan chain enumeration and device selection.
//! * [`dap::Dap`]: DP/AP register access with WAIT retry and sticky error
//!   checking, plus aligned memory access.
//!
//! [`sim`] provides a software probe with a simulated scan chain that the
//! same stack runs against.
//!
//! # Quickstart
//!
//! * Linux users only: Add [udev rules].
//!
//! # Limitations
//!
//! * Limited device support: FT232H, FT2232H, FT4232H.
//! * JTAG only. TCK idles low, TDI changes on the falling edge, TDO is sampled
//!   on the rising edge (AN108-2.2).
//!
//! [udev rules]: https://github.com/probe-rs/webpage/blob/master/public/files/69-probe-rs.rules

#![forbid(unsafe_code)]

pub mod dap;
pub mod debug_port;
pub mod ftdaye;
pub mod jtag;
mod list;
pub use list::{FtdiDeviceInfo, list_all_device};
pub mod mpsse;
mod mpsse_cmd;
pub mod sim;
pub mod transport;

pub use dap::{Dap, DapConfig, DapError};
pub use ftdaye::FtdiError;
pub use jtag::{Jtag, JtagError};
pub use mpsse::{Cable, Link, MpsseDriver};
pub use transport::{CaptureId, Captures, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipType {
    Am,
    Bm,
    FT2232D,
    R,
    FT2232H,
    FT4232H,
    FT232H,
    FT230X,
    Unknown,
}
impl ChipType {
    pub(crate) const fn mpsse_list(self) -> &'static [Interface] {
        match self {
            ChipType::FT232H | ChipType::FT2232D => &[Interface::A],
            ChipType::FT2232H | ChipType::FT4232H => &[Interface::A, Interface::B],
            _ => &[],
        }
    }
    /// Base TCK frequency and whether the divide-by-5 prescaler must be
    /// switched off to reach it.
    pub(crate) const fn max_frequency(self) -> (usize, Option<bool>) {
        match self {
            ChipType::FT2232D => (6_000_000, None),
            ChipType::FT232H | ChipType::FT2232H | ChipType::FT4232H => (30_000_000, Some(false)),
            _ => (0, None),
        }
    }
}
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Interface {
    A = 1,
    B = 2,
    C = 3,
    D = 4,
}

impl Interface {
    pub(crate) const fn read_ep(self) -> u8 {
        match self {
            Interface::A => 0x81,
            Interface::B => 0x83,
            Interface::C => 0x85,
            Interface::D => 0x87,
        }
    }

    pub(crate) const fn write_ep(self) -> u8 {
        match self {
            Interface::A => 0x02,
            Interface::B => 0x04,
            Interface::C => 0x06,
            Interface::D => 0x08,
        }
    }

    pub(crate) const fn index(self) -> u16 {
        self as u16
    }

    pub(crate) const fn interface_number(self) -> u8 {
        (self as u8) - 1
    }
}
