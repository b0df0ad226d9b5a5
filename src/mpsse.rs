//! Command-batching JTAG driver for the FTDI MPSSE.
//!
//! Scan primitives are encoded into one bounded command buffer. Each read
//! primitive also records a [`PendingDecode`] describing where its response
//! bytes belong; on commit the buffer goes out in a single bulk write, the
//! response is read back and the decodes are replayed in order. When the
//! buffer runs out of room a primitive commits the batch so far implicitly.
use crate::{
    ChipType, FtdiError, Interface,
    ftdaye::{FtdiContext, USB_TIMEOUT},
    jtag::JtagError,
    mpsse_cmd::{MAX_BYTES_SHIFT, MpsseCmdBuilder, MpsseOps},
    transport::{CaptureId, Captures, Transport},
};
use std::{mem, time::Instant};

// TCK(AD0) must be init with value 0.
// TDI(AD1) can only output on second edge.
// TDO(AD2) can only sample on first edge.
// according to AN108-2.2.
// https://ftdichip.com/Support/Documents/AppNotes/AN_108_Command_Processor_for_MPSSE_and_MCU_Host_Bus_Emulation_Modes.pdf
const TCK_INIT_VALUE: bool = false;
const IS_LSB: bool = true;

const TCK_MASK: u8 = 1 << 0;
const TDI_MASK: u8 = 1 << 1;
const TMS_MASK: u8 = 1 << 3;

/// Capacity of the command buffer, including the trailing send-immediate.
pub const CMD_CAPACITY: usize = 16 * 1024;
/// A byte-shift chunk is only started with at least this much room left.
const MIN_CHUNK_ROOM: usize = 16;
/// Size of the modem status header in front of every FTDI packet.
const STATUS_LEN: usize = 2;

/// Raw byte pipe to an MPSSE engine.
///
/// Implemented by [`FtdiContext`] for real probes and by
/// [`SimLink`](crate::sim::SimLink) for the simulated one.
pub trait Link {
    /// Send `data` as one bulk transfer.
    fn write(&mut self, data: &[u8]) -> Result<(), FtdiError>;
    /// Receive one bulk transfer. Every `packet_size` bytes of it start with
    /// the two modem status bytes.
    fn read(&mut self) -> Result<Vec<u8>, FtdiError>;
    fn packet_size(&self) -> usize;
}

/// Board wiring applied when the probe is opened.
///
/// TCK, TDI and TMS (AD0, AD1, AD3) are always driven, TCK starts low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cable {
    pub lower_value: u8,
    pub lower_direction: u8,
    pub upper_value: u8,
    pub upper_direction: u8,
    /// Initial TCK divisor: TCK = base / (divisor + 1).
    pub divisor: u16,
}
impl Default for Cable {
    /// Digilent-style FT2232H boards: AD5..AD7 high, AD4 released.
    fn default() -> Self {
        Self {
            lower_value: 0xE8,
            lower_direction: 0xEB,
            upper_value: 0x00,
            upper_direction: 0x00,
            divisor: 2,
        }
    }
}

/// How a slice of the response maps into a capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decode {
    /// `len` whole bytes copied to byte offset.
    Bytes { len: usize },
    /// A bit-mode read of `len` bits, which the engine leaves in the top of
    /// the answer byte. Written to byte offset.
    Bits { len: usize },
    /// One TDO bit of a TMS read, selected by `mask`, stored at bit offset.
    Bit { mask: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingDecode {
    dest: CaptureId,
    offset: usize,
    kind: Decode,
}
impl PendingDecode {
    fn response_len(&self) -> usize {
        match self.kind {
            Decode::Bytes { len } => len,
            Decode::Bits { .. } | Decode::Bit { .. } => 1,
        }
    }
}

/// Batching JTAG transport over an MPSSE [`Link`].
pub struct MpsseDriver<L: Link> {
    link: L,
    chip_type: ChipType,
    cmd: MpsseCmdBuilder,
    pending: Vec<PendingDecode>,
    captures: Captures,
    /// Why the current batch was poisoned.
    poison: Option<String>,
    /// Payload bytes received beyond what the last commit needed.
    rx: Vec<u8>,
    speed_khz: u32,
}

impl MpsseDriver<FtdiContext> {
    /// Opens an FTDI device and brings its MPSSE up for JTAG.
    ///
    /// # Arguments
    /// * `usb_device` - USB device information from [`list_all_device`](crate::list_all_device)
    /// * `interface` - FTDI interface wired to the JTAG header
    /// * `cable` - GPIO levels and initial TCK divisor
    pub fn open(
        usb_device: &nusb::DeviceInfo,
        interface: Interface,
        cable: Cable,
    ) -> Result<Self, JtagError> {
        let handle = usb_device.open().map_err(FtdiError::from)?;
        let max_packet_size = handle
            .active_configuration()
            .map_err(|e| FtdiError::Usb(e.into()))?
            .interface_alt_settings()
            .next()
            .ok_or(FtdiError::OpenFailed(
                "Failed to get interface info".to_string(),
            ))?
            .endpoints()
            .next()
            .ok_or(FtdiError::OpenFailed(
                "Failed to get endpoint info".to_string(),
            ))?
            .max_packet_size();
        let chip_type = match (
            usb_device.device_version(),
            usb_device.serial_number().unwrap_or(""),
        ) {
            (0x400, _) | (0x200, "") => return Err(FtdiError::UnsupportedChip(ChipType::Bm).into()),
            (0x200, _) => return Err(FtdiError::UnsupportedChip(ChipType::Am).into()),
            (0x500, _) => ChipType::FT2232D,
            (0x600, _) => return Err(FtdiError::UnsupportedChip(ChipType::R).into()),
            (0x700, _) => ChipType::FT2232H,
            (0x800, _) => ChipType::FT4232H,
            (0x900, _) => ChipType::FT232H,
            (0x1000, _) => return Err(FtdiError::UnsupportedChip(ChipType::FT230X).into()),
            (version, _) => {
                return Err(FtdiError::OpenFailed(format!(
                    "Unknown ChipType version:0x{version:x}"
                ))
                .into());
            }
        };
        if !chip_type.mpsse_list().contains(&interface) {
            return Err(FtdiError::OpenFailed(format!(
                "{chip_type:?} has no MPSSE on Interface::{interface:?}"
            ))
            .into());
        }
        log::info!("Opening {chip_type:?} Interface::{interface:?}");

        let handle = handle
            .detach_and_claim_interface(interface.interface_number())
            .map_err(FtdiError::from)?;
        let context = FtdiContext::new(handle, interface, max_packet_size).into_mpsse(0)?;
        Self::new(context, chip_type, cable)
    }
}

impl<L: Link> MpsseDriver<L> {
    /// Wraps an MPSSE-mode link and sends the JTAG init sequence.
    pub fn new(link: L, chip_type: ChipType, cable: Cable) -> Result<Self, JtagError> {
        let (base, clk_div_by5) = chip_type.max_frequency();
        let mut driver = Self {
            link,
            chip_type,
            cmd: MpsseCmdBuilder::with_capacity(CMD_CAPACITY),
            pending: Vec::new(),
            captures: Captures::default(),
            poison: None,
            rx: Vec::new(),
            speed_khz: (base / (cable.divisor as usize + 1) / 1000) as u32,
        };
        driver.cmd.enable_loopback(false);
        if chip_type != ChipType::FT2232D {
            driver
                .cmd
                .enable_3phase_data_clocking(false)
                .enable_adaptive_clocking(false);
        }
        driver
            .cmd
            .set_clock(cable.divisor, clk_div_by5)
            .set_gpio_lower(
                cable.lower_value & !TCK_MASK,
                cable.lower_direction | TCK_MASK | TDI_MASK | TMS_MASK,
            )
            .set_gpio_upper(cable.upper_value, cable.upper_direction);
        driver.flush()?;
        log::info!("MPSSE ready, TCK {}kHz", driver.speed_khz);
        Ok(driver)
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn chip_type(&self) -> ChipType {
        self.chip_type
    }

    /// Current TCK frequency.
    pub fn speed_khz(&self) -> u32 {
        self.speed_khz
    }

    /// Record the first failure of the batch.
    fn fail(&mut self, err: JtagError) -> Result<(), JtagError> {
        log::warn!("batch poisoned: {err}");
        self.poison = Some(err.to_string());
        Err(err)
    }

    /// Run the batch so far from inside a primitive. Captures stay in place
    /// for the explicit commit.
    fn commit_implicit(&mut self) -> Result<(), JtagError> {
        log::debug!("command buffer full, committing {} bytes", self.cmd.len());
        match self.flush() {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    /// Make room for `len` more command bytes.
    fn reserve(&mut self, len: usize) -> Result<(), JtagError> {
        if self.cmd.len() + len + 1 > CMD_CAPACITY {
            self.commit_implicit()?;
        }
        Ok(())
    }

    /// Room left for a byte-shift chunk (header plus payload).
    fn room(&self) -> usize {
        CMD_CAPACITY - self.cmd.len() - 1
    }

    /// Send the queued commands and decode the response into `captures`.
    fn flush(&mut self) -> Result<(), JtagError> {
        if self.cmd.is_empty() {
            return Ok(());
        }
        self.cmd.send_immediate();
        let result = self.transfer();
        if result.is_err() {
            self.rx.clear();
        }
        self.cmd.clear();
        self.pending.clear();
        result
    }

    fn transfer(&mut self) -> Result<(), JtagError> {
        if log::log_enabled!(log::Level::Trace) {
            for op in MpsseOps::new(self.cmd.as_slice()) {
                log::trace!("mpsse {op}");
            }
        }
        self.link.write(self.cmd.as_slice())?;
        let expected = self.cmd.read_len();
        let response = self.read_exact(expected)?;
        log::debug!(
            "commit: tx {} bytes, rx {} bytes, {} decodes",
            self.cmd.len(),
            expected,
            self.pending.len()
        );

        let mut at = 0;
        for op in self.pending.iter() {
            let dest = self.captures.bytes_mut(op.dest);
            match op.kind {
                Decode::Bytes { len } => {
                    dest[op.offset..op.offset + len].copy_from_slice(&response[at..at + len]);
                }
                Decode::Bits { len } => {
                    dest[op.offset] = ((response[at] as u16 >> (8 - len)) & ((1 << len) - 1)) as u8;
                }
                Decode::Bit { mask } => {
                    let bit = 1 << (op.offset & 7);
                    if response[at] & mask != 0 {
                        dest[op.offset >> 3] |= bit;
                    } else {
                        dest[op.offset >> 3] &= !bit;
                    }
                }
            }
            at += op.response_len();
        }
        Ok(())
    }

    /// Collect `len` payload bytes, stripping the status header of every
    /// packet. Surplus bytes are kept for the next read.
    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, JtagError> {
        let deadline = Instant::now() + USB_TIMEOUT;
        let packet_size = self.link.packet_size();
        while self.rx.len() < len {
            if Instant::now() > deadline {
                return Err(FtdiError::ShortRead {
                    expected: len,
                    actual: self.rx.len(),
                }
                .into());
            }
            let transfer = self.link.read()?;
            for packet in transfer.chunks(packet_size) {
                if packet.len() > STATUS_LEN {
                    self.rx.extend_from_slice(&packet[STATUS_LEN..]);
                }
            }
        }
        let rest = self.rx.split_off(len);
        Ok(mem::replace(&mut self.rx, rest))
    }

    fn check_capture(&self, id: CaptureId, bits: usize) -> Result<(), JtagError> {
        let len = self.captures[id].len();
        if len * 8 < bits {
            return Err(JtagError::InvalidArgument(format!(
                "capture of {len} bytes cannot hold {bits} bits"
            )));
        }
        Ok(())
    }
}

impl<L: Link> Transport for MpsseDriver<L> {
    fn alloc_capture(&mut self, bits: usize) -> CaptureId {
        self.captures.alloc(bits)
    }

    fn scan_tms(
        &mut self,
        tdi: bool,
        count: usize,
        tms: u8,
        capture: Option<(CaptureId, usize)>,
    ) -> Result<(), JtagError> {
        if self.poison.is_some() {
            return Ok(());
        }
        if !(1..=6).contains(&count) {
            return self.fail(JtagError::InvalidArgument(format!(
                "tms count {count} out of 1..=6"
            )));
        }
        if let Some((id, offset)) = capture {
            if let Err(err) = self.check_capture(id, offset + 1) {
                return self.fail(err);
            }
        }
        self.reserve(3)?;
        match capture {
            Some((dest, offset)) => {
                self.cmd.clock_tms(tdi, tms, count);
                self.pending.push(PendingDecode {
                    dest,
                    offset,
                    // the engine shifts tdo in from the msb, so the first of
                    // `count` bits ends up at bit 8 - count
                    kind: Decode::Bit {
                        mask: 1 << (8 - count),
                    },
                });
            }
            None => {
                self.cmd.clock_tms_out(tdi, tms, count);
            }
        }
        Ok(())
    }

    fn scan_io(
        &mut self,
        count: usize,
        tdi: Option<&[u8]>,
        tdo: Option<CaptureId>,
    ) -> Result<(), JtagError> {
        if self.poison.is_some() || count == 0 {
            return Ok(());
        }
        if tdi.is_none() && tdo.is_none() {
            return self.fail(JtagError::InvalidArgument(
                "scan needs tdi data or a tdo capture".to_string(),
            ));
        }
        if let Some(data) = tdi {
            if data.len() * 8 < count {
                return self.fail(JtagError::InvalidArgument(format!(
                    "{} tdi bytes cannot supply {count} bits",
                    data.len()
                )));
            }
        }
        if let Some(id) = tdo {
            if let Err(err) = self.check_capture(id, count) {
                return self.fail(err);
            }
        }

        let bytes = count / 8;
        let mut at = 0;
        while at < bytes {
            if self.room() < MIN_CHUNK_ROOM {
                self.commit_implicit()?;
            }
            let mut n = (bytes - at).min(MAX_BYTES_SHIFT);
            if tdi.is_some() {
                n = n.min(self.room() - 4);
            }
            match (tdi, tdo) {
                (Some(data), Some(dest)) => {
                    self.cmd.shift_bytes(TCK_INIT_VALUE, IS_LSB, &data[at..at + n]);
                    self.pending.push(PendingDecode {
                        dest,
                        offset: at,
                        kind: Decode::Bytes { len: n },
                    });
                }
                (Some(data), None) => {
                    self.cmd.shift_bytes_out(TCK_INIT_VALUE, IS_LSB, &data[at..at + n]);
                }
                (None, Some(dest)) => {
                    self.cmd.shift_bytes_in(TCK_INIT_VALUE, IS_LSB, n);
                    self.pending.push(PendingDecode {
                        dest,
                        offset: at,
                        kind: Decode::Bytes { len: n },
                    });
                }
                (None, None) => unreachable!(),
            }
            at += n;
        }

        let bits = count % 8;
        if bits == 0 {
            return Ok(());
        }
        self.reserve(3)?;
        match (tdi, tdo) {
            (Some(data), Some(dest)) => {
                self.cmd.shift_bits(TCK_INIT_VALUE, IS_LSB, data[bytes], bits);
                self.pending.push(PendingDecode {
                    dest,
                    offset: bytes,
                    kind: Decode::Bits { len: bits },
                });
            }
            (Some(data), None) => {
                self.cmd.shift_bits_out(TCK_INIT_VALUE, IS_LSB, data[bytes], bits);
            }
            (None, Some(dest)) => {
                self.cmd.shift_bits_in(TCK_INIT_VALUE, IS_LSB, bits);
                self.pending.push(PendingDecode {
                    dest,
                    offset: bytes,
                    kind: Decode::Bits { len: bits },
                });
            }
            (None, None) => unreachable!(),
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<Captures, JtagError> {
        if let Some(reason) = self.poison.take() {
            self.discard();
            return Err(JtagError::Poisoned(reason));
        }
        let result = self.flush();
        let captures = mem::take(&mut self.captures);
        result.map(|()| captures)
    }

    fn discard(&mut self) {
        self.poison = None;
        self.cmd.clear();
        self.pending.clear();
        self.captures = Captures::default();
    }

    /// TCK = base / (divisor + 1), rounded so the result never exceeds `khz`.
    /// The returned frequency is truncated to whole kHz.
    fn set_speed(&mut self, khz: u32) -> Result<u32, JtagError> {
        let (base, clk_div_by5) = self.chip_type.max_frequency();
        let max_khz = (base / 1000) as u32;
        let min_khz = max_khz.div_ceil(u16::MAX as u32 + 1);
        let divisor = if khz >= max_khz {
            if khz > max_khz {
                log::warn!("{khz}kHz out of range[{min_khz}-{max_khz}kHz], using {max_khz}kHz");
            }
            1
        } else if khz < min_khz {
            log::warn!("{khz}kHz out of range[{min_khz}-{max_khz}kHz], using {min_khz}kHz");
            u16::MAX as u32 + 1
        } else {
            max_khz.div_ceil(khz)
        };
        self.reserve(4)?;
        self.cmd.set_clock((divisor - 1) as u16, clk_div_by5);
        self.speed_khz = max_khz / divisor;
        log::info!("TCK set to {}kHz", self.speed_khz);
        Ok(self.speed_khz)
    }

    fn close(mut self) -> Result<(), JtagError> {
        self.commit().map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::{CMD_CAPACITY, Cable, MpsseDriver};
    use crate::{
        ChipType,
        jtag::JtagError,
        sim::{SimLink, SimTap},
        transport::Transport,
    };

    fn driver() -> MpsseDriver<SimLink> {
        let _ = env_logger::builder().is_test(true).try_init();
        let link = SimLink::new(vec![SimTap::fpga(0x0372_2093)]);
        MpsseDriver::new(link, ChipType::FT2232H, Cable::default()).unwrap()
    }

    #[test]
    fn init_sequence_sets_jtag_pins_and_clock() {
        let driver = driver();
        let link = driver.link();
        assert_eq!(link.gpio_lower(), (0xE8, 0xEB));
        assert_eq!(link.clock_divisor(), Some(2));
        assert_eq!(driver.speed_khz(), 10_000);
    }

    #[test]
    fn set_speed_rounds_down() {
        let mut driver = driver();
        assert_eq!(driver.set_speed(30_000).unwrap(), 30_000);
        assert_eq!(driver.set_speed(12_000).unwrap(), 10_000);
        assert_eq!(driver.set_speed(100_000).unwrap(), 30_000);
        // 457Hz
        assert_eq!(driver.set_speed(0).unwrap(), 0);
        driver.commit().unwrap();
        assert_eq!(driver.link().clock_divisor(), Some(u16::MAX));
    }

    #[test]
    fn tms_count_out_of_range_poisons_batch() {
        let mut driver = driver();
        assert!(matches!(
            driver.scan_tms(false, 7, 0x7F, None),
            Err(JtagError::InvalidArgument(_))
        ));
        // ignored until the failed batch is committed
        driver.scan_tms(false, 5, 0x1F, None).unwrap();
        assert!(matches!(driver.commit(), Err(JtagError::Poisoned(_))));
        driver.scan_tms(false, 5, 0x1F, None).unwrap();
        assert!(driver.commit().is_ok());
    }

    #[test]
    fn scan_without_data_or_capture_is_rejected() {
        let mut driver = driver();
        assert!(driver.scan_io(8, None, None).is_err());
        assert!(driver.commit().is_err());
        assert!(driver.commit().is_ok());
    }

    #[test]
    fn reads_idcode_through_bytes_and_bits() {
        let mut driver = driver();
        // reset, then Idle -> DRSHIFT
        driver.scan_tms(false, 6, 0x1F, None).unwrap();
        driver.scan_tms(false, 3, 0b001, None).unwrap();
        let id = driver.alloc_capture(32);
        driver.scan_io(31, None, Some(id)).unwrap();
        driver.scan_tms(false, 2, 0b11, Some((id, 31))).unwrap();
        let captures = driver.commit().unwrap();
        assert_eq!(captures.u32(id), 0x0372_2093);
    }

    #[test]
    fn long_scan_commits_implicitly_and_keeps_captures() {
        let mut driver = driver();
        driver.scan_tms(false, 6, 0x1F, None).unwrap();
        driver.scan_tms(false, 3, 0b001, None).unwrap();
        // more pattern than one command buffer holds, pushed through the
        // idcode register: the idcode comes out first, then the pattern
        let bits = 20_000 * 8;
        let before = driver.link().writes();
        let data: Vec<u8> = (0..bits / 8).map(|i| (i * 7) as u8).collect();
        let id = driver.alloc_capture(bits);
        driver.scan_io(bits, Some(&data), Some(id)).unwrap();
        driver.scan_tms(false, 2, 0b11, None).unwrap();
        let captures = driver.commit().unwrap();
        assert!(driver.link().writes() - before >= 2);
        assert!(driver.link().max_write() <= CMD_CAPACITY);
        let out = &captures[id];
        assert_eq!(u32::from_le_bytes([out[0], out[1], out[2], out[3]]), 0x0372_2093);
        assert_eq!(&out[4..], &data[..data.len() - 4]);
    }

    #[test]
    fn transport_failure_discards_captures() {
        let mut driver = driver();
        let id = driver.alloc_capture(8);
        driver.scan_io(8, None, Some(id)).unwrap();
        driver.link_mut().fail_next_write();
        assert!(matches!(driver.commit(), Err(JtagError::Ftdi(_))));
        // a fresh batch works again
        let id = driver.alloc_capture(8);
        driver.scan_io(8, None, Some(id)).unwrap();
        assert_eq!(driver.commit().unwrap().len(), 1);
    }
}
