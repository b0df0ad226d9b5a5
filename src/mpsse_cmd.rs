//! Multi-protocol synchronous serial engine opcodes for FTDI devices.
//!
//! [`MpsseCmdBuilder`] encodes commands, [`MpsseOps`] walks an encoded
//! stream back into [`MpsseOp`]s for trace output and for the simulated probe.
use std::fmt;

/// MPSSE opcodes.
///
/// Data clocking MPSSE commands are broken out into separate enums for API ergonomics:
/// [`MpsseShiftCmd`]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MpsseCmd {
    /// Used by [`MpsseCmdBuilder::set_gpio_lower`].
    SetDataBitsLowbyte = 0x80,
    GetDataBitsLowbyte = 0x81,
    /// Used by [`MpsseCmdBuilder::set_gpio_upper`].
    SetDataBitsHighbyte = 0x82,
    GetDataBitsHighbyte = 0x83,
    /// Used by [`MpsseCmdBuilder::enable_loopback`].
    EnableLoopback = 0x84,
    /// Used by [`MpsseCmdBuilder::enable_loopback`].
    DisableLoopback = 0x85,
    /// Used by [`MpsseCmdBuilder::set_clock`].
    SetClockFrequency = 0x86,
    /// Used by [`MpsseCmdBuilder::send_immediate`].
    SendImmediate = 0x87,
    /// Used by [`MpsseCmdBuilder::set_clock`].
    DisableClockDivideBy5 = 0x8A,
    /// Used by [`MpsseCmdBuilder::set_clock`].
    EnableClockDivideBy5 = 0x8B,
    /// Used by [`MpsseCmdBuilder::enable_3phase_data_clocking`].
    Enable3PhaseClocking = 0x8C,
    /// Used by [`MpsseCmdBuilder::enable_3phase_data_clocking`].
    Disable3PhaseClocking = 0x8D,
    /// Used by [`MpsseCmdBuilder::enable_adaptive_clocking`].
    EnableAdaptiveClocking = 0x96,
    /// Used by [`MpsseCmdBuilder::enable_adaptive_clocking`].
    DisableAdaptiveClocking = 0x97,
}
impl MpsseCmd {
    /// Opcodes without operands or with a fixed operand layout.
    const ALL: [MpsseCmd; 14] = [
        MpsseCmd::SetDataBitsLowbyte,
        MpsseCmd::GetDataBitsLowbyte,
        MpsseCmd::SetDataBitsHighbyte,
        MpsseCmd::GetDataBitsHighbyte,
        MpsseCmd::EnableLoopback,
        MpsseCmd::DisableLoopback,
        MpsseCmd::SetClockFrequency,
        MpsseCmd::SendImmediate,
        MpsseCmd::DisableClockDivideBy5,
        MpsseCmd::EnableClockDivideBy5,
        MpsseCmd::Enable3PhaseClocking,
        MpsseCmd::Disable3PhaseClocking,
        MpsseCmd::EnableAdaptiveClocking,
        MpsseCmd::DisableAdaptiveClocking,
    ];
    fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| *cmd as u8 == opcode)
    }
}

/// Command for data shift of the FTDI device.
///
/// When tms_write is false:
///
/// TDI(AD1) can only output on second edge.
///
/// TDO(AD2) can only sample on first edge.
///
/// When tms_write is true:
///
/// TMS(AD3) can only output on second edge.
#[bitfield_struct::bitfield(u8, order = Lsb)]
#[derive(PartialEq, Eq)]
pub(crate) struct MpsseShiftCmd {
    pub(crate) is_tdi_neg_write: bool,
    #[bits(default = true)] // when tms enable, this const true
    pub(crate) is_bit_mode: bool,
    pub(crate) is_tdo_neg_read: bool,
    #[bits(default = true)] // when tms enable, this const true
    pub(crate) is_lsb: bool,
    pub(crate) is_tdi_write: bool,
    pub(crate) is_tdo_read: bool,
    #[bits(default = false)] // tms is used less frequency
    pub(crate) is_tms_write: bool,
    #[bits(default = false)]
    _const_0: bool,
}
impl MpsseShiftCmd {
    fn shift(
        tck_init_value: bool,
        is_bit_mode: bool,
        is_lsb: bool,
        is_tdi_write: bool,
        is_tdo_read: bool,
    ) -> u8 {
        debug_assert!(
            is_tdi_write | is_tdo_read,
            "a shift must either write tdi or read tdo"
        );
        MpsseShiftCmd::new()
            .with_is_tdi_neg_write((!tck_init_value) && is_tdi_write)
            .with_is_bit_mode(is_bit_mode)
            .with_is_tdo_neg_read(tck_init_value && is_tdo_read)
            .with_is_lsb(is_lsb)
            .with_is_tdi_write(is_tdi_write)
            .with_is_tdo_read(is_tdo_read)
            .into()
    }
    fn _tms_shift(tck_init_value: bool, tdo_neg_read: bool, tdo_read: bool) -> u8 {
        MpsseShiftCmd::new()
            .with_is_tdi_neg_write(!tck_init_value)
            .with_is_tdo_neg_read(tdo_neg_read && tdo_read)
            .with_is_tdo_read(tdo_read)
            .with_is_tms_write(true)
            .into()
    }
    fn tms_shift(tdo_read: bool) -> u8 {
        // tms only be used for jtag, so tck_init_value and tdo_neg_read only can be false.
        Self::_tms_shift(false, false, tdo_read)
    }
    /// Whether `opcode` is one of the clocking commands the engine accepts.
    fn is_valid(opcode: u8) -> bool {
        if opcode & 0x80 != 0 {
            return false;
        }
        let cmd = MpsseShiftCmd::from(opcode);
        if cmd.is_tms_write() {
            return cmd.is_bit_mode()
                && cmd.is_lsb()
                && !cmd.is_tdi_write()
                && (cmd.is_tdo_read() || !cmd.is_tdo_neg_read());
        }
        match (cmd.is_tdi_write(), cmd.is_tdo_read()) {
            (false, false) => false,
            (true, false) => !cmd.is_tdo_neg_read(),
            (false, true) => !cmd.is_tdi_neg_write(),
            // tdi and tdo must use opposite edges
            (true, true) => cmd.is_tdi_neg_write() != cmd.is_tdo_neg_read(),
        }
    }
}

/// Largest payload one byte-shift command can carry.
pub(crate) const MAX_BYTES_SHIFT: usize = 65536;
/// Largest bit count one bit-shift command can carry.
pub(crate) const MAX_BITS_SHIFT: usize = 8;
/// Largest TMS sequence one TMS command can carry.
pub(crate) const MAX_TMS_SHIFT: usize = 7;

/// FTDI Multi-Protocol Synchronous Serial Engine (MPSSE) command builder.
///
/// For details about the MPSSE read the [FTDI MPSSE Basics].
///
/// This structure is a `Vec<u8>` that the methods push bytewise commands onto,
/// together with the number of response bytes the queued commands will
/// produce.
///
/// [FTDI MPSSE Basics]: https://www.ftdichip.com/Support/Documents/AppNotes/AN_135_MPSSE_Basics.pdf
#[derive(Default)]
pub(crate) struct MpsseCmdBuilder {
    cmd: Vec<u8>,
    read_len: usize,
}
impl MpsseCmdBuilder {
    pub(crate) fn with_capacity(capacity: usize) -> MpsseCmdBuilder {
        MpsseCmdBuilder {
            cmd: Vec::with_capacity(capacity),
            read_len: 0,
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.cmd
    }

    pub(crate) fn len(&self) -> usize {
        self.cmd.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cmd.is_empty()
    }

    /// Response bytes the queued commands will produce.
    pub(crate) fn read_len(&self) -> usize {
        self.read_len
    }

    pub(crate) fn clear(&mut self) {
        self.cmd.clear();
        self.read_len = 0;
    }

    /// Set the MPSSE clock frequency using provided
    /// divisor value and clock divider configuration.
    /// Both parameters are device dependent.
    pub(crate) fn set_clock(&mut self, divisor: u16, clk_div_by5: Option<bool>) -> &mut Self {
        match clk_div_by5 {
            Some(true) => self.cmd.push(MpsseCmd::EnableClockDivideBy5 as u8),
            Some(false) => self.cmd.push(MpsseCmd::DisableClockDivideBy5 as u8),
            None => {}
        };
        self.cmd.extend_from_slice(&[
            MpsseCmd::SetClockFrequency as u8,
            (divisor & 0xFF) as u8,
            ((divisor >> 8) & 0xFF) as u8,
        ]);
        self
    }

    /// MPSSE loopback state.
    pub(crate) fn enable_loopback(&mut self, state: bool) -> &mut Self {
        if state {
            self.cmd.push(MpsseCmd::EnableLoopback as u8);
        } else {
            self.cmd.push(MpsseCmd::DisableLoopback as u8);
        }
        self
    }

    /// Enable 3 phase data clocking.
    ///
    /// This is only available on FTx232H devices. JTAG wants it off: data is
    /// set up for half a period and then clocked.
    pub(crate) fn enable_3phase_data_clocking(&mut self, state: bool) -> &mut Self {
        if state {
            self.cmd.push(MpsseCmd::Enable3PhaseClocking as u8);
        } else {
            self.cmd.push(MpsseCmd::Disable3PhaseClocking as u8);
        }
        self
    }

    /// Enable adaptive clocking.
    ///
    /// This is only available on FTx232H devices.
    pub(crate) fn enable_adaptive_clocking(&mut self, state: bool) -> &mut Self {
        if state {
            self.cmd.push(MpsseCmd::EnableAdaptiveClocking as u8);
        } else {
            self.cmd.push(MpsseCmd::DisableAdaptiveClocking as u8);
        }
        self
    }

    /// Set the pin direction and state of the lower byte (0-7) GPIO pins on the
    /// MPSSE interface.
    ///
    /// # Arguments
    ///
    /// * `state` - GPIO state mask, `0` is low (or input pin), `1` is high.
    /// * `direction` - GPIO direction mask, `0` is input, `1` is output.
    pub(crate) fn set_gpio_lower(&mut self, state: u8, direction: u8) -> &mut Self {
        self.cmd
            .extend_from_slice(&[MpsseCmd::SetDataBitsLowbyte as u8, state, direction]);
        self
    }

    /// Set the pin direction and state of the upper byte (8-15) GPIO pins on
    /// the MPSSE interface.
    ///
    /// This does nothing on devices such as the FT4232H that only have 8 pins
    /// per port.
    pub(crate) fn set_gpio_upper(&mut self, state: u8, direction: u8) -> &mut Self {
        self.cmd
            .extend_from_slice(&[MpsseCmd::SetDataBitsHighbyte as u8, state, direction]);
        self
    }

    /// Send the preceding commands immediately.
    pub(crate) fn send_immediate(&mut self) -> &mut Self {
        self.cmd.push(MpsseCmd::SendImmediate as u8);
        self
    }

    /// Clock data bytes out on TDI while ignoring TDO.
    ///
    /// `data` must hold at most [`MAX_BYTES_SHIFT`] bytes.
    pub(crate) fn shift_bytes_out(
        &mut self,
        tck_init_value: bool,
        is_lsb: bool,
        data: &[u8],
    ) -> &mut Self {
        self.shift_bytes_cmd(tck_init_value, is_lsb, true, false, data.len());
        self.cmd.extend_from_slice(data);
        self
    }

    /// Clock `len` bytes in from TDO. TDI holds its last level.
    pub(crate) fn shift_bytes_in(&mut self, tck_init_value: bool, is_lsb: bool, len: usize) -> &mut Self {
        self.shift_bytes_cmd(tck_init_value, is_lsb, false, true, len);
        self.read_len += len;
        self
    }

    /// Clock data bytes in and out simultaneously.
    pub(crate) fn shift_bytes(&mut self, tck_init_value: bool, is_lsb: bool, data: &[u8]) -> &mut Self {
        self.shift_bytes_cmd(tck_init_value, is_lsb, true, true, data.len());
        self.cmd.extend_from_slice(data);
        self.read_len += data.len();
        self
    }

    fn shift_bytes_cmd(&mut self, tck_init_value: bool, is_lsb: bool, write: bool, read: bool, len: usize) {
        debug_assert!(
            (1..=MAX_BYTES_SHIFT).contains(&len),
            "byte shift length should be in 1..={MAX_BYTES_SHIFT}"
        );
        let len = len - 1;
        self.cmd.extend_from_slice(&[
            MpsseShiftCmd::shift(tck_init_value, false, is_lsb, write, read),
            (len & 0xFF) as u8,
            ((len >> 8) & 0xFF) as u8,
        ]);
    }

    /// Clock the low `len` bits of `data` out on TDI.
    pub(crate) fn shift_bits_out(&mut self, tck_init_value: bool, is_lsb: bool, data: u8, len: usize) -> &mut Self {
        debug_assert!((1..=MAX_BITS_SHIFT).contains(&len));
        self.cmd.extend_from_slice(&[
            MpsseShiftCmd::shift(tck_init_value, true, is_lsb, true, false),
            (len - 1) as u8,
            data,
        ]);
        self
    }

    /// Clock `len` bits in from TDO. The answer byte holds them in its top bits.
    pub(crate) fn shift_bits_in(&mut self, tck_init_value: bool, is_lsb: bool, len: usize) -> &mut Self {
        debug_assert!((1..=MAX_BITS_SHIFT).contains(&len));
        self.read_len += 1;
        self.cmd.extend_from_slice(&[
            MpsseShiftCmd::shift(tck_init_value, true, is_lsb, false, true),
            (len - 1) as u8,
        ]);
        self
    }

    /// Clock data bits in and out simultaneously.
    pub(crate) fn shift_bits(&mut self, tck_init_value: bool, is_lsb: bool, data: u8, len: usize) -> &mut Self {
        debug_assert!((1..=MAX_BITS_SHIFT).contains(&len));
        self.read_len += 1;
        self.cmd.extend_from_slice(&[
            MpsseShiftCmd::shift(tck_init_value, true, is_lsb, true, true),
            (len - 1) as u8,
            data,
        ]);
        self
    }

    /// Clock TMS bits out.
    ///
    /// # Arguments
    ///
    /// * `tdi` - Value to hold on TDI while clocking.
    /// * `data` - TMS bits, first bit in the LSB.
    /// * `len` - Number of bits to clock out, at most [`MAX_TMS_SHIFT`].
    pub(crate) fn clock_tms_out(&mut self, tdi: bool, data: u8, len: usize) -> &mut Self {
        debug_assert!((1..=MAX_TMS_SHIFT).contains(&len));
        let data = if tdi { data | 0x80 } else { data };
        self.cmd
            .extend_from_slice(&[MpsseShiftCmd::tms_shift(false), (len - 1) as u8, data]);
        self
    }

    /// Clock TMS bits out while clocking TDO bits in.
    pub(crate) fn clock_tms(&mut self, tdi: bool, data: u8, len: usize) -> &mut Self {
        debug_assert!((1..=MAX_TMS_SHIFT).contains(&len));
        self.read_len += 1;
        let data = if tdi { data | 0x80 } else { data };
        self.cmd
            .extend_from_slice(&[MpsseShiftCmd::tms_shift(true), (len - 1) as u8, data]);
        self
    }
}

/// One decoded command of an MPSSE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MpsseOp<'a> {
    /// Byte clocking. `data` is present when TDI is driven.
    Bytes {
        cmd: MpsseShiftCmd,
        len: usize,
        data: Option<&'a [u8]>,
    },
    /// Bit clocking of `len` bits (1..=8).
    Bits {
        cmd: MpsseShiftCmd,
        len: usize,
        data: Option<u8>,
    },
    /// TMS clocking. Bit 7 of `data` is held on TDI.
    Tms {
        cmd: MpsseShiftCmd,
        len: usize,
        data: u8,
    },
    SetGpio { upper: bool, value: u8, direction: u8 },
    SetClock(u16),
    Other(MpsseCmd),
    /// The engine rejects this opcode and answers `0xFA <opcode>`.
    Invalid(u8),
    /// The stream ended inside this command's operands.
    Truncated(u8),
}
impl MpsseOp<'_> {
    /// Number of response bytes the engine sends for this command.
    pub(crate) fn response_len(&self) -> usize {
        match self {
            MpsseOp::Bytes { cmd, len, .. } if cmd.is_tdo_read() => *len,
            MpsseOp::Bits { cmd, .. } | MpsseOp::Tms { cmd, .. } if cmd.is_tdo_read() => 1,
            MpsseOp::Other(MpsseCmd::GetDataBitsLowbyte | MpsseCmd::GetDataBitsHighbyte) => 1,
            MpsseOp::Invalid(_) => 2,
            _ => 0,
        }
    }
}
impl fmt::Display for MpsseOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dir(cmd: &MpsseShiftCmd) -> &'static str {
            match (cmd.is_tdi_write(), cmd.is_tdo_read()) {
                (true, true) => "io",
                (true, false) => "wr",
                _ => "rd",
            }
        }
        match self {
            MpsseOp::Bytes { cmd, len, data } => {
                write!(f, "{:02x} bytes {} {len}", u8::from(*cmd), dir(cmd))?;
                if let Some(data) = data {
                    write!(f, " {data:02x?}")?;
                }
                Ok(())
            }
            MpsseOp::Bits { cmd, len, data } => {
                write!(f, "{:02x} bits  {} {len}", u8::from(*cmd), dir(cmd))?;
                if let Some(data) = data {
                    write!(f, " {data:#04x}")?;
                }
                Ok(())
            }
            MpsseOp::Tms { cmd, len, data } => write!(
                f,
                "{:02x} tms   {} {len} {:#04x} tdi={}",
                u8::from(*cmd),
                dir(cmd),
                data & 0x7F,
                data >> 7
            ),
            MpsseOp::SetGpio { upper, value, direction } => write!(
                f,
                "{} gpio  value={value:#04x} dir={direction:#04x}",
                if *upper { "82" } else { "80" }
            ),
            MpsseOp::SetClock(divisor) => write!(f, "86 clock divisor={divisor}"),
            MpsseOp::Other(cmd) => write!(f, "{:02x} {cmd:?}", *cmd as u8),
            MpsseOp::Invalid(op) => write!(f, "{op:02x} invalid"),
            MpsseOp::Truncated(op) => write!(f, "{op:02x} truncated"),
        }
    }
}

/// Iterator over the commands of an encoded MPSSE stream.
pub(crate) struct MpsseOps<'a> {
    stream: &'a [u8],
}
impl<'a> MpsseOps<'a> {
    pub(crate) fn new(stream: &'a [u8]) -> Self {
        Self { stream }
    }
    fn take(&mut self, opcode: u8, len: usize) -> Result<&'a [u8], MpsseOp<'a>> {
        if self.stream.len() < len {
            self.stream = &[];
            return Err(MpsseOp::Truncated(opcode));
        }
        let (head, tail) = self.stream.split_at(len);
        self.stream = tail;
        Ok(head)
    }
    fn decode(&mut self, opcode: u8) -> Result<MpsseOp<'a>, MpsseOp<'a>> {
        if opcode & 0x80 == 0 {
            if !MpsseShiftCmd::is_valid(opcode) {
                return Ok(MpsseOp::Invalid(opcode));
            }
            let cmd = MpsseShiftCmd::from(opcode);
            if cmd.is_tms_write() {
                let args = self.take(opcode, 2)?;
                return Ok(MpsseOp::Tms { cmd, len: args[0] as usize + 1, data: args[1] });
            }
            if cmd.is_bit_mode() {
                let len = self.take(opcode, 1)?[0] as usize + 1;
                let data = match cmd.is_tdi_write() {
                    true => Some(self.take(opcode, 1)?[0]),
                    false => None,
                };
                return Ok(MpsseOp::Bits { cmd, len, data });
            }
            let args = self.take(opcode, 2)?;
            let len = u16::from_le_bytes([args[0], args[1]]) as usize + 1;
            let data = match cmd.is_tdi_write() {
                true => Some(self.take(opcode, len)?),
                false => None,
            };
            return Ok(MpsseOp::Bytes { cmd, len, data });
        }
        let Some(cmd) = MpsseCmd::from_opcode(opcode) else {
            return Ok(MpsseOp::Invalid(opcode));
        };
        Ok(match cmd {
            MpsseCmd::SetDataBitsLowbyte | MpsseCmd::SetDataBitsHighbyte => {
                let args = self.take(opcode, 2)?;
                MpsseOp::SetGpio {
                    upper: cmd == MpsseCmd::SetDataBitsHighbyte,
                    value: args[0],
                    direction: args[1],
                }
            }
            MpsseCmd::SetClockFrequency => {
                let args = self.take(opcode, 2)?;
                MpsseOp::SetClock(u16::from_le_bytes([args[0], args[1]]))
            }
            cmd => MpsseOp::Other(cmd),
        })
    }
}
impl<'a> Iterator for MpsseOps<'a> {
    type Item = MpsseOp<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let (&opcode, tail) = self.stream.split_first()?;
        self.stream = tail;
        Some(self.decode(opcode).unwrap_or_else(|truncated| truncated))
    }
}
