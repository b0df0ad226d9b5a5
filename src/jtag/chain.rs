//! Scan chain discovery and single-device addressing.
use super::{DeviceInfo, Family, Jtag, JtagError, Padding, TapState, lookup};
use crate::transport::Transport;

/// Longest chain [`Jtag::enumerate`] will walk.
pub const MAX_DEVICES: usize = 32;

/// A device found on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    /// The idcode as read, version bits included.
    pub idcode: u32,
    pub info: &'static DeviceInfo,
}

impl<T: Transport> Jtag<T> {
    /// Discover the devices on the scan chain.
    ///
    /// Position 0 is the device whose idcode leaves TDO first. Any failure
    /// leaves no devices and no selection behind.
    pub fn enumerate(&mut self) -> Result<&[Device], JtagError> {
        self.devices.clear();
        self.reset_registers();

        // three resets in a row, in case the TAP was left mid-sequence
        for _ in 0..3 {
            self.goto(TapState::Reset)?;
        }
        let ones = [0xFF; MAX_DEVICES * 4];
        let id = self.dr_io(MAX_DEVICES * 32, &ones)?;
        let captures = self.commit()?;

        let mut devices = Vec::new();
        for (position, word) in captures[id].chunks_exact(4).enumerate() {
            let idcode = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            if idcode == u32::MAX {
                if devices.is_empty() {
                    return Err(JtagError::NoDevices);
                }
                self.devices = devices;
                return Ok(&self.devices);
            }
            if idcode & 1 == 0 {
                return Err(JtagError::InvalidDevice { position, idcode });
            }
            let info = lookup(idcode).ok_or(JtagError::UnknownDevice { position, idcode })?;
            log::info!(
                "device {position:02} idcode {idcode:08x} {} ({})",
                info.name,
                info.family
            );
            devices.push(Device { idcode, info });
        }
        Err(JtagError::ChainTooLong(MAX_DEVICES))
    }

    /// Devices found by the last [`enumerate`](Self::enumerate).
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, position: usize) -> Option<&Device> {
        self.devices.get(position)
    }

    /// Address only the device at `position`; every other device is put in
    /// BYPASS by the padding around each scan.
    pub fn select(&mut self, position: usize) -> Result<&Device, JtagError> {
        if position >= self.devices.len() {
            return Err(JtagError::NoSuchDevice(position));
        }
        let (before, rest) = self.devices.split_at(position);
        let after = &rest[1..];
        let ir_before = before.iter().map(|dev| dev.info.irsize).sum();
        let ir_after = after.iter().map(|dev| dev.info.irsize).sum();
        self.ir.prefix = Padding::ones(ir_before);
        self.ir.postfix = Padding::ones(ir_after);
        self.dr.prefix = Padding::ones(before.len());
        self.dr.postfix = Padding::ones(after.len());
        let device = &self.devices[position];
        log::debug!(
            "selected {} at {position}: ir {ir_before}+{}+{ir_after}, dr {}+n+{}",
            device.info.name,
            device.info.irsize,
            before.len(),
            after.len()
        );
        Ok(device)
    }

    /// Select the first device whose idcode matches `idcode`, ignoring the
    /// bits its catalog entry masks out.
    pub fn select_by_idcode(&mut self, idcode: u32) -> Result<&Device, JtagError> {
        let position = self
            .devices
            .iter()
            .position(|dev| dev.idcode & dev.info.idmask == idcode & dev.info.idmask)
            .ok_or(JtagError::IdcodeNotFound(idcode))?;
        self.select(position)
    }

    /// Select the only device of `family`.
    pub fn select_by_family(&mut self, family: Family) -> Result<&Device, JtagError> {
        let mut matching = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, dev)| dev.info.family == family)
            .map(|(position, _)| position);
        let position = matching.next().ok_or(JtagError::FamilyNotFound(family))?;
        let extra = matching.count();
        if extra > 0 {
            return Err(JtagError::AmbiguousFamily {
                family,
                count: extra + 1,
            });
        }
        self.select(position)
    }
}

#[cfg(test)]
mod tests {
    use super::{Device, MAX_DEVICES};
    use crate::{
        jtag::{DeviceInfo, Family, JtagError, tests::jtag},
        sim::{SimTap, USERCODE},
    };

    const DAP: u32 = 0x4BA0_0477;
    const Z020: u32 = 0x1372_7093;

    #[test]
    fn enumerates_zynq_chain() {
        let mut jtag = jtag(vec![SimTap::dap(DAP), SimTap::fpga(Z020)]);
        let devices = jtag.enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].info.name, "Cortex A9");
        assert_eq!(devices[1].info.name, "xc7z020");
        assert_eq!(devices[1].idcode, Z020);
    }

    #[test]
    fn select_pads_other_devices() {
        let mut jtag = jtag(vec![
            SimTap::dap(DAP),
            SimTap::fpga(Z020),
            SimTap::fpga(0x0362_D093),
        ]);
        jtag.enumerate().unwrap();
        jtag.select(1).unwrap();
        assert_eq!(jtag.ir().prefix().count(), 4);
        assert_eq!(jtag.ir().postfix().count(), 6);
        assert_eq!(jtag.dr().prefix().count(), 1);
        assert_eq!(jtag.dr().postfix().count(), 1);
        assert!(matches!(jtag.select(3), Err(JtagError::NoSuchDevice(3))));

        // talk to the middle device only
        jtag.ir_wr(6, &[0x08]).unwrap();
        let user = jtag.dr_io(32, &[0; 4]).unwrap();
        let captures = jtag.commit().unwrap();
        assert_eq!(captures.u32(user), USERCODE);
    }

    #[test]
    fn select_sums_ir_lengths_around_target() {
        const fn part(idcode: u32, irsize: usize) -> DeviceInfo {
            DeviceInfo {
                idcode,
                idmask: !0,
                irsize,
                name: "part",
                family: Family::Xilinx7,
            }
        }
        static PARTS: [DeviceInfo; 3] = [
            part(0x1000_0001, 4),
            part(0x2000_0001, 6),
            part(0x3000_0001, 8),
        ];
        let mut jtag = jtag(vec![]);
        jtag.devices = PARTS
            .iter()
            .map(|info| Device { idcode: info.idcode, info })
            .collect();

        let cases = [(0, 0, 14, 0, 2), (1, 4, 8, 1, 1), (2, 10, 0, 2, 0)];
        for (position, ir_pre, ir_post, dr_pre, dr_post) in cases {
            let selected = jtag.select(position).unwrap();
            assert_eq!(selected.idcode, PARTS[position].idcode);
            assert_eq!(jtag.ir().prefix().count(), ir_pre);
            assert_eq!(jtag.ir().postfix().count(), ir_post);
            assert_eq!(jtag.dr().prefix().count(), dr_pre);
            assert_eq!(jtag.dr().postfix().count(), dr_post);
        }
        assert!(jtag.ir().postfix().is_empty());
    }

    #[test]
    fn select_by_family_and_idcode() {
        let mut jtag = jtag(vec![SimTap::dap(DAP), SimTap::fpga(Z020)]);
        jtag.enumerate().unwrap();
        assert_eq!(jtag.select_by_family(Family::Xilinx7).unwrap().idcode, Z020);
        assert_eq!(jtag.ir().prefix().count(), 4);
        assert_eq!(jtag.select_by_idcode(0x0372_7093).unwrap().idcode, Z020);
        assert_eq!(jtag.select_by_idcode(DAP).unwrap().idcode, DAP);
        assert_eq!(jtag.ir().postfix().count(), 6);
        assert!(matches!(
            jtag.select_by_idcode(0x0362_D093),
            Err(JtagError::IdcodeNotFound(_))
        ));
    }

    #[test]
    fn ambiguous_family() {
        let mut jtag = jtag(vec![SimTap::fpga(Z020), SimTap::fpga(Z020)]);
        jtag.enumerate().unwrap();
        assert!(matches!(
            jtag.select_by_family(Family::Xilinx7),
            Err(JtagError::AmbiguousFamily { count: 2, .. })
        ));
        assert!(matches!(
            jtag.select_by_family(Family::ArmDap),
            Err(JtagError::FamilyNotFound(Family::ArmDap))
        ));
    }

    #[test]
    fn unknown_device_aborts_enumeration() {
        let mut jtag = jtag(vec![SimTap::dap(DAP), SimTap::fpga(0x0BAD_0001)]);
        jtag.enumerate().unwrap_err();
        assert!(matches!(
            jtag.enumerate(),
            Err(JtagError::UnknownDevice {
                position: 1,
                idcode: 0x0BAD_0001
            })
        ));
        assert!(jtag.devices().is_empty());
        assert!(jtag.ir().prefix().is_empty());
    }

    #[test]
    fn bypass_only_device_is_invalid() {
        let mut jtag = jtag(vec![SimTap::bypass_only(), SimTap::dap(DAP)]);
        assert!(matches!(
            jtag.enumerate(),
            Err(JtagError::InvalidDevice { position: 0, .. })
        ));
    }

    #[test]
    fn empty_and_overlong_chains() {
        let mut jtag = jtag(vec![]);
        assert!(matches!(jtag.enumerate(), Err(JtagError::NoDevices)));

        let mut jtag = jtag_of(MAX_DEVICES);
        assert!(matches!(jtag.enumerate(), Err(JtagError::ChainTooLong(_))));
        let mut jtag = jtag_of(MAX_DEVICES - 1);
        assert_eq!(jtag.enumerate().unwrap().len(), MAX_DEVICES - 1);
    }

    fn jtag_of(n: usize) -> crate::jtag::Jtag<crate::MpsseDriver<crate::sim::SimLink>> {
        jtag((0..n).map(|_| SimTap::fpga(Z020)).collect())
    }
}
