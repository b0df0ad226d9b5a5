//! Access port discovery and CoreSight ROM table walking.
use super::{
    Dap, DapError,
    regs::{AP_BASE, AP_CSW, AP_IDR, CtrlStat, DP_CTRL_STAT},
};
use crate::transport::Transport;

/// Entries a ROM table can hold before its ID registers.
const MAX_ROM_ENTRIES: usize = 960;
/// Entries fetched per block read while scanning a table.
const ENTRY_BATCH: usize = 16;
/// Nesting limit, guards against tables that point back at themselves.
const MAX_DEPTH: usize = 8;
const CID_CLASS_ROM_TABLE: u32 = 0x1;

/// Registers of one access port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApInfo {
    pub index: u8,
    pub idr: u32,
    pub base: u32,
    pub csw: u32,
}

impl ApInfo {
    /// IDR class field says memory access port.
    pub fn is_mem_ap(&self) -> bool {
        (self.idr >> 13) & 0xF == 0x8
    }

    /// ROM table address, if BASE points at one.
    pub fn rom_table(&self) -> Option<u32> {
        match self.base {
            0xFFFF_FFFF => None,
            base if base & 0b10 != 0 && base & 0b01 == 0 => None,
            base => Some(base & 0xFFFF_F000),
        }
    }
}

/// One present entry of a ROM table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomEntry {
    /// The entry word as read.
    pub raw: u32,
    /// Table base plus the signed entry offset.
    pub address: u32,
    pub component: Component,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Table(RomTable),
    Device { cid: u32, pid: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomTable {
    pub base: u32,
    pub cid: u32,
    pub pid: u64,
    /// MEMTYPE register, bit 0 set when the system memory is on the bus.
    pub memtype: u32,
    pub entries: Vec<RomEntry>,
}

/// Component class from a component ID.
pub fn cid_class(cid: u32) -> u32 {
    (cid >> 12) & 0xF
}

impl<T: Transport> Dap<T> {
    /// Read IDR, BASE and CSW of every AP from 0 up, stopping at the first
    /// whose IDR reads 0 or cannot be read. A BASE that cannot be read is
    /// reported as `0xFFFF_FFFF` (no ROM table), an unreadable CSW as 0.
    pub fn probe_aps(&mut self) -> Result<Vec<ApInfo>, DapError> {
        let mut aps = Vec::new();
        for index in 0..=u8::MAX {
            let idr = match self.ap_read(index, AP_IDR) {
                Ok(0) => break,
                Ok(idr) => idr,
                Err(err) => {
                    log::debug!("AP {index}: IDR read failed: {err}");
                    self.clear_errors()?;
                    break;
                }
            };
            let ap = ApInfo {
                index,
                idr,
                base: self.ap_read_or(index, AP_BASE, 0xFFFF_FFFF)?,
                csw: self.ap_read_or(index, AP_CSW, 0)?,
            };
            log::info!(
                "AP {index}: IDR {idr:08x} BASE {:08x} CSW {:08x}",
                ap.base,
                ap.csw
            );
            aps.push(ap);
        }
        Ok(aps)
    }

    fn ap_read_or(&mut self, index: u8, addr: u8, fallback: u32) -> Result<u32, DapError> {
        match self.ap_read(index, addr) {
            Ok(value) => Ok(value),
            Err(err) => {
                log::debug!("AP {index}: register {addr:#04x} read failed: {err}");
                self.clear_errors()?;
                Ok(fallback)
            }
        }
    }

    /// Abort and clear the sticky flags a failed AP access left behind.
    fn clear_errors(&mut self) -> Result<(), DapError> {
        self.abort()?;
        self.dp_write(DP_CTRL_STAT, CtrlStat::power_up_request().into_bits())
    }

    /// Walk the ROM table at `base` in AP `ap`'s memory space, nested
    /// tables included.
    pub fn read_rom_table(&mut self, ap: u8, base: u32) -> Result<RomTable, DapError> {
        self.rom_table_at(ap, base, 0)
    }

    fn rom_table_at(&mut self, ap: u8, base: u32, depth: usize) -> Result<RomTable, DapError> {
        let (cid, pid) = self.component_id(ap, base)?;
        let memtype = self.mem_read32(ap, base + 0xFCC)?;
        log::debug!("ROM table at {base:08x}: CID {cid:08x} PID {pid:010x}");

        let mut entries = Vec::new();
        let mut words = [0u8; ENTRY_BATCH * 4];
        'table: for first in (0..MAX_ROM_ENTRIES).step_by(ENTRY_BATCH) {
            self.mem_block_read(ap, base + 4 * first as u32, &mut words)?;
            for raw in words
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            {
                if raw == 0 {
                    break 'table;
                }
                if raw & 0b11 != 0b11 {
                    continue;
                }
                let address = base.wrapping_add(raw & 0xFFFF_F000);
                let (cid, pid) = self.component_id(ap, address)?;
                let component = if cid_class(cid) == CID_CLASS_ROM_TABLE && depth < MAX_DEPTH {
                    Component::Table(self.rom_table_at(ap, address, depth + 1)?)
                } else {
                    log::debug!("component at {address:08x}: CID {cid:08x} PID {pid:010x}");
                    Component::Device { cid, pid }
                };
                entries.push(RomEntry {
                    raw,
                    address,
                    component,
                });
            }
        }
        Ok(RomTable {
            base,
            cid,
            pid,
            memtype,
            entries,
        })
    }

    /// CIDR0..3 and PIDR0..7 of the 4 KiB component at `base`, each register
    /// contributing its low byte.
    fn component_id(&mut self, ap: u8, base: u32) -> Result<(u32, u64), DapError> {
        let mut cidr = [0u8; 16];
        let mut pidr_low = [0u8; 16];
        let mut pidr_high = [0u8; 16];
        self.mem_block_read(ap, base + 0xFF0, &mut cidr)?;
        self.mem_block_read(ap, base + 0xFE0, &mut pidr_low)?;
        self.mem_block_read(ap, base + 0xFD0, &mut pidr_high)?;
        let cid = low_bytes(&cidr) as u32;
        let pid = low_bytes(&pidr_low) | low_bytes(&pidr_high) << 32;
        Ok((cid, pid))
    }
}

/// Assemble the low bytes of four little-endian words.
fn low_bytes(regs: &[u8; 16]) -> u64 {
    regs.iter()
        .step_by(4)
        .enumerate()
        .map(|(i, &b)| (b as u64) << (8 * i))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::{ApInfo, Component, cid_class};
    use crate::{
        dap::tests::{dap, sim},
        sim::SimDap,
    };

    /// Component ID and peripheral ID registers of a 4 KiB component.
    fn component(sim: &mut SimDap, base: u32, class: u32, part: u32) {
        for (i, byte) in [0x0D, class << 4, 0x05, 0xB1].into_iter().enumerate() {
            sim.write_word(base + 0xFF0 + 4 * i as u32, byte);
        }
        for (i, byte) in [part & 0xFF, 0xB0 | part >> 8, 0x0B, 0x00].into_iter().enumerate() {
            sim.write_word(base + 0xFE0 + 4 * i as u32, byte);
        }
        sim.write_word(base + 0xFD0, 0x04);
    }

    #[test]
    fn probe_stops_at_first_missing_ap() {
        let mut dap = dap();
        dap.attach().unwrap();
        let aps = dap.probe_aps().unwrap();
        assert_eq!(aps.len(), 1);
        let ap = aps[0];
        assert_eq!(ap.idr, 0x2477_0011);
        assert!(ap.is_mem_ap());
        assert_eq!(ap.rom_table(), Some(0xE00F_F000));
    }

    #[test]
    fn faulting_ap_ends_the_scan() {
        let mut dap = dap();
        dap.attach().unwrap();
        sim(&mut dap).set_fault_other_aps(true);
        let aps = dap.probe_aps().unwrap();
        assert_eq!(aps.len(), 1);
        assert_eq!(sim(&mut dap).aborts(), 2);
        assert!(!sim(&mut dap).ctrl_stat().has_sticky());
        // the session is usable again
        sim(&mut dap).write_word(0x2000_0000, 0x600D_F00D);
        assert_eq!(dap.mem_read32(0, 0x2000_0000).unwrap(), 0x600D_F00D);
    }

    #[test]
    fn rom_table_base_formats() {
        let ap = |base| ApInfo {
            index: 0,
            idr: 0,
            base,
            csw: 0,
        };
        assert_eq!(ap(0xFFFF_FFFF).rom_table(), None);
        assert_eq!(ap(0x8000_0002).rom_table(), None);
        assert_eq!(ap(0x8000_0003).rom_table(), Some(0x8000_0000));
        assert_eq!(ap(0x8000_0000).rom_table(), Some(0x8000_0000));
    }

    #[test]
    fn walks_nested_rom_tables() {
        let mut dap = dap();
        dap.attach().unwrap();
        let sim = sim(&mut dap);
        // top table: a nested table 4 KiB up, an absent entry, a component
        // 64 KiB below
        component(sim, 0x8000_0000, 1, 0x4A1);
        sim.write_word(0x8000_0FCC, 1);
        sim.write_word(0x8000_0000, 0x0000_1003);
        sim.write_word(0x8000_0004, 0x0000_2002);
        sim.write_word(0x8000_0008, 0xFFFF_0003);
        component(sim, 0x8000_1000, 1, 0x4A2);
        sim.write_word(0x8000_1000, 0x0000_1003);
        component(sim, 0x8000_2000, 9, 0x9A0);
        component(sim, 0x7FFF_0000, 9, 0x906);

        let table = dap.read_rom_table(0, 0x8000_0000).unwrap();
        assert_eq!(cid_class(table.cid), 1);
        assert_eq!(table.cid, 0xB105_100D);
        assert_eq!(table.pid, 0x04_000B_B4A1);
        assert_eq!(table.memtype, 1);
        assert_eq!(table.entries.len(), 2);

        let nested = &table.entries[0];
        assert_eq!(nested.address, 0x8000_1000);
        let Component::Table(nested) = &nested.component else {
            panic!("expected a nested table");
        };
        assert_eq!(nested.entries.len(), 1);
        assert_eq!(nested.entries[0].address, 0x8000_2000);
        assert!(matches!(
            nested.entries[0].component,
            Component::Device { cid: 0xB105_900D, .. }
        ));

        assert_eq!(table.entries[1].address, 0x7FFF_0000);
        assert!(matches!(
            table.entries[1].component,
            Component::Device { pid: 0x04_000B_B906, .. }
        ));
    }
}
