//! Word-aligned target memory access through a MEM-AP.
use super::{
    Dap, DapError,
    regs::{
        self, ACK_OK, ACK_WAIT, AP_CSW, AP_DRW, AP_TAR, ApCsw, CSW_ADDR_INC_OFF,
        CSW_ADDR_INC_SINGLE, IR_APACC,
    },
};
use crate::transport::{CaptureId, Captures, Transport};

/// TAR auto-increment is only guaranteed inside a block of this size.
const TAR_BLOCK: u32 = 1024;

fn check_aligned(addr: u32) -> Result<(), DapError> {
    if addr % 4 != 0 {
        return Err(DapError::Misaligned { addr });
    }
    Ok(())
}

fn check_block(addr: u32, len: usize) -> Result<(), DapError> {
    check_aligned(addr)?;
    if len % 4 != 0 || addr as u64 + len as u64 > 1 << 32 {
        return Err(DapError::BadLength(len));
    }
    Ok(())
}

impl<T: Transport> Dap<T> {
    /// Read one word of AP `ap`'s memory space.
    pub fn mem_read32(&mut self, ap: u8, addr: u32) -> Result<u32, DapError> {
        check_aligned(addr)?;
        self.ap_write(ap, AP_CSW, ApCsw::word_access(CSW_ADDR_INC_OFF).into_bits())?;
        self.ap_write(ap, AP_TAR, addr)?;
        self.ap_read(ap, AP_DRW)
    }

    pub fn mem_write32(&mut self, ap: u8, addr: u32, value: u32) -> Result<(), DapError> {
        check_aligned(addr)?;
        self.ap_write(ap, AP_CSW, ApCsw::word_access(CSW_ADDR_INC_OFF).into_bits())?;
        self.ap_write(ap, AP_TAR, addr)?;
        self.ap_write(ap, AP_DRW, value)
    }

    /// Fill `buf` from target memory starting at `addr`.
    ///
    /// The transfer is split at every 1 KiB boundary and each piece is one
    /// batch. On error `buf` is left untouched.
    pub fn mem_block_read(&mut self, ap: u8, addr: u32, buf: &mut [u8]) -> Result<(), DapError> {
        check_block(addr, buf.len())?;
        let mut words = vec![0; buf.len() / 4];
        let mut done = 0;
        while done < words.len() {
            let at = addr + (done * 4) as u32;
            let n = chunk_words(at).min(words.len() - done);
            self.read_chunk(ap, at, &mut words[done..done + n])?;
            done += n;
        }
        for (bytes, word) in buf.chunks_exact_mut(4).zip(words) {
            bytes.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// Write `data` to target memory starting at `addr`.
    ///
    /// Pieces before a failing one have already been written.
    pub fn mem_block_write(&mut self, ap: u8, addr: u32, data: &[u8]) -> Result<(), DapError> {
        check_block(addr, data.len())?;
        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let mut done = 0;
        while done < words.len() {
            let at = addr + (done * 4) as u32;
            let n = chunk_words(at).min(words.len() - done);
            self.write_chunk(ap, at, &words[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn read_chunk(&mut self, ap: u8, addr: u32, out: &mut [u32]) -> Result<(), DapError> {
        let count = out.len();
        self.ap_select(ap, AP_CSW)?;
        let csw = ApCsw::word_access(CSW_ADDR_INC_SINGLE).into_bits();
        let ((setup, data, status), captures) = self.batch(|dap| {
            dap.queue_ir(IR_APACC)?;
            let setup = vec![
                dap.queue_scan(regs::write(AP_CSW, csw))?,
                dap.queue_scan(regs::write(AP_TAR, addr))?,
                dap.queue_scan(regs::read(AP_DRW))?,
            ];
            let mut data = Vec::with_capacity(count);
            for _ in 1..count {
                dap.queue_ir_always(IR_APACC)?;
                data.push(dap.queue_scan(regs::read(AP_DRW))?);
            }
            // the last word comes back with a dummy read
            data.push(dap.queue_scan(regs::read(AP_TAR))?);
            let status = dap.queue_status()?;
            Ok((setup, data, status))
        })?;
        self.check_acks(addr, &setup, &captures)?;
        let words = self.check_acks(addr, &data, &captures)?;
        self.check_queued_status(&captures, status)?;
        out.copy_from_slice(&words);
        Ok(())
    }

    fn write_chunk(&mut self, ap: u8, addr: u32, words: &[u32]) -> Result<(), DapError> {
        self.ap_select(ap, AP_CSW)?;
        let csw = ApCsw::word_access(CSW_ADDR_INC_SINGLE).into_bits();
        let ((setup, data, status), captures) = self.batch(|dap| {
            dap.queue_ir(IR_APACC)?;
            let setup = vec![
                dap.queue_scan(regs::write(AP_CSW, csw))?,
                dap.queue_scan(regs::write(AP_TAR, addr))?,
            ];
            let mut data = Vec::with_capacity(words.len());
            for &word in words {
                dap.queue_ir_always(IR_APACC)?;
                data.push(dap.queue_scan(regs::write(AP_DRW, word))?);
            }
            let status = dap.queue_status()?;
            Ok((setup, data, status))
        })?;
        self.check_acks(addr, &setup, &captures)?;
        self.check_acks(addr, &data, &captures)?;
        self.check_queued_status(&captures, status)?;
        Ok(())
    }

    /// Data of streamed scans, failing on the first one not acknowledged OK.
    fn check_acks(
        &mut self,
        addr: u32,
        ids: &[CaptureId],
        captures: &Captures,
    ) -> Result<Vec<u32>, DapError> {
        let mut words = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            match regs::response(captures.u64(*id)) {
                (ACK_OK, word) => words.push(word),
                (ack, _) => {
                    self.invalidate();
                    let at = addr.wrapping_add(4 * i as u32);
                    log::warn!("block transfer at {at:#010x} failed with ACK {ack:#05b}");
                    return Err(match ack {
                        ACK_WAIT => DapError::Busy { addr: at },
                        ack => DapError::ProtocolFault { ack },
                    });
                }
            }
        }
        Ok(words)
    }
}

/// Words from `addr` to the end of its TAR block.
fn chunk_words(addr: u32) -> usize {
    ((TAR_BLOCK - addr % TAR_BLOCK) / 4) as usize
}

#[cfg(test)]
mod tests {
    use super::chunk_words;
    use crate::dap::{
        DapError,
        tests::{dap, sim},
    };

    #[test]
    fn chunk_sizes() {
        assert_eq!(chunk_words(0x3F8), 2);
        assert_eq!(chunk_words(0x400), 256);
        assert_eq!(chunk_words(0x2000_0FFC), 1);
    }

    #[test]
    fn single_words() {
        let mut dap = dap();
        dap.mem_write32(0, 0x2000_0000, 0xDEAD_BEEF).unwrap();
        assert_eq!(sim(&mut dap).read_word(0x2000_0000), 0xDEAD_BEEF);
        sim(&mut dap).write_word(0x2000_0004, 0x0123_4567);
        assert_eq!(dap.mem_read32(0, 0x2000_0004).unwrap(), 0x0123_4567);
    }

    #[test]
    fn misaligned_and_bad_length_never_touch_the_probe() {
        let mut dap = dap();
        let before = dap.jtag().transport().link().writes();
        assert!(matches!(
            dap.mem_read32(0, 0x2000_0002),
            Err(DapError::Misaligned { addr: 0x2000_0002 })
        ));
        assert!(matches!(
            dap.mem_write32(0, 0x2000_0001, 0),
            Err(DapError::Misaligned { .. })
        ));
        assert!(matches!(
            dap.mem_block_read(0, 0x1000, &mut [0; 6]),
            Err(DapError::BadLength(6))
        ));
        assert!(matches!(
            dap.mem_block_write(0, 0xFFFF_FFF8, &[0; 12]),
            Err(DapError::BadLength(12))
        ));
        dap.mem_block_read(0, 0x1000, &mut []).unwrap();
        assert_eq!(dap.jtag().transport().link().writes(), before);
    }

    #[test]
    fn block_read_splits_at_1k_boundary() {
        let mut dap = dap();
        for (i, addr) in (0x3F8..0x408).step_by(4).enumerate() {
            sim(&mut dap).write_word(addr, 0x1111_1111 * (i as u32 + 1));
        }
        sim(&mut dap).write_word(0x000, 0xBAD0_BAD0);
        let mut buf = [0; 16];
        dap.mem_block_read(0, 0x3F8, &mut buf).unwrap();
        assert_eq!(sim(&mut dap).tar_writes(), [0x3F8, 0x400]);
        let words: Vec<u32> = buf
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .collect();
        assert_eq!(words, [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444]);
    }

    #[test]
    fn block_write_then_read_back() {
        let mut dap = dap();
        let data: Vec<u8> = (0..2560u32).map(|i| (i * 13 + 7) as u8).collect();
        dap.mem_block_write(0, 0x1000_0200, &data).unwrap();
        assert_eq!(
            sim(&mut dap).tar_writes(),
            [0x1000_0200, 0x1000_0400, 0x1000_0800]
        );
        assert_eq!(
            sim(&mut dap).read_word(0x1000_0200),
            u32::from_le_bytes([7, 20, 33, 46])
        );
        let mut back = vec![0; data.len()];
        dap.mem_block_read(0, 0x1000_0200, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn block_read_reports_sticky_error() {
        let mut dap = dap();
        sim(&mut dap).set_fault(0x4000_0010..0x4000_0014);
        let mut buf = [0xAA; 32];
        assert!(matches!(
            dap.mem_block_read(0, 0x4000_0000, &mut buf),
            Err(DapError::Sticky(_))
        ));
        assert_eq!(buf, [0xAA; 32]);
    }

    #[test]
    fn wait_inside_stream_is_busy() {
        let mut dap = dap();
        dap.mem_read32(0, 0x2000_0000).unwrap();
        sim(&mut dap).inject_wait(3);
        assert!(matches!(
            dap.mem_block_read(0, 0x2000_0000, &mut [0; 8]),
            Err(DapError::Busy { addr: 0x2000_0000 })
        ));
    }
}
