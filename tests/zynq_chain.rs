//! End to end over the simulated probe: a Zynq-style chain with the ARM DAP
//! nearest TDO and the programmable logic TAP behind it.
use ftdi_dap::{
    Cable, ChipType, Dap, DapError, Jtag, MpsseDriver,
    debug_port::UserDebugPort,
    jtag::Family,
    sim::{SimLink, SimTap},
};

const DAP: u32 = 0x4BA0_0477;
const XC7Z020: u32 = 0x2372_7093;

fn jtag() -> Jtag<MpsseDriver<SimLink>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let link = SimLink::new(vec![SimTap::dap(DAP), SimTap::fpga(XC7Z020)]);
    Jtag::new(MpsseDriver::new(link, ChipType::FT2232H, Cable::default()).unwrap())
}

#[test]
fn memory_and_fabric_registers() -> anyhow::Result<()> {
    let mut jtag = jtag();
    let devices = jtag.enumerate()?;
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1].info.name, "xc7z020");

    jtag.select_by_family(Family::ArmDap)?;
    let mut dap = Dap::new(jtag);
    dap.attach()?;

    let image: Vec<u8> = (0..4096u32).map(|i| (i ^ (i >> 8)) as u8).collect();
    dap.mem_block_write(0, 0x0010_0000, &image)?;
    dap.mem_write32(0, 0x0010_1000, 0xFEED_F00D)?;

    let mut back = vec![0; image.len() + 4];
    dap.mem_block_read(0, 0x0010_0000, &mut back)?;
    assert_eq!(&back[..image.len()], &image[..]);
    assert_eq!(&back[image.len()..], &0xFEED_F00Du32.to_le_bytes());
    assert!(matches!(
        dap.mem_read32(0, 0x0010_0002),
        Err(DapError::Misaligned { .. })
    ));

    let mut jtag = dap.into_jtag();
    let mut port = UserDebugPort::open(&mut jtag)?;
    port.write(7, 0x0BAD_CAFE)?;
    assert_eq!(port.read(7)?, 0x0BAD_CAFE);

    let tcks = jtag.transport().link().tck_count();
    jtag.close()?;
    assert!(tcks > 0);
    Ok(())
}
