//! Attach to the ARM DAP on the chain, list its access ports and walk the
//! ROM table of each MEM-AP.
//!
//! ```bash
//! RUST_LOG=info cargo run --example dap_probe
//! ```
use ftdi_dap::{
    Cable, Dap, Jtag, MpsseDriver,
    dap::{Component, RomTable},
    jtag::Family,
    list_all_device,
};

fn print_table(table: &RomTable, indent: usize) {
    println!(
        "{:indent$}ROM table @ {:#010x} cid {:#010x} pid {:#012x} memtype {:#x}",
        "", table.base, table.cid, table.pid, table.memtype
    );
    for entry in &table.entries {
        match &entry.component {
            Component::Table(nested) => print_table(nested, indent + 2),
            Component::Device { cid, pid } => println!(
                "{:indent$}  {:#010x} cid {cid:#010x} pid {pid:#012x}",
                "", entry.address
            ),
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let devices = list_all_device()?;
    anyhow::ensure!(!devices.is_empty(), "Not found Ftdi devices");
    let driver = MpsseDriver::open(
        &devices[0].usb_device,
        devices[0].interface[0],
        Cable::default(),
    )?;
    let mut jtag = Jtag::new(driver);
    jtag.enumerate()?;
    jtag.select_by_family(Family::ArmDap)?;

    let mut dap = Dap::new(jtag);
    let ctrl = dap.attach()?;
    println!("CTRL/STAT {:#010x}", ctrl.into_bits());

    for ap in dap.probe_aps()? {
        println!(
            "AP {}: idr {:#010x} base {:#010x} csw {:#010x}",
            ap.index, ap.idr, ap.base, ap.csw
        );
        if let (true, Some(base)) = (ap.is_mem_ap(), ap.rom_table()) {
            print_table(&dap.read_rom_table(ap.index, base)?, 2);
        }
    }
    Ok(())
}
