//! Enumerate the JTAG scan chain behind the first FTDI probe.
//!
//! TCK, TDI, TDO and TMS are expected on AD0..AD3 of the first MPSSE
//! interface.
//!
//! ```bash
//! RUST_LOG=info cargo run --example jtag_scan_chain
//! ```
use std::time::Instant;

use ftdi_dap::{Cable, Jtag, MpsseDriver, list_all_device};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let now = Instant::now();

    let devices = list_all_device()?;
    anyhow::ensure!(!devices.is_empty(), "Not found Ftdi devices");
    let driver = MpsseDriver::open(
        &devices[0].usb_device,
        devices[0].interface[0],
        Cable::default(),
    )?;
    let mut jtag = Jtag::new(driver);
    jtag.set_speed(1_000)?;

    for (position, device) in jtag.enumerate()?.iter().enumerate() {
        println!(
            "{position:2}: {:#010x} {} ({}, ir {} bits)",
            device.idcode, device.info.name, device.info.family, device.info.irsize
        );
    }
    println!("Finish Scan Using {:?}", now.elapsed());
    jtag.close()?;
    Ok(())
}
