//! Peek and poke target memory through MEM-AP 0.
//!
//! ```bash
//! cargo run --example mem -- read 0xfffc0000 64
//! cargo run --example mem -- write 0xfffc0000 0xdeadbeef
//! ```
use anyhow::{Context, bail};
use ftdi_dap::{Cable, Dap, Jtag, MpsseDriver, jtag::Family, list_all_device};

fn parse(arg: Option<String>) -> anyhow::Result<u32> {
    let arg = arg.context("missing argument")?;
    let value = match arg.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    value.with_context(|| format!("bad number {arg}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let command = args.next().context("usage: mem read|write ADDR [LEN|VALUE]")?;
    let addr = parse(args.next())?;

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
    dap.attach()?;

    match command.as_str() {
        "read" => {
            let len = match args.next() {
                Some(len) => parse(Some(len))?,
                None => 4,
            };
            let mut buf = vec![0; len as usize];
            dap.mem_block_read(0, addr, &mut buf)?;
            for (i, word) in buf.chunks_exact(4).enumerate() {
                let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                println!("{:#010x}: {word:#010x}", addr + 4 * i as u32);
            }
        }
        "write" => {
            let value = parse(args.next())?;
            dap.mem_write32(0, addr, value)?;
            println!("{addr:#010x} <- {value:#010x}");
        }
        other => bail!("unknown command {other}"),
    }
    Ok(())
}
