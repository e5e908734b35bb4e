#![deny(rust_2018_idioms)]

#[macro_use]
mod macros;

use ccflash::{
    addr::PhysAddr,
    asm::StubImage,
    bytes::Bytes,
    layout::FREE_SPACE,
    rusb::{DeviceHandle, GlobalContext},
    usb::{get_sniffer_device, open_on_port, Dongle, Port},
    Error,
};
use std::{path::PathBuf, thread, time::Duration};

/// How often to look for the dongle after it reset, and how long to wait
/// between tries.
const REENUMERATION_TRIES: usize = 10;
const REENUMERATION_INTERVAL: Duration = Duration::from_secs(1);

/// Flashes a bootloader onto a stock TI CC2531 USB dongle, no tools
/// required.
#[derive(argh::FromArgs)]
struct Arguments {
    /// wait until a dongle with the sniffer firmware is available.
    #[argh(switch, short = 'w')]
    wait: bool,

    /// override the sniffer vendor ID.
    #[argh(option, short = 'V')]
    vendor_id: Option<u16>,
    /// override the sniffer product ID.
    #[argh(option, short = 'P')]
    product_id: Option<u16>,

    /// upload and run the binaries as they are, without the flashing stub.
    #[argh(switch)]
    raw: bool,

    /// write the flashing stub to this file and exit.
    #[argh(option)]
    emit_stub: Option<PathBuf>,

    /// the bootloader to flash, or with --raw the 8051 binaries to
    /// concatenate and run from SRAM.
    #[argh(positional)]
    binaries: Vec<PathBuf>,
}

fn main() {
    let args = argh::from_env::<Arguments>();
    let result = match args.emit_stub.clone() {
        Some(path) => emit_stub(path),
        None => inject(args),
    };
    if let Err(err) = result {
        error!("Failed", "{}", err);
        std::process::exit(1);
    }
}

fn emit_stub(path: PathBuf) -> Result<(), Error> {
    let stub = StubImage::assemble();
    std::fs::write(&path, stub.bytes())?;
    ok!("Wrote", "{} byte stub to {:?}", stub.len(), path);
    Ok(())
}

fn inject(args: Arguments) -> Result<(), Error> {
    let image = read_image(&args)?;
    let entry = PhysAddr::from_data(FREE_SPACE.start);

    info!("Searching", "for a CC2531 with the sniffer firmware...");
    let dongle = find_dongle(args.wait, args.vendor_id, args.product_id)?;
    let device = dongle.get_device();
    let port = Port::of(&device)?;
    info!(
        "Found",
        "dongle with firmware {:#06x} on {}",
        dongle.bcd_device(),
        port
    );

    info!("Uploading", "{} bytes to {:#06x}", image.len(), entry.to_data_space());
    dongle.upload(entry, &image)?;
    info!("Enabling", "code execution from SRAM");
    dongle.enable_xmap()?;
    info!("Jumping", "to {:#06x}", entry.to_code_space());
    match dongle.overwrite_return_address(entry) {
        Ok(()) => {}
        // The dongle may already be gone by the time the transfer completes.
        Err(Error::UnknownUsbError(rusb::Error::NoDevice))
        | Err(Error::UnknownUsbError(rusb::Error::Pipe))
        | Err(Error::UnknownUsbError(rusb::Error::Io))
        | Err(Error::ShortTransfer { .. }) => {}
        Err(err) => return Err(err),
    }
    drop(dongle);
    ok!("Injected", "the dongle should now be running the uploaded code");

    info!("Watching", "{}...", port);
    let handle = wait_for_reenumeration(&port)?;
    let descriptor = handle.device().device_descriptor()?;
    ok!(
        "Found",
        "device {:04x}:{:04x} on {}",
        descriptor.vendor_id(),
        descriptor.product_id(),
        port
    );

    Ok(())
}

fn read_image(args: &Arguments) -> Result<Bytes, Error> {
    let mut parts = Vec::with_capacity(args.binaries.len());
    for path in &args.binaries {
        info!("Reading", "{:?}...", path);
        parts.push(Bytes::from(std::fs::read(path)?));
    }

    if args.raw {
        return ccflash::build_raw_image(parts);
    }

    // Several binaries make up one bootloader page together.
    let bootloader = match parts.len() {
        0 => return Err(Error::NoPayload),
        1 => parts.remove(0),
        _ => Bytes::from(parts.concat()),
    };
    let stub = StubImage::assemble();
    let image = ccflash::build_image(&stub, bootloader)?;
    ok!(
        "Built",
        "{} byte stub followed by a {} byte page",
        stub.len(),
        image.len() - stub.len()
    );
    Ok(image)
}

fn find_dongle(wait: bool, vid: Option<u16>, pid: Option<u16>) -> Result<Dongle, Error> {
    let get_device = || match get_sniffer_device(vid, pid) {
        Ok(dev) => Dongle::new(dev),
        Err(rusb::Error::Access) => Err(Error::PermissionDenied),
        Err(rusb::Error::NoDevice) => Err(Error::NoDevice),
        Err(e) => Err(e.into()),
    };

    let mut device = get_device();
    while wait {
        device = match device {
            Ok(_) => break,
            Err(Error::NoDevice) => {
                thread::sleep(Duration::from_millis(500));
                get_device()
            }
            Err(err) => return Err(err),
        }
    }

    device
}

fn wait_for_reenumeration(port: &Port) -> Result<DeviceHandle<GlobalContext>, Error> {
    let mut last = None;
    for _ in 0..REENUMERATION_TRIES {
        thread::sleep(REENUMERATION_INTERVAL);
        match open_on_port(port) {
            Ok(handle) => return Ok(handle),
            Err(Error::NoDevice) => {
                info!("Waiting", "nothing there yet");
            }
            Err(Error::UnknownUsbError(err)) => {
                info!("Waiting", "not responding yet ({})", err);
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(Error::DeviceLost(last))
}
