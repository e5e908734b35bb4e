//! DMA channel descriptors.
//!
//! The CC253x DMA controller reads its channel configuration from an 8-byte
//! record in XDATA:
//!
//! | byte | contents |
//! |------|----------|
//! | 0, 1 | source address, high byte first |
//! | 2, 3 | destination address, high byte first |
//! | 4    | `VLEN[7:5]`, `LEN[12:8]` |
//! | 5    | `LEN[7:0]` |
//! | 6    | `WORDSIZE[7]`, `TMODE[6:5]`, `TRIG[4:0]` |
//! | 7    | `SRCINC[7:6]`, `DESTINC[5:4]`, `IRQMASK[3]`, `M8[2]`, `PRIORITY[1:0]` |

use crate::regs::{FLASH_PAGE_SIZE, FWDATA};
use arbitrary_int::{u13, u5};
use bitbybit::{bitenum, bitfield};

/// Encoded size of a descriptor.
pub const DESCRIPTOR_LEN: usize = 8;

/// Largest transfer length `LEN` can hold.
pub const MAX_LEN: u16 = 0x1fff;

/// Trigger number of the flash controller.
pub const TRIG_FLASH: u5 = u5::new(18);

#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum TransferMode {
    Single = 0b00,
    Block = 0b01,
    RepeatedSingle = 0b10,
    RepeatedBlock = 0b11,
}

#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum Increment {
    None = 0b00,
    One = 0b01,
    Two = 0b10,
    MinusOne = 0b11,
}

/// Channel priority. The hardware treats `Reserved` like `High`.
#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum Priority {
    Low = 0b00,
    Normal = 0b01,
    High = 0b10,
    Reserved = 0b11,
}

/// The two configuration bytes of a descriptor, byte 6 in the high half.
#[bitfield(u16)]
#[derive(Debug, PartialEq, Eq)]
pub struct DmaConfig {
    #[bit(15, rw)]
    pub word_size: bool,
    #[bits(13..=14, rw)]
    pub mode: TransferMode,
    #[bits(8..=12, rw)]
    pub trigger: u5,
    #[bits(6..=7, rw)]
    pub src_inc: Increment,
    #[bits(4..=5, rw)]
    pub dst_inc: Increment,
    #[bit(3, rw)]
    pub irq_mask: bool,
    #[bit(2, rw)]
    pub m8: bool,
    #[bits(0..=1, rw)]
    pub priority: Priority,
}

impl DmaConfig {
    /// Byte-wise transfer into `FWDATA`, one byte per flash trigger.
    pub fn flash_write() -> Self {
        DmaConfig::new_with_raw_value(0)
            .with_word_size(false)
            .with_mode(TransferMode::Single)
            .with_trigger(TRIG_FLASH)
            .with_src_inc(Increment::One)
            .with_dst_inc(Increment::None)
            .with_irq_mask(false)
            .with_m8(false)
            .with_priority(Priority::High)
    }
}

/// Bytes 4 and 5. `VLEN` in the top three bits is left at zero, only
/// fixed-length transfers are used.
#[bitfield(u16)]
struct Length {
    #[bits(0..=12, rw)]
    len: u13,
}

/// A DMA channel configuration record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// Source address in XDATA.
    pub src: u16,
    /// Destination address in XDATA.
    pub dst: u16,
    /// Transfer length in bytes (`VLEN` = 0, fixed length).
    pub len: u16,
    pub config: DmaConfig,
}

impl DmaDescriptor {
    /// Descriptor copying one full flash page from `src` into `FWDATA`.
    ///
    /// The length is always a page, whatever the payload size is; bytes
    /// after the payload go to flash as they are.
    pub fn flash_page(src: u16) -> Self {
        DmaDescriptor {
            src,
            dst: FWDATA,
            len: FLASH_PAGE_SIZE,
            config: DmaConfig::flash_write(),
        }
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let [src_h, src_l] = self.src.to_be_bytes();
        let [dst_h, dst_l] = self.dst.to_be_bytes();
        let [len_h, len_l] = Length::new_with_raw_value(0)
            .with_len(u13::new(self.len & MAX_LEN))
            .raw_value()
            .to_be_bytes();
        let [cfg_h, cfg_l] = self.config.raw_value().to_be_bytes();
        [src_h, src_l, dst_h, dst_l, len_h, len_l, cfg_h, cfg_l]
    }

    /// Decodes a descriptor. `VLEN` is ignored, only fixed-length transfers
    /// are modelled.
    pub fn from_bytes(raw: &[u8; DESCRIPTOR_LEN]) -> Self {
        DmaDescriptor {
            src: u16::from_be_bytes([raw[0], raw[1]]),
            dst: u16::from_be_bytes([raw[2], raw[3]]),
            len: Length::new_with_raw_value(u16::from_be_bytes([raw[4], raw[5]]))
                .len()
                .value(),
            config: DmaConfig::new_with_raw_value(u16::from_be_bytes([raw[6], raw[7]])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_write_config_bits() {
        // TRIG = 18, single mode, byte size; SRCINC +1, high priority.
        assert_eq!(DmaConfig::flash_write().raw_value(), 0x1242);
    }

    #[test]
    fn test_flash_page_layout() {
        let desc = DmaDescriptor::flash_page(0x0412);
        assert_eq!(
            desc.to_bytes(),
            [0x04, 0x12, 0x62, 0x73, 0x08, 0x00, 0x12, 0x42]
        );
    }

    #[test]
    fn test_descriptor_is_determined_by_source() {
        let a = DmaDescriptor::flash_page(0x03f0).to_bytes();
        let b = DmaDescriptor::flash_page(0x03f0).to_bytes();
        assert_eq!(a, b);
        assert_ne!(a, DmaDescriptor::flash_page(0x03f1).to_bytes());
    }

    #[test]
    fn test_decode_ignores_vlen() {
        let raw = [0x00, 0x10, 0x62, 0x73, 0xe8, 0x00, 0x12, 0x43];
        let desc = DmaDescriptor::from_bytes(&raw);
        assert_eq!(desc.len, 0x0800);
        assert_eq!(desc.config.priority(), Priority::Reserved);
        assert_eq!(desc.config.src_inc(), Increment::One);
        assert_eq!(desc.config.dst_inc(), Increment::None);
        assert_eq!(desc.config.trigger(), TRIG_FLASH);
    }

    #[test]
    fn test_config_fields_land_in_their_bytes() {
        let config = DmaConfig::new_with_raw_value(0)
            .with_word_size(true)
            .with_mode(TransferMode::RepeatedBlock)
            .with_dst_inc(Increment::MinusOne);
        assert_eq!(config.raw_value(), 0xe030);
        assert_eq!(
            DmaConfig::new_with_raw_value(0x1242),
            DmaConfig::flash_write()
        );
    }
}
