//! CC2531 register map and the register interface the stub runs against.
//!
//! Only the registers the flashing stub and the injector touch are listed.
//! SFRs are addressed through the 8051 direct address space, the flash
//! controller through XDATA.

use arbitrary_int::u4;
use bitbybit::{bitenum, bitfield};

/// Stack pointer.
pub const SP: u8 = 0x81;
/// Data pointer, low byte.
pub const DPL: u8 = 0x82;
/// Data pointer, high byte.
pub const DPH: u8 = 0x83;
/// Second data pointer, low byte.
pub const DPL1: u8 = 0x84;
/// Second data pointer, high byte.
pub const DPH1: u8 = 0x85;
/// Port 1.
pub const P1: u8 = 0x90;
/// Data pointer select. Bit 0 picks the pointer `MOVX @DPTR` uses.
pub const DPS: u8 = 0x92;
/// Interrupt enable.
pub const IE: u8 = 0xA8;
/// Memory arbiter control.
pub const MEMCTR: u8 = 0xC7;
/// Watchdog timer control.
pub const WDCTL: u8 = 0xC9;
/// Program status word.
pub const PSW: u8 = 0xD0;
/// DMA interrupt flags.
pub const DMAIRQ: u8 = 0xD1;
/// DMA channel 0 configuration address, low byte.
pub const DMA0CFGL: u8 = 0xD4;
/// DMA channel 0 configuration address, high byte.
pub const DMA0CFGH: u8 = 0xD5;
/// DMA channel arm.
pub const DMAARM: u8 = 0xD6;
/// DMA channel start request.
pub const DMAREQ: u8 = 0xD7;
/// Accumulator.
pub const ACC: u8 = 0xE0;

/// Flash controller control and status.
pub const FCTL: u16 = 0x6270;
/// Flash word address, low byte.
pub const FADDRL: u16 = 0x6271;
/// Flash word address, high byte.
pub const FADDRH: u16 = 0x6272;
/// Flash write data.
pub const FWDATA: u16 = 0x6273;

/// SFRs are mirrored into XDATA at this base.
pub const XDATA_SFR_BASE: u16 = 0x7000;

/// `IE.EA`, global interrupt enable.
pub const IE_EA: u8 = 1 << 7;
/// `MEMCTR.XMAP`, maps SRAM into code space.
pub const MEMCTR_XMAP: u8 = 1 << 3;
/// `P1.0` drives the USB D+ pull-up on the dongle.
pub const P1_USB_PULLUP: u8 = 1 << 0;

/// `DMAARM` bit for channel 0.
pub const DMAARM_CH0: u8 = 1 << 0;
/// `DMAIRQ` bit for channel 0.
pub const DMAIRQ_CH0: u8 = 1 << 0;

/// `FCTL.ERASE`, erase the page selected by `FADDRH`.
pub const FCTL_ERASE: u8 = 1 << 0;
/// `FCTL.WRITE`, start a write sequence fed through `FWDATA`.
pub const FCTL_WRITE: u8 = 1 << 1;
/// `FCTL.BUSY`, the controller is erasing or writing.
pub const FCTL_BUSY: u8 = 1 << 7;

/// `DPS` bit selecting the second data pointer.
pub const DPS_DPTR1: u8 = 1 << 0;

/// Bit addresses used with the 8051 bit instructions.
pub mod bit {
    /// `IE.7`
    pub const EA: u8 = 0xAF;
    /// `P1.0`
    pub const P1_0: u8 = 0x90;
    /// `ACC.7`
    pub const ACC_7: u8 = 0xE7;
}

/// Size of one flash page in bytes.
pub const FLASH_PAGE_SIZE: u16 = 2048;
/// `FADDRH:FADDRL` address flash in 32-bit words.
pub const FLASH_WORD_SIZE: u32 = 4;

/// Watchdog intervals, in cycles of the 32 kHz clock.
#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum WatchdogInterval {
    Cycles32768 = 0b00,
    Cycles8192 = 0b01,
    Cycles512 = 0b10,
    Cycles64 = 0b11,
}

impl WatchdogInterval {
    /// The shortest interval the hardware offers.
    pub const SHORTEST: WatchdogInterval = WatchdogInterval::Cycles64;

    /// `WDCTL` value that enables the watchdog with this interval.
    pub fn wdctl(self) -> u8 {
        Wdctl::new_with_raw_value(0)
            .with_mode(WatchdogMode::Watchdog)
            .with_interval(self)
            .raw_value()
    }
}

#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum WatchdogMode {
    Idle = 0b00,
    Reserved = 0b01,
    Watchdog = 0b10,
    Timer = 0b11,
}

/// Watchdog timer control.
#[bitfield(u8)]
#[derive(Debug, PartialEq, Eq)]
pub struct Wdctl {
    // Writing 0xA then 0x5 here feeds the watchdog.
    #[bits(4..=7, rw)]
    pub clear: u4,
    #[bits(2..=3, rw)]
    pub mode: WatchdogMode,
    #[bits(0..=1, rw)]
    pub interval: WatchdogInterval,
}

/// Access to the device registers and memories.
///
/// Everything the stub does goes through this trait, so it can run against a
/// simulated chip. Reads take `&mut self` since reading a status register
/// may have side effects on real hardware.
pub trait Registers {
    fn read_sfr(&mut self, addr: u8) -> u8;
    fn write_sfr(&mut self, addr: u8, value: u8);

    fn read_xdata(&mut self, addr: u16) -> u8;
    fn write_xdata(&mut self, addr: u16, value: u8);

    fn read_idata(&mut self, addr: u8) -> u8;
    fn write_idata(&mut self, addr: u8, value: u8);

    /// Instruction fetch from code space.
    fn read_code(&mut self, addr: u16) -> u8;

    /// Clears `mask` in an SFR, leaving the other bits alone.
    fn clear_sfr_bits(&mut self, addr: u8, mask: u8) {
        let value = self.read_sfr(addr);
        self.write_sfr(addr, value & !mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortest_watchdog_value() {
        assert_eq!(WatchdogInterval::SHORTEST.wdctl(), 0x0b);
        let wdctl = Wdctl::new_with_raw_value(0x0b);
        assert_eq!(wdctl.interval(), WatchdogInterval::Cycles64);
        assert_eq!(wdctl.mode(), WatchdogMode::Watchdog);
        assert_eq!(wdctl.clear(), u4::new(0));
    }

    #[test]
    fn test_bit_addresses_match_registers() {
        assert_eq!(bit::EA & 0xf8, IE);
        assert_eq!(1 << (bit::EA & 7), IE_EA);
        assert_eq!(bit::P1_0 & 0xf8, P1);
        assert_eq!(1 << (bit::P1_0 & 7), P1_USB_PULLUP);
        assert_eq!(bit::ACC_7 & 0xf8, ACC);
    }
}
