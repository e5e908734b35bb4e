//! The two views of the CC2531 SRAM.
//!
//! With `MEMCTR.XMAP` set, the 8 KiB of SRAM that lives at the bottom of the
//! XDATA (data/peripheral) space also appears in CODE space at [`XMAP_BASE`].
//! The same physical byte therefore has two addresses that differ only in
//! bit 15. [`PhysAddr`] names the byte, the rendering functions produce the
//! address to use in either space.

use std::fmt;

/// Code address at which SRAM is mapped when XMAP is enabled.
pub const XMAP_BASE: u16 = 0x8000;

/// Mask that turns a code space SRAM address into its data space alias.
pub const DATA_SPACE_MASK: u16 = !XMAP_BASE;

/// Size of the on-chip SRAM.
pub const SRAM_SIZE: u16 = 0x2000;

/// Translates a code space address into the data space by clearing the
/// distinguishing bit. Data space addresses pass through unchanged.
#[inline(always)]
pub const fn translate(addr: u16) -> u16 {
    addr & DATA_SPACE_MASK
}

/// A byte of SRAM, independent of the address space used to reach it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(u16);

impl PhysAddr {
    pub const fn new(offset: u16) -> Self {
        PhysAddr(offset & DATA_SPACE_MASK)
    }

    /// Address as seen through the XMAP window in code space.
    pub const fn from_code(addr: u16) -> Self {
        PhysAddr(translate(addr))
    }

    /// Address as seen in XDATA.
    pub const fn from_data(addr: u16) -> Self {
        PhysAddr(translate(addr))
    }

    pub const fn to_code_space(self) -> u16 {
        self.0 | XMAP_BASE
    }

    pub const fn to_data_space(self) -> u16 {
        self.0
    }

    /// Advances the address, wrapping inside the 15-bit window exactly like
    /// the 8051 `ADD`/`ADDC` plus mask sequence in the stub does.
    pub const fn offset(self, by: u16) -> Self {
        PhysAddr::new(self.0.wrapping_add(by))
    }

    pub const fn is_sram(self) -> bool {
        self.0 < SRAM_SIZE
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysAddr(code {:#06x}, data {:#06x})",
            self.to_code_space(),
            self.to_data_space()
        )
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.to_data_space())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_alias_same_byte() {
        let addr = PhysAddr::from_code(0x83a0);
        assert_eq!(addr.to_data_space(), 0x03a0);
        assert_eq!(addr.to_code_space(), 0x83a0);
        assert_eq!(addr, PhysAddr::from_data(0x03a0));
    }

    #[test]
    fn test_translate_is_idempotent() {
        for addr in [0x0000u16, 0x03a0, 0x1e8f, 0x8000, 0x83a0, 0xffff].iter() {
            let once = translate(*addr);
            assert_eq!(translate(once), once);
            assert_eq!(once & XMAP_BASE, 0);
        }
    }

    #[test]
    fn test_offset_wraps_inside_window() {
        let addr = PhysAddr::from_code(0xfff0).offset(0x20);
        assert_eq!(addr.to_data_space(), 0x0010);
        assert!(PhysAddr::new(0x1fff).is_sram());
        assert!(!PhysAddr::new(0x2000).is_sram());
    }
}
