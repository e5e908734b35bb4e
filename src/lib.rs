//! `ccflash` installs a bootloader on a TI CC2531 USB dongle that still runs
//! the stock packet sniffer firmware, without a debugger.
//!
//! The sniffer's vendor request `0xD2` copies its body into SRAM without a
//! length check, which lets the host write anywhere in XDATA and IDATA. The
//! host uses that to:
//! 1. upload an image to free SRAM: the flashing stub followed by the
//! bootloader,
//! 2. set `MEMCTR.XMAP` so SRAM is executable at `0x8000`,
//! 3. overwrite a return address on the stack with the image's code
//! address.
//!
//! The stub then copies the bootloader into flash page 0 by DMA and lets the
//! watchdog reset the chip into it. See [`stub`] for the algorithm, [`asm`]
//! for the machine code and [`sim`] for the simulated chip both are tested
//! on.

pub use bytes;
use bytes::{BufMut, Bytes, BytesMut};
pub use rusb;

pub mod addr;
pub mod asm;
pub mod dma;
mod error;
pub mod layout;
pub mod regs;
pub mod sim;
pub mod stub;
pub mod usb;

pub use error::{Error, Result};

use crate::{asm::StubImage, layout::FREE_SPACE, regs::FLASH_PAGE_SIZE};

/// Value of erased flash, used to fill the bootloader up to a page.
const ERASED: u8 = 0xff;

/// Builds the image uploaded to SRAM: the stub, then the bootloader padded
/// to one flash page.
pub fn build_image(stub: &StubImage, bootloader: Bytes) -> Result<Bytes> {
    let page = FLASH_PAGE_SIZE as usize;
    if bootloader.len() > page {
        return Err(Error::PayloadTooBig {
            len: bootloader.len(),
            max: page,
        });
    }

    let mut image = BytesMut::with_capacity(stub.len() + page);
    insert_stub(&mut image, stub);
    let len = bootloader.len();
    image.put(bootloader);
    insert_padding(&mut image, page - len);

    check_fits(image.freeze())
}

/// Concatenates binaries as they are, for running arbitrary code instead of
/// the flashing stub.
pub fn build_raw_image(parts: Vec<Bytes>) -> Result<Bytes> {
    if parts.is_empty() {
        return Err(Error::NoPayload);
    }

    let mut image = BytesMut::new();
    for part in parts {
        image.put(part);
    }

    check_fits(image.freeze())
}

fn insert_stub(image: &mut BytesMut, stub: &StubImage) {
    image.put_slice(stub.bytes());
}

fn insert_padding(image: &mut BytesMut, len: usize) {
    let padding = [ERASED].repeat(len);
    image.put_slice(padding.as_slice());
}

fn check_fits(image: Bytes) -> Result<Bytes> {
    let max = FREE_SPACE.len();
    if image.len() > max {
        return Err(Error::ImageTooBig {
            len: image.len(),
            max,
        });
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_padding() {
        let mut image = BytesMut::new();
        insert_padding(&mut image, 10);
        assert_eq!(&image[..], &[ERASED; 10]);
    }

    #[test]
    fn test_build_image() {
        let stub = StubImage::assemble();
        let image = build_image(&stub, Bytes::from_static(b"\x02\x00\x40")).unwrap();

        assert_eq!(image.len(), stub.len() + FLASH_PAGE_SIZE as usize);
        assert_eq!(&image[..stub.len()], &stub.bytes()[..]);
        assert_eq!(&image[stub.len()..stub.len() + 3], b"\x02\x00\x40");
        assert!(image[stub.len() + 3..].iter().all(|b| *b == ERASED));
    }

    #[test]
    fn test_build_image_rejects_multi_page() {
        let stub = StubImage::assemble();
        let bootloader = Bytes::from(vec![0; FLASH_PAGE_SIZE as usize + 1]);
        assert!(matches!(
            build_image(&stub, bootloader),
            Err(Error::PayloadTooBig { len: 2049, max: 2048 })
        ));
    }

    #[test]
    fn test_build_raw_image() {
        let image = build_raw_image(vec![
            Bytes::from_static(b"stub"),
            Bytes::from_static(b"bootloader"),
        ])
        .unwrap();
        assert_eq!(&image[..], b"stubbootloader");

        assert!(matches!(build_raw_image(Vec::new()), Err(Error::NoPayload)));

        let too_big = Bytes::from(vec![0; FREE_SPACE.len() + 1]);
        assert!(matches!(
            build_raw_image(vec![too_big]),
            Err(Error::ImageTooBig { .. })
        ));
    }
}
