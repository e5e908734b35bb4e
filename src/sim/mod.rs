//! A CC2531 good enough to run the flashing stub.
//!
//! Models SRAM with its XMAP alias in code space, the SFRs the stub touches,
//! DMA channel 0, the flash controller and the watchdog. DMA transfers run to
//! completion as soon as the flash controller asks for data; the busy flag
//! then stays set for a configurable number of status reads.

mod cpu;

pub use cpu::{Cpu, Halt};

use crate::{
    addr::{PhysAddr, SRAM_SIZE, XMAP_BASE},
    dma::{DmaDescriptor, Increment, DESCRIPTOR_LEN, TRIG_FLASH},
    layout::AddressSpace,
    regs::{self, Registers, WatchdogInterval, WatchdogMode, Wdctl},
};

/// Total flash of the CC2531F256.
pub const FLASH_SIZE: usize = 256 * 1024;

/// How long the flash controller reports busy after a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashTiming {
    /// The first `n` reads of `FCTL` see `BUSY`.
    BusyReads(u32),
    /// `BUSY` never clears.
    Stall,
}

impl Default for FlashTiming {
    fn default() -> Self {
        FlashTiming::BusyReads(16)
    }
}

pub struct Cc2531 {
    sram: Vec<u8>,
    idata: [u8; 256],
    sfr: [u8; 128],
    flash: Vec<u8>,
    fctl: u8,
    faddr: u16,
    timing: FlashTiming,
    busy_reads: Option<u32>,
    peripheral_writes: u64,
    transfers: Vec<DmaDescriptor>,
}

impl Default for Cc2531 {
    fn default() -> Self {
        Self::new()
    }
}

impl Cc2531 {
    /// A chip fresh out of reset with erased flash.
    pub fn new() -> Self {
        let mut dev = Cc2531 {
            sram: vec![0; SRAM_SIZE as usize],
            idata: [0; 256],
            sfr: [0; 128],
            flash: vec![0xff; FLASH_SIZE],
            fctl: 0,
            faddr: 0,
            timing: FlashTiming::default(),
            busy_reads: None,
            peripheral_writes: 0,
            transfers: Vec::new(),
        };
        dev.reset_sfrs();
        dev
    }

    fn reset_sfrs(&mut self) {
        self.sfr = [0; 128];
        self.sfr[sfr_index(regs::SP)] = 0x07;
        self.sfr[sfr_index(regs::P1)] = 0xff;
    }

    pub fn set_flash_timing(&mut self, timing: FlashTiming) {
        self.timing = timing;
    }

    pub fn sram(&self) -> &[u8] {
        &self.sram
    }

    pub fn flash_page(&self, page: usize) -> &[u8] {
        let size = regs::FLASH_PAGE_SIZE as usize;
        &self.flash[page * size..(page + 1) * size]
    }

    /// Number of register and memory writes, not counting the CPU's own
    /// working registers.
    pub fn peripheral_writes(&self) -> u64 {
        self.peripheral_writes
    }

    /// DMA transfers carried out so far.
    pub fn transfers(&self) -> &[DmaDescriptor] {
        &self.transfers
    }

    /// The watchdog interval, if the watchdog has been started.
    pub fn watchdog(&self) -> Option<WatchdogInterval> {
        let wdctl = Wdctl::new_with_raw_value(self.sfr[sfr_index(regs::WDCTL)]);
        match wdctl.mode() {
            WatchdogMode::Watchdog => Some(wdctl.interval()),
            _ => None,
        }
    }

    pub fn is_flash_busy(&self) -> bool {
        self.fctl & regs::FCTL_BUSY != 0
    }

    /// Lets the watchdog fire. SFRs return to their reset values, SRAM is
    /// lost and flash is kept.
    pub fn watchdog_reset(&mut self) {
        self.reset_sfrs();
        self.idata = [0; 256];
        self.sram.iter_mut().for_each(|b| *b = 0);
        self.fctl = 0;
        self.faddr = 0;
        self.busy_reads = None;
    }

    fn xmap(&self) -> bool {
        self.sfr[sfr_index(regs::MEMCTR)] & regs::MEMCTR_XMAP != 0
    }

    fn flash_command(&mut self, value: u8) {
        if self.is_flash_busy() {
            return;
        }
        self.fctl = value & !regs::FCTL_BUSY;
        if value & (regs::FCTL_ERASE | regs::FCTL_WRITE) == 0 {
            return;
        }

        let base = self.faddr as usize * regs::FLASH_WORD_SIZE as usize;
        if value & regs::FCTL_ERASE != 0 {
            let size = regs::FLASH_PAGE_SIZE as usize;
            let page = base / size * size;
            self.flash[page..page + size].iter_mut().for_each(|b| *b = 0xff);
        }

        let mut busy = self.timing;
        if value & regs::FCTL_WRITE != 0 {
            match self.run_flash_dma() {
                Some(written) => {
                    for (i, byte) in written.into_iter().enumerate() {
                        if let Some(cell) = self.flash.get_mut(base + i) {
                            // Programming only clears bits.
                            *cell &= byte;
                        }
                    }
                }
                // Nobody feeds FWDATA, the controller waits forever.
                None => busy = FlashTiming::Stall,
            }
        }

        self.fctl |= regs::FCTL_BUSY;
        self.busy_reads = match busy {
            FlashTiming::BusyReads(n) => Some(n),
            FlashTiming::Stall => None,
        };
    }

    /// Services the flash trigger on channel 0, if armed for it.
    fn run_flash_dma(&mut self) -> Option<Vec<u8>> {
        if self.sfr[sfr_index(regs::DMAARM)] & regs::DMAARM_CH0 == 0 {
            return None;
        }

        let cfg = u16::from_be_bytes([
            self.sfr[sfr_index(regs::DMA0CFGH)],
            self.sfr[sfr_index(regs::DMA0CFGL)],
        ]);
        let mut raw = [0u8; DESCRIPTOR_LEN];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = self.peek_xdata(cfg.wrapping_add(i as u16));
        }
        let desc = DmaDescriptor::from_bytes(&raw);
        if desc.config.trigger() != TRIG_FLASH || desc.dst != regs::FWDATA {
            return None;
        }

        let mut src = desc.src;
        let mut data = Vec::with_capacity(desc.len as usize);
        for _ in 0..desc.len {
            data.push(self.peek_xdata(src));
            src = match desc.config.src_inc() {
                Increment::None => src,
                Increment::One => src.wrapping_add(1),
                Increment::Two => src.wrapping_add(2),
                Increment::MinusOne => src.wrapping_sub(1),
            };
        }

        self.sfr[sfr_index(regs::DMAARM)] &= !regs::DMAARM_CH0;
        self.sfr[sfr_index(regs::DMAIRQ)] |= regs::DMAIRQ_CH0;
        self.transfers.push(desc);
        Some(data)
    }

    /// XDATA read without side effects, as seen by the DMA controller.
    fn peek_xdata(&self, addr: u16) -> u8 {
        match addr {
            a if a < SRAM_SIZE => self.sram[a as usize],
            regs::FCTL => self.fctl,
            regs::FADDRL => self.faddr as u8,
            regs::FADDRH => (self.faddr >> 8) as u8,
            a if (regs::XDATA_SFR_BASE + 0x80..=regs::XDATA_SFR_BASE + 0xff).contains(&a) => {
                self.sfr[sfr_index((a - regs::XDATA_SFR_BASE) as u8)]
            }
            _ => 0,
        }
    }
}

fn sfr_index(addr: u8) -> usize {
    (addr & 0x7f) as usize
}

/// SFRs that live inside the CPU core rather than in a peripheral.
fn is_core_sfr(addr: u8) -> bool {
    matches!(
        addr,
        regs::ACC
            | regs::PSW
            | regs::SP
            | regs::DPL
            | regs::DPH
            | regs::DPL1
            | regs::DPH1
            | regs::DPS
            | 0xf0
    )
}

impl Registers for Cc2531 {
    fn read_sfr(&mut self, addr: u8) -> u8 {
        self.sfr[sfr_index(addr)]
    }

    fn write_sfr(&mut self, addr: u8, value: u8) {
        if !is_core_sfr(addr) {
            self.peripheral_writes += 1;
        }
        self.sfr[sfr_index(addr)] = value;
    }

    fn read_xdata(&mut self, addr: u16) -> u8 {
        if addr == regs::FCTL && self.is_flash_busy() {
            match self.busy_reads {
                Some(0) => self.fctl &= !regs::FCTL_BUSY,
                Some(n) => self.busy_reads = Some(n - 1),
                None => {}
            }
        }
        self.peek_xdata(addr)
    }

    fn write_xdata(&mut self, addr: u16, value: u8) {
        match addr {
            a if a < SRAM_SIZE => self.sram[a as usize] = value,
            regs::FCTL => self.flash_command(value),
            regs::FADDRL => self.faddr = (self.faddr & 0xff00) | value as u16,
            regs::FADDRH => self.faddr = (self.faddr & 0x00ff) | (value as u16) << 8,
            a if (regs::XDATA_SFR_BASE + 0x80..=regs::XDATA_SFR_BASE + 0xff).contains(&a) => {
                // write_sfr does its own accounting.
                self.write_sfr((a - regs::XDATA_SFR_BASE) as u8, value);
                return;
            }
            _ => {}
        }
        self.peripheral_writes += 1;
    }

    fn read_idata(&mut self, addr: u8) -> u8 {
        self.idata[addr as usize]
    }

    fn write_idata(&mut self, addr: u8, value: u8) {
        self.idata[addr as usize] = value;
    }

    fn read_code(&mut self, addr: u16) -> u8 {
        if addr >= XMAP_BASE && self.xmap() {
            let phys = PhysAddr::from_code(addr);
            if phys.is_sram() {
                return self.sram[phys.to_data_space() as usize];
            }
            return 0xff;
        }
        self.flash[addr as usize]
    }
}

/// Stands in for the USB injector: puts an image into SRAM, enables XMAP and
/// plants the image's code address as a return address on the stack, so
/// the next `RET` jumps into it.
#[derive(Clone, Copy, Debug)]
pub struct Injection {
    pub offset: u16,
    pub stack_ret: u8,
}

impl Injection {
    pub fn new(offset: u16, stack_ret: u8) -> Self {
        Injection { offset, stack_ret }
    }

    pub fn entry(&self) -> PhysAddr {
        PhysAddr::from_data(self.offset)
    }

    pub fn apply<R: Registers>(&self, regs: &mut R, image: &[u8]) {
        self.write(regs, AddressSpace::Xdata, self.offset, image);
        self.write(
            regs,
            AddressSpace::Xdata,
            regs::XDATA_SFR_BASE + regs::MEMCTR as u16,
            &[regs::MEMCTR_XMAP],
        );
        let ret = self.entry().to_code_space().to_le_bytes();
        self.write(regs, AddressSpace::Idata, self.stack_ret as u16, &ret);
        regs.write_sfr(regs::SP, self.stack_ret.wrapping_add(1));
    }

    fn write<R: Registers>(&self, regs: &mut R, space: AddressSpace, addr: u16, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let addr = addr.wrapping_add(i as u16);
            match space {
                AddressSpace::Xdata => regs.write_xdata(addr, *byte),
                AddressSpace::Idata => regs.write_idata(addr as u8, *byte),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{asm::StubImage, stub::ENTRY_RETURN_OFFSET};

    const OFFSET: u16 = 0x03a0;
    const STEP_LIMIT: u64 = 100_000;

    fn boot_stub(payload: &[u8], timing: FlashTiming) -> (Cc2531, Cpu, Halt) {
        boot_stub_at(OFFSET, payload, timing)
    }

    fn boot_stub_at(offset: u16, payload: &[u8], timing: FlashTiming) -> (Cc2531, Cpu, Halt) {
        let mut dev = Cc2531::new();
        dev.set_flash_timing(timing);
        let mut cpu = inject_stub(&mut dev, offset, payload);
        let halt = cpu.run(&mut dev, STEP_LIMIT);
        (dev, cpu, halt)
    }

    /// Injects the stub and performs the hijacked `RET`.
    fn inject_stub(dev: &mut Cc2531, offset: u16, payload: &[u8]) -> Cpu {
        let stub = StubImage::assemble();
        let mut image = stub.bytes().to_vec();
        image.extend_from_slice(payload);
        Injection::new(offset, 0xc2).apply(dev, &image);

        let mut cpu = Cpu::new(0);
        cpu.ret(dev);
        cpu
    }

    fn page(seed: u8) -> Vec<u8> {
        (0..regs::FLASH_PAGE_SIZE as usize)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn test_injection_plants_return_address() {
        let mut dev = Cc2531::new();
        Injection::new(OFFSET, 0xc2).apply(&mut dev, &[0x22]);
        assert_eq!(dev.read_idata(0xc2), 0xa0);
        assert_eq!(dev.read_idata(0xc3), 0x83);
        assert_eq!(dev.read_sfr(regs::SP), 0xc3);
        assert_eq!(dev.read_code(0x83a0), 0x22);
        assert_eq!(ENTRY_RETURN_OFFSET, 0);
    }

    #[test]
    fn test_code_space_without_xmap_is_flash() {
        let mut dev = Cc2531::new();
        dev.write_xdata(0x0010, 0x42);
        assert_eq!(dev.read_code(0x8010), 0xff);
        dev.write_sfr(regs::MEMCTR, regs::MEMCTR_XMAP);
        assert_eq!(dev.read_code(0x8010), 0x42);
    }

    #[test]
    fn test_machine_code_flashes_page_zero() {
        let payload = page(3);
        let (dev, _, halt) = boot_stub(&payload, FlashTiming::default());

        let stub = StubImage::assemble();
        match halt {
            Halt::Idle { pc } => {
                assert_eq!(pc, OFFSET + XMAP_BASE + stub.layout().code_len - 2)
            }
            other => panic!("stub did not reach idle: {:?}", other),
        }
        assert_eq!(dev.flash_page(0), &payload[..]);
        assert_eq!(dev.flash_page(1), &[0xff; regs::FLASH_PAGE_SIZE as usize][..]);
    }

    #[test]
    fn test_machine_code_descriptor() {
        let (dev, _, _) = boot_stub(&page(9), FlashTiming::default());
        let stub = StubImage::assemble();
        let size = stub.layout().size;

        assert_eq!(
            dev.transfers(),
            &[DmaDescriptor::flash_page(OFFSET + size)][..]
        );
        let slot = (OFFSET + stub.layout().descriptor_offset) as usize;
        assert_eq!(
            &dev.sram()[slot..slot + DESCRIPTOR_LEN],
            &DmaDescriptor::flash_page(OFFSET + size).to_bytes()[..]
        );
    }

    #[test]
    fn test_machine_code_lockdown_and_watchdog() {
        let (mut dev, _, _) = boot_stub(&page(1), FlashTiming::BusyReads(200));
        assert_eq!(dev.read_sfr(regs::IE) & regs::IE_EA, 0);
        assert_eq!(dev.read_sfr(regs::P1) & regs::P1_USB_PULLUP, 0);
        assert_eq!(dev.watchdog(), Some(WatchdogInterval::SHORTEST));
        assert!(!dev.is_flash_busy());
    }

    #[test]
    fn test_machine_code_idles_without_side_effects() {
        let (mut dev, mut cpu, _) = boot_stub(&page(0), FlashTiming::default());
        let writes = dev.peripheral_writes();
        let pc = cpu.pc();

        assert_eq!(cpu.run(&mut dev, 100), Halt::Idle { pc });
        for _ in 0..50 {
            assert_eq!(cpu.step(&mut dev), Some(Halt::Idle { pc }));
        }
        assert_eq!(dev.peripheral_writes(), writes);
    }

    #[test]
    fn test_machine_code_stall_keeps_polling() {
        let (mut dev, mut cpu, halt) = boot_stub(&page(0), FlashTiming::Stall);
        assert_eq!(halt, Halt::StepLimit);
        assert!(dev.is_flash_busy());
        assert_eq!(dev.watchdog(), None);

        // Stuck inside the two-instruction poll loop.
        let stub = StubImage::assemble();
        let loop_end = OFFSET + XMAP_BASE + stub.layout().code_len - 5;
        assert!(cpu.pc() == loop_end - 4 || cpu.pc() == loop_end - 3);

        // Polling changes nothing but the accumulator.
        let writes = dev.peripheral_writes();
        let sram = dev.sram().to_vec();
        let flash = dev.flash_page(0).to_vec();
        let transfers = dev.transfers().len();
        let steps = cpu.steps();

        assert_eq!(cpu.run(&mut dev, 10_000), Halt::StepLimit);
        assert_eq!(cpu.steps(), steps + 10_000);
        assert!(cpu.pc() == loop_end - 4 || cpu.pc() == loop_end - 3);
        assert_eq!(dev.peripheral_writes(), writes);
        assert_eq!(dev.sram(), &sram[..]);
        assert_eq!(dev.flash_page(0), &flash[..]);
        assert_eq!(dev.transfers().len(), transfers);
        assert_eq!(dev.read_sfr(regs::WDCTL), 0);
    }

    #[test]
    fn test_machine_code_at_many_offsets() {
        let stub = StubImage::assemble();
        let size = stub.layout().size;
        let page_size = regs::FLASH_PAGE_SIZE;
        let offsets = [
            0x0000,
            // Low byte of the payload address carries into the high byte.
            0x0100 - size / 2,
            0x03a0,
            0x1001,
            // Last offset with room for a whole page behind the stub.
            SRAM_SIZE - size - page_size,
        ];

        for (seed, offset) in offsets.iter().enumerate() {
            let payload = page(seed as u8);
            let (dev, _, halt) = boot_stub_at(*offset, &payload, FlashTiming::default());

            assert!(matches!(halt, Halt::Idle { .. }), "{:#06x}: {:?}", offset, halt);
            assert_eq!(dev.transfers().len(), 1, "{:#06x}", offset);
            assert_eq!(dev.transfers()[0].src, offset + size, "{:#06x}", offset);
            assert_eq!(dev.flash_page(0), &payload[..], "{:#06x}", offset);
        }
    }

    #[test]
    fn test_machine_code_ignores_leftover_data_pointer_select() {
        let payload = page(5);
        let mut dev = Cc2531::new();
        let mut cpu = inject_stub(&mut dev, OFFSET, &payload);
        // The firmware was using the second data pointer.
        dev.write_sfr(regs::DPS, regs::DPS_DPTR1);
        dev.write_sfr(regs::DPH1, 0x12);
        dev.write_sfr(regs::DPL1, 0x34);

        assert!(matches!(cpu.run(&mut dev, STEP_LIMIT), Halt::Idle { .. }));
        assert_eq!(dev.read_sfr(regs::DPS), 0);
        assert_eq!(dev.flash_page(0), &payload[..]);
        assert_eq!(dev.watchdog(), Some(WatchdogInterval::SHORTEST));
    }

    #[test]
    fn test_machine_code_short_payload_writes_whole_page() {
        let stub = StubImage::assemble();
        let mut dev = Cc2531::new();
        // Leftovers from whatever used this SRAM before.
        for i in 0..SRAM_SIZE {
            dev.write_xdata(i, (i >> 3) as u8);
        }
        let mut image = stub.bytes().to_vec();
        image.extend_from_slice(b"\x02\x00\x10");
        Injection::new(OFFSET, 0xc2).apply(&mut dev, &image);
        let start = (OFFSET + stub.layout().size) as usize;
        let expected = dev.sram()[start..start + regs::FLASH_PAGE_SIZE as usize].to_vec();

        let mut cpu = Cpu::new(0);
        cpu.ret(&mut dev);
        cpu.run(&mut dev, STEP_LIMIT);

        assert_eq!(&dev.flash_page(0)[..3], b"\x02\x00\x10");
        assert_eq!(dev.flash_page(0), &expected[..]);
    }

    #[test]
    fn test_reset_boots_into_new_image() {
        let payload = page(7);
        let (mut dev, _, _) = boot_stub(&payload, FlashTiming::default());
        dev.watchdog_reset();

        let code: Vec<u8> = (0..16).map(|a| dev.read_code(a)).collect();
        assert_eq!(&code[..], &payload[..16]);
        assert_eq!(dev.watchdog(), None);
    }

    #[test]
    fn test_write_without_dma_stalls() {
        let mut dev = Cc2531::new();
        dev.write_xdata(regs::FCTL, regs::FCTL_WRITE);
        for _ in 0..100 {
            assert_ne!(dev.read_xdata(regs::FCTL) & regs::FCTL_BUSY, 0);
        }
    }
}
