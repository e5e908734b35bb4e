//! The flashing stub, expressed against the [`Registers`] interface.
//!
//! This is the algorithm the bytes from [`crate::asm`] implement, one phase
//! per function: lock the chip down, find ourselves, find the payload, arm
//! DMA, erase and program flash page 0, then let the watchdog reset the
//! chip into whatever was just written.
//!
//! On hardware nothing here can fail in a way software could notice. The
//! only reportable outcome besides completion is a flash controller that
//! never leaves the busy state, and even that can only be observed when a
//! [`PollLimit`] is imposed by a test harness.

use crate::{
    addr::PhysAddr,
    asm::StubLayout,
    dma::DmaDescriptor,
    regs::{self, Registers, WatchdogInterval},
};

/// How far the stub moves SP up to get back at the return address the
/// hijacked `RET` consumed.
pub const STACK_REWIND: u8 = 2;

/// Distance from the recovered return address to the stub's first byte.
///
/// The injector jumps to the first instruction with a `RET`, so the
/// recovered address is the load address itself.
pub const ENTRY_RETURN_OFFSET: u16 = 0;

/// How the stub learns its own load address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    /// Read back the return address left below SP by the hijacked `RET`.
    Stack,
    /// The caller passes the load address.
    Explicit(PhysAddr),
}

/// Bound on the flash busy polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollLimit {
    /// Poll until the controller is done, like the hardware does.
    Forever,
    /// Give up after this many status reads.
    Max(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Page 0 was written and the watchdog is running down.
    Completed,
    /// The flash controller stayed busy for the whole [`PollLimit`].
    HardwareStall,
}

/// Flash controller states as seen by the stub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashState {
    Armed,
    ErasingWriting,
    Complete,
}

/// Addresses the stub derives from its load address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub base: PhysAddr,
    pub descriptor: PhysAddr,
    pub payload: PhysAddr,
}

pub struct Stub {
    layout: StubLayout,
    limit: PollLimit,
}

impl Stub {
    pub fn new(layout: StubLayout) -> Self {
        Stub {
            layout,
            limit: PollLimit::Forever,
        }
    }

    pub fn with_poll_limit(mut self, limit: PollLimit) -> Self {
        self.limit = limit;
        self
    }

    pub fn layout(&self) -> StubLayout {
        self.layout
    }

    /// Runs every phase in order. After `Completed` the real stub spins
    /// until the watchdog fires; here control simply returns.
    pub fn run<R: Registers>(&self, regs: &mut R, entry: Entry) -> Outcome {
        lockdown(regs);
        let placement = self.place(locate(regs, entry));
        arm_dma(regs, placement);
        match program_page(regs, self.limit) {
            Outcome::Completed => {
                handoff(regs);
                Outcome::Completed
            }
            Outcome::HardwareStall => Outcome::HardwareStall,
        }
    }

    /// Derives the descriptor slot and payload address from the load
    /// address.
    pub fn place(&self, base: PhysAddr) -> Placement {
        Placement {
            base,
            descriptor: base.offset(self.layout.descriptor_offset),
            payload: base.offset(self.layout.size),
        }
    }
}

/// Interrupts off for good, then drop the USB pull-up so the host sees the
/// dongle leave the bus. The firmware may have left the second data pointer
/// selected; everything after this uses the first.
pub fn lockdown<R: Registers>(regs: &mut R) {
    regs.clear_sfr_bits(regs::IE, regs::IE_EA);
    regs.clear_sfr_bits(regs::P1, regs::P1_USB_PULLUP);
    regs.write_sfr(regs::DPS, 0);
}

/// Finds the stub's load address.
///
/// With [`Entry::Stack`] this trusts the injection contract completely: a
/// different stack depth yields a wrong address and nothing notices.
pub fn locate<R: Registers>(regs: &mut R, entry: Entry) -> PhysAddr {
    match entry {
        Entry::Explicit(base) => base,
        Entry::Stack => {
            let mut sp = regs.read_sfr(regs::SP).wrapping_add(STACK_REWIND);
            let hi = regs.read_idata(sp);
            sp = sp.wrapping_sub(1);
            let lo = regs.read_idata(sp);
            sp = sp.wrapping_sub(1);
            regs.write_sfr(regs::SP, sp);

            let ret = u16::from_be_bytes([hi, lo]);
            regs.write_sfr(regs::DPH, hi);
            regs.write_sfr(regs::DPL, lo);
            PhysAddr::from_code(ret.wrapping_sub(ENTRY_RETURN_OFFSET))
        }
    }
}

/// Writes the descriptor into its slot and arms channel 0. Nothing moves
/// until the flash controller raises its trigger.
pub fn arm_dma<R: Registers>(regs: &mut R, placement: Placement) -> DmaDescriptor {
    let desc = DmaDescriptor::flash_page(placement.payload.to_data_space());
    let slot = placement.descriptor.to_data_space();
    for (i, byte) in desc.to_bytes().iter().enumerate() {
        regs.write_xdata(slot.wrapping_add(i as u16), *byte);
    }

    let [hi, lo] = slot.to_be_bytes();
    regs.write_sfr(regs::DMA0CFGH, hi);
    regs.write_sfr(regs::DMA0CFGL, lo);
    regs.write_sfr(regs::DMAARM, regs::DMAARM_CH0);
    desc
}

/// Erases and programs page 0 and waits for the controller.
///
/// The wait only reads `FCTL`.
pub fn program_page<R: Registers>(regs: &mut R, limit: PollLimit) -> Outcome {
    let mut polls = 0u32;
    let mut state = FlashState::Armed;
    loop {
        state = match state {
            FlashState::Armed => {
                regs.write_xdata(regs::FADDRL, 0);
                regs.write_xdata(regs::FADDRH, 0);
                regs.write_xdata(regs::FCTL, regs::FCTL_ERASE | regs::FCTL_WRITE);
                FlashState::ErasingWriting
            }
            FlashState::ErasingWriting => {
                if let PollLimit::Max(max) = limit {
                    if polls >= max {
                        return Outcome::HardwareStall;
                    }
                }
                polls += 1;
                if regs.read_xdata(regs::FCTL) & regs::FCTL_BUSY != 0 {
                    FlashState::ErasingWriting
                } else {
                    FlashState::Complete
                }
            }
            FlashState::Complete => return Outcome::Completed,
        }
    }
}

/// Starts the watchdog with its shortest interval and never feeds it.
pub fn handoff<R: Registers>(regs: &mut R) {
    regs.write_sfr(regs::WDCTL, WatchdogInterval::SHORTEST.wdctl());
}
