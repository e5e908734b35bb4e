//! 8051 machine code for the flashing stub.
//!
//! The stub is emitted instruction by instruction instead of being shipped as
//! a prebuilt blob, so its size and every address it embeds come from the
//! same constants the rest of the crate uses. All instructions have a fixed
//! length, which lets [`StubImage::assemble`] size the image with a first
//! pass and fill in the self-referential constants on the second.
//!
//! Image layout:
//! 1. code, entered at offset 0 through a hijacked `RET`;
//! 2. an 8-byte slot the stub fills with its DMA descriptor;
//! 3. the payload, appended by the injector right after the slot.

use crate::{
    addr::DATA_SPACE_MASK,
    dma::{DmaDescriptor, DESCRIPTOR_LEN},
    regs::{self, bit, WatchdogInterval},
    stub::ENTRY_RETURN_OFFSET,
};
use bytes::{BufMut, Bytes, BytesMut};

/// Emits 8051 instructions into a buffer.
///
/// Only the instructions the stub needs are provided.
#[derive(Default)]
pub struct Assembler {
    buf: BytesMut,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next instruction.
    pub fn pos(&self) -> u16 {
        self.buf.len() as u16
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn clr_bit(&mut self, bit: u8) {
        self.buf.put_slice(&[0xc2, bit]);
    }

    pub fn setb_bit(&mut self, bit: u8) {
        self.buf.put_slice(&[0xd2, bit]);
    }

    pub fn inc_direct(&mut self, direct: u8) {
        self.buf.put_slice(&[0x05, direct]);
    }

    pub fn push(&mut self, direct: u8) {
        self.buf.put_slice(&[0xc0, direct]);
    }

    pub fn pop(&mut self, direct: u8) {
        self.buf.put_slice(&[0xd0, direct]);
    }

    pub fn clr_a(&mut self) {
        self.buf.put_u8(0xe4);
    }

    pub fn mov_a_imm(&mut self, value: u8) {
        self.buf.put_slice(&[0x74, value]);
    }

    pub fn mov_a_direct(&mut self, direct: u8) {
        self.buf.put_slice(&[0xe5, direct]);
    }

    pub fn mov_a_rn(&mut self, n: u8) {
        self.buf.put_u8(0xe8 | (n & 7));
    }

    pub fn mov_rn_a(&mut self, n: u8) {
        self.buf.put_u8(0xf8 | (n & 7));
    }

    pub fn mov_direct_a(&mut self, direct: u8) {
        self.buf.put_slice(&[0xf5, direct]);
    }

    pub fn mov_direct_rn(&mut self, direct: u8, n: u8) {
        self.buf.put_slice(&[0x88 | (n & 7), direct]);
    }

    pub fn mov_direct_imm(&mut self, direct: u8, value: u8) {
        self.buf.put_slice(&[0x75, direct, value]);
    }

    pub fn mov_dptr_imm(&mut self, value: u16) {
        self.buf.put_u8(0x90);
        self.buf.put_u16(value);
    }

    pub fn add_a_imm(&mut self, value: u8) {
        self.buf.put_slice(&[0x24, value]);
    }

    pub fn addc_a_imm(&mut self, value: u8) {
        self.buf.put_slice(&[0x34, value]);
    }

    pub fn anl_a_imm(&mut self, value: u8) {
        self.buf.put_slice(&[0x54, value]);
    }

    pub fn inc_dptr(&mut self) {
        self.buf.put_u8(0xa3);
    }

    pub fn movx_a_dptr(&mut self) {
        self.buf.put_u8(0xe0);
    }

    pub fn movx_dptr_a(&mut self) {
        self.buf.put_u8(0xf0);
    }

    /// `JB bit, target` where `target` is an already emitted offset.
    pub fn jb_back(&mut self, bit: u8, target: u16) {
        let rel = target as i32 - (self.pos() as i32 + 3);
        debug_assert!(rel >= i8::MIN as i32, "branch target out of range");
        self.buf.put_slice(&[0x20, bit, rel as i8 as u8]);
    }

    /// `SJMP $`, spins in place.
    pub fn sjmp_self(&mut self) {
        self.buf.put_slice(&[0x80, 0xfe]);
    }

    pub fn lcall(&mut self, target: u16) {
        self.buf.put_u8(0x12);
        self.buf.put_u16(target);
    }

    pub fn ret(&mut self) {
        self.buf.put_u8(0x22);
    }

    pub fn reserve(&mut self, len: usize) {
        self.buf.put_slice(&vec![0; len]);
    }
}

/// Where things are inside the stub image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StubLayout {
    /// Length of the executable part.
    pub code_len: u16,
    /// Offset of the DMA descriptor slot.
    pub descriptor_offset: u16,
    /// Total image size. The payload starts here.
    pub size: u16,
}

impl StubLayout {
    fn from_code_len(code_len: u16) -> Self {
        StubLayout {
            code_len,
            descriptor_offset: code_len,
            size: code_len + DESCRIPTOR_LEN as u16,
        }
    }
}

/// The assembled stub.
#[derive(Clone, Debug)]
pub struct StubImage {
    bytes: Bytes,
    layout: StubLayout,
}

impl StubImage {
    pub fn assemble() -> Self {
        let sizing = emit_stub(&StubLayout::from_code_len(0));
        let layout = StubLayout::from_code_len(sizing.code_len);
        let image = emit_stub(&layout);
        debug_assert_eq!(image.code_len, layout.code_len);

        StubImage {
            bytes: image.bytes,
            layout,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn layout(&self) -> StubLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

struct Emitted {
    bytes: Bytes,
    code_len: u16,
}

fn emit_stub(layout: &StubLayout) -> Emitted {
    let mut asm = Assembler::new();

    emit_lockdown(&mut asm);
    emit_locate(&mut asm);
    emit_payload_address(&mut asm, layout.size);
    emit_descriptor(&mut asm, layout.descriptor_offset);
    emit_flash(&mut asm);
    emit_handoff(&mut asm);

    let code_len = asm.pos();
    asm.reserve(DESCRIPTOR_LEN);

    Emitted {
        bytes: asm.finish(),
        code_len,
    }
}

fn emit_lockdown(asm: &mut Assembler) {
    asm.clr_bit(bit::EA);
    asm.clr_bit(bit::P1_0);
    asm.mov_direct_imm(regs::DPS, 0);
}

/// Recovers the address the hijacked `RET` jumped to. `RET` popped it but
/// left the bytes in IDATA, so stepping SP back up and popping again reads
/// it into DPTR and leaves SP where `RET` left it.
fn emit_locate(asm: &mut Assembler) {
    for _ in 0..crate::stub::STACK_REWIND {
        asm.inc_direct(regs::SP);
    }
    asm.pop(regs::DPH);
    asm.pop(regs::DPL);
}

/// `R7:R6 = (DPTR + size) & DATA_SPACE_MASK`
fn emit_payload_address(asm: &mut Assembler, size: u16) {
    let [hi, lo] = size.wrapping_sub(ENTRY_RETURN_OFFSET).to_be_bytes();
    let [mask, _] = DATA_SPACE_MASK.to_be_bytes();

    asm.mov_a_direct(regs::DPL);
    asm.add_a_imm(lo);
    asm.mov_rn_a(6);
    asm.mov_a_direct(regs::DPH);
    asm.addc_a_imm(hi);
    asm.anl_a_imm(mask);
    asm.mov_rn_a(7);
}

/// Points DPTR (and `R5:R4`) at the descriptor slot, fills it in and arms
/// DMA channel 0 with it.
fn emit_descriptor(asm: &mut Assembler, offset: u16) {
    let [hi, lo] = offset.wrapping_sub(ENTRY_RETURN_OFFSET).to_be_bytes();
    let [mask, _] = DATA_SPACE_MASK.to_be_bytes();

    asm.mov_a_direct(regs::DPL);
    asm.add_a_imm(lo);
    asm.mov_direct_a(regs::DPL);
    asm.mov_rn_a(4);
    asm.mov_a_direct(regs::DPH);
    asm.addc_a_imm(hi);
    asm.anl_a_imm(mask);
    asm.mov_direct_a(regs::DPH);
    asm.mov_rn_a(5);

    // Source address is only known at run time.
    asm.mov_a_rn(7);
    asm.movx_dptr_a();
    asm.inc_dptr();
    asm.mov_a_rn(6);
    asm.movx_dptr_a();

    let template = DmaDescriptor::flash_page(0).to_bytes();
    for byte in template[2..].iter() {
        asm.inc_dptr();
        asm.mov_a_imm(*byte);
        asm.movx_dptr_a();
    }

    asm.mov_direct_rn(regs::DMA0CFGH, 5);
    asm.mov_direct_rn(regs::DMA0CFGL, 4);
    asm.mov_direct_imm(regs::DMAARM, regs::DMAARM_CH0);
}

fn emit_flash(asm: &mut Assembler) {
    // Page 0, offset 0.
    asm.mov_dptr_imm(regs::FADDRL);
    asm.clr_a();
    asm.movx_dptr_a();
    asm.inc_dptr();
    asm.movx_dptr_a();

    asm.mov_dptr_imm(regs::FCTL);
    asm.mov_a_imm(regs::FCTL_ERASE | regs::FCTL_WRITE);
    asm.movx_dptr_a();

    let poll = asm.pos();
    asm.movx_a_dptr();
    asm.jb_back(bit::ACC_7, poll);
}

fn emit_handoff(asm: &mut Assembler) {
    asm.mov_direct_imm(regs::WDCTL, WatchdogInterval::SHORTEST.wdctl());
    asm.sjmp_self();
}
