//! Interpreter for the subset of the 8051 instruction set the stub and its
//! tests use.
//!
//! Core registers (A, PSW, SP, DPTR) live in the SFR space of the
//! [`Registers`] implementation, so the interpreter itself only holds the
//! program counter.

use crate::regs::{self, Registers};

const PSW_CY: u8 = 1 << 7;
const PSW_AC: u8 = 1 << 6;
const PSW_OV: u8 = 1 << 2;

/// Why [`Cpu::run`] stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Halt {
    /// Reached a jump to itself. Only an interrupt or reset gets out of it.
    Idle { pc: u16 },
    StepLimit,
    IllegalOpcode { pc: u16, opcode: u8 },
}

#[derive(Clone, Debug)]
pub struct Cpu {
    pc: u16,
    steps: u64,
}

impl Cpu {
    pub fn new(pc: u16) -> Self {
        Cpu { pc, steps: 0 }
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Executes a `RET` without fetching one.
    pub fn ret<R: Registers>(&mut self, regs: &mut R) {
        let hi = pop(regs);
        let lo = pop(regs);
        self.pc = u16::from_be_bytes([hi, lo]);
    }

    pub fn run<R: Registers>(&mut self, regs: &mut R, max_steps: u64) -> Halt {
        for _ in 0..max_steps {
            if let Some(halt) = self.step(regs) {
                return halt;
            }
        }
        Halt::StepLimit
    }

    /// Executes one instruction. Returns `Some` instead when the CPU cannot
    /// make progress, leaving the program counter on the offending
    /// instruction.
    pub fn step<R: Registers>(&mut self, regs: &mut R) -> Option<Halt> {
        let pc = self.pc;
        let opcode = self.fetch(regs);

        match opcode {
            // NOP
            0x00 => {}
            // LJMP addr16
            0x02 => self.pc = self.fetch16(regs),
            // INC direct
            0x05 => {
                let direct = self.fetch(regs);
                let value = read_direct(regs, direct).wrapping_add(1);
                write_direct(regs, direct, value);
            }
            // LCALL addr16
            0x12 => {
                let target = self.fetch16(regs);
                let [hi, lo] = self.pc.to_be_bytes();
                push(regs, lo);
                push(regs, hi);
                self.pc = target;
            }
            // JB bit, rel
            0x20 => {
                let bit = self.fetch(regs);
                let rel = self.fetch(regs) as i8;
                if read_bit(regs, bit) {
                    self.jump(rel);
                }
            }
            // RET
            0x22 => self.ret(regs),
            // ADD A, #imm
            0x24 => {
                let imm = self.fetch(regs);
                add(regs, imm, false);
            }
            // ADDC A, #imm
            0x34 => {
                let imm = self.fetch(regs);
                let carry = regs.read_sfr(regs::PSW) & PSW_CY != 0;
                add(regs, imm, carry);
            }
            // ANL A, #imm
            0x54 => {
                let imm = self.fetch(regs);
                let a = regs.read_sfr(regs::ACC);
                regs.write_sfr(regs::ACC, a & imm);
            }
            // MOV A, #imm
            0x74 => {
                let imm = self.fetch(regs);
                regs.write_sfr(regs::ACC, imm);
            }
            // MOV direct, #imm
            0x75 => {
                let direct = self.fetch(regs);
                let imm = self.fetch(regs);
                write_direct(regs, direct, imm);
            }
            // SJMP rel
            0x80 => {
                let rel = self.fetch(regs) as i8;
                if rel == -2 {
                    self.pc = pc;
                    return Some(Halt::Idle { pc });
                }
                self.jump(rel);
            }
            // MOV direct, Rn
            0x88..=0x8f => {
                let direct = self.fetch(regs);
                let value = read_rn(regs, opcode & 7);
                write_direct(regs, direct, value);
            }
            // MOV DPTR, #imm16
            0x90 => {
                let value = self.fetch16(regs);
                set_dptr(regs, value);
            }
            // INC DPTR
            0xa3 => {
                let value = dptr(regs).wrapping_add(1);
                set_dptr(regs, value);
            }
            // PUSH direct
            0xc0 => {
                let direct = self.fetch(regs);
                let value = read_direct(regs, direct);
                push(regs, value);
            }
            // CLR bit
            0xc2 => {
                let bit = self.fetch(regs);
                write_bit(regs, bit, false);
            }
            // POP direct
            0xd0 => {
                let direct = self.fetch(regs);
                let value = pop(regs);
                write_direct(regs, direct, value);
            }
            // SETB bit
            0xd2 => {
                let bit = self.fetch(regs);
                write_bit(regs, bit, true);
            }
            // MOVX A, @DPTR
            0xe0 => {
                let addr = dptr(regs);
                let value = regs.read_xdata(addr);
                regs.write_sfr(regs::ACC, value);
            }
            // CLR A
            0xe4 => regs.write_sfr(regs::ACC, 0),
            // MOV A, direct
            0xe5 => {
                let direct = self.fetch(regs);
                let value = read_direct(regs, direct);
                regs.write_sfr(regs::ACC, value);
            }
            // MOV A, Rn
            0xe8..=0xef => {
                let value = read_rn(regs, opcode & 7);
                regs.write_sfr(regs::ACC, value);
            }
            // MOVX @DPTR, A
            0xf0 => {
                let a = regs.read_sfr(regs::ACC);
                let addr = dptr(regs);
                regs.write_xdata(addr, a);
            }
            // MOV direct, A
            0xf5 => {
                let direct = self.fetch(regs);
                let a = regs.read_sfr(regs::ACC);
                write_direct(regs, direct, a);
            }
            // MOV Rn, A
            0xf8..=0xff => {
                let a = regs.read_sfr(regs::ACC);
                write_rn(regs, opcode & 7, a);
            }
            _ => {
                self.pc = pc;
                return Some(Halt::IllegalOpcode { pc, opcode });
            }
        }

        self.steps += 1;
        None
    }

    fn fetch<R: Registers>(&mut self, regs: &mut R) -> u8 {
        let byte = regs.read_code(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn fetch16<R: Registers>(&mut self, regs: &mut R) -> u16 {
        let hi = self.fetch(regs);
        let lo = self.fetch(regs);
        u16::from_be_bytes([hi, lo])
    }

    fn jump(&mut self, rel: i8) {
        self.pc = self.pc.wrapping_add(rel as i16 as u16);
    }
}

/// `DPH` and `DPL` of the data pointer `DPS` selects.
fn dptr_sfrs<R: Registers>(regs: &mut R) -> (u8, u8) {
    if regs.read_sfr(regs::DPS) & regs::DPS_DPTR1 != 0 {
        (regs::DPH1, regs::DPL1)
    } else {
        (regs::DPH, regs::DPL)
    }
}

fn dptr<R: Registers>(regs: &mut R) -> u16 {
    let (dph, dpl) = dptr_sfrs(regs);
    u16::from_be_bytes([regs.read_sfr(dph), regs.read_sfr(dpl)])
}

fn set_dptr<R: Registers>(regs: &mut R, value: u16) {
    let (dph, dpl) = dptr_sfrs(regs);
    let [hi, lo] = value.to_be_bytes();
    regs.write_sfr(dph, hi);
    regs.write_sfr(dpl, lo);
}

fn push<R: Registers>(regs: &mut R, value: u8) {
    let sp = regs.read_sfr(regs::SP).wrapping_add(1);
    regs.write_sfr(regs::SP, sp);
    regs.write_idata(sp, value);
}

fn pop<R: Registers>(regs: &mut R) -> u8 {
    let sp = regs.read_sfr(regs::SP);
    let value = regs.read_idata(sp);
    regs.write_sfr(regs::SP, sp.wrapping_sub(1));
    value
}

fn read_direct<R: Registers>(regs: &mut R, direct: u8) -> u8 {
    if direct < 0x80 {
        regs.read_idata(direct)
    } else {
        regs.read_sfr(direct)
    }
}

fn write_direct<R: Registers>(regs: &mut R, direct: u8, value: u8) {
    if direct < 0x80 {
        regs.write_idata(direct, value)
    } else {
        regs.write_sfr(direct, value)
    }
}

fn rn_addr<R: Registers>(regs: &mut R, n: u8) -> u8 {
    let bank = (regs.read_sfr(regs::PSW) >> 3) & 0b11;
    bank * 8 + n
}

fn read_rn<R: Registers>(regs: &mut R, n: u8) -> u8 {
    let addr = rn_addr(regs, n);
    regs.read_idata(addr)
}

fn write_rn<R: Registers>(regs: &mut R, n: u8, value: u8) {
    let addr = rn_addr(regs, n);
    regs.write_idata(addr, value)
}

/// Byte address and mask of a bit address. Bits below 0x80 live in IDATA
/// 0x20..0x30, the rest in bit-addressable SFRs.
fn bit_location(bit: u8) -> (u8, u8) {
    if bit < 0x80 {
        (0x20 + bit / 8, 1 << (bit % 8))
    } else {
        (bit & 0xf8, 1 << (bit & 7))
    }
}

fn read_bit<R: Registers>(regs: &mut R, bit: u8) -> bool {
    let (addr, mask) = bit_location(bit);
    read_direct(regs, addr) & mask != 0
}

fn write_bit<R: Registers>(regs: &mut R, bit: u8, set: bool) {
    let (addr, mask) = bit_location(bit);
    let value = read_direct(regs, addr);
    let value = if set { value | mask } else { value & !mask };
    write_direct(regs, addr, value);
}

fn add<R: Registers>(regs: &mut R, operand: u8, carry_in: bool) {
    let a = regs.read_sfr(regs::ACC);
    let c = carry_in as u8;
    let sum = a as u16 + operand as u16 + c as u16;
    let result = sum as u8;

    let mut psw = regs.read_sfr(regs::PSW) & !(PSW_CY | PSW_AC | PSW_OV);
    if sum > 0xff {
        psw |= PSW_CY;
    }
    if (a & 0x0f) + (operand & 0x0f) + c > 0x0f {
        psw |= PSW_AC;
    }
    if (a ^ result) & (operand ^ result) & 0x80 != 0 {
        psw |= PSW_OV;
    }

    regs.write_sfr(regs::ACC, result);
    regs.write_sfr(regs::PSW, psw);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{asm::Assembler, regs::bit, sim::Cc2531};

    fn load(dev: &mut Cc2531, code: &[u8]) -> Cpu {
        for (i, byte) in code.iter().enumerate() {
            dev.write_xdata(0x0100 + i as u16, *byte);
        }
        dev.write_sfr(regs::MEMCTR, regs::MEMCTR_XMAP);
        Cpu::new(0x8100)
    }

    #[test]
    fn test_add_carries_into_addc() {
        let mut asm = Assembler::new();
        asm.mov_a_imm(0xf0);
        asm.add_a_imm(0x20);
        asm.mov_rn_a(0);
        asm.mov_a_imm(0x01);
        asm.addc_a_imm(0x00);
        asm.sjmp_self();

        let mut dev = Cc2531::new();
        let mut cpu = load(&mut dev, &asm.finish());
        assert!(matches!(cpu.run(&mut dev, 10), Halt::Idle { .. }));
        assert_eq!(dev.read_idata(0), 0x10);
        assert_eq!(dev.read_sfr(regs::ACC), 0x02);
    }

    #[test]
    fn test_call_and_stack_rewind() {
        // LCALL pushes the return address; INC SP twice then POP reads it
        // back after RET, the same way the stub finds itself.
        let mut asm = Assembler::new();
        asm.mov_direct_imm(regs::SP, 0x30);
        asm.lcall(0x8108);
        asm.sjmp_self();
        asm.ret();

        let mut dev = Cc2531::new();
        let mut cpu = load(&mut dev, &asm.finish());
        for _ in 0..3 {
            assert_eq!(cpu.step(&mut dev), None);
        }
        assert_eq!(cpu.pc(), 0x8106);
        assert_eq!(dev.read_sfr(regs::SP), 0x30);

        let mut rewind = Assembler::new();
        rewind.inc_direct(regs::SP);
        rewind.inc_direct(regs::SP);
        rewind.pop(regs::DPH);
        rewind.pop(regs::DPL);
        for (i, byte) in rewind.finish().iter().enumerate() {
            dev.write_xdata(0x0106 + i as u16, *byte);
        }
        for _ in 0..4 {
            assert_eq!(cpu.step(&mut dev), None);
        }
        assert_eq!(dptr(&mut dev), 0x8106);
        assert_eq!(dev.read_sfr(regs::SP), 0x30);
    }

    #[test]
    fn test_bit_instructions() {
        let mut asm = Assembler::new();
        asm.setb_bit(0x03);
        asm.clr_bit(bit::P1_0);
        asm.push(0x20);
        asm.sjmp_self();

        let mut dev = Cc2531::new();
        let mut cpu = load(&mut dev, &asm.finish());
        cpu.run(&mut dev, 10);
        assert_eq!(dev.read_idata(0x20), 0x08);
        assert_eq!(dev.read_sfr(regs::P1), 0xfe);
        assert_eq!(dev.read_idata(0x08), 0x08);
    }

    #[test]
    fn test_dps_selects_data_pointer() {
        let mut asm = Assembler::new();
        asm.mov_direct_imm(regs::DPS, regs::DPS_DPTR1);
        asm.mov_dptr_imm(0x0040);
        asm.mov_a_imm(0x5a);
        asm.movx_dptr_a();
        asm.sjmp_self();

        let mut dev = Cc2531::new();
        let mut cpu = load(&mut dev, &asm.finish());
        cpu.run(&mut dev, 10);
        assert_eq!(dev.read_sfr(regs::DPH1), 0x00);
        assert_eq!(dev.read_sfr(regs::DPL1), 0x40);
        assert_eq!(dev.read_sfr(regs::DPL), 0x00);
        assert_eq!(dev.read_xdata(0x0040), 0x5a);
    }

    #[test]
    fn test_illegal_opcode() {
        let mut dev = Cc2531::new();
        let mut cpu = load(&mut dev, &[0x00, 0xa5]);
        assert_eq!(
            cpu.run(&mut dev, 10),
            Halt::IllegalOpcode {
                pc: 0x8101,
                opcode: 0xa5
            }
        );
        assert_eq!(cpu.steps(), 1);
    }

    #[test]
    fn test_step_limit() {
        let mut dev = Cc2531::new();
        let mut cpu = load(&mut dev, &[0x00, 0x00, 0x00, 0x02, 0x81, 0x00]);
        assert_eq!(cpu.run(&mut dev, 20), Halt::StepLimit);
    }
}
