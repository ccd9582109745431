// This module provides x86-64 instruction encoding for flapc. Register-only and memory
// operations are assembled with the iced-x86 CodeAssembler one logical operation at a
// time, so a failed encoding never leaves partial bytes in the caller's buffer. Anything
// whose target is resolved later (calls, jumps, conditional branches, RIP-relative address
// and constant loads) is produced by the named builders in this file, which all end in a
// rel32 field; that field is the relocation site, and the same rel32 layout functions are
// used to write it during patching and to read it back in tests. Double comparisons use
// UCOMISD, swapping operands for less-than forms so that unordered results never branch,
// and equality checks guard against the parity flag. The encoder is also the place where
// ELF PLT entries and Mach-O stubs are built, since they are x86 code too.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::*;

use super::abi::{R11, RCX, XMM15};
use crate::arch::{Cond, EncodingError, Encoder, Fixup, FpOp, IntOp, MachineOp, Mem, Operand};
use crate::core::{Arch, AsmReg, RelocKind};

const ARCH: &str = "x86_64";

/// Condition codes for the `0F 8x` near conditional jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal = 0x4,
    NotEqual = 0x5,
    Parity = 0xA,
    /// Unsigned above, used after UCOMISD.
    Above = 0x7,
    AboveEqual = 0x3,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

impl JumpCondition {
    fn signed(cond: Cond) -> Self {
        match cond {
            Cond::Eq => JumpCondition::Equal,
            Cond::Ne => JumpCondition::NotEqual,
            Cond::Lt => JumpCondition::Less,
            Cond::Le => JumpCondition::LessEqual,
            Cond::Gt => JumpCondition::Greater,
            Cond::Ge => JumpCondition::GreaterEqual,
        }
    }
}

// ==== REL32 LAYOUT (shared by emission and patching) ====

/// Displacement of a rel32 field at `field_addr` that refers to `target`.
pub fn rel32_displacement(field_addr: u64, target: u64) -> Result<i32, EncodingError> {
    let disp = target.wrapping_sub(field_addr.wrapping_add(4)) as i64;
    i32::try_from(disp).map_err(|_| EncodingError::OutOfRange {
        arch: ARCH,
        what: "rel32 displacement",
        value: disp,
    })
}

pub fn write_rel32(field: &mut [u8], field_addr: u64, target: u64) -> Result<(), EncodingError> {
    if field.len() < 4 {
        return Err(EncodingError::TruncatedSite {
            position: field_addr,
        });
    }
    let disp = rel32_displacement(field_addr, target)?;
    field[..4].copy_from_slice(&disp.to_le_bytes());
    Ok(())
}

pub fn read_rel32(field: &[u8], field_addr: u64) -> Option<u64> {
    let bytes: [u8; 4] = field.get(..4)?.try_into().ok()?;
    let disp = i32::from_le_bytes(bytes) as i64;
    Some(field_addr.wrapping_add(4).wrapping_add(disp as u64))
}

// ==== NAMED BUILDERS FOR RELOCATABLE FORMS ====

/// `call rel32`; the field starts at byte 1.
pub fn call_rel32(out: &mut Vec<u8>) -> u32 {
    out.push(0xE8);
    let field = out.len() as u32;
    out.extend_from_slice(&[0; 4]);
    field
}

/// `jmp rel32`; the field starts at byte 1.
pub fn jmp_rel32(out: &mut Vec<u8>) -> u32 {
    out.push(0xE9);
    let field = out.len() as u32;
    out.extend_from_slice(&[0; 4]);
    field
}

/// `jcc rel32`; the field starts at byte 2.
pub fn jcc_rel32(out: &mut Vec<u8>, cond: JumpCondition) -> u32 {
    out.push(0x0F);
    out.push(0x80 | cond as u8);
    let field = out.len() as u32;
    out.extend_from_slice(&[0; 4]);
    field
}

/// `jcc rel8` over a fixed number of bytes.
pub fn jcc_short(out: &mut Vec<u8>, cond: JumpCondition, skip: i8) {
    out.push(0x70 | cond as u8);
    out.push(skip as u8);
}

/// `lea r64, [rip + rel32]`.
pub fn lea_rip(out: &mut Vec<u8>, dst: u8) -> u32 {
    out.push(0x48 | ((dst >> 3) & 1) << 2);
    out.push(0x8D);
    out.push(((dst & 7) << 3) | 0b101);
    let field = out.len() as u32;
    out.extend_from_slice(&[0; 4]);
    field
}

/// `movq xmm, qword [rip + rel32]`.
pub fn movq_xmm_rip(out: &mut Vec<u8>, dst: u8) -> u32 {
    out.push(0xF3);
    if dst >= 8 {
        out.push(0x44);
    }
    out.extend_from_slice(&[0x0F, 0x7E]);
    out.push(((dst & 7) << 3) | 0b101);
    let field = out.len() as u32;
    out.extend_from_slice(&[0; 4]);
    field
}

/// `jmp qword [rip + rel32]`.
pub fn jmp_rip_indirect(out: &mut Vec<u8>) -> u32 {
    out.extend_from_slice(&[0xFF, 0x25]);
    let field = out.len() as u32;
    out.extend_from_slice(&[0; 4]);
    field
}

/// `push qword [rip + rel32]`.
pub fn push_rip_indirect(out: &mut Vec<u8>) -> u32 {
    out.extend_from_slice(&[0xFF, 0x35]);
    let field = out.len() as u32;
    out.extend_from_slice(&[0; 4]);
    field
}

fn gp64(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
    const GP64_REGS: [AsmRegister64; 16] = [
        rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
    ];
    if !reg.is_gp() {
        return Err(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "64-bit integer operand",
        });
    }
    GP64_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "64-bit integer operand",
        })
}

fn gp8(reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
    const GP8_REGS: [AsmRegister8; 16] = [
        al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
    ];
    if !reg.is_gp() {
        return Err(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "byte operand",
        });
    }
    GP8_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "byte operand",
        })
}

fn xmm(reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
    const XMM_REGS: [AsmRegisterXmm; 16] = [
        xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
        xmm14, xmm15,
    ];
    if !reg.is_fp() {
        return Err(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "xmm operand",
        });
    }
    XMM_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "xmm operand",
        })
}

fn mem(m: Mem) -> Result<AsmMemoryOperand, EncodingError> {
    Ok(qword_ptr(gp64(m.base)? + m.offset))
}

fn byte_mem(m: Mem) -> Result<AsmMemoryOperand, EncodingError> {
    Ok(byte_ptr(gp64(m.base)? + m.offset))
}

fn asm_err(e: iced_x86::IcedError) -> EncodingError {
    EncodingError::Assembler(e.to_string())
}

/// x86-64 instruction encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct X64Encoder;

impl X64Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Assemble everything `build` emits into `out`.
    fn assemble<F>(out: &mut Vec<u8>, build: F) -> Result<(), EncodingError>
    where
        F: FnOnce(&mut CodeAssembler) -> Result<(), EncodingError>,
    {
        let mut a = CodeAssembler::new(64).map_err(asm_err)?;
        build(&mut a)?;
        let bytes = a.assemble(0).map_err(asm_err)?;
        out.extend_from_slice(&bytes);
        Ok(())
    }

    fn int_op(
        a: &mut CodeAssembler,
        op: IntOp,
        dst: AsmReg,
        lhs: AsmReg,
        rhs: Operand,
    ) -> Result<(), EncodingError> {
        if let Operand::Reg(r) = rhs {
            if op.is_shift() && r != RCX {
                return Err(EncodingError::InvalidRegister {
                    arch: ARCH,
                    reg: r,
                    what: "shift count (must be rcx)",
                });
            }
        }
        // Two-address form: compute into R11 when dst would clobber rhs first.
        let work_reg = match rhs {
            Operand::Reg(r) if r == dst && dst != lhs => R11,
            _ => dst,
        };
        let work = gp64(work_reg)?;
        if work_reg != lhs {
            a.mov(work, gp64(lhs)?).map_err(asm_err)?;
        }
        match rhs {
            Operand::Reg(r) => {
                let src = gp64(r)?;
                match op {
                    IntOp::Add => a.add(work, src),
                    IntOp::Sub => a.sub(work, src),
                    IntOp::Mul => a.imul_2(work, src),
                    IntOp::And => a.and(work, src),
                    IntOp::Or => a.or(work, src),
                    IntOp::Xor => a.xor(work, src),
                    IntOp::Shl => a.shl(work, cl),
                    IntOp::Shr => a.shr(work, cl),
                    IntOp::Sar => a.sar(work, cl),
                    IntOp::Rol => a.rol(work, cl),
                    IntOp::Ror => a.ror(work, cl),
                }
                .map_err(asm_err)?;
            }
            Operand::Imm(imm) => {
                if op.is_shift() && !(0..64).contains(&imm) {
                    return Err(EncodingError::OutOfRange {
                        arch: ARCH,
                        what: "shift amount",
                        value: imm as i64,
                    });
                }
                match op {
                    IntOp::Add => a.add(work, imm),
                    IntOp::Sub => a.sub(work, imm),
                    IntOp::Mul => a.imul_3(work, work, imm),
                    IntOp::And => a.and(work, imm),
                    IntOp::Or => a.or(work, imm),
                    IntOp::Xor => a.xor(work, imm),
                    IntOp::Shl => a.shl(work, imm),
                    IntOp::Shr => a.shr(work, imm),
                    IntOp::Sar => a.sar(work, imm),
                    IntOp::Rol => a.rol(work, imm),
                    IntOp::Ror => a.ror(work, imm),
                }
                .map_err(asm_err)?;
            }
        }
        if work_reg != dst {
            a.mov(gp64(dst)?, work).map_err(asm_err)?;
        }
        Ok(())
    }

    fn fp_op(
        a: &mut CodeAssembler,
        op: FpOp,
        dst: AsmReg,
        lhs: AsmReg,
        rhs: AsmReg,
    ) -> Result<(), EncodingError> {
        let work_reg = if rhs == dst && dst != lhs { XMM15 } else { dst };
        let work = xmm(work_reg)?;
        if work_reg != lhs {
            a.movapd(work, xmm(lhs)?).map_err(asm_err)?;
        }
        let src = xmm(rhs)?;
        match op {
            FpOp::Add => a.addsd(work, src),
            FpOp::Sub => a.subsd(work, src),
            FpOp::Mul => a.mulsd(work, src),
            FpOp::Div => a.divsd(work, src),
        }
        .map_err(asm_err)?;
        if work_reg != dst {
            a.movapd(xmm(dst)?, work).map_err(asm_err)?;
        }
        Ok(())
    }

    fn branch_fp(
        out: &mut Vec<u8>,
        cond: Cond,
        lhs: AsmReg,
        rhs: AsmReg,
    ) -> Result<Vec<Fixup>, EncodingError> {
        // UCOMISD sets CF for "below", so less-than forms compare swapped
        // operands with an above condition; unordered then never branches.
        let (first, second) = match cond {
            Cond::Lt | Cond::Le => (rhs, lhs),
            _ => (lhs, rhs),
        };
        let mut bytes = Vec::with_capacity(16);
        Self::assemble(&mut bytes, |a| {
            a.ucomisd(xmm(first)?, xmm(second)?).map_err(asm_err)
        })?;
        let mut fixups = Vec::with_capacity(2);
        match cond {
            Cond::Eq => {
                // Unordered sets ZF too: skip the je when PF is set.
                jcc_short(&mut bytes, JumpCondition::Parity, 6);
                let field = jcc_rel32(&mut bytes, JumpCondition::Equal);
                fixups.push(field);
            }
            Cond::Ne => {
                fixups.push(jcc_rel32(&mut bytes, JumpCondition::Parity));
                fixups.push(jcc_rel32(&mut bytes, JumpCondition::NotEqual));
            }
            Cond::Lt | Cond::Gt => fixups.push(jcc_rel32(&mut bytes, JumpCondition::Above)),
            Cond::Le | Cond::Ge => {
                fixups.push(jcc_rel32(&mut bytes, JumpCondition::AboveEqual))
            }
        }
        out.extend_from_slice(&bytes);
        Ok(fixups
            .into_iter()
            .map(|offset| Fixup {
                offset,
                kind: RelocKind::CondBranch,
            })
            .collect())
    }
}

impl Encoder for X64Encoder {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn encode(&self, op: &MachineOp, out: &mut Vec<u8>) -> Result<Vec<Fixup>, EncodingError> {
        let fixup = |offset: u32, kind: RelocKind| vec![Fixup { offset, kind }];
        match *op {
            MachineOp::Mov { dst, src } => {
                if dst != src {
                    Self::assemble(out, |a| a.mov(gp64(dst)?, gp64(src)?).map_err(asm_err))?;
                }
            }
            MachineOp::FMov { dst, src } => {
                if dst != src {
                    Self::assemble(out, |a| a.movapd(xmm(dst)?, xmm(src)?).map_err(asm_err))?;
                }
            }
            MachineOp::MovImm { dst, imm } => {
                Self::assemble(out, |a| a.mov(gp64(dst)?, imm).map_err(asm_err))?;
            }
            MachineOp::FpZero { dst } => {
                Self::assemble(out, |a| {
                    let r = xmm(dst)?;
                    a.xorpd(r, r).map_err(asm_err)
                })?;
            }
            MachineOp::BitsToFp { dst, src } => {
                Self::assemble(out, |a| a.movq(xmm(dst)?, gp64(src)?).map_err(asm_err))?;
            }
            MachineOp::FpToBits { dst, src } => {
                Self::assemble(out, |a| a.movq(gp64(dst)?, xmm(src)?).map_err(asm_err))?;
            }
            MachineOp::CvtIntToFp { dst, src } => {
                Self::assemble(out, |a| a.cvtsi2sd(xmm(dst)?, gp64(src)?).map_err(asm_err))?;
            }
            MachineOp::CvtFpToInt { dst, src } => {
                Self::assemble(out, |a| a.cvttsd2si(gp64(dst)?, xmm(src)?).map_err(asm_err))?;
            }
            MachineOp::Load { dst, mem: m } => {
                Self::assemble(out, |a| {
                    if dst.is_fp() {
                        a.movq(xmm(dst)?, mem(m)?).map_err(asm_err)
                    } else {
                        a.mov(gp64(dst)?, mem(m)?).map_err(asm_err)
                    }
                })?;
            }
            MachineOp::Store { src, mem: m } => {
                Self::assemble(out, |a| {
                    if src.is_fp() {
                        a.movq(mem(m)?, xmm(src)?).map_err(asm_err)
                    } else {
                        a.mov(mem(m)?, gp64(src)?).map_err(asm_err)
                    }
                })?;
            }
            MachineOp::StoreByte { src, mem: m } => {
                Self::assemble(out, |a| a.mov(byte_mem(m)?, gp8(src)?).map_err(asm_err))?;
            }
            MachineOp::LoadByte { dst, mem: m } => {
                Self::assemble(out, |a| a.movzx(gp64(dst)?, byte_mem(m)?).map_err(asm_err))?;
            }
            MachineOp::Lea { dst, mem: m } => {
                Self::assemble(out, |a| a.lea(gp64(dst)?, mem(m)?).map_err(asm_err))?;
            }
            MachineOp::Int { op, dst, lhs, rhs } => {
                Self::assemble(out, |a| Self::int_op(a, op, dst, lhs, rhs))?;
            }
            MachineOp::Fp { op, dst, lhs, rhs } => {
                Self::assemble(out, |a| Self::fp_op(a, op, dst, lhs, rhs))?;
            }
            MachineOp::FpSqrt { dst, src } => {
                Self::assemble(out, |a| a.sqrtsd(xmm(dst)?, xmm(src)?).map_err(asm_err))?;
            }
            MachineOp::BranchFp { cond, lhs, rhs } => {
                let mut bytes = Vec::with_capacity(16);
                let fixups = Self::branch_fp(&mut bytes, cond, lhs, rhs)?;
                out.extend_from_slice(&bytes);
                return Ok(fixups);
            }
            MachineOp::BranchInt { cond, lhs, rhs } => {
                let mut bytes = Vec::with_capacity(16);
                Self::assemble(&mut bytes, |a| match rhs {
                    Operand::Reg(r) => a.cmp(gp64(lhs)?, gp64(r)?).map_err(asm_err),
                    Operand::Imm(imm) => a.cmp(gp64(lhs)?, imm).map_err(asm_err),
                })?;
                let field = jcc_rel32(&mut bytes, JumpCondition::signed(cond));
                out.extend_from_slice(&bytes);
                return Ok(fixup(field, RelocKind::CondBranch));
            }
            MachineOp::Jump => {
                let mut bytes = Vec::with_capacity(5);
                let field = jmp_rel32(&mut bytes);
                out.extend_from_slice(&bytes);
                return Ok(fixup(field, RelocKind::UncondBranch));
            }
            MachineOp::Call => {
                let mut bytes = Vec::with_capacity(5);
                let field = call_rel32(&mut bytes);
                out.extend_from_slice(&bytes);
                return Ok(fixup(field, RelocKind::DirectCall));
            }
            MachineOp::CallReg { target } => {
                Self::assemble(out, |a| a.call(gp64(target)?).map_err(asm_err))?;
            }
            MachineOp::Ret => Self::assemble(out, |a| a.ret().map_err(asm_err))?,
            MachineOp::LoadAddr { dst } => {
                gp64(dst)?;
                let mut bytes = Vec::with_capacity(7);
                let field = lea_rip(&mut bytes, dst.id);
                out.extend_from_slice(&bytes);
                return Ok(fixup(field, RelocKind::PcRelLoad));
            }
            MachineOp::LoadConst { dst } => {
                xmm(dst)?;
                let mut bytes = Vec::with_capacity(9);
                let field = movq_xmm_rip(&mut bytes, dst.id);
                out.extend_from_slice(&bytes);
                return Ok(fixup(field, RelocKind::PcRelLoad));
            }
            MachineOp::AdjustSp { delta } => {
                if delta % 16 != 0 {
                    return Err(EncodingError::OutOfRange {
                        arch: ARCH,
                        what: "unaligned stack adjustment",
                        value: delta as i64,
                    });
                }
                if delta != 0 {
                    Self::assemble(out, |a| {
                        if delta > 0 {
                            a.add(rsp, delta).map_err(asm_err)
                        } else {
                            a.sub(rsp, -delta).map_err(asm_err)
                        }
                    })?;
                }
            }
            MachineOp::AlignSp => Self::assemble(out, |a| a.and(rsp, -16i32).map_err(asm_err))?,
            MachineOp::EnterFrame { frame_size } => {
                Self::assemble(out, |a| {
                    a.push(rbp).map_err(asm_err)?;
                    a.mov(rbp, rsp).map_err(asm_err)?;
                    if frame_size > 0 {
                        a.sub(rsp, frame_size as i32).map_err(asm_err)?;
                    }
                    Ok(())
                })?;
            }
            MachineOp::LeaveFrame { .. } => {
                Self::assemble(out, |a| {
                    a.mov(rsp, rbp).map_err(asm_err)?;
                    a.pop(rbp).map_err(asm_err)
                })?;
            }
            MachineOp::Syscall => Self::assemble(out, |a| a.syscall().map_err(asm_err))?,
            MachineOp::AtomicAdd {
                addr,
                value,
                result,
            } => {
                Self::assemble(out, |a| {
                    let work_reg = if result == addr { R11 } else { result };
                    let work = gp64(work_reg)?;
                    if work_reg != value {
                        a.mov(work, gp64(value)?).map_err(asm_err)?;
                    }
                    a.lock()
                        .xadd(qword_ptr(gp64(addr)? + 0), work)
                        .map_err(asm_err)?;
                    if work_reg != result {
                        a.mov(gp64(result)?, work).map_err(asm_err)?;
                    }
                    Ok(())
                })?;
            }
            MachineOp::Trap => Self::assemble(out, |a| a.ud2().map_err(asm_err))?,
        }
        Ok(Vec::new())
    }

    fn patch(
        &self,
        kind: RelocKind,
        site: &mut [u8],
        site_addr: u64,
        target_addr: u64,
    ) -> Result<(), EncodingError> {
        // Every x86 site is a rel32 field measured from its own end.
        let _ = kind;
        write_rel32(site, site_addr, target_addr)
    }

    fn decode_target(&self, _kind: RelocKind, site: &[u8], site_addr: u64) -> Option<u64> {
        read_rel32(site, site_addr)
    }

    fn padding_byte(&self) -> u8 {
        0xCC
    }

    fn plt_header(&self, plt_addr: u64, got_addr: u64) -> Result<Vec<u8>, EncodingError> {
        let mut code = Vec::with_capacity(16);
        let push = push_rip_indirect(&mut code) as usize;
        let jmp = jmp_rip_indirect(&mut code) as usize;
        code.extend_from_slice(&[0x0F, 0x1F, 0x40, 0x00]);
        write_rel32(&mut code[push..], plt_addr + push as u64, got_addr + 8)?;
        write_rel32(&mut code[jmp..], plt_addr + jmp as u64, got_addr + 16)?;
        Ok(code)
    }

    fn plt_entry(
        &self,
        entry_addr: u64,
        got_slot: u64,
        index: u32,
        plt_addr: u64,
    ) -> Result<Vec<u8>, EncodingError> {
        let mut code = Vec::with_capacity(16);
        let jmp = jmp_rip_indirect(&mut code) as usize;
        code.push(0x68);
        code.extend_from_slice(&index.to_le_bytes());
        let back = jmp_rel32(&mut code) as usize;
        write_rel32(&mut code[jmp..], entry_addr + jmp as u64, got_slot)?;
        write_rel32(&mut code[back..], entry_addr + back as u64, plt_addr)?;
        Ok(code)
    }

    fn plt_header_size(&self) -> usize {
        16
    }

    fn plt_entry_size(&self) -> usize {
        16
    }

    fn macho_stub(&self, stub_addr: u64, got_slot: u64) -> Result<Vec<u8>, EncodingError> {
        let mut code = Vec::with_capacity(6);
        let field = jmp_rip_indirect(&mut code) as usize;
        write_rel32(&mut code[field..], stub_addr + field as u64, got_slot)?;
        Ok(code)
    }

    fn macho_stub_size(&self) -> usize {
        6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::abi::{RAX, RBX, RDI, XMM0};

    #[test]
    fn test_rel32_layout() {
        let mut field = [0u8; 4];
        write_rel32(&mut field, 0x1001, 0x2000).unwrap();
        assert_eq!(i32::from_le_bytes(field), 0x2000 - 0x1005);
        assert_eq!(read_rel32(&field, 0x1001), Some(0x2000));
        assert!(rel32_displacement(0, 1 << 40).is_err());
    }

    #[test]
    fn test_lea_rip_bytes() {
        let mut out = Vec::new();
        assert_eq!(lea_rip(&mut out, 0), 3);
        assert_eq!(&out[..3], &[0x48, 0x8D, 0x05]);
        out.clear();
        lea_rip(&mut out, 9);
        assert_eq!(&out[..3], &[0x4C, 0x8D, 0x0D]);
    }

    #[test]
    fn test_known_encodings() {
        let enc = X64Encoder::new();
        let mut out = Vec::new();
        enc.encode(&MachineOp::Ret, &mut out).unwrap();
        assert_eq!(out, vec![0xC3]);

        out.clear();
        enc.encode(&MachineOp::Mov { dst: RAX, src: RDI }, &mut out)
            .unwrap();
        assert_eq!(out, vec![0x48, 0x89, 0xF8]);

        out.clear();
        enc.encode(&MachineOp::Syscall, &mut out).unwrap();
        assert_eq!(out, vec![0x0F, 0x05]);
    }

    #[test]
    fn test_failure_appends_nothing() {
        let enc = X64Encoder::new();
        let mut out = vec![0x90];
        let err = enc.encode(
            &MachineOp::Int {
                op: IntOp::Shl,
                dst: RAX,
                lhs: RAX,
                rhs: Operand::Reg(RBX),
            },
            &mut out,
        );
        assert!(err.is_err());
        assert_eq!(out, vec![0x90]);

        let err = enc.encode(&MachineOp::FMov { dst: XMM0, src: RAX }, &mut out);
        assert!(err.is_err());
        assert_eq!(out, vec![0x90]);
    }

    #[test]
    fn test_eq_branch_has_parity_guard() {
        let enc = X64Encoder::new();
        let mut out = Vec::new();
        let fixups = enc
            .encode(
                &MachineOp::BranchFp {
                    cond: Cond::Eq,
                    lhs: XMM0,
                    rhs: AsmReg::fp(1),
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(fixups.len(), 1);
        let at = fixups[0].offset as usize;
        // jp +6 ; je rel32
        assert_eq!(&out[at - 4..at], &[0x7A, 0x06, 0x0F, 0x84]);
    }

    #[test]
    fn test_plt_entry_layout() {
        let enc = X64Encoder::new();
        let code = enc.plt_entry(0x1010, 0x3018, 0, 0x1000).unwrap();
        assert_eq!(code.len(), enc.plt_entry_size());
        assert_eq!(&code[..2], &[0xFF, 0x25]);
        assert_eq!(read_rel32(&code[2..], 0x1012), Some(0x3018));
        assert_eq!(code[6], 0x68);
        assert_eq!(read_rel32(&code[12..], 0x101C), Some(0x1000));
    }
}
