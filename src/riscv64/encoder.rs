// This module lowers MachineOps to RV64G instruction words (base integer plus the M, A, F
// and D extensions). Conditional branches only reach 4 KiB, so every compare-and-branch is emitted as
// an inverted B-type skip over a JAL, and the JAL word is what gets patched; calls and
// PC-relative loads use an AUIPC pair whose two immediates are split the way the hardware
// recombines them. Double comparisons write their result into T5 and branch on it. The
// base ISA has no rotate instructions, so rotates are reported as unsupported.

//! RISC-V 64 encoder.

use super::abi::{RA, S0, SP, T5, T6, ZERO};
use super::encode::{self as enc, BranchKind};
use crate::arch::{Cond, EncodingError, Encoder, Fixup, FpOp, IntOp, MachineOp, Operand};
use crate::core::{Arch, AsmReg, RelocKind};

const ARCH: &str = "riscv64";

fn gp(reg: AsmReg) -> Result<u8, EncodingError> {
    if reg.is_gp() && reg.id < 32 {
        Ok(reg.id)
    } else {
        Err(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "integer operand",
        })
    }
}

fn fpr(reg: AsmReg) -> Result<u8, EncodingError> {
    if reg.is_fp() && reg.id < 32 {
        Ok(reg.id)
    } else {
        Err(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "floating-point operand",
        })
    }
}

fn out_of_range(what: &'static str, value: i64) -> EncodingError {
    EncodingError::OutOfRange {
        arch: ARCH,
        what,
        value,
    }
}

fn read_word(site: &[u8], index: usize) -> Option<u32> {
    let bytes: [u8; 4] = site.get(index * 4..index * 4 + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn write_word(site: &mut [u8], index: usize, word: u32) {
    site[index * 4..index * 4 + 4].copy_from_slice(&word.to_le_bytes());
}

/// `rd = rs + imm`, through T6 when the immediate needs more than 12 bits.
fn add_const(words: &mut Vec<u32>, rd: u8, rs: u8, imm: i64) {
    if enc::fits_i12(imm) {
        words.push(enc::addi(rd, rs, imm as i32));
    } else {
        words.extend(enc::li(T6.id, imm));
        words.push(enc::add(rd, rs, T6.id));
    }
}

/// Emit a memory access at `[base + offset]` built by `access(base, imm)`.
fn with_address<F>(words: &mut Vec<u32>, base: u8, offset: i32, access: F)
where
    F: FnOnce(u8, i32) -> u32,
{
    if enc::fits_i12(offset as i64) {
        words.push(access(base, offset));
    } else {
        add_const(words, T6.id, base, offset as i64);
        words.push(access(T6.id, 0));
    }
}

/// Inverted skip over a JAL that is patched with the real target.
fn branch_site(words: &mut Vec<u32>, fixups: &mut Vec<Fixup>, kind: BranchKind, rs1: u8, rs2: u8) {
    fixups.push(Fixup {
        offset: (words.len() * 4) as u32,
        kind: RelocKind::CondBranch,
    });
    words.push(enc::branch(kind.invert(), rs1, rs2, 8));
    words.push(enc::jal(ZERO.id, 0));
}

/// AUIPC pair addressing `target` from `site_addr`.
fn patch_auipc_pair(site: &mut [u8], site_addr: u64, target: u64) -> Result<(), EncodingError> {
    let first = read_word(site, 0).ok_or(EncodingError::TruncatedSite {
        position: site_addr,
    })?;
    let second = read_word(site, 1).ok_or(EncodingError::TruncatedSite {
        position: site_addr,
    })?;
    let delta = target.wrapping_sub(site_addr) as i64;
    let (hi, lo) = enc::split_hi_lo(delta).ok_or_else(|| out_of_range("pc-relative delta", delta))?;
    write_word(site, 0, enc::with_u_imm(first, hi));
    write_word(site, 1, enc::with_i_imm(second, lo));
    Ok(())
}

fn decode_auipc_pair(site: &[u8], site_addr: u64) -> Option<u64> {
    let hi = enc::u_imm(read_word(site, 0)?);
    let lo = enc::i_imm(read_word(site, 1)?);
    Some(site_addr.wrapping_add(((hi << 12) + lo) as u64))
}

/// RISC-V 64 instruction encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct Riscv64Encoder;

impl Riscv64Encoder {
    pub fn new() -> Self {
        Self
    }

    fn int_op(
        words: &mut Vec<u32>,
        op: IntOp,
        rd: u8,
        rs1: u8,
        rhs: Operand,
    ) -> Result<(), EncodingError> {
        if matches!(op, IntOp::Rol | IntOp::Ror) {
            return Err(EncodingError::Unsupported {
                arch: ARCH,
                what: "rotate (no Zbb extension)".to_string(),
            });
        }
        let rs2 = match rhs {
            Operand::Reg(reg) => gp(reg)?,
            Operand::Imm(imm) => {
                let imm = imm as i64;
                if op.is_shift() {
                    if !(0..64).contains(&imm) {
                        return Err(out_of_range("shift amount", imm));
                    }
                    let s = imm as u32;
                    words.push(match op {
                        IntOp::Shl => enc::slli(rd, rs1, s),
                        IntOp::Shr => enc::srli(rd, rs1, s),
                        _ => enc::srai(rd, rs1, s),
                    });
                    return Ok(());
                }
                let direct = match op {
                    IntOp::Add if enc::fits_i12(imm) => Some(enc::addi(rd, rs1, imm as i32)),
                    IntOp::Sub if enc::fits_i12(-imm) => Some(enc::addi(rd, rs1, -imm as i32)),
                    IntOp::And if enc::fits_i12(imm) => Some(enc::andi(rd, rs1, imm as i32)),
                    IntOp::Or if enc::fits_i12(imm) => Some(enc::ori(rd, rs1, imm as i32)),
                    IntOp::Xor if enc::fits_i12(imm) => Some(enc::xori(rd, rs1, imm as i32)),
                    _ => None,
                };
                if let Some(word) = direct {
                    words.push(word);
                    return Ok(());
                }
                words.extend(enc::li(T5.id, imm));
                T5.id
            }
        };
        words.push(match op {
            IntOp::Add => enc::add(rd, rs1, rs2),
            IntOp::Sub => enc::sub(rd, rs1, rs2),
            IntOp::Mul => enc::mul(rd, rs1, rs2),
            IntOp::And => enc::and(rd, rs1, rs2),
            IntOp::Or => enc::or(rd, rs1, rs2),
            IntOp::Xor => enc::xor(rd, rs1, rs2),
            IntOp::Shl => enc::sll(rd, rs1, rs2),
            IntOp::Shr => enc::srl(rd, rs1, rs2),
            _ => enc::sra(rd, rs1, rs2),
        });
        Ok(())
    }

    fn lower(&self, op: &MachineOp, words: &mut Vec<u32>) -> Result<Vec<Fixup>, EncodingError> {
        let mut fixups = Vec::new();
        match *op {
            MachineOp::Mov { dst, src } => {
                let (rd, rs) = (gp(dst)?, gp(src)?);
                if rd != rs {
                    words.push(enc::addi(rd, rs, 0));
                }
            }
            MachineOp::FMov { dst, src } => {
                let (rd, rs) = (fpr(dst)?, fpr(src)?);
                if rd != rs {
                    words.push(enc::fmv_d(rd, rs));
                }
            }
            MachineOp::MovImm { dst, imm } => words.extend(enc::li(gp(dst)?, imm)),
            MachineOp::FpZero { dst } => words.push(enc::fmv_d_x(fpr(dst)?, ZERO.id)),
            MachineOp::BitsToFp { dst, src } => words.push(enc::fmv_d_x(fpr(dst)?, gp(src)?)),
            MachineOp::FpToBits { dst, src } => words.push(enc::fmv_x_d(gp(dst)?, fpr(src)?)),
            MachineOp::CvtIntToFp { dst, src } => words.push(enc::fcvt_d_l(fpr(dst)?, gp(src)?)),
            MachineOp::CvtFpToInt { dst, src } => words.push(enc::fcvt_l_d(gp(dst)?, fpr(src)?)),
            MachineOp::Load { dst, mem } => {
                let base = gp(mem.base)?;
                if dst.is_fp() {
                    let rd = fpr(dst)?;
                    with_address(words, base, mem.offset, |b, o| enc::fld(rd, b, o));
                } else {
                    let rd = gp(dst)?;
                    with_address(words, base, mem.offset, |b, o| enc::ld(rd, b, o));
                }
            }
            MachineOp::Store { src, mem } => {
                let base = gp(mem.base)?;
                if src.is_fp() {
                    let rs = fpr(src)?;
                    with_address(words, base, mem.offset, |b, o| enc::fsd(rs, b, o));
                } else {
                    let rs = gp(src)?;
                    with_address(words, base, mem.offset, |b, o| enc::sd(rs, b, o));
                }
            }
            MachineOp::StoreByte { src, mem } => {
                let rs = gp(src)?;
                with_address(words, gp(mem.base)?, mem.offset, |b, o| enc::sb(rs, b, o));
            }
            MachineOp::LoadByte { dst, mem } => {
                let rd = gp(dst)?;
                with_address(words, gp(mem.base)?, mem.offset, |b, o| enc::lbu(rd, b, o));
            }
            MachineOp::Lea { dst, mem } => {
                add_const(words, gp(dst)?, gp(mem.base)?, mem.offset as i64)
            }
            MachineOp::Int { op, dst, lhs, rhs } => {
                Self::int_op(words, op, gp(dst)?, gp(lhs)?, rhs)?
            }
            MachineOp::Fp { op, dst, lhs, rhs } => {
                let (rd, rs1, rs2) = (fpr(dst)?, fpr(lhs)?, fpr(rhs)?);
                words.push(match op {
                    FpOp::Add => enc::fadd_d(rd, rs1, rs2),
                    FpOp::Sub => enc::fsub_d(rd, rs1, rs2),
                    FpOp::Mul => enc::fmul_d(rd, rs1, rs2),
                    FpOp::Div => enc::fdiv_d(rd, rs1, rs2),
                });
            }
            MachineOp::FpSqrt { dst, src } => words.push(enc::fsqrt_d(fpr(dst)?, fpr(src)?)),
            MachineOp::BranchFp { cond, lhs, rhs } => {
                let (a, b) = (fpr(lhs)?, fpr(rhs)?);
                let t5 = T5.id;
                words.push(match cond {
                    Cond::Eq | Cond::Ne => enc::feq_d(t5, a, b),
                    Cond::Lt => enc::flt_d(t5, a, b),
                    Cond::Le => enc::fle_d(t5, a, b),
                    Cond::Gt => enc::flt_d(t5, b, a),
                    Cond::Ge => enc::fle_d(t5, b, a),
                });
                let taken = if cond == Cond::Ne {
                    BranchKind::Eq
                } else {
                    BranchKind::Ne
                };
                branch_site(words, &mut fixups, taken, t5, ZERO.id);
            }
            MachineOp::BranchInt { cond, lhs, rhs } => {
                let a = gp(lhs)?;
                let b = match rhs {
                    Operand::Reg(reg) => gp(reg)?,
                    Operand::Imm(0) => ZERO.id,
                    Operand::Imm(imm) => {
                        words.extend(enc::li(T5.id, imm as i64));
                        T5.id
                    }
                };
                // Only blt/bge exist; gt and le exchange their operands.
                let (cond, rs1, rs2) = match cond {
                    Cond::Gt | Cond::Le => (cond.swap(), b, a),
                    _ => (cond, a, b),
                };
                let kind = match cond {
                    Cond::Eq => BranchKind::Eq,
                    Cond::Ne => BranchKind::Ne,
                    Cond::Lt => BranchKind::Lt,
                    Cond::Ge => BranchKind::Ge,
                    Cond::Gt | Cond::Le => unreachable!("exchanged above"),
                };
                branch_site(words, &mut fixups, kind, rs1, rs2);
            }
            MachineOp::Jump => {
                fixups.push(Fixup {
                    offset: (words.len() * 4) as u32,
                    kind: RelocKind::UncondBranch,
                });
                words.push(enc::jal(ZERO.id, 0));
            }
            MachineOp::Call => {
                fixups.push(Fixup {
                    offset: (words.len() * 4) as u32,
                    kind: RelocKind::DirectCall,
                });
                words.push(enc::auipc(RA.id, 0));
                words.push(enc::jalr(RA.id, RA.id, 0));
            }
            MachineOp::CallReg { target } => words.push(enc::jalr(RA.id, gp(target)?, 0)),
            MachineOp::Ret => words.push(enc::jalr(ZERO.id, RA.id, 0)),
            MachineOp::LoadAddr { dst } => {
                let rd = gp(dst)?;
                fixups.push(Fixup {
                    offset: (words.len() * 4) as u32,
                    kind: RelocKind::PcRelLoad,
                });
                words.push(enc::auipc(rd, 0));
                words.push(enc::addi(rd, rd, 0));
            }
            MachineOp::LoadConst { dst } => {
                let rd = fpr(dst)?;
                fixups.push(Fixup {
                    offset: (words.len() * 4) as u32,
                    kind: RelocKind::PcRelLoad,
                });
                words.push(enc::auipc(T6.id, 0));
                words.push(enc::fld(rd, T6.id, 0));
            }
            MachineOp::AdjustSp { delta } => {
                if delta % 16 != 0 {
                    return Err(out_of_range("unaligned stack adjustment", delta as i64));
                }
                if delta != 0 {
                    add_const(words, SP.id, SP.id, delta as i64);
                }
            }
            MachineOp::AlignSp => words.push(enc::andi(SP.id, SP.id, -16)),
            MachineOp::EnterFrame { frame_size } => {
                words.push(enc::addi(SP.id, SP.id, -16));
                words.push(enc::sd(RA.id, SP.id, 8));
                words.push(enc::sd(S0.id, SP.id, 0));
                words.push(enc::addi(S0.id, SP.id, 16));
                if frame_size > 0 {
                    add_const(words, SP.id, SP.id, -(frame_size as i64));
                }
            }
            MachineOp::LeaveFrame { .. } => {
                words.push(enc::addi(SP.id, S0.id, -16));
                words.push(enc::ld(RA.id, SP.id, 8));
                words.push(enc::ld(S0.id, SP.id, 0));
                words.push(enc::addi(SP.id, SP.id, 16));
            }
            MachineOp::Syscall => words.push(enc::ECALL),
            MachineOp::AtomicAdd {
                addr,
                value,
                result,
            } => words.push(enc::amoadd_d_aqrl(gp(result)?, gp(addr)?, gp(value)?)),
            MachineOp::Trap => words.push(enc::EBREAK),
        }
        Ok(fixups)
    }
}

impl Encoder for Riscv64Encoder {
    fn arch(&self) -> Arch {
        Arch::Riscv64
    }

    fn encode(&self, op: &MachineOp, out: &mut Vec<u8>) -> Result<Vec<Fixup>, EncodingError> {
        let mut words = Vec::with_capacity(4);
        let fixups = self.lower(op, &mut words)?;
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        Ok(fixups)
    }

    fn patch(
        &self,
        kind: RelocKind,
        site: &mut [u8],
        site_addr: u64,
        target_addr: u64,
    ) -> Result<(), EncodingError> {
        let truncated = EncodingError::TruncatedSite {
            position: site_addr,
        };
        match kind {
            RelocKind::DirectCall | RelocKind::PcRelLoad => {
                patch_auipc_pair(site, site_addr, target_addr)
            }
            RelocKind::UncondBranch => {
                let jal = read_word(site, 0).ok_or(truncated)?;
                let delta = target_addr.wrapping_sub(site_addr) as i64;
                let word = enc::with_j_offset(jal, delta)
                    .ok_or_else(|| out_of_range("jump displacement", delta))?;
                write_word(site, 0, word);
                Ok(())
            }
            RelocKind::CondBranch => {
                let jal = read_word(site, 1).ok_or(truncated)?;
                let delta = target_addr.wrapping_sub(site_addr + 4) as i64;
                let word = enc::with_j_offset(jal, delta)
                    .ok_or_else(|| out_of_range("branch displacement", delta))?;
                write_word(site, 1, word);
                Ok(())
            }
        }
    }

    fn decode_target(&self, kind: RelocKind, site: &[u8], site_addr: u64) -> Option<u64> {
        match kind {
            RelocKind::DirectCall | RelocKind::PcRelLoad => decode_auipc_pair(site, site_addr),
            RelocKind::UncondBranch => {
                Some(site_addr.wrapping_add(enc::j_offset(read_word(site, 0)?) as u64))
            }
            RelocKind::CondBranch => {
                Some((site_addr + 4).wrapping_add(enc::j_offset(read_word(site, 1)?) as u64))
            }
        }
    }

    fn padding_byte(&self) -> u8 {
        0
    }

    fn plt_header(&self, plt_addr: u64, got_addr: u64) -> Result<Vec<u8>, EncodingError> {
        // Lazy resolver entry; with BIND_NOW the loader never reaches it.
        let (t0, t1, t2, t3) = (5u8, 6u8, 7u8, 28u8);
        let delta = got_addr.wrapping_sub(plt_addr) as i64;
        let (hi, lo) = enc::split_hi_lo(delta).ok_or_else(|| out_of_range("plt delta", delta))?;
        let words = [
            enc::auipc(t2, hi),
            enc::sub(t1, t1, t3),
            enc::ld(t3, t2, lo),
            enc::addi(t1, t1, -(self.plt_header_size() as i32 + 12)),
            enc::addi(t0, t2, lo),
            enc::srli(t1, t1, 1),
            enc::ld(t0, t0, 8),
            enc::jalr(ZERO.id, t3, 0),
        ];
        Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
    }

    fn plt_entry(
        &self,
        entry_addr: u64,
        got_slot: u64,
        _index: u32,
        _plt_addr: u64,
    ) -> Result<Vec<u8>, EncodingError> {
        let (t1, t3) = (6u8, 28u8);
        let delta = got_slot.wrapping_sub(entry_addr) as i64;
        let (hi, lo) = enc::split_hi_lo(delta).ok_or_else(|| out_of_range("plt delta", delta))?;
        let words = [
            enc::auipc(t3, hi),
            enc::ld(t3, t3, lo),
            enc::jalr(t1, t3, 0),
            enc::NOP,
        ];
        Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
    }

    fn plt_header_size(&self) -> usize {
        32
    }

    fn plt_entry_size(&self) -> usize {
        16
    }

    fn macho_stub(&self, _stub_addr: u64, _got_slot: u64) -> Result<Vec<u8>, EncodingError> {
        Err(EncodingError::Unsupported {
            arch: ARCH,
            what: "Mach-O stub".to_string(),
        })
    }

    fn macho_stub_size(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Mem;
    use crate::riscv64::abi::{f, x};

    fn encode(op: MachineOp) -> (Vec<u8>, Vec<Fixup>) {
        let mut out = Vec::new();
        let fixups = Riscv64Encoder::new().encode(&op, &mut out).unwrap();
        (out, fixups)
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_prologue_words() {
        let (bytes, _) = encode(MachineOp::EnterFrame { frame_size: 0 });
        assert_eq!(
            words(&bytes),
            vec![0xFF01_0113, 0x0011_3423, 0x0081_3023, 0x0101_0413]
        );
        let (bytes, _) = encode(MachineOp::Ret);
        assert_eq!(words(&bytes), vec![0x0000_8067]);
    }

    #[test]
    fn test_cond_branch_is_relaxed() {
        let encoder = Riscv64Encoder::new();
        let (mut bytes, fixups) = encode(MachineOp::BranchInt {
            cond: Cond::Lt,
            lhs: x(10),
            rhs: Operand::Reg(x(11)),
        });
        let at = fixups[0].offset as usize;
        let skip = words(&bytes)[at / 4];
        // bge a0, a1, +8
        assert_eq!(skip & 0x7f, 0x63);
        assert_eq!((skip >> 12) & 7, BranchKind::Ge as u32);
        assert_eq!(enc::b_offset(skip), 8);

        // Far beyond a B-type's reach.
        encoder.patch(RelocKind::CondBranch, &mut bytes[at..], 0x10000, 0x90000)
            .unwrap();
        assert_eq!(
            encoder.decode_target(RelocKind::CondBranch, &bytes[at..], 0x10000),
            Some(0x90000)
        );
    }

    #[test]
    fn test_call_patch_roundtrip() {
        let encoder = Riscv64Encoder::new();
        let (mut bytes, fixups) = encode(MachineOp::Call);
        assert_eq!(fixups[0].kind, RelocKind::DirectCall);
        for target in [0x1000u64, 0x12_3800, 0x7ff] {
            encoder.patch(RelocKind::DirectCall, &mut bytes, 0x2000, target)
                .unwrap();
            assert_eq!(
                encoder.decode_target(RelocKind::DirectCall, &bytes, 0x2000),
                Some(target)
            );
        }
    }

    #[test]
    fn test_rotates_unsupported() {
        let mut out = vec![1, 2, 3];
        let err = Riscv64Encoder::new()
            .encode(
                &MachineOp::Int {
                    op: IntOp::Rol,
                    dst: x(10),
                    lhs: x(10),
                    rhs: Operand::Imm(3),
                },
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, EncodingError::Unsupported { .. }));
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_large_offset_goes_through_scratch() {
        let (bytes, _) = encode(MachineOp::Store {
            src: f(8),
            mem: Mem::new(x(8), -4096),
        });
        let w = words(&bytes);
        assert!(w.len() >= 3);
        // fsd f8, 0(t6)
        assert_eq!(*w.last().unwrap(), enc::fsd(8, 31, 0));
    }

    #[test]
    fn test_plt_entry_targets_slot() {
        let encoder = Riscv64Encoder::new();
        let code = encoder.plt_entry(0x1_0020, 0x3_0018, 0, 0x1_0000).unwrap();
        assert_eq!(code.len(), encoder.plt_entry_size());
        assert_eq!(decode_auipc_pair(&code, 0x1_0020), Some(0x3_0018));
    }
}
