// This module lowers MachineOps to ARM64 instruction words for Linux and Darwin. Most
// operations map to one word; constants, large frame offsets and integer immediates that do
// not fit an instruction field go through the X17 scratch register. Relocation sites are
// the first word of a fixed shape: BL or B for calls and jumps, B.cond for conditional
// branches, and an ADRP followed by an ADD or a 64-bit LDR for PC-relative addresses and
// constants. Patching rewrites only the immediate fields of those words using the same
// field helpers that built them. The only per-OS difference in code is the SVC immediate.

//! ARM64 encoder.

use super::abi::X17;
use super::encode::{self as enc, Access};
use crate::arch::{Cond, EncodingError, Encoder, Fixup, FpOp, IntOp, MachineOp, Operand};
use crate::core::{Arch, AsmReg, ImageFormat, RelocKind};

const ARCH: &str = "arm64";

const SP_ID: u8 = 31;

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

/// Like `gp` but rejects register 31, which reads as XZR in this position.
fn gp_nosp(reg: AsmReg) -> Result<u8, EncodingError> {
    match gp(reg)? {
        SP_ID => Err(EncodingError::InvalidRegister {
            arch: ARCH,
            reg,
            what: "operand that cannot be sp",
        }),
        id => Ok(id),
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

fn int_cond(cond: Cond) -> u32 {
    match cond {
        Cond::Eq => 0x0,
        Cond::Ne => 0x1,
        Cond::Lt => 0xB,
        Cond::Le => 0xD,
        Cond::Gt => 0xC,
        Cond::Ge => 0xA,
    }
}

/// Conditions after FCMP that are false for unordered operands (except NE).
fn fp_cond(cond: Cond) -> u32 {
    match cond {
        Cond::Eq => 0x0,
        Cond::Ne => 0x1,
        Cond::Lt => 0x4,
        Cond::Le => 0x9,
        Cond::Gt => 0xC,
        Cond::Ge => 0xA,
    }
}

fn read_word(site: &[u8], index: usize) -> Option<u32> {
    let bytes: [u8; 4] = site.get(index * 4..index * 4 + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn write_word(site: &mut [u8], index: usize, word: u32) {
    site[index * 4..index * 4 + 4].copy_from_slice(&word.to_le_bytes());
}

/// ARM64 instruction encoder.
#[derive(Debug, Clone, Copy)]
pub struct Arm64Encoder {
    format: ImageFormat,
}

impl Arm64Encoder {
    pub fn new(format: ImageFormat) -> Self {
        Self { format }
    }

    fn svc_imm(&self) -> u16 {
        match self.format {
            ImageFormat::Elf => 0,
            ImageFormat::MachO => 0x80,
        }
    }

    fn out_of_range(what: &'static str, value: i64) -> EncodingError {
        EncodingError::OutOfRange {
            arch: ARCH,
            what,
            value,
        }
    }

    /// ADRP in `rd` at `addr` for the page of `target`, plus the low 12 bits.
    fn adrp_to(rd: u8, addr: u64, target: u64) -> Result<(u32, u64), EncodingError> {
        let pages = ((target & !0xfff) as i64 - (addr & !0xfff) as i64) >> 12;
        let word = enc::with_adrp_pages(enc::adrp(rd), pages)
            .ok_or_else(|| Self::out_of_range("adrp page delta", pages))?;
        Ok((word, target & 0xfff))
    }

    /// `ldr xt, [xn, #lo]` for an ADRP page offset.
    fn ldr_lo(rt: u8, rn: u8, lo: u64) -> Result<u32, EncodingError> {
        let ldr = enc::load_store(Access::X, true, rt, rn, 0, X17.id)[0];
        enc::with_page_offset(ldr, lo).ok_or_else(|| Self::out_of_range("page offset", lo as i64))
    }

    /// `rd = rn + imm` for any 32-bit immediate; register 31 is SP.
    fn add_const(words: &mut Vec<u32>, rd: u8, rn: u8, imm: i64) {
        let magnitude = imm.unsigned_abs();
        if magnitude < 4096 {
            words.push(if imm >= 0 {
                enc::add_imm(rd, rn, magnitude as u32, false)
            } else {
                enc::sub_imm(rd, rn, magnitude as u32, false)
            });
        } else if magnitude < (1 << 24) {
            let hi = (magnitude >> 12) as u32;
            let lo = (magnitude & 0xfff) as u32;
            let (first, second) = if imm >= 0 {
                (enc::add_imm(rd, rn, hi, true), enc::add_imm(rd, rd, lo, false))
            } else {
                (enc::sub_imm(rd, rn, hi, true), enc::sub_imm(rd, rd, lo, false))
            };
            words.push(first);
            if lo != 0 {
                words.push(second);
            }
        } else {
            words.extend(enc::mov_imm(X17.id, imm));
            words.push(enc::add_ext(rd, rn, X17.id));
        }
    }

    fn int_op(
        words: &mut Vec<u32>,
        op: IntOp,
        rd: u8,
        rn: u8,
        rhs: Operand,
    ) -> Result<(), EncodingError> {
        let rm = match rhs {
            Operand::Reg(reg) => gp_nosp(reg)?,
            Operand::Imm(imm) => {
                if op.is_shift() {
                    if !(0..64).contains(&imm) {
                        return Err(Self::out_of_range("shift amount", imm as i64));
                    }
                    let s = imm as u32;
                    words.push(match op {
                        IntOp::Shl => enc::lsl_imm(rd, rn, s),
                        IntOp::Shr => enc::lsr_imm(rd, rn, s),
                        IntOp::Sar => enc::asr_imm(rd, rn, s),
                        IntOp::Ror => enc::ror_imm(rd, rn, s),
                        _ => enc::ror_imm(rd, rn, (64 - s) & 63),
                    });
                    return Ok(());
                }
                if matches!(op, IntOp::Add | IntOp::Sub) && (imm as i64).unsigned_abs() < 4096 {
                    let signed = if op == IntOp::Sub { -(imm as i64) } else { imm as i64 };
                    Self::add_const(words, rd, rn, signed);
                    return Ok(());
                }
                words.extend(enc::mov_imm(X17.id, imm as i64));
                X17.id
            }
        };
        match op {
            IntOp::Add => words.push(enc::add_reg(rd, rn, rm)),
            IntOp::Sub => words.push(enc::sub_reg(rd, rn, rm)),
            IntOp::Mul => words.push(enc::mul(rd, rn, rm)),
            IntOp::And => words.push(enc::and_reg(rd, rn, rm)),
            IntOp::Or => words.push(enc::orr_reg(rd, rn, rm)),
            IntOp::Xor => words.push(enc::eor_reg(rd, rn, rm)),
            IntOp::Shl => words.push(enc::lslv(rd, rn, rm)),
            IntOp::Shr => words.push(enc::lsrv(rd, rn, rm)),
            IntOp::Sar => words.push(enc::asrv(rd, rn, rm)),
            IntOp::Ror => words.push(enc::rorv(rd, rn, rm)),
            IntOp::Rol => {
                // rol by n == ror by -n (RORV uses the count modulo 64).
                words.push(enc::sub_reg(X17.id, enc::ZR as u8, rm));
                words.push(enc::rorv(rd, rn, X17.id));
            }
        }
        Ok(())
    }

    fn lower(&self, op: &MachineOp, words: &mut Vec<u32>) -> Result<Vec<Fixup>, EncodingError> {
        let here = |words: &Vec<u32>| (words.len() * 4) as u32;
        let mut fixups = Vec::new();
        match *op {
            MachineOp::Mov { dst, src } => {
                let (rd, rn) = (gp(dst)?, gp(src)?);
                if rd != rn {
                    if rd == SP_ID || rn == SP_ID {
                        words.push(enc::add_imm(rd, rn, 0, false));
                    } else {
                        words.push(enc::mov_reg(rd, rn));
                    }
                }
            }
            MachineOp::FMov { dst, src } => {
                let (rd, rn) = (fpr(dst)?, fpr(src)?);
                if rd != rn {
                    words.push(enc::fmov_reg(rd, rn));
                }
            }
            MachineOp::MovImm { dst, imm } => words.extend(enc::mov_imm(gp_nosp(dst)?, imm)),
            MachineOp::FpZero { dst } => words.push(enc::fmov_from_gp(fpr(dst)?, enc::ZR as u8)),
            MachineOp::BitsToFp { dst, src } => {
                words.push(enc::fmov_from_gp(fpr(dst)?, gp_nosp(src)?))
            }
            MachineOp::FpToBits { dst, src } => {
                words.push(enc::fmov_to_gp(gp_nosp(dst)?, fpr(src)?))
            }
            MachineOp::CvtIntToFp { dst, src } => words.push(enc::scvtf(fpr(dst)?, gp_nosp(src)?)),
            MachineOp::CvtFpToInt { dst, src } => {
                words.push(enc::fcvtzs(gp_nosp(dst)?, fpr(src)?))
            }
            MachineOp::Load { dst, mem } => {
                let (access, rt) = if dst.is_fp() {
                    (Access::D, fpr(dst)?)
                } else {
                    (Access::X, gp_nosp(dst)?)
                };
                words.extend(enc::load_store(access, true, rt, gp(mem.base)?, mem.offset, X17.id));
            }
            MachineOp::Store { src, mem } => {
                let (access, rt) = if src.is_fp() {
                    (Access::D, fpr(src)?)
                } else {
                    (Access::X, gp_nosp(src)?)
                };
                words.extend(enc::load_store(access, false, rt, gp(mem.base)?, mem.offset, X17.id));
            }
            MachineOp::StoreByte { src, mem } => words.extend(enc::load_store(
                Access::B,
                false,
                gp_nosp(src)?,
                gp(mem.base)?,
                mem.offset,
                X17.id,
            )),
            MachineOp::LoadByte { dst, mem } => words.extend(enc::load_store(
                Access::B,
                true,
                gp_nosp(dst)?,
                gp(mem.base)?,
                mem.offset,
                X17.id,
            )),
            MachineOp::Lea { dst, mem } => {
                Self::add_const(words, gp(dst)?, gp(mem.base)?, mem.offset as i64)
            }
            MachineOp::Int { op, dst, lhs, rhs } => {
                Self::int_op(words, op, gp_nosp(dst)?, gp_nosp(lhs)?, rhs)?
            }
            MachineOp::Fp { op, dst, lhs, rhs } => {
                let (rd, rn, rm) = (fpr(dst)?, fpr(lhs)?, fpr(rhs)?);
                words.push(match op {
                    FpOp::Add => enc::fadd(rd, rn, rm),
                    FpOp::Sub => enc::fsub(rd, rn, rm),
                    FpOp::Mul => enc::fmul(rd, rn, rm),
                    FpOp::Div => enc::fdiv(rd, rn, rm),
                });
            }
            MachineOp::FpSqrt { dst, src } => words.push(enc::fsqrt(fpr(dst)?, fpr(src)?)),
            MachineOp::BranchFp { cond, lhs, rhs } => {
                words.push(enc::fcmp(fpr(lhs)?, fpr(rhs)?));
                fixups.push(Fixup {
                    offset: here(words),
                    kind: RelocKind::CondBranch,
                });
                words.push(enc::b_cond(fp_cond(cond)));
            }
            MachineOp::BranchInt { cond, lhs, rhs } => {
                let rn = gp_nosp(lhs)?;
                match rhs {
                    Operand::Reg(r) => words.push(enc::cmp_reg(rn, gp_nosp(r)?)),
                    Operand::Imm(imm) if (0..4096).contains(&imm) => {
                        words.push(enc::cmp_imm(rn, imm as u32))
                    }
                    Operand::Imm(imm) if (-4095..0).contains(&imm) => {
                        words.push(enc::cmn_imm(rn, (-imm) as u32))
                    }
                    Operand::Imm(imm) => {
                        words.extend(enc::mov_imm(X17.id, imm as i64));
                        words.push(enc::cmp_reg(rn, X17.id));
                    }
                }
                fixups.push(Fixup {
                    offset: here(words),
                    kind: RelocKind::CondBranch,
                });
                words.push(enc::b_cond(int_cond(cond)));
            }
            MachineOp::Jump => {
                fixups.push(Fixup {
                    offset: here(words),
                    kind: RelocKind::UncondBranch,
                });
                words.push(enc::B);
            }
            MachineOp::Call => {
                fixups.push(Fixup {
                    offset: here(words),
                    kind: RelocKind::DirectCall,
                });
                words.push(enc::BL);
            }
            MachineOp::CallReg { target } => words.push(enc::blr(gp_nosp(target)?)),
            MachineOp::Ret => words.push(enc::RET),
            MachineOp::LoadAddr { dst } => {
                let rd = gp_nosp(dst)?;
                fixups.push(Fixup {
                    offset: here(words),
                    kind: RelocKind::PcRelLoad,
                });
                words.push(enc::adrp(rd));
                words.push(enc::add_imm(rd, rd, 0, false));
            }
            MachineOp::LoadConst { dst } => {
                let rt = fpr(dst)?;
                fixups.push(Fixup {
                    offset: here(words),
                    kind: RelocKind::PcRelLoad,
                });
                words.push(enc::adrp(X17.id));
                words.extend(enc::load_store(Access::D, true, rt, X17.id, 0, X17.id));
            }
            MachineOp::AdjustSp { delta } => {
                if delta % 16 != 0 {
                    return Err(Self::out_of_range("unaligned stack adjustment", delta as i64));
                }
                if delta != 0 {
                    Self::add_const(words, SP_ID, SP_ID, delta as i64);
                }
            }
            MachineOp::AlignSp => {
                words.push(enc::add_imm(X17.id, SP_ID, 0, false));
                words.push(enc::lsr_imm(X17.id, X17.id, 4));
                words.push(enc::lsl_imm(X17.id, X17.id, 4));
                words.push(enc::add_imm(SP_ID, X17.id, 0, false));
            }
            MachineOp::EnterFrame { frame_size } => {
                words.push(enc::PUSH_FRAME_RECORD);
                words.push(enc::add_imm(29, SP_ID, 0, false));
                if frame_size > 0 {
                    Self::add_const(words, SP_ID, SP_ID, -(frame_size as i64));
                }
            }
            MachineOp::LeaveFrame { .. } => {
                words.push(enc::add_imm(SP_ID, 29, 0, false));
                words.push(enc::POP_FRAME_RECORD);
            }
            MachineOp::Syscall => words.push(enc::svc(self.svc_imm())),
            MachineOp::AtomicAdd {
                addr,
                value,
                result,
            } => {
                if result == addr || result == value {
                    return Err(EncodingError::InvalidRegister {
                        arch: ARCH,
                        reg: result,
                        what: "atomic add result that aliases an input",
                    });
                }
                let rd = gp_nosp(result)?;
                let loop_words = enc::atomic_add_loop(rd, gp(addr)?, gp_nosp(value)?, X17.id)
                    .ok_or_else(|| Self::out_of_range("exclusive loop branch", -12))?;
                words.extend(loop_words);
            }
            MachineOp::Trap => words.push(enc::BRK),
        }
        Ok(fixups)
    }
}

impl Encoder for Arm64Encoder {
    fn arch(&self) -> Arch {
        Arch::Arm64
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
        let first = read_word(site, 0).ok_or(truncated.clone())?;
        let delta = target_addr.wrapping_sub(site_addr) as i64;
        match kind {
            RelocKind::DirectCall | RelocKind::UncondBranch => {
                let word = enc::with_imm26(first, delta)
                    .ok_or_else(|| Self::out_of_range("branch displacement", delta))?;
                write_word(site, 0, word);
            }
            RelocKind::CondBranch => {
                let word = enc::with_imm19(first, delta)
                    .ok_or_else(|| Self::out_of_range("conditional branch displacement", delta))?;
                write_word(site, 0, word);
            }
            RelocKind::PcRelLoad => {
                let second = read_word(site, 1).ok_or(truncated)?;
                let pages = ((target_addr & !0xfff) as i64 - (site_addr & !0xfff) as i64) >> 12;
                let first = enc::with_adrp_pages(first, pages)
                    .ok_or_else(|| Self::out_of_range("adrp page delta", pages))?;
                let second = enc::with_page_offset(second, target_addr & 0xfff)
                    .ok_or_else(|| Self::out_of_range("page offset", (target_addr & 0xfff) as i64))?;
                write_word(site, 0, first);
                write_word(site, 1, second);
            }
        }
        Ok(())
    }

    fn decode_target(&self, kind: RelocKind, site: &[u8], site_addr: u64) -> Option<u64> {
        let first = read_word(site, 0)?;
        match kind {
            RelocKind::DirectCall | RelocKind::UncondBranch => {
                Some(site_addr.wrapping_add(enc::imm26_delta(first) as u64))
            }
            RelocKind::CondBranch => Some(site_addr.wrapping_add(enc::imm19_delta(first) as u64)),
            RelocKind::PcRelLoad => {
                let second = read_word(site, 1)?;
                let page = (site_addr & !0xfff).wrapping_add((enc::adrp_pages(first) << 12) as u64);
                Some(page + enc::page_offset(second)?)
            }
        }
    }

    fn padding_byte(&self) -> u8 {
        0
    }

    fn plt_header(&self, plt_addr: u64, got_addr: u64) -> Result<Vec<u8>, EncodingError> {
        // stp x16, x30, [sp, #-16]!; adrp x16, GOT+16; ldr x17, [x16, lo];
        // add x16, x16, lo; br x17; nop x3
        let target = got_addr + 16;
        let (adrp, lo) = Self::adrp_to(16, plt_addr + 4, target)?;
        let mut words = vec![0xA9BF_7BF0, adrp, Self::ldr_lo(17, 16, lo)?];
        words.push(enc::add_imm(16, 16, lo as u32, false));
        words.push(enc::br(17));
        words.extend([0xD503_201F; 3]);
        Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
    }

    fn plt_entry(
        &self,
        entry_addr: u64,
        got_slot: u64,
        _index: u32,
        _plt_addr: u64,
    ) -> Result<Vec<u8>, EncodingError> {
        let (adrp, lo) = Self::adrp_to(16, entry_addr, got_slot)?;
        let words = [
            adrp,
            Self::ldr_lo(17, 16, lo)?,
            enc::add_imm(16, 16, lo as u32, false),
            enc::br(17),
        ];
        Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
    }

    fn plt_header_size(&self) -> usize {
        32
    }

    fn plt_entry_size(&self) -> usize {
        16
    }

    fn macho_stub(&self, stub_addr: u64, got_slot: u64) -> Result<Vec<u8>, EncodingError> {
        let (adrp, lo) = Self::adrp_to(16, stub_addr, got_slot)?;
        let words = [adrp, Self::ldr_lo(16, 16, lo)?, enc::br(16)];
        Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
    }

    fn macho_stub_size(&self) -> usize {
        12
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Mem;
    use crate::arm64::abi::{d, x};

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn encode(op: MachineOp) -> (Vec<u32>, Vec<Fixup>) {
        let enc = Arm64Encoder::new(ImageFormat::Elf);
        let mut out = Vec::new();
        let fixups = enc.encode(&op, &mut out).unwrap();
        assert_eq!(out.len() % 4, 0);
        (words(&out), fixups)
    }

    #[test]
    fn test_frame_setup() {
        let (w, _) = encode(MachineOp::EnterFrame { frame_size: 32 });
        assert_eq!(w, vec![0xA9BF_7BFD, 0x9100_03FD, 0xD100_83FF]);
        let (w, _) = encode(MachineOp::LeaveFrame { frame_size: 32 });
        assert_eq!(w, vec![0x9100_03BF, 0xA8C1_7BFD]);
    }

    #[test]
    fn test_svc_depends_on_os() {
        let mut out = Vec::new();
        Arm64Encoder::new(ImageFormat::MachO)
            .encode(&MachineOp::Syscall, &mut out)
            .unwrap();
        assert_eq!(words(&out), vec![0xD400_1001]);
        let (w, _) = encode(MachineOp::Syscall);
        assert_eq!(w, vec![0xD400_0001]);
    }

    #[test]
    fn test_branch_patch_roundtrip() {
        let enc = Arm64Encoder::new(ImageFormat::Elf);
        let (w, fixups) = encode(MachineOp::BranchFp {
            cond: Cond::Lt,
            lhs: d(0),
            rhs: d(1),
        });
        assert_eq!(fixups.len(), 1);
        let at = fixups[0].offset as usize;
        let mut bytes: Vec<u8> = w.iter().flat_map(|w| w.to_le_bytes()).collect();
        enc.patch(RelocKind::CondBranch, &mut bytes[at..], 0x1004, 0x0f00)
            .unwrap();
        assert_eq!(
            enc.decode_target(RelocKind::CondBranch, &bytes[at..], 0x1004),
            Some(0x0f00)
        );
        // MI survives patching.
        assert_eq!(words(&bytes)[1] & 0xf, 0x4);
    }

    #[test]
    fn test_atomic_add_avoids_lse() {
        let (w, _) = encode(MachineOp::AtomicAdd {
            addr: x(0),
            value: x(1),
            result: x(2),
        });
        assert_eq!(w, enc::atomic_add_loop(2, 0, 1, X17.id).unwrap().to_vec());
        // No word is from the LSE atomic memory operation group.
        assert!(w.iter().all(|w| w & 0x3F20_0C00 != 0x3820_0000));

        let enc = Arm64Encoder::new(ImageFormat::Elf);
        let aliased = MachineOp::AtomicAdd {
            addr: x(0),
            value: x(1),
            result: x(1),
        };
        assert!(matches!(
            enc.encode(&aliased, &mut Vec::new()),
            Err(EncodingError::InvalidRegister { .. })
        ));
    }

    #[test]
    fn test_adrp_pair_patch() {
        let enc = Arm64Encoder::new(ImageFormat::Elf);
        let (w, fixups) = encode(MachineOp::LoadConst { dst: d(3) });
        assert_eq!(fixups[0].offset, 0);
        let mut bytes: Vec<u8> = w.iter().flat_map(|w| w.to_le_bytes()).collect();
        enc.patch(RelocKind::PcRelLoad, &mut bytes, 0x40_1ffc, 0x40_3010)
            .unwrap();
        assert_eq!(
            enc.decode_target(RelocKind::PcRelLoad, &bytes, 0x40_1ffc),
            Some(0x40_3010)
        );
        assert!(enc
            .patch(RelocKind::PcRelLoad, &mut bytes, 0x40_1ffc, 0x40_3011)
            .is_err());
    }

    #[test]
    fn test_large_offsets_use_scratch() {
        let (w, _) = encode(MachineOp::Load {
            dst: x(1),
            mem: Mem::new(x(29), -8192),
        });
        assert!(w.len() >= 2);
        let (w, _) = encode(MachineOp::Int {
            op: IntOp::And,
            dst: x(0),
            lhs: x(0),
            rhs: Operand::Imm(0xff),
        });
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn test_stub_shape() {
        let enc = Arm64Encoder::new(ImageFormat::MachO);
        let code = enc.macho_stub(0x1_0000_4000, 0x1_0000_8010).unwrap();
        assert_eq!(code.len(), enc.macho_stub_size());
        assert_eq!(words(&code)[2], 0xD61F_0200);
        assert_eq!(
            enc.decode_target(RelocKind::PcRelLoad, &code, 0x1_0000_4000),
            Some(0x1_0000_8010)
        );
    }
}
