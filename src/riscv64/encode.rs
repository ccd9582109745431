//! RV64 instruction words.
//!
//! Builders for the R, I, S, B, U and J formats plus the handful of
//! instructions the backend needs. Relocation helpers at the bottom rewrite
//! the same immediate fields the builders fill in.

#[inline]
fn r(n: u8) -> u32 {
    (n & 0x1f) as u32
}

pub fn r_type(op: u32, funct3: u32, funct7: u32, rd: u8, rs1: u8, rs2: u8) -> u32 {
    funct7 << 25 | r(rs2) << 20 | r(rs1) << 15 | funct3 << 12 | r(rd) << 7 | op
}

pub fn i_type(op: u32, funct3: u32, rd: u8, rs1: u8, imm: i32) -> u32 {
    ((imm as u32) & 0xfff) << 20 | r(rs1) << 15 | funct3 << 12 | r(rd) << 7 | op
}

pub fn s_type(op: u32, funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5) & 0x7f) << 25 | r(rs2) << 20 | r(rs1) << 15 | funct3 << 12 | (imm & 0x1f) << 7 | op
}

pub fn b_type(funct3: u32, rs1: u8, rs2: u8, offset: i32) -> u32 {
    let imm = offset as u32;
    ((imm >> 12) & 1) << 31
        | ((imm >> 5) & 0x3f) << 25
        | r(rs2) << 20
        | r(rs1) << 15
        | funct3 << 12
        | ((imm >> 1) & 0xf) << 8
        | ((imm >> 11) & 1) << 7
        | 0x63
}

pub fn u_type(op: u32, rd: u8, imm20: u32) -> u32 {
    (imm20 & 0xfffff) << 12 | r(rd) << 7 | op
}

pub fn j_type(rd: u8, offset: i32) -> u32 {
    let imm = offset as u32;
    ((imm >> 20) & 1) << 31
        | ((imm >> 1) & 0x3ff) << 21
        | ((imm >> 11) & 1) << 20
        | ((imm >> 12) & 0xff) << 12
        | r(rd) << 7
        | 0x6F
}

pub fn fits_i12(value: i64) -> bool {
    (-2048..2048).contains(&value)
}

// ==== INTEGER ====

const OP_IMM: u32 = 0x13;
const OP_IMM_32: u32 = 0x1B;
const OP: u32 = 0x33;

pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(OP_IMM, 0, rd, rs1, imm)
}

pub fn addiw(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(OP_IMM_32, 0, rd, rs1, imm)
}

pub fn xori(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(OP_IMM, 4, rd, rs1, imm)
}

pub fn ori(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(OP_IMM, 6, rd, rs1, imm)
}

pub fn andi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(OP_IMM, 7, rd, rs1, imm)
}

pub fn slli(rd: u8, rs1: u8, shamt: u32) -> u32 {
    i_type(OP_IMM, 1, rd, rs1, (shamt & 63) as i32)
}

pub fn srli(rd: u8, rs1: u8, shamt: u32) -> u32 {
    i_type(OP_IMM, 5, rd, rs1, (shamt & 63) as i32)
}

pub fn srai(rd: u8, rs1: u8, shamt: u32) -> u32 {
    i_type(OP_IMM, 5, rd, rs1, (0x400 | (shamt & 63)) as i32)
}

pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 0, 0, rd, rs1, rs2)
}

pub fn sub(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 0, 0x20, rd, rs1, rs2)
}

pub fn mul(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 0, 0x01, rd, rs1, rs2)
}

pub fn and(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 7, 0, rd, rs1, rs2)
}

pub fn or(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 6, 0, rd, rs1, rs2)
}

pub fn xor(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 4, 0, rd, rs1, rs2)
}

pub fn sll(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 1, 0, rd, rs1, rs2)
}

pub fn srl(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 5, 0, rd, rs1, rs2)
}

pub fn sra(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP, 5, 0x20, rd, rs1, rs2)
}

pub fn lui(rd: u8, imm20: u32) -> u32 {
    u_type(0x37, rd, imm20)
}

pub fn auipc(rd: u8, imm20: u32) -> u32 {
    u_type(0x17, rd, imm20)
}

/// Sign-extend the low 12 bits.
pub fn low12(value: i64) -> i64 {
    (value << 52) >> 52
}

/// Shortest LUI/ADDI(W)/SLLI sequence for a 64-bit constant.
pub fn li(rd: u8, value: i64) -> Vec<u32> {
    if fits_i12(value) {
        return vec![addi(rd, 0, value as i32)];
    }
    if i32::try_from(value).is_ok() {
        let lo = low12(value);
        let hi = ((value - lo) >> 12) as u32;
        let mut words = vec![lui(rd, hi)];
        if lo != 0 {
            words.push(addiw(rd, rd, lo as i32));
        }
        return words;
    }
    let lo = low12(value);
    let hi = value.wrapping_sub(lo) >> 12;
    let mut words = li(rd, hi);
    words.push(slli(rd, rd, 12));
    if lo != 0 {
        words.push(addi(rd, rd, lo as i32));
    }
    words
}

// ==== MEMORY ====

pub fn ld(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x03, 3, rd, rs1, imm)
}

pub fn lbu(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x03, 4, rd, rs1, imm)
}

pub fn sd(rs2: u8, rs1: u8, imm: i32) -> u32 {
    s_type(0x23, 3, rs1, rs2, imm)
}

pub fn sb(rs2: u8, rs1: u8, imm: i32) -> u32 {
    s_type(0x23, 0, rs1, rs2, imm)
}

pub fn fld(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x07, 3, rd, rs1, imm)
}

pub fn fsd(rs2: u8, rs1: u8, imm: i32) -> u32 {
    s_type(0x27, 3, rs1, rs2, imm)
}

/// `amoadd.d.aqrl rd, rs2, (rs1)`.
pub fn amoadd_d_aqrl(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0x2F, 3, 0x03, rd, rs1, rs2)
}

// ==== FLOATING POINT ====

const OP_FP: u32 = 0x53;
/// Dynamic rounding mode.
const RM_DYN: u32 = 7;
const RM_RTZ: u32 = 1;

pub fn fadd_d(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP_FP, RM_DYN, 0x01, rd, rs1, rs2)
}

pub fn fsub_d(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP_FP, RM_DYN, 0x05, rd, rs1, rs2)
}

pub fn fmul_d(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP_FP, RM_DYN, 0x09, rd, rs1, rs2)
}

pub fn fdiv_d(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP_FP, RM_DYN, 0x0D, rd, rs1, rs2)
}

pub fn fsqrt_d(rd: u8, rs1: u8) -> u32 {
    r_type(OP_FP, RM_DYN, 0x2D, rd, rs1, 0)
}

/// `fmv.d rd, rs` (FSGNJ.D with equal sources).
pub fn fmv_d(rd: u8, rs: u8) -> u32 {
    r_type(OP_FP, 0, 0x11, rd, rs, rs)
}

/// `fmv.d.x fd, xs`.
pub fn fmv_d_x(rd: u8, rs1: u8) -> u32 {
    r_type(OP_FP, 0, 0x79, rd, rs1, 0)
}

/// `fmv.x.d xd, fs`.
pub fn fmv_x_d(rd: u8, rs1: u8) -> u32 {
    r_type(OP_FP, 0, 0x71, rd, rs1, 0)
}

/// `fcvt.d.l fd, xs`.
pub fn fcvt_d_l(rd: u8, rs1: u8) -> u32 {
    r_type(OP_FP, RM_DYN, 0x69, rd, rs1, 2)
}

/// `fcvt.l.d xd, fs, rtz`.
pub fn fcvt_l_d(rd: u8, rs1: u8) -> u32 {
    r_type(OP_FP, RM_RTZ, 0x61, rd, rs1, 2)
}

pub fn feq_d(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP_FP, 2, 0x51, rd, rs1, rs2)
}

pub fn flt_d(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP_FP, 1, 0x51, rd, rs1, rs2)
}

pub fn fle_d(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(OP_FP, 0, 0x51, rd, rs1, rs2)
}

// ==== CONTROL FLOW ====

pub const ECALL: u32 = 0x0000_0073;
pub const EBREAK: u32 = 0x0010_0073;
pub const NOP: u32 = 0x0000_0013;

pub fn jal(rd: u8, offset: i32) -> u32 {
    j_type(rd, offset)
}

pub fn jalr(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x67, 0, rd, rs1, imm)
}

/// Branch funct3 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Eq = 0,
    Ne = 1,
    Lt = 4,
    Ge = 5,
}

impl BranchKind {
    pub fn invert(self) -> BranchKind {
        match self {
            BranchKind::Eq => BranchKind::Ne,
            BranchKind::Ne => BranchKind::Eq,
            BranchKind::Lt => BranchKind::Ge,
            BranchKind::Ge => BranchKind::Lt,
        }
    }
}

pub fn branch(kind: BranchKind, rs1: u8, rs2: u8, offset: i32) -> u32 {
    b_type(kind as u32, rs1, rs2, offset)
}

// ==== RELOCATION FIELDS ====

/// Split a PC-relative delta into AUIPC's upper 20 bits and a signed low 12.
pub fn split_hi_lo(delta: i64) -> Option<(u32, i32)> {
    let hi = (delta + 0x800) >> 12;
    if !(-(1 << 19)..(1 << 19)).contains(&hi) {
        return None;
    }
    let lo = delta - (hi << 12);
    Some(((hi as u32) & 0xfffff, lo as i32))
}

pub fn with_u_imm(insn: u32, imm20: u32) -> u32 {
    (insn & 0xfff) | (imm20 & 0xfffff) << 12
}

pub fn u_imm(insn: u32) -> i64 {
    ((insn & 0xffff_f000) as i32 as i64) >> 12
}

pub fn with_i_imm(insn: u32, imm: i32) -> u32 {
    (insn & 0x000f_ffff) | ((imm as u32) & 0xfff) << 20
}

pub fn i_imm(insn: u32) -> i64 {
    ((insn as i32) >> 20) as i64
}

/// Set the J-type offset, preserving `rd`.
pub fn with_j_offset(insn: u32, offset: i64) -> Option<u32> {
    if offset % 2 != 0 || !(-(1 << 20)..(1 << 20)).contains(&offset) {
        return None;
    }
    Some(j_type(((insn >> 7) & 0x1f) as u8, offset as i32))
}

pub fn j_offset(insn: u32) -> i64 {
    let imm = ((insn >> 31) & 1) << 20
        | ((insn >> 21) & 0x3ff) << 1
        | ((insn >> 20) & 1) << 11
        | ((insn >> 12) & 0xff) << 12;
    ((imm << 11) as i32 >> 11) as i64
}

pub fn b_offset(insn: u32) -> i64 {
    let imm = ((insn >> 31) & 1) << 12
        | ((insn >> 25) & 0x3f) << 5
        | ((insn >> 8) & 0xf) << 1
        | ((insn >> 7) & 1) << 11;
    ((imm << 19) as i32 >> 19) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_words() {
        // addi sp, sp, -16
        assert_eq!(addi(2, 2, -16), 0xFF01_0113);
        // sd ra, 8(sp)
        assert_eq!(sd(1, 2, 8), 0x0011_3423);
        // ld ra, 8(sp)
        assert_eq!(ld(1, 2, 8), 0x0081_3083);
        // add a0, a0, a1
        assert_eq!(add(10, 10, 11), 0x00B5_0533);
        // fadd.d fa0, fa0, fa1
        assert_eq!(fadd_d(10, 10, 11), 0x02B5_7553);
        // jalr zero, 0(ra) == ret
        assert_eq!(jalr(0, 1, 0), 0x0000_8067);
    }

    #[test]
    fn test_li_values() {
        fn eval(words: &[u32]) -> i64 {
            let mut reg: i64 = 0;
            for w in words {
                match w & 0x7f {
                    0x37 => reg = u_imm(*w) << 12,
                    0x13 if (w >> 12) & 7 == 0 => {
                        let src = if (w >> 15) & 0x1f == 0 { 0 } else { reg };
                        reg = src.wrapping_add(i_imm(*w));
                    }
                    0x13 => reg <<= (w >> 20) & 63,
                    0x1B => reg = (reg.wrapping_add(i_imm(*w)) as i32) as i64,
                    _ => panic!("unexpected word {w:#x}"),
                }
            }
            reg
        }
        for value in [
            0,
            1,
            -1,
            2047,
            -2048,
            2048,
            0x7fff_ffff,
            -0x8000_0000,
            0x1234_5678_9abc,
            i64::MIN,
            i64::MAX,
            -12345678901,
        ] {
            assert_eq!(eval(&li(5, value)), value, "li {value:#x}");
        }
    }

    #[test]
    fn test_branch_offsets() {
        for offset in [8i32, -4, 4094, -4096] {
            assert_eq!(b_offset(branch(BranchKind::Lt, 5, 6, offset)), offset as i64);
        }
        for offset in [4i64, -8, 0xffffe, -0x100000] {
            let w = with_j_offset(jal(0, 0), offset).unwrap();
            assert_eq!(j_offset(w), offset);
        }
        assert!(with_j_offset(jal(0, 0), 1 << 20).is_none());
    }

    #[test]
    fn test_hi_lo_split() {
        for delta in [0i64, 4, 0x7ff, 0x800, -0x800, -0x801, 0x12345678, -0x7654321] {
            let (hi, lo) = split_hi_lo(delta).unwrap();
            let w = with_u_imm(auipc(5, 0), hi);
            assert_eq!((u_imm(w) << 12) + lo as i64, delta);
            assert!(fits_i12(lo as i64));
        }
    }
}
