//! ARM64 instruction words.
//!
//! Every instruction is a fixed 32-bit word. The builders here are the only
//! place the bit layouts live: the encoder calls them to emit, and the
//! relocation helpers at the bottom rewrite the same immediate fields when
//! patching, so an emitted word and its patched form can never disagree.

/// Register number 31: SP as a base or in add/sub immediates, XZR elsewhere.
pub const ZR: u32 = 31;

#[inline]
fn r(n: u8) -> u32 {
    (n & 0x1f) as u32
}

// ==== MOVES ====

pub fn movz(rd: u8, imm16: u16, hw: u32) -> u32 {
    0xD280_0000 | (hw & 3) << 21 | (imm16 as u32) << 5 | r(rd)
}

pub fn movk(rd: u8, imm16: u16, hw: u32) -> u32 {
    0xF280_0000 | (hw & 3) << 21 | (imm16 as u32) << 5 | r(rd)
}

pub fn movn(rd: u8, imm16: u16, hw: u32) -> u32 {
    0x9280_0000 | (hw & 3) << 21 | (imm16 as u32) << 5 | r(rd)
}

/// Shortest MOVZ/MOVN + MOVK sequence for a 64-bit constant.
pub fn mov_imm(rd: u8, imm: i64) -> Vec<u32> {
    let value = imm as u64;
    let chunks: [u16; 4] = std::array::from_fn(|i| (value >> (16 * i)) as u16);
    let zeros = chunks.iter().filter(|c| **c == 0).count();
    let ones = chunks.iter().filter(|c| **c == 0xffff).count();
    let mut words = Vec::with_capacity(4);
    if ones > zeros {
        for (hw, chunk) in chunks.iter().enumerate() {
            if *chunk == 0xffff {
                continue;
            }
            if words.is_empty() {
                words.push(movn(rd, !*chunk, hw as u32));
            } else {
                words.push(movk(rd, *chunk, hw as u32));
            }
        }
        if words.is_empty() {
            words.push(movn(rd, 0, 0));
        }
    } else {
        for (hw, chunk) in chunks.iter().enumerate() {
            if *chunk == 0 {
                continue;
            }
            if words.is_empty() {
                words.push(movz(rd, *chunk, hw as u32));
            } else {
                words.push(movk(rd, *chunk, hw as u32));
            }
        }
        if words.is_empty() {
            words.push(movz(rd, 0, 0));
        }
    }
    words
}

/// `mov xd, xm` (ORR with XZR); neither operand may be SP.
pub fn mov_reg(rd: u8, rm: u8) -> u32 {
    0xAA00_0000 | r(rm) << 16 | ZR << 5 | r(rd)
}

// ==== INTEGER ARITHMETIC ====

/// `add xd, xn, #imm12{, lsl #12}`; register 31 is SP.
pub fn add_imm(rd: u8, rn: u8, imm12: u32, shift12: bool) -> u32 {
    0x9100_0000 | (shift12 as u32) << 22 | (imm12 & 0xfff) << 10 | r(rn) << 5 | r(rd)
}

pub fn sub_imm(rd: u8, rn: u8, imm12: u32, shift12: bool) -> u32 {
    0xD100_0000 | (shift12 as u32) << 22 | (imm12 & 0xfff) << 10 | r(rn) << 5 | r(rd)
}

/// `add xd, xn, xm, uxtx`; the extended form accepts SP as `rn` and `rd`.
pub fn add_ext(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8B20_6000 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn add_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8B00_0000 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn sub_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0xCB00_0000 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn and_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8A00_0000 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn orr_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0xAA00_0000 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn eor_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0xCA00_0000 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

/// `mul xd, xn, xm` (MADD with XZR).
pub fn mul(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9B00_7C00 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn lslv(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9AC0_2000 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn lsrv(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9AC0_2400 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn asrv(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9AC0_2800 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn rorv(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9AC0_2C00 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

fn ubfm(rd: u8, rn: u8, immr: u32, imms: u32) -> u32 {
    0xD340_0000 | (immr & 63) << 16 | (imms & 63) << 10 | r(rn) << 5 | r(rd)
}

fn sbfm(rd: u8, rn: u8, immr: u32, imms: u32) -> u32 {
    0x9340_0000 | (immr & 63) << 16 | (imms & 63) << 10 | r(rn) << 5 | r(rd)
}

pub fn lsl_imm(rd: u8, rn: u8, shift: u32) -> u32 {
    let shift = shift & 63;
    ubfm(rd, rn, (64 - shift) & 63, 63 - shift)
}

pub fn lsr_imm(rd: u8, rn: u8, shift: u32) -> u32 {
    ubfm(rd, rn, shift, 63)
}

pub fn asr_imm(rd: u8, rn: u8, shift: u32) -> u32 {
    sbfm(rd, rn, shift, 63)
}

/// `ror xd, xn, #shift` (EXTR with both sources equal).
pub fn ror_imm(rd: u8, rn: u8, shift: u32) -> u32 {
    0x93C0_0000 | r(rn) << 16 | (shift & 63) << 10 | r(rn) << 5 | r(rd)
}

/// `cmp xn, xm`.
pub fn cmp_reg(rn: u8, rm: u8) -> u32 {
    0xEB00_0000 | r(rm) << 16 | r(rn) << 5 | ZR
}

/// `cmp xn, #imm12`.
pub fn cmp_imm(rn: u8, imm12: u32) -> u32 {
    0xF100_0000 | (imm12 & 0xfff) << 10 | r(rn) << 5 | ZR
}

/// `cmn xn, #imm12`, i.e. compare against `-imm12`.
pub fn cmn_imm(rn: u8, imm12: u32) -> u32 {
    0xB100_0000 | (imm12 & 0xfff) << 10 | r(rn) << 5 | ZR
}

// ==== LOADS AND STORES ====

/// Size and kind of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    X,
    D,
    B,
}

impl Access {
    fn bytes(self) -> i32 {
        match self {
            Access::X | Access::D => 8,
            Access::B => 1,
        }
    }

    fn unsigned_offset(self, load: bool) -> u32 {
        match (self, load) {
            (Access::X, true) => 0xF940_0000,
            (Access::X, false) => 0xF900_0000,
            (Access::D, true) => 0xFD40_0000,
            (Access::D, false) => 0xFD00_0000,
            (Access::B, true) => 0x3940_0000,
            (Access::B, false) => 0x3900_0000,
        }
    }

    fn unscaled(self, load: bool) -> u32 {
        match (self, load) {
            (Access::X, true) => 0xF840_0000,
            (Access::X, false) => 0xF800_0000,
            (Access::D, true) => 0xFC40_0000,
            (Access::D, false) => 0xFC00_0000,
            (Access::B, true) => 0x3840_0000,
            (Access::B, false) => 0x3800_0000,
        }
    }

    fn register_offset(self, load: bool) -> u32 {
        match (self, load) {
            (Access::X, true) => 0xF860_6800,
            (Access::X, false) => 0xF820_6800,
            (Access::D, true) => 0xFC60_6800,
            (Access::D, false) => 0xFC20_6800,
            (Access::B, true) => 0x3860_6800,
            (Access::B, false) => 0x3820_6800,
        }
    }
}

/// Load or store `rt` at `[rn + offset]`, using `scratch` for offsets that no
/// immediate form can hold.
pub fn load_store(access: Access, load: bool, rt: u8, rn: u8, offset: i32, scratch: u8) -> Vec<u32> {
    let size = access.bytes();
    if offset >= 0 && offset % size == 0 && offset / size < 4096 {
        let scaled = (offset / size) as u32;
        vec![access.unsigned_offset(load) | scaled << 10 | r(rn) << 5 | r(rt)]
    } else if (-256..256).contains(&offset) {
        let imm9 = (offset as u32) & 0x1ff;
        vec![access.unscaled(load) | imm9 << 12 | r(rn) << 5 | r(rt)]
    } else {
        let mut words = mov_imm(scratch, offset as i64);
        words.push(access.register_offset(load) | r(scratch) << 16 | r(rn) << 5 | r(rt));
        words
    }
}

/// `ldaxr xt, [xn]`.
pub fn ldaxr(rt: u8, rn: u8) -> u32 {
    0xC85F_FC00 | r(rn) << 5 | r(rt)
}

/// `stlxr ws, xt, [xn]`; `ws` is 0 when the store succeeded.
pub fn stlxr(rs: u8, rt: u8, rn: u8) -> u32 {
    0xC800_FC00 | r(rs) << 16 | r(rn) << 5 | r(rt)
}

/// `cbnz wt, #delta`.
pub fn cbnz_w(rt: u8, delta: i64) -> Option<u32> {
    with_imm19(0x3500_0000 | r(rt), delta)
}

/// Exclusive-monitor fetch-and-add on baseline ARMv8.0 (no LSE atomics).
/// `result` doubles as the store status, so it must differ from `rn` and
/// `rm`; the sum is built in `scratch` and the old value recovered from it.
pub fn atomic_add_loop(result: u8, rn: u8, rm: u8, scratch: u8) -> Option<[u32; 5]> {
    Some([
        ldaxr(scratch, rn),
        add_reg(scratch, scratch, rm),
        stlxr(result, scratch, rn),
        cbnz_w(result, -12)?,
        sub_reg(result, scratch, rm),
    ])
}

/// `stp x29, x30, [sp, #-16]!`.
pub const PUSH_FRAME_RECORD: u32 = 0xA9BF_7BFD;
/// `ldp x29, x30, [sp], #16`.
pub const POP_FRAME_RECORD: u32 = 0xA8C1_7BFD;

// ==== FLOATING POINT ====

pub fn fmov_reg(rd: u8, rn: u8) -> u32 {
    0x1E60_4000 | r(rn) << 5 | r(rd)
}

/// `fmov dd, xn`.
pub fn fmov_from_gp(rd: u8, rn: u8) -> u32 {
    0x9E67_0000 | r(rn) << 5 | r(rd)
}

/// `fmov xd, dn`.
pub fn fmov_to_gp(rd: u8, rn: u8) -> u32 {
    0x9E66_0000 | r(rn) << 5 | r(rd)
}

pub fn scvtf(rd: u8, rn: u8) -> u32 {
    0x9E62_0000 | r(rn) << 5 | r(rd)
}

pub fn fcvtzs(rd: u8, rn: u8) -> u32 {
    0x9E78_0000 | r(rn) << 5 | r(rd)
}

pub fn fadd(rd: u8, rn: u8, rm: u8) -> u32 {
    0x1E60_2800 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn fsub(rd: u8, rn: u8, rm: u8) -> u32 {
    0x1E60_3800 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn fmul(rd: u8, rn: u8, rm: u8) -> u32 {
    0x1E60_0800 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn fdiv(rd: u8, rn: u8, rm: u8) -> u32 {
    0x1E60_1800 | r(rm) << 16 | r(rn) << 5 | r(rd)
}

pub fn fsqrt(rd: u8, rn: u8) -> u32 {
    0x1E61_C000 | r(rn) << 5 | r(rd)
}

pub fn fcmp(rn: u8, rm: u8) -> u32 {
    0x1E60_2000 | r(rm) << 16 | r(rn) << 5
}

// ==== CONTROL FLOW ====

pub const RET: u32 = 0xD65F_03C0;
pub const BRK: u32 = 0xD420_0000;

pub fn blr(rn: u8) -> u32 {
    0xD63F_0000 | r(rn) << 5
}

pub fn br(rn: u8) -> u32 {
    0xD61F_0000 | r(rn) << 5
}

pub fn svc(imm16: u16) -> u32 {
    0xD400_0001 | (imm16 as u32) << 5
}

pub const B: u32 = 0x1400_0000;
pub const BL: u32 = 0x9400_0000;

/// `b.cond` with a zero displacement.
pub fn b_cond(cond: u32) -> u32 {
    0x5400_0000 | (cond & 0xf)
}

pub fn adrp(rd: u8) -> u32 {
    0x9000_0000 | r(rd)
}

// ==== RELOCATION FIELDS ====

fn signed_field(delta: i64, bits: u32) -> Option<u32> {
    if delta % 4 != 0 {
        return None;
    }
    let words = delta / 4;
    let limit = 1i64 << (bits - 1);
    if words < -limit || words >= limit {
        return None;
    }
    Some((words as u32) & ((1u32 << bits) - 1))
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// Set the imm26 field of B/BL.
pub fn with_imm26(insn: u32, delta: i64) -> Option<u32> {
    Some((insn & 0xFC00_0000) | signed_field(delta, 26)?)
}

pub fn imm26_delta(insn: u32) -> i64 {
    sign_extend(insn & 0x03FF_FFFF, 26) * 4
}

/// Set the imm19 field of B.cond.
pub fn with_imm19(insn: u32, delta: i64) -> Option<u32> {
    Some((insn & 0xFF00_001F) | signed_field(delta, 19)? << 5)
}

pub fn imm19_delta(insn: u32) -> i64 {
    sign_extend((insn >> 5) & 0x7FFFF, 19) * 4
}

/// Set the 21-bit page delta of ADRP.
pub fn with_adrp_pages(insn: u32, pages: i64) -> Option<u32> {
    if !(-(1 << 20)..(1 << 20)).contains(&pages) {
        return None;
    }
    let imm = (pages as u32) & 0x1F_FFFF;
    let immlo = imm & 3;
    let immhi = imm >> 2;
    Some((insn & 0x9F00_001F) | immlo << 29 | immhi << 5)
}

pub fn adrp_pages(insn: u32) -> i64 {
    let immlo = (insn >> 29) & 3;
    let immhi = (insn >> 5) & 0x7FFFF;
    sign_extend(immhi << 2 | immlo, 21)
}

/// Page-offset companion of an ADRP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOffsetUse {
    /// `add xd, xn, #lo12`.
    Add,
    /// 64-bit load with a scaled offset (`ldr xt`/`ldr dt`).
    Load64,
}

pub fn page_offset_use(insn: u32) -> Option<PageOffsetUse> {
    match insn & 0xFFC0_0000 {
        0x9100_0000 => Some(PageOffsetUse::Add),
        0xF940_0000 | 0xFD40_0000 => Some(PageOffsetUse::Load64),
        _ => None,
    }
}

/// Set the low-12-bits field of the instruction after ADRP.
pub fn with_page_offset(insn: u32, lo12: u64) -> Option<u32> {
    let field = match page_offset_use(insn)? {
        PageOffsetUse::Add => lo12 as u32,
        PageOffsetUse::Load64 => {
            if lo12 % 8 != 0 {
                return None;
            }
            (lo12 / 8) as u32
        }
    };
    Some((insn & !(0xFFF << 10)) | (field & 0xFFF) << 10)
}

pub fn page_offset(insn: u32) -> Option<u64> {
    let field = ((insn >> 10) & 0xFFF) as u64;
    match page_offset_use(insn)? {
        PageOffsetUse::Add => Some(field),
        PageOffsetUse::Load64 => Some(field * 8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_words() {
        assert_eq!(mov_reg(0, 1), 0xAA01_03E0);
        assert_eq!(add_imm(29, 31, 0, false), 0x9100_03FD);
        assert_eq!(fadd(0, 0, 1), 0x1E61_2800);
        assert_eq!(svc(0), 0xD400_0001);
        assert_eq!(svc(0x80), 0xD400_1001);
        assert_eq!(blr(17), 0xD63F_0220);
        assert_eq!(cmp_reg(1, 2), 0xEB02_003F);
    }

    #[test]
    fn test_mov_imm_sequences() {
        assert_eq!(mov_imm(0, 0), vec![movz(0, 0, 0)]);
        assert_eq!(mov_imm(3, 42), vec![0xD280_0543]);
        assert_eq!(mov_imm(0, -1), vec![movn(0, 0, 0)]);
        assert_eq!(mov_imm(0, 0x1_0000_0001).len(), 2);
        assert_eq!(mov_imm(0, -2), vec![movn(0, 1, 0)]);
    }

    #[test]
    fn test_shift_immediates() {
        // lsl x0, x1, #3 == ubfm x0, x1, #61, #60
        assert_eq!(lsl_imm(0, 1, 3), 0xD37D_F020);
        // lsr x0, x1, #4 == ubfm x0, x1, #4, #63
        assert_eq!(lsr_imm(0, 1, 4), 0xD344_FC20);
    }

    #[test]
    fn test_load_store_forms() {
        let w = load_store(Access::X, true, 0, 29, 16, 17);
        assert_eq!(w, vec![0xF940_0BA0]);
        let w = load_store(Access::D, false, 8, 29, -8, 17);
        assert_eq!(w, vec![0xFC00_0000 | 0x1F8 << 12 | 29 << 5 | 8]);
        let w = load_store(Access::X, true, 0, 29, -4096, 17);
        assert_eq!(w.len(), 2);
        assert_eq!(*w.last().unwrap() & 0xFFE0_FC00, 0xF860_6800);
    }

    #[test]
    fn test_branch_fields() {
        let insn = with_imm26(BL, -8).unwrap();
        assert_eq!(imm26_delta(insn), -8);
        assert_eq!(insn >> 26, BL >> 26);
        let insn = with_imm19(b_cond(11), 4096).unwrap();
        assert_eq!(imm19_delta(insn), 4096);
        assert_eq!(insn & 0xf, 11);
        assert!(with_imm19(b_cond(0), 1 << 21).is_none());
        assert!(with_imm26(B, 2).is_none());
    }

    #[test]
    fn test_exclusive_add_loop() {
        let words = atomic_add_loop(2, 0, 1, 17).unwrap();
        // ldaxr x17, [x0]; add x17, x17, x1; stlxr w2, x17, [x0]; cbnz w2, .-12; sub x2, x17, x1
        assert_eq!(words[0], 0xC85F_FC11);
        assert_eq!(words[1], add_reg(17, 17, 1));
        assert_eq!(words[2], 0xC802_FC11);
        assert_eq!(words[3], 0x35FF_FFA2);
        assert_eq!(imm19_delta(words[3]), -12);
        assert_eq!(words[4], sub_reg(2, 17, 1));
    }

    #[test]
    fn test_adrp_fields() {
        for pages in [0i64, 1, -1, 0x1234, -(1 << 20)] {
            let insn = with_adrp_pages(adrp(16), pages).unwrap();
            assert_eq!(adrp_pages(insn), pages);
            assert_eq!(insn & 0x1f, 16);
        }
        let ldr = load_store(Access::D, true, 0, 16, 0, 17)[0];
        assert_eq!(page_offset(with_page_offset(ldr, 0x7f8).unwrap()), Some(0x7f8));
        assert!(with_page_offset(ldr, 0x7f4).is_none());
        let add = add_imm(0, 0, 0, false);
        assert_eq!(page_offset(with_page_offset(add, 0xabc).unwrap()), Some(0xabc));
    }
}
