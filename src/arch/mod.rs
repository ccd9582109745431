// This module defines the architecture-independent interface between the code generator
// and the three instruction-set backends. MachineOp is the logical operation vocabulary
// (moves, loads and stores, integer and double arithmetic, conversions, compare-and-branch,
// calls, PC-relative address materialization, frame setup, system calls and an atomic add)
// with typed register/immediate/memory operands. The Encoder trait turns one MachineOp into
// bytes plus a list of fixup sites and, for each relocation kind, rewrites a site once the
// final target address is known; both directions share one bit-layout definition per
// instruction in the backend. TargetInfo describes register roles, the transient pool, the
// persistent registers, argument registers and system call numbers for a target.

//! Machine operations, the per-architecture [`Encoder`] trait and target
//! register roles.

use thiserror::Error;

use crate::arm64::Arm64Encoder;
use crate::core::{Arch, AsmReg, CompileError, RelocKind, Target};
use crate::riscv64::Riscv64Encoder;
use crate::x64::X64Encoder;

pub mod target_info;

pub use target_info::{SyscallTable, TargetInfo};

/// Comparison condition for compare-and-branch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cond {
    /// The condition with operands exchanged: `a < b` iff `b > a`.
    pub fn swap(self) -> Cond {
        match self {
            Cond::Eq => Cond::Eq,
            Cond::Ne => Cond::Ne,
            Cond::Lt => Cond::Gt,
            Cond::Le => Cond::Ge,
            Cond::Gt => Cond::Lt,
            Cond::Ge => Cond::Le,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
    Rol,
    Ror,
}

impl IntOp {
    pub fn is_shift(self) -> bool {
        matches!(self, IntOp::Shl | IntOp::Shr | IntOp::Sar | IntOp::Rol | IntOp::Ror)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Second source operand of an integer operation or comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(AsmReg),
    Imm(i32),
}

/// `[base + offset]`, always a 64-bit access unless stated otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: AsmReg,
    pub offset: i32,
}

impl Mem {
    pub const fn new(base: AsmReg, offset: i32) -> Self {
        Self { base, offset }
    }
}

/// One logical machine operation.
///
/// Register operands name a bank implicitly: `dst`/`src` of `Mov` are
/// general-purpose, of `FMov` floating-point, and so on. Operations that
/// refer to code or data whose address is not known yet carry no target; the
/// encoder reports a fixup site instead and the caller records a relocation.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineOp {
    Mov { dst: AsmReg, src: AsmReg },
    FMov { dst: AsmReg, src: AsmReg },
    MovImm { dst: AsmReg, imm: i64 },
    FpZero { dst: AsmReg },
    /// Reinterpret the bits of a general-purpose register as a double.
    BitsToFp { dst: AsmReg, src: AsmReg },
    FpToBits { dst: AsmReg, src: AsmReg },
    /// Signed 64-bit integer to double.
    CvtIntToFp { dst: AsmReg, src: AsmReg },
    /// Double to signed 64-bit integer, truncating toward zero.
    CvtFpToInt { dst: AsmReg, src: AsmReg },
    /// 64-bit load into a GP or FP register.
    Load { dst: AsmReg, mem: Mem },
    /// 64-bit store from a GP or FP register.
    Store { src: AsmReg, mem: Mem },
    StoreByte { src: AsmReg, mem: Mem },
    LoadByte { dst: AsmReg, mem: Mem },
    /// Address computation `dst = base + offset` (no memory access).
    Lea { dst: AsmReg, mem: Mem },
    Int { op: IntOp, dst: AsmReg, lhs: AsmReg, rhs: Operand },
    Fp { op: FpOp, dst: AsmReg, lhs: AsmReg, rhs: AsmReg },
    FpSqrt { dst: AsmReg, src: AsmReg },
    /// Compare two doubles and branch to a fixup target when `cond` holds.
    BranchFp { cond: Cond, lhs: AsmReg, rhs: AsmReg },
    /// Compare two signed integers and branch when `cond` holds.
    BranchInt { cond: Cond, lhs: AsmReg, rhs: Operand },
    Jump,
    Call,
    CallReg { target: AsmReg },
    Ret,
    /// Materialize the address of a fixup target.
    LoadAddr { dst: AsmReg },
    /// Load the double stored at a fixup target.
    LoadConst { dst: AsmReg },
    /// `sp += delta`; `delta` must keep 16-byte alignment.
    AdjustSp { delta: i32 },
    /// Round the stack pointer down to 16 bytes.
    AlignSp,
    /// Save the frame pointer (and link register), set up the frame pointer,
    /// reserve `frame_size` bytes.
    EnterFrame { frame_size: u32 },
    /// Undo `EnterFrame` without returning.
    LeaveFrame { frame_size: u32 },
    Syscall,
    /// `result = *[addr]; *[addr] += value` atomically (sequentially consistent).
    /// `result` must be a register distinct from `addr` and `value`.
    AtomicAdd { addr: AsmReg, value: AsmReg, result: AsmReg },
    /// Abort execution (undefined instruction / breakpoint).
    Trap,
}

impl MachineOp {
    /// Every register the operation reads or writes, for ownership checks.
    pub fn registers(&self) -> Vec<AsmReg> {
        use MachineOp::*;
        let mut regs = Vec::with_capacity(3);
        match self {
            Mov { dst, src }
            | FMov { dst, src }
            | BitsToFp { dst, src }
            | FpToBits { dst, src }
            | CvtIntToFp { dst, src }
            | CvtFpToInt { dst, src }
            | FpSqrt { dst, src } => {
                regs.push(*dst);
                regs.push(*src);
            }
            MovImm { dst, .. } | FpZero { dst } | LoadAddr { dst } | LoadConst { dst } => {
                regs.push(*dst)
            }
            Load { dst, mem } | LoadByte { dst, mem } | Lea { dst, mem } => {
                regs.push(*dst);
                regs.push(mem.base);
            }
            Store { src, mem } | StoreByte { src, mem } => {
                regs.push(*src);
                regs.push(mem.base);
            }
            Int { dst, lhs, rhs, .. } => {
                regs.push(*dst);
                regs.push(*lhs);
                if let Operand::Reg(r) = rhs {
                    regs.push(*r);
                }
            }
            Fp { dst, lhs, rhs, .. } => {
                regs.push(*dst);
                regs.push(*lhs);
                regs.push(*rhs);
            }
            BranchFp { lhs, rhs, .. } => {
                regs.push(*lhs);
                regs.push(*rhs);
            }
            BranchInt { lhs, rhs, .. } => {
                regs.push(*lhs);
                if let Operand::Reg(r) = rhs {
                    regs.push(*r);
                }
            }
            CallReg { target } => regs.push(*target),
            AtomicAdd {
                addr,
                value,
                result,
            } => {
                regs.push(*addr);
                regs.push(*value);
                regs.push(*result);
            }
            Jump | Call | Ret | AdjustSp { .. } | AlignSp | EnterFrame { .. }
            | LeaveFrame { .. } | Syscall | Trap => {}
        }
        regs
    }

    pub fn mnemonic(&self) -> &'static str {
        use MachineOp::*;
        match self {
            Mov { .. } => "mov",
            FMov { .. } => "fmov",
            MovImm { .. } => "mov_imm",
            FpZero { .. } => "fp_zero",
            BitsToFp { .. } => "bits_to_fp",
            FpToBits { .. } => "fp_to_bits",
            CvtIntToFp { .. } => "cvt_int_to_fp",
            CvtFpToInt { .. } => "cvt_fp_to_int",
            Load { .. } => "load",
            Store { .. } => "store",
            StoreByte { .. } => "store_byte",
            LoadByte { .. } => "load_byte",
            Lea { .. } => "lea",
            Int { .. } => "int_op",
            Fp { .. } => "fp_op",
            FpSqrt { .. } => "fp_sqrt",
            BranchFp { .. } => "branch_fp",
            BranchInt { .. } => "branch_int",
            Jump => "jump",
            Call => "call",
            CallReg { .. } => "call_reg",
            Ret => "ret",
            LoadAddr { .. } => "load_addr",
            LoadConst { .. } => "load_const",
            AdjustSp { .. } => "adjust_sp",
            AlignSp => "align_sp",
            EnterFrame { .. } => "enter_frame",
            LeaveFrame { .. } => "leave_frame",
            Syscall => "syscall",
            AtomicAdd { .. } => "atomic_add",
            Trap => "trap",
        }
    }
}

/// A site inside freshly encoded bytes that needs a relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Offset from the first byte of the encoded operation.
    pub offset: u32,
    pub kind: RelocKind,
}

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("{arch}: no encoding for {what}")]
    Unsupported { arch: &'static str, what: String },

    #[error("{arch}: register {reg:?} cannot be used for {what}")]
    InvalidRegister {
        arch: &'static str,
        reg: AsmReg,
        what: &'static str,
    },

    #[error("{arch}: {what} value {value} out of range")]
    OutOfRange {
        arch: &'static str,
        what: &'static str,
        value: i64,
    },

    #[error("relocation site at {position:#x} is truncated")]
    TruncatedSite { position: u64 },

    #[error("assembler error: {0}")]
    Assembler(String),
}

impl From<EncodingError> for CompileError {
    fn from(err: EncodingError) -> Self {
        match err {
            EncodingError::Unsupported { arch, what } => CompileError::unsupported(what, arch),
            other => CompileError::internal(other.to_string()),
        }
    }
}

/// Per-architecture instruction encoder.
///
/// `encode` appends to `out` only on success. `patch` and `decode_target`
/// use the same field layouts as `encode`, so a site written by one is read
/// back identically by the other.
pub trait Encoder {
    fn arch(&self) -> Arch;

    /// Encode one operation, returning the fixup sites it contains.
    fn encode(&self, op: &MachineOp, out: &mut Vec<u8>) -> Result<Vec<Fixup>, EncodingError>;

    /// Rewrite the site starting at `site[0]` (located at `site_addr`) so it
    /// refers to `target_addr`.
    fn patch(
        &self,
        kind: RelocKind,
        site: &mut [u8],
        site_addr: u64,
        target_addr: u64,
    ) -> Result<(), EncodingError>;

    /// Recover the address a site currently refers to.
    fn decode_target(&self, kind: RelocKind, site: &[u8], site_addr: u64) -> Option<u64>;

    /// Byte used to pad code between functions.
    fn padding_byte(&self) -> u8;

    /// ELF lazy-binding PLT header, `plt_addr` and `got_addr` are final.
    fn plt_header(&self, plt_addr: u64, got_addr: u64) -> Result<Vec<u8>, EncodingError>;

    /// One ELF PLT entry jumping through `got_slot`.
    fn plt_entry(
        &self,
        entry_addr: u64,
        got_slot: u64,
        index: u32,
        plt_addr: u64,
    ) -> Result<Vec<u8>, EncodingError>;

    fn plt_header_size(&self) -> usize;
    fn plt_entry_size(&self) -> usize;

    /// One Mach-O `__stubs` trampoline jumping through `got_slot`.
    fn macho_stub(&self, stub_addr: u64, got_slot: u64) -> Result<Vec<u8>, EncodingError>;
    fn macho_stub_size(&self) -> usize;
}

/// Construct the encoder for `target`.
pub fn encoder_for(target: Target) -> Box<dyn Encoder> {
    match target.arch {
        Arch::X86_64 => Box::new(X64Encoder::new()),
        Arch::Arm64 => Box::new(Arm64Encoder::new(target.format)),
        Arch::Riscv64 => Box::new(Riscv64Encoder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_swap() {
        for c in [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Le, Cond::Gt, Cond::Ge] {
            assert_eq!(c.swap().swap(), c);
        }
        assert_eq!(Cond::Lt.swap(), Cond::Gt);
        assert_eq!(Cond::Le.swap(), Cond::Ge);
    }

    #[test]
    fn test_register_listing() {
        let op = MachineOp::Int {
            op: IntOp::Add,
            dst: AsmReg::gp(0),
            lhs: AsmReg::gp(1),
            rhs: Operand::Imm(4),
        };
        assert_eq!(op.registers(), vec![AsmReg::gp(0), AsmReg::gp(1)]);
        assert!(MachineOp::Ret.registers().is_empty());
        assert_eq!(op.mnemonic(), "int_op");
    }
}
