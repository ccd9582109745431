// This module describes the System V AMD64 conventions flapc follows on x86-64. Arguments
// to C functions go in RDI, RSI, RDX, RCX, R8, R9 (integers and pointers) and XMM0-XMM7
// (doubles), with AL holding the number of vector registers used by a variadic call.
// Language functions take their double arguments in XMM0-XMM5 and return in XMM0, which
// also serves as the expression accumulator. RBX and R12-R15 are the only callee-saved
// registers, so durable variables live there as raw f64 bits; everything else except RSP,
// RBP and the encoder scratch registers R11/XMM15 forms the transient pool.

//! System V x86-64 register roles.

use crate::arch::{SyscallTable, TargetInfo};
use crate::core::{AsmReg, Target, GP};

pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
/// Encoder scratch; never allocated.
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

pub const XMM0: AsmReg = AsmReg::fp(0);
/// Encoder scratch; never allocated.
pub const XMM15: AsmReg = AsmReg::fp(15);

const fn xmm(id: u8) -> AsmReg {
    AsmReg::fp(id)
}

static PERSISTENT: [AsmReg; 5] = [RBX, R12, R13, R14, R15];

static POOL: [AsmReg; 22] = [
    RAX, RCX, RDX, RSI, RDI, R8, R9, R10,
    xmm(1), xmm(2), xmm(3), xmm(4), xmm(5), xmm(6), xmm(7), xmm(8),
    xmm(9), xmm(10), xmm(11), xmm(12), xmm(13), xmm(14),
];

static FP_ARGS: [AsmReg; 8] = [
    XMM0, xmm(1), xmm(2), xmm(3), xmm(4), xmm(5), xmm(6), xmm(7),
];

static GP_ARGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

static SYSCALL_ARGS: [AsmReg; 6] = [RDI, RSI, RDX, R10, R8, R9];

pub fn target_info(target: Target) -> TargetInfo {
    TargetInfo {
        target,
        sp: RSP,
        fp: RBP,
        link: None,
        accumulator: XMM0,
        int_return: RAX,
        persistent: &PERSISTENT,
        persistent_bank: GP,
        pool: &POOL,
        fp_args: &FP_ARGS,
        gp_args: &GP_ARGS,
        syscall_nr: RAX,
        syscall_args: &SYSCALL_ARGS,
        shift_count: Some(RCX),
        saved_area: 0,
        syscalls: if target.is_darwin() {
            SyscallTable::DARWIN_X86_64
        } else {
            SyscallTable::LINUX_X86_64
        },
        variadic_on_stack: false,
        variadic_fp_in_gp: false,
        vararg_count: Some(RAX),
    }
}
