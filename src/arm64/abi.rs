// This module describes the AAPCS64 conventions flapc follows on ARM64, for both Linux and
// Darwin. X29 is the frame pointer and X30 the link register; X18 is left alone because
// Darwin reserves it. D0 is the accumulator and double return register. The callee-saved
// registers D8-D15 hold durable variables directly as doubles, which keeps arithmetic on
// variables free of moves. X17 and D31 belong to the encoder for offsets and immediates
// that do not fit an instruction. Darwin passes variadic arguments on the stack and takes
// its system call number in X16 rather than X8.

//! AAPCS64 register roles.

use crate::arch::{SyscallTable, TargetInfo};
use crate::core::{AsmReg, Target, FP};

pub const fn x(id: u8) -> AsmReg {
    AsmReg::gp(id)
}

pub const fn d(id: u8) -> AsmReg {
    AsmReg::fp(id)
}

pub const X0: AsmReg = x(0);
pub const X8: AsmReg = x(8);
pub const X16: AsmReg = x(16);
/// Encoder scratch; never allocated.
pub const X17: AsmReg = x(17);
pub const FP_REG: AsmReg = x(29);
pub const LR: AsmReg = x(30);
/// Register 31 means SP as a base or arithmetic operand and XZR elsewhere.
pub const SP: AsmReg = x(31);
pub const D0: AsmReg = d(0);
/// Encoder scratch; never allocated.
pub const D31: AsmReg = d(31);

static PERSISTENT: [AsmReg; 8] = [d(8), d(9), d(10), d(11), d(12), d(13), d(14), d(15)];

static POOL: [AsmReg; 39] = [
    x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7), x(8), x(9), x(10), x(11), x(12),
    x(13), x(14), x(15), x(16),
    d(1), d(2), d(3), d(4), d(5), d(6), d(7),
    d(16), d(17), d(18), d(19), d(20), d(21), d(22), d(23), d(24), d(25), d(26), d(27),
    d(28), d(29), d(30),
];

static FP_ARGS: [AsmReg; 8] = [d(0), d(1), d(2), d(3), d(4), d(5), d(6), d(7)];

static GP_ARGS: [AsmReg; 8] = [x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7)];

static SYSCALL_ARGS: [AsmReg; 6] = [x(0), x(1), x(2), x(3), x(4), x(5)];

pub fn target_info(target: Target) -> TargetInfo {
    let darwin = target.is_darwin();
    TargetInfo {
        target,
        sp: SP,
        fp: FP_REG,
        link: Some(LR),
        accumulator: D0,
        int_return: X0,
        persistent: &PERSISTENT,
        persistent_bank: FP,
        pool: &POOL,
        fp_args: &FP_ARGS,
        gp_args: &GP_ARGS,
        syscall_nr: if darwin { X16 } else { X8 },
        syscall_args: &SYSCALL_ARGS,
        shift_count: None,
        saved_area: 0,
        syscalls: if darwin {
            SyscallTable::DARWIN_ARM64
        } else {
            SyscallTable::LINUX_GENERIC
        },
        variadic_on_stack: darwin,
        variadic_fp_in_gp: false,
        vararg_count: None,
    }
}
