// This module describes the RV64 LP64D conventions flapc follows. S0 is the frame pointer
// and RA the link register; the prologue stores both just below the incoming stack
// pointer, so locals begin 16 bytes under S0. FA0 is the accumulator and double return
// register. The twelve callee-saved FS registers hold durable variables as doubles.
// T5, T6 and FT11 are reserved for the encoder: branch sequences, large offsets and
// immediates that do not fit a 12-bit field all go through them. Variadic doubles are
// passed in integer registers, so printf arguments take the GP route.

//! RV64 LP64D register roles.

use crate::arch::{SyscallTable, TargetInfo};
use crate::core::{AsmReg, Target, FP};

pub const fn x(id: u8) -> AsmReg {
    AsmReg::gp(id)
}

pub const fn f(id: u8) -> AsmReg {
    AsmReg::fp(id)
}

pub const ZERO: AsmReg = x(0);
pub const RA: AsmReg = x(1);
pub const SP: AsmReg = x(2);
pub const S0: AsmReg = x(8);
pub const A0: AsmReg = x(10);
pub const A7: AsmReg = x(17);
/// Encoder scratch; never allocated.
pub const T5: AsmReg = x(30);
/// Encoder scratch; never allocated.
pub const T6: AsmReg = x(31);
pub const FA0: AsmReg = f(10);
/// Encoder scratch; never allocated.
pub const FT11: AsmReg = f(31);

static PERSISTENT: [AsmReg; 12] = [
    f(8), f(9), f(18), f(19), f(20), f(21), f(22), f(23), f(24), f(25), f(26), f(27),
];

static POOL: [AsmReg; 31] = [
    x(5), x(6), x(7),
    x(10), x(11), x(12), x(13), x(14), x(15), x(16), x(17),
    x(28), x(29),
    f(0), f(1), f(2), f(3), f(4), f(5), f(6), f(7),
    f(11), f(12), f(13), f(14), f(15), f(16), f(17),
    f(28), f(29), f(30),
];

static FP_ARGS: [AsmReg; 8] = [f(10), f(11), f(12), f(13), f(14), f(15), f(16), f(17)];

static GP_ARGS: [AsmReg; 8] = [x(10), x(11), x(12), x(13), x(14), x(15), x(16), x(17)];

static SYSCALL_ARGS: [AsmReg; 6] = [x(10), x(11), x(12), x(13), x(14), x(15)];

pub fn target_info(target: Target) -> TargetInfo {
    TargetInfo {
        target,
        sp: SP,
        fp: S0,
        link: Some(RA),
        accumulator: FA0,
        int_return: A0,
        persistent: &PERSISTENT,
        persistent_bank: FP,
        pool: &POOL,
        fp_args: &FP_ARGS,
        gp_args: &GP_ARGS,
        syscall_nr: A7,
        syscall_args: &SYSCALL_ARGS,
        shift_count: None,
        saved_area: 16,
        syscalls: SyscallTable::LINUX_GENERIC,
        variadic_on_stack: false,
        variadic_fp_in_gp: true,
        vararg_count: None,
    }
}
