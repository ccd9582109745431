//! Register roles and OS conventions for a target.

use crate::core::{Arch, AsmReg, ImageFormat, RegBank, RegBitSet, Target};

/// System call numbers for one (architecture, OS) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallTable {
    pub write: i64,
    pub exit: i64,
    pub exit_group: i64,
    pub mmap: i64,
    pub munmap: i64,
    /// Thread creation; Linux only.
    pub clone: Option<i64>,
    pub futex: Option<i64>,
}

impl SyscallTable {
    pub const LINUX_X86_64: SyscallTable = SyscallTable {
        write: 1,
        exit: 60,
        exit_group: 231,
        mmap: 9,
        munmap: 11,
        clone: Some(56),
        futex: Some(202),
    };

    /// The generic table shared by arm64 and riscv64 Linux.
    pub const LINUX_GENERIC: SyscallTable = SyscallTable {
        write: 64,
        exit: 93,
        exit_group: 94,
        mmap: 222,
        munmap: 215,
        clone: Some(220),
        futex: Some(98),
    };

    pub const DARWIN_ARM64: SyscallTable = SyscallTable {
        write: 4,
        exit: 1,
        exit_group: 1,
        mmap: 197,
        munmap: 73,
        clone: None,
        futex: None,
    };

    /// BSD class numbers are offset by `0x2000000` on x86-64 macOS.
    pub const DARWIN_X86_64: SyscallTable = SyscallTable {
        write: 0x2000004,
        exit: 0x2000001,
        exit_group: 0x2000001,
        mmap: 0x20000c5,
        munmap: 0x2000049,
        clone: None,
        futex: None,
    };
}

/// Register roles and calling conventions the code generator relies on.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub target: Target,
    pub sp: AsmReg,
    pub fp: AsmReg,
    pub link: Option<AsmReg>,
    /// Double result of every expression and of every function.
    pub accumulator: AsmReg,
    /// Integer return register of C functions and system calls.
    pub int_return: AsmReg,
    /// Callee-saved registers the durable allocator hands out, in
    /// preference order.
    pub persistent: &'static [AsmReg],
    pub persistent_bank: RegBank,
    /// Caller-saved registers for transient checkout.
    pub pool: &'static [AsmReg],
    /// Double argument registers (first is the accumulator).
    pub fp_args: &'static [AsmReg],
    pub gp_args: &'static [AsmReg],
    pub syscall_nr: AsmReg,
    pub syscall_args: &'static [AsmReg],
    /// Register a variable shift count must be in, if the ISA fixes one.
    pub shift_count: Option<AsmReg>,
    /// Bytes between the frame pointer and the first local slot.
    pub saved_area: i32,
    pub syscalls: SyscallTable,
    /// Variadic arguments are passed in 8-byte stack slots.
    pub variadic_on_stack: bool,
    /// Variadic doubles travel in integer argument registers.
    pub variadic_fp_in_gp: bool,
    /// Register that must hold the number of vector registers used by a
    /// variadic call.
    pub vararg_count: Option<AsmReg>,
}

impl TargetInfo {
    pub fn for_target(target: Target) -> TargetInfo {
        match target.arch {
            Arch::X86_64 => crate::x64::abi::target_info(target),
            Arch::Arm64 => crate::arm64::abi::target_info(target),
            Arch::Riscv64 => crate::riscv64::abi::target_info(target),
        }
    }

    /// Registers that may be named without a checkout.
    pub fn fixed_roles(&self) -> RegBitSet {
        let mut set = RegBitSet::from_regs(&[self.sp, self.fp, self.accumulator]);
        if let Some(link) = self.link {
            set.set(link);
        }
        set
    }

    pub fn is_darwin(&self) -> bool {
        self.target.format == ImageFormat::MachO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::all_targets;

    #[test]
    fn test_roles_are_disjoint() {
        for target in all_targets() {
            let info = TargetInfo::for_target(target);
            let pool = RegBitSet::from_regs(info.pool);
            let persistent = RegBitSet::from_regs(info.persistent);
            assert!(!pool.intersects(&persistent), "{target}");
            assert!(!pool.intersects(&info.fixed_roles()), "{target}");
            assert!(!persistent.intersects(&info.fixed_roles()), "{target}");
            for reg in info.persistent {
                assert_eq!(reg.bank, info.persistent_bank);
            }
            assert_eq!(info.fp_args[0], info.accumulator);
            for reg in info.gp_args.iter().chain(info.syscall_args) {
                assert!(pool.contains(*reg), "{target}: {reg:?}");
            }
            assert!(pool.contains(info.syscall_nr), "{target}");
            assert!(pool.contains(info.int_return), "{target}");
        }
    }
}
