//! Transient register pool with explicit checkout and release.
//!
//! Every short-lived register the code generator uses inside an expression is
//! checked out from this pool and returned when the expression is done. The
//! emitter consults [`TempPool::is_checked_out`] before encoding, so a register
//! nobody acquired can never be written by accident. Checkouts carry a
//! [`TempTag`] describing their purpose; only argument registers may still be
//! outstanding when a call is emitted, since every pool register is
//! caller-saved.

use super::error::{CompileError, CompileResult};
use super::register_file::{AsmReg, RegBank, RegBitSet, MAX_REGISTERS_PER_BANK, MAX_REGISTER_BANKS};

/// Why a temporary register was checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempTag {
    /// Intermediate value of an expression.
    Scratch,
    /// Holds an outgoing call argument or the callee address.
    CallArg,
    /// Holds a system call number or argument.
    Syscall,
}

/// A checked-out register. Not `Copy`: it must be handed back with
/// [`TempPool::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "temporary registers must be released"]
pub struct TempReg {
    reg: AsmReg,
}

impl TempReg {
    pub fn reg(&self) -> AsmReg {
        self.reg
    }
}

/// The pool of transient registers for one target.
#[derive(Debug, Clone)]
pub struct TempPool {
    order: Vec<AsmReg>,
    members: RegBitSet,
    checked_out: RegBitSet,
    tags: Vec<Option<TempTag>>,
    high_water: usize,
}

impl TempPool {
    pub fn new(order: &[AsmReg]) -> Self {
        Self {
            order: order.to_vec(),
            members: RegBitSet::from_regs(order),
            checked_out: RegBitSet::new(),
            tags: vec![None; MAX_REGISTER_BANKS * MAX_REGISTERS_PER_BANK],
            high_water: 0,
        }
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        self.members.contains(reg)
    }

    /// Check out any free register of `bank`.
    pub fn acquire(&mut self, bank: RegBank, tag: TempTag) -> CompileResult<TempReg> {
        let reg = self
            .order
            .iter()
            .copied()
            .find(|r| r.bank == bank && !self.checked_out.contains(*r))
            .ok_or_else(|| CompileError::ResourceExhausted {
                reason: format!(
                    "transient register pool exhausted in bank {bank} ({} checked out)",
                    self.checked_out.count_in_bank(bank)
                ),
            })?;
        Ok(self.checkout(reg, tag))
    }

    /// Check out one particular register (an ABI argument register, a shift
    /// count register).
    pub fn acquire_specific(&mut self, reg: AsmReg, tag: TempTag) -> CompileResult<TempReg> {
        if !self.members.contains(reg) {
            return Err(CompileError::internal(format!(
                "{reg:?} is not a transient register"
            )));
        }
        if self.checked_out.contains(reg) {
            return Err(CompileError::internal(format!(
                "{reg:?} is already checked out as {:?}",
                self.tags[reg.linear_index()]
            )));
        }
        Ok(self.checkout(reg, tag))
    }

    fn checkout(&mut self, reg: AsmReg, tag: TempTag) -> TempReg {
        self.checked_out.set(reg);
        self.tags[reg.linear_index()] = Some(tag);
        let live = self.checked_out.count_in_bank(0) + self.checked_out.count_in_bank(1);
        self.high_water = self.high_water.max(live as usize);
        log::trace!("checkout {reg:?} ({tag:?})");
        TempReg { reg }
    }

    pub fn release(&mut self, temp: TempReg) -> CompileResult<()> {
        let reg = temp.reg;
        if !self.checked_out.contains(reg) {
            return Err(CompileError::internal(format!(
                "{reg:?} released twice"
            )));
        }
        self.checked_out.clear(reg);
        self.tags[reg.linear_index()] = None;
        log::trace!("release {reg:?}");
        Ok(())
    }

    pub fn is_checked_out(&self, reg: AsmReg) -> bool {
        self.checked_out.contains(reg)
    }

    pub fn tag(&self, reg: AsmReg) -> Option<TempTag> {
        self.tags.get(reg.linear_index()).copied().flatten()
    }

    /// Fail if a scratch value would be clobbered by a call.
    pub fn check_call_boundary(&self) -> CompileResult<()> {
        for reg in self.checked_out.iter() {
            if self.tag(reg) == Some(TempTag::Scratch) {
                return Err(CompileError::internal(format!(
                    "scratch register {reg:?} is live across a call"
                )));
            }
        }
        Ok(())
    }

    /// Fail if anything is still checked out; used at function end.
    pub fn check_all_released(&self) -> CompileResult<()> {
        if let Some(reg) = self.checked_out.iter().next() {
            return Err(CompileError::internal(format!(
                "{reg:?} was never released ({:?})",
                self.tag(reg)
            )));
        }
        Ok(())
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn reset(&mut self) {
        self.checked_out.clear_all();
        self.tags.fill(None);
        self.high_water = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::{FP, GP};

    fn pool() -> TempPool {
        TempPool::new(&[AsmReg::gp(1), AsmReg::gp(2), AsmReg::fp(1)])
    }

    #[test]
    fn test_checkout_and_release() {
        let mut p = pool();
        let a = p.acquire(GP, TempTag::Scratch).unwrap();
        let b = p.acquire(GP, TempTag::Scratch).unwrap();
        assert_ne!(a.reg(), b.reg());
        assert!(p.acquire(GP, TempTag::Scratch).is_err());

        let reg_a = a.reg();
        p.release(a).unwrap();
        assert!(!p.is_checked_out(reg_a));
        let c = p.acquire(GP, TempTag::Scratch).unwrap();
        assert_eq!(c.reg(), reg_a);
        p.release(b).unwrap();
        p.release(c).unwrap();
        p.check_all_released().unwrap();
        assert_eq!(p.high_water(), 2);
    }

    #[test]
    fn test_specific_checkout_conflicts() {
        let mut p = pool();
        let f = p.acquire(FP, TempTag::Scratch).unwrap();
        assert!(p.acquire_specific(AsmReg::fp(1), TempTag::CallArg).is_err());
        assert!(p.acquire_specific(AsmReg::gp(9), TempTag::CallArg).is_err());
        p.release(f).unwrap();
        let arg = p.acquire_specific(AsmReg::fp(1), TempTag::CallArg).unwrap();
        assert_eq!(p.tag(AsmReg::fp(1)), Some(TempTag::CallArg));
        p.release(arg).unwrap();
    }

    #[test]
    fn test_call_boundary_rejects_scratch() {
        let mut p = pool();
        let arg = p.acquire_specific(AsmReg::gp(1), TempTag::CallArg).unwrap();
        p.check_call_boundary().unwrap();
        let tmp = p.acquire(GP, TempTag::Scratch).unwrap();
        assert!(p.check_call_boundary().is_err());
        assert!(p.check_all_released().is_err());
        p.release(tmp).unwrap();
        p.release(arg).unwrap();
        p.check_all_released().unwrap();
    }
}
