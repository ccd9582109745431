// This module implements durable register allocation for program variables with the
// classic Poletto/Sarkar linear-scan algorithm. Intervals are visited in order of their
// start point; intervals whose end precedes the current start are expired and their
// registers returned to the RegisterFile; when no persistent register is free the active
// interval that ends furthest away is spilled (or the current one, if it ends later).
// Every spilled variable receives its own stack slot, so spill slots can never alias.
// The allocator only hands out callee-saved registers, which keeps variables intact
// across calls into lambdas, runtime helpers and C functions.

//! Linear-scan allocation of variables to persistent registers or stack slots.

use super::liveness::{LiveInterval, VarId};
use super::register_file::{AsmReg, RegAllocError, RegBank, RegBitSet, RegisterFile};

/// Where a variable lives for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Reg(AsmReg),
    /// Index of an 8-byte spill slot in the frame.
    Spill(u32),
}

/// Result of allocating one function.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    locations: Vec<Option<Location>>,
    pub spill_slots: u32,
    /// Persistent registers assigned to at least one variable.
    pub used_regs: RegBitSet,
}

impl Allocation {
    pub fn location(&self, var: VarId) -> Option<Location> {
        self.locations.get(var as usize).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Allocate `intervals` (sorted by start) onto the registers of `regfile` in
/// `bank`.
///
/// `var_count` sizes the result; variables without an interval get no
/// location. Fails only when `regfile` disagrees with the active set.
pub fn allocate(
    intervals: &[LiveInterval],
    var_count: usize,
    regfile: &mut RegisterFile,
    bank: RegBank,
) -> Result<Allocation, RegAllocError> {
    regfile.reset();
    let mut locations: Vec<Option<Location>> = vec![None; var_count];
    let mut spill_slots = 0u32;

    // Active intervals sorted by end point.
    let mut active: Vec<LiveInterval> = Vec::new();

    for &current in intervals {
        expire_old(&mut active, regfile, &locations, current.start)?;

        match regfile.allocate_reg(bank, current.var) {
            Ok(reg) => {
                locations[current.var as usize] = Some(Location::Reg(reg));
                insert_active(&mut active, current);
            }
            Err(RegAllocError::NoRegistersAvailable) => {
                let furthest = active.last().copied();
                let victim = furthest.and_then(|spill| match locations[spill.var as usize] {
                    Some(Location::Reg(reg)) if spill.end > current.end => Some((spill, reg)),
                    _ => None,
                });
                match victim {
                    Some((spill, reg)) => {
                        // The victim moves to the stack, the current interval takes its register.
                        let previous = regfile.transfer(reg, current.var)?;
                        if previous != spill.var {
                            return Err(RegAllocError::RegisterNotAllocated);
                        }
                        locations[spill.var as usize] = Some(Location::Spill(spill_slots));
                        spill_slots += 1;
                        locations[current.var as usize] = Some(Location::Reg(reg));
                        active.pop();
                        insert_active(&mut active, current);
                        log::trace!("spilled v{} for v{} in {:?}", spill.var, current.var, reg);
                    }
                    None => {
                        locations[current.var as usize] = Some(Location::Spill(spill_slots));
                        spill_slots += 1;
                        log::trace!("spilled v{} on arrival", current.var);
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }

    let mut used_regs = RegBitSet::new();
    for loc in locations.iter().flatten() {
        if let Location::Reg(reg) = loc {
            used_regs.set(*reg);
        }
    }

    Ok(Allocation {
        locations,
        spill_slots,
        used_regs,
    })
}

fn expire_old(
    active: &mut Vec<LiveInterval>,
    regfile: &mut RegisterFile,
    locations: &[Option<Location>],
    start: u32,
) -> Result<(), RegAllocError> {
    while let Some(first) = active.first().copied() {
        if first.end >= start {
            break;
        }
        active.remove(0);
        if let Some(Location::Reg(reg)) = locations[first.var as usize] {
            regfile.free_register(reg)?;
        }
    }
    Ok(())
}

fn insert_active(active: &mut Vec<LiveInterval>, interval: LiveInterval) {
    let pos = active
        .iter()
        .position(|iv| iv.end > interval.end)
        .unwrap_or(active.len());
    active.insert(pos, interval);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::GP;

    fn iv(var: VarId, start: u32, end: u32) -> LiveInterval {
        LiveInterval { var, start, end }
    }

    fn two_regs() -> RegisterFile {
        RegisterFile::new(&[AsmReg::gp(3), AsmReg::gp(12)])
    }

    #[test]
    fn test_registers_are_reused_after_expiry() {
        let mut rf = two_regs();
        let ivs = [iv(0, 0, 2), iv(1, 1, 3), iv(2, 4, 6)];
        let alloc = allocate(&ivs, 3, &mut rf, GP).unwrap();
        assert_eq!(alloc.location(0), Some(Location::Reg(AsmReg::gp(3))));
        assert_eq!(alloc.location(1), Some(Location::Reg(AsmReg::gp(12))));
        assert_eq!(alloc.location(2), Some(Location::Reg(AsmReg::gp(3))));
        assert_eq!(alloc.spill_slots, 0);
    }

    #[test]
    fn test_spills_furthest_end() {
        let mut rf = two_regs();
        // v0 lives longest and is evicted when v2 arrives.
        let ivs = [iv(0, 0, 100), iv(1, 1, 10), iv(2, 2, 8)];
        let alloc = allocate(&ivs, 3, &mut rf, GP).unwrap();
        assert_eq!(alloc.location(0), Some(Location::Spill(0)));
        assert_eq!(alloc.location(2), Some(Location::Reg(AsmReg::gp(3))));
        assert_eq!(alloc.spill_slots, 1);
    }

    #[test]
    fn test_current_spilled_when_it_ends_last() {
        let mut rf = two_regs();
        let ivs = [iv(0, 0, 5), iv(1, 1, 6), iv(2, 2, 50)];
        let alloc = allocate(&ivs, 3, &mut rf, GP).unwrap();
        assert_eq!(alloc.location(2), Some(Location::Spill(0)));
    }

    /// Overlapping intervals drawn from a fixed-seed LCG.
    fn random_intervals(seed: u64, count: u32) -> Vec<LiveInterval> {
        let mut state = seed;
        let mut next = |bound: u32| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) % u64::from(bound)) as u32
        };
        let mut ivs: Vec<LiveInterval> = (0..count)
            .map(|var| {
                let start = next(4 * count);
                iv(var, start, start + next(40))
            })
            .collect();
        ivs.sort_by_key(|iv| iv.start);
        ivs
    }

    #[test]
    fn test_live_together_never_share_a_location() {
        for seed in 1..=32u64 {
            let ivs = random_intervals(seed, 150);
            let mut rf = RegisterFile::new(&[AsmReg::gp(3), AsmReg::gp(12), AsmReg::gp(13)]);
            let alloc = allocate(&ivs, ivs.len(), &mut rf, GP).unwrap();
            for (i, a) in ivs.iter().enumerate() {
                let la = alloc.location(a.var).unwrap();
                for b in &ivs[i + 1..] {
                    if a.start <= b.end && b.start <= a.end {
                        assert_ne!(
                            la,
                            alloc.location(b.var).unwrap(),
                            "seed {seed}: v{} {a:?} and v{} {b:?}",
                            a.var,
                            b.var
                        );
                    }
                }
            }
            let mut slots: Vec<u32> = (0..ivs.len() as u32)
                .filter_map(|var| match alloc.location(var) {
                    Some(Location::Spill(slot)) => Some(slot),
                    _ => None,
                })
                .collect();
            slots.sort_unstable();
            assert_eq!(slots, (0..alloc.spill_slots).collect::<Vec<_>>(), "seed {seed}");
        }
    }

    #[test]
    fn test_inconsistent_register_file_is_reported() {
        let mut rf = two_regs();
        // v0 appears twice, so its register is released twice.
        let ivs = [iv(0, 0, 1), iv(0, 0, 5), iv(1, 3, 4), iv(2, 6, 7)];
        assert_eq!(
            allocate(&ivs, 3, &mut rf, GP).unwrap_err(),
            RegAllocError::RegisterNotAllocated
        );
    }

    #[test]
    fn test_unreferenced_variable_has_no_location() {
        let mut rf = two_regs();
        let alloc = allocate(&[iv(1, 0, 1)], 2, &mut rf, GP).unwrap();
        assert_eq!(alloc.location(0), None);
        assert!(alloc.used_regs.contains(AsmReg::gp(3)));
    }
}
