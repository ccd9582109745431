//! Register identifiers and durable register occupancy.
//!
//! Registers are named by bank and id. Bank [`GP`] holds the integer registers
//! and bank [`FP`] the floating-point/vector registers; the id is the
//! hardware encoding number within the bank. [`RegisterFile`] tracks which
//! persistent registers are occupied by which program variable while the
//! linear-scan allocator walks a function, and remembers every register that
//! was ever handed out so the prologue knows what to save.

use super::liveness::VarId;

/// Maximum number of register banks supported (GP, FP).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Maximum number of registers per bank.
pub const MAX_REGISTERS_PER_BANK: usize = 32;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// General purpose register bank.
pub const GP: RegBank = 0;
/// Floating-point register bank.
pub const FP: RegBank = 1;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self { bank: GP, id }
    }

    pub const fn fp(id: RegId) -> Self {
        Self { bank: FP, id }
    }

    pub fn is_gp(&self) -> bool {
        self.bank == GP
    }

    pub fn is_fp(&self) -> bool {
        self.bank == FP
    }

    /// Get the linear register index for array indexing.
    pub fn linear_index(&self) -> usize {
        (self.bank as usize) * MAX_REGISTERS_PER_BANK + (self.id as usize)
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegBitSet {
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    pub const fn new() -> Self {
        Self {
            banks: [0; MAX_REGISTER_BANKS],
        }
    }

    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    pub fn intersects(&self, other: &RegBitSet) -> bool {
        (0..MAX_REGISTER_BANKS).any(|i| self.banks[i] & other.banks[i] != 0)
    }

    /// Find first set register in the given bank, excluding specified registers.
    pub fn find_first_in_bank(&self, bank: RegBank, exclude: &RegBitSet) -> Option<RegId> {
        if bank as usize >= MAX_REGISTER_BANKS {
            return None;
        }

        let available = self.banks[bank as usize] & !exclude.banks[bank as usize];
        if available == 0 {
            return None;
        }

        Some(available.trailing_zeros() as RegId)
    }

    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        if bank as usize >= MAX_REGISTER_BANKS {
            return 0;
        }
        self.banks[bank as usize].count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.iter().all(|b| *b == 0)
    }

    /// Iterate members in bank order, then id order.
    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        (0..MAX_REGISTER_BANKS).flat_map(move |bank| {
            let bits = self.banks[bank];
            (0..64u8)
                .filter(move |id| bits & (1u64 << id) != 0)
                .map(move |id| AsmReg::new(bank as RegBank, id))
        })
    }

    pub fn clear_all(&mut self) {
        self.banks.fill(0);
    }
}

/// Error types for register allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegAllocError {
    /// No registers available in the requested bank.
    #[error("no registers available")]
    NoRegistersAvailable,
    /// Register is not allocated.
    #[error("register is not allocated")]
    RegisterNotAllocated,
    /// Register is not part of the allocatable set.
    #[error("register is not allocatable")]
    InvalidRegister,
}

/// Occupancy of the persistent registers within one function.
///
/// Registers are handed out in the order given at construction, so targets
/// can express a preference (e.g. registers that encode shorter first).
#[derive(Debug, Clone)]
pub struct RegisterFile {
    /// Allocation order.
    order: Vec<AsmReg>,
    allocatable: RegBitSet,
    /// Currently occupied registers.
    used: RegBitSet,
    /// Every register occupied at some point since the last reset.
    touched: RegBitSet,
    /// Which variable owns each register.
    owners: Vec<Option<VarId>>,
}

impl RegisterFile {
    pub fn new(order: &[AsmReg]) -> Self {
        Self {
            order: order.to_vec(),
            allocatable: RegBitSet::from_regs(order),
            used: RegBitSet::new(),
            touched: RegBitSet::new(),
            owners: vec![None; MAX_REGISTER_BANKS * MAX_REGISTERS_PER_BANK],
        }
    }

    /// Allocate the first free register of `bank` in preference order.
    pub fn allocate_reg(&mut self, bank: RegBank, owner: VarId) -> Result<AsmReg, RegAllocError> {
        let reg = self
            .order
            .iter()
            .copied()
            .find(|r| r.bank == bank && !self.used.contains(*r))
            .ok_or(RegAllocError::NoRegistersAvailable)?;
        self.used.set(reg);
        self.touched.set(reg);
        self.owners[reg.linear_index()] = Some(owner);
        Ok(reg)
    }

    /// Hand a register from its current owner to another variable.
    pub fn transfer(&mut self, reg: AsmReg, owner: VarId) -> Result<VarId, RegAllocError> {
        let slot = &mut self.owners[reg.linear_index()];
        let previous = slot.ok_or(RegAllocError::RegisterNotAllocated)?;
        *slot = Some(owner);
        Ok(previous)
    }

    pub fn free_register(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        if !self.allocatable.contains(reg) {
            return Err(RegAllocError::InvalidRegister);
        }
        if !self.used.contains(reg) {
            return Err(RegAllocError::RegisterNotAllocated);
        }
        self.used.clear(reg);
        self.owners[reg.linear_index()] = None;
        Ok(())
    }

    pub fn owner(&self, reg: AsmReg) -> Option<VarId> {
        self.owners.get(reg.linear_index()).copied().flatten()
    }

    pub fn is_allocated(&self, reg: AsmReg) -> bool {
        self.used.contains(reg)
    }

    pub fn free_count(&self, bank: RegBank) -> u32 {
        let mut free = self.allocatable;
        for reg in self.used.iter() {
            free.clear(reg);
        }
        free.count_in_bank(bank)
    }

    /// Registers that held a value at some point; these must be preserved.
    pub fn touched(&self) -> RegBitSet {
        self.touched
    }

    /// Reset for a new function.
    pub fn reset(&mut self) {
        self.used.clear_all();
        self.touched.clear_all();
        self.owners.fill(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_regfile() -> RegisterFile {
        RegisterFile::new(&[
            AsmReg::gp(3),
            AsmReg::gp(12),
            AsmReg::fp(8),
            AsmReg::fp(9),
        ])
    }

    #[test]
    fn test_regbitset_operations() {
        let mut set = RegBitSet::new();
        let reg = AsmReg::gp(5);

        assert!(!set.contains(reg));
        set.set(reg);
        assert!(set.contains(reg));
        set.set(AsmReg::fp(31));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![reg, AsmReg::fp(31)]);
        set.clear(reg);
        assert!(!set.contains(reg));
        assert_eq!(set.find_first_in_bank(FP, &RegBitSet::new()), Some(31));
    }

    #[test]
    fn test_allocation_follows_preference_order() {
        let mut regfile = create_test_regfile();

        let a = regfile.allocate_reg(GP, 0).unwrap();
        let b = regfile.allocate_reg(GP, 1).unwrap();
        assert_eq!(a, AsmReg::gp(3));
        assert_eq!(b, AsmReg::gp(12));
        assert_eq!(
            regfile.allocate_reg(GP, 2),
            Err(RegAllocError::NoRegistersAvailable)
        );

        regfile.free_register(a).unwrap();
        assert_eq!(regfile.allocate_reg(GP, 2).unwrap(), a);
        assert_eq!(regfile.owner(a), Some(2));
    }

    #[test]
    fn test_touched_survives_free() {
        let mut regfile = create_test_regfile();
        let r = regfile.allocate_reg(FP, 7).unwrap();
        regfile.free_register(r).unwrap();
        assert!(!regfile.is_allocated(r));
        assert!(regfile.touched().contains(r));

        regfile.reset();
        assert!(regfile.touched().is_empty());
    }

    #[test]
    fn test_free_errors() {
        let mut regfile = create_test_regfile();
        assert_eq!(
            regfile.free_register(AsmReg::gp(0)),
            Err(RegAllocError::InvalidRegister)
        );
        assert_eq!(
            regfile.free_register(AsmReg::gp(3)),
            Err(RegAllocError::RegisterNotAllocated)
        );
    }

    #[test]
    fn test_transfer() {
        let mut regfile = create_test_regfile();
        let r = regfile.allocate_reg(FP, 1).unwrap();
        assert_eq!(regfile.transfer(r, 4), Ok(1));
        assert_eq!(regfile.owner(r), Some(4));
        assert_eq!(regfile.free_count(FP), 1);
    }
}
