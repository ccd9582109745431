//! Relocation records and the import descriptor.
//!
//! A relocation names a site in the text buffer whose placeholder bytes must
//! be rewritten once the target's final address is known. Records are only
//! appended during generation; the resolver marks them resolved but never
//! removes them.

use hashbrown::HashMap;

use super::buffer::DataId;
use super::error::{CompileError, CompileResult};
use super::labels::LabelId;

/// How the site encodes its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// Direct call to a function label or import stub.
    DirectCall,
    /// PC-relative address materialization or constant load.
    PcRelLoad,
    /// Conditional branch (including any fixed skip the target needs).
    CondBranch,
    /// Unconditional branch.
    UncondBranch,
}

/// What the site refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocTarget {
    Label(LabelId),
    Rodata(DataId),
    Import(ImportId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the first instruction of the site in the text buffer.
    pub position: u32,
    pub kind: RelocKind,
    pub target: RelocTarget,
    pub resolved: bool,
}

/// Ordered list of every forward reference in the program.
#[derive(Debug, Clone, Default)]
pub struct RelocationTable {
    records: Vec<Relocation>,
}

impl RelocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, position: u32, kind: RelocKind, target: RelocTarget) {
        log::trace!("reloc {kind:?} at {position:#x} -> {target:?}");
        self.records.push(Relocation {
            position,
            kind,
            target,
            resolved: false,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relocation> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Relocation> {
        self.records.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.records.iter().filter(|r| !r.resolved).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportId(pub u32);

/// One external function the program calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    /// Shared library that provides it (`libc.so.6`, `libm.so.6`, ...).
    pub library: String,
}

/// Ordered set of imports; frozen before assembly.
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    entries: Vec<Import>,
    index: HashMap<String, ImportId>,
    frozen: bool,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` (once) and return its id.
    pub fn intern(&mut self, name: &str, library: &str) -> CompileResult<ImportId> {
        if let Some(&id) = self.index.get(name) {
            return Ok(id);
        }
        if self.frozen {
            return Err(CompileError::internal(format!(
                "import '{name}' added after the import table was finalized"
            )));
        }
        let id = ImportId(self.entries.len() as u32);
        self.entries.push(Import {
            name: name.to_string(),
            library: library.to_string(),
        });
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn finalize(&mut self) {
        self.frozen = true;
    }

    pub fn get(&self, id: ImportId) -> Option<&Import> {
        self.entries.get(id.0 as usize)
    }

    pub fn lookup(&self, name: &str) -> Option<ImportId> {
        self.index.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ImportId, &Import)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, imp)| (ImportId(i as u32), imp))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct libraries in first-use order.
    pub fn libraries(&self) -> Vec<&str> {
        let mut libs: Vec<&str> = Vec::new();
        for imp in &self.entries {
            if !libs.contains(&imp.library.as_str()) {
                libs.push(&imp.library);
            }
        }
        libs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_interning_and_freeze() {
        let mut imports = ImportTable::new();
        let p = imports.intern("printf", "libc.so.6").unwrap();
        let s = imports.intern("sin", "libm.so.6").unwrap();
        assert_eq!(imports.intern("printf", "libc.so.6").unwrap(), p);
        assert_ne!(p, s);
        assert_eq!(imports.libraries(), vec!["libc.so.6", "libm.so.6"]);

        imports.finalize();
        assert_eq!(imports.intern("sin", "libm.so.6").unwrap(), s);
        assert!(imports.intern("cos", "libm.so.6").is_err());
    }

    #[test]
    fn test_relocation_table_pending() {
        let mut table = RelocationTable::new();
        table.record(4, RelocKind::DirectCall, RelocTarget::Label(LabelId(0)));
        table.record(9, RelocKind::PcRelLoad, RelocTarget::Rodata(DataId(1)));
        assert_eq!(table.pending(), 2);
        table.iter_mut().next().unwrap().resolved = true;
        assert_eq!(table.pending(), 1);
    }
}
