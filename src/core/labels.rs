//! Label table: symbolic positions in the text buffer.

use hashbrown::HashMap;

use super::error::{CompileError, CompileResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone)]
struct LabelEntry {
    name: String,
    offset: Option<u32>,
}

/// Maps generated labels to text offsets once they are placed.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    entries: Vec<LabelEntry>,
    /// Named labels (functions, helpers) for lookup by name.
    by_name: HashMap<String, LabelId>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unplaced label. `name` is informational.
    pub fn create(&mut self, name: impl Into<String>) -> LabelId {
        let id = LabelId(self.entries.len() as u32);
        self.entries.push(LabelEntry {
            name: name.into(),
            offset: None,
        });
        id
    }

    /// Create (or return) a label that can be found again by name.
    pub fn named(&mut self, name: &str) -> LabelId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.create(name);
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<LabelId> {
        self.by_name.get(name).copied()
    }

    pub fn bind(&mut self, id: LabelId, offset: u32) -> CompileResult<()> {
        let entry = self
            .entries
            .get_mut(id.0 as usize)
            .ok_or_else(|| CompileError::internal(format!("unknown label {}", id.0)))?;
        if let Some(previous) = entry.offset {
            return Err(CompileError::internal(format!(
                "label '{}' placed twice (at {previous:#x} and {offset:#x})",
                entry.name
            )));
        }
        entry.offset = Some(offset);
        Ok(())
    }

    pub fn offset(&self, id: LabelId) -> Option<u32> {
        self.entries.get(id.0 as usize).and_then(|e| e.offset)
    }

    pub fn name(&self, id: LabelId) -> &str {
        self.entries
            .get(id.0 as usize)
            .map(|e| e.name.as_str())
            .unwrap_or("<invalid>")
    }

    pub fn is_bound(&self, id: LabelId) -> bool {
        self.offset(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Named labels with their offsets, for symbol tables.
    pub fn named_offsets(&self) -> Vec<(&str, u32)> {
        let mut out: Vec<(&str, u32)> = self
            .by_name
            .iter()
            .filter_map(|(name, id)| self.offset(*id).map(|off| (name.as_str(), off)))
            .collect();
        out.sort_by_key(|(_, off)| *off);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_once() {
        let mut labels = LabelTable::new();
        let l = labels.create("loop_1_end");
        assert!(!labels.is_bound(l));
        labels.bind(l, 0x40).unwrap();
        assert_eq!(labels.offset(l), Some(0x40));
        assert!(labels.bind(l, 0x44).is_err());
    }

    #[test]
    fn test_named_labels() {
        let mut labels = LabelTable::new();
        let a = labels.named("main");
        assert_eq!(labels.named("main"), a);
        assert_eq!(labels.lookup("main"), Some(a));
        assert_eq!(labels.lookup("other"), None);
        labels.bind(a, 8).unwrap();
        assert_eq!(labels.named_offsets(), vec![("main", 8)]);
    }
}
