//! Lexical symbol tables and loop contexts.
//!
//! A [`ScopeStack`] belongs to exactly one function body. Blocks push and pop
//! scopes; inner scopes shadow outer names but never modify them. Variable
//! ids are handed out in definition order, which is what lets the analysis
//! pass and the emitter agree on ids without sharing state.

use hashbrown::HashMap;

use crate::core::{
    CompileError, CompileResult, LabelId, RelocKind, RelocTarget, RelocationTable, SourceLocation,
    VarId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub var: VarId,
    pub mutable: bool,
}

#[derive(Debug, Clone)]
pub struct ScopeStack {
    scopes: Vec<HashMap<String, Symbol>>,
    names: Vec<String>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            names: Vec::new(),
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Define `name` in the innermost scope.
    pub fn define(&mut self, name: &str, mutable: bool, loc: SourceLocation) -> CompileResult<VarId> {
        let innermost = self.scopes.len() - 1;
        if self.scopes[innermost].contains_key(name) {
            return Err(CompileError::Redefinition {
                name: name.to_string(),
                location: loc,
            });
        }
        Ok(self.insert(name, mutable))
    }

    /// Define a compiler-generated variable. Hidden names may repeat.
    pub fn define_hidden(&mut self, name: &str) -> VarId {
        self.insert(name, true)
    }

    /// Define a value copied in from an enclosing function; it cannot be
    /// updated.
    pub fn define_capture(&mut self, name: &str) -> VarId {
        self.insert(name, false)
    }

    fn insert(&mut self, name: &str, mutable: bool) -> VarId {
        let var = self.names.len() as VarId;
        self.names.push(name.to_string());
        let innermost = self.scopes.len() - 1;
        self.scopes[innermost].insert(name.to_string(), Symbol { var, mutable });
        var
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    pub fn resolve(&self, name: &str, loc: SourceLocation) -> CompileResult<Symbol> {
        self.lookup(name).ok_or_else(|| CompileError::UndefinedVariable {
            name: name.to_string(),
            location: loc,
        })
    }

    /// Resolve the target of `name <- value`.
    pub fn resolve_update(&self, name: &str, loc: SourceLocation) -> CompileResult<VarId> {
        let symbol = self.resolve(name, loc)?;
        if !symbol.mutable {
            return Err(CompileError::ImmutableUpdate {
                name: name.to_string(),
                location: loc,
            });
        }
        Ok(symbol.var)
    }

    /// Number of variables defined so far.
    pub fn var_count(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, var: VarId) -> Option<&str> {
        self.names.get(var as usize).map(String::as_str)
    }
}

/// Bookkeeping for one active loop.
#[derive(Debug)]
pub struct LoopContext {
    pub continue_label: LabelId,
    pub exit_label: LabelId,
    /// Text offset of the condition check.
    pub cond_offset: u32,
    /// Expression stack depth (in 16-byte pushes) at loop entry.
    pub stack_depth: u32,
    exit_sites: Vec<(u32, RelocKind)>,
    continue_sites: Vec<(u32, RelocKind)>,
}

impl LoopContext {
    pub fn new(continue_label: LabelId, exit_label: LabelId, cond_offset: u32, stack_depth: u32) -> Self {
        Self {
            continue_label,
            exit_label,
            cond_offset,
            stack_depth,
            exit_sites: Vec::new(),
            continue_sites: Vec::new(),
        }
    }

    pub fn add_exit(&mut self, position: u32, kind: RelocKind) {
        self.exit_sites.push((position, kind));
    }

    pub fn add_continue(&mut self, position: u32, kind: RelocKind) {
        self.continue_sites.push((position, kind));
    }

    pub fn pending_sites(&self) -> usize {
        self.exit_sites.len() + self.continue_sites.len()
    }

    /// Turn every deferred site into a relocation against the loop's labels.
    pub fn drain_into(self, relocs: &mut RelocationTable) -> usize {
        let count = self.pending_sites();
        for (position, kind) in self.exit_sites {
            relocs.record(position, kind, RelocTarget::Label(self.exit_label));
        }
        for (position, kind) in self.continue_sites {
            relocs.record(position, kind, RelocTarget::Label(self.continue_label));
        }
        count
    }
}

#[derive(Debug, Default)]
pub struct LoopStack {
    loops: Vec<LoopContext>,
}

impl LoopStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ctx: LoopContext) {
        self.loops.push(ctx);
    }

    pub fn pop(&mut self) -> Option<LoopContext> {
        self.loops.pop()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn innermost_mut(&mut self) -> Option<&mut LoopContext> {
        self.loops.last_mut()
    }

    /// The loop `depth` levels in, counting the outermost active loop as 1.
    pub fn at_depth(&mut self, depth: u32, loc: SourceLocation) -> CompileResult<&mut LoopContext> {
        let active = self.loops.len();
        if depth == 0 || depth as usize > active {
            return Err(CompileError::InvalidJump {
                reason: format!("@{depth} with {active} active loop(s)"),
                location: loc,
            });
        }
        Ok(&mut self.loops[depth as usize - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadowing_and_redefinition() {
        let mut scopes = ScopeStack::new();
        let x = scopes.define("x", false, SourceLocation::UNKNOWN).unwrap();
        assert!(matches!(
            scopes.define("x", true, SourceLocation::new(2, 1)),
            Err(CompileError::Redefinition { .. })
        ));

        scopes.push();
        let inner = scopes.define("x", true, SourceLocation::UNKNOWN).unwrap();
        assert_ne!(x, inner);
        assert_eq!(scopes.lookup("x").unwrap().var, inner);
        scopes.pop();
        assert_eq!(scopes.lookup("x").unwrap().var, x);
        assert_eq!(scopes.var_count(), 2);
    }

    #[test]
    fn test_update_rules() {
        let mut scopes = ScopeStack::new();
        scopes.define("fixed", false, SourceLocation::UNKNOWN).unwrap();
        let counter = scopes.define("counter", true, SourceLocation::UNKNOWN).unwrap();

        assert_eq!(scopes.resolve_update("counter", SourceLocation::UNKNOWN).unwrap(), counter);
        assert!(matches!(
            scopes.resolve_update("fixed", SourceLocation::UNKNOWN),
            Err(CompileError::ImmutableUpdate { .. })
        ));
        assert!(matches!(
            scopes.resolve_update("missing", SourceLocation::new(4, 2)),
            Err(CompileError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn test_hidden_names_repeat() {
        let mut scopes = ScopeStack::new();
        let a = scopes.define_hidden("%end");
        let b = scopes.define_hidden("%end");
        assert_ne!(a, b);
        assert_eq!(scopes.name(a), Some("%end"));
    }

    #[test]
    fn test_loop_depths_and_draining() {
        let mut loops = LoopStack::new();
        loops.push(LoopContext::new(LabelId(0), LabelId(1), 0, 0));
        loops.push(LoopContext::new(LabelId(2), LabelId(3), 8, 0));

        loops.at_depth(1, SourceLocation::UNKNOWN).unwrap().add_exit(20, RelocKind::UncondBranch);
        loops.at_depth(2, SourceLocation::UNKNOWN).unwrap().add_continue(24, RelocKind::UncondBranch);
        assert!(loops.at_depth(3, SourceLocation::UNKNOWN).is_err());
        assert!(loops.at_depth(0, SourceLocation::UNKNOWN).is_err());

        let mut relocs = RelocationTable::new();
        let inner = loops.pop().unwrap();
        assert_eq!(inner.drain_into(&mut relocs), 1);
        let outer = loops.pop().unwrap();
        assert_eq!(outer.drain_into(&mut relocs), 1);

        let targets: Vec<_> = relocs.iter().map(|r| (r.position, r.target)).collect();
        assert_eq!(
            targets,
            vec![(24, RelocTarget::Label(LabelId(2))), (20, RelocTarget::Label(LabelId(1)))]
        );
    }
}
