// This module provides the compilation-context record for flapc. CompilationSession owns
// the per-unit state that would otherwise be global: the bumpalo arena used for interned
// label and import names, the selected target and options, the name of the function being
// generated, and SessionStats counters (functions generated, bytes emitted, relocations
// recorded and resolved, spill slots, imports). A session is created for exactly one
// compilation unit and passed by reference through every phase, so two units never share
// counters or names and independent units could be compiled side by side.

//! Arena-based compilation session.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

use super::config::{CompileOptions, Target};

/// Compilation context for one unit.
pub struct CompilationSession<'arena> {
    /// Arena backing interned names.
    arena: &'arena Bump,

    target: Target,
    options: CompileOptions,

    /// Session statistics for debugging.
    stats: RefCell<SessionStats>,

    /// String interning for label and import names.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Function currently being generated, used in diagnostics.
    current_function: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump, target: Target, options: CompileOptions) -> Self {
        Self {
            arena,
            target,
            options,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            current_function: RefCell::new(None),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    pub fn set_current_function(&self, name: &str) {
        let name = self.intern_str(name);
        *self.current_function.borrow_mut() = Some(name);
    }

    pub fn current_function(&self) -> Option<&'arena str> {
        *self.current_function.borrow()
    }

    /// Record that a function body was generated.
    pub fn record_function_generated(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_generated += 1;
        stats.text_bytes += code_size;

        if stats.largest_function_size < code_size {
            stats.largest_function_size = code_size;
            stats.largest_function_name = name.to_string();
        }
    }

    pub fn record_relocation(&self) {
        self.stats.borrow_mut().relocations_recorded += 1;
    }

    pub fn record_relocations_resolved(&self, count: usize) {
        self.stats.borrow_mut().relocations_resolved += count;
    }

    pub fn record_spill_slots(&self, count: usize) {
        self.stats.borrow_mut().spill_slots += count;
    }

    pub fn record_import(&self) {
        self.stats.borrow_mut().imports += 1;
    }

    pub fn record_rodata(&self, bytes: usize) {
        self.stats.borrow_mut().rodata_bytes += bytes;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub functions_generated: usize,
    /// Bytes of machine code across all functions.
    pub text_bytes: usize,
    pub rodata_bytes: usize,
    pub relocations_recorded: usize,
    pub relocations_resolved: usize,
    pub spill_slots: usize,
    pub imports: usize,
    pub largest_function_size: usize,
    pub largest_function_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions generated: {}", self.functions_generated)?;
        writeln!(f, "  Text size: {} bytes", self.text_bytes)?;
        writeln!(f, "  Rodata size: {} bytes", self.rodata_bytes)?;
        writeln!(
            f,
            "  Relocations: {} recorded, {} resolved",
            self.relocations_recorded, self.relocations_resolved
        )?;
        writeln!(f, "  Spill slots: {}", self.spill_slots)?;
        writeln!(f, "  Imports: {}", self.imports)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} bytes)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Arch, ImageFormat};

    fn session(arena: &Bump) -> CompilationSession<'_> {
        CompilationSession::new(
            arena,
            Target::new(Arch::X86_64, ImageFormat::Elf),
            CompileOptions::default(),
        )
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = session(&arena);

        let s1 = session.intern_str("hello");
        let s2 = session.intern_str("hello");
        let s3 = session.intern_str("world");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = session(&arena);

        session.record_function_generated("main", 128);
        session.record_function_generated("lambda_0", 300);
        session.record_relocation();
        session.record_relocation();
        session.record_relocations_resolved(2);
        session.record_spill_slots(3);

        let stats = session.stats();
        assert_eq!(stats.functions_generated, 2);
        assert_eq!(stats.text_bytes, 428);
        assert_eq!(stats.relocations_recorded, 2);
        assert_eq!(stats.relocations_resolved, 2);
        assert_eq!(stats.spill_slots, 3);
        assert_eq!(stats.largest_function_name, "lambda_0");

        let output = format!("{}", stats);
        assert!(output.contains("Functions generated: 2"));
        assert!(output.contains("lambda_0 (300 bytes)"));
    }

    #[test]
    fn test_current_function() {
        let arena = Bump::new();
        let session = session(&arena);
        assert_eq!(session.current_function(), None);
        session.set_current_function("main");
        assert_eq!(session.current_function(), Some("main"));
    }
}
