//! Test utilities for arena-based testing.
//!
//! Sessions borrow their arena, so tests keep the arena in a [`TestContext`]
//! that outlives every session created from it.

#[cfg(test)]
pub mod test {
    use super::super::config::{Arch, CompileOptions, ImageFormat, Target};
    use super::super::session::CompilationSession;
    use bumpalo::Bump;

    /// Test context that manages arena lifetime for tests.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self { arena: Bump::new() }
        }

        /// A session for `target` with default options.
        pub fn session(&self, target: Target) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena, target, CompileOptions::default())
        }

        /// A session for x86-64 ELF, the most common test target.
        pub fn linux_x64(&self) -> CompilationSession<'_> {
            self.session(Target::new(Arch::X86_64, ImageFormat::Elf))
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Every supported target, for tests that sweep all backends.
    pub fn all_targets() -> Vec<Target> {
        vec![
            Target::new(Arch::X86_64, ImageFormat::Elf),
            Target::new(Arch::Arm64, ImageFormat::Elf),
            Target::new(Arch::Riscv64, ImageFormat::Elf),
            Target::new(Arch::X86_64, ImageFormat::MachO),
            Target::new(Arch::Arm64, ImageFormat::MachO),
        ]
    }
}
