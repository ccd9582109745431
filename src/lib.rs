//! flapc - direct native code generation from a program AST.
//!
//! The compiler walks the AST once, emitting machine code for x86-64, ARM64
//! or RISC-V64 into a text buffer, and packages the result as a runnable ELF64
//! or Mach-O executable without an external assembler or linker.
//!
//! # Primary Usage
//!
//! ```ignore
//! use flapc::codegen::samples;
//! use flapc::{compile_program, write_executable, CompileOptions, Target};
//!
//! let program = samples::find("hello").unwrap().program();
//! let target: Target = "x86_64-linux".parse()?;
//! let compilation = compile_program(&program, target, CompileOptions::default())?;
//! write_executable("hello".as_ref(), &compilation.image)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Session, buffers, labels, relocation records, register allocation
//! - [`arch`] - Target-neutral machine operations and the per-architecture encoder trait
//! - [`x64`], [`arm64`], [`riscv64`] - Instruction encoders and ABI tables
//! - [`codegen`] - AST, scopes, analysis and the single-pass generator
//! - [`reloc`] - Relocation patching against the final image layout
//! - [`image`] - ELF and Mach-O writers
//! - [`driver`] - End-to-end compilation and atomic output

pub mod arch;
pub mod arm64;
pub mod codegen;
pub mod core;
pub mod driver;
pub mod image;
pub mod reloc;
pub mod riscv64;
pub mod x64;

pub use crate::core::{CompilationSession, CompileError, CompileOptions, CompileResult, SessionStats, Target};
pub use driver::{compile_program, write_executable, Compilation};
