// This module is the hub for the target-independent infrastructure of flapc: the error
// taxonomy, target configuration, the compilation-context session, register naming and
// occupancy, the transient register pool, live intervals and the linear-scan allocator,
// and the data structures that connect code generation to relocation and image assembly
// (text/rodata buffers, the label table, relocation records and the import descriptor).
// None of these know about a particular instruction set; the arch modules and the code
// generator build on them.

//! Core flapc infrastructure.
//!
//! # Key Components
//!
//! ## Session (`session`)
//! - One explicit compilation-context record per unit, arena-backed
//!
//! ## Register Allocation (`register_file`, `liveness`, `linear_scan`, `temp_pool`)
//! - Durable linear-scan allocation of variables to persistent registers
//! - Transient checkout/release pool for expression temporaries
//!
//! ## Forward References (`buffer`, `labels`, `reloc`)
//! - Append-only text and rodata buffers
//! - Labels, relocation records and imports consumed by the resolver

pub mod buffer;
pub mod config;
pub mod error;
pub mod labels;
pub mod linear_scan;
pub mod liveness;
pub mod register_file;
pub mod reloc;
pub mod session;
pub mod temp_pool;
pub mod test_utils;

pub use buffer::{DataId, RodataBuffer, TextBuffer};
pub use config::{Arch, CompileOptions, ImageFormat, Target};
pub use error::{CompileError, CompileResult, ErrorCategory, SourceLocation};
pub use labels::{LabelId, LabelTable};
pub use linear_scan::{Allocation, Location};
pub use liveness::{IntervalBuilder, LiveInterval, VarId};
pub use register_file::{AsmReg, RegAllocError, RegBank, RegBitSet, RegisterFile, FP, GP};
pub use reloc::{Import, ImportId, ImportTable, RelocKind, RelocTarget, Relocation, RelocationTable};
pub use session::{CompilationSession, SessionStats};
pub use temp_pool::{TempPool, TempReg, TempTag};
