//! Lowering of the syntax tree to machine operations.

pub mod analysis;
pub mod ast;
pub mod calls;
mod generator;
mod parallel;
pub mod runtime;
pub mod samples;
pub mod scope;

pub use generator::{function_label_name, generate, CodeGenerator, CodeUnit, FrameLayout, FunctionSymbol};
