//! x86-64 backend.
//!
//! - `abi`: System V register roles and system call numbers
//! - `encoder`: instruction encoding using iced-x86, PLT entries and stubs

pub mod abi;
pub mod encoder;

pub use encoder::{JumpCondition, X64Encoder};
