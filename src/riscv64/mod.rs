//! RISC-V 64 backend (Linux only).
//!
//! - `abi`: LP64D register roles
//! - `encode`: instruction formats and relocation fields
//! - `encoder`: MachineOp lowering and PLT entries

pub mod abi;
pub mod encode;
pub mod encoder;

pub use encoder::Riscv64Encoder;
