//! ARM64 backend.
//!
//! - `abi`: AAPCS64 register roles for Linux and Darwin
//! - `encode`: instruction word layouts shared by emission and patching
//! - `encoder`: MachineOp lowering, PLT entries and Mach-O stubs

pub mod abi;
pub mod encode;
pub mod encoder;

pub use encoder::Arm64Encoder;
