//! Target selection and compile options.
//!
//! The configuration has exactly two independent axes: the instruction set
//! ([`Arch`]) and the executable image format ([`ImageFormat`]). The image
//! format also decides the operating system conventions (system call numbers,
//! stub layout, entry point mechanism).

use std::fmt;
use std::str::FromStr;

use super::error::CompileError;

/// Instruction set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Arm64,
    Riscv64,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
            Arch::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "x86-64" | "amd64" | "x64" => Ok(Arch::X86_64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "riscv64" | "riscv" | "rv64" => Ok(Arch::Riscv64),
            other => Err(CompileError::internal(format!("unknown architecture '{other}'"))),
        }
    }
}

/// Executable image format, which also fixes the target OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// ELF64 for Linux.
    Elf,
    /// Mach-O 64 for macOS.
    MachO,
}

impl ImageFormat {
    pub fn os_name(self) -> &'static str {
        match self {
            ImageFormat::Elf => "linux",
            ImageFormat::MachO => "macos",
        }
    }

    /// Segment alignment granularity used by the image writer.
    pub fn page_size(self) -> u64 {
        match self {
            ImageFormat::Elf => 0x1000,
            ImageFormat::MachO => 0x4000,
        }
    }
}

/// A complete compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub arch: Arch,
    pub format: ImageFormat,
}

impl Target {
    pub const fn new(arch: Arch, format: ImageFormat) -> Self {
        Self { arch, format }
    }

    pub fn is_darwin(&self) -> bool {
        self.format == ImageFormat::MachO
    }

    /// Reject combinations the image writers cannot produce.
    pub fn validate(&self) -> Result<(), CompileError> {
        if self.arch == Arch::Riscv64 && self.format == ImageFormat::MachO {
            return Err(CompileError::unsupported(
                "Mach-O images for RISC-V",
                self.arch.name(),
            ));
        }
        Ok(())
    }

    /// The target matching the machine the compiler runs on, when supported.
    pub fn host() -> Option<Self> {
        let arch = match std::env::consts::ARCH {
            "x86_64" => Arch::X86_64,
            "aarch64" => Arch::Arm64,
            "riscv64" => Arch::Riscv64,
            _ => return None,
        };
        let format = match std::env::consts::OS {
            "linux" => ImageFormat::Elf,
            "macos" => ImageFormat::MachO,
            _ => return None,
        };
        Some(Self { arch, format })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.arch, self.format.os_name())
    }
}

impl FromStr for Target {
    type Err = CompileError;

    /// Parse `arch-os`, e.g. `x86_64-linux` or `arm64-macos`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (arch, os) = s
            .rsplit_once('-')
            .ok_or_else(|| CompileError::internal(format!("malformed target '{s}'")))?;
        let format = match os {
            "linux" | "elf" => ImageFormat::Elf,
            "macos" | "darwin" | "macho" => ImageFormat::MachO,
            other => {
                return Err(CompileError::internal(format!("unknown target OS '{other}'")))
            }
        };
        let target = Target::new(arch.parse()?, format);
        target.validate()?;
        Ok(target)
    }
}

/// Options that affect code generation but not the target.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Threads spawned by each parallel construct.
    pub parallel_workers: u32,
    /// Stack size mapped for each worker thread.
    pub worker_stack_size: u64,
    /// Upper bound on one function's frame; exceeding it is a resource error.
    pub max_frame_size: u32,
    /// Emit local symbols for generated functions.
    pub emit_symbols: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            parallel_workers: 4,
            worker_stack_size: 1 << 20,
            max_frame_size: 1 << 16,
            emit_symbols: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        let t: Target = "x86_64-linux".parse().unwrap();
        assert_eq!(t, Target::new(Arch::X86_64, ImageFormat::Elf));

        let t: Target = "aarch64-macos".parse().unwrap();
        assert_eq!(t, Target::new(Arch::Arm64, ImageFormat::MachO));
        assert!(t.is_darwin());
        assert_eq!(t.to_string(), "arm64-macos");

        assert!("riscv64-macos".parse::<Target>().is_err());
        assert!("sparc-linux".parse::<Target>().is_err());
        assert!("x86_64".parse::<Target>().is_err());
    }

    #[test]
    fn test_page_sizes() {
        assert_eq!(ImageFormat::Elf.page_size(), 4096);
        assert_eq!(ImageFormat::MachO.page_size(), 16384);
    }
}
