//! Executable image assembly.
//!
//! [`assemble`] drives a code unit through the build phases of the writer for its
//! format and checks the result with the `object` parser before handing it back.

pub mod elf;
pub mod layout;
pub mod macho;

use object::{Object, ObjectSection};

use crate::codegen::CodeUnit;
use crate::core::{Arch, CompilationSession, CompileError, CompileResult, ImageFormat, Target};

pub use elf::ElfWriter;
pub use layout::{build_image, BuildPhase, ImageWriter};
pub use macho::MachOWriter;

/// Lay out, patch and write `unit` as an executable for its target.
pub fn assemble(session: &CompilationSession<'_>, unit: CodeUnit) -> CompileResult<Vec<u8>> {
    let target = unit.target;
    target.validate()?;
    let image = match target.format {
        ImageFormat::Elf => {
            let mut writer = ElfWriter::new(target, session.options())?;
            build_image(session, unit, &mut writer)?
        }
        ImageFormat::MachO => {
            let mut writer = MachOWriter::new(target, session.options())?;
            build_image(session, unit, &mut writer)?
        }
    };
    validate(&image, target)?;
    Ok(image)
}

/// Parse a finished image and check it is what `target` asked for.
pub fn validate(image: &[u8], target: Target) -> CompileResult<()> {
    let file = object::File::parse(image)
        .map_err(|e| CompileError::internal(format!("written image does not parse: {e}")))?;
    let format = match target.format {
        ImageFormat::Elf => object::BinaryFormat::Elf,
        ImageFormat::MachO => object::BinaryFormat::MachO,
    };
    let arch = match target.arch {
        Arch::X86_64 => object::Architecture::X86_64,
        Arch::Arm64 => object::Architecture::Aarch64,
        Arch::Riscv64 => object::Architecture::Riscv64,
    };
    if file.format() != format || file.architecture() != arch || !file.is_64() {
        return Err(CompileError::internal(format!(
            "written image is {:?} {:?}, expected {target}",
            file.format(),
            file.architecture()
        )));
    }
    for section in file.sections() {
        if let Some((offset, size)) = section.file_range() {
            if offset + size > image.len() as u64 {
                return Err(CompileError::internal(format!(
                    "section {} extends past the end of the image",
                    section.name().unwrap_or("?")
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{generate, samples};
    use crate::core::test_utils::test::{all_targets, TestContext};

    #[test]
    fn test_every_sample_assembles_on_every_target() {
        let ctx = TestContext::new();
        for target in all_targets() {
            for sample in samples::SAMPLES {
                let session = ctx.session(target);
                let program = sample.program();
                let unit = generate(&session, &program).unwrap();
                let image = assemble(&session, unit)
                    .unwrap_or_else(|e| panic!("{} on {target}: {e}", sample.name));
                assert!(!image.is_empty());
                assert_eq!(session.stats().relocations_resolved, session.stats().relocations_recorded);
            }
        }
    }

    #[test]
    fn test_validate_rejects_wrong_architecture() {
        let ctx = TestContext::new();
        let target = Target::new(Arch::X86_64, ImageFormat::Elf);
        let session = ctx.session(target);
        let program = samples::find("arith").unwrap().program();
        let unit = generate(&session, &program).unwrap();
        let image = assemble(&session, unit).unwrap();
        assert!(validate(&image, Target::new(Arch::Arm64, ImageFormat::Elf)).is_err());
        assert!(validate(&image[..32], target).is_err());
    }
}
