//! End-to-end compilation: AST to executable bytes, and bytes to disk.

use std::fs;
use std::path::{Path, PathBuf};

use bumpalo::Bump;

use crate::codegen::ast::Program;
use crate::codegen::generate;
use crate::core::{CompilationSession, CompileError, CompileOptions, CompileResult, SessionStats, Target};
use crate::image;

/// A finished executable image.
#[derive(Debug)]
pub struct Compilation {
    pub target: Target,
    pub image: Vec<u8>,
    pub stats: SessionStats,
}

/// Generate, resolve and assemble `program` for `target`.
pub fn compile_program(
    program: &Program,
    target: Target,
    options: CompileOptions,
) -> CompileResult<Compilation> {
    target.validate()?;
    let arena = Bump::new();
    let session = CompilationSession::new(&arena, target, options);
    let unit = generate(&session, program)?;
    let image = image::assemble(&session, unit)?;
    let stats = session.stats();
    log::debug!(
        "compiled for {target}: {} function(s), {} text bytes, {} byte image",
        stats.functions_generated,
        stats.text_bytes,
        image.len()
    );
    Ok(Compilation { target, image, stats })
}

fn temporary_sibling(path: &Path) -> CompileResult<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| CompileError::internal(format!("output path '{}' has no file name", path.display())))?;
    let temp = format!(".{}.{}.tmp", name.to_string_lossy(), std::process::id());
    Ok(match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(temp),
        _ => PathBuf::from(temp),
    })
}

/// Write `image` to `path` atomically: a temporary file in the same
/// directory is filled, made executable and renamed over the target.
pub fn write_executable(path: &Path, image: &[u8]) -> CompileResult<()> {
    let temp = temporary_sibling(path)?;
    let written = fs::write(&temp, image)
        .and_then(|()| make_executable(&temp))
        .and_then(|()| fs::rename(&temp, path));
    if let Err(err) = written {
        let _ = fs::remove_file(&temp);
        return Err(CompileError::Io(err));
    }
    log::debug!("wrote {} ({} bytes)", path.display(), image.len());
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ast::{call_stmt, Expr, Stmt};
    use crate::codegen::samples;
    use crate::core::{Arch, ImageFormat};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flapc-driver-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_compile_reports_stats() {
        let program = samples::find("sum").unwrap().program();
        let target = Target::new(Arch::Arm64, ImageFormat::Elf);
        let result = compile_program(&program, target, CompileOptions::default()).unwrap();
        assert!(result.stats.functions_generated >= 2);
        assert_eq!(result.stats.relocations_recorded, result.stats.relocations_resolved);
        assert_eq!(&result.image[..4], b"\x7fELF");
    }

    #[test]
    fn test_riscv_macho_is_unsupported() {
        let program = samples::find("arith").unwrap().program();
        let target = Target::new(Arch::Riscv64, ImageFormat::MachO);
        let err = compile_program(&program, target, CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_source_error_writes_nothing() {
        let dir = scratch_dir("error");
        let out = dir.join("prog");
        fs::write(&out, b"previous").unwrap();
        let program = Program::new(vec![call_stmt("println", vec![Expr::ident("missing")]).at(3, 9)]);
        let err = compile_program(&program, Target::new(Arch::X86_64, ImageFormat::Elf), CompileOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("3:9"), "{err}");
        assert_eq!(fs::read(&out).unwrap(), b"previous");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_is_atomic_and_executable() {
        let dir = scratch_dir("write");
        let out = dir.join("hello");
        let program = Program::new(vec![Stmt::define("x", Expr::num(1.0))]);
        let result =
            compile_program(&program, Target::new(Arch::X86_64, ImageFormat::Elf), CompileOptions::default())
                .unwrap();
        write_executable(&out, &result.image).unwrap();
        assert_eq!(fs::read(&out).unwrap(), result.image);
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&out).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let out = std::env::temp_dir().join("flapc-no-such-dir").join("nested").join("prog");
        assert!(matches!(write_executable(&out, b"x"), Err(CompileError::Io(_))));
    }
}
