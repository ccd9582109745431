//! Whole-program compilation: image structure for every target, and running
//! the sample programs when the host can execute the result.

use flapc::codegen::ast::{call_stmt, BinOp, Expr, Program, Stmt};
use flapc::codegen::samples::{self, SAMPLES};
use flapc::core::{Arch, ImageFormat};
use flapc::{compile_program, write_executable, CompileError, CompileOptions, Target};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const TARGETS: [Target; 5] = [
    Target::new(Arch::X86_64, ImageFormat::Elf),
    Target::new(Arch::Arm64, ImageFormat::Elf),
    Target::new(Arch::Riscv64, ImageFormat::Elf),
    Target::new(Arch::X86_64, ImageFormat::MachO),
    Target::new(Arch::Arm64, ImageFormat::MachO),
];

#[test]
fn images_parse_with_entry_inside_text() {
    init_logging();
    for target in TARGETS {
        for sample in SAMPLES {
            let compilation = compile_program(&sample.program(), target, CompileOptions::default())
                .unwrap_or_else(|e| panic!("{} for {target}: {e}", sample.name));
            let file = object::File::parse(&*compilation.image).unwrap();
            let text = file
                .sections()
                .find(|s| s.kind() == SectionKind::Text)
                .unwrap_or_else(|| panic!("{} for {target}: no text section", sample.name));
            let entry = file.entry();
            if target.format == ImageFormat::Elf {
                assert!(
                    entry >= text.address() && entry < text.address() + text.size(),
                    "{} for {target}: entry {entry:#x} outside text",
                    sample.name
                );
            }
            assert_eq!(
                compilation.stats.relocations_recorded, compilation.stats.relocations_resolved,
                "{} for {target}",
                sample.name
            );
        }
    }
}

#[test]
fn segments_are_page_aligned() {
    for target in TARGETS {
        let program = samples::find("printf").unwrap().program();
        let image = compile_program(&program, target, CompileOptions::default()).unwrap().image;
        let file = object::File::parse(&*image).unwrap();
        let page = target.format.page_size();
        for segment in file.segments() {
            let (offset, _) = segment.file_range();
            assert_eq!(
                offset % page,
                segment.address() % page,
                "{target}: segment {:?} offset and address disagree",
                segment.name()
            );
        }
    }
}

#[test]
fn symbols_follow_emit_symbols_option() {
    let program = samples::find("sum").unwrap().program();
    for target in TARGETS {
        let with = compile_program(&program, target, CompileOptions::default()).unwrap();
        let file = object::File::parse(&*with.image).unwrap();
        assert!(
            file.symbols().any(|s| s.name().map_or(false, |n| n.trim_start_matches('_') == "main")),
            "{target}: no main symbol"
        );

        let options = CompileOptions {
            emit_symbols: false,
            ..CompileOptions::default()
        };
        let without = compile_program(&program, target, options).unwrap();
        let file = object::File::parse(&*without.image).unwrap();
        assert!(!file.symbols().any(|s| s.name().map_or(false, |n| n.trim_start_matches('_') == "main")));
    }
}

#[test]
fn imports_only_appear_when_used() {
    for target in TARGETS {
        let plain = compile_program(&samples::find("hello").unwrap().program(), target, CompileOptions::default())
            .unwrap();
        let file = object::File::parse(&*plain.image).unwrap();
        assert!(file.imports().unwrap().is_empty(), "{target}");

        let printf = compile_program(&samples::find("printf").unwrap().program(), target, CompileOptions::default())
            .unwrap();
        let file = object::File::parse(&*printf.image).unwrap();
        let names: Vec<String> = file
            .imports()
            .unwrap()
            .iter()
            .map(|i| String::from_utf8_lossy(i.name()).trim_start_matches('_').to_string())
            .collect();
        assert_eq!(names, vec!["printf".to_string(), "exit".to_string()], "{target}");
    }
}

#[test]
fn source_errors_carry_locations() {
    let target = Target::new(Arch::Arm64, ImageFormat::MachO);
    let program = Program::new(vec![
        Stmt::define("x", Expr::num(1.0)).at(1, 1),
        Stmt::update("x", Expr::num(2.0)).at(2, 1),
    ]);
    let err = compile_program(&program, target, CompileOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::ImmutableUpdate { .. }), "{err}");
    assert!(err.to_string().contains("2:1"), "{err}");

    let program = Program::new(vec![call_stmt("println", vec![Expr::ident("nope")]).at(7, 3)]);
    let err = compile_program(&program, target, CompileOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::UndefinedVariable { .. }), "{err}");
}

/// Run every self-contained sample natively on an x86-64 Linux host.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn samples_run_natively() {
    use std::process::Command;

    init_logging();
    let dir = std::env::temp_dir().join(format!("flapc-run-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let target = Target::new(Arch::X86_64, ImageFormat::Elf);
    for sample in SAMPLES {
        let Some(expected) = sample.expected_output else {
            continue;
        };
        let compilation = compile_program(&sample.program(), target, CompileOptions::default()).unwrap();
        if compilation.stats.imports > 0 && !std::path::Path::new("/lib64/ld-linux-x86-64.so.2").exists() {
            continue;
        }
        let path = dir.join(sample.name);
        write_executable(&path, &compilation.image).unwrap();
        let output = Command::new(&path).output().unwrap();
        assert!(output.status.success(), "{} exited with {:?}", sample.name, output.status);
        assert_eq!(String::from_utf8_lossy(&output.stdout), expected, "{}", sample.name);
    }

    let parallel = compile_program(&samples::find("parallel").unwrap().program(), target, CompileOptions::default())
        .unwrap();
    let path = dir.join("parallel");
    write_executable(&path, &parallel.image).unwrap();
    let output = Command::new(&path).output().unwrap();
    assert!(output.status.success(), "parallel exited with {:?}", output.status);
    std::fs::remove_dir_all(&dir).unwrap();
}

/// Compile `program` for the host, run it and return its standard output.
/// `None` when the program needs the dynamic loader and the host has none.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn run_native(name: &str, program: &Program) -> Option<String> {
    let target = Target::new(Arch::X86_64, ImageFormat::Elf);
    let compilation = compile_program(program, target, CompileOptions::default()).unwrap();
    if compilation.stats.imports > 0 && !std::path::Path::new("/lib64/ld-linux-x86-64.so.2").exists() {
        return None;
    }
    let dir = std::env::temp_dir().join(format!("flapc-native-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    write_executable(&path, &compilation.image).unwrap();
    let output = std::process::Command::new(&path).output().unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
    assert!(output.status.success(), "{name} exited with {:?}", output.status);
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn println_of_a_number_runs_natively() {
    init_logging();
    let program = Program::new(vec![call_stmt("println", vec![Expr::num(4.0)])]);
    assert_eq!(run_native("println4", &program).unwrap(), "4\n");
}

/// More live variables than callee-saved registers: most of them spill.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn spilled_variables_keep_their_values() {
    init_logging();
    let names: Vec<String> = (0..20).map(|i| format!("v{i}")).collect();
    let mut statements: Vec<Stmt> = names
        .iter()
        .enumerate()
        .map(|(i, name)| Stmt::define(name, Expr::num(i as f64)))
        .collect();
    let sum = names
        .iter()
        .skip(1)
        .fold(Expr::ident(&names[0]), |acc, name| Expr::binary(BinOp::Add, acc, Expr::ident(name)));
    statements.push(call_stmt("println", vec![sum]));
    assert_eq!(run_native("spills", &Program::new(statements)).unwrap(), "190\n");
}

/// C calls made with one and with three values pushed on the expression
/// stack must still see a 16-byte aligned stack.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn c_calls_at_odd_stack_depth_run_natively() {
    init_logging();
    let nested = |depth: u32, text: &str| {
        (1..=depth).rev().fold(Expr::call("printf", vec![Expr::string(text)]), |inner, n| {
            Expr::binary(BinOp::Add, Expr::num(f64::from(n)), inner)
        })
    };
    let program = Program::new(vec![
        call_stmt("printf", vec![Expr::string("%v\n"), nested(1, "ab\n")]),
        call_stmt("printf", vec![Expr::string("%v\n"), nested(3, "cd\n")]),
    ]);
    if let Some(output) = run_native("aligned", &program) {
        assert_eq!(output, "ab\n4\ncd\n9\n");
    }
}
