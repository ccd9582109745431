//! flapc command line driver.
//!
//! Compiles one of the built-in sample programs to an executable for the
//! chosen target.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use flapc::codegen::samples::{self, Sample};
use flapc::core::{Arch, CompileError, CompileOptions, ErrorCategory, ImageFormat, Target};
use flapc::driver::{compile_program, write_executable};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ArchArg {
    #[value(name = "x86_64", alias = "x86-64", alias = "amd64")]
    X86_64,
    #[value(alias = "aarch64")]
    Arm64,
    #[value(alias = "rv64")]
    Riscv64,
}

impl From<ArchArg> for Arch {
    fn from(arg: ArchArg) -> Self {
        match arg {
            ArchArg::X86_64 => Arch::X86_64,
            ArchArg::Arm64 => Arch::Arm64,
            ArchArg::Riscv64 => Arch::Riscv64,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    #[value(alias = "linux")]
    Elf,
    #[value(alias = "macos", alias = "darwin")]
    Macho,
}

impl From<FormatArg> for ImageFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Elf => ImageFormat::Elf,
            FormatArg::Macho => ImageFormat::MachO,
        }
    }
}

#[derive(Parser)]
#[command(name = "flapc")]
#[command(version)]
#[command(about = "Compile built-in sample programs to native executables", long_about = None)]
struct Cli {
    /// Sample program to compile (see --list)
    #[arg(value_name = "SAMPLE", required_unless_present = "list")]
    sample: Option<String>,

    /// Output path (default: the sample name)
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Target architecture (default: the host's)
    #[arg(long, value_enum)]
    arch: Option<ArchArg>,

    /// Executable format (default: the host's)
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Threads per parallel loop
    #[arg(long, default_value_t = CompileOptions::default().parallel_workers)]
    workers: u32,

    /// Stack bytes per worker thread
    #[arg(long, default_value_t = CompileOptions::default().worker_stack_size)]
    worker_stack: u64,

    /// Leave the function symbol table out of the image
    #[arg(long)]
    no_symbols: bool,

    /// List the sample programs and exit
    #[arg(long)]
    list: bool,

    /// Print compilation statistics
    #[arg(long)]
    stats: bool,
}

fn target_for(cli: &Cli) -> Target {
    let host = Target::host().unwrap_or(Target::new(Arch::X86_64, ImageFormat::Elf));
    Target::new(
        cli.arch.map_or(host.arch, Arch::from),
        cli.format.map_or(host.format, ImageFormat::from),
    )
}

fn exit_code(err: &CompileError) -> ExitCode {
    match err.category() {
        ErrorCategory::Source => ExitCode::from(1),
        ErrorCategory::Internal => ExitCode::from(2),
        ErrorCategory::Resource => ExitCode::from(3),
    }
}

fn run(cli: &Cli, sample: &Sample) -> Result<(), CompileError> {
    let target = target_for(cli);
    let options = CompileOptions {
        parallel_workers: cli.workers.max(1),
        worker_stack_size: cli.worker_stack,
        emit_symbols: !cli.no_symbols,
        ..CompileOptions::default()
    };
    log::info!("compiling '{}' for {target}", sample.name);

    let compilation = compile_program(&sample.program(), target, options)?;
    let output = cli.output.clone().unwrap_or_else(|| PathBuf::from(sample.name));
    write_executable(&output, &compilation.image)?;
    if cli.stats {
        print!("{}", compilation.stats);
    }
    println!("{} -> {} ({target}, {} bytes)", sample.name, output.display(), compilation.image.len());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.list {
        for sample in samples::SAMPLES {
            println!("{:<12} {}", sample.name, sample.description);
        }
        return ExitCode::SUCCESS;
    }

    let name = cli.sample.as_deref().unwrap_or_default();
    let Some(sample) = samples::find(name) else {
        eprintln!("error: no sample program named '{name}' (try --list)");
        return ExitCode::from(64);
    };

    match run(&cli, sample) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            exit_code(&err)
        }
    }
}
