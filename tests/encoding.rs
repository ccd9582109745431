//! Encoder behaviour shared by all three instruction sets: fixup sites,
//! patch/decode agreement and x86-64 output checked against a disassembler.

use flapc::arch::{encoder_for, Cond, FpOp, IntOp, Mem, MachineOp, Operand};
use flapc::core::{Arch, AsmReg, ImageFormat, RelocKind, Target};
use flapc::x64::abi::{RAX, RBX, RCX, RDI, RSP, XMM0};
use iced_x86::{Decoder, DecoderOptions, Mnemonic};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn targets() -> [Target; 3] {
    [
        Target::new(Arch::X86_64, ImageFormat::Elf),
        Target::new(Arch::Arm64, ImageFormat::Elf),
        Target::new(Arch::Riscv64, ImageFormat::Elf),
    ]
}

fn two_gp(arch: Arch) -> (AsmReg, AsmReg) {
    match arch {
        Arch::X86_64 => (RAX, RCX),
        Arch::Arm64 => (flapc::arm64::abi::x(0), flapc::arm64::abi::x(1)),
        Arch::Riscv64 => (flapc::riscv64::abi::x(10), flapc::riscv64::abi::x(11)),
    }
}

fn site_op(kind: RelocKind, arch: Arch) -> MachineOp {
    let (a, b) = two_gp(arch);
    match kind {
        RelocKind::DirectCall => MachineOp::Call,
        RelocKind::PcRelLoad => MachineOp::LoadAddr { dst: a },
        RelocKind::CondBranch => MachineOp::BranchInt {
            cond: Cond::Lt,
            lhs: a,
            rhs: Operand::Reg(b),
        },
        RelocKind::UncondBranch => MachineOp::Jump,
    }
}

#[test]
fn every_site_kind_patches_and_decodes_back() {
    init_logging();
    let base = 0x40_1000u64;
    for target in targets() {
        let encoder = encoder_for(target);
        for kind in [
            RelocKind::DirectCall,
            RelocKind::PcRelLoad,
            RelocKind::CondBranch,
            RelocKind::UncondBranch,
        ] {
            let mut code = Vec::new();
            let fixups = encoder.encode(&site_op(kind, target.arch), &mut code).unwrap();
            assert_eq!(fixups.len(), 1, "{target} {kind:?}");
            assert_eq!(fixups[0].kind, kind, "{target}");

            let at = fixups[0].offset as usize;
            let site_addr = base + at as u64;
            for target_addr in [base - 0x40, base + 0x2000, base + 0x7_0000] {
                encoder
                    .patch(kind, &mut code[at..], site_addr, target_addr)
                    .unwrap_or_else(|e| panic!("{target} {kind:?} -> {target_addr:#x}: {e}"));
                assert_eq!(
                    encoder.decode_target(kind, &code[at..], site_addr),
                    Some(target_addr),
                    "{target} {kind:?}"
                );
            }
        }
    }
}

#[test]
fn patching_a_truncated_site_fails() {
    for target in targets() {
        let encoder = encoder_for(target);
        let mut code = Vec::new();
        let fixups = encoder.encode(&MachineOp::Call, &mut code).unwrap();
        let at = fixups[0].offset as usize;
        let end = code.len() - 1;
        assert!(encoder
            .patch(RelocKind::DirectCall, &mut code[at..end], 0x1000, 0x2000)
            .is_err());
    }
}

#[test]
fn fixed_width_targets_emit_whole_words() {
    let (a, b) = (flapc::arm64::abi::x(2), flapc::arm64::abi::x(3));
    let ops = [
        MachineOp::MovImm { dst: a, imm: 0x1234_5678_9abc },
        MachineOp::Int { op: IntOp::Add, dst: a, lhs: a, rhs: Operand::Imm(-7) },
        MachineOp::Store { src: b, mem: Mem::new(a, 4096 + 8) },
        MachineOp::EnterFrame { frame_size: 48 },
        MachineOp::LeaveFrame { frame_size: 48 },
        MachineOp::Ret,
    ];
    for target in [
        Target::new(Arch::Arm64, ImageFormat::Elf),
        Target::new(Arch::Arm64, ImageFormat::MachO),
    ] {
        let encoder = encoder_for(target);
        let mut code = Vec::new();
        for op in &ops {
            encoder.encode(op, &mut code).unwrap();
            assert_eq!(code.len() % 4, 0, "{}", op.mnemonic());
        }
    }

    let (a, b) = two_gp(Arch::Riscv64);
    let encoder = encoder_for(Target::new(Arch::Riscv64, ImageFormat::Elf));
    let mut code = Vec::new();
    for op in [
        MachineOp::MovImm { dst: a, imm: -0x7654_3210_fedc },
        MachineOp::Int { op: IntOp::Xor, dst: a, lhs: a, rhs: Operand::Reg(b) },
        MachineOp::Load { dst: b, mem: Mem::new(a, -4000) },
        MachineOp::AtomicAdd { addr: a, value: b, result: flapc::riscv64::abi::x(12) },
        MachineOp::Syscall,
    ] {
        encoder.encode(&op, &mut code).unwrap();
        assert_eq!(code.len() % 4, 0, "{}", op.mnemonic());
    }
}

fn decode_x64(code: &[u8]) -> Vec<Mnemonic> {
    let mut decoder = Decoder::with_ip(64, code, 0x1000, DecoderOptions::NONE);
    let mut mnemonics = Vec::new();
    while decoder.can_decode() {
        let instr = decoder.decode();
        assert!(!instr.is_invalid(), "invalid instruction in {code:02x?}");
        mnemonics.push(instr.mnemonic());
    }
    mnemonics
}

#[test]
fn x64_operations_disassemble_as_expected() {
    init_logging();
    let encoder = encoder_for(Target::new(Arch::X86_64, ImageFormat::Elf));
    let cases: Vec<(MachineOp, Vec<Mnemonic>)> = vec![
        (MachineOp::Mov { dst: RBX, src: RDI }, vec![Mnemonic::Mov]),
        (MachineOp::MovImm { dst: RAX, imm: 1 << 40 }, vec![Mnemonic::Mov]),
        (
            MachineOp::Int { op: IntOp::Add, dst: RAX, lhs: RAX, rhs: Operand::Imm(5) },
            vec![Mnemonic::Add],
        ),
        (
            MachineOp::Int { op: IntOp::Shl, dst: RAX, lhs: RAX, rhs: Operand::Reg(RCX) },
            vec![Mnemonic::Shl],
        ),
        (
            MachineOp::Fp { op: FpOp::Mul, dst: XMM0, lhs: XMM0, rhs: AsmReg::fp(1) },
            vec![Mnemonic::Mulsd],
        ),
        (MachineOp::FpSqrt { dst: XMM0, src: AsmReg::fp(2) }, vec![Mnemonic::Sqrtsd]),
        (MachineOp::CvtFpToInt { dst: RAX, src: XMM0 }, vec![Mnemonic::Cvttsd2si]),
        (MachineOp::Load { dst: XMM0, mem: Mem::new(RSP, 16) }, vec![Mnemonic::Movq]),
        (MachineOp::Lea { dst: RDI, mem: Mem::new(RSP, -8) }, vec![Mnemonic::Lea]),
        (MachineOp::Call, vec![Mnemonic::Call]),
        (MachineOp::Jump, vec![Mnemonic::Jmp]),
        (MachineOp::Syscall, vec![Mnemonic::Syscall]),
        (MachineOp::Ret, vec![Mnemonic::Ret]),
    ];
    for (op, expected) in cases {
        let mut code = Vec::new();
        encoder.encode(&op, &mut code).unwrap();
        assert_eq!(decode_x64(&code), expected, "{}", op.mnemonic());
    }
}

#[test]
fn x64_atomic_add_is_locked_xadd() {
    let encoder = encoder_for(Target::new(Arch::X86_64, ImageFormat::Elf));
    let mut code = Vec::new();
    encoder
        .encode(&MachineOp::AtomicAdd { addr: RDI, value: RAX, result: RBX }, &mut code)
        .unwrap();
    let mut decoder = Decoder::with_ip(64, &code, 0, DecoderOptions::NONE);
    let xadd = decoder
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Xadd)
        .expect("no xadd emitted");
    assert!(xadd.has_lock_prefix());
}

#[test]
fn x64_call_site_targets_patched_address() {
    let encoder = encoder_for(Target::new(Arch::X86_64, ImageFormat::Elf));
    let mut code = Vec::new();
    let fixups = encoder.encode(&MachineOp::Call, &mut code).unwrap();
    let at = fixups[0].offset as usize;
    encoder
        .patch(RelocKind::DirectCall, &mut code[at..], 0x1000 + at as u64, 0x5000)
        .unwrap();
    let instr = Decoder::with_ip(64, &code, 0x1000, DecoderOptions::NONE).decode();
    assert_eq!(instr.mnemonic(), Mnemonic::Call);
    assert_eq!(instr.near_branch_target(), 0x5000);
}

#[test]
fn x64_plt_matches_disassembly() {
    let encoder = encoder_for(Target::new(Arch::X86_64, ImageFormat::Elf));
    let plt = 0x40_2000;
    let got = 0x40_3000;
    let header = encoder.plt_header(plt, got).unwrap();
    assert_eq!(header.len(), encoder.plt_header_size());
    let entry_addr = plt + header.len() as u64;
    let entry = encoder.plt_entry(entry_addr, got + 24, 0, plt).unwrap();
    assert_eq!(entry.len(), encoder.plt_entry_size());

    let first = Decoder::with_ip(64, &entry, entry_addr, DecoderOptions::NONE).decode();
    assert_eq!(first.mnemonic(), Mnemonic::Jmp);
    assert!(first.is_ip_rel_memory_operand());
    assert_eq!(first.ip_rel_memory_address(), got + 24);

    let stub = encoder.macho_stub(0x1_0000_4000, 0x1_0000_8000).unwrap();
    assert_eq!(stub.len(), encoder.macho_stub_size());
    let jmp = Decoder::with_ip(64, &stub, 0x1_0000_4000, DecoderOptions::NONE).decode();
    assert_eq!(jmp.ip_rel_memory_address(), 0x1_0000_8000);
}

fn word(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

#[test]
fn arm64_branch_fields_hold_word_displacement() {
    let encoder = encoder_for(Target::new(Arch::Arm64, ImageFormat::Elf));
    for (op, opcode) in [(MachineOp::Call, 0b100101u32), (MachineOp::Jump, 0b000101)] {
        let mut code = Vec::new();
        let fixups = encoder.encode(&op, &mut code).unwrap();
        let at = fixups[0].offset as usize;
        for delta in [-0x400i64, 4, 0x1_fff_ffc] {
            let site = 0x40_0000u64;
            encoder
                .patch(fixups[0].kind, &mut code[at..], site, site.wrapping_add(delta as u64))
                .unwrap();
            let insn = word(&code, at);
            assert_eq!(insn >> 26, opcode);
            assert_eq!(sign_extend(insn & 0x03ff_ffff, 26) * 4, delta);
        }
    }
}

#[test]
fn riscv_call_splits_displacement_across_auipc_jalr() {
    let encoder = encoder_for(Target::new(Arch::Riscv64, ImageFormat::Elf));
    let mut code = Vec::new();
    let fixups = encoder.encode(&MachineOp::Call, &mut code).unwrap();
    let at = fixups[0].offset as usize;
    for delta in [0x800i64, -0x1234, 0x12_3ffc] {
        let site = 0x1_0000u64;
        encoder
            .patch(RelocKind::DirectCall, &mut code[at..], site, site.wrapping_add(delta as u64))
            .unwrap();
        let auipc = word(&code, at);
        let jalr = word(&code, at + 4);
        assert_eq!(auipc & 0x7f, 0b0010111);
        assert_eq!(jalr & 0x7f, 0b1100111);
        let hi = sign_extend(auipc & 0xffff_f000, 32);
        let lo = sign_extend(jalr >> 20, 12);
        assert_eq!(hi + lo, delta);
    }

    let mut code = Vec::new();
    let fixups = encoder.encode(&MachineOp::Jump, &mut code).unwrap();
    let at = fixups[0].offset as usize;
    encoder
        .patch(RelocKind::UncondBranch, &mut code[at..], 0x2000, 0x2000 + 0x804)
        .unwrap();
    let jal = word(&code, at);
    assert_eq!(jal & 0x7f, 0b1101111);
    let imm = ((jal >> 31) & 1) << 20 | ((jal >> 12) & 0xff) << 12 | ((jal >> 20) & 1) << 11 | ((jal >> 21) & 0x3ff) << 1;
    assert_eq!(sign_extend(imm, 21), 0x804);
}

/// Nearest and farthest targets each site kind can reach from `site`, and
/// the step that separates the farthest reachable target from the first
/// unreachable one.
fn reach(arch: Arch, kind: RelocKind, site: u64) -> (u64, u64, u64) {
    const GIB2: u64 = 1 << 31;
    match (arch, kind) {
        (Arch::X86_64, _) => (site + 4 - GIB2, site + 4 + GIB2 - 1, 1),
        (Arch::Arm64, RelocKind::DirectCall | RelocKind::UncondBranch) => {
            (site - (1 << 27), site + (1 << 27) - 4, 4)
        }
        (Arch::Arm64, RelocKind::CondBranch) => (site - (1 << 20), site + (1 << 20) - 4, 4),
        (Arch::Arm64, RelocKind::PcRelLoad) => {
            let page = site & !0xfff;
            (page - (1 << 32), page + (1 << 32) - 0x1000 + 0xff8, 8)
        }
        (Arch::Riscv64, RelocKind::DirectCall | RelocKind::PcRelLoad) => {
            (site - GIB2 - 0x800, site + GIB2 - 0x801, 1)
        }
        (Arch::Riscv64, RelocKind::UncondBranch) => (site - (1 << 20), site + (1 << 20) - 2, 2),
        (Arch::Riscv64, RelocKind::CondBranch) => (site + 4 - (1 << 20), site + 4 + (1 << 20) - 2, 2),
    }
}

#[test]
fn site_kinds_reach_exactly_their_encodable_range() {
    init_logging();
    let base = 0x1_0000_0000u64;
    for target in targets() {
        let encoder = encoder_for(target);
        for kind in [
            RelocKind::DirectCall,
            RelocKind::PcRelLoad,
            RelocKind::CondBranch,
            RelocKind::UncondBranch,
        ] {
            let mut code = Vec::new();
            let fixups = encoder.encode(&site_op(kind, target.arch), &mut code).unwrap();
            let at = fixups[0].offset as usize;
            let site_addr = base + at as u64;
            let (min, max, step) = reach(target.arch, kind, site_addr);

            for target_addr in [min, max] {
                encoder
                    .patch(kind, &mut code[at..], site_addr, target_addr)
                    .unwrap_or_else(|e| panic!("{target} {kind:?} -> {target_addr:#x}: {e}"));
                assert_eq!(
                    encoder.decode_target(kind, &code[at..], site_addr),
                    Some(target_addr),
                    "{target} {kind:?}"
                );
            }
            for target_addr in [min - step, max + step] {
                let before = code.clone();
                let err = encoder.patch(kind, &mut code[at..], site_addr, target_addr).unwrap_err();
                assert!(
                    matches!(err, flapc::arch::EncodingError::OutOfRange { .. }),
                    "{target} {kind:?} -> {target_addr:#x}: {err}"
                );
                assert_eq!(code, before, "{target} {kind:?}: failed patch wrote bytes");
            }
        }
    }
}
