// This module resolves the relocation records a code unit accumulated during generation.
// Once the image layout fixes the address of the text, the rodata and every import stub,
// each record's target has a concrete address; the resolver hands the site bytes to the
// target's Encoder, whose patch routine shares its bit layouts with emission. Resolution
// is patch-only: no instruction is regenerated or moved, so the text length and every
// label offset stay what the generator produced. Records are resolved exactly once and
// marked; running the resolver again finds nothing left to do and leaves the bytes alone.
// A target that has no address (a label that was never bound, an import without a stub)
// and a site outside the text are internal errors rather than a silent zero.

//! Relocation resolution against final addresses.

use crate::arch::Encoder;
use crate::codegen::CodeUnit;
use crate::core::{CompilationSession, CompileError, CompileResult, LabelTable, RelocTarget, RodataBuffer};

/// Final virtual addresses of everything a relocation can refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    pub text: u64,
    pub rodata: u64,
    /// Stub address of each import, indexed by `ImportId`.
    pub stubs: Vec<u64>,
}

impl AddressMap {
    pub fn target_address(
        &self,
        target: RelocTarget,
        labels: &LabelTable,
        rodata: &RodataBuffer,
    ) -> CompileResult<u64> {
        match target {
            RelocTarget::Label(id) => labels
                .offset(id)
                .map(|offset| self.text + u64::from(offset))
                .ok_or_else(|| {
                    CompileError::internal(format!(
                        "relocation against label '{}' which was never placed",
                        labels.name(id)
                    ))
                }),
            RelocTarget::Rodata(id) => rodata
                .offset_of(id)
                .map(|offset| self.rodata + u64::from(offset))
                .ok_or_else(|| CompileError::internal(format!("relocation against unknown data {id:?}"))),
            RelocTarget::Import(id) => self
                .stubs
                .get(id.0 as usize)
                .copied()
                .ok_or_else(|| CompileError::internal(format!("import {id:?} has no stub"))),
        }
    }
}

pub struct RelocationResolver<'e> {
    encoder: &'e dyn Encoder,
    map: &'e AddressMap,
}

impl<'e> RelocationResolver<'e> {
    pub fn new(encoder: &'e dyn Encoder, map: &'e AddressMap) -> Self {
        Self { encoder, map }
    }

    /// Patch every pending record of `unit`; returns how many were resolved.
    pub fn resolve(&self, session: &CompilationSession<'_>, unit: &mut CodeUnit) -> CompileResult<usize> {
        let text = unit.text.as_mut_slice();
        let mut resolved = 0;
        for record in unit.relocs.iter_mut().filter(|r| !r.resolved) {
            let position = record.position as usize;
            if position >= text.len() {
                return Err(CompileError::internal(format!(
                    "relocation at {position:#x} is outside the {:#x}-byte text",
                    text.len()
                )));
            }
            let target = self.map.target_address(record.target, &unit.labels, &unit.rodata)?;
            let site_addr = self.map.text + u64::from(record.position);
            self.encoder
                .patch(record.kind, &mut text[position..], site_addr, target)
                .map_err(CompileError::from)?;
            log::trace!("patched {:?} at {site_addr:#x} -> {target:#x}", record.kind);
            record.resolved = true;
            resolved += 1;
        }
        session.record_relocations_resolved(resolved);
        log::debug!(
            "resolved {resolved} relocation(s), {} pending",
            unit.relocs.pending()
        );
        Ok(resolved)
    }

    /// Decode every site and check it refers to its record's target.
    pub fn verify(&self, unit: &CodeUnit) -> CompileResult<()> {
        let text = unit.text.as_slice();
        for record in unit.relocs.iter() {
            if !record.resolved {
                return Err(CompileError::internal(format!(
                    "relocation at {:#x} was never resolved",
                    record.position
                )));
            }
            let position = record.position as usize;
            let expected = self.map.target_address(record.target, &unit.labels, &unit.rodata)?;
            let site_addr = self.map.text + u64::from(record.position);
            let found = text
                .get(position..)
                .and_then(|site| self.encoder.decode_target(record.kind, site, site_addr));
            if found != Some(expected) {
                return Err(CompileError::internal(format!(
                    "{:?} at {site_addr:#x} decodes to {found:x?}, expected {expected:#x}",
                    record.kind
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::encoder_for;
    use crate::codegen::ast::{call_stmt, BinOp, Expr, Program, Stmt};
    use crate::codegen::generate;
    use crate::core::test_utils::test::{all_targets, TestContext};
    use crate::core::{RelocKind, Target};

    fn looping_program() -> Program {
        Program::new(vec![
            Stmt::define_mut("total", Expr::num(0.0)),
            Stmt::range_loop(
                "i",
                Expr::num(0.0),
                Expr::num(10.0),
                false,
                vec![Stmt::update(
                    "total",
                    Expr::binary(BinOp::Add, Expr::ident("total"), Expr::num(0.5)),
                )],
            ),
            call_stmt("println", vec![Expr::ident("total")]),
        ])
    }

    fn map_for(unit: &CodeUnit) -> AddressMap {
        AddressMap {
            text: 0x40_1000,
            rodata: 0x40_1000 + ((unit.text.len() as u64 + 0xFFF) & !0xFFF),
            stubs: Vec::new(),
        }
    }

    #[test]
    fn test_every_site_decodes_to_its_target() {
        let ctx = TestContext::new();
        for target in all_targets() {
            let session = ctx.session(target);
            let program = looping_program();
            let mut unit = generate(&session, &program).unwrap();
            let encoder = encoder_for(target);
            let map = map_for(&unit);
            let resolver = RelocationResolver::new(encoder.as_ref(), &map);
            let count = resolver.resolve(&session, &mut unit).unwrap();
            assert_eq!(count, unit.relocs.len(), "{target}");
            assert_eq!(unit.relocs.pending(), 0);
            resolver.verify(&unit).unwrap();
            assert_eq!(session.stats().relocations_resolved, count);
        }
    }

    #[test]
    fn test_second_resolve_is_a_no_op() {
        let ctx = TestContext::new();
        let session = ctx.linux_x64();
        let program = looping_program();
        let mut unit = generate(&session, &program).unwrap();
        let encoder = encoder_for(session.target());
        let map = map_for(&unit);
        let resolver = RelocationResolver::new(encoder.as_ref(), &map);
        resolver.resolve(&session, &mut unit).unwrap();
        let once = unit.text.as_slice().to_vec();
        assert_eq!(resolver.resolve(&session, &mut unit).unwrap(), 0);
        assert_eq!(unit.text.as_slice(), &once[..]);

        // Re-patching a site with the same addresses reproduces the same bytes.
        for record in unit.relocs.iter_mut() {
            record.resolved = false;
        }
        resolver.resolve(&session, &mut unit).unwrap();
        assert_eq!(unit.text.as_slice(), &once[..]);
    }

    #[test]
    fn test_unplaced_label_is_internal_error() {
        let ctx = TestContext::new();
        let session = ctx.session(Target::new(crate::core::Arch::Arm64, crate::core::ImageFormat::Elf));
        let program = looping_program();
        let mut unit = generate(&session, &program).unwrap();
        let dangling = unit.labels.create("dangling");
        unit.relocs.record(0, RelocKind::DirectCall, RelocTarget::Label(dangling));
        let encoder = encoder_for(session.target());
        let map = map_for(&unit);
        let err = RelocationResolver::new(encoder.as_ref(), &map)
            .resolve(&session, &mut unit)
            .unwrap_err();
        assert!(err.to_string().contains("dangling"), "{err}");
    }

    #[test]
    fn test_site_outside_text_is_internal_error() {
        let ctx = TestContext::new();
        let session = ctx.linux_x64();
        let program = looping_program();
        let mut unit = generate(&session, &program).unwrap();
        let end = unit.text.len() as u32;
        unit.relocs.record(end, RelocKind::UncondBranch, RelocTarget::Label(unit.entry));
        let encoder = encoder_for(session.target());
        let map = map_for(&unit);
        let err = RelocationResolver::new(encoder.as_ref(), &map)
            .resolve(&session, &mut unit)
            .unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }

    #[test]
    fn test_import_without_stub_is_internal_error() {
        let map = AddressMap::default();
        let labels = LabelTable::new();
        let rodata = RodataBuffer::new();
        let err = map
            .target_address(RelocTarget::Import(crate::core::ImportId(0)), &labels, &rodata)
            .unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }
}
