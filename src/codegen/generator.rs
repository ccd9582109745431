// This module implements the code generator core. CodeGenerator walks the syntax tree once
// per function and emits machine operations through the target's Encoder into the shared
// text buffer. Every operation passes through one emitter that refuses registers which
// are neither checked out of the transient pool, durably assigned to a variable of the
// current function, nor a fixed role; fixup sites reported by the encoder become
// relocation records immediately (or, for loop exits and continues, once the loop is
// closed). Expressions leave their value in the accumulator and use the machine stack
// for intermediate results, so evaluation order is left to right and the stack stays
// balanced at every depth. Frames are sized before the prologue is written: the analysis
// pass and linear scan fix every variable's storage first, then FrameLayout assigns the
// saved-register slots, spill slots and the fixed scratch area below the frame pointer.
// Calls, builtins, runtime helpers and parallel loops live in sibling modules as further
// impl blocks on the same struct.

//! Single-pass AST to machine code generation.

use std::collections::VecDeque;

use super::analysis::{
    analyze_function, summarize, FunctionBody, ProgramSummary, WORKER_CTX, WORKER_END,
};
use super::ast::{
    ArmTest, AssignMode, BinOp, Expr, ExprKind, JumpKind, MatchArm, Program, Stmt, StmtKind,
    UnaryOp,
};
use super::runtime::HelperSet;
use super::scope::{LoopContext, LoopStack, ScopeStack};
use crate::arch::{encoder_for, Cond, Encoder, FpOp, IntOp, MachineOp, Mem, Operand, TargetInfo};
use crate::core::linear_scan;
use crate::core::{
    AsmReg, CompilationSession, CompileError, CompileResult, ImageFormat, ImportTable, LabelId,
    LabelTable, Location, RegBank, RegBitSet, RegisterFile, RelocKind, RelocTarget,
    RelocationTable, RodataBuffer, SourceLocation, Target, TempPool, TempReg, TempTag,
    TextBuffer, VarId, FP, GP,
};
use crate::core::Allocation;

/// Most arguments a language-level function accepts.
pub const MAX_PARAMS: usize = 6;

/// Bytes of the per-frame number formatting buffer.
pub const PRINT_BUFFER_BYTES: i32 = 32;

/// 8-byte integer scratch slots in every frame.
pub const INT_SLOTS: u32 = 4;

/// Names the generator reserves for its own entry points.
const RESERVED_NAMES: &[&str] = &["main", "_start"];

/// A function placed in the text buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// Everything code generation produces for one program.
#[derive(Debug)]
pub struct CodeUnit {
    pub target: Target,
    pub text: TextBuffer,
    pub rodata: RodataBuffer,
    pub labels: LabelTable,
    pub relocs: RelocationTable,
    pub imports: ImportTable,
    /// `main`.
    pub entry: LabelId,
    /// `_start`, for ELF images.
    pub start: Option<LabelId>,
    pub functions: Vec<FunctionSymbol>,
}

impl CodeUnit {
    /// Text offset of the first instruction the loader runs.
    pub fn entry_offset(&self) -> CompileResult<u32> {
        let label = self.start.unwrap_or(self.entry);
        self.labels.offset(label).ok_or_else(|| {
            CompileError::internal(format!("entry label '{}' never placed", self.labels.name(label)))
        })
    }
}

/// A function waiting to be generated after the current one.
#[derive(Debug, Clone)]
pub struct PendingFunction<'p> {
    pub name: String,
    pub label: LabelId,
    pub body: FunctionBody<'p>,
}

/// Frame slots, as offsets from the frame pointer.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    /// Bytes reserved below the saved frame record.
    pub size: u32,
    pub saved: Vec<(AsmReg, i32)>,
    spill_base: i32,
    int_base: i32,
    pub print_buffer: i32,
    pub ctx_base: i32,
}

impl FrameLayout {
    pub fn new(saved_area: i32, saved: &[AsmReg], spill_slots: u32, captures: usize) -> Self {
        let mut cursor = saved_area;
        let mut saved_slots = Vec::with_capacity(saved.len());
        for &reg in saved {
            cursor += 8;
            saved_slots.push((reg, -cursor));
        }
        cursor += 8 * spill_slots as i32;
        let spill_base = -cursor;
        cursor += 8 * INT_SLOTS as i32;
        let int_base = -cursor;
        cursor += PRINT_BUFFER_BYTES;
        let print_buffer = -cursor;
        cursor += 8 * captures as i32;
        let ctx_base = -cursor;
        let used = (cursor - saved_area) as u32;
        Self {
            size: (used + 15) & !15,
            saved: saved_slots,
            spill_base,
            int_base,
            print_buffer,
            ctx_base,
        }
    }

    pub fn spill(&self, slot: u32) -> i32 {
        self.spill_base + 8 * slot as i32
    }

    pub fn int_slot(&self, index: u32) -> i32 {
        self.int_base + 8 * index as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Main,
    Lambda,
    Worker,
    Helper,
}

/// Per-function generation state, replaced wholesale for every function.
#[derive(Debug)]
pub struct FunctionState {
    pub name: String,
    pub kind: FunctionKind,
    pub scopes: ScopeStack,
    pub loops: LoopStack,
    pub alloc: Allocation,
    pub frame: FrameLayout,
    /// Persistent registers holding this function's variables.
    pub durable: RegBitSet,
    pub self_label: LabelId,
    pub body_label: LabelId,
    pub return_label: LabelId,
    pub params: Vec<VarId>,
    /// Outstanding 16-byte expression stack pushes.
    pub stack_depth: u32,
    pub captures: VecDeque<Vec<String>>,
    /// Parallel loops lowered so far, for worker names.
    pub workers: u32,
}

impl FunctionState {
    fn new(name: &str, kind: FunctionKind, self_label: LabelId, labels: &mut LabelTable) -> Self {
        Self {
            name: name.to_string(),
            kind,
            scopes: ScopeStack::new(),
            loops: LoopStack::new(),
            alloc: Allocation::default(),
            frame: FrameLayout::default(),
            durable: RegBitSet::new(),
            self_label,
            body_label: labels.create(format!("{name}.body")),
            return_label: labels.create(format!("{name}.return")),
            params: Vec::new(),
            stack_depth: 0,
            captures: VecDeque::new(),
            workers: 0,
        }
    }
}

pub struct CodeGenerator<'s, 'a, 'p> {
    pub(super) session: &'s CompilationSession<'a>,
    pub(super) info: TargetInfo,
    pub(super) encoder: Box<dyn Encoder>,
    fixed: RegBitSet,
    pub(super) text: TextBuffer,
    pub(super) rodata: RodataBuffer,
    pub(super) labels: LabelTable,
    pub(super) relocs: RelocationTable,
    pub(super) imports: ImportTable,
    pub(super) pool: TempPool,
    pub(super) summary: ProgramSummary<'p>,
    pub(super) pending: VecDeque<PendingFunction<'p>>,
    pub(super) helpers: HelperSet,
    pub(super) func: FunctionState,
    functions: Vec<FunctionSymbol>,
    program: &'p Program,
    next_label: u32,
    next_lambda: u32,
}

/// Generate machine code for `program`.
pub fn generate<'p>(
    session: &CompilationSession<'_>,
    program: &'p Program,
) -> CompileResult<CodeUnit> {
    CodeGenerator::new(session, program)?.run()
}

/// Label name for a user function, steering clear of the entry points.
pub fn function_label_name(name: &str) -> String {
    if RESERVED_NAMES.contains(&name) || name.starts_with("__") {
        format!("{name}.fn")
    } else {
        name.to_string()
    }
}

impl<'s, 'a, 'p> CodeGenerator<'s, 'a, 'p> {
    pub fn new(session: &'s CompilationSession<'a>, program: &'p Program) -> CompileResult<Self> {
        let target = session.target();
        target.validate()?;
        let info = TargetInfo::for_target(target);
        let mut labels = LabelTable::new();
        let main = labels.named("main");
        Ok(Self {
            session,
            fixed: info.fixed_roles(),
            pool: TempPool::new(info.pool),
            encoder: encoder_for(target),
            info,
            text: TextBuffer::new(),
            rodata: RodataBuffer::new(),
            func: FunctionState::new("main", FunctionKind::Main, main, &mut labels),
            labels,
            relocs: RelocationTable::new(),
            imports: ImportTable::new(),
            summary: summarize(program),
            pending: VecDeque::new(),
            helpers: HelperSet::default(),
            functions: Vec::new(),
            program,
            next_label: 0,
            next_lambda: 0,
        })
    }

    pub fn run(mut self) -> CompileResult<CodeUnit> {
        let target = self.session.target();
        let main = self.labels.named("main");

        for global in self.summary.globals.clone() {
            if global.params.len() > MAX_PARAMS {
                return Err(CompileError::TypeMismatch {
                    reason: format!(
                        "'{}' takes {} parameters, at most {MAX_PARAMS} are supported",
                        global.name,
                        global.params.len()
                    ),
                    location: global.body.loc,
                });
            }
            let label = self.labels.named(&function_label_name(global.name));
            self.pending.push_back(PendingFunction {
                name: global.name.to_string(),
                label,
                body: FunctionBody::Lambda {
                    params: global.params,
                    body: global.body,
                },
            });
        }

        let start = match target.format {
            ImageFormat::Elf => Some(self.emit_start(main)?),
            ImageFormat::MachO => None,
        };

        let statements = &self.program.statements;
        self.generate_function(PendingFunction {
            name: "main".to_string(),
            label: main,
            body: FunctionBody::Main(statements),
        })?;
        while let Some(next) = self.pending.pop_front() {
            self.generate_function(next)?;
        }
        self.emit_helpers()?;
        self.imports.finalize();

        log::debug!(
            "generated {} function(s), {} bytes of text, {} relocations, {} import(s)",
            self.functions.len(),
            self.text.len(),
            self.relocs.len(),
            self.imports.len()
        );
        Ok(CodeUnit {
            target,
            text: self.text,
            rodata: self.rodata,
            labels: self.labels,
            relocs: self.relocs,
            imports: self.imports,
            entry: main,
            start,
            functions: self.functions,
        })
    }

    /// `_start`: align the stack and call `main`, which never returns.
    fn emit_start(&mut self, main: LabelId) -> CompileResult<LabelId> {
        let start = self.labels.named("_start");
        let offset = self.text.offset();
        self.bind(start)?;
        self.emit_op(MachineOp::AlignSp)?;
        self.call_label(main)?;
        self.emit_op(MachineOp::Trap)?;
        self.functions.push(FunctionSymbol {
            name: "_start".to_string(),
            offset,
            size: self.text.offset() - offset,
        });
        Ok(start)
    }

    // ---------------------------------------------------------------
    // Emission
    // ---------------------------------------------------------------

    fn check_registers(&self, op: &MachineOp) -> CompileResult<()> {
        for reg in op.registers() {
            if self.pool.is_checked_out(reg) || self.func.durable.contains(reg) || self.fixed.contains(reg) {
                continue;
            }
            return Err(CompileError::internal(format!(
                "{}: {} names {reg:?}, which is neither checked out nor assigned",
                self.func.name,
                op.mnemonic()
            )));
        }
        Ok(())
    }

    /// Encode `op` and append it; returns the absolute fixup sites.
    pub(super) fn emit(&mut self, op: MachineOp) -> CompileResult<Vec<(u32, RelocKind)>> {
        self.check_registers(&op)?;
        let mut bytes = Vec::with_capacity(16);
        let fixups = self.encoder.encode(&op, &mut bytes)?;
        let base = self.text.offset();
        self.text.append(&bytes);
        log::trace!("{base:#06x}: {} ({} bytes)", op.mnemonic(), bytes.len());
        Ok(fixups
            .into_iter()
            .map(|fixup| (base + fixup.offset, fixup.kind))
            .collect())
    }

    /// Emit an operation that refers to nothing outside itself.
    pub(super) fn emit_op(&mut self, op: MachineOp) -> CompileResult<()> {
        let sites = self.emit(op)?;
        if sites.is_empty() {
            Ok(())
        } else {
            Err(CompileError::internal("operation with fixups emitted without a target"))
        }
    }

    /// Emit an operation and point every fixup it has at `target`.
    pub(super) fn emit_to(&mut self, op: MachineOp, target: RelocTarget) -> CompileResult<()> {
        let mnemonic = op.mnemonic();
        let sites = self.emit(op)?;
        if sites.is_empty() {
            return Err(CompileError::internal(format!("{mnemonic} produced no relocation site")));
        }
        for (position, kind) in sites {
            self.relocs.record(position, kind, target);
            self.session.record_relocation();
        }
        Ok(())
    }

    pub(super) fn new_label(&mut self, hint: &str) -> LabelId {
        self.next_label += 1;
        self.labels.create(format!(".L{}.{hint}", self.next_label))
    }

    pub(super) fn bind(&mut self, label: LabelId) -> CompileResult<()> {
        self.labels.bind(label, self.text.offset())
    }

    pub(super) fn jump_to(&mut self, label: LabelId) -> CompileResult<()> {
        self.emit_to(MachineOp::Jump, RelocTarget::Label(label))
    }

    pub(super) fn branch_fp_to(&mut self, cond: Cond, lhs: AsmReg, rhs: AsmReg, label: LabelId) -> CompileResult<()> {
        self.emit_to(MachineOp::BranchFp { cond, lhs, rhs }, RelocTarget::Label(label))
    }

    pub(super) fn branch_int_to(&mut self, cond: Cond, lhs: AsmReg, rhs: Operand, label: LabelId) -> CompileResult<()> {
        self.emit_to(MachineOp::BranchInt { cond, lhs, rhs }, RelocTarget::Label(label))
    }

    /// Direct call; only argument registers may be checked out.
    pub(super) fn call_label(&mut self, label: LabelId) -> CompileResult<()> {
        self.pool.check_call_boundary()?;
        self.emit_to(MachineOp::Call, RelocTarget::Label(label))
    }

    pub(super) fn temp(&mut self, bank: RegBank) -> CompileResult<TempReg> {
        self.pool.acquire(bank, TempTag::Scratch)
    }

    pub(super) fn release(&mut self, temp: TempReg) -> CompileResult<()> {
        self.pool.release(temp)
    }

    pub(super) fn fp_mem(&self, offset: i32) -> Mem {
        Mem::new(self.info.fp, offset)
    }

    pub(super) fn sp_mem(&self, offset: i32) -> Mem {
        Mem::new(self.info.sp, offset)
    }

    pub(super) fn acc(&self) -> AsmReg {
        self.info.accumulator
    }

    // ---------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------

    pub(super) fn load_const(&mut self, dst: AsmReg, value: f64) -> CompileResult<()> {
        if value.to_bits() == 0 {
            return self.emit_op(MachineOp::FpZero { dst });
        }
        let before = self.rodata.len();
        let id = self.rodata.add_f64(value);
        self.session.record_rodata(self.rodata.len() - before);
        self.emit_to(MachineOp::LoadConst { dst }, RelocTarget::Rodata(id))
    }

    /// `dst` (a double register) receives the address of `target`.
    pub(super) fn load_address(&mut self, dst: AsmReg, target: RelocTarget) -> CompileResult<()> {
        let addr = self.temp(GP)?;
        self.emit_to(MachineOp::LoadAddr { dst: addr.reg() }, target)?;
        self.emit_op(MachineOp::CvtIntToFp { dst, src: addr.reg() })?;
        self.release(addr)
    }

    fn location(&self, var: VarId) -> CompileResult<Location> {
        self.func.alloc.location(var).ok_or_else(|| {
            CompileError::internal(format!(
                "{}: variable {var} ({}) has no storage",
                self.func.name,
                self.func.scopes.name(var).unwrap_or("?")
            ))
        })
    }

    pub(super) fn load_var(&mut self, var: VarId, dst: AsmReg) -> CompileResult<()> {
        match self.location(var)? {
            Location::Reg(reg) if reg.is_fp() => {
                if reg != dst {
                    self.emit_op(MachineOp::FMov { dst, src: reg })?;
                }
                Ok(())
            }
            Location::Reg(reg) => self.emit_op(MachineOp::BitsToFp { dst, src: reg }),
            Location::Spill(slot) => {
                let mem = self.fp_mem(self.func.frame.spill(slot));
                self.emit_op(MachineOp::Load { dst, mem })
            }
        }
    }

    pub(super) fn store_var(&mut self, var: VarId, src: AsmReg) -> CompileResult<()> {
        match self.location(var)? {
            Location::Reg(reg) if reg.is_fp() => {
                if reg != src {
                    self.emit_op(MachineOp::FMov { dst: reg, src })?;
                }
                Ok(())
            }
            Location::Reg(reg) => self.emit_op(MachineOp::FpToBits { dst: reg, src }),
            Location::Spill(slot) => {
                let mem = self.fp_mem(self.func.frame.spill(slot));
                self.emit_op(MachineOp::Store { src, mem })
            }
        }
    }

    /// Push the accumulator onto the expression stack.
    pub(super) fn push_acc(&mut self) -> CompileResult<()> {
        self.emit_op(MachineOp::AdjustSp { delta: -16 })?;
        let mem = self.sp_mem(0);
        self.emit_op(MachineOp::Store { src: self.acc(), mem })?;
        self.func.stack_depth += 1;
        Ok(())
    }

    pub(super) fn pop_into(&mut self, dst: AsmReg) -> CompileResult<()> {
        let mem = self.sp_mem(0);
        self.emit_op(MachineOp::Load { dst, mem })?;
        self.drop_pushed(1)
    }

    pub(super) fn drop_pushed(&mut self, count: u32) -> CompileResult<()> {
        if count > self.func.stack_depth {
            return Err(CompileError::internal(format!(
                "{}: expression stack underflow",
                self.func.name
            )));
        }
        if count > 0 {
            self.emit_op(MachineOp::AdjustSp {
                delta: 16 * count as i32,
            })?;
        }
        self.func.stack_depth -= count;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Functions
    // ---------------------------------------------------------------

    fn generate_function(&mut self, pending: PendingFunction<'p>) -> CompileResult<()> {
        let PendingFunction { name, label, body } = pending;
        self.session.set_current_function(&name);
        log::debug!("generating {name}");

        let analysis = analyze_function(&body)?;
        let mut regfile = RegisterFile::new(self.info.persistent);
        let alloc = linear_scan::allocate(
            &analysis.intervals,
            analysis.var_count,
            &mut regfile,
            self.info.persistent_bank,
        )
        .map_err(|err| CompileError::internal(format!("{name}: register allocation: {err}")))?;
        self.session.record_spill_slots(alloc.spill_slots as usize);

        let saved: Vec<AsmReg> = alloc.used_regs.iter().collect();
        let frame = FrameLayout::new(
            self.info.saved_area,
            &saved,
            alloc.spill_slots,
            analysis.max_captures,
        );
        let max_frame = self.session.options().max_frame_size;
        if frame.size > max_frame {
            return Err(CompileError::ResourceExhausted {
                reason: format!(
                    "{name}: frame of {} bytes exceeds the {max_frame}-byte limit",
                    frame.size
                ),
            });
        }

        let kind = match body {
            FunctionBody::Main(_) => FunctionKind::Main,
            FunctionBody::Lambda { .. } => FunctionKind::Lambda,
            FunctionBody::Worker { .. } => FunctionKind::Worker,
        };
        let mut state = FunctionState::new(&name, kind, label, &mut self.labels);
        state.durable = alloc.used_regs;
        state.alloc = alloc;
        state.frame = frame;
        state.captures = analysis.parallel_captures.into_iter().collect();
        self.func = state;

        self.text.align(16, self.encoder.padding_byte());
        let offset = self.text.offset();
        self.bind(label)?;
        self.emit_op(MachineOp::EnterFrame {
            frame_size: self.func.frame.size,
        })?;
        for (reg, slot) in self.func.frame.saved.clone() {
            let mem = self.fp_mem(slot);
            self.emit_op(MachineOp::Store { src: reg, mem })?;
        }

        match body {
            FunctionBody::Main(stmts) => {
                self.bind_body()?;
                for stmt in stmts {
                    self.stmt(stmt, false)?;
                }
                self.bind(self.func.return_label)?;
                self.load_const(self.acc(), 0.0)?;
                self.exit_with_acc()?;
            }
            FunctionBody::Lambda { params, body } => {
                for name in params {
                    let var = self.func.scopes.define(name, false, body.loc)?;
                    self.func.params.push(var);
                }
                self.receive_params()?;
                self.bind_body()?;
                self.expr(body, true)?;
                self.emit_return()?;
            }
            FunctionBody::Worker {
                var,
                captures,
                body,
            } => {
                let counter = self.func.scopes.define(var, false, SourceLocation::UNKNOWN)?;
                let end = self.func.scopes.define_hidden(WORKER_END);
                let ctx = self.func.scopes.define_hidden(WORKER_CTX);
                self.func.params = vec![counter, end, ctx];
                self.receive_params()?;
                self.load_captures(ctx, &captures)?;
                self.bind_body()?;
                self.counted_loop(counter, end, body)?;
                self.emit_return()?;
            }
        }

        self.pool.check_all_released()?;
        if self.func.stack_depth != 0 || !self.func.loops.is_empty() {
            return Err(CompileError::internal(format!(
                "{name}: unbalanced expression stack or loop nesting at function end"
            )));
        }
        let size = self.text.offset() - offset;
        self.session.record_function_generated(&name, size as usize);
        self.functions.push(FunctionSymbol { name, offset, size });
        Ok(())
    }

    fn bind_body(&mut self) -> CompileResult<()> {
        self.bind(self.func.body_label)
    }

    /// Move incoming arguments into the parameters' storage.
    fn receive_params(&mut self) -> CompileResult<()> {
        let params = self.func.params.clone();
        for (index, var) in params.into_iter().enumerate() {
            let reg = self.info.fp_args[index];
            if index == 0 {
                self.store_var(var, reg)?;
            } else {
                let arg = self.pool.acquire_specific(reg, TempTag::CallArg)?;
                self.store_var(var, arg.reg())?;
                self.release(arg)?;
            }
        }
        Ok(())
    }

    /// Copy a worker's captured values out of the context block.
    fn load_captures(&mut self, ctx: VarId, captures: &[String]) -> CompileResult<()> {
        if captures.is_empty() {
            return Ok(());
        }
        let value = self.temp(FP)?;
        let base = self.temp(GP)?;
        self.load_var(ctx, value.reg())?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: base.reg(),
            src: value.reg(),
        })?;
        for (index, name) in captures.iter().enumerate() {
            let var = self.func.scopes.define_capture(name);
            self.emit_op(MachineOp::Load {
                dst: value.reg(),
                mem: Mem::new(base.reg(), 8 * index as i32),
            })?;
            self.store_var(var, value.reg())?;
        }
        self.release(base)?;
        self.release(value)
    }

    /// Epilogue of a lambda or worker; the result is in the accumulator.
    fn emit_return(&mut self) -> CompileResult<()> {
        self.bind(self.func.return_label)?;
        for (reg, slot) in self.func.frame.saved.clone() {
            let mem = self.fp_mem(slot);
            self.emit_op(MachineOp::Load { dst: reg, mem })?;
        }
        self.emit_op(MachineOp::LeaveFrame {
            frame_size: self.func.frame.size,
        })?;
        self.emit_op(MachineOp::Ret)
    }

    /// Start a helper routine that owns no variables.
    pub(super) fn begin_helper(&mut self, name: &str, label: LabelId, frame_size: u32) -> CompileResult<u32> {
        self.session.set_current_function(name);
        self.func = FunctionState::new(name, FunctionKind::Helper, label, &mut self.labels);
        self.func.frame.size = frame_size;
        self.text.align(16, self.encoder.padding_byte());
        let offset = self.text.offset();
        self.bind(label)?;
        Ok(offset)
    }

    pub(super) fn end_helper(&mut self, name: &str, offset: u32) -> CompileResult<()> {
        self.pool.check_all_released()?;
        let size = self.text.offset() - offset;
        self.session.record_function_generated(name, size as usize);
        self.functions.push(FunctionSymbol {
            name: name.to_string(),
            offset,
            size,
        });
        Ok(())
    }

    // ---------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------

    pub(super) fn stmt(&mut self, stmt: &'p Stmt, tail: bool) -> CompileResult<()> {
        self.stmt_inner(stmt, tail).map_err(|err| err.at(stmt.loc))
    }

    fn stmt_inner(&mut self, stmt: &'p Stmt, tail: bool) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::Assign { name, mode, value } => self.assign(name, *mode, value, stmt.loc),
            StmtKind::Expr(expr) => self.expr(expr, tail),
            StmtKind::RangeLoop { var, range, body } => {
                self.expr(&range.start, false)?;
                self.push_acc()?;
                self.expr(&range.end, false)?;
                if range.inclusive {
                    self.add_one(self.acc())?;
                }
                self.func.scopes.push();
                let end = self.func.scopes.define_hidden("%end");
                self.store_var(end, self.acc())?;
                self.pop_into(self.acc())?;
                let counter = self.func.scopes.define(var, false, stmt.loc)?;
                self.store_var(counter, self.acc())?;
                self.counted_loop(counter, end, body)?;
                self.func.scopes.pop();
                Ok(())
            }
            StmtKind::EachLoop {
                var,
                collection,
                body,
            } => self.each_loop(var, collection, body, stmt.loc),
            StmtKind::ParallelLoop { var, range, body } => {
                self.parallel_loop(var, range, body, stmt.loc)
            }
            StmtKind::Jump { kind, depth } => self.loop_jump(kind, *depth, stmt.loc),
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.expr(value, self.func.kind == FunctionKind::Lambda)?,
                    None => self.load_const(self.acc(), 0.0)?,
                }
                self.jump_to(self.func.return_label)
            }
        }
    }

    fn assign(&mut self, name: &str, mode: AssignMode, value: &'p Expr, loc: SourceLocation) -> CompileResult<()> {
        let global = self.top_level_global(name, value);
        match global {
            Some(label) => self.load_address(self.acc(), RelocTarget::Label(label))?,
            None => self.expr(value, false)?,
        }
        let var = match mode {
            AssignMode::Define => self.func.scopes.define(name, false, loc)?,
            AssignMode::DefineMutable => self.func.scopes.define(name, true, loc)?,
            AssignMode::Update => self.func.scopes.resolve_update(name, loc)?,
        };
        self.store_var(var, self.acc())
    }

    /// The label of a top-level lambda definition that is generated as a
    /// named function rather than an anonymous one.
    fn top_level_global(&mut self, name: &str, value: &'p Expr) -> Option<LabelId> {
        if self.func.kind != FunctionKind::Main || self.func.scopes.depth() != 1 {
            return None;
        }
        let ExprKind::Lambda { body, .. } = &value.kind else {
            return None;
        };
        let global = self.summary.global(name)?;
        if std::ptr::eq(global.body, body.as_ref()) {
            self.labels.lookup(&function_label_name(name))
        } else {
            None
        }
    }

    pub(super) fn add_one(&mut self, reg: AsmReg) -> CompileResult<()> {
        let one = self.temp(FP)?;
        self.load_const(one.reg(), 1.0)?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Add,
            dst: reg,
            lhs: reg,
            rhs: one.reg(),
        })?;
        self.release(one)
    }

    pub(super) fn scoped_block(&mut self, stmts: &'p [Stmt]) -> CompileResult<()> {
        self.func.scopes.push();
        for stmt in stmts {
            self.stmt(stmt, false)?;
        }
        self.func.scopes.pop();
        Ok(())
    }

    /// Open a loop context whose condition check starts here.
    fn open_loop(&mut self) -> CompileResult<LabelId> {
        let cond = self.new_label("loop");
        let cont = self.new_label("continue");
        let exit = self.new_label("exit");
        self.bind(cond)?;
        let ctx = LoopContext::new(cont, exit, self.text.offset(), self.func.stack_depth);
        self.func.loops.push(ctx);
        Ok(cond)
    }

    /// Emit a conditional branch whose target is the innermost loop's exit.
    fn exit_if(&mut self, op: MachineOp) -> CompileResult<()> {
        let sites = self.emit(op)?;
        let ctx = self
            .func
            .loops
            .innermost_mut()
            .ok_or_else(|| CompileError::internal("loop exit outside a loop"))?;
        for (position, kind) in sites {
            ctx.add_exit(position, kind);
        }
        Ok(())
    }

    fn bind_continue(&mut self) -> CompileResult<()> {
        let label = self
            .func
            .loops
            .innermost_mut()
            .map(|ctx| ctx.continue_label)
            .ok_or_else(|| CompileError::internal("continue target outside a loop"))?;
        self.bind(label)
    }

    /// Jump back to the condition, place the exit label and turn the loop's
    /// deferred sites into relocations.
    fn close_loop(&mut self, cond: LabelId) -> CompileResult<()> {
        self.jump_to(cond)?;
        let ctx = self
            .func
            .loops
            .pop()
            .ok_or_else(|| CompileError::internal("loop stack underflow"))?;
        self.bind(ctx.exit_label)?;
        let drained = ctx.drain_into(&mut self.relocs);
        for _ in 0..drained {
            self.session.record_relocation();
        }
        self.load_const(self.acc(), 0.0)
    }

    /// `counter` runs from its current value up to (excluding) `end`.
    pub(super) fn counted_loop(&mut self, counter: VarId, end: VarId, body: &'p [Stmt]) -> CompileResult<()> {
        let cond = self.open_loop()?;
        let current = self.temp(FP)?;
        let limit = self.temp(FP)?;
        self.load_var(counter, current.reg())?;
        self.load_var(end, limit.reg())?;
        self.exit_if(MachineOp::BranchFp {
            cond: Cond::Ge,
            lhs: current.reg(),
            rhs: limit.reg(),
        })?;
        self.release(limit)?;
        self.release(current)?;

        self.scoped_block(body)?;

        self.bind_continue()?;
        self.load_var(counter, self.acc())?;
        self.add_one(self.acc())?;
        self.store_var(counter, self.acc())?;
        self.close_loop(cond)
    }

    fn each_loop(&mut self, var: &str, collection: &'p Expr, body: &'p [Stmt], loc: SourceLocation) -> CompileResult<()> {
        self.expr(collection, false)?;
        self.func.scopes.push();
        let coll = self.func.scopes.define_hidden("%coll");
        self.store_var(coll, self.acc())?;
        let idx = self.func.scopes.define_hidden("%idx");
        self.load_const(self.acc(), 0.0)?;
        self.store_var(idx, self.acc())?;
        let item = self.func.scopes.define(var, false, loc)?;

        let cond = self.open_loop()?;
        let count = self.temp(FP)?;
        let base = self.temp(GP)?;
        self.load_var(coll, count.reg())?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: base.reg(),
            src: count.reg(),
        })?;
        self.emit_op(MachineOp::Load {
            dst: count.reg(),
            mem: Mem::new(base.reg(), 0),
        })?;
        self.load_var(idx, self.acc())?;
        self.exit_if(MachineOp::BranchFp {
            cond: Cond::Ge,
            lhs: self.acc(),
            rhs: count.reg(),
        })?;
        // value of entry i lives at base + 8 + 16 * i + 8
        let entry = self.temp(GP)?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: entry.reg(),
            src: self.acc(),
        })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Shl,
            dst: entry.reg(),
            lhs: entry.reg(),
            rhs: Operand::Imm(4),
        })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Add,
            dst: entry.reg(),
            lhs: entry.reg(),
            rhs: Operand::Reg(base.reg()),
        })?;
        self.emit_op(MachineOp::Load {
            dst: self.acc(),
            mem: Mem::new(entry.reg(), 16),
        })?;
        self.store_var(item, self.acc())?;
        self.release(entry)?;
        self.release(base)?;
        self.release(count)?;

        self.scoped_block(body)?;

        self.bind_continue()?;
        self.load_var(idx, self.acc())?;
        self.add_one(self.acc())?;
        self.store_var(idx, self.acc())?;
        self.close_loop(cond)?;
        self.func.scopes.pop();
        Ok(())
    }

    fn loop_jump(&mut self, kind: &JumpKind, depth: u32, loc: SourceLocation) -> CompileResult<()> {
        let loop_depth = self.func.loops.at_depth(depth, loc)?.stack_depth;
        let extra = self.func.stack_depth.saturating_sub(loop_depth);
        if extra > 0 {
            // Unwind expression temporaries without changing the static depth:
            // code after the jump still sees them.
            self.emit_op(MachineOp::AdjustSp {
                delta: 16 * extra as i32,
            })?;
        }
        let sites = self.emit(MachineOp::Jump)?;
        let ctx = self.func.loops.at_depth(depth, loc)?;
        for (position, reloc_kind) in sites {
            match kind {
                JumpKind::Break => ctx.add_exit(position, reloc_kind),
                JumpKind::Continue => ctx.add_continue(position, reloc_kind),
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    pub(super) fn expr(&mut self, expr: &'p Expr, tail: bool) -> CompileResult<()> {
        self.expr_inner(expr, tail).map_err(|err| err.at(expr.loc))
    }

    fn expr_inner(&mut self, expr: &'p Expr, tail: bool) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Number(value) => self.load_const(self.acc(), *value),
            ExprKind::Str(value) => self.string_value(value),
            ExprKind::Ident(name) => self.ident(name, expr.loc),
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            ExprKind::Unary { op, operand } => self.unary(*op, operand),
            ExprKind::Match {
                subject,
                arms,
                default,
            } => self.matching(subject, arms, default.as_deref(), tail),
            ExprKind::Lambda { params, body } => self.lambda_value(params, body, expr.loc),
            ExprKind::Call { callee, args } => self.call(callee, args, tail, expr.loc),
            ExprKind::List(items) => self.list_value(items),
            ExprKind::Map(entries) => self.map_value(entries),
            ExprKind::Index { collection, index } => self.index(collection, index),
            ExprKind::ParallelMap { list, func } => self.parallel_map(list, func),
            ExprKind::Block(stmts) => self.block(stmts, tail),
        }
    }

    fn ident(&mut self, name: &str, loc: SourceLocation) -> CompileResult<()> {
        if let Some(symbol) = self.func.scopes.lookup(name) {
            return self.load_var(symbol.var, self.acc());
        }
        if self.summary.global(name).is_some() {
            if let Some(label) = self.labels.lookup(&function_label_name(name)) {
                return self.load_address(self.acc(), RelocTarget::Label(label));
            }
        }
        Err(CompileError::UndefinedVariable {
            name: name.to_string(),
            location: loc,
        })
    }

    fn lambda_value(&mut self, params: &'p [String], body: &'p Expr, loc: SourceLocation) -> CompileResult<()> {
        if params.len() > MAX_PARAMS {
            return Err(CompileError::TypeMismatch {
                reason: format!(
                    "lambda takes {} parameters, at most {MAX_PARAMS} are supported",
                    params.len()
                ),
                location: loc,
            });
        }
        let name = format!("lambda_{}", self.next_lambda);
        self.next_lambda += 1;
        let label = self.labels.named(&name);
        self.pending.push_back(PendingFunction {
            name,
            label,
            body: FunctionBody::Lambda { params, body },
        });
        self.load_address(self.acc(), RelocTarget::Label(label))
    }

    fn block(&mut self, stmts: &'p [Stmt], tail: bool) -> CompileResult<()> {
        if stmts.is_empty() {
            return self.load_const(self.acc(), 0.0);
        }
        self.func.scopes.push();
        let last = stmts.len() - 1;
        for (index, stmt) in stmts.iter().enumerate() {
            self.stmt(stmt, tail && index == last)?;
        }
        self.func.scopes.pop();
        Ok(())
    }

    fn binary(&mut self, op: BinOp, lhs: &'p Expr, rhs: &'p Expr) -> CompileResult<()> {
        self.expr(lhs, false)?;
        self.push_acc()?;
        self.expr(rhs, false)?;
        let left = self.temp(FP)?;
        self.pop_into(left.reg())?;
        self.combine(op, left.reg())?;
        self.release(left)
    }

    /// `acc = left op acc`
    fn combine(&mut self, op: BinOp, left: AsmReg) -> CompileResult<()> {
        let acc = self.acc();
        let arith = |op| MachineOp::Fp {
            op,
            dst: acc,
            lhs: left,
            rhs: acc,
        };
        match op {
            BinOp::Add => self.emit_op(arith(FpOp::Add)),
            BinOp::Sub => self.emit_op(arith(FpOp::Sub)),
            BinOp::Mul => self.emit_op(arith(FpOp::Mul)),
            BinOp::Div => self.emit_op(arith(FpOp::Div)),
            BinOp::Mod => self.remainder(left),
            BinOp::Lt => self.compare(Cond::Lt, left, acc),
            BinOp::Le => self.compare(Cond::Le, left, acc),
            BinOp::Gt => self.compare(Cond::Gt, left, acc),
            BinOp::Ge => self.compare(Cond::Ge, left, acc),
            BinOp::Eq => self.compare(Cond::Eq, left, acc),
            BinOp::Ne => self.compare(Cond::Ne, left, acc),
            BinOp::And | BinOp::Or | BinOp::Xor => self.logical(op, left),
            BinOp::BitAnd => self.bitwise(IntOp::And, left),
            BinOp::BitOr => self.bitwise(IntOp::Or, left),
            BinOp::BitXor => self.bitwise(IntOp::Xor, left),
            BinOp::Shl => self.bitwise(IntOp::Shl, left),
            BinOp::Shr => self.bitwise(IntOp::Sar, left),
            BinOp::Rol => self.bitwise(IntOp::Rol, left),
            BinOp::Ror => self.bitwise(IntOp::Ror, left),
        }
    }

    /// `acc = left - acc * trunc(left / acc)`
    fn remainder(&mut self, left: AsmReg) -> CompileResult<()> {
        let acc = self.acc();
        let quotient = self.temp(FP)?;
        let whole = self.temp(GP)?;
        let q = quotient.reg();
        self.emit_op(MachineOp::Fp {
            op: FpOp::Div,
            dst: q,
            lhs: left,
            rhs: acc,
        })?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: whole.reg(),
            src: q,
        })?;
        self.emit_op(MachineOp::CvtIntToFp {
            dst: q,
            src: whole.reg(),
        })?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Mul,
            dst: q,
            lhs: q,
            rhs: acc,
        })?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Sub,
            dst: acc,
            lhs: left,
            rhs: q,
        })?;
        self.release(whole)?;
        self.release(quotient)
    }

    /// `acc = (lhs cond rhs) ? 1 : 0`
    pub(super) fn compare(&mut self, cond: Cond, lhs: AsmReg, rhs: AsmReg) -> CompileResult<()> {
        let yes = self.new_label("true");
        let done = self.new_label("done");
        self.branch_fp_to(cond, lhs, rhs, yes)?;
        self.load_const(self.acc(), 0.0)?;
        self.jump_to(done)?;
        self.bind(yes)?;
        self.load_const(self.acc(), 1.0)?;
        self.bind(done)
    }

    fn logical(&mut self, op: BinOp, left: AsmReg) -> CompileResult<()> {
        let acc = self.acc();
        let zero = self.temp(FP)?;
        let z = zero.reg();
        self.emit_op(MachineOp::FpZero { dst: z })?;
        let yes = self.new_label("true");
        let no = self.new_label("false");
        let done = self.new_label("done");
        match op {
            BinOp::And => {
                self.branch_fp_to(Cond::Eq, left, z, no)?;
                self.branch_fp_to(Cond::Eq, acc, z, no)?;
                self.jump_to(yes)?;
            }
            BinOp::Or => {
                self.branch_fp_to(Cond::Ne, left, z, yes)?;
                self.branch_fp_to(Cond::Ne, acc, z, yes)?;
                self.jump_to(no)?;
            }
            _ => {
                let left_false = self.new_label("lhs_false");
                self.branch_fp_to(Cond::Eq, left, z, left_false)?;
                self.branch_fp_to(Cond::Eq, acc, z, yes)?;
                self.jump_to(no)?;
                self.bind(left_false)?;
                self.branch_fp_to(Cond::Ne, acc, z, yes)?;
                self.jump_to(no)?;
            }
        }
        self.release(zero)?;
        self.bind(no)?;
        self.load_const(acc, 0.0)?;
        self.jump_to(done)?;
        self.bind(yes)?;
        self.load_const(acc, 1.0)?;
        self.bind(done)
    }

    /// Integer operation on both operands truncated to 64-bit integers.
    fn bitwise(&mut self, op: IntOp, left: AsmReg) -> CompileResult<()> {
        let count_reg = if op.is_shift() { self.info.shift_count } else { None };
        let rhs = match count_reg {
            Some(reg) => self.pool.acquire_specific(reg, TempTag::Scratch)?,
            None => self.temp(GP)?,
        };
        let lhs = self.temp(GP)?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: lhs.reg(),
            src: left,
        })?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: rhs.reg(),
            src: self.acc(),
        })?;
        self.emit_op(MachineOp::Int {
            op,
            dst: lhs.reg(),
            lhs: lhs.reg(),
            rhs: Operand::Reg(rhs.reg()),
        })?;
        self.emit_op(MachineOp::CvtIntToFp {
            dst: self.acc(),
            src: lhs.reg(),
        })?;
        self.release(lhs)?;
        self.release(rhs)
    }

    fn unary(&mut self, op: UnaryOp, operand: &'p Expr) -> CompileResult<()> {
        self.expr(operand, false)?;
        let acc = self.acc();
        match op {
            UnaryOp::Neg => {
                let zero = self.temp(FP)?;
                self.emit_op(MachineOp::FpZero { dst: zero.reg() })?;
                self.emit_op(MachineOp::Fp {
                    op: FpOp::Sub,
                    dst: acc,
                    lhs: zero.reg(),
                    rhs: acc,
                })?;
                self.release(zero)
            }
            UnaryOp::Not => {
                let zero = self.temp(FP)?;
                self.emit_op(MachineOp::FpZero { dst: zero.reg() })?;
                self.compare(Cond::Eq, acc, zero.reg())?;
                self.release(zero)
            }
            UnaryOp::Len => {
                let base = self.temp(GP)?;
                self.emit_op(MachineOp::CvtFpToInt {
                    dst: base.reg(),
                    src: acc,
                })?;
                self.emit_op(MachineOp::Load {
                    dst: acc,
                    mem: Mem::new(base.reg(), 0),
                })?;
                self.release(base)
            }
        }
    }

    /// Arms are tried in order; each one is a test, a conditional branch to
    /// the next arm, the arm body and a jump to the end.
    fn matching(
        &mut self,
        subject: &'p Expr,
        arms: &'p [MatchArm],
        default: Option<&'p Expr>,
        tail: bool,
    ) -> CompileResult<()> {
        self.expr(subject, false)?;
        self.push_acc()?;
        let end = self.new_label("match_end");
        for arm in arms {
            let next = self.new_label("next_arm");
            match &arm.test {
                ArmTest::Truthy => {
                    let value = self.temp(FP)?;
                    let zero = self.temp(FP)?;
                    let mem = self.sp_mem(0);
                    self.emit_op(MachineOp::Load {
                        dst: value.reg(),
                        mem,
                    })?;
                    self.emit_op(MachineOp::FpZero { dst: zero.reg() })?;
                    self.branch_fp_to(Cond::Eq, value.reg(), zero.reg(), next)?;
                    self.release(zero)?;
                    self.release(value)?;
                }
                ArmTest::Equals(pattern) => {
                    self.expr(pattern, false)?;
                    let value = self.temp(FP)?;
                    let mem = self.sp_mem(0);
                    self.emit_op(MachineOp::Load {
                        dst: value.reg(),
                        mem,
                    })?;
                    self.branch_fp_to(Cond::Ne, value.reg(), self.acc(), next)?;
                    self.release(value)?;
                }
                ArmTest::Guard(guard) => {
                    self.expr(guard, false)?;
                    let zero = self.temp(FP)?;
                    self.emit_op(MachineOp::FpZero { dst: zero.reg() })?;
                    self.branch_fp_to(Cond::Eq, self.acc(), zero.reg(), next)?;
                    self.release(zero)?;
                }
            }
            self.expr(&arm.body, tail)?;
            self.jump_to(end)?;
            self.bind(next)?;
        }
        match default {
            Some(default) => self.expr(default, tail)?,
            None => self.load_const(self.acc(), 0.0)?,
        }
        self.bind(end)?;
        self.drop_pushed(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ast::call_stmt;
    use crate::core::test_utils::test::{all_targets, TestContext};

    fn compile(target: Target, program: &Program) -> CompileResult<CodeUnit> {
        let ctx = TestContext::new();
        let session = ctx.session(target);
        generate(&session, program)
    }

    fn linux_x64() -> Target {
        Target::new(crate::core::Arch::X86_64, ImageFormat::Elf)
    }

    #[test]
    fn test_frame_layout_is_aligned() {
        let layout = FrameLayout::new(16, &[AsmReg::fp(8), AsmReg::fp(9)], 3, 2);
        assert_eq!(layout.size % 16, 0);
        assert_eq!(layout.saved, vec![(AsmReg::fp(8), -24), (AsmReg::fp(9), -32)]);
        assert_eq!(layout.spill(0), -56);
        assert_eq!(layout.spill(2), -40);
        assert!(layout.int_slot(INT_SLOTS - 1) < layout.spill(0));
        assert!(layout.print_buffer + PRINT_BUFFER_BYTES <= layout.int_slot(0));
        assert!(-(layout.ctx_base) <= 16 + layout.size as i32);
    }

    #[test]
    fn test_every_target_generates_arithmetic() {
        let program = Program::new(vec![
            Stmt::define_mut(
                "x",
                Expr::binary(BinOp::Add, Expr::num(2.0), Expr::num(2.0)),
            ),
            call_stmt("println", vec![Expr::ident("x")]),
        ]);
        for target in all_targets() {
            let unit = compile(target, &program).unwrap();
            assert!(!unit.text.is_empty(), "{target}");
            assert!(unit.labels.is_bound(unit.entry), "{target}");
            assert_eq!(unit.start.is_some(), target.format == ImageFormat::Elf);
            assert!(unit.labels.lookup("__print_number").is_some());
            assert!(unit.imports.is_empty());
        }
    }

    #[test]
    fn test_undefined_variable_carries_location() {
        let program = Program::new(vec![call_stmt(
            "println",
            vec![Expr::ident("missing").at(3, 9)],
        )]);
        match compile(linux_x64(), &program) {
            Err(CompileError::UndefinedVariable { name, location }) => {
                assert_eq!(name, "missing");
                assert_eq!(location, SourceLocation::new(3, 9));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_immutable_update_is_rejected() {
        let program = Program::new(vec![
            Stmt::define("x", Expr::num(1.0)),
            Stmt::update("x", Expr::num(2.0)).at(2, 1),
        ]);
        assert!(matches!(
            compile(linux_x64(), &program),
            Err(CompileError::ImmutableUpdate { .. })
        ));
    }

    #[test]
    fn test_jump_outside_loop_is_invalid() {
        let program = Program::new(vec![Stmt::brk(1).at(1, 1)]);
        assert!(matches!(
            compile(linux_x64(), &program),
            Err(CompileError::InvalidJump { .. })
        ));
    }

    #[test]
    fn test_rotate_unsupported_on_riscv() {
        let target = Target::new(crate::core::Arch::Riscv64, ImageFormat::Elf);
        let program = Program::new(vec![Stmt::define(
            "r",
            Expr::binary(BinOp::Rol, Expr::num(1.0), Expr::num(3.0)).at(1, 5),
        )]);
        match compile(target, &program) {
            Err(CompileError::UnsupportedOperation { location, .. }) => {
                assert_eq!(location, SourceLocation::new(1, 5));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(compile(linux_x64(), &program).is_ok());
    }

    #[test]
    fn test_loop_sites_become_relocations() {
        let program = Program::new(vec![
            Stmt::define_mut("sum", Expr::num(0.0)),
            Stmt::range_loop(
                "i",
                Expr::num(0.0),
                Expr::num(100.0),
                false,
                vec![
                    Stmt::expr(Expr::if_else(
                        Expr::binary(BinOp::Eq, Expr::ident("i"), Expr::num(50.0)),
                        Expr::block(vec![Stmt::cont(1)]),
                        Expr::num(0.0),
                    )),
                    Stmt::update(
                        "sum",
                        Expr::binary(BinOp::Add, Expr::ident("sum"), Expr::ident("i")),
                    ),
                ],
            ),
        ]);
        for target in all_targets() {
            let unit = compile(target, &program).unwrap();
            for reloc in unit.relocs.iter() {
                assert!((reloc.position as usize) < unit.text.len(), "{target}");
                if let RelocTarget::Label(label) = reloc.target {
                    assert!(unit.labels.is_bound(label), "{target}: {}", unit.labels.name(label));
                }
            }
        }
    }

    #[test]
    fn test_global_lambdas_get_named_labels() {
        let program = Program::new(vec![
            Stmt::define(
                "twice",
                Expr::lambda(&["x"], Expr::binary(BinOp::Mul, Expr::ident("x"), Expr::num(2.0))),
            ),
            call_stmt("println", vec![Expr::call("twice", vec![Expr::num(21.0)])]),
        ]);
        let unit = compile(linux_x64(), &program).unwrap();
        let twice = unit.labels.lookup("twice").unwrap();
        assert!(unit.labels.is_bound(twice));
        assert!(unit.functions.iter().any(|f| f.name == "twice"));
        assert!(unit.labels.lookup("lambda_0").is_none());
    }
}
