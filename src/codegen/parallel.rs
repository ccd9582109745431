// This module lowers parallel loops. The loop body becomes a separate worker function
// taking (first index, end index, context address); the context is a block in the parent's
// frame holding the captured variables by value. On Linux the parent maps one region for
// all worker stacks, writes a descriptor at the top of each stack and starts each worker
// with a raw clone system call sharing the address space. The child, whose stack pointer
// is the descriptor, branches to `__thread_entry`, which calls the worker, decrements the
// shared counter atomically, wakes the parent and exits the thread. The parent sleeps on
// the counter with futex until every worker is done, then unmaps the stacks. Targets
// without thread support run the worker once, on the calling thread, over the full range.

//! Parallel loops and the thread runtime.

use super::analysis::FunctionBody;
use super::ast::{Range, Stmt};
use super::calls::SysArg;
use super::generator::{CodeGenerator, PendingFunction};
use super::runtime::{anonymous_private, Helper, PROT_READ_WRITE};
use crate::arch::{Cond, FpOp, IntOp, MachineOp, Mem, Operand};
use crate::core::{AsmReg, CompileError, CompileResult, LabelId, RelocTarget, SourceLocation, TempTag, FP, GP};

/// `CLONE_VM | CLONE_FS | CLONE_FILES | CLONE_SIGHAND | CLONE_THREAD | CLONE_SYSVSEM`
pub const CLONE_THREAD_FLAGS: i64 = 0x50F00;
pub const FUTEX_WAIT_PRIVATE: i64 = 128;
pub const FUTEX_WAKE_PRIVATE: i64 = 129;

/// Bytes reserved at the top of each worker stack for its descriptor.
pub const DESCRIPTOR_BYTES: i64 = 64;

/// Field offsets in a worker descriptor.
mod desc {
    pub const START: i32 = 0;
    pub const END: i32 = 8;
    pub const CTX: i32 = 16;
    pub const COUNTER: i32 = 24;
    pub const WORKER: i32 = 40;
}

// Parent frame integer slots used while workers run.
const COUNTER_SLOT: u32 = 0;
const REGION_SLOT: u32 = 1;
const DESC_SLOT: u32 = 2;

impl<'s, 'a, 'p> CodeGenerator<'s, 'a, 'p> {
    pub(super) fn parallel_loop(
        &mut self,
        var: &'p str,
        range: &'p Range,
        body: &'p [Stmt],
        loc: SourceLocation,
    ) -> CompileResult<()> {
        let captures = self.func.captures.pop_front().ok_or_else(|| {
            CompileError::internal(format!("{}: parallel loop without capture list", self.func.name))
        })?;

        // stack: start, end
        self.expr(&range.start, false)?;
        self.push_acc()?;
        self.expr(&range.end, false)?;
        if range.inclusive {
            self.add_one(self.acc())?;
        }
        self.push_acc()?;

        for (index, name) in captures.iter().enumerate() {
            let symbol = self.func.scopes.resolve(name, loc)?;
            self.load_var(symbol.var, self.acc())?;
            let mem = self.fp_mem(self.func.frame.ctx_base + 8 * index as i32);
            self.emit_op(MachineOp::Store {
                src: self.acc(),
                mem,
            })?;
        }

        let name = format!("{}.worker{}", self.func.name, self.func.workers);
        self.func.workers += 1;
        let worker = self.labels.named(&name);
        log::debug!("{}: parallel loop over '{var}' as {name} capturing {captures:?}", self.func.name);
        self.pending.push_back(PendingFunction {
            name,
            label: worker,
            body: FunctionBody::Worker {
                var,
                captures,
                body,
            },
        });

        let threads = self.session.options().parallel_workers;
        let threaded = self.info.syscalls.clone.is_some() && self.info.syscalls.futex.is_some() && threads > 1;
        if threaded {
            self.spawn_workers(worker, threads)?;
        } else {
            self.run_worker_inline(worker)?;
        }
        self.drop_pushed(2)?;
        self.load_const(self.acc(), 0.0)
    }

    fn ctx_address(&mut self, dst: AsmReg) -> CompileResult<()> {
        let mem = self.fp_mem(self.func.frame.ctx_base);
        self.emit_op(MachineOp::Lea { dst, mem })
    }

    /// Call the worker over the whole range on this thread.
    fn run_worker_inline(&mut self, worker: LabelId) -> CompileResult<()> {
        let end = self.pool.acquire_specific(self.info.fp_args[1], TempTag::CallArg)?;
        let ctx = self.pool.acquire_specific(self.info.fp_args[2], TempTag::CallArg)?;
        self.emit_op(MachineOp::Load {
            dst: end.reg(),
            mem: self.sp_mem(0),
        })?;
        let addr = self.temp(GP)?;
        self.ctx_address(addr.reg())?;
        self.emit_op(MachineOp::CvtIntToFp {
            dst: ctx.reg(),
            src: addr.reg(),
        })?;
        self.release(addr)?;
        self.emit_op(MachineOp::Load {
            dst: self.acc(),
            mem: self.sp_mem(16),
        })?;
        self.call_label(worker)?;
        self.release(ctx)?;
        self.release(end)
    }

    fn spawn_workers(&mut self, worker: LabelId, threads: u32) -> CompileResult<()> {
        let stack_size = (self.session.options().worker_stack_size as i64 + 15) & !15;
        let region_bytes = stack_size * i64::from(threads);
        let counter = self.fp_mem(self.func.frame.int_slot(COUNTER_SLOT));
        let region = self.fp_mem(self.func.frame.int_slot(REGION_SLOT));
        let desc_slot = self.fp_mem(self.func.frame.int_slot(DESC_SLOT));
        let (clone, futex) = match (self.info.syscalls.clone, self.info.syscalls.futex) {
            (Some(clone), Some(futex)) => (clone, futex),
            _ => return Err(CompileError::internal("thread system calls unavailable")),
        };
        let entry = self.request_helper(Helper::ThreadEntry);
        let skip = self.new_label("parallel_skip");

        // chunk = trunc((end - start + T - 1) / T), nothing to do when end <= start
        {
            let span = self.temp(FP)?;
            let other = self.temp(FP)?;
            let via = self.temp(GP)?;
            let (s, o) = (span.reg(), other.reg());
            self.emit_op(MachineOp::Load { dst: o, mem: self.sp_mem(16) })?;
            self.emit_op(MachineOp::Load { dst: s, mem: self.sp_mem(0) })?;
            self.branch_fp_to(Cond::Le, s, o, skip)?;
            self.emit_op(MachineOp::Fp { op: FpOp::Sub, dst: s, lhs: s, rhs: o })?;
            self.load_const(o, f64::from(threads - 1))?;
            self.emit_op(MachineOp::Fp { op: FpOp::Add, dst: s, lhs: s, rhs: o })?;
            self.load_const(o, f64::from(threads))?;
            self.emit_op(MachineOp::Fp { op: FpOp::Div, dst: s, lhs: s, rhs: o })?;
            self.trunc(s, s, via.reg())?;
            self.emit_op(MachineOp::FMov { dst: self.acc(), src: s })?;
            self.release(via)?;
            self.release(other)?;
            self.release(span)?;
        }
        // stack: start, end, chunk
        self.push_acc()?;

        let count = self.temp(GP)?;
        self.emit_op(MachineOp::MovImm {
            dst: count.reg(),
            imm: i64::from(threads),
        })?;
        self.emit_op(MachineOp::Store {
            src: count.reg(),
            mem: counter,
        })?;
        self.release(count)?;

        let mapped = self.emit_syscall(
            self.info.syscalls.mmap,
            &[
                SysArg::Imm(0),
                SysArg::Imm(region_bytes),
                SysArg::Imm(PROT_READ_WRITE),
                SysArg::Imm(anonymous_private(self.session.target().format)),
                SysArg::Imm(-1),
                SysArg::Imm(0),
            ],
        )?;
        self.emit_op(MachineOp::Store {
            src: mapped.reg(),
            mem: region,
        })?;
        self.release(mapped)?;

        for index in 0..threads {
            let top = stack_size * i64::from(index + 1) - DESCRIPTOR_BYTES;
            self.write_descriptor(index, top, worker)?;
            let child = self.emit_syscall(
                clone,
                &[
                    SysArg::Imm(CLONE_THREAD_FLAGS),
                    SysArg::Mem(desc_slot),
                    SysArg::Imm(0),
                    SysArg::Imm(0),
                    SysArg::Imm(0),
                ],
            )?;
            // The child resumes here with its stack pointer on the descriptor.
            self.branch_int_to(Cond::Eq, child.reg(), Operand::Imm(0), entry)?;
            let spawned = self.new_label("spawned");
            self.branch_int_to(Cond::Gt, child.reg(), Operand::Imm(0), spawned)?;
            self.release(child)?;
            self.run_descriptor_inline()?;
            self.bind(spawned)?;
        }

        let wait = self.new_label("join");
        let joined = self.new_label("joined");
        self.bind(wait)?;
        let pending = self.temp(GP)?;
        self.emit_op(MachineOp::Load {
            dst: pending.reg(),
            mem: counter,
        })?;
        self.branch_int_to(Cond::Eq, pending.reg(), Operand::Imm(0), joined)?;
        self.release(pending)?;
        let woken = self.emit_syscall(
            futex,
            &[
                SysArg::Addr(counter),
                SysArg::Imm(FUTEX_WAIT_PRIVATE),
                SysArg::Mem(counter),
                SysArg::Imm(0),
                SysArg::Imm(0),
                SysArg::Imm(0),
            ],
        )?;
        self.release(woken)?;
        self.jump_to(wait)?;
        self.bind(joined)?;

        let unmapped = self.emit_syscall(
            self.info.syscalls.munmap,
            &[SysArg::Mem(region), SysArg::Imm(region_bytes)],
        )?;
        self.release(unmapped)?;
        self.drop_pushed(1)?;
        self.bind(skip)
    }

    /// Fill the descriptor of worker `index` at `region + top` and leave its
    /// address in the descriptor slot. The stack holds start, end, chunk.
    fn write_descriptor(&mut self, index: u32, top: i64, worker: LabelId) -> CompileResult<()> {
        let addr = self.temp(GP)?;
        let scratch = self.temp(GP)?;
        let first = self.temp(FP)?;
        let other = self.temp(FP)?;
        let (d, g, a, b) = (addr.reg(), scratch.reg(), first.reg(), other.reg());
        let field = |offset: i32| Mem::new(d, offset);

        self.emit_op(MachineOp::Load {
            dst: d,
            mem: self.fp_mem(self.func.frame.int_slot(REGION_SLOT)),
        })?;
        self.emit_op(MachineOp::MovImm { dst: g, imm: top })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Add,
            dst: d,
            lhs: d,
            rhs: Operand::Reg(g),
        })?;
        self.emit_op(MachineOp::Store {
            src: d,
            mem: self.fp_mem(self.func.frame.int_slot(DESC_SLOT)),
        })?;

        // first = start + index * chunk
        self.emit_op(MachineOp::Load { dst: a, mem: self.sp_mem(0) })?;
        self.load_const(b, f64::from(index))?;
        self.emit_op(MachineOp::Fp { op: FpOp::Mul, dst: a, lhs: a, rhs: b })?;
        self.emit_op(MachineOp::Load { dst: b, mem: self.sp_mem(32) })?;
        self.emit_op(MachineOp::Fp { op: FpOp::Add, dst: a, lhs: a, rhs: b })?;
        self.emit_op(MachineOp::Store { src: a, mem: field(desc::START) })?;

        // last = min(first + chunk, end)
        self.emit_op(MachineOp::Load { dst: b, mem: self.sp_mem(0) })?;
        self.emit_op(MachineOp::Fp { op: FpOp::Add, dst: a, lhs: a, rhs: b })?;
        self.emit_op(MachineOp::Load { dst: b, mem: self.sp_mem(16) })?;
        let in_range = self.new_label("chunk_end");
        self.branch_fp_to(Cond::Le, a, b, in_range)?;
        self.emit_op(MachineOp::FMov { dst: a, src: b })?;
        self.bind(in_range)?;
        self.emit_op(MachineOp::Store { src: a, mem: field(desc::END) })?;

        self.ctx_address(g)?;
        self.emit_op(MachineOp::CvtIntToFp { dst: a, src: g })?;
        self.emit_op(MachineOp::Store { src: a, mem: field(desc::CTX) })?;
        self.emit_op(MachineOp::Lea {
            dst: g,
            mem: self.fp_mem(self.func.frame.int_slot(COUNTER_SLOT)),
        })?;
        self.emit_op(MachineOp::Store { src: g, mem: field(desc::COUNTER) })?;
        self.emit_to(MachineOp::LoadAddr { dst: g }, RelocTarget::Label(worker))?;
        self.emit_op(MachineOp::Store { src: g, mem: field(desc::WORKER) })?;

        self.release(other)?;
        self.release(first)?;
        self.release(scratch)?;
        self.release(addr)
    }

    /// Clone failed: run the described chunk here and count it as done.
    fn run_descriptor_inline(&mut self) -> CompileResult<()> {
        let end = self.pool.acquire_specific(self.info.fp_args[1], TempTag::CallArg)?;
        let ctx = self.pool.acquire_specific(self.info.fp_args[2], TempTag::CallArg)?;
        let target = self.pool.acquire(GP, TempTag::CallArg)?;
        let base = self.temp(GP)?;
        let d = base.reg();
        self.emit_op(MachineOp::Load {
            dst: d,
            mem: self.fp_mem(self.func.frame.int_slot(DESC_SLOT)),
        })?;
        self.load_descriptor(d, end.reg(), ctx.reg(), target.reg())?;
        self.release(base)?;
        self.pool.check_call_boundary()?;
        self.emit_op(MachineOp::CallReg { target: target.reg() })?;
        self.release(target)?;
        self.release(ctx)?;
        self.release(end)?;

        let addr = self.temp(GP)?;
        let delta = self.temp(GP)?;
        let old = self.temp(GP)?;
        self.emit_op(MachineOp::Lea {
            dst: addr.reg(),
            mem: self.fp_mem(self.func.frame.int_slot(COUNTER_SLOT)),
        })?;
        self.emit_op(MachineOp::MovImm { dst: delta.reg(), imm: -1 })?;
        self.emit_op(MachineOp::AtomicAdd {
            addr: addr.reg(),
            value: delta.reg(),
            result: old.reg(),
        })?;
        self.release(old)?;
        self.release(delta)?;
        self.release(addr)
    }

    /// Worker arguments and address from the descriptor at `base`.
    fn load_descriptor(
        &mut self,
        base: AsmReg,
        end: AsmReg,
        ctx: AsmReg,
        target: AsmReg,
    ) -> CompileResult<()> {
        self.emit_op(MachineOp::Load {
            dst: self.acc(),
            mem: Mem::new(base, desc::START),
        })?;
        self.emit_op(MachineOp::Load {
            dst: end,
            mem: Mem::new(base, desc::END),
        })?;
        self.emit_op(MachineOp::Load {
            dst: ctx,
            mem: Mem::new(base, desc::CTX),
        })?;
        self.emit_op(MachineOp::Load {
            dst: target,
            mem: Mem::new(base, desc::WORKER),
        })
    }

    /// Entered by a new thread with the stack pointer on its descriptor.
    pub(super) fn emit_thread_entry(&mut self, label: LabelId) -> CompileResult<()> {
        let name = Helper::ThreadEntry.symbol();
        let start = self.begin_helper(name, label, 0)?;
        let (futex, exit) = match self.info.syscalls.futex {
            Some(futex) => (futex, self.info.syscalls.exit),
            None => return Err(CompileError::internal("thread entry on a target without futex")),
        };

        let end = self.pool.acquire_specific(self.info.fp_args[1], TempTag::CallArg)?;
        let ctx = self.pool.acquire_specific(self.info.fp_args[2], TempTag::CallArg)?;
        let target = self.pool.acquire(GP, TempTag::CallArg)?;
        self.load_descriptor(self.info.sp, end.reg(), ctx.reg(), target.reg())?;
        self.pool.check_call_boundary()?;
        self.emit_op(MachineOp::CallReg { target: target.reg() })?;
        self.release(target)?;
        self.release(ctx)?;
        self.release(end)?;

        // Everything the exit path needs is in registers before the counter
        // drops: the parent may unmap this stack right after.
        let addr = self.pool.acquire_specific(self.info.syscall_args[0], TempTag::Syscall)?;
        let op = self.pool.acquire_specific(self.info.syscall_args[1], TempTag::Syscall)?;
        let value = self.pool.acquire_specific(self.info.syscall_args[2], TempTag::Syscall)?;
        let nr = self.pool.acquire_specific(self.info.syscall_nr, TempTag::Syscall)?;
        self.emit_op(MachineOp::Load {
            dst: addr.reg(),
            mem: self.sp_mem(desc::COUNTER),
        })?;
        self.emit_op(MachineOp::MovImm { dst: value.reg(), imm: -1 })?;
        // The old count lands in `op`, which is reloaded below.
        self.emit_op(MachineOp::AtomicAdd {
            addr: addr.reg(),
            value: value.reg(),
            result: op.reg(),
        })?;
        self.emit_op(MachineOp::MovImm { dst: nr.reg(), imm: futex })?;
        self.emit_op(MachineOp::MovImm { dst: op.reg(), imm: FUTEX_WAKE_PRIVATE })?;
        self.emit_op(MachineOp::MovImm {
            dst: value.reg(),
            imm: i64::from(i32::MAX),
        })?;
        self.emit_op(MachineOp::Syscall)?;
        self.emit_op(MachineOp::MovImm { dst: nr.reg(), imm: exit })?;
        self.emit_op(MachineOp::MovImm { dst: addr.reg(), imm: 0 })?;
        self.emit_op(MachineOp::Syscall)?;
        self.emit_op(MachineOp::Trap)?;
        for reg in [nr, value, op, addr] {
            self.release(reg)?;
        }
        self.end_helper(name, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ast::{call_stmt, BinOp, Expr, Program};
    use crate::codegen::generator::generate;
    use crate::core::test_utils::test::TestContext;
    use crate::core::{Arch, ImageFormat, Target};

    fn parallel_program() -> Program {
        Program::new(vec![
            Stmt::define("scale", Expr::num(3.0)),
            Stmt::parallel_loop(
                "i",
                Expr::num(0.0),
                Expr::num(8.0),
                false,
                vec![call_stmt(
                    "println",
                    vec![Expr::binary(BinOp::Mul, Expr::ident("i"), Expr::ident("scale"))],
                )],
            ),
        ])
    }

    #[test]
    fn test_linux_spawns_thread_entry() {
        let ctx = TestContext::new();
        let session = ctx.session(Target::new(Arch::X86_64, ImageFormat::Elf));
        let program = parallel_program();
        let unit = generate(&session, &program).unwrap();
        assert!(unit.functions.iter().any(|f| f.name == "main.worker0"));
        assert!(unit.functions.iter().any(|f| f.name == "__thread_entry"));
        assert!(unit.imports.is_empty());
    }

    #[test]
    fn test_darwin_runs_worker_inline() {
        let ctx = TestContext::new();
        let session = ctx.session(Target::new(Arch::Arm64, ImageFormat::MachO));
        let program = parallel_program();
        let unit = generate(&session, &program).unwrap();
        assert!(unit.functions.iter().any(|f| f.name == "main.worker0"));
        assert!(!unit.functions.iter().any(|f| f.name == "__thread_entry"));
    }

    #[test]
    fn test_captures_cannot_be_updated() {
        let ctx = TestContext::new();
        let session = ctx.linux_x64();
        let program = Program::new(vec![
            Stmt::define_mut("total", Expr::num(0.0)),
            Stmt::parallel_loop(
                "i",
                Expr::num(0.0),
                Expr::num(4.0),
                false,
                vec![Stmt::update(
                    "total",
                    Expr::binary(BinOp::Add, Expr::ident("total"), Expr::ident("i")),
                )],
            ),
        ]);
        assert!(matches!(
            generate(&session, &program),
            Err(CompileError::ImmutableUpdate { .. })
        ));
    }
}
