// This module handles every form of call. A callee name resolves in a fixed order: the
// tail self-reference `me`, then a local variable holding a function address (an indirect
// call), then a top-level lambda (a direct call to its label), then a builtin, and finally
// an external C function reached through the import table. Language functions take up to
// six doubles in the floating-point argument registers and return in the accumulator.
// C functions are called through the import signature table, which decides per argument
// whether the value travels as an integer, a double or a literal string address, and how
// the result comes back. System calls are issued through emit_syscall, which checks the
// syscall registers out of the transient pool by name so no live temporary can be
// clobbered.

//! Calls, builtins, C imports and system calls.

use super::ast::{Expr, ExprKind};
use super::generator::{function_label_name, CodeGenerator, FunctionKind, MAX_PARAMS};
use super::runtime::Helper;
use crate::arch::{Cond, IntOp, MachineOp, Mem, Operand};
use crate::core::{
    AsmReg, CompileError, CompileResult, DataId, ImageFormat, ImportId, RelocTarget,
    SourceLocation, Target, TempReg, TempTag, VarId, FP, GP,
};

/// Functions the compiler implements itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Println,
    Print,
    Printf,
    Exit,
    Sqrt,
    Syscall,
    Getpid,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "println" => Builtin::Println,
            "print" => Builtin::Print,
            "printf" => Builtin::Printf,
            "exit" => Builtin::Exit,
            "sqrt" => Builtin::Sqrt,
            "syscall" => Builtin::Syscall,
            "getpid" => Builtin::Getpid,
            _ => return None,
        })
    }

    /// Whether the builtin is lowered to a call into the C runtime.
    pub fn needs_import(self) -> bool {
        matches!(self, Builtin::Printf | Builtin::Getpid)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Println => "println",
            Builtin::Print => "print",
            Builtin::Printf => "printf",
            Builtin::Exit => "exit",
            Builtin::Sqrt => "sqrt",
            Builtin::Syscall => "syscall",
            Builtin::Getpid => "getpid",
        }
    }
}

/// C-level type of an argument or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CType {
    /// Truncated to a 64-bit integer.
    Int,
    Double,
    /// Address of a literal string.
    Str,
    /// Integer truth value printed as `yes`/`no` (printf `%b`).
    Bool,
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSignature {
    pub name: &'static str,
    pub params: &'static [CType],
    pub ret: CType,
    pub variadic: bool,
    /// Part of libm rather than libc on ELF systems.
    pub libm: bool,
}

const fn sig(name: &'static str, params: &'static [CType], ret: CType) -> ImportSignature {
    ImportSignature {
        name,
        params,
        ret,
        variadic: false,
        libm: false,
    }
}

const fn math(name: &'static str, params: &'static [CType]) -> ImportSignature {
    ImportSignature {
        name,
        params,
        ret: CType::Double,
        variadic: false,
        libm: true,
    }
}

use CType::{Double, Int, Str, Void};

static SIGNATURES: &[ImportSignature] = &[
    ImportSignature {
        name: "printf",
        params: &[Str],
        ret: Int,
        variadic: true,
        libm: false,
    },
    sig("puts", &[Str], Int),
    sig("putchar", &[Int], Int),
    sig("getpid", &[], Int),
    sig("exit", &[Int], Void),
    sig("sleep", &[Int], Int),
    sig("usleep", &[Int], Int),
    sig("abs", &[Int], Int),
    sig("rand", &[], Int),
    sig("srand", &[Int], Void),
    sig("fflush", &[Int], Int),
    math("sin", &[Double]),
    math("cos", &[Double]),
    math("tan", &[Double]),
    math("atan", &[Double]),
    math("atan2", &[Double, Double]),
    math("exp", &[Double]),
    math("log", &[Double]),
    math("log10", &[Double]),
    math("pow", &[Double, Double]),
    math("floor", &[Double]),
    math("ceil", &[Double]),
    math("round", &[Double]),
    math("fabs", &[Double]),
    math("fmod", &[Double, Double]),
];

/// Look up the C signature of `name`.
pub fn import_signature(name: &str) -> Option<&'static ImportSignature> {
    SIGNATURES.iter().find(|s| s.name == name)
}

/// Library providing `name` on `target`.
pub fn import_library(target: Target, name: &str) -> &'static str {
    match target.format {
        ImageFormat::MachO => "/usr/lib/libSystem.B.dylib",
        ImageFormat::Elf => match import_signature(name) {
            Some(sig) if sig.libm => "libm.so.6",
            _ => "libc.so.6",
        },
    }
}

/// One system call argument. Memory operands are based on the frame or
/// stack pointer only, so loading them never needs another register.
#[derive(Debug, Clone, Copy)]
pub enum SysArg {
    Imm(i64),
    /// 8-byte integer in memory.
    Mem(Mem),
    /// Double in memory, truncated.
    FpMem(Mem),
    /// Address of a memory operand.
    Addr(Mem),
    Rodata(DataId),
}

/// How one printf argument is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marshal {
    /// Value on the expression stack, converted to `CType`.
    Stacked(CType, u32),
    /// A literal string in rodata.
    Literal(DataId),
}

impl<'s, 'a, 'p> CodeGenerator<'s, 'a, 'p> {
    pub(super) fn call(&mut self, callee: &str, args: &'p [Expr], tail: bool, loc: SourceLocation) -> CompileResult<()> {
        if callee == "me" {
            return self.self_call(args, tail, loc);
        }
        if let Some(symbol) = self.func.scopes.lookup(callee) {
            return self.indirect_call(symbol.var, args, loc);
        }
        if let Some(global) = self.summary.global(callee) {
            let arity = global.params.len();
            if let Some(label) = self.labels.lookup(&function_label_name(callee)) {
                self.check_arity(callee, arity, args.len(), loc)?;
                let held = self.pass_fp_args(args)?;
                self.call_label(label)?;
                return self.release_all(held);
            }
        }
        if let Some(builtin) = Builtin::from_name(callee) {
            return self.builtin(builtin, args, loc);
        }
        self.import_call(callee, args, loc)
    }

    fn check_arity(&self, callee: &str, expected: usize, got: usize, loc: SourceLocation) -> CompileResult<()> {
        if expected != got {
            return Err(CompileError::TypeMismatch {
                reason: format!("'{callee}' takes {expected} argument(s), {got} given"),
                location: loc,
            });
        }
        Ok(())
    }

    fn check_arg_limit(&self, callee: &str, got: usize, loc: SourceLocation) -> CompileResult<()> {
        if got > MAX_PARAMS {
            return Err(CompileError::TypeMismatch {
                reason: format!("'{callee}' called with {got} arguments, at most {MAX_PARAMS} are supported"),
                location: loc,
            });
        }
        Ok(())
    }

    /// Evaluate `args` left to right and move them into the double argument
    /// registers; the first one ends up in the accumulator.
    fn pass_fp_args(&mut self, args: &'p [Expr]) -> CompileResult<Vec<TempReg>> {
        for arg in args {
            self.expr(arg, false)?;
            self.push_acc()?;
        }
        let mut held = Vec::with_capacity(args.len());
        for index in (0..args.len()).rev() {
            if index == 0 {
                self.pop_into(self.acc())?;
            } else {
                let reg = self.pool.acquire_specific(self.info.fp_args[index], TempTag::CallArg)?;
                self.pop_into(reg.reg())?;
                held.push(reg);
            }
        }
        Ok(held)
    }

    pub(super) fn release_all(&mut self, held: Vec<TempReg>) -> CompileResult<()> {
        for reg in held {
            self.release(reg)?;
        }
        Ok(())
    }

    /// `me(args)`: a jump back to the body in tail position, a plain
    /// recursive call elsewhere.
    fn self_call(&mut self, args: &'p [Expr], tail: bool, loc: SourceLocation) -> CompileResult<()> {
        if self.func.kind != FunctionKind::Lambda {
            return Err(CompileError::UndefinedVariable {
                name: "me".to_string(),
                location: loc,
            });
        }
        self.check_arity("me", self.func.params.len(), args.len(), loc)?;
        if !tail {
            let held = self.pass_fp_args(args)?;
            self.call_label(self.func.self_label)?;
            return self.release_all(held);
        }

        for arg in args {
            self.expr(arg, false)?;
            self.push_acc()?;
        }
        let params = self.func.params.clone();
        for &param in params.iter().rev() {
            self.pop_into(self.acc())?;
            self.store_var(param, self.acc())?;
        }
        let pending = self.func.stack_depth;
        if pending > 0 {
            // Only this path leaves; the enclosing expression still
            // accounts for its pushes.
            self.emit_op(MachineOp::AdjustSp {
                delta: 16 * pending as i32,
            })?;
        }
        log::trace!("{}: tail self-call", self.func.name);
        self.jump_to(self.func.body_label)
    }

    /// Call through a variable holding a function address.
    fn indirect_call(&mut self, var: VarId, args: &'p [Expr], loc: SourceLocation) -> CompileResult<()> {
        self.check_arg_limit("indirect call", args.len(), loc)?;
        self.load_var(var, self.acc())?;
        self.push_acc()?;
        let held = self.pass_fp_args(args)?;
        let target = self.pool.acquire(GP, TempTag::CallArg)?;
        let value = self.temp(FP)?;
        let mem = self.sp_mem(0);
        self.emit_op(MachineOp::Load {
            dst: value.reg(),
            mem,
        })?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: target.reg(),
            src: value.reg(),
        })?;
        self.release(value)?;
        self.drop_pushed(1)?;
        self.pool.check_call_boundary()?;
        self.emit_op(MachineOp::CallReg {
            target: target.reg(),
        })?;
        self.release(target)?;
        self.release_all(held)
    }

    fn builtin(&mut self, builtin: Builtin, args: &'p [Expr], loc: SourceLocation) -> CompileResult<()> {
        match builtin {
            Builtin::Println | Builtin::Print => {
                let newline = builtin == Builtin::Println;
                match args {
                    [] if newline => self.write_literal("\n"),
                    [arg] => match &arg.kind {
                        ExprKind::Str(text) if newline => self.write_literal(&format!("{text}\n")),
                        ExprKind::Str(text) => self.write_literal(text),
                        _ => {
                            self.expr(arg, false)?;
                            self.print_acc(newline)
                        }
                    },
                    _ => Err(CompileError::TypeMismatch {
                        reason: format!("'{}' takes one argument, {} given", builtin.name(), args.len()),
                        location: loc,
                    }),
                }
            }
            Builtin::Printf => self.printf(args, loc),
            Builtin::Exit => {
                match args {
                    [] => self.load_const(self.acc(), 0.0)?,
                    [code] => self.expr(code, false)?,
                    _ => self.check_arity("exit", 1, args.len(), loc)?,
                }
                self.exit_with_acc()
            }
            Builtin::Sqrt => {
                self.check_arity("sqrt", 1, args.len(), loc)?;
                self.expr(&args[0], false)?;
                self.emit_op(MachineOp::FpSqrt {
                    dst: self.acc(),
                    src: self.acc(),
                })
            }
            Builtin::Syscall => self.raw_syscall(args, loc),
            Builtin::Getpid => {
                self.check_arity("getpid", 0, args.len(), loc)?;
                self.import_call("getpid", args, loc)
            }
        }
    }

    // ---------------------------------------------------------------
    // System calls
    // ---------------------------------------------------------------

    fn load_sys_arg(&mut self, dst: AsmReg, arg: SysArg) -> CompileResult<()> {
        match arg {
            SysArg::Imm(imm) => self.emit_op(MachineOp::MovImm { dst, imm }),
            SysArg::Mem(mem) => self.emit_op(MachineOp::Load { dst, mem }),
            SysArg::FpMem(mem) => {
                let value = self.temp(FP)?;
                self.emit_op(MachineOp::Load {
                    dst: value.reg(),
                    mem,
                })?;
                self.emit_op(MachineOp::CvtFpToInt {
                    dst,
                    src: value.reg(),
                })?;
                self.release(value)
            }
            SysArg::Addr(mem) => self.emit_op(MachineOp::Lea { dst, mem }),
            SysArg::Rodata(id) => self.emit_to(MachineOp::LoadAddr { dst }, RelocTarget::Rodata(id)),
        }
    }

    /// Issue system call `nr`. The returned register holds the raw result
    /// and must be released by the caller.
    pub(super) fn emit_syscall(&mut self, nr: i64, args: &[SysArg]) -> CompileResult<TempReg> {
        self.pool.check_call_boundary()?;
        if args.len() > self.info.syscall_args.len() {
            return Err(CompileError::internal(format!(
                "system call {nr} with {} arguments",
                args.len()
            )));
        }
        let mut held = Vec::with_capacity(args.len() + 1);
        let nr_reg = self.pool.acquire_specific(self.info.syscall_nr, TempTag::Syscall)?;
        self.emit_op(MachineOp::MovImm {
            dst: nr_reg.reg(),
            imm: nr,
        })?;
        held.push(nr_reg);
        for (index, &arg) in args.iter().enumerate() {
            let reg = self.pool.acquire_specific(self.info.syscall_args[index], TempTag::Syscall)?;
            self.load_sys_arg(reg.reg(), arg)?;
            held.push(reg);
        }
        self.emit_op(MachineOp::Syscall)?;

        let mut result = None;
        for reg in held {
            if reg.reg() == self.info.int_return {
                result = Some(reg);
            } else {
                self.release(reg)?;
            }
        }
        match result {
            Some(reg) => Ok(reg),
            None => self.pool.acquire_specific(self.info.int_return, TempTag::Syscall),
        }
    }

    /// Convert an integer result register into the accumulator.
    pub(super) fn int_result_to_acc(&mut self, result: TempReg) -> CompileResult<()> {
        self.emit_op(MachineOp::CvtIntToFp {
            dst: self.acc(),
            src: result.reg(),
        })?;
        self.release(result)
    }

    /// `syscall(nr, args...)`: every operand is truncated to an integer.
    fn raw_syscall(&mut self, args: &'p [Expr], loc: SourceLocation) -> CompileResult<()> {
        let max = self.info.syscall_args.len() + 1;
        if args.is_empty() || args.len() > max {
            return Err(CompileError::TypeMismatch {
                reason: format!("syscall takes a number and at most {} arguments", max - 1),
                location: loc,
            });
        }
        for arg in args {
            self.expr(arg, false)?;
            self.push_acc()?;
        }
        let count = args.len() as i32;
        let sp = self.info.sp;
        let slot = |index: i32| Mem::new(sp, 16 * (count - 1 - index));
        let number = slot(0);
        let operands: Vec<SysArg> = (1..count).map(|index| SysArg::FpMem(slot(index))).collect();

        // The number is only known at run time.
        self.pool.check_call_boundary()?;
        let mut held = Vec::with_capacity(operands.len() + 1);
        let nr_reg = self.pool.acquire_specific(self.info.syscall_nr, TempTag::Syscall)?;
        self.load_sys_arg(nr_reg.reg(), SysArg::FpMem(number))?;
        held.push(nr_reg);
        for (index, &arg) in operands.iter().enumerate() {
            let reg = self.pool.acquire_specific(self.info.syscall_args[index], TempTag::Syscall)?;
            self.load_sys_arg(reg.reg(), arg)?;
            held.push(reg);
        }
        self.emit_op(MachineOp::Syscall)?;
        let mut result = None;
        for reg in held {
            if reg.reg() == self.info.int_return {
                result = Some(reg);
            } else {
                self.release(reg)?;
            }
        }
        let result = match result {
            Some(reg) => reg,
            None => self.pool.acquire_specific(self.info.int_return, TempTag::Syscall)?,
        };
        self.int_result_to_acc(result)?;
        self.drop_pushed(args.len() as u32)
    }

    /// Terminate the process with the accumulator's value as exit status.
    pub(super) fn exit_with_acc(&mut self) -> CompileResult<()> {
        if self.summary.uses_imports {
            // Through the C runtime so buffered stdio is flushed.
            let id = self.intern_import("exit")?;
            let code = self.pool.acquire_specific(self.info.gp_args[0], TempTag::CallArg)?;
            self.emit_op(MachineOp::CvtFpToInt {
                dst: code.reg(),
                src: self.acc(),
            })?;
            self.call_import(id)?;
            self.release(code)?;
        } else {
            self.push_acc()?;
            let status = SysArg::FpMem(self.sp_mem(0));
            let result = self.emit_syscall(self.info.syscalls.exit_group, &[status])?;
            self.release(result)?;
            self.drop_pushed(1)?;
        }
        self.emit_op(MachineOp::Trap)
    }

    // ---------------------------------------------------------------
    // Printing
    // ---------------------------------------------------------------

    /// Write a literal string to standard output.
    fn write_literal(&mut self, text: &str) -> CompileResult<()> {
        let id = self.add_rodata(text.as_bytes(), 1);
        let result = self.emit_syscall(
            self.info.syscalls.write,
            &[SysArg::Imm(1), SysArg::Rodata(id), SysArg::Imm(text.len() as i64)],
        )?;
        self.release(result)?;
        self.load_const(self.acc(), 0.0)
    }

    pub(super) fn add_rodata(&mut self, bytes: &[u8], align: usize) -> DataId {
        let before = self.rodata.len();
        let id = self.rodata.add_bytes(bytes, align);
        self.session.record_rodata(self.rodata.len() - before);
        id
    }

    pub(super) fn add_cstring(&mut self, text: &str) -> DataId {
        let before = self.rodata.len();
        let id = self.rodata.add_cstring(text);
        self.session.record_rodata(self.rodata.len() - before);
        id
    }

    /// Format the accumulator with `__print_number` and write it out.
    fn print_acc(&mut self, newline: bool) -> CompileResult<()> {
        let helper = self.request_helper(Helper::PrintNumber);
        let buffer = self.fp_mem(self.func.frame.print_buffer);
        let length = self.fp_mem(self.func.frame.int_slot(0));

        let arg = self.pool.acquire_specific(self.info.gp_args[0], TempTag::CallArg)?;
        self.emit_op(MachineOp::Lea {
            dst: arg.reg(),
            mem: buffer,
        })?;
        self.call_label(helper)?;
        self.release(arg)?;
        let result = self.pool.acquire_specific(self.info.int_return, TempTag::Scratch)?;
        self.emit_op(MachineOp::Store {
            src: result.reg(),
            mem: length,
        })?;
        self.release(result)?;

        if newline {
            let end = self.temp(GP)?;
            let len = self.temp(GP)?;
            self.emit_op(MachineOp::Lea {
                dst: end.reg(),
                mem: buffer,
            })?;
            self.emit_op(MachineOp::Load {
                dst: len.reg(),
                mem: length,
            })?;
            self.emit_op(MachineOp::Int {
                op: IntOp::Add,
                dst: end.reg(),
                lhs: end.reg(),
                rhs: Operand::Reg(len.reg()),
            })?;
            self.emit_op(MachineOp::MovImm {
                dst: len.reg(),
                imm: i64::from(b'\n'),
            })?;
            self.emit_op(MachineOp::StoreByte {
                src: len.reg(),
                mem: Mem::new(end.reg(), 0),
            })?;
            self.emit_op(MachineOp::Load {
                dst: len.reg(),
                mem: length,
            })?;
            self.emit_op(MachineOp::Int {
                op: IntOp::Add,
                dst: len.reg(),
                lhs: len.reg(),
                rhs: Operand::Imm(1),
            })?;
            self.emit_op(MachineOp::Store {
                src: len.reg(),
                mem: length,
            })?;
            self.release(len)?;
            self.release(end)?;
        }

        let result = self.emit_syscall(
            self.info.syscalls.write,
            &[SysArg::Imm(1), SysArg::Addr(buffer), SysArg::Mem(length)],
        )?;
        self.release(result)?;
        self.load_const(self.acc(), 0.0)
    }

    // ---------------------------------------------------------------
    // C imports
    // ---------------------------------------------------------------

    pub(super) fn intern_import(&mut self, name: &str) -> CompileResult<ImportId> {
        let before = self.imports.len();
        let library = import_library(self.session.target(), name);
        let id = self.imports.intern(name, library)?;
        if self.imports.len() > before {
            log::debug!("import {name} from {library}");
            self.session.record_import();
        }
        Ok(id)
    }

    pub(super) fn call_import(&mut self, id: ImportId) -> CompileResult<()> {
        self.pool.check_call_boundary()?;
        self.emit_to(MachineOp::Call, RelocTarget::Import(id))
    }

    /// Call a C function by name using its signature, or doubles in and a
    /// double out when the name is unknown.
    fn import_call(&mut self, name: &str, args: &'p [Expr], loc: SourceLocation) -> CompileResult<()> {
        self.check_arg_limit(name, args.len(), loc)?;
        let (params, ret): (Vec<CType>, CType) = match import_signature(name) {
            Some(sig) => {
                if sig.variadic {
                    return Err(CompileError::internal(format!("variadic import {name} called directly")));
                }
                self.check_arity(name, sig.params.len(), args.len(), loc)?;
                (sig.params.to_vec(), sig.ret)
            }
            None => (vec![CType::Double; args.len()], CType::Double),
        };
        let id = self.intern_import(name)?;
        let plan = self.stage_c_args(&params, args)?;
        let held = self.load_c_args(&plan, false)?;
        self.call_import(id)?;
        self.release_all(held)?;
        self.drop_pushed(stacked_count(&plan))?;
        self.c_result(ret)
    }

    fn c_result(&mut self, ret: CType) -> CompileResult<()> {
        match ret {
            CType::Double => Ok(()),
            CType::Void => self.load_const(self.acc(), 0.0),
            _ => {
                let result = self.pool.acquire_specific(self.info.int_return, TempTag::Scratch)?;
                self.int_result_to_acc(result)
            }
        }
    }

    /// Evaluate the non-literal arguments onto the expression stack.
    fn stage_c_args(&mut self, params: &[CType], args: &'p [Expr]) -> CompileResult<Vec<Marshal>> {
        let mut plan = Vec::with_capacity(args.len());
        let mut stacked = 0;
        for (ty, arg) in params.iter().zip(args) {
            match (ty, &arg.kind) {
                (CType::Str, ExprKind::Str(text)) => {
                    let id = self.add_cstring(text);
                    plan.push(Marshal::Literal(id));
                }
                (CType::Str, _) => {
                    return Err(CompileError::TypeMismatch {
                        reason: "string arguments to C functions must be literals".to_string(),
                        location: arg.loc,
                    });
                }
                (&ty, _) => {
                    self.expr(arg, false)?;
                    self.push_acc()?;
                    plan.push(Marshal::Stacked(ty, stacked));
                    stacked += 1;
                }
            }
        }
        let total = stacked;
        Ok(plan
            .into_iter()
            .map(|m| match m {
                // Stack slot index counted from the top.
                Marshal::Stacked(ty, n) => Marshal::Stacked(ty, total - 1 - n),
                other => other,
            })
            .collect())
    }

    /// Load staged arguments into registers (or, for variadic arguments on
    /// Darwin, into an outgoing stack area). Argument 0 of a variadic call
    /// is always the format string and stays in a register.
    fn load_c_args(&mut self, plan: &[Marshal], variadic: bool) -> CompileResult<Vec<TempReg>> {
        let on_stack = variadic && self.info.variadic_on_stack;
        let extra = if on_stack {
            let slots = (plan.len().saturating_sub(1) as u32).div_ceil(2);
            if slots > 0 {
                self.emit_op(MachineOp::AdjustSp {
                    delta: -16 * slots as i32,
                })?;
                self.func.stack_depth += slots;
            }
            slots
        } else {
            0
        };

        let mut held = Vec::new();
        let mut next_gp = 0;
        let mut next_fp = 0;
        let mut fp_used = 0;
        for (index, marshal) in plan.iter().enumerate() {
            let stacked_arg = on_stack && index > 0;
            let ty = match marshal {
                Marshal::Literal(_) => CType::Str,
                Marshal::Stacked(ty, _) => *ty,
            };
            let in_gp = match ty {
                CType::Double => variadic && index > 0 && self.info.variadic_fp_in_gp,
                _ => true,
            };

            if stacked_arg {
                let out = Mem::new(self.info.sp, 8 * (index as i32 - 1));
                let bank = if ty == CType::Double { FP } else { GP };
                let reg = self.temp(bank)?;
                self.materialize_c_arg(reg.reg(), marshal, ty, extra)?;
                self.emit_op(MachineOp::Store { src: reg.reg(), mem: out })?;
                self.release(reg)?;
                continue;
            }

            if in_gp {
                let Some(&reg) = self.info.gp_args.get(next_gp) else {
                    return Err(CompileError::internal("out of integer argument registers"));
                };
                next_gp += 1;
                let reg = self.pool.acquire_specific(reg, TempTag::CallArg)?;
                self.materialize_c_arg(reg.reg(), marshal, ty, extra)?;
                held.push(reg);
            } else {
                let Some(&reg) = self.info.fp_args.get(next_fp) else {
                    return Err(CompileError::internal("out of double argument registers"));
                };
                next_fp += 1;
                fp_used += 1;
                if reg == self.acc() {
                    self.materialize_c_arg(reg, marshal, ty, extra)?;
                } else {
                    let reg = self.pool.acquire_specific(reg, TempTag::CallArg)?;
                    self.materialize_c_arg(reg.reg(), marshal, ty, extra)?;
                    held.push(reg);
                }
            }
        }

        if variadic {
            if let Some(count) = self.info.vararg_count {
                let reg = self.pool.acquire_specific(count, TempTag::CallArg)?;
                self.emit_op(MachineOp::MovImm {
                    dst: reg.reg(),
                    imm: fp_used,
                })?;
                held.push(reg);
            }
        }
        Ok(held)
    }

    /// `extra` counts the 16-byte outgoing slots reserved above the staged
    /// values.
    fn materialize_c_arg(&mut self, dst: AsmReg, marshal: &Marshal, ty: CType, extra: u32) -> CompileResult<()> {
        match *marshal {
            Marshal::Literal(id) => self.emit_to(MachineOp::LoadAddr { dst }, RelocTarget::Rodata(id)),
            Marshal::Stacked(_, slot) => {
                let mem = self.sp_mem(16 * (slot + extra) as i32);
                match ty {
                    // Raw bits, whichever bank `dst` is in.
                    CType::Double => self.emit_op(MachineOp::Load { dst, mem }),
                    CType::Bool => self.yes_no(dst, mem),
                    _ => {
                        let value = self.temp(FP)?;
                        self.emit_op(MachineOp::Load {
                            dst: value.reg(),
                            mem,
                        })?;
                        self.emit_op(MachineOp::CvtFpToInt {
                            dst,
                            src: value.reg(),
                        })?;
                        self.release(value)
                    }
                }
            }
        }
    }

    /// `dst` = address of "yes" or "no" depending on the double at `mem`.
    fn yes_no(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        let yes = self.add_cstring("yes");
        let no = self.add_cstring("no");
        let value = self.temp(FP)?;
        let zero = self.temp(FP)?;
        self.emit_op(MachineOp::Load {
            dst: value.reg(),
            mem,
        })?;
        self.emit_op(MachineOp::FpZero { dst: zero.reg() })?;
        let false_label = self.new_label("no");
        let done = self.new_label("yes_no");
        self.branch_fp_to(Cond::Eq, value.reg(), zero.reg(), false_label)?;
        self.emit_to(MachineOp::LoadAddr { dst }, RelocTarget::Rodata(yes))?;
        self.jump_to(done)?;
        self.bind(false_label)?;
        self.emit_to(MachineOp::LoadAddr { dst }, RelocTarget::Rodata(no))?;
        self.bind(done)?;
        self.release(zero)?;
        self.release(value)
    }

    /// `printf(format, args...)`; the format must be a literal.
    fn printf(&mut self, args: &'p [Expr], loc: SourceLocation) -> CompileResult<()> {
        let Some((format, rest)) = args.split_first() else {
            return Err(CompileError::TypeMismatch {
                reason: "printf needs a format string".to_string(),
                location: loc,
            });
        };
        let ExprKind::Str(text) = &format.kind else {
            return Err(CompileError::TypeMismatch {
                reason: "printf format must be a string literal".to_string(),
                location: format.loc,
            });
        };
        self.check_arg_limit("printf", rest.len(), loc)?;
        let (rewritten, conversions) = rewrite_format(text);
        if conversions.len() != rest.len() {
            return Err(CompileError::TypeMismatch {
                reason: format!(
                    "printf format expects {} argument(s), {} given",
                    conversions.len(),
                    rest.len()
                ),
                location: loc,
            });
        }

        let id = self.intern_import("printf")?;
        let format_id = self.add_cstring(&rewritten);
        let mut plan = vec![Marshal::Literal(format_id)];
        plan.extend(self.stage_c_args(&conversions, rest)?);
        let held = self.load_c_args(&plan, true)?;
        self.call_import(id)?;
        self.release_all(held)?;
        let staged = stacked_count(&plan) + self.outgoing_slots(plan.len());
        self.drop_pushed(staged)?;
        self.c_result(CType::Int)
    }

    fn outgoing_slots(&self, args: usize) -> u32 {
        if self.info.variadic_on_stack {
            (args.saturating_sub(1) as u32).div_ceil(2)
        } else {
            0
        }
    }
}

fn stacked_count(plan: &[Marshal]) -> u32 {
    plan.iter()
        .filter(|m| matches!(m, Marshal::Stacked(..)))
        .count() as u32
}

/// Rewrite language-level printf conversions into C ones and classify what
/// each conversion consumes.
///
/// `%v` prints a number with full precision (`%.15g`), `%b` prints `yes` or
/// `no`; `%%` consumes nothing.
pub fn rewrite_format(format: &str) -> (String, Vec<CType>) {
    let mut out = String::with_capacity(format.len() + 8);
    let mut conversions = Vec::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = String::from("%");
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || matches!(next, '-' | '+' | ' ' | '#' | '.' | 'l' | 'h' | 'z') {
                spec.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let Some(conv) = chars.next() else {
            out.push_str(&spec);
            break;
        };
        match conv {
            '%' => out.push_str("%%"),
            'v' => {
                if spec.len() == 1 {
                    out.push_str("%.15g");
                } else {
                    out.push_str(&spec);
                    out.push('g');
                }
                conversions.push(CType::Double);
            }
            'b' => {
                out.push_str(&spec);
                out.push('s');
                conversions.push(CType::Bool);
            }
            's' => {
                out.push_str(&spec);
                out.push('s');
                conversions.push(CType::Str);
            }
            'd' | 'i' | 'u' | 'x' | 'X' | 'o' | 'c' => {
                // Integers are always passed as 64-bit values.
                let flags: String = spec.chars().filter(|&ch| !matches!(ch, 'l' | 'h' | 'z')).collect();
                out.push_str(&flags);
                out.push_str(if conv == 'c' { "" } else { "l" });
                out.push(conv);
                conversions.push(CType::Int);
            }
            'f' | 'F' | 'g' | 'G' | 'e' | 'E' | 'a' | 'A' => {
                out.push_str(&spec);
                out.push(conv);
                conversions.push(CType::Double);
            }
            other => {
                out.push_str(&spec);
                out.push(other);
            }
        }
    }
    (out, conversions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Arch;

    #[test]
    fn test_builtin_names() {
        assert_eq!(Builtin::from_name("println"), Some(Builtin::Println));
        assert_eq!(Builtin::from_name("printf"), Some(Builtin::Printf));
        assert_eq!(Builtin::from_name("malloc"), None);
        assert!(Builtin::Printf.needs_import());
        assert!(Builtin::Getpid.needs_import());
        assert!(!Builtin::Println.needs_import());
        assert!(!Builtin::Syscall.needs_import());
    }

    #[test]
    fn test_rewrite_format() {
        let (out, conv) = rewrite_format("sum=%v ok=%b %d%% %s %5.2f\n");
        assert_eq!(out, "sum=%.15g ok=%s %ld%% %s %5.2f\n");
        assert_eq!(
            conv,
            vec![CType::Double, CType::Bool, CType::Int, CType::Str, CType::Double]
        );

        let (out, conv) = rewrite_format("plain");
        assert_eq!(out, "plain");
        assert!(conv.is_empty());
    }

    #[test]
    fn test_import_libraries() {
        let linux = Target::new(Arch::X86_64, ImageFormat::Elf);
        let darwin = Target::new(Arch::Arm64, ImageFormat::MachO);
        assert_eq!(import_library(linux, "printf"), "libc.so.6");
        assert_eq!(import_library(linux, "pow"), "libm.so.6");
        assert_eq!(import_library(linux, "unknown_fn"), "libc.so.6");
        assert_eq!(import_library(darwin, "pow"), "/usr/lib/libSystem.B.dylib");
    }

    #[test]
    fn test_signatures() {
        let printf = import_signature("printf").unwrap();
        assert!(printf.variadic);
        assert_eq!(printf.ret, CType::Int);
        assert_eq!(import_signature("exit").unwrap().ret, CType::Void);
        assert!(import_signature("pow").unwrap().libm);
        assert!(import_signature("nonexistent").is_none());
    }
}
