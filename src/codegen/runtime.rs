// This module generates the runtime support routines and the collection values built on
// them. Helpers are emitted on demand, once per program, after all user functions: asking
// for a helper returns its label immediately and records the request, and the generator
// emits every requested helper at the end (a helper may request another one while it is
// being emitted). Collections share one layout, `[count][key, value]*` of 8-byte doubles,
// so lists are maps with keys 0..n. Collections whose elements are all literals are placed
// in rodata; everything else is built in memory obtained from `__alloc`.

//! Runtime helpers and collection values.

use super::ast::Expr;
use super::calls::SysArg;
use super::generator::CodeGenerator;
use crate::arch::{Cond, FpOp, IntOp, MachineOp, Mem, Operand};
use crate::core::{
    AsmReg, CompileError, CompileResult, ImageFormat, LabelId, RelocTarget, TempReg, TempTag,
    VarId, FP, GP,
};

/// A support routine generated into the text section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// `(buffer: ptr, value: f64) -> len`
    PrintNumber,
    /// `(key: f64, collection: f64) -> f64`
    MapGet,
    /// `(bytes: int) -> ptr`
    Alloc,
    /// Entry point of a spawned worker thread.
    ThreadEntry,
}

impl Helper {
    pub fn symbol(self) -> &'static str {
        match self {
            Helper::PrintNumber => "__print_number",
            Helper::MapGet => "__map_get",
            Helper::Alloc => "__alloc",
            Helper::ThreadEntry => "__thread_entry",
        }
    }
}

/// Helpers requested so far, in request order.
#[derive(Debug, Clone, Default)]
pub struct HelperSet {
    requested: Vec<Helper>,
    emitted: usize,
}

impl HelperSet {
    /// Returns true the first time `helper` is requested.
    pub fn request(&mut self, helper: Helper) -> bool {
        if self.requested.contains(&helper) {
            return false;
        }
        self.requested.push(helper);
        true
    }

    pub fn contains(&self, helper: Helper) -> bool {
        self.requested.contains(&helper)
    }

    fn next_unemitted(&mut self) -> Option<Helper> {
        let next = self.requested.get(self.emitted).copied();
        if next.is_some() {
            self.emitted += 1;
        }
        next
    }
}

/// Bytes in one collection entry.
const ENTRY_BYTES: i32 = 16;

/// Digits printed after the decimal point, at most.
const FRACTION_DIGITS: u32 = 6;

/// Values at or above this print without a fractional part.
const FRACTION_LIMIT: f64 = 1e9;

/// Flat `[count][key, value]*` image of a collection.
pub fn collection_image(entries: &[(f64, f64)]) -> Vec<f64> {
    let mut image = Vec::with_capacity(1 + 2 * entries.len());
    image.push(entries.len() as f64);
    for &(key, value) in entries {
        image.push(key);
        image.push(value);
    }
    image
}

impl<'s, 'a, 'p> CodeGenerator<'s, 'a, 'p> {
    /// Label of `helper`, scheduling it for emission.
    pub(super) fn request_helper(&mut self, helper: Helper) -> LabelId {
        if self.helpers.request(helper) {
            log::trace!("requested runtime helper {}", helper.symbol());
        }
        self.labels.named(helper.symbol())
    }

    pub(super) fn emit_helpers(&mut self) -> CompileResult<()> {
        while let Some(helper) = self.helpers.next_unemitted() {
            let label = self.labels.named(helper.symbol());
            match helper {
                Helper::PrintNumber => self.emit_print_number(label)?,
                Helper::MapGet => self.emit_map_get(label)?,
                Helper::Alloc => self.emit_alloc(label)?,
                Helper::ThreadEntry => self.emit_thread_entry(label)?,
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Collections
    // ---------------------------------------------------------------

    /// A string is the collection of its character codes.
    pub(super) fn string_value(&mut self, text: &str) -> CompileResult<()> {
        let entries: Vec<(f64, f64)> = text
            .chars()
            .enumerate()
            .map(|(i, c)| (i as f64, f64::from(u32::from(c))))
            .collect();
        self.constant_collection(&entries)
    }

    fn constant_collection(&mut self, entries: &[(f64, f64)]) -> CompileResult<()> {
        let before = self.rodata.len();
        let id = self.rodata.add_f64_slice(&collection_image(entries));
        self.session.record_rodata(self.rodata.len() - before);
        self.load_address(self.acc(), RelocTarget::Rodata(id))
    }

    pub(super) fn list_value(&mut self, items: &'p [Expr]) -> CompileResult<()> {
        let constants: Option<Vec<(f64, f64)>> = items
            .iter()
            .enumerate()
            .map(|(i, item)| item.as_constant().map(|v| (i as f64, v)))
            .collect();
        if let Some(entries) = constants {
            return self.constant_collection(&entries);
        }
        for item in items {
            self.expr(item, false)?;
            self.push_acc()?;
        }
        self.build_collection(items.len(), false)
    }

    pub(super) fn map_value(&mut self, entries: &'p [(Expr, Expr)]) -> CompileResult<()> {
        let constants: Option<Vec<(f64, f64)>> = entries
            .iter()
            .map(|(k, v)| Some((k.as_constant()?, v.as_constant()?)))
            .collect();
        if let Some(entries) = constants {
            return self.constant_collection(&entries);
        }
        for (key, value) in entries {
            self.expr(key, false)?;
            self.push_acc()?;
            self.expr(value, false)?;
            self.push_acc()?;
        }
        self.build_collection(entries.len(), true)
    }

    /// Allocate `count` entries and fill them from the expression stack,
    /// where values (and keys, if `keyed`) were pushed in order.
    fn build_collection(&mut self, count: usize, keyed: bool) -> CompileResult<()> {
        check_collection_size(count)?;
        let bytes = 8 + ENTRY_BYTES as i64 * count as i64;
        let ptr = self.call_alloc_imm(bytes)?;
        let value = self.temp(FP)?;
        self.load_const(value.reg(), count as f64)?;
        self.emit_op(MachineOp::Store {
            src: value.reg(),
            mem: Mem::new(ptr.reg(), 0),
        })?;
        for index in (0..count).rev() {
            let entry = 8 + ENTRY_BYTES * index as i32;
            self.pop_into(value.reg())?;
            self.emit_op(MachineOp::Store {
                src: value.reg(),
                mem: Mem::new(ptr.reg(), entry + 8),
            })?;
            if keyed {
                self.pop_into(value.reg())?;
            } else {
                self.load_const(value.reg(), index as f64)?;
            }
            self.emit_op(MachineOp::Store {
                src: value.reg(),
                mem: Mem::new(ptr.reg(), entry),
            })?;
        }
        self.release(value)?;
        self.emit_op(MachineOp::CvtIntToFp {
            dst: self.acc(),
            src: ptr.reg(),
        })?;
        self.release(ptr)
    }

    /// Call `__alloc` for a constant size; the returned register holds the
    /// address.
    fn call_alloc_imm(&mut self, bytes: i64) -> CompileResult<TempReg> {
        let alloc = self.request_helper(Helper::Alloc);
        let size = self.pool.acquire_specific(self.info.gp_args[0], TempTag::CallArg)?;
        self.emit_op(MachineOp::MovImm {
            dst: size.reg(),
            imm: bytes,
        })?;
        self.call_label(alloc)?;
        self.release(size)?;
        self.pool.acquire_specific(self.info.int_return, TempTag::Scratch)
    }

    /// `collection[index]` through `__map_get`.
    pub(super) fn index(&mut self, collection: &'p Expr, index: &'p Expr) -> CompileResult<()> {
        self.expr(collection, false)?;
        self.push_acc()?;
        self.expr(index, false)?;
        let lookup = self.request_helper(Helper::MapGet);
        let coll = self.pool.acquire_specific(self.info.fp_args[1], TempTag::CallArg)?;
        self.pop_into(coll.reg())?;
        self.call_label(lookup)?;
        self.release(coll)
    }

    /// `dst` = address of entry `idx` of the collection held in `coll`.
    pub(super) fn entry_address(&mut self, dst: AsmReg, coll: VarId, idx: VarId) -> CompileResult<()> {
        let value = self.temp(FP)?;
        let base = self.temp(GP)?;
        self.load_var(coll, value.reg())?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: base.reg(),
            src: value.reg(),
        })?;
        self.load_var(idx, value.reg())?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst,
            src: value.reg(),
        })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Shl,
            dst,
            lhs: dst,
            rhs: Operand::Imm(4),
        })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Add,
            dst,
            lhs: dst,
            rhs: Operand::Reg(base.reg()),
        })?;
        self.release(base)?;
        self.release(value)
    }

    /// `list || f`: a new list of `f(x)` for each element, in order.
    pub(super) fn parallel_map(&mut self, list: &'p Expr, func: &'p Expr) -> CompileResult<()> {
        self.expr(list, false)?;
        self.push_acc()?;
        self.expr(func, false)?;
        self.func.scopes.push();
        let src = self.func.scopes.define_hidden("%src");
        let callee = self.func.scopes.define_hidden("%fn");
        let dst = self.func.scopes.define_hidden("%dst");
        let idx = self.func.scopes.define_hidden("%idx");
        self.store_var(callee, self.acc())?;
        self.pop_into(self.acc())?;
        self.store_var(src, self.acc())?;

        // dst = __alloc(8 + 16 * count), dst.count = count
        let alloc = self.request_helper(Helper::Alloc);
        let size = self.pool.acquire_specific(self.info.gp_args[0], TempTag::CallArg)?;
        {
            let value = self.temp(FP)?;
            self.load_var(src, value.reg())?;
            self.emit_op(MachineOp::CvtFpToInt {
                dst: size.reg(),
                src: value.reg(),
            })?;
            self.emit_op(MachineOp::Load {
                dst: value.reg(),
                mem: Mem::new(size.reg(), 0),
            })?;
            self.emit_op(MachineOp::CvtFpToInt {
                dst: size.reg(),
                src: value.reg(),
            })?;
            self.release(value)?;
        }
        self.emit_op(MachineOp::Int {
            op: IntOp::Shl,
            dst: size.reg(),
            lhs: size.reg(),
            rhs: Operand::Imm(4),
        })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Add,
            dst: size.reg(),
            lhs: size.reg(),
            rhs: Operand::Imm(8),
        })?;
        self.call_label(alloc)?;
        self.release(size)?;
        let ptr = self.pool.acquire_specific(self.info.int_return, TempTag::Scratch)?;
        self.emit_op(MachineOp::CvtIntToFp {
            dst: self.acc(),
            src: ptr.reg(),
        })?;
        self.release(ptr)?;
        self.store_var(dst, self.acc())?;
        self.load_const(self.acc(), 0.0)?;
        self.store_var(idx, self.acc())?;

        let top = self.new_label("map_loop");
        let done = self.new_label("map_done");
        self.bind(top)?;
        {
            let count = self.temp(FP)?;
            let base = self.temp(GP)?;
            self.load_var(src, count.reg())?;
            self.emit_op(MachineOp::CvtFpToInt {
                dst: base.reg(),
                src: count.reg(),
            })?;
            self.emit_op(MachineOp::Load {
                dst: count.reg(),
                mem: Mem::new(base.reg(), 0),
            })?;
            self.release(base)?;
            self.load_var(idx, self.acc())?;
            self.branch_fp_to(Cond::Ge, self.acc(), count.reg(), done)?;
            self.release(count)?;
        }

        // acc = f(src[idx])
        let entry = self.temp(GP)?;
        self.entry_address(entry.reg(), src, idx)?;
        self.emit_op(MachineOp::Load {
            dst: self.acc(),
            mem: Mem::new(entry.reg(), 16),
        })?;
        self.release(entry)?;
        let target = self.pool.acquire(GP, TempTag::CallArg)?;
        {
            let value = self.temp(FP)?;
            self.load_var(callee, value.reg())?;
            self.emit_op(MachineOp::CvtFpToInt {
                dst: target.reg(),
                src: value.reg(),
            })?;
            self.release(value)?;
        }
        self.pool.check_call_boundary()?;
        self.emit_op(MachineOp::CallReg {
            target: target.reg(),
        })?;
        self.release(target)?;

        // dst[idx] = (idx, acc)
        let entry = self.temp(GP)?;
        self.entry_address(entry.reg(), dst, idx)?;
        self.emit_op(MachineOp::Store {
            src: self.acc(),
            mem: Mem::new(entry.reg(), 16),
        })?;
        self.load_var(idx, self.acc())?;
        self.emit_op(MachineOp::Store {
            src: self.acc(),
            mem: Mem::new(entry.reg(), 8),
        })?;
        self.release(entry)?;
        {
            let one = self.temp(FP)?;
            self.load_const(one.reg(), 1.0)?;
            self.emit_op(MachineOp::Fp {
                op: FpOp::Add,
                dst: self.acc(),
                lhs: self.acc(),
                rhs: one.reg(),
            })?;
            self.release(one)?;
        }
        self.store_var(idx, self.acc())?;
        self.jump_to(top)?;

        self.bind(done)?;
        // dst.count = idx
        let base = self.temp(GP)?;
        self.load_var(dst, self.acc())?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: base.reg(),
            src: self.acc(),
        })?;
        let count = self.temp(FP)?;
        self.load_var(idx, count.reg())?;
        self.emit_op(MachineOp::Store {
            src: count.reg(),
            mem: Mem::new(base.reg(), 0),
        })?;
        self.release(count)?;
        self.release(base)?;
        self.func.scopes.pop();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Helper bodies
    // ---------------------------------------------------------------

    /// Writes the decimal form of the accumulator to the buffer in the
    /// first integer argument and returns its length.
    fn emit_print_number(&mut self, label: LabelId) -> CompileResult<()> {
        let name = Helper::PrintNumber.symbol();
        let start = self.begin_helper(name, label, 0)?;
        let acc = self.acc();

        let buffer = self.pool.acquire_specific(self.info.gp_args[0], TempTag::Scratch)?;
        let cursor = self.temp(GP)?;
        let byte = self.temp(GP)?;
        let zero = self.temp(FP)?;
        let one = self.temp(FP)?;
        let ten = self.temp(FP)?;
        let whole = self.temp(FP)?;
        let frac = self.temp(FP)?;
        let pow = self.temp(FP)?;
        let scratch = self.temp(FP)?;
        let (cur, b) = (cursor.reg(), byte.reg());
        let (z, o, t, w, f, p, s) = (
            zero.reg(),
            one.reg(),
            ten.reg(),
            whole.reg(),
            frac.reg(),
            pow.reg(),
            scratch.reg(),
        );

        self.emit_op(MachineOp::Mov {
            dst: cur,
            src: buffer.reg(),
        })?;
        self.emit_op(MachineOp::FpZero { dst: z })?;
        self.load_const(o, 1.0)?;
        self.load_const(t, 10.0)?;

        let finish = self.new_label("finish");
        let not_a_number = self.new_label("nan");
        self.branch_fp_to(Cond::Ne, acc, acc, not_a_number)?;

        // sign
        let positive = self.new_label("positive");
        self.branch_fp_to(Cond::Ge, acc, z, positive)?;
        self.put_char(cur, b, b'-')?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Sub,
            dst: acc,
            lhs: z,
            rhs: acc,
        })?;
        self.bind(positive)?;
        let infinite = self.new_label("inf");
        self.load_const(s, f64::MAX)?;
        self.branch_fp_to(Cond::Gt, acc, s, infinite)?;

        // Large values print their integer digits straight from acc.
        self.emit_op(MachineOp::FMov { dst: w, src: acc })?;
        self.emit_op(MachineOp::FpZero { dst: f })?;
        let print_whole = self.new_label("print_whole");
        self.load_const(s, FRACTION_LIMIT)?;
        self.branch_fp_to(Cond::Ge, acc, s, print_whole)?;

        // whole = trunc(acc), frac = round((acc - whole) * 10^6), carrying
        // into whole when rounding reaches 10^6.
        self.trunc(w, acc, b)?;
        let scale = 10f64.powi(FRACTION_DIGITS as i32);
        self.emit_op(MachineOp::Fp {
            op: FpOp::Sub,
            dst: f,
            lhs: acc,
            rhs: w,
        })?;
        self.load_const(s, scale)?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Mul,
            dst: f,
            lhs: f,
            rhs: s,
        })?;
        self.load_const(s, 0.5)?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Add,
            dst: f,
            lhs: f,
            rhs: s,
        })?;
        self.trunc(f, f, b)?;
        self.load_const(s, scale)?;
        self.branch_fp_to(Cond::Lt, f, s, print_whole)?;
        self.emit_op(MachineOp::FpZero { dst: f })?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Add,
            dst: w,
            lhs: w,
            rhs: o,
        })?;
        self.bind(print_whole)?;

        // pow = largest power of ten <= whole (at least 1)
        self.emit_op(MachineOp::FMov { dst: p, src: o })?;
        let scan = self.new_label("scan");
        let scanned = self.new_label("scanned");
        self.bind(scan)?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Mul,
            dst: s,
            lhs: p,
            rhs: t,
        })?;
        self.branch_fp_to(Cond::Gt, s, w, scanned)?;
        self.emit_op(MachineOp::FMov { dst: p, src: s })?;
        self.jump_to(scan)?;
        self.bind(scanned)?;
        self.put_digits(cur, b, w, p, o, t, s)?;

        // fraction without trailing zeros
        self.branch_fp_to(Cond::Eq, f, z, finish)?;
        self.put_char(cur, b, b'.')?;
        self.load_const(p, 10f64.powi(FRACTION_DIGITS as i32 - 1))?;
        let strip = self.new_label("strip");
        let stripped = self.new_label("stripped");
        self.bind(strip)?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Div,
            dst: s,
            lhs: f,
            rhs: t,
        })?;
        self.trunc(s, s, b)?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Mul,
            dst: w,
            lhs: s,
            rhs: t,
        })?;
        self.branch_fp_to(Cond::Ne, w, f, stripped)?;
        self.emit_op(MachineOp::FMov { dst: f, src: s })?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Div,
            dst: p,
            lhs: p,
            rhs: t,
        })?;
        self.jump_to(strip)?;
        self.bind(stripped)?;
        self.put_digits(cur, b, f, p, o, t, s)?;
        self.jump_to(finish)?;

        self.bind(not_a_number)?;
        for &ch in b"nan" {
            self.put_char(cur, b, ch)?;
        }
        self.jump_to(finish)?;
        self.bind(infinite)?;
        for &ch in b"inf" {
            self.put_char(cur, b, ch)?;
        }
        self.bind(finish)?;

        // length = cursor - buffer
        self.emit_op(MachineOp::Int {
            op: IntOp::Sub,
            dst: cur,
            lhs: cur,
            rhs: Operand::Reg(buffer.reg()),
        })?;
        for temp in [scratch, pow, frac, whole, ten, one, zero, byte] {
            self.release(temp)?;
        }
        // The cursor may already be the return register (rax on x86-64).
        let ret = self.info.int_return;
        if cur != ret {
            if buffer.reg() == ret {
                self.emit_op(MachineOp::Mov { dst: ret, src: cur })?;
            } else {
                let held = self.pool.acquire_specific(ret, TempTag::Scratch)?;
                self.emit_op(MachineOp::Mov { dst: ret, src: cur })?;
                self.release(held)?;
            }
        }
        self.release(buffer)?;
        self.release(cursor)?;
        self.emit_op(MachineOp::Ret)?;
        self.end_helper(name, start)
    }

    /// `dst = trunc(src)` through the integer register `via`.
    pub(super) fn trunc(&mut self, dst: AsmReg, src: AsmReg, via: AsmReg) -> CompileResult<()> {
        self.emit_op(MachineOp::CvtFpToInt { dst: via, src })?;
        self.emit_op(MachineOp::CvtIntToFp { dst, src: via })
    }

    /// Store `ch` at `cursor` and advance it.
    fn put_char(&mut self, cursor: AsmReg, byte: AsmReg, ch: u8) -> CompileResult<()> {
        self.emit_op(MachineOp::MovImm {
            dst: byte,
            imm: i64::from(ch),
        })?;
        self.put_byte(cursor, byte)
    }

    fn put_byte(&mut self, cursor: AsmReg, byte: AsmReg) -> CompileResult<()> {
        self.emit_op(MachineOp::StoreByte {
            src: byte,
            mem: Mem::new(cursor, 0),
        })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Add,
            dst: cursor,
            lhs: cursor,
            rhs: Operand::Imm(1),
        })
    }

    /// Print `value` digit by digit, starting at the power of ten `pow`,
    /// until `pow` drops below one. Clobbers `value`, `pow` and `scratch`.
    #[allow(clippy::too_many_arguments)]
    fn put_digits(
        &mut self,
        cursor: AsmReg,
        byte: AsmReg,
        value: AsmReg,
        pow: AsmReg,
        one: AsmReg,
        ten: AsmReg,
        scratch: AsmReg,
    ) -> CompileResult<()> {
        let top = self.new_label("digit");
        let done = self.new_label("digits_done");
        self.bind(top)?;
        self.branch_fp_to(Cond::Lt, pow, one, done)?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Div,
            dst: scratch,
            lhs: value,
            rhs: pow,
        })?;
        self.emit_op(MachineOp::CvtFpToInt {
            dst: byte,
            src: scratch,
        })?;
        self.emit_op(MachineOp::CvtIntToFp {
            dst: scratch,
            src: byte,
        })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Add,
            dst: byte,
            lhs: byte,
            rhs: Operand::Imm(i32::from(b'0')),
        })?;
        self.put_byte(cursor, byte)?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Mul,
            dst: scratch,
            lhs: scratch,
            rhs: pow,
        })?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Sub,
            dst: value,
            lhs: value,
            rhs: scratch,
        })?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Div,
            dst: pow,
            lhs: pow,
            rhs: ten,
        })?;
        self.jump_to(top)?;
        self.bind(done)
    }

    /// Linear key search; the key is in the accumulator and the collection
    /// address in the second double argument. Missing keys give 0.
    fn emit_map_get(&mut self, label: LabelId) -> CompileResult<()> {
        let name = Helper::MapGet.symbol();
        let start = self.begin_helper(name, label, 0)?;
        let acc = self.acc();
        let coll = self.pool.acquire_specific(self.info.fp_args[1], TempTag::Scratch)?;
        let entry = self.temp(GP)?;
        let count = self.temp(FP)?;
        let index = self.temp(FP)?;
        let key = self.temp(FP)?;
        let one = self.temp(FP)?;

        self.emit_op(MachineOp::CvtFpToInt {
            dst: entry.reg(),
            src: coll.reg(),
        })?;
        self.emit_op(MachineOp::Load {
            dst: count.reg(),
            mem: Mem::new(entry.reg(), 0),
        })?;
        self.emit_op(MachineOp::FpZero { dst: index.reg() })?;
        self.load_const(one.reg(), 1.0)?;

        let top = self.new_label("search");
        let found = self.new_label("found");
        let missing = self.new_label("missing");
        self.bind(top)?;
        self.branch_fp_to(Cond::Ge, index.reg(), count.reg(), missing)?;
        self.emit_op(MachineOp::Load {
            dst: key.reg(),
            mem: Mem::new(entry.reg(), 8),
        })?;
        self.branch_fp_to(Cond::Eq, key.reg(), acc, found)?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Add,
            dst: entry.reg(),
            lhs: entry.reg(),
            rhs: Operand::Imm(ENTRY_BYTES),
        })?;
        self.emit_op(MachineOp::Fp {
            op: FpOp::Add,
            dst: index.reg(),
            lhs: index.reg(),
            rhs: one.reg(),
        })?;
        self.jump_to(top)?;

        self.bind(found)?;
        self.emit_op(MachineOp::Load {
            dst: acc,
            mem: Mem::new(entry.reg(), 16),
        })?;
        self.emit_op(MachineOp::Ret)?;
        self.bind(missing)?;
        self.emit_op(MachineOp::FpZero { dst: acc })?;
        self.emit_op(MachineOp::Ret)?;

        for temp in [one, key, index, count, entry, coll] {
            self.release(temp)?;
        }
        self.end_helper(name, start)
    }

    /// Anonymous private mapping of the page-rounded size in the first
    /// integer argument.
    fn emit_alloc(&mut self, label: LabelId) -> CompileResult<()> {
        let name = Helper::Alloc.symbol();
        let start = self.begin_helper(name, label, 16)?;
        let page = self.session.target().format.page_size() as i32;
        self.emit_op(MachineOp::EnterFrame { frame_size: 16 })?;
        let slot = self.fp_mem(-(self.info.saved_area + 8));
        let size = self.pool.acquire_specific(self.info.gp_args[0], TempTag::Scratch)?;
        self.emit_op(MachineOp::Int {
            op: IntOp::Add,
            dst: size.reg(),
            lhs: size.reg(),
            rhs: Operand::Imm(page - 1),
        })?;
        self.emit_op(MachineOp::Int {
            op: IntOp::And,
            dst: size.reg(),
            lhs: size.reg(),
            rhs: Operand::Imm(-page),
        })?;
        self.emit_op(MachineOp::Store {
            src: size.reg(),
            mem: slot,
        })?;
        self.release(size)?;
        let result = self.emit_syscall(
            self.info.syscalls.mmap,
            &[
                SysArg::Imm(0),
                SysArg::Mem(slot),
                SysArg::Imm(PROT_READ_WRITE),
                SysArg::Imm(anonymous_private(self.session.target().format)),
                SysArg::Imm(-1),
                SysArg::Imm(0),
            ],
        )?;
        self.release(result)?;
        self.emit_op(MachineOp::LeaveFrame { frame_size: 16 })?;
        self.emit_op(MachineOp::Ret)?;
        self.end_helper(name, start)
    }
}

pub(super) const PROT_READ_WRITE: i64 = 0x3;

/// `MAP_PRIVATE | MAP_ANONYMOUS` for the image's operating system.
pub(super) fn anonymous_private(format: ImageFormat) -> i64 {
    match format {
        ImageFormat::Elf => 0x22,
        ImageFormat::MachO => 0x1002,
    }
}

/// Check that `entries` fit the immediate offsets used for literal
/// collections.
pub fn check_collection_size(entries: usize) -> CompileResult<()> {
    if entries > (i32::MAX as usize - 8) / ENTRY_BYTES as usize {
        return Err(CompileError::ResourceExhausted {
            reason: format!("collection literal with {entries} entries"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_image() {
        assert_eq!(collection_image(&[]), vec![0.0]);
        assert_eq!(
            collection_image(&[(0.0, 10.0), (1.0, 20.0)]),
            vec![2.0, 0.0, 10.0, 1.0, 20.0]
        );
    }

    #[test]
    fn test_helper_requests_are_deduplicated() {
        let mut set = HelperSet::default();
        assert!(set.request(Helper::PrintNumber));
        assert!(!set.request(Helper::PrintNumber));
        assert!(set.request(Helper::Alloc));
        assert_eq!(set.next_unemitted(), Some(Helper::PrintNumber));
        assert!(set.request(Helper::MapGet));
        assert_eq!(set.next_unemitted(), Some(Helper::Alloc));
        assert_eq!(set.next_unemitted(), Some(Helper::MapGet));
        assert_eq!(set.next_unemitted(), None);
        assert!(set.contains(Helper::Alloc));
        assert!(!set.contains(Helper::ThreadEntry));
    }

    #[test]
    fn test_mapping_flags() {
        assert_eq!(anonymous_private(ImageFormat::Elf), 0x22);
        assert_eq!(anonymous_private(ImageFormat::MachO), 0x1002);
    }

    #[test]
    fn test_print_number_generates_on_every_target() {
        use crate::codegen::ast::{call_stmt, Expr, Program};
        use crate::codegen::generate;
        use crate::core::test_utils::test::{all_targets, TestContext};

        let ctx = TestContext::new();
        for target in all_targets() {
            let session = ctx.session(target);
            let program = Program::new(vec![call_stmt("println", vec![Expr::num(4.0)])]);
            let unit = generate(&session, &program).unwrap_or_else(|e| panic!("{target}: {e}"));
            assert!(
                unit.functions.iter().any(|f| f.name == Helper::PrintNumber.symbol()),
                "{target}: no print helper"
            );
        }
    }

    #[test]
    fn test_collection_size_limit() {
        assert!(check_collection_size(1000).is_ok());
        assert!(check_collection_size(usize::MAX / 2).is_err());
    }
}
