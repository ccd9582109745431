// This module implements the analysis pass that runs over one function body before any
// code for it is emitted. It numbers AST nodes in preorder, mirrors the emitter's scoping
// exactly (same definition order, so both sides hand out identical variable ids) and feeds
// definitions and uses into an IntervalBuilder; the resulting live intervals go to the
// linear-scan allocator, which fixes every variable's storage before the prologue is
// written and therefore lets the frame be sized once. The pass also finds the free
// variables of each parallel loop body, which become the values the workers capture, and
// a program-wide summary: the top-level lambdas that are called directly and whether the
// program needs the C runtime at all.

//! Live-interval analysis, parallel-loop captures and the program summary.

use hashbrown::HashSet;

use super::ast::{ArmTest, AssignMode, Expr, ExprKind, Program, Stmt, StmtKind};
use super::calls::Builtin;
use super::scope::ScopeStack;
use crate::core::{CompileResult, IntervalBuilder, LiveInterval, VarId};

/// A function body the generator can emit.
#[derive(Debug, Clone)]
pub enum FunctionBody<'p> {
    /// The top-level statements.
    Main(&'p [Stmt]),
    Lambda {
        params: &'p [String],
        body: &'p Expr,
    },
    /// A parallel loop body run by each worker thread over its chunk.
    Worker {
        var: &'p str,
        captures: Vec<String>,
        body: &'p [Stmt],
    },
}

/// Hidden parameters of a worker after the loop variable.
pub const WORKER_END: &str = "%end";
pub const WORKER_CTX: &str = "%ctx";

#[derive(Debug, Clone, Default)]
pub struct FunctionAnalysis {
    pub intervals: Vec<LiveInterval>,
    pub var_count: usize,
    pub params: Vec<VarId>,
    /// Captured names of each parallel loop, in source order.
    pub parallel_captures: Vec<Vec<String>>,
    pub max_captures: usize,
}

struct Analyzer {
    pos: u32,
    scopes: ScopeStack,
    builder: IntervalBuilder,
    parallel_captures: Vec<Vec<String>>,
}

impl Analyzer {
    fn next(&mut self) -> u32 {
        self.pos += 1;
        self.pos
    }

    fn use_name(&mut self, name: &str) {
        let pos = self.next();
        if let Some(symbol) = self.scopes.lookup(name) {
            self.builder.use_var(symbol.var, pos);
        }
    }

    fn use_var(&mut self, var: VarId) {
        let pos = self.next();
        self.builder.use_var(var, pos);
    }

    fn define(&mut self, name: &str, mutable: bool, stmt: &Stmt) -> CompileResult<VarId> {
        let var = self.scopes.define(name, mutable, stmt.loc)?;
        let pos = self.next();
        self.builder.define(var, pos);
        Ok(var)
    }

    fn define_hidden(&mut self, name: &str) -> VarId {
        let var = self.scopes.define_hidden(name);
        let pos = self.next();
        self.builder.define(var, pos);
        var
    }

    fn block(&mut self, stmts: &[Stmt]) -> CompileResult<()> {
        self.scopes.push();
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        self.next();
        match &stmt.kind {
            StmtKind::Assign { name, mode, value } => {
                self.expr(value)?;
                match mode {
                    AssignMode::Define => {
                        self.define(name, false, stmt)?;
                    }
                    AssignMode::DefineMutable => {
                        self.define(name, true, stmt)?;
                    }
                    AssignMode::Update => {
                        let var = self.scopes.resolve_update(name, stmt.loc)?;
                        self.use_var(var);
                    }
                }
            }
            StmtKind::Expr(expr) => self.expr(expr)?,
            StmtKind::RangeLoop { var, range, body } => {
                self.expr(&range.start)?;
                self.expr(&range.end)?;
                self.scopes.push();
                let end = self.define_hidden("%end");
                let counter = self.define(var, false, stmt)?;
                let start = self.next();
                self.builder.enter_loop(start);
                self.use_var(counter);
                self.use_var(end);
                self.block(body)?;
                self.use_var(counter);
                let end_pos = self.next();
                self.builder.exit_loop(end_pos);
                self.scopes.pop();
            }
            StmtKind::EachLoop {
                var,
                collection,
                body,
            } => {
                self.expr(collection)?;
                self.scopes.push();
                let coll = self.define_hidden("%coll");
                let idx = self.define_hidden("%idx");
                let item = self.define(var, false, stmt)?;
                let start = self.next();
                self.builder.enter_loop(start);
                self.use_var(coll);
                self.use_var(idx);
                self.use_var(item);
                self.block(body)?;
                self.use_var(idx);
                let end_pos = self.next();
                self.builder.exit_loop(end_pos);
                self.scopes.pop();
            }
            StmtKind::ParallelLoop { var, range, body } => {
                self.expr(&range.start)?;
                self.expr(&range.end)?;
                let captures = free_variables(var, body, &self.scopes);
                for name in &captures {
                    self.use_name(name);
                }
                self.parallel_captures.push(captures);
            }
            StmtKind::Jump { .. } => {}
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value)?;
                }
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> CompileResult<()> {
        self.next();
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Lambda { .. } => {}
            ExprKind::Ident(name) => self.use_name(name),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
            }
            ExprKind::Unary { operand, .. } => self.expr(operand)?,
            ExprKind::Match {
                subject,
                arms,
                default,
            } => {
                self.expr(subject)?;
                for arm in arms {
                    match &arm.test {
                        ArmTest::Truthy => {}
                        ArmTest::Equals(value) | ArmTest::Guard(value) => self.expr(value)?,
                    }
                    self.expr(&arm.body)?;
                }
                if let Some(default) = default {
                    self.expr(default)?;
                }
            }
            ExprKind::Call { callee, args } => {
                // The callee is read before the arguments are evaluated.
                self.use_name(callee);
                for arg in args {
                    self.expr(arg)?;
                }
            }
            ExprKind::List(items) => {
                for item in items {
                    self.expr(item)?;
                }
            }
            ExprKind::Map(entries) => {
                for (key, value) in entries {
                    self.expr(key)?;
                    self.expr(value)?;
                }
            }
            ExprKind::Index { collection, index } => {
                self.expr(collection)?;
                self.expr(index)?;
            }
            ExprKind::ParallelMap { list, func } => {
                self.expr(list)?;
                self.expr(func)?;
                self.scopes.push();
                let hidden: Vec<VarId> = ["%src", "%fn", "%dst", "%idx"]
                    .iter()
                    .map(|name| self.define_hidden(name))
                    .collect();
                let start = self.next();
                self.builder.enter_loop(start);
                for var in hidden {
                    self.use_var(var);
                }
                let end_pos = self.next();
                self.builder.exit_loop(end_pos);
                self.scopes.pop();
            }
            ExprKind::Block(stmts) => self.block(stmts)?,
        }
        Ok(())
    }
}

/// Compute live intervals and capture lists for one function body.
pub fn analyze_function(body: &FunctionBody<'_>) -> CompileResult<FunctionAnalysis> {
    let mut analyzer = Analyzer {
        pos: 0,
        scopes: ScopeStack::new(),
        builder: IntervalBuilder::new(),
        parallel_captures: Vec::new(),
    };
    let mut params = Vec::new();

    match body {
        FunctionBody::Main(stmts) => {
            for stmt in stmts.iter() {
                analyzer.stmt(stmt)?;
            }
        }
        FunctionBody::Lambda { params: names, body } => {
            for name in names.iter() {
                let var = analyzer.scopes.define(name, false, body.loc)?;
                analyzer.builder.pin(var);
                params.push(var);
            }
            analyzer.expr(body)?;
        }
        FunctionBody::Worker {
            var,
            captures,
            body,
        } => {
            let counter = analyzer.scopes.define(var, false, Default::default())?;
            let end = analyzer.scopes.define_hidden(WORKER_END);
            let ctx = analyzer.scopes.define_hidden(WORKER_CTX);
            for p in [counter, end, ctx] {
                analyzer.builder.pin(p);
                params.push(p);
            }
            for name in captures {
                analyzer.define_hidden_capture(name);
            }
            analyzer.block(body)?;
        }
    }

    let function_end = analyzer.next();
    let var_count = analyzer.scopes.var_count();
    let max_captures = analyzer
        .parallel_captures
        .iter()
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    let intervals = analyzer.builder.finish(function_end);
    log::trace!(
        "analysis: {var_count} variables, {} intervals, {} parallel loop(s)",
        intervals.len(),
        analyzer.parallel_captures.len()
    );
    Ok(FunctionAnalysis {
        intervals,
        var_count,
        params,
        parallel_captures: analyzer.parallel_captures,
        max_captures,
    })
}

impl Analyzer {
    /// Captured values are immutable inside the worker and live throughout it.
    fn define_hidden_capture(&mut self, name: &str) {
        let var = self.scopes.define_capture(name);
        self.builder.pin(var);
    }
}

/// Names a parallel loop body reads from the enclosing function, in order of
/// first appearance. The loop variable and names the body defines itself are
/// excluded.
pub fn free_variables(loop_var: &str, body: &[Stmt], enclosing: &ScopeStack) -> Vec<String> {
    let mut collector = FreeVars {
        local: vec![HashSet::from_iter([loop_var.to_string()])],
        enclosing,
        found: Vec::new(),
    };
    collector.stmts(body);
    collector.found
}

struct FreeVars<'a> {
    local: Vec<HashSet<String>>,
    enclosing: &'a ScopeStack,
    found: Vec<String>,
}

impl FreeVars<'_> {
    fn reference(&mut self, name: &str) {
        if self.local.iter().any(|scope| scope.contains(name)) {
            return;
        }
        if self.enclosing.lookup(name).is_some() && !self.found.iter().any(|n| n == name) {
            self.found.push(name.to_string());
        }
    }

    fn bind(&mut self, name: &str) {
        if let Some(scope) = self.local.last_mut() {
            scope.insert(name.to_string());
        }
    }

    fn stmts(&mut self, stmts: &[Stmt]) {
        self.local.push(HashSet::new());
        for stmt in stmts {
            self.stmt(stmt);
        }
        self.local.pop();
    }

    fn scoped_loop(&mut self, var: &str, body: &[Stmt]) {
        self.local.push(HashSet::from_iter([var.to_string()]));
        self.stmts(body);
        self.local.pop();
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Assign { name, mode, value } => {
                self.expr(value);
                match mode {
                    AssignMode::Update => self.reference(name),
                    _ => self.bind(name),
                }
            }
            StmtKind::Expr(expr) => self.expr(expr),
            StmtKind::RangeLoop { var, range, body }
            | StmtKind::ParallelLoop { var, range, body } => {
                self.expr(&range.start);
                self.expr(&range.end);
                self.scoped_loop(var, body);
            }
            StmtKind::EachLoop {
                var,
                collection,
                body,
            } => {
                self.expr(collection);
                self.scoped_loop(var, body);
            }
            StmtKind::Jump { .. } => {}
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Lambda { .. } => {}
            ExprKind::Ident(name) => self.reference(name),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Match {
                subject,
                arms,
                default,
            } => {
                self.expr(subject);
                for arm in arms {
                    if let ArmTest::Equals(value) | ArmTest::Guard(value) = &arm.test {
                        self.expr(value);
                    }
                    self.expr(&arm.body);
                }
                if let Some(default) = default {
                    self.expr(default);
                }
            }
            ExprKind::Call { callee, args } => {
                self.reference(callee);
                for arg in args {
                    self.expr(arg);
                }
            }
            ExprKind::List(items) => items.iter().for_each(|item| self.expr(item)),
            ExprKind::Map(entries) => {
                for (key, value) in entries {
                    self.expr(key);
                    self.expr(value);
                }
            }
            ExprKind::Index { collection, index } => {
                self.expr(collection);
                self.expr(index);
            }
            ExprKind::ParallelMap { list, func } => {
                self.expr(list);
                self.expr(func);
            }
            ExprKind::Block(stmts) => self.stmts(stmts),
        }
    }
}

/// A top-level `name = (params) -> body` definition, callable directly.
#[derive(Debug, Clone)]
pub struct GlobalLambda<'p> {
    pub name: &'p str,
    pub params: &'p [String],
    pub body: &'p Expr,
}

/// Whole-program facts needed before `main` is generated.
#[derive(Debug, Clone, Default)]
pub struct ProgramSummary<'p> {
    pub globals: Vec<GlobalLambda<'p>>,
    /// Some call resolves to a C function, so the image is dynamically linked.
    pub uses_imports: bool,
}

impl<'p> ProgramSummary<'p> {
    pub fn global(&self, name: &str) -> Option<&GlobalLambda<'p>> {
        self.globals.iter().find(|g| g.name == name)
    }
}

pub fn summarize(program: &Program) -> ProgramSummary<'_> {
    let mut globals: Vec<GlobalLambda<'_>> = Vec::new();
    for stmt in &program.statements {
        if let StmtKind::Assign {
            name,
            mode: AssignMode::Define,
            value,
        } = &stmt.kind
        {
            if let ExprKind::Lambda { params, body } = &value.kind {
                if !globals.iter().any(|g| g.name == name) {
                    globals.push(GlobalLambda {
                        name,
                        params,
                        body,
                    });
                }
            }
        }
    }

    let mut names = NameCollector::default();
    names.stmts(&program.statements);
    let uses_imports = names.callees.iter().any(|callee| match Builtin::from_name(callee) {
        Some(builtin) => builtin.needs_import(),
        None => callee != "me" && !names.defined.contains(callee),
    });

    ProgramSummary {
        globals,
        uses_imports,
    }
}

/// Every defined name and every callee anywhere in the program.
#[derive(Default)]
struct NameCollector {
    defined: HashSet<String>,
    callees: Vec<String>,
}

impl NameCollector {
    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Assign { name, value, .. } => {
                    self.defined.insert(name.clone());
                    self.expr(value);
                }
                StmtKind::Expr(expr) => self.expr(expr),
                StmtKind::RangeLoop { var, range, body }
                | StmtKind::ParallelLoop { var, range, body } => {
                    self.defined.insert(var.clone());
                    self.expr(&range.start);
                    self.expr(&range.end);
                    self.stmts(body);
                }
                StmtKind::EachLoop {
                    var,
                    collection,
                    body,
                } => {
                    self.defined.insert(var.clone());
                    self.expr(collection);
                    self.stmts(body);
                }
                StmtKind::Jump { .. } => {}
                StmtKind::Return(value) => {
                    if let Some(value) = value {
                        self.expr(value);
                    }
                }
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Ident(_) => {}
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Match {
                subject,
                arms,
                default,
            } => {
                self.expr(subject);
                for arm in arms {
                    if let ArmTest::Equals(value) | ArmTest::Guard(value) = &arm.test {
                        self.expr(value);
                    }
                    self.expr(&arm.body);
                }
                if let Some(default) = default {
                    self.expr(default);
                }
            }
            ExprKind::Lambda { params, body } => {
                self.defined.extend(params.iter().cloned());
                self.expr(body);
            }
            ExprKind::Call { callee, args } => {
                self.callees.push(callee.clone());
                args.iter().for_each(|arg| self.expr(arg));
            }
            ExprKind::List(items) => items.iter().for_each(|item| self.expr(item)),
            ExprKind::Map(entries) => {
                for (key, value) in entries {
                    self.expr(key);
                    self.expr(value);
                }
            }
            ExprKind::Index { collection, index } => {
                self.expr(collection);
                self.expr(index);
            }
            ExprKind::ParallelMap { list, func } => {
                self.expr(list);
                self.expr(func);
            }
            ExprKind::Block(stmts) => self.stmts(stmts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ast::{call_stmt, BinOp};

    fn sum_loop() -> Vec<Stmt> {
        vec![
            Stmt::define_mut("sum", Expr::num(0.0)),
            Stmt::range_loop(
                "i",
                Expr::num(0.0),
                Expr::num(100.0),
                false,
                vec![Stmt::update(
                    "sum",
                    Expr::binary(BinOp::Add, Expr::ident("sum"), Expr::ident("i")),
                )],
            ),
            call_stmt("println", vec![Expr::ident("sum")]),
        ]
    }

    #[test]
    fn test_loop_extends_outer_variables() {
        let stmts = sum_loop();
        let analysis = analyze_function(&FunctionBody::Main(&stmts)).unwrap();
        // sum, %end, i
        assert_eq!(analysis.var_count, 3);
        let sum = analysis.intervals.iter().find(|iv| iv.var == 0).unwrap();
        let counter = analysis.intervals.iter().find(|iv| iv.var == 2).unwrap();
        assert!(sum.overlaps(counter));
        assert!(sum.end > counter.end);
    }

    #[test]
    fn test_lambda_params_are_pinned() {
        let params = vec!["n".to_string(), "acc".to_string()];
        let body = Expr::block(vec![
            Stmt::define("t", Expr::num(1.0)),
            Stmt::expr(Expr::ident("t")),
        ]);
        let analysis = analyze_function(&FunctionBody::Lambda {
            params: &params,
            body: &body,
        })
        .unwrap();
        assert_eq!(analysis.params, vec![0, 1]);
        for var in [0, 1] {
            let iv = analysis.intervals.iter().find(|iv| iv.var == var).unwrap();
            assert_eq!(iv.start, 0);
        }
    }

    #[test]
    fn test_parallel_captures() {
        let stmts = vec![
            Stmt::define("scale", Expr::num(3.0)),
            Stmt::define("unused", Expr::num(4.0)),
            Stmt::parallel_loop(
                "i",
                Expr::num(0.0),
                Expr::num(8.0),
                false,
                vec![
                    Stmt::define("local", Expr::ident("i")),
                    call_stmt(
                        "println",
                        vec![Expr::binary(BinOp::Mul, Expr::ident("local"), Expr::ident("scale"))],
                    ),
                ],
            ),
        ];
        let analysis = analyze_function(&FunctionBody::Main(&stmts)).unwrap();
        assert_eq!(analysis.parallel_captures, vec![vec!["scale".to_string()]]);
        assert_eq!(analysis.max_captures, 1);
    }

    #[test]
    fn test_summary_finds_globals_and_imports() {
        let program = Program::new(vec![
            Stmt::define("double", Expr::lambda(&["x"], Expr::ident("x"))),
            call_stmt("println", vec![Expr::call("double", vec![Expr::num(2.0)])]),
        ]);
        let summary = summarize(&program);
        assert_eq!(summary.globals.len(), 1);
        assert!(summary.global("double").is_some());
        assert!(!summary.uses_imports);

        let program = Program::new(vec![call_stmt("printf", vec![Expr::string("%v\n")])]);
        assert!(summarize(&program).uses_imports);

        let program = Program::new(vec![call_stmt("sin", vec![Expr::num(1.0)])]);
        assert!(summarize(&program).uses_imports);
    }

    #[test]
    fn test_redefinition_is_reported() {
        let stmts = vec![
            Stmt::define("x", Expr::num(1.0)),
            Stmt::define("x", Expr::num(2.0)).at(2, 1),
        ];
        assert!(analyze_function(&FunctionBody::Main(&stmts)).is_err());
    }
}
