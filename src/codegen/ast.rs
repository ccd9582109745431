// This module defines the syntax tree the code generator consumes. The front end (lexer
// and parser) is an external collaborator; it hands over a Program made of statements and
// expressions, each carrying the SourceLocation used in diagnostics. Every value in the
// language is a 64-bit float: numbers directly, strings and collections as addresses of
// `[count][key, value]*` blocks, lambdas as code addresses. The small constructor functions
// at the bottom keep hand-built trees (the sample programs and the tests) readable.

//! Abstract syntax tree consumed by the code generator.

use crate::core::SourceLocation;

/// A whole program: the top-level statements become the body of `main`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignMode {
    /// `x = e`: immutable definition.
    Define,
    /// `x := e`: mutable definition.
    DefineMutable,
    /// `x <- e`: update of an existing mutable variable.
    Update,
}

/// Iteration bounds of a counted loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub start: Expr,
    pub end: Expr,
    /// `a..=b` rather than `a..<b`.
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JumpKind {
    /// Leave the loop at the given depth.
    Break,
    /// Start the next iteration of the loop at the given depth.
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign {
        name: String,
        mode: AssignMode,
        value: Expr,
    },
    Expr(Expr),
    /// `@ var in a..<b { body }`
    RangeLoop {
        var: String,
        range: Range,
        body: Vec<Stmt>,
    },
    /// `@ var in xs { body }`
    EachLoop {
        var: String,
        collection: Expr,
        body: Vec<Stmt>,
    },
    /// `@@ var in a..<b { body }`
    ParallelLoop {
        var: String,
        range: Range,
        body: Vec<Stmt>,
    },
    /// `@N`: depth 1 is the outermost active loop of the function.
    Jump { kind: JumpKind, depth: u32 },
    /// `ret e` or `@0 e`.
    Return(Option<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Xor,
    /// `&b`
    BitAnd,
    /// `|b`
    BitOr,
    /// `^b`
    BitXor,
    /// `<<b`
    Shl,
    /// `>>b`
    Shr,
    /// `<b`
    Rol,
    /// `>b`
    Ror,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::BitAnd => "&b",
            BinOp::BitOr => "|b",
            BinOp::BitXor => "^b",
            BinOp::Shl => "<<b",
            BinOp::Shr => ">>b",
            BinOp::Rol => "<b",
            BinOp::Ror => ">b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    /// `#xs`: element count of a collection.
    Len,
}

/// How a match arm decides whether it applies.
#[derive(Debug, Clone, PartialEq)]
pub enum ArmTest {
    /// `-> body`: the subject is non-zero.
    Truthy,
    /// `value -> body`: the subject equals `value`.
    Equals(Expr),
    /// `| guard -> body`: `guard` is non-zero; the subject is ignored.
    Guard(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub test: ArmTest,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    Str(String),
    Ident(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `subject { arms ~> default }`
    Match {
        subject: Box<Expr>,
        arms: Vec<MatchArm>,
        default: Option<Box<Expr>>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Index {
        collection: Box<Expr>,
        index: Box<Expr>,
    },
    /// `xs || f`: a new list holding `f(x)` for every element.
    ParallelMap {
        list: Box<Expr>,
        func: Box<Expr>,
    },
    /// `{ stmts }`; the value is that of the last statement.
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SourceLocation,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            kind,
            loc: SourceLocation::UNKNOWN,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SourceLocation::new(line, column);
        self
    }

    /// Numeric value when the expression is a literal.
    pub fn as_constant(&self) -> Option<f64> {
        match self.kind {
            ExprKind::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn num(value: f64) -> Self {
        Self::new(ExprKind::Number(value))
    }

    pub fn string(value: &str) -> Self {
        Self::new(ExprKind::Str(value.to_string()))
    }

    pub fn ident(name: &str) -> Self {
        Self::new(ExprKind::Ident(name.to_string()))
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Self::new(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Self::new(ExprKind::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn call(callee: &str, args: Vec<Expr>) -> Self {
        Self::new(ExprKind::Call {
            callee: callee.to_string(),
            args,
        })
    }

    pub fn lambda(params: &[&str], body: Expr) -> Self {
        Self::new(ExprKind::Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        })
    }

    pub fn matching(subject: Expr, arms: Vec<MatchArm>, default: Option<Expr>) -> Self {
        Self::new(ExprKind::Match {
            subject: Box::new(subject),
            arms,
            default: default.map(Box::new),
        })
    }

    /// `cond { -> then ~> otherwise }`
    pub fn if_else(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Self::matching(
            cond,
            vec![MatchArm {
                test: ArmTest::Truthy,
                body: then,
            }],
            Some(otherwise),
        )
    }

    pub fn list(items: Vec<Expr>) -> Self {
        Self::new(ExprKind::List(items))
    }

    pub fn map(entries: Vec<(Expr, Expr)>) -> Self {
        Self::new(ExprKind::Map(entries))
    }

    pub fn index(collection: Expr, index: Expr) -> Self {
        Self::new(ExprKind::Index {
            collection: Box::new(collection),
            index: Box::new(index),
        })
    }

    pub fn parallel_map(list: Expr, func: Expr) -> Self {
        Self::new(ExprKind::ParallelMap {
            list: Box::new(list),
            func: Box::new(func),
        })
    }

    pub fn block(stmts: Vec<Stmt>) -> Self {
        Self::new(ExprKind::Block(stmts))
    }
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self {
            kind,
            loc: SourceLocation::UNKNOWN,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SourceLocation::new(line, column);
        self
    }

    pub fn assign(name: &str, mode: AssignMode, value: Expr) -> Self {
        Self::new(StmtKind::Assign {
            name: name.to_string(),
            mode,
            value,
        })
    }

    /// `name = value`
    pub fn define(name: &str, value: Expr) -> Self {
        Self::assign(name, AssignMode::Define, value)
    }

    /// `name := value`
    pub fn define_mut(name: &str, value: Expr) -> Self {
        Self::assign(name, AssignMode::DefineMutable, value)
    }

    /// `name <- value`
    pub fn update(name: &str, value: Expr) -> Self {
        Self::assign(name, AssignMode::Update, value)
    }

    pub fn expr(expr: Expr) -> Self {
        Self::new(StmtKind::Expr(expr))
    }

    pub fn range_loop(var: &str, start: Expr, end: Expr, inclusive: bool, body: Vec<Stmt>) -> Self {
        Self::new(StmtKind::RangeLoop {
            var: var.to_string(),
            range: Range {
                start,
                end,
                inclusive,
            },
            body,
        })
    }

    pub fn each_loop(var: &str, collection: Expr, body: Vec<Stmt>) -> Self {
        Self::new(StmtKind::EachLoop {
            var: var.to_string(),
            collection,
            body,
        })
    }

    pub fn parallel_loop(var: &str, start: Expr, end: Expr, inclusive: bool, body: Vec<Stmt>) -> Self {
        Self::new(StmtKind::ParallelLoop {
            var: var.to_string(),
            range: Range {
                start,
                end,
                inclusive,
            },
            body,
        })
    }

    pub fn brk(depth: u32) -> Self {
        Self::new(StmtKind::Jump {
            kind: JumpKind::Break,
            depth,
        })
    }

    pub fn cont(depth: u32) -> Self {
        Self::new(StmtKind::Jump {
            kind: JumpKind::Continue,
            depth,
        })
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Return(value))
    }
}

/// Shorthand for a call statement such as `println(x)`.
pub fn call_stmt(callee: &str, args: Vec<Expr>) -> Stmt {
    Stmt::expr(Expr::call(callee, args))
}
