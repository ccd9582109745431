//! Built-in sample programs, used by the command line driver and the end-to-end tests.

use super::ast::{call_stmt, ArmTest, BinOp, Expr, MatchArm, Program, Stmt, UnaryOp};

pub struct Sample {
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> Program,
    /// Exact standard output, when it is deterministic.
    pub expected_output: Option<&'static str>,
}

impl Sample {
    pub fn program(&self) -> Program {
        (self.build)()
    }
}

pub static SAMPLES: &[Sample] = &[
    Sample {
        name: "hello",
        description: "print a string literal",
        build: hello,
        expected_output: Some("Hello, World!\n"),
    },
    Sample {
        name: "arith",
        description: "x := 2 + 2, then print x",
        build: arith,
        expected_output: Some("4\n"),
    },
    Sample {
        name: "sum",
        description: "sum 0..<100 in a loop",
        build: sum,
        expected_output: Some("4950\n"),
    },
    Sample {
        name: "tailsum",
        description: "tail-recursive lambda summing 100000 down to 0",
        build: tailsum,
        expected_output: Some("5000050000\n"),
    },
    Sample {
        name: "printf",
        description: "formatted output through the C runtime",
        build: printf,
        expected_output: Some("3 items, 2.5 each, valid: yes\n"),
    },
    Sample {
        name: "branch",
        description: "a false condition runs only the default arm",
        build: branch,
        expected_output: Some("b\n"),
    },
    Sample {
        name: "parity",
        description: "guarded match arms inside an inclusive loop",
        build: parity,
        expected_output: Some("1\neven\n3\neven\n5\n"),
    },
    Sample {
        name: "collections",
        description: "list iteration, map lookup and length",
        build: collections,
        expected_output: Some("10\n20\n30\n200\n3\n"),
    },
    Sample {
        name: "bits",
        description: "bitwise operators on truncated integers",
        build: bits,
        expected_output: Some("8\n16\n6\n"),
    },
    Sample {
        name: "parallel",
        description: "parallel loop printing i * scale from worker threads",
        build: parallel,
        expected_output: None,
    },
];

pub fn find(name: &str) -> Option<&'static Sample> {
    SAMPLES.iter().find(|s| s.name == name)
}

fn println(value: Expr) -> Stmt {
    call_stmt("println", vec![value])
}

fn hello() -> Program {
    Program::new(vec![println(Expr::string("Hello, World!")).at(1, 1)])
}

fn arith() -> Program {
    Program::new(vec![
        Stmt::define_mut("x", Expr::binary(BinOp::Add, Expr::num(2.0), Expr::num(2.0))).at(1, 1),
        println(Expr::ident("x")).at(2, 1),
    ])
}

fn sum() -> Program {
    Program::new(vec![
        Stmt::define_mut("total", Expr::num(0.0)).at(1, 1),
        Stmt::range_loop(
            "i",
            Expr::num(0.0),
            Expr::num(100.0),
            false,
            vec![Stmt::update(
                "total",
                Expr::binary(BinOp::Add, Expr::ident("total"), Expr::ident("i")),
            )
            .at(3, 5)],
        )
        .at(2, 1),
        println(Expr::ident("total")).at(5, 1),
    ])
}

fn tailsum() -> Program {
    // sum = (n, acc) => n { 0 -> acc ~> me(n - 1, acc + n) }
    let body = Expr::matching(
        Expr::ident("n"),
        vec![MatchArm {
            test: ArmTest::Equals(Expr::num(0.0)),
            body: Expr::ident("acc"),
        }],
        Some(Expr::call(
            "me",
            vec![
                Expr::binary(BinOp::Sub, Expr::ident("n"), Expr::num(1.0)),
                Expr::binary(BinOp::Add, Expr::ident("acc"), Expr::ident("n")),
            ],
        )),
    );
    Program::new(vec![
        Stmt::define("sum", Expr::lambda(&["n", "acc"], body)).at(1, 1),
        println(Expr::call("sum", vec![Expr::num(100_000.0), Expr::num(0.0)])).at(2, 1),
    ])
}

fn printf() -> Program {
    Program::new(vec![call_stmt(
        "printf",
        vec![
            Expr::string("%d items, %v each, valid: %b\n"),
            Expr::num(3.0),
            Expr::num(2.5),
            Expr::num(1.0),
        ],
    )
    .at(1, 1)])
}

fn branch() -> Program {
    Program::new(vec![
        Stmt::define("flag", Expr::num(0.0)).at(1, 1),
        Stmt::expr(Expr::if_else(
            Expr::ident("flag"),
            Expr::call("println", vec![Expr::string("a")]),
            Expr::call("println", vec![Expr::string("b")]),
        ))
        .at(2, 1),
    ])
}

fn parity() -> Program {
    let even = Expr::binary(
        BinOp::Eq,
        Expr::binary(BinOp::Mod, Expr::ident("i"), Expr::num(2.0)),
        Expr::num(0.0),
    );
    Program::new(vec![Stmt::range_loop(
        "i",
        Expr::num(1.0),
        Expr::num(5.0),
        true,
        vec![Stmt::expr(Expr::matching(
            Expr::ident("i"),
            vec![MatchArm {
                test: ArmTest::Guard(even),
                body: Expr::call("println", vec![Expr::string("even")]),
            }],
            Some(Expr::call("println", vec![Expr::ident("i")])),
        ))],
    )
    .at(1, 1)])
}

fn collections() -> Program {
    Program::new(vec![
        Stmt::define(
            "xs",
            Expr::list(vec![Expr::num(1.0), Expr::num(2.0), Expr::num(3.0)]),
        )
        .at(1, 1),
        Stmt::each_loop(
            "x",
            Expr::ident("xs"),
            vec![println(Expr::binary(BinOp::Mul, Expr::ident("x"), Expr::num(10.0)))],
        )
        .at(2, 1),
        Stmt::define(
            "m",
            Expr::map(vec![
                (Expr::num(1.0), Expr::num(100.0)),
                (Expr::num(2.0), Expr::num(200.0)),
            ]),
        )
        .at(3, 1),
        println(Expr::index(Expr::ident("m"), Expr::num(2.0))).at(4, 1),
        println(Expr::unary(UnaryOp::Len, Expr::ident("xs"))).at(5, 1),
    ])
}

fn bits() -> Program {
    Program::new(vec![
        println(Expr::binary(BinOp::BitAnd, Expr::num(12.0), Expr::num(10.0))).at(1, 1),
        println(Expr::binary(BinOp::Shl, Expr::num(1.0), Expr::num(4.0))).at(2, 1),
        println(Expr::binary(BinOp::BitXor, Expr::num(12.0), Expr::num(10.0))).at(3, 1),
    ])
}

fn parallel() -> Program {
    Program::new(vec![
        Stmt::define("scale", Expr::num(3.0)).at(1, 1),
        Stmt::parallel_loop(
            "i",
            Expr::num(0.0),
            Expr::num(8.0),
            false,
            vec![println(Expr::binary(BinOp::Mul, Expr::ident("i"), Expr::ident("scale")))],
        )
        .at(2, 1),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::generator::generate;
    use crate::core::test_utils::test::{all_targets, TestContext};

    #[test]
    fn test_sample_names_are_unique() {
        for (i, a) in SAMPLES.iter().enumerate() {
            assert!(SAMPLES[i + 1..].iter().all(|b| b.name != a.name), "{}", a.name);
        }
        assert!(find("sum").is_some());
        assert!(find("nope").is_none());
    }

    #[test]
    fn test_every_sample_generates_on_every_target() {
        let ctx = TestContext::new();
        for target in all_targets() {
            for sample in SAMPLES {
                let session = ctx.session(target);
                let program = sample.program();
                generate(&session, &program)
                    .unwrap_or_else(|e| panic!("{} on {target}: {e}", sample.name));
            }
        }
    }

    #[test]
    fn test_only_printf_sample_imports() {
        let ctx = TestContext::new();
        let session = ctx.linux_x64();
        for sample in SAMPLES {
            let program = sample.program();
            let unit = generate(&session, &program).unwrap();
            assert_eq!(!unit.imports.is_empty(), sample.name == "printf", "{}", sample.name);
        }
    }
}
