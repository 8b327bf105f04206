//! Table-driven operator tests.
//!
//! Every binary operator is evaluated three ways: with both operands in
//! variables (generic stub), with a smi literal on the right and with a smi
//! literal on the left (inline fast paths). All three must agree.

use jitgen::machine::{AluOp, Condition, Operand, Reg};
use jitgen::runtime::{Builtin, CallTarget, RuntimeFunction};
use jitgen::sim::Value;
use jitgen::test_harness::*;

fn eval(source: &str) -> Value {
    run_source(source).unwrap_or_else(|err| panic!("{source}: {err}"))
}

/// Evaluates `left op right` through variables and through both literal
/// forms, joined with `|`.
fn three_ways(op: &str, left: &str, right: &str) -> Value {
    let source = format!(
        r"
        function v(a, b) {{ return a {op} b; }}
        function r(a) {{ return a {op} {right}; }}
        function l(b) {{ return {left} {op} b; }}
        '' + v({left}, {right}) + '|' + r({left}) + '|' + l({right})
        "
    );
    eval(&source)
}

// =============================================================================
// Binary operators
// =============================================================================

#[test]
fn test_binary_operator_table() {
    let cases: &[(&str, &str, &str, &str)] = &[
        ("+", "7", "3", "10"),
        ("+", "1073741823", "1", "1073741824"),
        ("+", "'4'", "2", "42"),
        ("+", "2", "'4'", "24"),
        ("-", "3", "7", "-4"),
        ("-", "-1073741824", "1", "-1073741825"),
        ("*", "6", "7", "42"),
        ("*", "65536", "65536", "4294967296"),
        ("/", "7", "2", "3.5"),
        ("/", "1", "0", "Infinity"),
        ("%", "7", "3", "1"),
        ("%", "-7", "3", "-1"),
        ("&", "12", "10", "8"),
        ("&", "-1", "255", "255"),
        ("|", "12", "10", "14"),
        ("^", "12", "10", "6"),
        ("<<", "5", "1", "10"),
        ("<<", "1", "30", "1073741824"),
        ("<<", "1", "31", "-2147483648"),
        ("<<", "1", "33", "2"),
        (">>", "-16", "2", "-4"),
        (">>", "1073741823", "0", "1073741823"),
        (">>>", "16", "2", "4"),
        (">>>", "-1", "0", "4294967295"),
        (">>>", "-16", "28", "15"),
        (">>>", "-16", "0", "4294967280"),
    ];
    for &(op, left, right, expected) in cases {
        let expected = format!("{expected}|{expected}|{expected}");
        assert_eq!(
            three_ways(op, left, right),
            Value::from(expected.as_str()),
            "{left} {op} {right}"
        );
    }
}

#[test]
fn test_bitwise_literal_is_inline() {
    let code = compile_function("function f(a) { return a & 15; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_has_pattern(
        &instructions,
        &[
            InstructionPattern::Tst {
                lhs: Pat::Exact(Reg::R0),
                rhs: Pat::Exact(Operand::Imm(1)),
            },
            InstructionPattern::Branch {
                cond: Pat::Exact(Condition::Ne),
                offset: Pat::Any,
            },
            InstructionPattern::Alu {
                op: Pat::Exact(AluOp::And),
                set_flags: Pat::Exact(false),
                dst: Pat::Exact(Reg::R0),
                lhs: Pat::Exact(Reg::R0),
                rhs: Pat::Exact(Operand::smi(15)),
            },
        ],
    );
}

#[test]
fn test_reversed_subtraction_uses_rsb() {
    let code = compile_function("function f(a) { return 10 - a; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_has_pattern(
        &instructions,
        &[InstructionPattern::Alu {
            op: Pat::Exact(AluOp::Rsb),
            set_flags: Pat::Exact(true),
            dst: Pat::Exact(Reg::R0),
            lhs: Pat::Exact(Reg::R0),
            rhs: Pat::Exact(Operand::smi(10)),
        }],
    );
}

#[test]
fn test_unsigned_shift_checks_result_range() {
    let code = compile_function("function f(a) { return a >>> 1; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_has_pattern(
        &instructions,
        &[
            InstructionPattern::Alu {
                op: Pat::Exact(AluOp::And),
                set_flags: Pat::Exact(true),
                dst: Pat::Exact(Reg::R3),
                lhs: Pat::Exact(Reg::R2),
                rhs: Pat::Exact(Operand::Imm(0xC000_0000_u32 as i32)),
            },
            InstructionPattern::Branch {
                cond: Pat::Exact(Condition::Ne),
                offset: Pat::Any,
            },
        ],
    );
}

#[test]
fn test_comma_discards_left_value() {
    let source = "var n = 0; function f() { return (n = 5, n + 1); } f() + n";
    assert_eq!(eval(source), Value::Number(11.0));
}

// =============================================================================
// Comparisons
// =============================================================================

/// `left op right` as a value and as a branch condition.
fn compare_both_ways(op: &str, left: &str, right: &str) -> Value {
    let source = format!(
        r"
        function v(a, b) {{ return a {op} b; }}
        function t(a, b) {{ if (a {op} b) return true; return false; }}
        '' + v({left}, {right}) + '|' + t({left}, {right})
        "
    );
    eval(&source)
}

#[test]
fn test_comparison_table() {
    let cases: &[(&str, &str, &str, bool)] = &[
        ("==", "1", "'1'", true),
        ("===", "1", "'1'", false),
        ("==", "null", "undefined", true),
        ("===", "null", "undefined", false),
        ("==", "null", "0", false),
        ("==", "true", "1", true),
        ("!=", "'a'", "'a'", false),
        ("!==", "1", "1.0", false),
        ("===", "0.5 + 0.5", "1", true),
        ("<", "2", "10", true),
        ("<", "'2'", "'10'", false),
        ("<", "'10'", "'9'", true),
        (">", "3", "-1", true),
        ("<=", "1.5", "1.5", true),
        (">=", "-1073741824", "1073741823", false),
        ("<", "NaN", "1", false),
        (">=", "NaN", "1", false),
        (">", "1", "NaN", false),
        ("<=", "NaN", "NaN", false),
        ("==", "NaN", "NaN", false),
        ("!=", "NaN", "NaN", true),
        ("<", "undefined", "1", false),
        ("<", "null", "1", true),
    ];
    for &(op, left, right, expected) in cases {
        let expected = format!("{expected}|{expected}");
        assert_eq!(
            compare_both_ways(op, left, right),
            Value::from(expected.as_str()),
            "{left} {op} {right}"
        );
    }
}

#[test]
fn test_null_comparisons_are_inline() {
    let code = compile_function("function f(a) { return a == null; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert!(!has_call(&instructions, CallTarget::Builtin(Builtin::Equals)));

    let source = r"
        function f(a) { return a == null; }
        function g(a) { return a === null; }
        [f(null), f(undefined), f(0), f({}), g(null), g(undefined)].join()
    ";
    assert_eq!(eval(source), Value::from("true,true,false,false,true,false"));
}

#[test]
fn test_smi_comparison_skips_builtin_on_fast_path() {
    let code = compile_function("function f(a, b) { return a < b; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_has_pattern(
        &instructions,
        &[
            InstructionPattern::Alu {
                op: Pat::Exact(AluOp::Orr),
                set_flags: Pat::Exact(false),
                dst: Pat::Exact(Reg::R2),
                lhs: Pat::Exact(Reg::R0),
                rhs: Pat::Exact(Operand::Reg(Reg::R1)),
            },
            InstructionPattern::Tst {
                lhs: Pat::Exact(Reg::R2),
                rhs: Pat::Exact(Operand::Imm(1)),
            },
        ],
    );
    assert_eq!(
        count_calls(&instructions, CallTarget::Builtin(Builtin::Compare)),
        1
    );
}

#[test]
fn test_in_and_instanceof() {
    let source = r"
        function P() {}
        var p = new P();
        var o = {a: 1};
        ['a' in o, 'b' in o, 'toString' in o, p instanceof P, o instanceof P, 1 instanceof P].join()
    ";
    assert_eq!(eval(source), Value::from("true,false,true,true,false,false"));

    let err = run_source("1 instanceof 2").expect_err("not a function");
    assert!(
        matches!(err, jitgen::Error::Thrown(ref message) if message.starts_with("TypeError")),
        "{err}"
    );
}

// =============================================================================
// Unary operators
// =============================================================================

#[test]
fn test_typeof_table() {
    let cases: &[(&str, &str)] = &[
        ("1", "number"),
        ("1.5", "number"),
        ("'x'", "string"),
        ("undefined", "undefined"),
        ("null", "object"),
        ("true", "boolean"),
        ("function () {}", "function"),
        ("{}", "object"),
        ("[]", "object"),
    ];
    for &(operand, expected) in cases {
        let source = format!("var v = {operand}; typeof v");
        assert_eq!(eval(&source), Value::from(expected), "typeof {operand}");
    }
    // Undeclared globals do not throw under typeof.
    assert_eq!(eval("typeof missing"), Value::from("undefined"));
}

#[test]
fn test_typeof_comparison_table() {
    let source = r"
        function kinds(v) {
            var s = '';
            if (typeof v == 'number') s += 'n';
            if (typeof v == 'string') s += 's';
            if (typeof v == 'boolean') s += 'b';
            if (typeof v == 'undefined') s += 'u';
            if (typeof v == 'function') s += 'f';
            if (typeof v == 'object') s += 'o';
            if (typeof v == 'symbol') s += '?';
            return s;
        }
        [kinds(1), kinds(0.5), kinds('x'), kinds(false), kinds(undefined),
         kinds(kinds), kinds(null), kinds({}), kinds([])].join()
    ";
    assert_eq!(eval(source), Value::from("n,n,s,b,u,f,o,o,o"));
}

#[test]
fn test_unary_table() {
    let cases: &[(&str, &str)] = &[
        ("-x", "-5"),
        ("~x", "-6"),
        ("!x", "false"),
        ("+x", "5"),
        ("void x", "undefined"),
    ];
    for &(expression, expected) in cases {
        let source = format!("function f(x) {{ return {expression}; }} '' + f(5)");
        assert_eq!(eval(&source), Value::from(expected), "{expression}");
    }

    let source = r"
        function neg(x) { return -x; }
        function not(x) { return ~x; }
        function pos(x) { return +x; }
        [neg(0) === 0, 1 / neg(0), neg(-1073741824), neg('3'), not(-1), not(1.5),
         not(2147483647), pos('3'), pos(''), pos(true), !'', !'a', !0.5].join()
    ";
    assert_eq!(
        eval(source),
        Value::from("true,-Infinity,1073741824,-3,0,-2,-2147483648,3,0,1,true,false,false")
    );
}

#[test]
fn test_delete() {
    let source = r"
        var o = {a: 1, b: 2};
        var r = delete o.a;
        var s = delete o['b'];
        var t = delete o.missing;
        [r, s, t, 'a' in o, 'b' in o].join()
    ";
    assert_eq!(eval(source), Value::from("true,true,true,false,false"));
}

// =============================================================================
// Count operations and compound assignment
// =============================================================================

#[test]
fn test_count_operations() {
    let source = r"
        function f(x) {
            var a = x++;
            var b = ++x;
            var c = x--;
            var d = --x;
            return [a, b, c, d, x].join();
        }
        f(5) + '|' + f('5') + '|' + f(1073741823)
    ";
    assert_eq!(
        eval(source),
        Value::from("5,7,7,5,5|5,7,7,5,5|1073741823,1073741825,1073741825,1073741823,1073741823")
    );
}

#[test]
fn test_count_on_properties_and_undefined() {
    let source = r"
        var o = {n: 1};
        o.n++;
        o['n'] += 10;
        var u;
        u++;
        [o.n, u].join()
    ";
    assert_eq!(eval(source), Value::from("12,NaN"));
}

#[test]
fn test_count_overflow_undoes_smi_update() {
    let code = compile_function("function f(x) { return ++x; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_has_pattern(
        &instructions,
        &[
            InstructionPattern::Alu {
                op: Pat::Exact(AluOp::Add),
                set_flags: Pat::Exact(true),
                dst: Pat::Exact(Reg::R0),
                lhs: Pat::Exact(Reg::R0),
                rhs: Pat::Exact(Operand::Reg(Reg::R1)),
            },
            InstructionPattern::Branch {
                cond: Pat::Exact(Condition::Vc),
                offset: Pat::Any,
            },
            InstructionPattern::Alu {
                op: Pat::Exact(AluOp::Sub),
                set_flags: Pat::Exact(false),
                dst: Pat::Exact(Reg::R0),
                lhs: Pat::Exact(Reg::R0),
                rhs: Pat::Exact(Operand::Reg(Reg::R1)),
            },
        ],
    );
    assert!(has_call(
        &instructions,
        CallTarget::Runtime(RuntimeFunction::NumberAdd)
    ));
}

#[test]
fn test_compound_assignment_table() {
    let cases: &[(&str, &str, &str)] = &[
        ("+=", "'b'", "ab"),
        ("-=", "1", "NaN"),
        ("*=", "2", "NaN"),
        ("|=", "1", "1"),
    ];
    for &(op, operand, expected) in cases {
        let source = format!("var x = 'a'; x {op} {operand}; '' + x");
        assert_eq!(eval(&source), Value::from(expected), "x {op} {operand}");
    }

    let source = r"
        function f(x) { x += 1; x -= 3; x *= 4; x <<= 1; x >>= 2; x %= 5; return x; }
        f(10)
    ";
    // ((10 + 1 - 3) * 4 << 1 >> 2) % 5 = 16 % 5
    assert_eq!(eval(source), Value::Number(1.0));
}
