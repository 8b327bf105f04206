//! Property-based tests for the code generator.
//!
//! Uses `proptest` to generate programs and operands and checks the results
//! against a reference evaluation in Rust:
//! - Random integer expressions compile with balanced frames and registers,
//!   have sound branches, and evaluate like the reference
//! - Inline smi operations agree with the generic path at the 31-bit and
//!   32-bit boundaries
//! - Jump-table switches reach the same clause as compare-and-branch switches
//!
//! The fixed-input tests below cover the control-flow properties that are
//! easier to state as examples: `ToBoolean`, short-circuiting, for-in under
//! mutation, try/finally, deferred code order, nesting limits and const.

use std::fmt::Write;

use proptest::prelude::*;
use jitgen::ast::BinaryOp;
use jitgen::layout::{SMI_MAX, SMI_MIN};
use jitgen::machine::RelocMode;
use jitgen::runtime::{CallTarget, CodeStub};
use jitgen::sim::{Simulator, SimulatorOptions, Value};
use jitgen::test_harness::*;
use jitgen::{CompileOptions, Error, Instruction, compile};

fn simulator(options: CompileOptions) -> Simulator {
    Simulator::new(SimulatorOptions::default().with_heap_words(1 << 16), options)
        .expect("simulator")
}

fn eval(source: &str) -> Value {
    simulator(CompileOptions::default())
        .eval(source)
        .unwrap_or_else(|err| panic!("{source}: {err}"))
}

/// `ToInt32` of a finite number.
fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    let modulo = value.trunc().rem_euclid(4_294_967_296.0);
    (modulo as u32) as i32
}

fn to_uint32(value: f64) -> u32 {
    to_int32(value) as u32
}

/// A literal as source text; negative values are parenthesized.
fn literal(value: i64) -> String {
    if value < 0 {
        format!("(-{})", value.unsigned_abs())
    } else {
        value.to_string()
    }
}

// =============================================================================
// Random integer expressions
// =============================================================================

#[derive(Debug, Clone)]
enum Expr {
    Literal(i64),
    Param(usize),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    /// `(l < r) ? then : else`
    Select(Box<Expr>, Box<Expr>, Box<Expr>, Box<Expr>),
}

const OPERATORS: [&str; 9] = ["+", "-", "*", "&", "|", "^", "<<", ">>", ">>>"];

impl Expr {
    fn source(&self, out: &mut String) {
        match self {
            Self::Literal(value) => out.push_str(&literal(*value)),
            Self::Param(index) => out.push(['a', 'b', 'c'][*index]),
            Self::Binary(op, left, right) => {
                out.push('(');
                left.source(out);
                let _ = write!(out, " {op} ");
                right.source(out);
                out.push(')');
            }
            Self::Select(left, right, then, otherwise) => {
                out.push_str("((");
                left.source(out);
                out.push_str(" < ");
                right.source(out);
                out.push_str(") ? ");
                then.source(out);
                out.push_str(" : ");
                otherwise.source(out);
                out.push(')');
            }
        }
    }

    fn evaluate(&self, params: &[f64; 3]) -> f64 {
        match self {
            Self::Literal(value) => *value as f64,
            Self::Param(index) => params[*index],
            Self::Binary(op, left, right) => {
                let (l, r) = (left.evaluate(params), right.evaluate(params));
                let shift = to_uint32(r) & 31;
                match *op {
                    "+" => l + r,
                    "-" => l - r,
                    "*" => l * r,
                    "&" => f64::from(to_int32(l) & to_int32(r)),
                    "|" => f64::from(to_int32(l) | to_int32(r)),
                    "^" => f64::from(to_int32(l) ^ to_int32(r)),
                    "<<" => f64::from(to_int32(l).wrapping_shl(shift)),
                    ">>" => f64::from(to_int32(l) >> shift),
                    _ => f64::from(to_uint32(l) >> shift),
                }
            }
            Self::Select(left, right, then, otherwise) => {
                if left.evaluate(params) < right.evaluate(params) {
                    then.evaluate(params)
                } else {
                    otherwise.evaluate(params)
                }
            }
        }
    }
}

fn boundary_i32() -> impl Strategy<Value = i32> {
    prop_oneof![
        Just(0),
        Just(-1),
        Just(1),
        Just(SMI_MAX),
        Just(SMI_MAX - 1),
        Just(SMI_MIN),
        Just(SMI_MIN + 1),
        Just(i32::MAX),
        Just(i32::MIN),
        -100i32..100,
        any::<i32>(),
    ]
}

fn expr_strategy() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (-50i64..50).prop_map(Expr::Literal),
        prop_oneof![
            Just(i64::from(SMI_MAX)),
            Just(i64::from(SMI_MAX) + 1),
            Just(i64::from(i32::MAX))
        ]
        .prop_map(Expr::Literal),
        (0usize..3).prop_map(Expr::Param),
    ];
    leaf.prop_recursive(4, 24, 4, |inner| {
        prop_oneof![
            3 => (0usize..OPERATORS.len(), inner.clone(), inner.clone()).prop_map(
                |(op, left, right)| Expr::Binary(OPERATORS[op], Box::new(left), Box::new(right))
            ),
            1 => (inner.clone(), inner.clone(), inner.clone(), inner).prop_map(
                |(left, right, then, otherwise)| Expr::Select(
                    Box::new(left),
                    Box::new(right),
                    Box::new(then),
                    Box::new(otherwise)
                )
            ),
        ]
    })
}

fn function_source(expr: &Expr) -> String {
    let mut body = String::new();
    expr.source(&mut body);
    format!("function f(a, b, c) {{ return {body}; }}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Compilation balances the frame and the register file (it fails
    /// otherwise) and every branch lands inside the code object.
    #[test]
    fn prop_expressions_compile_soundly(expr in expr_strategy()) {
        let source = function_source(&expr);
        let code = compile_function(&source, "f").unwrap_or_else(|err| panic!("{source}: {err}"));
        let len = code.len() as i64;
        for (pc, instr) in code.instructions.iter().enumerate() {
            if let Some(offset) = instr.branch_offset() {
                let target = pc as i64 + i64::from(offset);
                prop_assert!((0..len).contains(&target), "{}: branch at {} to {}", source, pc, target);
            }
        }
    }

    /// Merges at conditional joins and the inline fast paths preserve values.
    #[test]
    fn prop_expressions_match_reference(
        expr in expr_strategy(),
        a in boundary_i32(),
        b in boundary_i32(),
        c in -3i32..3,
    ) {
        let source = format!(
            "{} f({}, {}, {})",
            function_source(&expr),
            literal(a.into()),
            literal(b.into()),
            literal(c.into())
        );
        let expected = expr.evaluate(&[f64::from(a), f64::from(b), f64::from(c)]);
        prop_assert_eq!(eval(&source), Value::Number(expected), "{}", source);
    }
}

// =============================================================================
// Smi fast paths
// =============================================================================

/// Literal operands: small shift counts plus values at the smi range limits.
fn smi_literal() -> impl Strategy<Value = i32> {
    prop_oneof![
        0i32..64,
        Just(SMI_MAX & !0x1f),
        Just(1 << 29),
        boundary_i32().prop_filter("smi range", |v| (SMI_MIN..=SMI_MAX).contains(v)),
    ]
}

fn smi_reference(op: &str, x: i32, y: i32) -> f64 {
    let shift = (y as u32) & 31;
    match op {
        "+" => f64::from(x) + f64::from(y),
        "-" => f64::from(x) - f64::from(y),
        "<<" => f64::from(x.wrapping_shl(shift)),
        ">>" => f64::from(x >> shift),
        _ => f64::from((x as u32) >> shift),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    /// `x op literal` and `literal op x` agree with full semantics around the
    /// smi range limits.
    #[test]
    fn prop_smi_operations_match_generic(
        op in prop::sample::select(vec!["+", "-", "<<", ">>", ">>>"]),
        x in boundary_i32(),
        value in smi_literal(),
    ) {
        let source = format!(
            "function l(x) {{ return x {op} {value}; }}
             function r(x) {{ return {value} {op} x; }}
             [l({x}), r({x})].join(',')",
            x = literal(x.into()),
            value = literal(value.into()),
        );
        let expected = format!(
            "{},{}",
            Value::Number(smi_reference(op, x, value)),
            Value::Number(smi_reference(op, value, x)),
        );
        prop_assert_eq!(eval(&source), Value::String(expected), "{}", source);
    }
}

/// The boundary cases spelled out.
#[test]
fn test_smi_boundary_cases() {
    let cases = [
        ("function f(x) { return x + 1; } f(1073741823)", 1_073_741_824.0),
        ("function f(x) { return x - 1; } f(-1073741824)", -1_073_741_825.0),
        ("function f(x) { return 0 - x; } f(-1073741824)", 1_073_741_824.0),
        ("function f(x) { return x << 1; } f(536870912)", 1_073_741_824.0),
        ("function f(x) { return x << 31; } f(1)", -2_147_483_648.0),
        ("function f(x) { return x >>> 0; } f(-1)", 4_294_967_295.0),
        ("function f(x) { return x >>> 1; } f(-2)", 2_147_483_647.0),
        ("function f(x) { return x >> 33; } f(-8)", -4.0),
        ("function f(x) { return x & 255; } f(-1)", 255.0),
        ("function f(x) { return x | 0; } f(2147483648)", -2_147_483_648.0),
        ("function f(x) { return -x; } f(0)", -0.0),
        ("function f(x) { return -x; } f(-1073741824)", 1_073_741_824.0),
        ("function f(x) { return ~x; } f(-1073741824)", 1_073_741_823.0),
        ("function f(x) { return x + 1073741823; } f(1073741823)", 2_147_483_646.0),
        ("function f(x) { return 1073741823 - x; } f(-1073741824)", 2_147_483_647.0),
        ("function f(x) { return x - 1073741823; } f(-1073741824)", -2_147_483_647.0),
    ];
    for (source, expected) in cases {
        assert_eq!(eval(source), Value::Number(expected), "{source}");
    }
    // -0 is preserved by negation.
    assert_eq!(
        eval("function f(x) { return 1 / -x; } f(0)"),
        Value::Number(f64::NEG_INFINITY)
    );
}

// =============================================================================
// ToBoolean and short-circuiting
// =============================================================================

#[test]
fn test_to_boolean_conformance() {
    let cases = [
        ("0", false),
        ("-0", false),
        ("0.0", false),
        ("NaN", false),
        ("''", false),
        ("null", false),
        ("undefined", false),
        ("false", false),
        ("1", true),
        ("-1", true),
        ("0.5", true),
        ("1 / 0", true),
        ("'0'", true),
        ("' '", true),
        ("true", true),
        ("({})", true),
        ("[]", true),
        ("function () {}", true),
        ("1073741824", true),
    ];
    for (operand, truthy) in cases {
        let source = format!(
            "var v = {operand};
             var r = '';
             if (v) r += 't'; else r += 'f';
             r += v ? 't' : 'f';
             r += !v ? 'f' : 't';
             var n = 0; while (v) {{ n++; break; }} r += n ? 't' : 'f';
             r"
        );
        let expected = if truthy { "tttt" } else { "ffff" };
        assert_eq!(eval(&source), Value::from(expected), "{operand}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_to_boolean_of_numbers(eighths in -8_000_000i64..8_000_000) {
        let value = eighths as f64 / 8.0;
        let source = format!("function f(v) {{ return v ? 1 : 2; }} f({})", literal_f64(value));
        let expected = if value == 0.0 { 2.0 } else { 1.0 };
        prop_assert_eq!(eval(&source), Value::Number(expected), "{}", source);
    }
}

fn literal_f64(value: f64) -> String {
    if value < 0.0 {
        format!("(-{})", -value)
    } else {
        value.to_string()
    }
}

#[test]
fn test_short_circuit_preserves_operands() {
    let prelude = "var calls = 0; function g(v) { calls++; return v; }";
    let cases = [
        ("0 && g(1)", "0", 0),
        ("2 && g(3)", "3", 1),
        ("'' || g('x')", "x", 1),
        ("'a' || g('x')", "a", 0),
        ("null || g(0) || g(5)", "5", 2),
        ("g(1) && g(0) && g(7)", "0", 2),
        ("(g(0) || g('')) && g(9)", "", 2),
    ];
    for (expression, value, calls) in cases {
        let source = format!("{prelude} var r = {expression}; '' + r + ':' + calls");
        assert_eq!(
            eval(&source),
            Value::String(format!("{value}:{calls}")),
            "{expression}"
        );
    }
    // In a test context the operands are only branched on.
    assert_eq!(
        eval(&format!("{prelude} var r = (g(0) || g(1) && g(2)) ? 'y' : 'n'; r + calls")),
        Value::from("y3")
    );
}

// =============================================================================
// switch
// =============================================================================

fn switch_source(labels: &[i32], probe: i32) -> String {
    let mut source = String::from("function f(n) { switch (n) {");
    for (index, label) in labels.iter().enumerate() {
        let _ = write!(source, " case {label}: return {index};");
    }
    let _ = write!(source, " default: return -1; }} }} f({})", literal(probe.into()));
    source
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Every label dispatches to its clause; everything else to the default.
    #[test]
    fn prop_switch_table_reachability(
        labels in prop::collection::btree_set(0i32..16, 5..10),
        probe in -2i32..18,
    ) {
        let labels: Vec<i32> = labels.into_iter().collect();
        let source = switch_source(&labels, probe);
        let expected = labels
            .iter()
            .position(|&label| label == probe)
            .map_or(-1.0, |index| index as f64);

        let fast = simulator(CompileOptions::default()).eval(&source).expect("fast");
        let slow = simulator(CompileOptions::new().with_fast_switch(1, 100))
            .eval(&source)
            .expect("slow");
        prop_assert_eq!(&fast, &Value::Number(expected), "{}", source);
        prop_assert_eq!(&slow, &fast);
    }
}

/// A table with gaps and no default breaks out for the missing values.
#[test]
fn test_switch_table_gaps_without_default() {
    let source = r"
        function f(n) {
            var r = 'none';
            switch (n) {
                case 10: r = 'ten'; break;
                case 12: r = 'twelve'; break;
                case 13: r = 'thirteen';
                case 14: r += '+'; break;
                case 16: r = 'sixteen'; break;
            }
            return r;
        }
        [f(10), f(11), f(13), f(14), f(15), f(16), f(17), f('12')].join()
    ";
    assert_eq!(
        eval(source),
        Value::from("ten,none,thirteen+,none+,none,sixteen,none,none")
    );
}

// =============================================================================
// for-in
// =============================================================================

#[test]
fn test_for_in_skips_deleted_keys() {
    let source = r"
        var o = {a: 1, b: 2, c: 3};
        var seen = '';
        for (var k in o) { seen += k; if (k == 'a') delete o.c; }
        seen
    ";
    assert_eq!(eval(source), Value::from("ab"));
}

#[test]
fn test_for_in_ignores_added_keys() {
    let source = r"
        var o = {a: 1, b: 2};
        var seen = '';
        for (var k in o) { seen += k; o['x' + k] = 0; }
        seen
    ";
    assert_eq!(eval(source), Value::from("ab"));
}

#[test]
fn test_for_in_enumerates_prototype_and_elements() {
    let source = r"
        function P() { this.own = 1; }
        P.prototype.inherited = 2;
        var seen = [];
        for (var k in new P()) seen.push(k);
        for (var i in [7, 8]) seen.push(i);
        seen.join()
    ";
    assert_eq!(eval(source), Value::from("own,inherited,0,1"));
}

#[test]
fn test_for_in_break_and_continue_keep_frame() {
    let source = r"
        function f(o) {
            var s = '';
            outer: for (var k in o) {
                if (k == 'd') break;
                for (var j in o) {
                    if (j == k) continue outer;
                    s += k + j;
                }
            }
            return s;
        }
        f({a: 1, b: 2, c: 3, d: 4})
    ";
    assert_eq!(eval(source), Value::from("bacacb"));
}

// =============================================================================
// try / finally
// =============================================================================

#[test]
fn test_finally_runs_on_every_exit() {
    let source = r"
        var log = '';
        function normal() { try { log += 'n'; } finally { log += 'N'; } return 1; }
        function ret() { try { return 2; } finally { log += 'R'; } }
        function thrown() {
            try { try { throw 3; } finally { log += 'T'; } } catch (e) { return e; }
        }
        function loops() {
            var i = 0;
            while (true) {
                try {
                    i++;
                    if (i < 3) continue;
                    break;
                } finally { log += i; }
            }
            return i;
        }
        [normal(), ret(), thrown(), loops(), log].join()
    ";
    assert_eq!(eval(source), Value::from("1,2,3,3,nNRT123"));
}

#[test]
fn test_finally_completion_overrides() {
    let source = r"
        function a() { try { return 1; } finally { return 2; } }
        function b() { try { throw 1; } finally { return 3; } }
        function c() {
            for (var i = 0; i < 5; i++) { try { return i; } finally { if (i < 2) continue; } }
            return -1;
        }
        [a(), b(), c()].join()
    ";
    assert_eq!(eval(source), Value::from("2,3,2"));
}

#[test]
fn test_finally_rethrows_pending_exception() {
    let err = simulator(CompileOptions::default())
        .eval("var log = ''; try { throw 'x'; } finally { log += 'f'; }")
        .expect_err("rethrown");
    assert!(matches!(err, Error::Thrown(ref message) if message == "x"));

    let mut sim = simulator(CompileOptions::default());
    let _ = sim.eval("var log = ''; try { throw 'x'; } finally { log += 'f'; }");
    assert_eq!(sim.global("log").expect("log"), Value::from("f"));
}

// =============================================================================
// Deferred code
// =============================================================================

/// Slow paths follow the body in the order their fast paths were emitted.
#[test]
fn test_deferred_code_is_fifo() {
    let code = compile_function("function f(x, y) { return (x + 1) * (y - 2); }", "f")
        .expect("compile");
    let ret = code
        .relocations_of(RelocMode::JsReturn)
        .next()
        .expect("return")
        .pc;
    let calls: Vec<CallTarget> = code.instructions[ret..]
        .iter()
        .filter_map(|i| match i {
            Instruction::Call { target } => Some(*target),
            _ => None,
        })
        .collect();
    assert_eq!(
        calls,
        [
            CallTarget::Stub(CodeStub::StackCheck),
            CallTarget::Stub(CodeStub::GenericBinaryOp(BinaryOp::Add)),
            CallTarget::Stub(CodeStub::GenericBinaryOp(BinaryOp::Sub)),
        ]
    );
    // Each region jumps back into the body.
    let last = code.instructions.last().expect("code");
    assert!(matches!(last, Instruction::Branch { offset, .. } if *offset < 0));
}

// =============================================================================
// Nesting limit
// =============================================================================

fn nested_sum(depth: usize) -> String {
    let mut source = "1".to_string();
    for _ in 0..depth {
        source = format!("(x + {source})");
    }
    format!("function f(x) {{ return {source}; }}")
}

#[test]
fn test_deep_nesting_reports_stack_overflow() {
    let function = find_function(&nested_sum(40), "f").expect("parse");
    let options = CompileOptions::new().with_max_recursion_depth(16);
    assert!(matches!(compile(&function, &options), Err(Error::StackOverflow)));
    // The same function compiles within the default limit.
    assert!(compile(&function, &CompileOptions::default()).is_ok());
}

#[test]
fn test_stack_overflow_surfaces_from_lazy_compilation() {
    let source = format!("{} f(1)", nested_sum(40));
    let result = run_source_with(&source, CompileOptions::new().with_max_recursion_depth(16));
    assert!(matches!(result, Err(Error::StackOverflow)), "{result:?}");
    assert_eq!(
        run_source(&source).expect("run"),
        Value::Number(41.0)
    );
}

// =============================================================================
// const
// =============================================================================

#[test]
fn test_const_assignment_is_ignored() {
    assert_eq!(eval("const x = 3; x = 5; x"), Value::Number(3.0));
    assert_eq!(
        eval("function f() { const x = 3; x = 5; x++; return x; } f()"),
        Value::Number(3.0)
    );
    assert_eq!(
        eval("function f() { const x = 3; function g() { x = 4; } g(); return x; } f()"),
        Value::Number(3.0)
    );
}

#[test]
fn test_second_const_initialization_keeps_first_value() {
    assert_eq!(eval("const a = 1; const a = 2; a"), Value::Number(1.0));
    assert_eq!(
        eval("function f() { const a = 1; const a = 2; return a; } f()"),
        Value::Number(1.0)
    );
}

#[test]
fn test_const_reads_undefined_before_initialization() {
    assert_eq!(
        eval("function f() { var r = k; const k = 1; return r; } f()"),
        Value::Undefined
    );
}
