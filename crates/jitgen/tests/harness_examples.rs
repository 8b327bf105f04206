//! Example tests demonstrating the test harness.
//!
//! These compile small programs, check the shape of the generated code and
//! run them in the simulator.

use jitgen::machine::{AluOp, Condition, Constant, Operand, Reg, RelocMode};
use jitgen::runtime::{Builtin, CallTarget, CodeStub, RuntimeFunction};
use jitgen::sim::Value;
use jitgen::test_harness::*;
use jitgen::{CompileOptions, Opcode, compile};

// =============================================================================
// Smi arithmetic
// =============================================================================

#[test]
fn test_increment_returns_42() {
    let result = run_source("function f(x) { return x + 1 } f(41) === 42").expect("run");
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_increment_uses_inline_smi_add() {
    let code = compile_function("function f(x) { return x + 1 }", "f").expect("compile");
    let instructions = extract_instructions(&code);

    assert_has_pattern(
        &instructions,
        &[
            InstructionPattern::Alu {
                op: Pat::Exact(AluOp::Add),
                set_flags: Pat::Exact(true),
                dst: Pat::Exact(Reg::R0),
                lhs: Pat::Exact(Reg::R0),
                rhs: Pat::Exact(Operand::smi(1)),
            },
            InstructionPattern::Branch {
                cond: Pat::Exact(Condition::Vs),
                offset: Pat::Any,
            },
            InstructionPattern::Tst {
                lhs: Pat::Exact(Reg::R0),
                rhs: Pat::Exact(Operand::Imm(1)),
            },
            InstructionPattern::Branch {
                cond: Pat::Exact(Condition::Ne),
                offset: Pat::Any,
            },
        ],
    );
}

/// The slow path is out of line: the generic stub call comes after the
/// return sequence.
#[test]
fn test_increment_slow_path_is_deferred() {
    let code = compile_function("function f(x) { return x + 1 }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    let ret = code
        .relocations_of(RelocMode::JsReturn)
        .next()
        .expect("return sequence")
        .pc;
    let stub = CallTarget::Stub(CodeStub::GenericBinaryOp(jitgen::ast::BinaryOp::Add));
    let position = instructions
        .iter()
        .position(|i| matches!(i, jitgen::Instruction::Call { target } if *target == stub))
        .expect("generic add stub");
    assert!(position > ret, "stub call at {position}, return at {ret}");
}

#[test]
fn test_increment_overflows_into_heap_number() {
    let result = run_source("function f(x) { return x + 1 } f(1073741824)").expect("run");
    assert_eq!(result, Value::Number(1_073_741_825.0));

    // The largest smi plus one leaves the smi range.
    let result = run_source("function f(x) { return x + 1 } f(1073741823)").expect("run");
    assert_eq!(result, Value::Number(1_073_741_824.0));
}

#[test]
fn test_non_smi_operands_take_generic_path() {
    assert_eq!(
        run_source("function f(x) { return x + 1 } f('4')").expect("run"),
        Value::from("41")
    );
    assert_eq!(
        run_source("function f(x) { return x + 1 } f(0.5)").expect("run"),
        Value::Number(1.5)
    );
}

// =============================================================================
// for-in
// =============================================================================

#[test]
fn test_for_in_sums_values() {
    let source = r"
        function f(o) {
            var sum = 0;
            for (var k in o) sum += o[k];
            return sum;
        }
        f({a: 1, b: 2, c: 3})
    ";
    assert_eq!(run_source(source).expect("run"), Value::Number(6.0));
}

#[test]
fn test_for_in_calls_enumeration_runtime() {
    let code = compile_function(
        "function f(o) { var n = 0; for (var k in o) n++; return n; }",
        "f",
    )
    .expect("compile");
    let instructions = extract_instructions(&code);
    assert!(has_call(
        &instructions,
        CallTarget::Runtime(RuntimeFunction::GetPropertyNamesFast)
    ));
    assert!(has_call(
        &instructions,
        CallTarget::Builtin(Builtin::FilterKey)
    ));
    // Primitives are wrapped before enumeration.
    assert!(has_call(&instructions, CallTarget::Builtin(Builtin::ToObject)));
}

#[test]
fn test_for_in_over_null_and_undefined_is_empty() {
    let source = r"
        function count(o) { var n = 0; for (var k in o) n++; return n; }
        count(null) + count(undefined)
    ";
    assert_eq!(run_source(source).expect("run"), Value::Number(0.0));
}

// =============================================================================
// Exceptions
// =============================================================================

#[test]
fn test_try_catch_returns_seven() {
    let source = r"
        function f() {
            try { throw 3; } catch (e) { return e + 4; }
        }
        f()
    ";
    assert_eq!(run_source(source).expect("run"), Value::Number(7.0));
}

#[test]
fn test_catch_pushes_catch_context() {
    let code = compile_function(
        "function f() { try { throw 3; } catch (e) { return e; } }",
        "f",
    )
    .expect("compile");
    let instructions = extract_instructions(&code);
    assert!(has_call(
        &instructions,
        CallTarget::Runtime(RuntimeFunction::CreateCatchExtensionObject)
    ));
    assert!(has_call(
        &instructions,
        CallTarget::Runtime(RuntimeFunction::PushCatchContext)
    ));
}

#[test]
fn test_uncaught_exception_is_reported() {
    let err = run_source("throw 'boom'").expect_err("uncaught");
    assert!(matches!(err, jitgen::Error::Thrown(ref message) if message == "boom"));
}

// =============================================================================
// switch
// =============================================================================

const LETTER_SWITCH: &str = r"
    function f(n) {
        switch (n) {
            case 0: return 'a';
            case 1: return 'b';
            case 2: return 'c';
            case 3: return 'd';
            case 4: return 'e';
            default: return 'z';
        }
    }
";

#[test]
fn test_fast_switch_dispatch() {
    let letters = format!("{LETTER_SWITCH} f(0) + f(1) + f(2) + f(3) + f(4) + f(5) + f(-1)");
    assert_eq!(run_source(&letters).expect("run"), Value::from("abcdezz"));
    let fraction = format!("{LETTER_SWITCH} f(2.5) + f('2')");
    assert_eq!(run_source(&fraction).expect("run"), Value::from("zz"));
    let heap_integer = format!("{LETTER_SWITCH} f(1.5 + 1.5)");
    assert_eq!(run_source(&heap_integer).expect("run"), Value::from("d"));
}

#[test]
fn test_fast_switch_uses_jump_table() {
    let code = compile_function(LETTER_SWITCH, "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_eq!(count_opcode(&instructions, Opcode::JumpTable), 1);
    // Heap numbers are converted before indexing.
    assert!(has_call(
        &instructions,
        CallTarget::Runtime(RuntimeFunction::NumberToSmi)
    ));
}

#[test]
fn test_switch_below_min_cases_compares_each_label() {
    let options = CompileOptions::new().with_fast_switch(5, 100);
    let function = find_function(LETTER_SWITCH, "f").expect("parse");
    let code = compile(&function, &options).expect("compile");
    let instructions = extract_instructions(&code);
    assert!(!has_opcode(&instructions, Opcode::JumpTable));

    let source = format!("{LETTER_SWITCH} f(3) + f(9)");
    assert_eq!(
        run_source_with(&source, options).expect("run"),
        Value::from("dz")
    );
}

// =============================================================================
// Conditions
// =============================================================================

const TYPEOF_GUARD: &str = "function f(a, b) { return typeof a === 'number' && a < b; }";

#[test]
fn test_typeof_guard_results() {
    let source = format!("{TYPEOF_GUARD} [f(1, 2), f(3, 2), f('1', 2), f(1.5, 2)].join()");
    assert_eq!(
        run_source(&source).expect("run"),
        Value::from("true,false,false,true")
    );
}

#[test]
fn test_typeof_number_is_inline() {
    let code = compile_function(TYPEOF_GUARD, "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert!(!has_call(
        &instructions,
        CallTarget::Runtime(RuntimeFunction::Typeof)
    ));
    assert_has_pattern(
        &instructions,
        &[
            InstructionPattern::Tst {
                lhs: Pat::Exact(Reg::R1),
                rhs: Pat::Exact(Operand::Imm(1)),
            },
            InstructionPattern::Branch {
                cond: Pat::Exact(Condition::Eq),
                offset: Pat::Any,
            },
            InstructionPattern::Ldr {
                dst: Pat::Exact(Reg::R1),
                mem: Pat::Any,
            },
        ],
    );
    let heap_number_map = code
        .constants
        .iter()
        .position(|c| *c == Constant::HeapNumberMap)
        .expect("heap number map constant");
    assert!(instructions.iter().any(|i| matches!(
        i,
        jitgen::Instruction::LoadConstant { index, .. } if *index as usize == heap_number_map
    )));
}

// =============================================================================
// Literals
// =============================================================================

const REGEXP: &str = "function f() { return /ab+c/g; }";

#[test]
fn test_regexp_literal_materializes_out_of_line() {
    let code = compile_function(REGEXP, "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert!(has_call(
        &instructions,
        CallTarget::Runtime(RuntimeFunction::MaterializeRegExpLiteral)
    ));
}

#[test]
fn test_regexp_literal_reuses_boilerplate() {
    let same = format!("{REGEXP} f() === f()");
    assert_eq!(run_source(&same).expect("run"), Value::Bool(true));
    let kind = format!("{REGEXP} typeof f()");
    assert_eq!(run_source(&kind).expect("run"), Value::from("object"));
    let shared = format!("{REGEXP} f().marker = 1; f().marker");
    assert_eq!(run_source(&shared).expect("run"), Value::Number(1.0));
}

// =============================================================================
// Output and tracing
// =============================================================================

#[test]
fn test_print_collects_output() {
    let mut sim = jitgen::sim::Simulator::new(
        jitgen::sim::SimulatorOptions::default(),
        CompileOptions::default(),
    )
    .expect("simulator");
    sim.eval("print('hello', 1 + 2); print([1, 2])").expect("run");
    assert_eq!(sim.output(), ["hello 3", "1,2"]);
}

#[test]
fn test_trace_calls_records_entry_and_exit() {
    let mut sim = jitgen::sim::Simulator::new(
        jitgen::sim::SimulatorOptions::default(),
        CompileOptions::new().with_trace_calls(true),
    )
    .expect("simulator");
    sim.eval("function f(x) { return x * 2 } f(21)").expect("run");
    let trace = sim.trace();
    assert!(trace.iter().any(|line| line == "enter f"), "{trace:?}");
    assert!(trace.iter().any(|line| line == "exit f 42"), "{trace:?}");
}
