//! Unit tests for the frame and emitter as seen through compiled functions:
//! prologue and return sequences, slot addressing, the constant pool,
//! context allocation and jump-target plumbing.

use jitgen::codegen::jump_target::{Direction, Emitter};
use jitgen::codegen::virtual_frame::VirtualFrame;
use jitgen::machine::{AluOp, Condition, Constant, MemOperand, Operand, Reg, RelocMode};
use jitgen::runtime::{CallTarget, RuntimeFunction};
use jitgen::sim::{Simulator, SimulatorOptions, Value};
use jitgen::test_harness::*;
use jitgen::{CompileOptions, Instruction, Opcode};

// ── Prologue and epilogue ──

/// Every function saves lr and fp, then pushes the context and the function.
#[test]
fn test_prologue_builds_frame_header() {
    let code = compile_function("function f(a, b) { return a; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_matches(
        &instructions[..5],
        &[
            InstructionPattern::Push {
                src: Pat::Exact(Reg::LR),
            },
            InstructionPattern::Push {
                src: Pat::Exact(Reg::FP),
            },
            InstructionPattern::Mov {
                dst: Pat::Exact(Reg::FP),
                src: Pat::Exact(Operand::Reg(Reg::SP)),
            },
            InstructionPattern::Push {
                src: Pat::Exact(Reg::CP),
            },
            InstructionPattern::Push {
                src: Pat::Exact(Reg::R1),
            },
        ],
    );
}

/// Stack locals are allocated right after the header, initialized to undefined.
#[test]
fn test_locals_are_initialized_to_undefined() {
    let code = compile_function("function f() { var x, y; return x; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    let Instruction::LoadConstant { dst, index } = instructions[5] else {
        panic!("expected undefined load, got {:?}", instructions[5]);
    };
    assert_eq!(dst, Reg::IP);
    assert_eq!(code.constants[index as usize], Constant::Undefined);
    assert_matches(
        &instructions[6..8],
        &[
            InstructionPattern::Push {
                src: Pat::Exact(Reg::IP),
            },
            InstructionPattern::Push {
                src: Pat::Exact(Reg::IP),
            },
        ],
    );
}

/// The return sequence tears down the frame and pops receiver and parameters.
#[test]
fn test_return_sequence_pops_arguments() {
    let code = compile_function("function f(a, b) { return a; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    let returns: Vec<usize> = code.relocations_of(RelocMode::JsReturn).map(|r| r.pc).collect();
    assert_eq!(returns.len(), 1, "a single shared return sequence");
    assert_matches(
        &instructions[returns[0]..returns[0] + 5],
        &[
            InstructionPattern::Mov {
                dst: Pat::Exact(Reg::SP),
                src: Pat::Exact(Operand::Reg(Reg::FP)),
            },
            InstructionPattern::Pop {
                dst: Pat::Exact(Reg::FP),
            },
            InstructionPattern::Pop {
                dst: Pat::Exact(Reg::LR),
            },
            InstructionPattern::Alu {
                op: Pat::Exact(AluOp::Add),
                set_flags: Pat::Exact(false),
                dst: Pat::Exact(Reg::SP),
                lhs: Pat::Exact(Reg::SP),
                rhs: Pat::Exact(Operand::Imm(12)),
            },
            InstructionPattern::BranchReg {
                reg: Pat::Exact(Reg::LR),
            },
        ],
    );
}

/// Several return statements share one return sequence.
#[test]
fn test_multiple_returns_share_exit() {
    let code = compile_function(
        "function f(a) { if (a) return 1; else if (a === 0) return 2; return 3; }",
        "f",
    )
    .expect("compile");
    assert_eq!(code.relocations_of(RelocMode::JsReturn).count(), 1);
    assert_eq!(count_opcode(&extract_instructions(&code), Opcode::BranchReg), 1);
}

/// Falling off the end returns undefined.
#[test]
fn test_fall_through_returns_undefined() {
    assert_eq!(
        run_source("function f() { var x = 1; } f()").expect("run"),
        Value::Undefined
    );
}

// ── Slot addressing ──

/// Parameters sit above fp: the last one at fp + 8.
#[test]
fn test_parameter_slots_are_fp_relative() {
    let code = compile_function("function f(a, b) { return b; }", "f").expect("compile");
    assert_has_pattern(
        &extract_instructions(&code),
        &[InstructionPattern::Ldr {
            dst: Pat::Any,
            mem: Pat::Exact(MemOperand::new(Reg::FP, 8)),
        }],
    );

    let code = compile_function("function f(a, b) { return a; }", "f").expect("compile");
    assert_has_pattern(
        &extract_instructions(&code),
        &[InstructionPattern::Ldr {
            dst: Pat::Any,
            mem: Pat::Exact(MemOperand::new(Reg::FP, 12)),
        }],
    );
}

/// Locals sit below the context and function slots.
#[test]
fn test_local_slots_are_below_header() {
    let code = compile_function("function f() { var x = 5; return x; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_has_pattern(
        &instructions,
        &[InstructionPattern::Str {
            src: Pat::Any,
            mem: Pat::Exact(MemOperand::new(Reg::FP, -12)),
        }],
    );
    assert_has_pattern(
        &instructions,
        &[InstructionPattern::Ldr {
            dst: Pat::Any,
            mem: Pat::Exact(MemOperand::new(Reg::FP, -12)),
        }],
    );
}

/// The frame model agrees with the addressing used by compiled code.
#[test]
fn test_frame_model_matches_compiled_offsets() {
    let frame = VirtualFrame::new(2, 1);
    assert_eq!(frame.parameter_at(1), MemOperand::new(Reg::FP, 8));
    assert_eq!(frame.local_at(0), MemOperand::new(Reg::FP, -12));
    assert_eq!(frame.context(), MemOperand::new(Reg::FP, -4));
}

// ── Contexts ──

/// A captured variable forces a heap context, stored into the frame's
/// context slot.
#[test]
fn test_captured_variable_allocates_context() {
    let source = "function f() { var x = {}; return function () { return x; }; }";
    let code = compile_function(source, "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert!(has_call(
        &instructions,
        CallTarget::Runtime(RuntimeFunction::NewContext)
    ));
    assert_has_pattern(
        &instructions,
        &[InstructionPattern::Str {
            src: Pat::Exact(Reg::CP),
            mem: Pat::Exact(MemOperand::new(Reg::FP, -4)),
        }],
    );
    assert!(has_opcode(&instructions, Opcode::RecordWrite));
}

#[test]
fn test_context_stores_reach_remembered_set() {
    let mut sim =
        Simulator::new(SimulatorOptions::default(), CompileOptions::default()).expect("simulator");
    let result = sim
        .eval(
            r"
            function counter() {
                var n = 0.5;
                return function () { n = n + 1; return n; };
            }
            var c = counter();
            c(); c(); c()
            ",
        )
        .expect("run");
    assert_eq!(result, Value::Number(3.5));
    // Heap numbers stored into a context go through the write barrier.
    assert!(!sim.remembered_set().is_empty());
}

/// Functions that capture nothing get no context.
#[test]
fn test_uncaptured_function_has_no_context() {
    let code = compile_function("function f(a) { var b = a; return b; }", "f").expect("compile");
    assert!(!has_call(
        &extract_instructions(&code),
        CallTarget::Runtime(RuntimeFunction::NewContext)
    ));
}

// ── Constant pool ──

#[test]
fn test_constant_pool_interns_strings() {
    let code = compile_function(
        "function f() { var a = 'x', b = 'x', c = 'y'; return a + b + c; }",
        "f",
    )
    .expect("compile");
    let strings: Vec<&Constant> = code
        .constants
        .iter()
        .filter(|c| matches!(c, Constant::String(_)))
        .collect();
    assert_eq!(strings, [&Constant::string("x"), &Constant::string("y")]);
}

/// Small integers are immediates, not pool entries.
#[test]
fn test_smi_literals_are_immediates() {
    let code = compile_function("function f() { return 7; }", "f").expect("compile");
    assert!(!code.constants.iter().any(|c| matches!(c, Constant::Smi(_))));
    assert_has_pattern(
        &extract_instructions(&code),
        &[InstructionPattern::Mov {
            dst: Pat::Exact(Reg::R0),
            src: Pat::Exact(Operand::smi(7)),
        }],
    );
}

/// Doubles and integers outside the smi range are pool entries.
#[test]
fn test_heap_numbers_are_pool_entries() {
    let code = compile_function("function f() { return 1.5 + 1073741824; }", "f")
        .expect("compile");
    assert!(code.constants.contains(&Constant::Number(1.5)));
    assert!(code.constants.contains(&Constant::Number(1_073_741_824.0)));
}

// ── Stack check ──

/// Every function entry compares sp against the limit and branches out of
/// line.
#[test]
fn test_function_entry_checks_stack() {
    let code = compile_function("function f() { return 1; }", "f").expect("compile");
    let instructions = extract_instructions(&code);
    assert_has_pattern(
        &instructions,
        &[
            InstructionPattern::Cmp {
                lhs: Pat::Exact(Reg::SP),
                rhs: Pat::Exact(Operand::Reg(Reg::IP)),
            },
            InstructionPattern::Branch {
                cond: Pat::Exact(Condition::Lo),
                offset: Pat::Predicate(|offset| *offset > 0),
            },
        ],
    );
}

/// Unbounded recursion hits the stack guard instead of running off the stack.
#[test]
fn test_deep_recursion_throws_range_error() {
    let err = run_source("function f(n) { return f(n + 1); } f(0)").expect_err("overflow");
    let jitgen::Error::Thrown(message) = err else {
        panic!("expected a thrown exception, got {err:?}");
    };
    assert!(message.starts_with("RangeError"), "{message}");
}

// ── Branch resolution ──

/// Every branch in every compiled function lands inside its code object.
#[test]
fn test_branches_resolve_inside_code() {
    let source = r"
        function f(o, n) {
            var s = 0;
            for (var i = 0; i < n; i++) {
                if (i % 2) continue;
                s += i;
            }
            for (var k in o) s += o[k];
            while (s > 100) s = s >> 1;
            try { s = g(s); } catch (e) { s = -1; } finally { s = s | 0; }
            return s > 0 ? s : -s;
        }
        function g(x) { if (x > 50) throw x; return x; }
    ";
    for name in ["f", "g"] {
        let code = compile_function(source, name).expect("compile");
        let len = code.len() as i64;
        for (pc, instr) in code.instructions.iter().enumerate() {
            if let Some(offset) = instr.branch_offset() {
                let target = pc as i64 + i64::from(offset);
                assert!((0..len).contains(&target), "{name}: branch at {pc} to {target}");
            }
        }
    }
    assert_eq!(
        run_source(&format!("{source} f({{a: 1, b: 2}}, 10)")).expect("run"),
        Value::Number(23.0)
    );
}

// ── Emitter ──

fn emitter_with_frame(parameters: usize, locals: usize) -> Emitter {
    let mut emitter = Emitter::new();
    let mut frame = VirtualFrame::new(parameters, locals);
    frame.enter(&mut emitter.masm);
    frame.allocate_stack_slots(&mut emitter.masm);
    emitter.set_frame(frame);
    emitter
}

/// A subroutine call keeps the frame valid and spills it first.
#[test]
fn test_emitter_call_spills_and_links() {
    let mut emitter = emitter_with_frame(0, 0);
    let subroutine = emitter.forward_target();
    emitter
        .frame()
        .expect("frame")
        .push_constant(Constant::Smi(3));
    emitter.call(subroutine).expect("call");

    assert!(emitter.has_valid_frame());
    assert!(emitter.frame_ref().expect("frame").is_spilled());
    assert_eq!(emitter.target(subroutine).predecessors(), 1);
    assert!(matches!(
        emitter.masm.instructions().last(),
        Some(Instruction::BranchLink { .. })
    ));
}

/// Targets nothing reaches are not bound.
#[test]
fn test_bind_if_reached_skips_dead_targets() {
    let mut emitter = emitter_with_frame(0, 0);
    let live = emitter.forward_target();
    let dead = emitter.forward_target();
    emitter.jump(live).expect("jump");
    emitter.bind_if_reached(dead).expect("dead");
    assert!(!emitter.is_bound(dead));
    emitter.bind_if_reached(live).expect("live");
    assert!(emitter.is_bound(live));
    assert!(emitter.has_valid_frame());
}

/// Forgetting a target is only allowed before it is bound.
#[test]
fn test_unuse_only_before_bind() {
    let mut emitter = emitter_with_frame(0, 0);
    let target = emitter.new_target(Direction::Bidirectional);
    emitter.unuse(target).expect("unused target");
    emitter.bind(target).expect("bind");
    assert!(emitter.unuse(target).is_err());
}

/// Finishing releases the registers held by the current frame.
#[test]
fn test_finish_releases_registers() {
    let mut emitter = emitter_with_frame(1, 1);
    emitter
        .frame()
        .expect("frame")
        .push_register(Reg::R4);
    assert!(emitter.registers.is_used(Reg::R4));
    let (masm, registers) = emitter.finish();
    assert!(registers.all_free());
    assert!(!masm.instructions().is_empty());
}
