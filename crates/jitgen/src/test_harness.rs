//! Test harness for jitgen unit and integration tests
//!
//! This module provides utilities for compiling script source, running it in
//! the simulator and matching the generated instruction stream.
//!
//! # Example
//!
//! ```rust
//! use jitgen::test_harness::*;
//! use jitgen::machine::{AluOp, Condition};
//! use jitgen::sim::Value;
//!
//! let code = compile_function("function f(x) { return x + 1; }", "f").unwrap();
//! let instructions = extract_instructions(&code);
//!
//! // The inline smi add sets the flags for the overflow check.
//! assert_has_pattern(&instructions, &[InstructionPattern::Alu {
//!     op: Pat::Exact(AluOp::Add),
//!     set_flags: Pat::Exact(true),
//!     dst: Pat::Any,
//!     lhs: Pat::Any,
//!     rhs: Pat::Any,
//! }, InstructionPattern::Branch {
//!     cond: Pat::Exact(Condition::Vs),
//!     offset: Pat::Any,
//! }]);
//!
//! let result = run_source("function f(x) { return x + 1; } f(41)").unwrap();
//! assert_eq!(result, Value::Number(42.0));
//! ```

#![allow(
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::manual_assert,
    clippy::missing_panics_doc,
    clippy::uninlined_format_args
)]

use std::rc::Rc;

use crate::ast::{FunctionLiteral, ScopeKind};
use crate::machine::{AluOp, Code, Condition, Instruction, MemOperand, Opcode, Operand, Reg};
use crate::runtime::CallTarget;
use crate::sim::{Simulator, SimulatorOptions, Value};
use crate::{CompileOptions, Error, Result, compile};

/// Parse and resolve a global program
pub fn parse(source: &str) -> Result<FunctionLiteral> {
    crate::frontend::parse_program(source, ScopeKind::Global)
}

/// Compile the top-level code of a program
pub fn compile_source(source: &str) -> Result<Code> {
    compile_source_with(source, &CompileOptions::default())
}

/// Compile the top-level code of a program with custom options
pub fn compile_source_with(source: &str, options: &CompileOptions) -> Result<Code> {
    compile(&parse(source)?, options)
}

/// Find a function declared at the top level of a program
pub fn find_function(source: &str, name: &str) -> Result<Rc<FunctionLiteral>> {
    parse(source)?
        .scope
        .declarations
        .iter()
        .find(|declaration| &*declaration.variable.name == name)
        .and_then(|declaration| declaration.function.clone())
        .ok_or_else(|| Error::Internal(format!("no function declaration named {name}")))
}

/// Compile a function declared at the top level of a program
pub fn compile_function(source: &str, name: &str) -> Result<Code> {
    let function = find_function(source, name)?;
    compile(&function, &CompileOptions::default())
}

/// Run a program in a fresh simulator and return its completion value
pub fn run_source(source: &str) -> Result<Value> {
    run_source_with(source, CompileOptions::default())
}

/// Run a program in a fresh simulator with custom compile options
pub fn run_source_with(source: &str, options: CompileOptions) -> Result<Value> {
    let mut sim = Simulator::new(SimulatorOptions::default(), options)?;
    sim.eval(source)
}

/// Extract the instruction sequence from a code object
pub fn extract_instructions(code: &Code) -> Vec<Instruction> {
    code.instructions.clone()
}

/// Pattern matching for instruction fields
#[derive(Debug, Clone)]
pub enum Pat<T> {
    /// Match any value
    Any,
    /// Match exact value
    Exact(T),
    /// Match if value satisfies predicate
    Predicate(fn(&T) -> bool),
}

impl<T: PartialEq> Pat<T> {
    /// Check if a value matches this pattern
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Exact(expected) => value == expected,
            Pat::Predicate(pred) => pred(value),
        }
    }
}

/// Pattern for matching instructions in tests
///
/// This allows flexible matching of instruction sequences where some
/// fields can be wildcards or predicates.
#[derive(Debug, Clone)]
pub enum InstructionPattern {
    /// Match any instruction
    Any,
    Stop,
    Mov {
        dst: Pat<Reg>,
        src: Pat<Operand>,
    },
    Mvn {
        dst: Pat<Reg>,
        src: Pat<Operand>,
    },
    Alu {
        op: Pat<AluOp>,
        set_flags: Pat<bool>,
        dst: Pat<Reg>,
        lhs: Pat<Reg>,
        rhs: Pat<Operand>,
    },
    Cmp {
        lhs: Pat<Reg>,
        rhs: Pat<Operand>,
    },
    Tst {
        lhs: Pat<Reg>,
        rhs: Pat<Operand>,
    },
    Ldr {
        dst: Pat<Reg>,
        mem: Pat<MemOperand>,
    },
    Str {
        src: Pat<Reg>,
        mem: Pat<MemOperand>,
    },
    LoadConstant {
        dst: Pat<Reg>,
        index: Pat<u32>,
    },
    Push {
        src: Pat<Reg>,
    },
    Pop {
        dst: Pat<Reg>,
    },
    Branch {
        cond: Pat<Condition>,
        offset: Pat<i32>,
    },
    BranchLink {
        offset: Pat<i32>,
    },
    BranchReg {
        reg: Pat<Reg>,
    },
    JumpTable {
        index: Pat<Reg>,
    },
    Call {
        target: Pat<CallTarget>,
    },
    RecordWrite {
        object: Pat<Reg>,
        offset: Pat<Reg>,
        scratch: Pat<Reg>,
    },
}

impl InstructionPattern {
    /// Check if an instruction matches this pattern
    pub fn matches(&self, instr: &Instruction) -> bool {
        use InstructionPattern as P;

        match (self, instr) {
            (P::Any, _) => true,
            (P::Stop, Instruction::Stop) => true,
            (P::Mov { dst: d_pat, src: s_pat }, Instruction::Mov { dst, src })
            | (P::Mvn { dst: d_pat, src: s_pat }, Instruction::Mvn { dst, src }) => {
                d_pat.matches(dst) && s_pat.matches(src)
            }
            (
                P::Alu {
                    op: op_pat,
                    set_flags: f_pat,
                    dst: d_pat,
                    lhs: l_pat,
                    rhs: r_pat,
                },
                Instruction::Alu {
                    op,
                    set_flags,
                    dst,
                    lhs,
                    rhs,
                },
            ) => {
                op_pat.matches(op)
                    && f_pat.matches(set_flags)
                    && d_pat.matches(dst)
                    && l_pat.matches(lhs)
                    && r_pat.matches(rhs)
            }
            (P::Cmp { lhs: l_pat, rhs: r_pat }, Instruction::Cmp { lhs, rhs })
            | (P::Tst { lhs: l_pat, rhs: r_pat }, Instruction::Tst { lhs, rhs }) => {
                l_pat.matches(lhs) && r_pat.matches(rhs)
            }
            (P::Ldr { dst: r_pat, mem: m_pat }, Instruction::Ldr { dst: reg, mem })
            | (P::Str { src: r_pat, mem: m_pat }, Instruction::Str { src: reg, mem }) => {
                r_pat.matches(reg) && m_pat.matches(mem)
            }
            (P::LoadConstant { dst: d_pat, index: i_pat }, Instruction::LoadConstant { dst, index }) => {
                d_pat.matches(dst) && i_pat.matches(index)
            }
            (P::Push { src: pat }, Instruction::Push { src: reg })
            | (P::Pop { dst: pat }, Instruction::Pop { dst: reg })
            | (P::BranchReg { reg: pat }, Instruction::BranchReg { reg })
            | (P::JumpTable { index: pat }, Instruction::JumpTable { index: reg }) => {
                pat.matches(reg)
            }
            (P::Branch { cond: c_pat, offset: o_pat }, Instruction::Branch { cond, offset }) => {
                c_pat.matches(cond) && o_pat.matches(offset)
            }
            (P::BranchLink { offset: o_pat }, Instruction::BranchLink { offset }) => {
                o_pat.matches(offset)
            }
            (P::Call { target: t_pat }, Instruction::Call { target }) => t_pat.matches(target),
            (
                P::RecordWrite {
                    object: o_pat,
                    offset: f_pat,
                    scratch: s_pat,
                },
                Instruction::RecordWrite {
                    object,
                    offset,
                    scratch,
                },
            ) => o_pat.matches(object) && f_pat.matches(offset) && s_pat.matches(scratch),
            _ => false,
        }
    }
}

/// Pattern matching a call to exactly `target`
pub fn call(target: CallTarget) -> InstructionPattern {
    InstructionPattern::Call {
        target: Pat::Exact(target),
    }
}

/// Find the first occurrence of a pattern in an instruction sequence
///
/// Returns the starting index if found
pub fn find_pattern(instructions: &[Instruction], pattern: &[InstructionPattern]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }

    'outer: for start in 0..=instructions.len().saturating_sub(pattern.len()) {
        if start + pattern.len() > instructions.len() {
            break;
        }
        for (i, pat) in pattern.iter().enumerate() {
            if !pat.matches(&instructions[start + i]) {
                continue 'outer;
            }
        }
        return Some(start);
    }
    None
}

/// Assert that an instruction sequence contains a pattern
///
/// Panics with a descriptive message if the pattern is not found
pub fn assert_has_pattern(instructions: &[Instruction], pattern: &[InstructionPattern]) {
    if find_pattern(instructions, pattern).is_none() {
        panic!(
            "Pattern not found in instruction sequence.\n\nExpected pattern:\n{}\n\nActual instructions:\n{}",
            format_patterns(pattern),
            format_instructions(instructions)
        );
    }
}

/// Assert that instructions match a pattern exactly
///
/// Panics with a descriptive message if they don't match
pub fn assert_matches(instructions: &[Instruction], pattern: &[InstructionPattern]) {
    if instructions.len() != pattern.len() {
        panic!(
            "Instruction count mismatch: expected {}, got {}.\n\nExpected pattern:\n{}\n\nActual instructions:\n{}",
            pattern.len(),
            instructions.len(),
            format_patterns(pattern),
            format_instructions(instructions)
        );
    }

    for (i, (instr, pat)) in instructions.iter().zip(pattern.iter()).enumerate() {
        if !pat.matches(instr) {
            panic!(
                "Instruction mismatch at index {}:\nExpected: {:?}\nActual:   {:?}\n\nFull pattern:\n{}\n\nFull instructions:\n{}",
                i,
                pat,
                instr,
                format_patterns(pattern),
                format_instructions(instructions)
            );
        }
    }
}

/// Format patterns for display
fn format_patterns(patterns: &[InstructionPattern]) -> String {
    patterns
        .iter()
        .map(|p| format!("  {:?}", p))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format instructions for display
fn format_instructions(instructions: &[Instruction]) -> String {
    instructions
        .iter()
        .enumerate()
        .map(|(pc, i)| format!("  {:4}: {:?}", pc, i))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Count instructions with a specific opcode
pub fn count_opcode(instructions: &[Instruction], opcode: Opcode) -> usize {
    instructions.iter().filter(|i| i.opcode() == opcode).count()
}

/// Check if an instruction sequence contains a specific opcode
pub fn has_opcode(instructions: &[Instruction], opcode: Opcode) -> bool {
    instructions.iter().any(|i| i.opcode() == opcode)
}

/// Filter instructions by opcode
pub fn filter_by_opcode(instructions: &[Instruction], opcode: Opcode) -> Vec<&Instruction> {
    instructions.iter().filter(|i| i.opcode() == opcode).collect()
}

/// Count calls to a specific target
pub fn count_calls(instructions: &[Instruction], target: CallTarget) -> usize {
    instructions
        .iter()
        .filter(|i| matches!(i, Instruction::Call { target: t } if *t == target))
        .count()
}

/// Check if an instruction sequence calls a specific target
pub fn has_call(instructions: &[Instruction], target: CallTarget) -> bool {
    count_calls(instructions, target) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CodeStub, RuntimeFunction};

    #[test]
    fn test_instruction_pattern_matching() {
        let instr = Instruction::Alu {
            op: AluOp::Add,
            set_flags: true,
            dst: Reg::R0,
            lhs: Reg::R1,
            rhs: Operand::Reg(Reg::R0),
        };

        // Exact match
        let pattern_exact = InstructionPattern::Alu {
            op: Pat::Exact(AluOp::Add),
            set_flags: Pat::Exact(true),
            dst: Pat::Exact(Reg::R0),
            lhs: Pat::Exact(Reg::R1),
            rhs: Pat::Exact(Operand::Reg(Reg::R0)),
        };
        assert!(pattern_exact.matches(&instr));

        // Predicate match
        let pattern_predicate = InstructionPattern::Alu {
            op: Pat::Any,
            set_flags: Pat::Any,
            dst: Pat::Predicate(|reg| reg.is_allocatable()),
            lhs: Pat::Any,
            rhs: Pat::Any,
        };
        assert!(pattern_predicate.matches(&instr));

        // Wrong instruction type
        let pattern_wrong = InstructionPattern::Cmp {
            lhs: Pat::Any,
            rhs: Pat::Any,
        };
        assert!(!pattern_wrong.matches(&instr));
    }

    #[test]
    fn test_find_pattern() {
        let instructions = vec![
            Instruction::Push { src: Reg::R0 },
            Instruction::Call {
                target: CallTarget::Stub(CodeStub::StackCheck),
            },
            Instruction::Pop { dst: Reg::R1 },
        ];

        let pattern = vec![
            call(CallTarget::Stub(CodeStub::StackCheck)),
            InstructionPattern::Pop {
                dst: Pat::Exact(Reg::R1),
            },
        ];
        assert_eq!(find_pattern(&instructions, &pattern), Some(1));

        let missing = vec![call(CallTarget::Runtime(RuntimeFunction::Throw))];
        assert_eq!(find_pattern(&instructions, &missing), None);
        assert_eq!(count_opcode(&instructions, Opcode::Call), 1);
        assert!(has_call(
            &instructions,
            CallTarget::Stub(CodeStub::StackCheck)
        ));
    }

    #[test]
    fn test_compile_and_run_helpers() {
        let code = compile_source("1 + 2").unwrap();
        assert!(!code.is_empty());
        assert!(compile_function("var f = 1;", "f").is_err());
        assert_eq!(run_source("1 + 2").unwrap(), Value::Number(3.0));
    }
}
