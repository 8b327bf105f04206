//! Out-of-line code for slow cases.
//!
//! The hot path branches to a record's entry target and binds its exit
//! target; the record's code is emitted after the function body, in creation
//! order, and ends with a jump back to the exit. All records use the fixed
//! register conventions of spilled code: the operand and the result travel
//! in `r0`, literal boilerplates in `r2`.

use std::rc::Rc;

use tracing::trace;

use super::jump_target::{Direction, Emitter, TargetId};
use crate::ast::BinaryOp;
use crate::layout;
use crate::machine::{AluOp, Constant, Operand, Reg};
use crate::runtime::{Builtin, CallTarget, CodeStub, RuntimeFunction};
use crate::{Error, Result};

/// What a deferred region does.
#[derive(Debug, Clone)]
pub enum DeferredKind {
    /// Undo an optimistic smi operation on `r0` with the literal `value`
    /// and call the generic stub. `reversed` when the literal is the left
    /// operand.
    InlineSmiOperation {
        op: BinaryOp,
        value: i32,
        reversed: bool,
    },
    /// Negate a non-smi, zero or most negative smi in `r0`.
    UnarySub,
    /// Invert a non-smi in `r0`.
    BitNot,
    /// Create the boilerplate of an object literal; `r1` holds the literals
    /// array and the boilerplate is returned in `r2`.
    ObjectLiteral {
        literal_index: usize,
        constant_properties: Rc<[Constant]>,
    },
    /// Like [`DeferredKind::ObjectLiteral`] for array literals.
    ArrayLiteral {
        literal_index: usize,
        constant_elements: Rc<[Constant]>,
    },
    /// Like [`DeferredKind::ObjectLiteral`] for regular expressions.
    RegExpLiteral {
        literal_index: usize,
        pattern: Rc<str>,
        flags: Rc<str>,
    },
    /// `sp` crossed the stack limit.
    StackCheck,
}

impl DeferredKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InlineSmiOperation { .. } => "DeferredInlineSmiOperation",
            Self::UnarySub => "DeferredUnarySub",
            Self::BitNot => "DeferredBitNot",
            Self::ObjectLiteral { .. } => "DeferredObjectLiteral",
            Self::ArrayLiteral { .. } => "DeferredArrayLiteral",
            Self::RegExpLiteral { .. } => "DeferredRegExpLiteral",
            Self::StackCheck => "DeferredStackCheck",
        }
    }
}

#[derive(Debug)]
pub struct DeferredCode {
    pub kind: DeferredKind,
    pub entry: TargetId,
    pub exit: TargetId,
}

impl DeferredCode {
    /// Emits the region. The entry target must have been branched to.
    fn generate(&self, emitter: &mut Emitter) -> Result<()> {
        emitter.bind(self.entry)?;
        emitter.masm.comment(format!("[ {}", self.kind.name()));
        match &self.kind {
            DeferredKind::InlineSmiOperation {
                op,
                value,
                reversed,
            } => generate_inline_smi(emitter, *op, *value, *reversed)?,
            DeferredKind::UnarySub => {
                let (masm, frame) = emitter.parts()?;
                frame.call(masm, CallTarget::Stub(CodeStub::UnarySub), 0)?;
            }
            DeferredKind::BitNot => {
                let (masm, frame) = emitter.parts()?;
                frame.emit_push(masm, Reg::R0)?;
                frame.call(masm, CallTarget::Builtin(Builtin::BitNot), 1)?;
            }
            DeferredKind::ObjectLiteral {
                literal_index,
                constant_properties,
            } => materialize(
                emitter,
                *literal_index,
                Constant::ObjectDescription(Rc::clone(constant_properties)),
                RuntimeFunction::CreateObjectLiteralBoilerplate,
            )?,
            DeferredKind::ArrayLiteral {
                literal_index,
                constant_elements,
            } => materialize(
                emitter,
                *literal_index,
                Constant::Array(Rc::clone(constant_elements)),
                RuntimeFunction::CreateArrayLiteralBoilerplate,
            )?,
            DeferredKind::RegExpLiteral {
                literal_index,
                pattern,
                flags,
            } => {
                let (masm, frame) = emitter.parts()?;
                frame.emit_push(masm, Reg::R1)?;
                masm.mov(Reg::R0, Operand::smi(*literal_index as i32));
                frame.emit_push(masm, Reg::R0)?;
                masm.load_constant(Reg::R0, Constant::String(Rc::clone(pattern)));
                frame.emit_push(masm, Reg::R0)?;
                masm.load_constant(Reg::R0, Constant::String(Rc::clone(flags)));
                frame.emit_push(masm, Reg::R0)?;
                frame.call(
                    masm,
                    CallTarget::Runtime(RuntimeFunction::MaterializeRegExpLiteral),
                    4,
                )?;
                masm.mov(Reg::R2, Reg::R0);
            }
            DeferredKind::StackCheck => {
                let (masm, frame) = emitter.parts()?;
                frame.call(masm, CallTarget::Stub(CodeStub::StackCheck), 0)?;
            }
        }
        emitter.masm.comment("]");
        emitter.jump(self.exit)
    }
}

/// Restores the operands of an optimistic smi operation into `r1` (left)
/// and `r0` (right) and calls the generic stub.
fn generate_inline_smi(
    emitter: &mut Emitter,
    op: BinaryOp,
    value: i32,
    reversed: bool,
) -> Result<()> {
    let masm = &mut emitter.masm;
    let literal = Operand::smi(value);
    match op {
        BinaryOp::Add => {
            if reversed {
                masm.sub(Reg::R0, Reg::R0, literal);
                masm.mov(Reg::R1, literal);
            } else {
                masm.sub(Reg::R1, Reg::R0, literal);
                masm.mov(Reg::R0, literal);
            }
        }
        BinaryOp::Sub => {
            if reversed {
                masm.alu(AluOp::Rsb, false, Reg::R0, Reg::R0, literal);
                masm.mov(Reg::R1, literal);
            } else {
                masm.add(Reg::R1, Reg::R0, literal);
                masm.mov(Reg::R0, literal);
            }
        }
        BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::BitAnd => {
            if reversed {
                masm.mov(Reg::R1, literal);
            } else {
                masm.mov(Reg::R1, Reg::R0);
                masm.mov(Reg::R0, literal);
            }
        }
        BinaryOp::Shl | BinaryOp::Sar | BinaryOp::Shr => {
            if reversed {
                return Err(Error::Internal(
                    "reversed shift has no inline smi path".to_string(),
                ));
            }
            masm.mov(Reg::R1, Reg::R0);
            masm.mov(Reg::R0, literal);
        }
        other => {
            return Err(Error::Internal(format!(
                "no inline smi path for {}",
                other.as_str()
            )));
        }
    }
    let (masm, frame) = emitter.parts()?;
    frame.call(masm, CallTarget::Stub(CodeStub::GenericBinaryOp(op)), 0)
}

/// Calls `function(literals, index, description)` with the literals array
/// in `r1` and leaves the boilerplate in `r2`.
fn materialize(
    emitter: &mut Emitter,
    literal_index: usize,
    description: Constant,
    function: RuntimeFunction,
) -> Result<()> {
    let (masm, frame) = emitter.parts()?;
    frame.emit_push(masm, Reg::R1)?;
    masm.mov(Reg::R0, Operand::smi(literal_index as i32));
    frame.emit_push(masm, Reg::R0)?;
    masm.load_constant(Reg::R0, description);
    frame.emit_push(masm, Reg::R0)?;
    frame.call(masm, CallTarget::Runtime(function), 3)?;
    masm.mov(Reg::R2, Reg::R0);
    Ok(())
}

/// Deferred regions of one function, in creation order.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    records: Vec<DeferredCode>,
}

impl DeferredQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a record with fresh entry and exit targets.
    pub fn push(&mut self, emitter: &mut Emitter, kind: DeferredKind) -> &DeferredCode {
        let entry = emitter.forward_target();
        let exit = emitter.new_target(Direction::Bidirectional);
        self.records.push(DeferredCode { kind, entry, exit });
        let last = self.records.len() - 1;
        &self.records[last]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Discards every record without emitting it.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Emits every record whose entry was reached, in creation order.
    pub fn process(&mut self, emitter: &mut Emitter) -> Result<()> {
        for record in std::mem::take(&mut self.records) {
            if !emitter.is_linked(record.entry) {
                continue;
            }
            trace!(kind = record.kind.name(), "emit deferred code");
            record.generate(emitter)?;
        }
        Ok(())
    }
}

/// Untagged offset of slot `index` in a function's literals array.
#[must_use]
pub fn literal_offset(index: usize) -> i32 {
    layout::FIXED_ARRAY_HEADER_SIZE + index as i32 * layout::POINTER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::virtual_frame::VirtualFrame;
    use crate::machine::{Condition, Instruction};

    fn emitter_with_frame() -> Emitter {
        let mut emitter = Emitter::new();
        let mut frame = VirtualFrame::new(0, 0);
        frame.enter(&mut emitter.masm);
        emitter.set_frame(frame);
        emitter
    }

    #[test]
    fn test_records_are_emitted_in_creation_order_after_body() {
        let mut emitter = emitter_with_frame();
        let mut queue = DeferredQueue::new();
        let first = {
            let record = queue.push(&mut emitter, DeferredKind::UnarySub);
            (record.entry, record.exit)
        };
        emitter.branch(first.0, Condition::Ne).unwrap();
        emitter.bind(first.1).unwrap();
        let second = {
            let record = queue.push(&mut emitter, DeferredKind::StackCheck);
            (record.entry, record.exit)
        };
        emitter.branch(second.0, Condition::Lo).unwrap();
        emitter.bind(second.1).unwrap();
        let body_end = emitter.masm.pc_offset();
        emitter.take_frame();

        queue.process(&mut emitter).unwrap();
        assert!(queue.is_empty());
        let code = &emitter.masm.instructions()[body_end..];
        let calls: Vec<_> = code
            .iter()
            .filter_map(|i| match i {
                Instruction::Call { target } => Some(*target),
                _ => None,
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                CallTarget::Stub(CodeStub::UnarySub),
                CallTarget::Stub(CodeStub::StackCheck)
            ]
        );
        assert!(code.last().is_some_and(Instruction::is_terminating));
    }

    #[test]
    fn test_unreached_records_are_skipped() {
        let mut emitter = emitter_with_frame();
        let mut queue = DeferredQueue::new();
        let exit = queue.push(&mut emitter, DeferredKind::BitNot).exit;
        emitter.bind(exit).unwrap();
        let before = emitter.masm.pc_offset();
        emitter.take_frame();
        queue.process(&mut emitter).unwrap();
        assert_eq!(emitter.masm.pc_offset(), before);
    }

    #[test]
    fn test_inline_add_undo_restores_operands() {
        let mut emitter = emitter_with_frame();
        let mut queue = DeferredQueue::new();
        let (entry, exit) = {
            let record = queue.push(
                &mut emitter,
                DeferredKind::InlineSmiOperation {
                    op: BinaryOp::Add,
                    value: 1,
                    reversed: false,
                },
            );
            (record.entry, record.exit)
        };
        emitter.branch(entry, Condition::Vs).unwrap();
        emitter.bind(exit).unwrap();
        let body_end = emitter.masm.pc_offset();
        emitter.take_frame();
        queue.process(&mut emitter).unwrap();
        let code = &emitter.masm.instructions()[body_end..];
        assert_eq!(
            code[0],
            Instruction::Alu {
                op: AluOp::Sub,
                set_flags: false,
                dst: Reg::R1,
                lhs: Reg::R0,
                rhs: Operand::smi(1),
            }
        );
        assert_eq!(
            code[1],
            Instruction::Mov {
                dst: Reg::R0,
                src: Operand::smi(1)
            }
        );
    }

    #[test]
    fn test_literal_offset() {
        assert_eq!(literal_offset(0), 8);
        assert_eq!(literal_offset(2), 16);
    }
}
