//! Binary operators, short-circuit logic and `++` / `--`.
//!
//! An operation with a small-integer literal operand is emitted inline on
//! the tagged value and falls back to deferred code when an operand is not
//! a smi or the result overflows.

use super::deferred::DeferredKind;
use super::generator::{CodeGenerator, TypeofState};
use super::reference::{self, InitState};
use crate::ast::{BinaryOp, CountOp, Expression};
use crate::layout::{SMI_TAG_MASK, SMI_TAG_SIZE};
use crate::machine::{AluOp, Condition, Constant, Operand, Reg, Shift};
use crate::runtime::{Builtin, CallTarget, CodeStub, RuntimeFunction};
use crate::{Error, Result};

pub fn visit_binary(
    g: &mut CodeGenerator<'_>,
    op: BinaryOp,
    left: &Expression,
    right: &Expression,
) -> Result<()> {
    g.comment(format!("[ BinaryOperation {}", op.as_str()));
    match op {
        BinaryOp::And | BinaryOp::Or => logical(g, op == BinaryOp::And, left, right)?,
        _ => {
            if let Some(value) = right.as_smi_literal() {
                g.load(left)?;
                smi_operation(g, op, value, false)?;
            } else if let Some(value) = left.as_smi_literal() {
                g.load(right)?;
                smi_operation(g, op, value, true)?;
            } else {
                g.load(left)?;
                g.load(right)?;
                generic_binary_operation(g, op)?;
            }
            g.emit_push(Reg::R0)?;
        }
    }
    g.comment("]");
    Ok(())
}

/// `&&` and `||` produce one of their operands, not a boolean. When the left
/// side was materialized the right side is materialized too, so that both
/// paths reach the exit with the same frame.
fn logical(
    g: &mut CodeGenerator<'_>,
    is_and: bool,
    left: &Expression,
    right: &Expression,
) -> Result<()> {
    let true_target = g.true_target()?;
    let false_target = g.false_target()?;
    // Where the left side continues to the right side.
    let evaluate_right = g.forward_target();
    let (left_true, left_false) = if is_and {
        (evaluate_right, false_target)
    } else {
        (true_target, evaluate_right)
    };
    g.load_condition(left, TypeofState::NotInsideTypeof, left_true, left_false, false)?;

    if g.has_valid_frame() && !g.has_cc() {
        // The left value is on top of the frame and may be the result.
        let pop_and_continue = g.forward_target();
        let exit = g.forward_target();

        g.load_element(Reg::R0, 0)?;
        g.emit_push(Reg::R0)?;
        if is_and {
            g.to_boolean(pop_and_continue, exit)?;
            g.branch_cc(false, exit)?;
        } else {
            g.to_boolean(exit, pop_and_continue)?;
            g.branch_cc(true, exit)?;
        }

        g.emitter.bind(pop_and_continue)?;
        g.emit_pop(Reg::R0)?;

        g.emitter.bind(evaluate_right)?;
        g.load(right)?;

        g.emitter.bind(exit)?;
    } else if g.has_cc() || g.emitter.is_linked(evaluate_right) {
        if g.has_cc() {
            if is_and {
                g.branch_cc(false, false_target)?;
            } else {
                g.branch_cc(true, true_target)?;
            }
        }
        g.emitter.bind(evaluate_right)?;
        g.load_condition(right, TypeofState::NotInsideTypeof, true_target, false_target, false)?;
    }
    Ok(())
}

/// `op` with the top of the frame and the smi `value`; the result is left in
/// `r0`. `reversed` when the literal is the left operand.
pub fn smi_operation(
    g: &mut CodeGenerator<'_>,
    op: BinaryOp,
    value: i32,
    reversed: bool,
) -> Result<()> {
    g.spill()?;
    g.emit_pop(Reg::R0)?;
    let literal = Operand::smi(value);
    let smi_mask = Operand::Imm(SMI_TAG_MASK as i32);

    match op {
        BinaryOp::Add | BinaryOp::Sub => {
            let (entry, exit) = g.defer(DeferredKind::InlineSmiOperation {
                op,
                value,
                reversed,
            });
            let alu = match (op, reversed) {
                (BinaryOp::Sub, true) => AluOp::Rsb,
                (BinaryOp::Sub, false) => AluOp::Sub,
                _ => AluOp::Add,
            };
            g.masm().alu(alu, true, Reg::R0, Reg::R0, literal);
            g.emitter.branch(entry, Condition::Vs)?;
            g.masm().tst(Reg::R0, smi_mask);
            g.emitter.branch(entry, Condition::Ne)?;
            g.emitter.bind(exit)?;
        }
        BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::BitAnd => {
            let (entry, exit) = g.defer(DeferredKind::InlineSmiOperation {
                op,
                value,
                reversed,
            });
            g.masm().tst(Reg::R0, smi_mask);
            g.emitter.branch(entry, Condition::Ne)?;
            let alu = match op {
                BinaryOp::BitOr => AluOp::Orr,
                BinaryOp::BitXor => AluOp::Eor,
                _ => AluOp::And,
            };
            g.masm().alu(alu, false, Reg::R0, Reg::R0, literal);
            g.emitter.bind(exit)?;
        }
        BinaryOp::Shl | BinaryOp::Sar | BinaryOp::Shr if !reversed => {
            let shift_value = value & 0x1f;
            let (entry, exit) = g.defer(DeferredKind::InlineSmiOperation {
                op,
                value: shift_value,
                reversed: false,
            });
            g.masm().tst(Reg::R0, smi_mask);
            g.emitter.branch(entry, Condition::Ne)?;
            g.masm().mov(Reg::R2, shifted(Reg::R0, Shift::Asr, SMI_TAG_SIZE as u8));
            let amount = shift_value as u8;
            match op {
                BinaryOp::Shl => {
                    g.masm().mov(Reg::R2, shifted(Reg::R2, Shift::Lsl, amount));
                    // The result must fit in a smi.
                    g.masm()
                        .alu(AluOp::Add, true, Reg::R3, Reg::R2, Operand::Imm(0x4000_0000));
                    g.emitter.branch(entry, Condition::Mi)?;
                }
                BinaryOp::Shr => {
                    if amount != 0 {
                        g.masm().mov(Reg::R2, shifted(Reg::R2, Shift::Lsr, amount));
                    }
                    // Neither of the two high bits may be set: the unsigned
                    // result has to fit in a positive smi.
                    g.masm().alu(
                        AluOp::And,
                        true,
                        Reg::R3,
                        Reg::R2,
                        Operand::Imm(0xC000_0000_u32 as i32),
                    );
                    g.emitter.branch(entry, Condition::Ne)?;
                }
                _ => {
                    if amount != 0 {
                        g.masm().mov(Reg::R2, shifted(Reg::R2, Shift::Asr, amount));
                    }
                }
            }
            g.masm().mov(Reg::R0, shifted(Reg::R2, Shift::Lsl, SMI_TAG_SIZE as u8));
            g.emitter.bind(exit)?;
        }
        _ => {
            if reversed {
                g.masm().mov(Reg::R1, literal);
                g.emit_push(Reg::R1)?;
                g.emit_push(Reg::R0)?;
            } else {
                g.emit_push(Reg::R0)?;
                g.masm().mov(Reg::R0, literal);
                g.emit_push(Reg::R0)?;
            }
            generic_binary_operation(g, op)?;
        }
    }
    Ok(())
}

fn shifted(reg: Reg, shift: Shift, amount: u8) -> Operand {
    Operand::Shifted { reg, shift, amount }
}

/// Pops `y` and `x` and computes `x op y` into `r0`.
pub fn generic_binary_operation(g: &mut CodeGenerator<'_>, op: BinaryOp) -> Result<()> {
    g.spill()?;
    match op {
        BinaryOp::Comma => {
            g.emit_pop(Reg::R0)?;
            // The left value is discarded.
            g.drop_elements(1)
        }
        BinaryOp::And | BinaryOp::Or => Err(Error::Internal(format!(
            "{} has no generic stub",
            op.as_str()
        ))),
        _ => {
            g.emit_pop(Reg::R0)?;
            g.emit_pop(Reg::R1)?;
            g.call_code(CallTarget::Stub(CodeStub::GenericBinaryOp(op)), 0)
        }
    }
}

/// Prefix and postfix `++` / `--`.
pub fn visit_count(
    g: &mut CodeGenerator<'_>,
    op: CountOp,
    is_prefix: bool,
    target: &Expression,
) -> Result<()> {
    g.comment("[ CountOperation");
    let is_postfix = !is_prefix;
    let is_const = target.as_variable().is_some_and(|v| v.is_const());

    if is_postfix {
        // Room for the result.
        g.push_r0_constant(Constant::Smi(0))?;
    }

    let reference = reference::load_reference(g, target)?;
    if reference.is_illegal() {
        if !is_postfix {
            g.push_r0_constant(Constant::Smi(0))?;
        }
        g.comment("]");
        return Ok(());
    }
    reference::get_value(g, &reference, TypeofState::NotInsideTypeof)?;
    g.spill()?;
    g.emit_pop(Reg::R0)?;

    let slow = g.forward_target();
    let exit = g.forward_target();
    let one = Operand::smi(1);
    g.masm().mov(Reg::R1, one);
    g.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
    g.emitter.branch(slow, Condition::Ne)?;

    if is_postfix {
        g.store_element(Reg::R0, reference.size())?;
    }

    // Optimistic update, undone on overflow.
    let (update, undo) = match op {
        CountOp::Inc => (AluOp::Add, AluOp::Sub),
        CountOp::Dec => (AluOp::Sub, AluOp::Add),
    };
    g.masm().alu(update, true, Reg::R0, Reg::R0, Reg::R1);
    g.emitter.branch(exit, Condition::Vc)?;
    g.masm().alu(undo, false, Reg::R0, Reg::R0, Reg::R1);

    g.emitter.bind(slow)?;
    g.emit_push(Reg::R0)?;
    g.call_builtin(Builtin::ToNumber)?;
    if is_postfix {
        g.store_element(Reg::R0, reference.size())?;
    }
    g.masm().mov(Reg::R1, one);
    g.emit_push(Reg::R0)?;
    g.emit_push(Reg::R1)?;
    g.call_runtime(match op {
        CountOp::Inc => RuntimeFunction::NumberAdd,
        CountOp::Dec => RuntimeFunction::NumberSub,
    })?;

    g.emitter.bind(exit)?;
    g.emit_push(Reg::R0)?;
    if !is_const {
        reference::set_value(g, &reference, InitState::NotConstInit)?;
    }
    reference::unload_reference(g, &reference)?;

    if is_postfix {
        // The old value is the result.
        g.emit_pop(Reg::R0)?;
    }
    g.comment("]");
    Ok(())
}

