//! Literals, unary operators, assignment, `throw` and `?:`.

use std::rc::Rc;

use super::arithmetic;
use super::deferred::DeferredKind;
use super::generator::{CodeGenerator, TypeofState};
use super::literals;
use super::reference::{self, InitState};
use crate::ast::{AssignOp, Expression, Literal, Slot, UnaryOp};
use crate::layout::SMI_TAG_MASK;
use crate::machine::{AluOp, Condition, Constant, Operand, Reg};
use crate::runtime::{Builtin, RuntimeFunction};
use crate::Result;

pub fn visit_literal(g: &mut CodeGenerator<'_>, literal: &Literal) -> Result<()> {
    g.push_constant(literals::literal_constant(literal))
}

pub fn visit_this(g: &mut CodeGenerator<'_>) -> Result<()> {
    let (masm, frame) = g.parts()?;
    let guard = frame.allocate(masm)?;
    masm.ldr(guard.reg(), frame.receiver());
    frame.push_register(guard.reg());
    Ok(())
}

pub fn visit_this_function(g: &mut CodeGenerator<'_>) -> Result<()> {
    g.spill()?;
    let (masm, frame) = g.parts()?;
    masm.ldr(Reg::R0, frame.function());
    g.emit_push(Reg::R0)
}

pub fn visit_unary(g: &mut CodeGenerator<'_>, op: UnaryOp, operand: &Expression) -> Result<()> {
    g.comment(format!("[ UnaryOperation {op:?}"));
    match op {
        UnaryOp::Not => {
            let true_target = g.true_target()?;
            let false_target = g.false_target()?;
            g.load_condition(
                operand,
                TypeofState::NotInsideTypeof,
                false_target,
                true_target,
                true,
            )?;
            g.negate_cc();
        }
        UnaryOp::Delete => {
            delete(g, operand)?;
            g.emit_push(Reg::R0)?;
        }
        UnaryOp::Typeof => {
            reference::load_typeof_expression(g, operand)?;
            g.call_runtime(RuntimeFunction::Typeof)?;
            g.emit_push(Reg::R0)?;
        }
        UnaryOp::Void => {
            g.load(operand)?;
            g.drop_elements(1)?;
            g.push_constant(Constant::Undefined)?;
        }
        UnaryOp::Sub => {
            let (entry, exit) = g.defer(DeferredKind::UnarySub);
            g.load(operand)?;
            g.spill()?;
            g.emit_pop(Reg::R0)?;
            g.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
            g.emitter.branch(entry, Condition::Ne)?;
            // -0 is not a smi.
            g.masm().cmp(Reg::R0, Operand::smi(0));
            g.emitter.branch(entry, Condition::Eq)?;
            // Neither is the negation of the most negative smi.
            g.masm().alu(AluOp::Rsb, true, Reg::R1, Reg::R0, Operand::Imm(0));
            g.emitter.branch(entry, Condition::Vs)?;
            g.masm().mov(Reg::R0, Reg::R1);
            g.emitter.bind(exit)?;
            g.emit_push(Reg::R0)?;
        }
        UnaryOp::BitNot => {
            let (entry, exit) = g.defer(DeferredKind::BitNot);
            g.load(operand)?;
            g.spill()?;
            g.emit_pop(Reg::R0)?;
            g.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
            g.emitter.branch(entry, Condition::Ne)?;
            let masm = g.masm();
            masm.mvn(Reg::R0, Reg::R0);
            // Clear the inverted tag bit.
            masm.alu(AluOp::Bic, false, Reg::R0, Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
            g.emitter.bind(exit)?;
            g.emit_push(Reg::R0)?;
        }
        UnaryOp::Add => {
            let done = g.forward_target();
            g.load(operand)?;
            g.spill()?;
            g.emit_pop(Reg::R0)?;
            g.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
            g.emitter.branch(done, Condition::Eq)?;
            g.emit_push(Reg::R0)?;
            g.call_builtin(Builtin::ToNumber)?;
            g.emitter.bind(done)?;
            g.emit_push(Reg::R0)?;
        }
    }
    g.comment("]");
    Ok(())
}

/// Leaves the result of `delete operand` in `r0`.
fn delete(g: &mut CodeGenerator<'_>, operand: &Expression) -> Result<()> {
    match operand {
        Expression::Property { object, key } => {
            g.load(object)?;
            g.load(key)?;
            g.call_builtin(Builtin::Delete)
        }
        Expression::Variable(variable) if variable.is_global() => {
            reference::load_global(g)?;
            g.push_constant(Constant::String(Rc::clone(&variable.name)))?;
            g.call_builtin(Builtin::Delete)
        }
        Expression::Variable(variable) if variable.slot == Slot::Lookup => {
            // Delete from whatever object of the context chain holds the name.
            g.emit_push(Reg::CP)?;
            g.push_constant(Constant::String(Rc::clone(&variable.name)))?;
            g.call_runtime(RuntimeFunction::LookupContext)?;
            g.emit_push(Reg::R0)?;
            g.push_constant(Constant::String(Rc::clone(&variable.name)))?;
            g.call_builtin(Builtin::Delete)
        }
        Expression::Variable(_) => {
            // Declared variables cannot be deleted.
            g.spill()?;
            g.masm().load_constant(Reg::R0, Constant::False);
            Ok(())
        }
        other => {
            g.load(other)?;
            g.drop_elements(1)?;
            g.spill()?;
            g.masm().load_constant(Reg::R0, Constant::True);
            Ok(())
        }
    }
}

pub fn visit_assignment(
    g: &mut CodeGenerator<'_>,
    op: AssignOp,
    target: &Expression,
    value: &Expression,
) -> Result<()> {
    g.comment("[ Assignment");
    let reference = reference::load_reference(g, target)?;
    if reference.is_illegal() {
        // The reference error has been thrown; keep the expected height.
        g.push_r0_constant(Constant::Smi(0))?;
        g.comment("]");
        return Ok(());
    }

    match op {
        AssignOp::Assign | AssignOp::InitVar | AssignOp::InitConst => g.load(value)?,
        AssignOp::Compound(binary) => {
            reference::get_value(g, &reference, TypeofState::NotInsideTypeof)?;
            match value.as_smi_literal() {
                Some(literal) => arithmetic::smi_operation(g, binary, literal, false)?,
                None => {
                    g.load(value)?;
                    arithmetic::generic_binary_operation(g, binary)?;
                }
            }
            g.emit_push(Reg::R0)?;
        }
    }

    let is_const = target.as_variable().is_some_and(|v| v.is_const());
    let is_initialization = matches!(op, AssignOp::InitVar | AssignOp::InitConst);
    if !is_const || is_initialization {
        let init = if op == AssignOp::InitConst {
            InitState::ConstInit
        } else {
            InitState::NotConstInit
        };
        reference::set_value(g, &reference, init)?;
    }
    reference::unload_reference(g, &reference)?;
    g.comment("]");
    Ok(())
}

pub fn visit_throw(g: &mut CodeGenerator<'_>, exception: &Expression) -> Result<()> {
    g.comment("[ Throw");
    g.load(exception)?;
    g.call_runtime(RuntimeFunction::Throw)?;
    g.emit_push(Reg::R0)?;
    g.comment("]");
    Ok(())
}

pub fn visit_conditional(
    g: &mut CodeGenerator<'_>,
    condition: &Expression,
    then_expression: &Expression,
    else_expression: &Expression,
) -> Result<()> {
    g.comment("[ Conditional");
    let then = g.forward_target();
    let otherwise = g.forward_target();
    let exit = g.forward_target();
    let typeof_state = g.typeof_state();

    g.load_condition(condition, TypeofState::NotInsideTypeof, then, otherwise, true)?;
    if g.has_valid_frame() {
        g.branch_cc(false, otherwise)?;
    }
    if g.has_valid_frame() || g.emitter.is_linked(then) {
        g.emitter.bind(then)?;
        g.load_with(then_expression, typeof_state)?;
        g.emitter.jump(exit)?;
    }
    if g.emitter.is_linked(otherwise) {
        g.emitter.bind(otherwise)?;
        g.load_with(else_expression, typeof_state)?;
    }
    g.bind_if_linked(exit)?;
    g.comment("]");
    Ok(())
}

/// The object a catch block sees as the scope holding the exception.
pub fn visit_catch_extension_object(
    g: &mut CodeGenerator<'_>,
    key: &Rc<str>,
    value: &Expression,
) -> Result<()> {
    g.push_constant(Constant::String(Rc::clone(key)))?;
    g.load(value)?;
    g.call_runtime(RuntimeFunction::CreateCatchExtensionObject)?;
    g.emit_push(Reg::R0)
}
