//! Comparison operators.
//!
//! Every path except `in` leaves its result in the condition flags; `==`
//! against `null` and `typeof x == "..."` are tested inline without calling
//! the runtime.

use super::generator::CodeGenerator;
use super::reference;
use crate::ast::{CompareOp, Expression, Literal, UnaryOp};
use crate::layout::{
    FIRST_JS_OBJECT_TYPE, FIRST_NONSTRING_TYPE, JS_FUNCTION_TYPE, LAST_JS_OBJECT_TYPE,
    MAP_BIT_FIELD_OFFSET, MAP_INSTANCE_TYPE_OFFSET, MAP_IS_UNDETECTABLE, MAP_OFFSET,
    SMI_TAG_MASK,
};
use crate::machine::{Condition, Constant, MemOperand, Operand, Reg};
use crate::runtime::{Builtin, NaNCompareResult};
use crate::{Error, Result};

pub fn visit_compare(
    g: &mut CodeGenerator<'_>,
    op: CompareOp,
    left: &Expression,
    right: &Expression,
) -> Result<()> {
    g.comment(format!("[ CompareOperation {op:?}"));
    match op {
        CompareOp::Eq => equality(g, left, right, false)?,
        CompareOp::StrictEq => equality(g, left, right, true)?,
        CompareOp::Ne | CompareOp::StrictNe => {
            // `a != b` is `!(a == b)`.
            g.swap_targets();
            let compared = equality(g, left, right, op == CompareOp::StrictNe);
            g.swap_targets();
            compared?;
            g.negate_cc();
        }
        CompareOp::Lt => comparison(g, Condition::Lt, Some(left), Some(right), false)?,
        CompareOp::Gt => comparison(g, Condition::Gt, Some(left), Some(right), false)?,
        CompareOp::Le => comparison(g, Condition::Le, Some(left), Some(right), false)?,
        CompareOp::Ge => comparison(g, Condition::Ge, Some(left), Some(right), false)?,
        CompareOp::In => {
            g.load(left)?;
            g.load(right)?;
            g.call_builtin(Builtin::In)?;
            g.emit_push(Reg::R0)?;
        }
        CompareOp::InstanceOf => {
            g.load(left)?;
            g.load(right)?;
            g.call_builtin(Builtin::InstanceOf)?;
            g.masm().tst(Reg::R0, Reg::R0);
            g.set_cc(Condition::Eq);
        }
    }
    g.comment("]");
    Ok(())
}

fn equality(
    g: &mut CodeGenerator<'_>,
    left: &Expression,
    right: &Expression,
    strict: bool,
) -> Result<()> {
    let left_is_null = left.as_literal().is_some_and(Literal::is_null);
    let right_is_null = right.as_literal().is_some_and(Literal::is_null);
    if left_is_null || right_is_null {
        return null_check(g, if left_is_null { right } else { left }, strict);
    }

    if let (
        Expression::Unary {
            op: UnaryOp::Typeof,
            operand,
        },
        Some(Literal::String(check)),
    ) = (left, right.as_literal())
    {
        return typeof_check(g, operand, check);
    }

    comparison(g, Condition::Eq, Some(left), Some(right), strict)
}

/// `x == null` is true for null, undefined and undetectable objects;
/// `x === null` only for null.
fn null_check(g: &mut CodeGenerator<'_>, operand: &Expression, strict: bool) -> Result<()> {
    g.load(operand)?;
    g.spill()?;
    g.emit_pop(Reg::R0)?;
    g.masm().cmp_constant(Reg::R0, Constant::Null);

    if !strict {
        let true_target = g.true_target()?;
        let false_target = g.false_target()?;
        g.emitter.branch(true_target, Condition::Eq)?;
        g.masm().cmp_constant(Reg::R0, Constant::Undefined);
        g.emitter.branch(true_target, Condition::Eq)?;
        g.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
        g.emitter.branch(false_target, Condition::Eq)?;
        test_undetectable(g, Reg::R0, Reg::R0);
    }
    g.set_cc(Condition::Eq);
    Ok(())
}

/// Sets `eq` when the heap object in `object` has an undetectable map.
fn test_undetectable(g: &mut CodeGenerator<'_>, object: Reg, scratch: Reg) {
    let masm = g.masm();
    masm.ldr(scratch, MemOperand::field(object, MAP_OFFSET));
    masm.ldr(scratch, MemOperand::field(scratch, MAP_BIT_FIELD_OFFSET));
    masm.and(scratch, scratch, Operand::Imm(MAP_IS_UNDETECTABLE as i32));
    masm.cmp(scratch, Operand::Imm(MAP_IS_UNDETECTABLE as i32));
}

/// `typeof x == "type"` without materializing the type string.
fn typeof_check(g: &mut CodeGenerator<'_>, operand: &Expression, check: &str) -> Result<()> {
    reference::load_typeof_expression(g, operand)?;
    g.spill()?;
    g.emit_pop(Reg::R1)?;
    let true_target = g.true_target()?;
    let false_target = g.false_target()?;
    let smi_mask = Operand::Imm(SMI_TAG_MASK as i32);

    match check {
        "number" => {
            g.masm().tst(Reg::R1, smi_mask);
            g.emitter.branch(true_target, Condition::Eq)?;
            let masm = g.masm();
            masm.ldr(Reg::R1, MemOperand::field(Reg::R1, MAP_OFFSET));
            masm.cmp_constant(Reg::R1, Constant::HeapNumberMap);
            g.set_cc(Condition::Eq);
        }
        "string" => {
            g.masm().tst(Reg::R1, smi_mask);
            g.emitter.branch(false_target, Condition::Eq)?;
            test_undetectable(g, Reg::R1, Reg::R2);
            g.emitter.branch(false_target, Condition::Eq)?;
            let masm = g.masm();
            masm.ldr(Reg::R1, MemOperand::field(Reg::R1, MAP_OFFSET));
            masm.ldr(Reg::R2, MemOperand::field(Reg::R1, MAP_INSTANCE_TYPE_OFFSET));
            masm.cmp(Reg::R2, Operand::Imm(FIRST_NONSTRING_TYPE as i32));
            g.set_cc(Condition::Lt);
        }
        "boolean" => {
            g.masm().cmp_constant(Reg::R1, Constant::True);
            g.emitter.branch(true_target, Condition::Eq)?;
            g.masm().cmp_constant(Reg::R1, Constant::False);
            g.set_cc(Condition::Eq);
        }
        "undefined" => {
            g.masm().cmp_constant(Reg::R1, Constant::Undefined);
            g.emitter.branch(true_target, Condition::Eq)?;
            g.masm().tst(Reg::R1, smi_mask);
            g.emitter.branch(false_target, Condition::Eq)?;
            test_undetectable(g, Reg::R1, Reg::R2);
            g.set_cc(Condition::Eq);
        }
        "function" => {
            g.masm().tst(Reg::R1, smi_mask);
            g.emitter.branch(false_target, Condition::Eq)?;
            super::control_flow::compare_instance_type(g, Reg::R1, Reg::R1, JS_FUNCTION_TYPE);
            g.set_cc(Condition::Eq);
        }
        "object" => {
            g.masm().tst(Reg::R1, smi_mask);
            g.emitter.branch(false_target, Condition::Eq)?;
            g.masm().cmp_constant(Reg::R1, Constant::Null);
            g.emitter.branch(true_target, Condition::Eq)?;
            test_undetectable(g, Reg::R1, Reg::R2);
            g.emitter.branch(false_target, Condition::Eq)?;
            let masm = g.masm();
            masm.ldr(Reg::R2, MemOperand::field(Reg::R1, MAP_OFFSET));
            masm.ldr(Reg::R2, MemOperand::field(Reg::R2, MAP_INSTANCE_TYPE_OFFSET));
            masm.cmp(Reg::R2, Operand::Imm(FIRST_JS_OBJECT_TYPE as i32));
            g.emitter.branch(false_target, Condition::Lt)?;
            g.masm().cmp(Reg::R2, Operand::Imm(LAST_JS_OBJECT_TYPE as i32));
            g.set_cc(Condition::Le);
        }
        _ => {
            // typeof never produces this string.
            g.emitter.jump(false_target)?;
        }
    }
    Ok(())
}

/// Compares two values, leaving the result in the condition flags. `None`
/// operands are already on the frame (left below right).
///
/// Two smis are compared inline; everything else goes through the
/// `Equals`, `StrictEquals` or `Compare` builtin. `>` and `<=` swap their
/// operands so that conversions still happen left to right.
pub fn comparison(
    g: &mut CodeGenerator<'_>,
    cond: Condition,
    left: Option<&Expression>,
    right: Option<&Expression>,
    strict: bool,
) -> Result<()> {
    if let Some(left) = left {
        g.load(left)?;
    }
    if let Some(right) = right {
        g.load(right)?;
    }
    g.spill()?;

    let mut cond = cond;
    if matches!(cond, Condition::Gt | Condition::Le) {
        cond = cond.reverse();
        g.emit_pop(Reg::R1)?;
        g.emit_pop(Reg::R0)?;
    } else {
        g.emit_pop(Reg::R0)?;
        g.emit_pop(Reg::R1)?;
    }

    let smi = g.forward_target();
    let exit = g.forward_target();
    let masm = g.masm();
    masm.orr(Reg::R2, Reg::R0, Reg::R1);
    masm.tst(Reg::R2, Operand::Imm(SMI_TAG_MASK as i32));
    g.emitter.branch(smi, Condition::Eq)?;

    g.emit_push(Reg::R1)?;
    g.emit_push(Reg::R0)?;
    let builtin = match cond {
        Condition::Eq if strict => Builtin::StrictEquals,
        Condition::Eq => Builtin::Equals,
        Condition::Lt | Condition::Ge => {
            // NaN must make the comparison false.
            let ncr = if cond == Condition::Lt {
                NaNCompareResult::Greater
            } else {
                NaNCompareResult::Less
            };
            g.masm().mov(Reg::R0, Operand::smi(ncr as i32));
            g.emit_push(Reg::R0)?;
            Builtin::Compare
        }
        other => {
            return Err(Error::Internal(format!(
                "comparison with condition {}",
                other.suffix()
            )));
        }
    };
    g.call_builtin(builtin)?;
    g.masm().cmp(Reg::R0, Operand::smi(0));
    g.emitter.jump(exit)?;

    // Tagged smis compare like their values.
    g.emitter.bind(smi)?;
    g.masm().cmp(Reg::R1, Reg::R0);
    g.emitter.bind(exit)?;
    g.set_cc(cond);
    Ok(())
}
