//! Function calls, `eval` calls and `new`.
//!
//! Calls through a name use the call IC, which finds the function on the
//! receiver after the arguments have been evaluated. Every other call
//! evaluates the function first and goes through the `CallFunction` stub.

use std::rc::Rc;

use super::generator::{CodeGenerator, TypeofState};
use super::reference::{self, ReferenceKind};
use crate::ast::{Expression, Literal, Slot, as_array_index};
use crate::layout::{CONTEXT_GLOBAL_INDEX, fixed_array_element};
use crate::machine::{Constant, MemOperand, Operand, Reg};
use crate::runtime::{Builtin, CallTarget, CodeStub, IcKind, RuntimeFunction};
use crate::{Error, Result};

fn argument_count(arguments: &[Expression]) -> Result<u16> {
    u16::try_from(arguments.len())
        .map_err(|_| Error::Unsupported(format!("call with {} arguments", arguments.len())))
}

fn load_arguments(g: &mut CodeGenerator<'_>, arguments: &[Expression]) -> Result<()> {
    for argument in arguments {
        g.load(argument)?;
    }
    Ok(())
}

/// Calls through the call IC. The frame holds the name and the receiver.
fn call_ic(g: &mut CodeGenerator<'_>, arguments: &[Expression], contextual: bool) -> Result<()> {
    let argc = argument_count(arguments)?;
    load_arguments(g, arguments)?;
    g.call_code(
        CallTarget::Ic(IcKind::Call { argc, contextual }),
        usize::from(argc) + 1,
    )?;
    g.restore_context()?;
    // The function slot.
    g.drop_elements(1)?;
    g.emit_push(Reg::R0)
}

/// Calls the function below the receiver with `arguments` through the
/// `CallFunction` stub, leaving the result in `r0`.
fn call_with_arguments(g: &mut CodeGenerator<'_>, arguments: &[Expression]) -> Result<()> {
    let argc = argument_count(arguments)?;
    load_arguments(g, arguments)?;
    g.call_code(
        CallTarget::Stub(CodeStub::CallFunction { argc }),
        usize::from(argc) + 1,
    )?;
    g.restore_context()?;
    g.drop_elements(1)
}

/// Pushes the receiver used for calls without an explicit one.
fn load_global_receiver(g: &mut CodeGenerator<'_>) -> Result<()> {
    g.spill()?;
    g.masm().ldr(Reg::R0, MemOperand::context(Reg::CP, CONTEXT_GLOBAL_INDEX));
    g.emit_push(Reg::R0)
}

pub fn visit_call(
    g: &mut CodeGenerator<'_>,
    callee: &Expression,
    arguments: &[Expression],
) -> Result<()> {
    g.comment("[ Call");
    match callee {
        Expression::Variable(variable) if variable.is_global() => {
            // foo(1, 2, 3) with a global foo.
            g.push_constant(Constant::String(Rc::clone(&variable.name)))?;
            reference::load_global(g)?;
            call_ic(g, arguments, true)?;
        }
        Expression::Variable(variable) if variable.slot == Slot::Lookup => {
            // The function may come from a with object, which is then the
            // receiver.
            g.emit_push(Reg::CP)?;
            g.push_constant(Constant::String(Rc::clone(&variable.name)))?;
            g.call_runtime(RuntimeFunction::LoadContextSlot)?;
            g.emit_push(Reg::R0)?;
            g.emit_push(Reg::R1)?;
            call_with_arguments(g, arguments)?;
            g.emit_push(Reg::R0)?;
        }
        Expression::Property { object, key } => match key.as_literal() {
            Some(Literal::String(name)) if as_array_index(name).is_none() => {
                // object.foo(1, 2, 3)
                g.push_constant(Constant::String(Rc::clone(name)))?;
                g.load(object)?;
                call_ic(g, arguments, false)?;
            }
            _ => {
                // array[index](1, 2, 3)
                let property = reference::load_reference(g, callee)?;
                if *property.kind() != ReferenceKind::Keyed {
                    return Err(Error::Internal("keyed call without a keyed reference".into()));
                }
                reference::get_value(g, &property, TypeofState::NotInsideTypeof)?;
                g.load_element(Reg::R0, property.size())?;
                g.emit_push(Reg::R0)?;
                call_with_arguments(g, arguments)?;
                g.emit_push(Reg::R0)?;
                reference::unload_reference(g, &property)?;
            }
        },
        function => {
            // foo(1, 2, 3) with a local foo.
            g.load(function)?;
            load_global_receiver(g)?;
            call_with_arguments(g, arguments)?;
            g.emit_push(Reg::R0)?;
        }
    }
    g.comment("]");
    Ok(())
}

/// A call that may be a direct call to `eval`. The runtime decides which
/// function to call and with which receiver.
pub fn visit_call_eval(
    g: &mut CodeGenerator<'_>,
    callee: &Expression,
    arguments: &[Expression],
) -> Result<()> {
    g.comment("[ CallEval");
    let argc = argument_count(arguments)?;
    let count = arguments.len();

    g.load(callee)?;
    // Receiver slot.
    g.push_r0_constant(Constant::Undefined)?;
    load_arguments(g, arguments)?;

    // ResolvePossiblyDirectEval(function, first argument).
    g.load_element(Reg::R1, count + 1)?;
    g.emit_push(Reg::R1)?;
    if count > 0 {
        g.load_element(Reg::R1, count)?;
        g.emit_push(Reg::R1)?;
    } else {
        g.push_r0_constant(Constant::Undefined)?;
    }
    g.call_runtime(RuntimeFunction::ResolvePossiblyDirectEval)?;

    // r0: [function, receiver]
    g.masm().ldr(Reg::R1, MemOperand::new(Reg::R0, fixed_array_element(0)));
    g.store_element(Reg::R1, count + 1)?;
    g.masm().ldr(Reg::R1, MemOperand::new(Reg::R0, fixed_array_element(1)));
    g.store_element(Reg::R1, count)?;

    g.call_code(
        CallTarget::Stub(CodeStub::CallFunction { argc }),
        count + 1,
    )?;
    g.restore_context()?;
    g.drop_elements(1)?;
    g.emit_push(Reg::R0)?;
    g.comment("]");
    Ok(())
}

/// `new callee(arguments)`. The global object stands in for the receiver
/// until the construct call allocates the new object.
pub fn visit_call_new(
    g: &mut CodeGenerator<'_>,
    callee: &Expression,
    arguments: &[Expression],
) -> Result<()> {
    g.comment("[ CallNew");
    let count = arguments.len();
    argument_count(arguments)?;

    g.load(callee)?;
    reference::load_global(g)?;
    load_arguments(g, arguments)?;
    g.spill()?;

    // r0: argument count, r1: function.
    g.masm().mov(Reg::R0, Operand::Imm(count as i32));
    g.load_element(Reg::R1, count + 1)?;
    g.call_code(CallTarget::Builtin(Builtin::JsConstructCall), count + 1)?;
    g.restore_context()?;
    // The result replaces the function.
    g.store_element(Reg::R0, 0)?;
    g.comment("]");
    Ok(())
}
