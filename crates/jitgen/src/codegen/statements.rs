//! Straight-line statements and declarations.

use std::rc::Rc;

use super::generator::{CodeGenerator, ExitTargets, TypeofState};
use super::jump_target::Direction;
use super::literals;
use super::reference::{self, InitState, Reference, ReferenceKind};
use crate::ast::{Declaration, Expression, NodeId, Scope, Slot, Statement, VariableMode};
use crate::layout::CONTEXT_PREVIOUS_INDEX;
use crate::machine::{Constant, MemOperand, Reg};
use crate::runtime::{ATTRIBUTES_NONE, ATTRIBUTES_READ_ONLY, RuntimeFunction};
use crate::{Error, Result};

pub fn visit_block(
    g: &mut CodeGenerator<'_>,
    id: Option<NodeId>,
    statements: &[Statement],
) -> Result<()> {
    let Some(id) = id else {
        return g.visit_statements(statements);
    };
    g.comment("[ Block");
    let break_target = g.exit_target(Direction::ForwardOnly)?;
    g.exits.insert(
        id,
        ExitTargets {
            break_target,
            continue_target: None,
        },
    );
    let visited = g.visit_statements(statements);
    g.exits.remove(&id);
    visited?;
    g.bind_if_linked(break_target)?;
    g.comment("]");
    Ok(())
}

pub fn visit_expression_statement(g: &mut CodeGenerator<'_>, expression: &Expression) -> Result<()> {
    g.comment("[ ExpressionStatement");
    g.load(expression)?;
    g.drop_elements(1)?;
    g.comment("]");
    Ok(())
}

pub fn visit_if(
    g: &mut CodeGenerator<'_>,
    condition: &Expression,
    then_statement: &Statement,
    else_statement: &Statement,
) -> Result<()> {
    g.comment("[ IfStatement");
    let has_then = !matches!(then_statement, Statement::Empty);
    let has_else = !matches!(else_statement, Statement::Empty);
    let exit = g.forward_target();

    if has_then && has_else {
        let then = g.forward_target();
        let otherwise = g.forward_target();
        g.load_condition(condition, TypeofState::NotInsideTypeof, then, otherwise, true)?;
        if g.has_valid_frame() {
            g.branch_cc(false, otherwise)?;
        }
        if g.has_valid_frame() || g.emitter.is_linked(then) {
            g.emitter.bind(then)?;
            g.visit_statement(then_statement)?;
        }
        if g.has_valid_frame() {
            g.emitter.jump(exit)?;
        }
        if g.emitter.is_linked(otherwise) {
            g.emitter.bind(otherwise)?;
            g.visit_statement(else_statement)?;
        }
    } else if has_then {
        let then = g.forward_target();
        g.load_condition(condition, TypeofState::NotInsideTypeof, then, exit, true)?;
        if g.has_valid_frame() {
            g.branch_cc(false, exit)?;
        }
        if g.has_valid_frame() || g.emitter.is_linked(then) {
            g.emitter.bind(then)?;
            g.visit_statement(then_statement)?;
        }
    } else if has_else {
        let otherwise = g.forward_target();
        g.load_condition(condition, TypeofState::NotInsideTypeof, exit, otherwise, true)?;
        if g.has_valid_frame() {
            g.branch_cc(true, exit)?;
        }
        if g.has_valid_frame() || g.emitter.is_linked(otherwise) {
            g.emitter.bind(otherwise)?;
            g.visit_statement(else_statement)?;
        }
    } else {
        // Evaluated for its side effects only.
        g.load_condition(condition, TypeofState::NotInsideTypeof, exit, exit, false)?;
        if g.has_valid_frame() {
            if g.has_cc() {
                g.clear_cc();
            } else {
                g.drop_elements(1)?;
            }
        }
    }

    g.bind_if_linked(exit)?;
    g.comment("]");
    Ok(())
}

pub fn visit_continue(g: &mut CodeGenerator<'_>, target: NodeId) -> Result<()> {
    g.comment("[ ContinueStatement");
    let id = g.continue_target(target)?;
    g.emitter.jump(id)?;
    g.comment("]");
    Ok(())
}

pub fn visit_break(g: &mut CodeGenerator<'_>, target: NodeId) -> Result<()> {
    g.comment("[ BreakStatement");
    let id = g.break_target(target)?;
    g.emitter.jump(id)?;
    g.comment("]");
    Ok(())
}

pub fn visit_return(g: &mut CodeGenerator<'_>, expression: &Expression) -> Result<()> {
    g.comment("[ ReturnStatement");
    g.load(expression)?;
    g.emit_pop(Reg::R0)?;
    if g.return_target == g.function_return {
        let (masm, frame) = g.parts()?;
        frame.prepare_for_return(masm)?;
    }
    let target = g.return_target;
    g.emitter.jump(target)?;
    g.comment("]");
    Ok(())
}

pub fn visit_with_enter(
    g: &mut CodeGenerator<'_>,
    expression: &Expression,
    is_catch_block: bool,
) -> Result<()> {
    g.comment("[ WithEnterStatement");
    g.load(expression)?;
    let function = if is_catch_block {
        RuntimeFunction::PushCatchContext
    } else {
        RuntimeFunction::PushContext
    };
    g.call_runtime(function)?;
    let (masm, frame) = g.parts()?;
    masm.str(Reg::CP, frame.context());
    g.comment("]");
    Ok(())
}

pub fn visit_with_exit(g: &mut CodeGenerator<'_>) -> Result<()> {
    g.comment("[ WithExitStatement");
    let (masm, frame) = g.parts()?;
    masm.ldr(Reg::CP, MemOperand::context(Reg::CP, CONTEXT_PREVIOUS_INDEX));
    masm.str(Reg::CP, frame.context());
    g.comment("]");
    Ok(())
}

pub fn visit_debugger(g: &mut CodeGenerator<'_>) -> Result<()> {
    g.comment("[ DebuggerStatement");
    g.call_runtime(RuntimeFunction::DebugBreak)?;
    g.comment("]");
    Ok(())
}

/// Declares the scope's variables and functions. Globals are declared
/// together by one runtime call.
pub fn declare_variables(g: &mut CodeGenerator<'_>, scope: &Scope) -> Result<()> {
    let mut globals = Vec::new();
    for declaration in &scope.declarations {
        if declaration.variable.is_global() {
            globals.push(Constant::String(Rc::clone(&declaration.variable.name)));
            globals.push(match &declaration.function {
                Some(function) => Constant::Function(Rc::clone(function)),
                None if declaration.mode == VariableMode::Const => Constant::TheHole,
                None => Constant::Undefined,
            });
        } else {
            declare(g, declaration)?;
        }
    }
    if globals.is_empty() {
        return Ok(());
    }

    g.comment("[ declare globals");
    g.push_constant(Constant::Array(globals.into()))?;
    g.emit_push(Reg::CP)?;
    g.push_constant(Constant::Smi(i32::from(g.options.is_eval)))?;
    g.call_runtime(RuntimeFunction::DeclareGlobals)?;
    g.comment("]");
    Ok(())
}

fn declare(g: &mut CodeGenerator<'_>, declaration: &Declaration) -> Result<()> {
    let variable = &declaration.variable;
    if variable.slot == Slot::Lookup {
        g.comment(format!("[ declare {} at runtime", variable.name));
        g.emit_push(Reg::CP)?;
        g.push_constant(Constant::String(Rc::clone(&variable.name)))?;
        let attributes = match declaration.mode {
            VariableMode::Var => ATTRIBUTES_NONE,
            VariableMode::Const => ATTRIBUTES_READ_ONLY,
            mode => {
                return Err(Error::Internal(format!("declaration with mode {mode:?}")));
            }
        };
        g.push_constant(Constant::Smi(attributes))?;
        if declaration.mode == VariableMode::Const {
            g.push_constant(Constant::TheHole)?;
        } else if let Some(function) = &declaration.function {
            literals::visit_function_literal(g, function)?;
        } else {
            // No initial value: a redeclaration keeps the current one.
            g.push_constant(Constant::Smi(0))?;
        }
        g.call_runtime(RuntimeFunction::DeclareContextSlot)?;
        g.comment("]");
        return Ok(());
    }

    let has_initial_value =
        declaration.mode == VariableMode::Const || declaration.function.is_some();
    if !has_initial_value {
        return Ok(());
    }
    let target = Reference::new(ReferenceKind::Slot(variable.clone()));
    match &declaration.function {
        Some(function) if declaration.mode != VariableMode::Const => {
            literals::visit_function_literal(g, function)?;
        }
        _ => g.push_constant(Constant::TheHole)?,
    }
    reference::set_value(g, &target, InitState::NotConstInit)?;
    reference::unload_reference(g, &target)?;
    g.drop_elements(1)
}
