//! `try` / `catch` and `try` / `finally`.
//!
//! The protected block is reached through a branch-and-link, so that the
//! handler pushed at its start resumes right after the branch when an
//! exception is thrown. Every jump out of the protected block (`break`,
//! `continue` and `return`) is redirected to a shadow target that unlinks
//! the handler before continuing to the real destination.

use std::collections::BTreeMap;

use super::generator::{CodeGenerator, ExitTargets};
use super::jump_target::{Direction, TargetId};
use super::reference::{self, InitState, Reference, ReferenceKind};
use crate::ast::{NodeId, Slot, Statement, Variable};
use crate::layout::{HANDLER_ADDRESS, HANDLER_SIZE_IN_WORDS, HANDLER_TRY_CATCH, HANDLER_TRY_FINALLY};
use crate::machine::{Condition, Constant, MemOperand, Operand, Reg};
use crate::runtime::RuntimeFunction;
use crate::{Error, Result};

/// States of a finally block: how it was entered.
const FALLING: i32 = 0;
const THROWING: i32 = 1;
/// `JUMPING + i` for the escape through shadow `i`.
const JUMPING: i32 = 2;

/// The shadow of the return target comes first.
const RETURN_SHADOW_INDEX: usize = 0;

struct Shadow {
    original: TargetId,
    shadow: TargetId,
}

/// Exit targets in effect before the shadows were installed.
struct SavedExits {
    return_target: TargetId,
    exits: BTreeMap<NodeId, ExitTargets>,
}

/// Redirects `return` and every enclosing `break` / `continue` to fresh
/// targets expecting the current height.
fn install_shadows(g: &mut CodeGenerator<'_>) -> Result<(Vec<Shadow>, SavedExits)> {
    let saved = SavedExits {
        return_target: g.return_target,
        exits: g.exits.clone(),
    };
    let mut shadows = Vec::new();

    let return_shadow = g.exit_target(Direction::ForwardOnly)?;
    shadows.push(Shadow {
        original: g.return_target,
        shadow: return_shadow,
    });
    g.return_target = return_shadow;

    for (node, exits) in &saved.exits {
        let break_target = g.exit_target(Direction::ForwardOnly)?;
        shadows.push(Shadow {
            original: exits.break_target,
            shadow: break_target,
        });
        let continue_target = match exits.continue_target {
            Some(original) => {
                let shadow = g.exit_target(Direction::ForwardOnly)?;
                shadows.push(Shadow { original, shadow });
                Some(shadow)
            }
            None => None,
        };
        g.exits.insert(
            *node,
            ExitTargets {
                break_target,
                continue_target,
            },
        );
    }
    Ok((shadows, saved))
}

fn restore_exits(g: &mut CodeGenerator<'_>, saved: SavedExits) {
    g.return_target = saved.return_target;
    g.exits = saved.exits;
}

/// Pops the next-handler link on top of the frame into the handler cell and
/// drops the rest of the handler.
fn unlink_handler(g: &mut CodeGenerator<'_>) -> Result<()> {
    g.emit_pop(Reg::R1)?;
    let masm = g.masm();
    masm.mov(Reg::R3, Operand::Imm(HANDLER_ADDRESS as i32));
    masm.str(Reg::R1, MemOperand::new(Reg::R3, 0));
    g.drop_elements(HANDLER_SIZE_IN_WORDS - 1)
}

/// Unlinks the handler on a path that may have left elements above it.
fn unlink_from_shadow(g: &mut CodeGenerator<'_>, handler_height: usize) -> Result<()> {
    let masm = g.masm();
    masm.mov(Reg::R3, Operand::Imm(HANDLER_ADDRESS as i32));
    masm.ldr(Reg::SP, MemOperand::new(Reg::R3, 0));
    let height = g.height()?;
    let excess = height.checked_sub(handler_height).ok_or_else(|| {
        Error::Internal(format!(
            "shadow reached at height {height} below handler height {handler_height}"
        ))
    })?;
    g.frame()?.forget(excess)?;
    unlink_handler(g)
}

/// Stores the exception in `r0` into the catch variable.
fn bind_catch_variable(g: &mut CodeGenerator<'_>, catch_var: &Variable) -> Result<()> {
    if matches!(catch_var.slot, Slot::Global) {
        return Err(Error::Internal(format!(
            "catch variable {} has no slot",
            catch_var.name
        )));
    }
    g.emit_push(Reg::R0)?;
    let target = Reference::new(ReferenceKind::Slot(catch_var.clone()));
    reference::set_value(g, &target, InitState::NotConstInit)?;
    g.drop_elements(1)
}

pub fn visit_try_catch(
    g: &mut CodeGenerator<'_>,
    try_block: &[Statement],
    catch_var: &Variable,
    catch_block: &[Statement],
) -> Result<()> {
    g.comment("[ TryCatch");
    let protected = g.forward_target();
    let exit = g.forward_target();

    g.emitter.call(protected)?;

    // The exception arrives here in r0.
    bind_catch_variable(g, catch_var)?;
    g.visit_statements(catch_block)?;
    if g.has_valid_frame() {
        g.emitter.jump(exit)?;
    }

    g.emitter.bind(protected)?;
    let (masm, frame) = g.parts()?;
    frame.push_try_handler(masm, HANDLER_TRY_CATCH)?;
    let handler_height = g.height()?;

    let (shadows, saved) = install_shadows(g)?;
    let visited = g.visit_statements(try_block);
    restore_exits(g, saved);
    visited?;

    let has_unlinks = shadows.iter().any(|s| g.emitter.is_linked(s.shadow));
    if g.has_valid_frame() {
        unlink_handler(g)?;
        if has_unlinks {
            g.emitter.jump(exit)?;
        }
    }

    for (index, shadow) in shadows.iter().enumerate() {
        if !g.emitter.is_linked(shadow.shadow) {
            continue;
        }
        g.emitter.bind(shadow.shadow)?;
        unlink_from_shadow(g, handler_height)?;
        if index == RETURN_SHADOW_INDEX && shadow.original == g.function_return {
            let (masm, frame) = g.parts()?;
            frame.prepare_for_return(masm)?;
        }
        g.emitter.jump(shadow.original)?;
    }

    g.bind_if_linked(exit)?;
    g.comment("]");
    Ok(())
}

pub fn visit_try_finally(
    g: &mut CodeGenerator<'_>,
    try_block: &[Statement],
    finally_block: &[Statement],
) -> Result<()> {
    g.comment("[ TryFinally");
    let protected = g.forward_target();
    let finally = g.forward_target();

    g.emitter.call(protected)?;

    // An exception arrives here in r0 and is rethrown after the finally
    // block.
    g.emit_push(Reg::R0)?;
    g.masm().mov(Reg::R2, Operand::smi(THROWING));
    g.emitter.jump(finally)?;

    g.emitter.bind(protected)?;
    let (masm, frame) = g.parts()?;
    frame.push_try_handler(masm, HANDLER_TRY_FINALLY)?;
    let handler_height = g.height()?;

    let (shadows, saved) = install_shadows(g)?;
    let visited = g.visit_statements(try_block);
    restore_exits(g, saved);
    visited?;

    let mut unlinks = shadows
        .iter()
        .filter(|s| g.emitter.is_linked(s.shadow))
        .count();
    if g.has_valid_frame() {
        unlink_handler(g)?;
        // The result slot is unused when falling through.
        g.push_r0_constant(Constant::Undefined)?;
        g.masm().mov(Reg::R2, Operand::smi(FALLING));
        if unlinks > 0 {
            g.emitter.jump(finally)?;
        }
    }

    for (index, shadow) in shadows.iter().enumerate() {
        if !g.emitter.is_linked(shadow.shadow) {
            continue;
        }
        g.emitter.bind(shadow.shadow)?;
        unlink_from_shadow(g, handler_height)?;
        if index == RETURN_SHADOW_INDEX {
            // The return value travels in r0 through the finally block.
            g.emit_push(Reg::R0)?;
        } else {
            g.push_r0_constant(Constant::Undefined)?;
        }
        g.masm().mov(Reg::R2, Operand::smi(JUMPING + index as i32));
        unlinks -= 1;
        if unlinks > 0 {
            g.emitter.jump(finally)?;
        }
    }

    g.emitter.bind(finally)?;
    // Result (or exception) and state stay on the frame while the finally
    // block runs.
    g.emit_push(Reg::R2)?;
    g.visit_statements(finally_block)?;

    if g.has_valid_frame() {
        g.emit_pop(Reg::R2)?;
        g.emit_pop(Reg::R0)?;
    }

    // Dispatch on the state; every shadowed target expects a spilled frame.
    g.in_spilled_code(|g| {
        for (index, shadow) in shadows.iter().enumerate() {
            if !g.has_valid_frame() || !g.emitter.is_bound(shadow.shadow) {
                continue;
            }
            g.masm().cmp(Reg::R2, Operand::smi(JUMPING + index as i32));
            if index == RETURN_SHADOW_INDEX && shadow.original == g.function_return {
                let skip = g.forward_target();
                g.emitter.branch(skip, Condition::Ne)?;
                let (masm, frame) = g.parts()?;
                frame.prepare_for_return(masm)?;
                g.emitter.jump(shadow.original)?;
                g.emitter.bind(skip)?;
            } else {
                g.emitter.branch(shadow.original, Condition::Eq)?;
            }
        }
        Ok(())
    })?;

    if g.has_valid_frame() {
        let exit = g.forward_target();
        g.masm().cmp(Reg::R2, Operand::smi(THROWING));
        g.emitter.branch(exit, Condition::Ne)?;
        g.emit_push(Reg::R0)?;
        g.call_runtime(RuntimeFunction::ReThrow)?;
        g.emitter.bind(exit)?;
    }
    g.comment("]");
    Ok(())
}
