//! Loops, `for-in` and `switch`.

use super::comparison;
use super::generator::{CodeGenerator, ExitTargets, TypeofState};
use super::jump_target::{Direction, TargetId};
use super::reference::{self, InitState};
use crate::ast::{CaseClause, Expression, Literal, LoopKind, NodeId, Statement};
use crate::layout::{
    FIRST_JS_OBJECT_TYPE, FIXED_ARRAY_HEADER_SIZE, FIXED_ARRAY_LENGTH_OFFSET, HEAP_NUMBER_TYPE,
    HEAP_OBJECT_TAG, MAP_ENUM_CACHE_OFFSET, MAP_INSTANCE_TYPE_OFFSET, MAP_OFFSET, SMI_MAX,
    SMI_MIN, SMI_TAG_MASK, SMI_TAG_SIZE,
};
use crate::machine::{Condition, Constant, Label, MemOperand, Operand, Reg, Shift};
use crate::runtime::{Builtin, RuntimeFunction};
use crate::{Error, Result};

/// What is statically known about a loop condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionInfo {
    AlwaysTrue,
    AlwaysFalse,
    DontKnow,
}

fn analyze_condition(condition: Option<&Expression>) -> ConditionInfo {
    match condition {
        None => ConditionInfo::AlwaysTrue,
        Some(Expression::Literal(Literal::True)) => ConditionInfo::AlwaysTrue,
        Some(Expression::Literal(Literal::False)) => ConditionInfo::AlwaysFalse,
        Some(_) => ConditionInfo::DontKnow,
    }
}

fn register_exits(
    g: &mut CodeGenerator<'_>,
    id: NodeId,
    break_target: TargetId,
    continue_target: Option<TargetId>,
) {
    g.exits.insert(
        id,
        ExitTargets {
            break_target,
            continue_target,
        },
    );
}

pub fn visit_loop(
    g: &mut CodeGenerator<'_>,
    id: NodeId,
    kind: LoopKind,
    init: Option<&Statement>,
    condition: Option<&Expression>,
    next: Option<&Statement>,
    body: &Statement,
) -> Result<()> {
    g.comment("[ LoopStatement");
    let info = analyze_condition(condition);
    let break_target = g.exit_target(Direction::ForwardOnly)?;

    match kind {
        LoopKind::DoWhile => {
            let body_target = g.bidirectional_target();
            let continue_target = match info {
                ConditionInfo::AlwaysTrue => {
                    let target = g.exit_target(Direction::Bidirectional)?;
                    g.emitter.bind(target)?;
                    target
                }
                ConditionInfo::AlwaysFalse => g.exit_target(Direction::ForwardOnly)?,
                ConditionInfo::DontKnow => {
                    let target = g.exit_target(Direction::ForwardOnly)?;
                    g.emitter.bind(body_target)?;
                    target
                }
            };
            register_exits(g, id, break_target, Some(continue_target));

            g.check_stack()?;
            g.visit_statement(body)?;

            match (info, condition) {
                (ConditionInfo::AlwaysTrue, _) => {
                    if g.has_valid_frame() {
                        g.emitter.jump(continue_target)?;
                    }
                }
                (ConditionInfo::AlwaysFalse, _) => {
                    g.bind_if_linked(continue_target)?;
                }
                (ConditionInfo::DontKnow, Some(condition)) => {
                    g.bind_if_linked(continue_target)?;
                    if g.has_valid_frame() {
                        g.load_condition(
                            condition,
                            TypeofState::NotInsideTypeof,
                            body_target,
                            break_target,
                            true,
                        )?;
                        if g.has_valid_frame() {
                            g.branch_cc(true, body_target)?;
                        }
                    }
                }
                (ConditionInfo::DontKnow, None) => {
                    return Err(Error::Internal("loop condition missing".into()));
                }
            }
        }

        LoopKind::While => {
            if info != ConditionInfo::AlwaysFalse {
                let continue_target = g.exit_target(Direction::Bidirectional)?;
                register_exits(g, id, break_target, Some(continue_target));
                g.emitter.bind(continue_target)?;
                if let (ConditionInfo::DontKnow, Some(condition)) = (info, condition) {
                    test_condition(g, condition, break_target)?;
                }
                if g.has_valid_frame() {
                    g.check_stack()?;
                    g.visit_statement(body)?;
                    if g.has_valid_frame() {
                        g.emitter.jump(continue_target)?;
                    }
                }
            }
        }

        LoopKind::For => {
            if let Some(init) = init {
                g.visit_statement(init)?;
            }
            if info != ConditionInfo::AlwaysFalse && g.has_valid_frame() {
                let loop_target = g.bidirectional_target();
                let continue_target = if next.is_none() {
                    let target = g.exit_target(Direction::Bidirectional)?;
                    g.emitter.bind(target)?;
                    target
                } else {
                    let target = g.exit_target(Direction::ForwardOnly)?;
                    g.emitter.bind(loop_target)?;
                    target
                };
                register_exits(g, id, break_target, Some(continue_target));

                if let (ConditionInfo::DontKnow, Some(condition)) = (info, condition) {
                    test_condition(g, condition, break_target)?;
                }
                if g.has_valid_frame() {
                    g.check_stack()?;
                    g.visit_statement(body)?;
                    match next {
                        None => {
                            if g.has_valid_frame() {
                                g.emitter.jump(continue_target)?;
                            }
                        }
                        Some(next) => {
                            g.bind_if_linked(continue_target)?;
                            if g.has_valid_frame() {
                                g.visit_statement(next)?;
                                g.emitter.jump(loop_target)?;
                            }
                        }
                    }
                }
            }
        }
    }

    g.exits.remove(&id);
    g.bind_if_linked(break_target)?;
    g.comment("]");
    Ok(())
}

/// Evaluates a loop condition, leaving the loop through `break_target` when
/// it is false.
fn test_condition(
    g: &mut CodeGenerator<'_>,
    condition: &Expression,
    break_target: TargetId,
) -> Result<()> {
    let body = g.forward_target();
    g.load_condition(
        condition,
        TypeofState::NotInsideTypeof,
        body,
        break_target,
        true,
    )?;
    if g.has_valid_frame() {
        g.branch_cc(false, break_target)?;
    }
    if g.has_valid_frame() || g.emitter.is_linked(body) {
        g.emitter.bind(body)?;
    }
    Ok(())
}

/// `for (each in enumerable) body`.
///
/// While the body runs the frame holds five words above the statement's
/// height: the enumerable, its map or 0, the key array, the key count and
/// the current index.
pub fn visit_for_in(
    g: &mut CodeGenerator<'_>,
    id: NodeId,
    each: &Expression,
    enumerable: &Expression,
    body: &Statement,
) -> Result<()> {
    g.comment("[ ForInStatement");
    let original_height = g.height()?;
    let primitive = g.forward_target();
    let jsobject = g.forward_target();
    let fixed_array = g.forward_target();
    let entry = g.bidirectional_target();
    let end_del_check = g.forward_target();
    let exit = g.forward_target();

    g.load(enumerable)?;
    g.spill()?;
    g.emit_pop(Reg::R0)?;

    // null and undefined enumerate nothing.
    g.masm().cmp_constant(Reg::R0, Constant::Undefined);
    g.emitter.branch(exit, Condition::Eq)?;
    g.masm().cmp_constant(Reg::R0, Constant::Null);
    g.emitter.branch(exit, Condition::Eq)?;

    g.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
    g.emitter.branch(primitive, Condition::Eq)?;
    compare_instance_type(g, Reg::R0, Reg::R1, FIRST_JS_OBJECT_TYPE);
    g.emitter.branch(jsobject, Condition::Hs)?;

    g.emitter.bind(primitive)?;
    g.emit_push(Reg::R0)?;
    g.call_builtin(Builtin::ToObject)?;

    g.emitter.bind(jsobject)?;
    g.emit_push(Reg::R0)?;
    g.emit_push(Reg::R0)?;
    g.call_runtime(RuntimeFunction::GetPropertyNamesFast)?;

    // A map means the enum cache is valid and the map can detect changes.
    let masm = g.masm();
    masm.mov(Reg::R2, Reg::R0);
    masm.ldr(Reg::R1, MemOperand::field(Reg::R2, MAP_OFFSET));
    masm.cmp_constant(Reg::R1, Constant::MetaMap);
    g.emitter.branch(fixed_array, Condition::Ne)?;

    g.masm().ldr(Reg::R2, MemOperand::field(Reg::R0, MAP_ENUM_CACHE_OFFSET));
    g.emit_push(Reg::R0)?;
    g.emit_push(Reg::R2)?;
    push_array_length(g, Reg::R2)?;
    g.push_r0_constant(Constant::Smi(0))?;
    g.emitter.jump(entry)?;

    g.emitter.bind(fixed_array)?;
    g.masm().mov(Reg::R1, Operand::smi(0));
    g.emit_push(Reg::R1)?;
    g.emit_push(Reg::R0)?;
    push_array_length(g, Reg::R0)?;
    g.push_r0_constant(Constant::Smi(0))?;

    // Condition.
    g.emitter.bind(entry)?;
    let break_target = g.exit_target(Direction::ForwardOnly)?;
    let continue_target = g.exit_target(Direction::ForwardOnly)?;
    register_exits(g, id, break_target, Some(continue_target));

    g.load_element(Reg::R0, 0)?;
    g.load_element(Reg::R1, 1)?;
    g.masm().cmp(Reg::R0, Reg::R1);
    g.emitter.branch(break_target, Condition::Hs)?;

    // Key at the current index.
    g.load_element(Reg::R2, 2)?;
    let masm = g.masm();
    masm.add(
        Reg::R2,
        Reg::R2,
        Operand::Imm(FIXED_ARRAY_HEADER_SIZE - HEAP_OBJECT_TAG as i32),
    );
    masm.ldr(
        Reg::R3,
        MemOperand::Indexed {
            base: Reg::R2,
            index: Reg::R0,
            shift: 2 - SMI_TAG_SIZE as u8,
        },
    );

    // An unchanged map means no key has been deleted.
    g.load_element(Reg::R2, 3)?;
    g.load_element(Reg::R1, 4)?;
    let masm = g.masm();
    masm.ldr(Reg::R1, MemOperand::field(Reg::R1, MAP_OFFSET));
    masm.cmp(Reg::R1, Reg::R2);
    g.emitter.branch(end_del_check, Condition::Eq)?;

    g.load_element(Reg::R0, 4)?;
    g.emit_push(Reg::R0)?;
    g.emit_push(Reg::R3)?;
    g.call_builtin(Builtin::FilterKey)?;
    g.masm().mov(Reg::R3, Reg::R0);
    // Deleted keys are skipped.
    g.masm().cmp_constant(Reg::R3, Constant::Null);
    g.emitter.branch(continue_target, Condition::Eq)?;

    g.emitter.bind(end_del_check)?;
    g.emit_push(Reg::R3)?;
    let target = reference::load_reference(g, each)?;
    if !target.is_illegal() {
        let size = target.size();
        if size > 0 {
            g.load_element(Reg::R0, size)?;
            g.emit_push(Reg::R0)?;
        }
        reference::set_value(g, &target, InitState::NotConstInit)?;
        if size > 0 {
            g.emit_pop(Reg::R0)?;
        }
        reference::unload_reference(g, &target)?;
    }
    // The key, or what is left of the reference.
    g.drop_elements(1)?;

    g.check_stack()?;
    g.visit_statement(body)?;

    // Next.
    g.emitter.bind(continue_target)?;
    g.spill()?;
    g.emit_pop(Reg::R0)?;
    g.masm().add(Reg::R0, Reg::R0, Operand::smi(1));
    g.emit_push(Reg::R0)?;
    g.emitter.jump(entry)?;

    // Cleanup.
    g.exits.remove(&id);
    g.emitter.bind(break_target)?;
    g.drop_elements(5)?;

    g.emitter.bind(exit)?;
    let height = g.height()?;
    if height != original_height {
        return Err(Error::Internal(format!(
            "for-in left height {height}, expected {original_height}"
        )));
    }
    g.comment("]");
    Ok(())
}

/// Loads the instance type of the heap object in `object` into `scratch`
/// and compares it with `instance_type`.
pub fn compare_instance_type(g: &mut CodeGenerator<'_>, object: Reg, scratch: Reg, instance_type: u32) {
    let masm = g.masm();
    masm.ldr(scratch, MemOperand::field(object, MAP_OFFSET));
    masm.ldr(scratch, MemOperand::field(scratch, MAP_INSTANCE_TYPE_OFFSET));
    masm.cmp(scratch, Operand::Imm(instance_type as i32));
}

/// Pushes the length of the fixed array in `array` as a smi.
fn push_array_length(g: &mut CodeGenerator<'_>, array: Reg) -> Result<()> {
    let masm = g.masm();
    masm.ldr(Reg::R0, MemOperand::field(array, FIXED_ARRAY_LENGTH_OFFSET));
    masm.mov(
        Reg::R0,
        Operand::Shifted {
            reg: Reg::R0,
            shift: Shift::Lsl,
            amount: SMI_TAG_SIZE as u8,
        },
    );
    g.emit_push(Reg::R0)
}

pub fn visit_switch(
    g: &mut CodeGenerator<'_>,
    id: NodeId,
    tag: &Expression,
    cases: &[CaseClause],
) -> Result<()> {
    g.comment("[ SwitchStatement");
    let break_target = g.exit_target(Direction::ForwardOnly)?;
    register_exits(g, id, break_target, None);

    g.load(tag)?;
    match fast_switch_table(g, cases) {
        Some(table) => generate_fast_switch(g, cases, &table, break_target)?,
        None => generate_slow_switch(g, cases)?,
    }

    g.exits.remove(&id);
    g.bind_if_linked(break_target)?;
    g.comment("]");
    Ok(())
}

/// Dispatch table of a switch whose labels are dense small integers.
#[derive(Debug)]
struct SwitchTable {
    min: i32,
    /// Clause index for each value in `min..min + entries.len()`.
    entries: Vec<Option<usize>>,
    default_index: Option<usize>,
}

fn fast_switch_table(g: &CodeGenerator<'_>, cases: &[CaseClause]) -> Option<SwitchTable> {
    if cases.len() < g.options.fast_switch_min_cases {
        return None;
    }
    let mut min = SMI_MAX;
    let mut max = SMI_MIN;
    let mut default_index = None;
    for (index, clause) in cases.iter().enumerate() {
        match &clause.label {
            None => {
                // Several defaults are reported at runtime by the slow path.
                if default_index.is_some() {
                    return None;
                }
                default_index = Some(index);
            }
            Some(label) => {
                let value = label.as_smi_literal()?;
                min = min.min(value);
                max = max.max(value);
            }
        }
    }
    if min > max {
        return None;
    }
    let range = (i64::from(max) - i64::from(min) + 1) as usize;
    if range / g.options.fast_switch_max_overhead.max(1) > cases.len() {
        return None;
    }

    let mut entries = vec![default_index; range];
    // Earlier clauses win for duplicate labels.
    for (index, clause) in cases.iter().enumerate().rev() {
        if let Some(value) = clause.label.as_ref().and_then(Expression::as_smi_literal) {
            entries[(i64::from(value) - i64::from(min)) as usize] = Some(index);
        }
    }
    Some(SwitchTable {
        min,
        entries,
        default_index,
    })
}

fn generate_fast_switch(
    g: &mut CodeGenerator<'_>,
    cases: &[CaseClause],
    table: &SwitchTable,
    break_target: TargetId,
) -> Result<()> {
    g.comment("[ fast case switch");
    let setup_default = g.forward_target();
    let is_smi = g.forward_target();
    let default_target = if table.default_index.is_some() {
        setup_default
    } else {
        break_target
    };

    g.spill()?;
    g.emit_pop(Reg::R0)?;
    g.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
    g.emitter.branch(is_smi, Condition::Eq)?;
    compare_instance_type(g, Reg::R0, Reg::R1, HEAP_NUMBER_TYPE);
    g.emitter.branch(default_target, Condition::Ne)?;
    g.emit_push(Reg::R0)?;
    g.call_runtime(RuntimeFunction::NumberToSmi)?;
    g.emitter.bind(is_smi)?;

    let min = table.min;
    let masm = g.masm();
    if min < 0 {
        if min > SMI_MIN {
            masm.add(Reg::R0, Reg::R0, Operand::smi(-min));
        } else {
            // -SMI_MIN is not a smi.
            masm.add(Reg::R0, Reg::R0, Operand::smi(-min - 1));
            masm.add(Reg::R0, Reg::R0, Operand::smi(1));
        }
    } else if min > 0 {
        masm.sub(Reg::R0, Reg::R0, Operand::smi(min));
    }
    masm.tst(Reg::R0, Operand::Imm(0x8000_0000_u32 as i32 | SMI_TAG_MASK as i32));
    g.emitter.branch(default_target, Condition::Ne)?;
    g.masm().cmp(Reg::R0, Operand::smi(table.entries.len() as i32));
    g.emitter.branch(default_target, Condition::Ge)?;

    let start_frame = g.frame()?.clone();
    let case_labels: Vec<Label> = cases.iter().map(|_| g.masm().new_label()).collect();
    let fallback = table
        .entries
        .iter()
        .any(Option::is_none)
        .then(|| g.masm().new_label());
    let targets: Vec<Label> = table
        .entries
        .iter()
        .map(|entry| match (entry, fallback) {
            (Some(index), _) => Ok(case_labels[*index]),
            (None, Some(fallback)) => Ok(fallback),
            (None, None) => Err(Error::Internal("switch table gap without fallback".into())),
        })
        .collect::<Result<_>>()?;
    g.masm().jump_table(Reg::R0, &targets);

    for (clause, label) in cases.iter().zip(&case_labels) {
        g.comment("[ Case clause");
        if g.has_valid_frame() {
            let (masm, frame) = g.parts()?;
            frame.merge_to(masm, &start_frame)?;
        } else {
            g.emitter.set_frame(start_frame.clone());
        }
        g.masm().bind(*label)?;
        g.visit_statements(&clause.statements)?;
        g.comment("]");
    }

    if let Some(fallback) = fallback {
        if g.has_valid_frame() {
            g.emitter.jump(break_target)?;
        }
        g.emitter.set_frame(start_frame.clone());
        g.masm().bind(fallback)?;
        g.emitter.jump(break_target)?;
    }

    if let Some(default_index) = table.default_index {
        if g.has_valid_frame() {
            g.emitter.jump(break_target)?;
        }
        if g.emitter.is_linked(setup_default) {
            g.emitter.bind(setup_default)?;
            let (masm, frame) = g.parts()?;
            frame.merge_to(masm, &start_frame)?;
            g.masm().jmp(case_labels[default_index]);
            g.emitter.take_frame();
        }
    }
    g.comment("]");
    Ok(())
}

fn generate_slow_switch(g: &mut CodeGenerator<'_>, cases: &[CaseClause]) -> Result<()> {
    let default_entry = g.forward_target();
    let default_exit = g.bidirectional_target();
    let mut next_test: Option<TargetId> = None;
    let mut fall_through: Option<TargetId> = None;
    let mut default_clause = None;

    for (index, clause) in cases.iter().enumerate() {
        let Some(label) = &clause.label else {
            default_clause = Some(clause);
            continue;
        };
        g.comment("[ Case clause");
        if let Some(test) = next_test.take() {
            g.emitter.bind(test)?;
        }

        // Compare a copy of the switch value with the label.
        g.load_element(Reg::R0, 0)?;
        g.emit_push(Reg::R0)?;
        comparison::comparison(g, Condition::Eq, None, Some(label), true)?;
        let test = g.forward_target();
        g.branch_cc(false, test)?;
        next_test = Some(test);

        // The body runs without the switch value.
        g.drop_elements(1)?;

        let follows_default = index > 0 && cases[index - 1].label.is_none();
        if follows_default {
            g.emitter.bind(default_exit)?;
        } else if let Some(target) = fall_through.take() {
            g.emitter.bind(target)?;
        }
        g.visit_statements(&clause.statements)?;

        if g.has_valid_frame() {
            let precedes_default = cases.get(index + 1).is_some_and(|c| c.label.is_none());
            if precedes_default {
                g.emitter.jump(default_entry)?;
            } else {
                let target = g.forward_target();
                g.emitter.jump(target)?;
                fall_through = Some(target);
            }
        }
        g.comment("]");
    }

    // The last failed test removes the switch value.
    if let Some(test) = next_test {
        g.emitter.bind(test)?;
    }
    g.drop_elements(1)?;

    if let Some(clause) = default_clause {
        g.comment("[ Default clause");
        g.emitter.bind(default_entry)?;
        g.visit_statements(&clause.statements)?;
        if g.has_valid_frame() && g.emitter.is_bound(default_exit) {
            g.emitter.jump(default_exit)?;
        }
        g.comment("]");
    }

    if let Some(target) = fall_through {
        g.bind_if_linked(target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_analysis() {
        assert_eq!(analyze_condition(None), ConditionInfo::AlwaysTrue);
        assert_eq!(
            analyze_condition(Some(&Expression::Literal(Literal::False))),
            ConditionInfo::AlwaysFalse
        );
        assert_eq!(
            analyze_condition(Some(&Expression::Literal(Literal::Number(1.0)))),
            ConditionInfo::DontKnow
        );
    }
}
