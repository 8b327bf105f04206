//! Materialized literals and closures.
//!
//! Object, array and regexp literals are cloned from a boilerplate kept in
//! the function's literals array. The boilerplate is created by deferred code
//! the first time the literal is evaluated.

use std::rc::Rc;

use super::deferred::{DeferredKind, literal_offset};
use super::generator::CodeGenerator;
use crate::ast::{CompileTimeValue, Expression, FunctionLiteral, Literal, ObjectProperty, PropertyKind};
use crate::layout::{JS_FUNCTION_LITERALS_OFFSET, JS_OBJECT_ELEMENTS_OFFSET, fixed_array_element};
use crate::machine::{Condition, Constant, MemOperand, Operand, Reg};
use crate::runtime::RuntimeFunction;
use crate::Result;

/// The constant a literal node denotes. Integral numbers in smi range
/// become smis.
#[must_use]
pub fn literal_constant(literal: &Literal) -> Constant {
    match literal {
        Literal::Undefined => Constant::Undefined,
        Literal::Null => Constant::Null,
        Literal::True => Constant::True,
        Literal::False => Constant::False,
        Literal::TheHole => Constant::TheHole,
        Literal::Number(value) => match literal.as_smi() {
            Some(smi) => Constant::Smi(smi),
            None => Constant::Number(*value),
        },
        Literal::String(value) => Constant::String(Rc::clone(value)),
    }
}

/// Boilerplate contents. Nested objects become object descriptions and
/// nested arrays constant arrays.
#[must_use]
pub fn compile_time_constant(value: &CompileTimeValue) -> Constant {
    match value {
        CompileTimeValue::Literal(literal) => literal_constant(literal),
        CompileTimeValue::Object(properties) => {
            Constant::ObjectDescription(object_description(properties))
        }
        CompileTimeValue::Array(elements) => {
            Constant::Array(elements.iter().map(compile_time_constant).collect())
        }
    }
}

/// Flattened `key, value` pairs.
fn object_description(properties: &[(Literal, CompileTimeValue)]) -> Rc<[Constant]> {
    properties
        .iter()
        .flat_map(|(key, value)| [literal_constant(key), compile_time_constant(value)])
        .collect()
}

/// Loads the literals array into `r1` and the boilerplate at `index` into
/// `r2`, entering `entry` when the boilerplate does not exist yet.
fn load_boilerplate(g: &mut CodeGenerator<'_>, index: usize, kind: DeferredKind) -> Result<()> {
    let (entry, exit) = g.defer(kind);
    g.spill()?;
    let (masm, frame) = g.parts()?;
    masm.ldr(Reg::R1, frame.function());
    masm.ldr(Reg::R1, MemOperand::field(Reg::R1, JS_FUNCTION_LITERALS_OFFSET));
    masm.ldr(Reg::R2, MemOperand::field(Reg::R1, literal_offset(index)));
    masm.cmp_constant(Reg::R2, Constant::Undefined);
    g.emitter.branch(entry, Condition::Eq)?;
    g.emitter.bind(exit)
}

pub fn visit_regexp_literal(
    g: &mut CodeGenerator<'_>,
    pattern: &Rc<str>,
    flags: &Rc<str>,
    literal_index: usize,
) -> Result<()> {
    g.comment("[ RegExp Literal");
    load_boilerplate(
        g,
        literal_index,
        DeferredKind::RegExpLiteral {
            literal_index,
            pattern: Rc::clone(pattern),
            flags: Rc::clone(flags),
        },
    )?;
    g.emit_push(Reg::R2)?;
    g.comment("]");
    Ok(())
}

/// Pushes a clone of the boilerplate in `r2`; the clone is also left in `r0`.
fn clone_boilerplate(g: &mut CodeGenerator<'_>, depth: usize) -> Result<()> {
    g.emit_push(Reg::R2)?;
    g.call_runtime(if depth == 1 {
        RuntimeFunction::CloneShallowLiteralBoilerplate
    } else {
        RuntimeFunction::CloneLiteralBoilerplate
    })?;
    g.emit_push(Reg::R0)
}

pub fn visit_object_literal(
    g: &mut CodeGenerator<'_>,
    properties: &[ObjectProperty],
    constant_properties: &[(Literal, CompileTimeValue)],
    literal_index: usize,
    depth: usize,
) -> Result<()> {
    g.comment("[ ObjectLiteral");
    load_boilerplate(
        g,
        literal_index,
        DeferredKind::ObjectLiteral {
            literal_index,
            constant_properties: object_description(constant_properties),
        },
    )?;
    clone_boilerplate(g, depth)?;

    for property in properties {
        let accessor = match property.kind {
            PropertyKind::Constant => continue,
            PropertyKind::MaterializedLiteral if property.value.compile_time_value().is_some() => {
                continue;
            }
            PropertyKind::MaterializedLiteral | PropertyKind::Computed | PropertyKind::Prototype => {
                None
            }
            PropertyKind::Getter => Some(0),
            PropertyKind::Setter => Some(1),
        };
        // The clone stays on top of the frame; r0 holds it again after
        // every store.
        g.emit_push(Reg::R0)?;
        g.push_constant(literal_constant(&property.key))?;
        match accessor {
            None => {
                g.load(&property.value)?;
                g.call_runtime(RuntimeFunction::SetProperty)?;
            }
            Some(flag) => {
                g.push_constant(Constant::Smi(flag))?;
                g.load(&property.value)?;
                g.call_runtime(RuntimeFunction::DefineAccessor)?;
            }
        }
        g.load_element(Reg::R0, 0)?;
    }
    g.comment("]");
    Ok(())
}

pub fn visit_array_literal(
    g: &mut CodeGenerator<'_>,
    values: &[Expression],
    constant_elements: &[CompileTimeValue],
    literal_index: usize,
    depth: usize,
) -> Result<()> {
    g.comment("[ ArrayLiteral");
    load_boilerplate(
        g,
        literal_index,
        DeferredKind::ArrayLiteral {
            literal_index,
            constant_elements: constant_elements.iter().map(compile_time_constant).collect(),
        },
    )?;
    clone_boilerplate(g, depth)?;

    for (index, value) in values.iter().enumerate() {
        // Literals and simple nested literals are part of the boilerplate.
        if value.compile_time_value().is_some() {
            continue;
        }
        g.load(value)?;
        g.spill()?;
        g.emit_pop(Reg::R0)?;
        g.load_element(Reg::R1, 0)?;
        let masm = g.masm();
        masm.ldr(Reg::R1, MemOperand::field(Reg::R1, JS_OBJECT_ELEMENTS_OFFSET));
        let offset = fixed_array_element(index);
        masm.str(Reg::R0, MemOperand::new(Reg::R1, offset));
        masm.mov(Reg::R3, Operand::Imm(offset + 1));
        masm.record_write(Reg::R1, Reg::R3, Reg::R2);
    }
    g.comment("]");
    Ok(())
}

/// Creates a closure of `function` in the current context. The function
/// itself is compiled when it is first called.
pub fn visit_function_literal(g: &mut CodeGenerator<'_>, function: &Rc<FunctionLiteral>) -> Result<()> {
    g.comment(format!("[ FunctionLiteral {}", function.name));
    g.emit_push(Reg::CP)?;
    g.push_constant(Constant::Function(Rc::clone(function)))?;
    g.call_runtime(RuntimeFunction::NewClosure)?;
    g.emit_push(Reg::R0)?;
    g.comment("]");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_become_smis_when_they_fit() {
        assert_eq!(literal_constant(&Literal::Number(7.0)), Constant::Smi(7));
        assert_eq!(literal_constant(&Literal::Number(0.5)), Constant::Number(0.5));
        assert_eq!(literal_constant(&Literal::Number(-0.0)), Constant::Number(-0.0));
    }

    #[test]
    fn test_object_description_is_flattened() {
        let description = compile_time_constant(&CompileTimeValue::Object(vec![
            (
                Literal::String("a".into()),
                CompileTimeValue::Literal(Literal::Number(1.0)),
            ),
            (
                Literal::String("b".into()),
                CompileTimeValue::Array(vec![CompileTimeValue::Literal(Literal::True)]),
            ),
        ]));
        let Constant::ObjectDescription(items) = description else {
            panic!("expected an object description");
        };
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Constant::string("a"));
        assert_eq!(items[1], Constant::Smi(1));
        assert_eq!(items[3], Constant::Array(vec![Constant::True].into()));
    }
}
