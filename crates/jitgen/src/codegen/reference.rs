//! Assignable locations.
//!
//! A [`Reference`] is created by [`load_reference`], which pushes whatever the
//! location needs on the frame (nothing for a slot, the receiver for a named
//! property, receiver and key for a keyed one). [`get_value`] and
//! [`set_value`] leave the value on top of those elements and
//! [`unload_reference`] removes them from under it.

use std::rc::Rc;

use super::generator::{CodeGenerator, TypeofState};
use crate::ast::{Expression, Literal, Slot, Variable, as_array_index};
use crate::layout::{
    CONTEXT_CLOSURE_INDEX, CONTEXT_FCONTEXT_INDEX, CONTEXT_GLOBAL_INDEX,
    FIXED_ARRAY_HEADER_SIZE, JS_FUNCTION_CONTEXT_OFFSET, POINTER_SIZE, SMI_TAG_MASK,
};
use crate::machine::{Condition, Constant, MemOperand, Operand, Reg};
use crate::runtime::{CallTarget, IcKind, RuntimeFunction};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceKind {
    /// Not a valid assignment target; a reference error has been raised.
    Illegal,
    Slot(Variable),
    Named { name: Rc<str>, is_global: bool },
    Keyed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    kind: ReferenceKind,
}

/// Whether a store is the initialization of a `const`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    ConstInit,
    NotConstInit,
}

impl Reference {
    #[must_use]
    pub fn new(kind: ReferenceKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> &ReferenceKind {
        &self.kind
    }

    #[must_use]
    pub fn is_illegal(&self) -> bool {
        self.kind == ReferenceKind::Illegal
    }

    /// Frame elements the reference occupies below its value.
    #[must_use]
    pub fn size(&self) -> usize {
        match self.kind {
            ReferenceKind::Illegal | ReferenceKind::Slot(_) => 0,
            ReferenceKind::Named { .. } => 1,
            ReferenceKind::Keyed => 2,
        }
    }
}

/// Pushes what the location denoted by `target` needs.
pub fn load_reference(g: &mut CodeGenerator<'_>, target: &Expression) -> Result<Reference> {
    let kind = match target {
        Expression::Property { object, key } => {
            g.load(object)?;
            match key.as_literal() {
                Some(Literal::String(name)) if as_array_index(name).is_none() => {
                    ReferenceKind::Named {
                        name: Rc::clone(name),
                        is_global: false,
                    }
                }
                _ => {
                    g.load(key)?;
                    ReferenceKind::Keyed
                }
            }
        }
        Expression::Variable(variable) if variable.is_global() => {
            load_global(g)?;
            ReferenceKind::Named {
                name: Rc::clone(&variable.name),
                is_global: true,
            }
        }
        Expression::Variable(variable) => ReferenceKind::Slot(variable.clone()),
        other => {
            g.load(other)?;
            g.call_runtime(RuntimeFunction::ThrowReferenceError)?;
            ReferenceKind::Illegal
        }
    };
    Ok(Reference::new(kind))
}

/// Removes the reference's elements from under the value on top.
pub fn unload_reference(g: &mut CodeGenerator<'_>, reference: &Reference) -> Result<()> {
    let size = reference.size();
    if size > 0 {
        g.spill()?;
        g.emit_pop(Reg::R0)?;
        g.drop_elements(size)?;
        g.emit_push(Reg::R0)?;
    }
    Ok(())
}

/// Pushes the value at the reference.
pub fn get_value(
    g: &mut CodeGenerator<'_>,
    reference: &Reference,
    typeof_state: TypeofState,
) -> Result<()> {
    match &reference.kind {
        ReferenceKind::Illegal => Err(Error::Internal("load through an illegal reference".into())),
        ReferenceKind::Slot(variable) => load_from_slot(g, variable, typeof_state),
        ReferenceKind::Named { name, is_global } => {
            g.comment(format!("[ load from named property {name}"));
            g.spill()?;
            g.masm().load_constant(Reg::R2, Constant::String(Rc::clone(name)));
            let contextual = *is_global && typeof_state == TypeofState::NotInsideTypeof;
            g.call_code(CallTarget::Ic(IcKind::Load { contextual }), 0)?;
            g.emit_push(Reg::R0)?;
            g.comment("]");
            Ok(())
        }
        ReferenceKind::Keyed => {
            g.comment("[ load from keyed property");
            g.call_code(CallTarget::Ic(IcKind::KeyedLoad), 0)?;
            g.emit_push(Reg::R0)?;
            g.comment("]");
            Ok(())
        }
    }
}

/// Stores the value on top of the frame through the reference, leaving the
/// value on top.
pub fn set_value(g: &mut CodeGenerator<'_>, reference: &Reference, init: InitState) -> Result<()> {
    g.spill()?;
    match &reference.kind {
        ReferenceKind::Illegal => Err(Error::Internal("store through an illegal reference".into())),
        ReferenceKind::Slot(variable) => store_to_slot(g, variable, init),
        ReferenceKind::Named { name, .. } => {
            g.comment(format!("[ store to named property {name}"));
            g.emit_pop(Reg::R0)?;
            g.masm().load_constant(Reg::R2, Constant::String(Rc::clone(name)));
            g.call_code(CallTarget::Ic(IcKind::Store), 0)?;
            g.emit_push(Reg::R0)?;
            g.comment("]");
            Ok(())
        }
        ReferenceKind::Keyed => {
            g.comment("[ store to keyed property");
            g.emit_pop(Reg::R0)?;
            g.call_code(CallTarget::Ic(IcKind::KeyedStore), 0)?;
            g.emit_push(Reg::R0)?;
            g.comment("]");
            Ok(())
        }
    }
}

fn store_to_slot(g: &mut CodeGenerator<'_>, variable: &Variable, init: InitState) -> Result<()> {
    if variable.slot == Slot::Lookup {
        g.comment(format!("[ store to lookup slot {}", variable.name));
        g.emit_push(Reg::CP)?;
        g.push_constant(Constant::String(Rc::clone(&variable.name)))?;
        let function = match init {
            InitState::ConstInit => RuntimeFunction::InitializeConstContextSlot,
            InitState::NotConstInit => RuntimeFunction::StoreContextSlot,
        };
        g.call_runtime(function)?;
        g.emit_push(Reg::R0)?;
        g.comment("]");
        return Ok(());
    }

    let exit = g.forward_target();
    if init == InitState::ConstInit {
        // Only the first initialization of a const stores.
        g.comment("[ const initialization check");
        let operand = slot_operand(g, variable.slot, Reg::R2)?;
        g.masm().ldr(Reg::R2, operand);
        g.masm().cmp_constant(Reg::R2, Constant::TheHole);
        g.emitter.branch(exit, Condition::Ne)?;
        g.comment("]");
    }

    g.emit_pop(Reg::R0)?;
    let operand = slot_operand(g, variable.slot, Reg::R2)?;
    g.masm().str(Reg::R0, operand);
    g.emit_push(Reg::R0)?;

    if let Slot::Context { index, .. } = variable.slot {
        // Smis need no write barrier.
        g.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
        g.emitter.branch(exit, Condition::Eq)?;
        record_context_write(g, index);
    }
    if init == InitState::ConstInit || matches!(variable.slot, Slot::Context { .. }) {
        g.emitter.bind(exit)?;
    }
    Ok(())
}

/// Emits the write barrier for a store into slot `index` of the context in
/// `r2`. Clobbers `r1` and `r3`.
pub fn record_context_write(g: &mut CodeGenerator<'_>, index: usize) {
    let masm = g.masm();
    masm.mov(Reg::R3, Operand::Imm(FIXED_ARRAY_HEADER_SIZE + index as i32 * POINTER_SIZE));
    masm.record_write(Reg::R2, Reg::R3, Reg::R1);
}

/// Memory operand of a parameter, local or context slot. Context slots walk
/// the closure chain through `tmp`.
pub fn slot_operand(g: &mut CodeGenerator<'_>, slot: Slot, tmp: Reg) -> Result<MemOperand> {
    match slot {
        Slot::Parameter(index) => Ok(g.frame()?.parameter_at(index)),
        Slot::Local(index) => Ok(g.frame()?.local_at(index)),
        Slot::Context { index, depth } => {
            let masm = g.masm();
            let mut context = Reg::CP;
            for _ in 0..depth {
                masm.ldr(tmp, MemOperand::context(context, CONTEXT_CLOSURE_INDEX));
                masm.ldr(tmp, MemOperand::field(tmp, JS_FUNCTION_CONTEXT_OFFSET));
                context = tmp;
            }
            // A with or catch context may sit in front of the function context.
            masm.ldr(tmp, MemOperand::context(context, CONTEXT_FCONTEXT_INDEX));
            Ok(MemOperand::context(tmp, index))
        }
        Slot::Lookup | Slot::Global => Err(Error::Internal(format!(
            "no memory operand for {slot:?} slots"
        ))),
    }
}

/// Pushes the value of a variable that has a slot.
pub fn load_from_slot(
    g: &mut CodeGenerator<'_>,
    variable: &Variable,
    typeof_state: TypeofState,
) -> Result<()> {
    match variable.slot {
        Slot::Lookup => {
            g.comment(format!("[ load from lookup slot {}", variable.name));
            g.emit_push(Reg::CP)?;
            g.push_constant(Constant::String(Rc::clone(&variable.name)))?;
            let function = match typeof_state {
                TypeofState::InsideTypeof => RuntimeFunction::LoadContextSlotNoReferenceError,
                TypeofState::NotInsideTypeof => RuntimeFunction::LoadContextSlot,
            };
            g.call_runtime(function)?;
            g.emit_push(Reg::R0)?;
            g.comment("]");
        }
        Slot::Global => {
            return Err(Error::Internal(format!(
                "global {} loaded as a slot",
                variable.name
            )));
        }
        Slot::Parameter(_) | Slot::Local(_) if !variable.is_const() => {
            let operand = slot_operand(g, variable.slot, Reg::IP)?;
            let (masm, frame) = g.parts()?;
            let guard = frame.allocate(masm)?;
            masm.ldr(guard.reg(), operand);
            frame.push_register(guard.reg());
        }
        Slot::Parameter(_) | Slot::Local(_) | Slot::Context { .. } => {
            g.spill()?;
            let operand = slot_operand(g, variable.slot, Reg::R2)?;
            g.masm().ldr(Reg::R0, operand);
            if variable.is_const() {
                // An uninitialized const reads as undefined.
                g.comment("[ const hole check");
                let masm = g.masm();
                let initialized = masm.new_label();
                masm.cmp_constant(Reg::R0, Constant::TheHole);
                masm.b(Condition::Ne, initialized);
                masm.load_constant(Reg::R0, Constant::Undefined);
                masm.bind(initialized)?;
                g.comment("]");
            }
            g.emit_push(Reg::R0)?;
        }
    }
    Ok(())
}

/// Pushes the global object.
pub fn load_global(g: &mut CodeGenerator<'_>) -> Result<()> {
    g.spill()?;
    g.masm().ldr(Reg::R0, MemOperand::context(Reg::CP, CONTEXT_GLOBAL_INDEX));
    g.emit_push(Reg::R0)
}

/// Pushes the operand of `typeof`. A global is read as a property of the
/// global object so that a missing name yields undefined.
pub fn load_typeof_expression(g: &mut CodeGenerator<'_>, expression: &Expression) -> Result<()> {
    match expression {
        Expression::Variable(variable) if variable.is_global() => {
            load_global(g)?;
            let reference = Reference::new(ReferenceKind::Named {
                name: Rc::clone(&variable.name),
                is_global: false,
            });
            get_value(g, &reference, TypeofState::InsideTypeof)?;
            unload_reference(g, &reference)
        }
        other => g.load_with(other, TypeofState::InsideTypeof),
    }
}

/// Variable proxy: slot variables load directly, globals through the
/// global object.
pub fn visit_variable(g: &mut CodeGenerator<'_>, variable: &Variable) -> Result<()> {
    let typeof_state = g.typeof_state();
    if variable.is_global() {
        let reference = load_reference(g, &Expression::Variable(variable.clone()))?;
        get_value(g, &reference, typeof_state)?;
        unload_reference(g, &reference)
    } else {
        load_from_slot(g, variable, typeof_state)
    }
}

pub fn visit_property(g: &mut CodeGenerator<'_>, property: &Expression) -> Result<()> {
    let typeof_state = g.typeof_state();
    let reference = load_reference(g, property)?;
    get_value(g, &reference, typeof_state)?;
    unload_reference(g, &reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VariableMode;

    #[test]
    fn test_reference_sizes() {
        let slot = Reference::new(ReferenceKind::Slot(Variable::new(
            "x",
            VariableMode::Var,
            Slot::Local(0),
        )));
        let named = Reference::new(ReferenceKind::Named {
            name: "p".into(),
            is_global: false,
        });
        let keyed = Reference::new(ReferenceKind::Keyed);
        assert_eq!(slot.size(), 0);
        assert_eq!(named.size(), 1);
        assert_eq!(keyed.size(), 2);
        assert!(Reference::new(ReferenceKind::Illegal).is_illegal());
    }
}
