// Single-pass code generator
//
// Walks a resolved function literal once and emits machine code for it,
// keeping a virtual frame that delays pushes and tracks register contents.
//
// This module is organized into submodules:
// - `register_allocator`: reference-counted allocatable registers
// - `virtual_frame`: compile-time model of the JS frame and expression stack
// - `jump_target`: labels that carry the frame expected on arrival
// - `deferred`: out-of-line slow paths emitted after the body
// - `generator`: generator state and the load / condition protocol
// - `reference`: assignable locations (slots, named and keyed properties)
// - `statements`, `control_flow`, `exceptions`: statement lowering
// - `expressions`, `arithmetic`, `comparison`, `calls`, `literals`:
//   expression lowering

pub mod deferred;
pub mod generator;
pub mod jump_target;
pub mod reference;
pub mod register_allocator;
pub mod virtual_frame;

mod arithmetic;
mod calls;
mod comparison;
mod control_flow;
mod exceptions;
mod expressions;
mod literals;
mod statements;

use tracing::debug;

pub use generator::{CodeGenerator, TypeofState};

use crate::ast::{FunctionLiteral, Slot};
use crate::machine::{Code, Constant, FunctionMetadata, Operand, Reg, words_to_bytes};
use crate::options::CompileOptions;
use crate::runtime::RuntimeFunction;
use crate::{Error, Result};
use reference::{InitState, Reference, ReferenceKind};
use virtual_frame::VirtualFrame;

/// Compiles one function literal to a code object.
///
/// Nothing is produced when compilation fails; in particular a nesting depth
/// beyond [`CompileOptions::max_recursion_depth`] yields
/// [`Error::StackOverflow`].
pub fn compile(function: &FunctionLiteral, options: &CompileOptions) -> Result<Code> {
    debug!(
        name = %function.name,
        source = %options.source_name,
        parameters = function.scope.num_parameters,
        "compile function"
    );
    let mut generator = CodeGenerator::new(function, options);
    if let Err(err) = generate_body(&mut generator) {
        generator.deferred.clear();
        debug!(name = %function.name, error = %err, "compilation failed");
        return Err(err);
    }

    let deferred_count = generator.deferred.len();
    generator.deferred.process(&mut generator.emitter)?;

    let (masm, registers) = generator.emitter.finish();
    if !registers.all_free() {
        return Err(Error::Internal(format!(
            "registers {:?} still in use at the end of {}",
            registers.used_registers(),
            function.name
        )));
    }
    let code = masm.finalize(FunctionMetadata {
        name: function.name.clone(),
        parameter_count: function.scope.num_parameters,
        literal_count: function.materialized_literal_count,
        expected_property_count: function.expected_property_count,
        start_position: function.start_position,
        end_position: function.end_position,
        is_expression: function.is_expression,
    })?;
    debug!(
        name = %function.name,
        instructions = code.len(),
        deferred = deferred_count,
        "compiled function"
    );
    Ok(code)
}

/// Prologue, declarations, body and return sequence.
fn generate_body(g: &mut CodeGenerator<'_>) -> Result<()> {
    let function = g.function;
    let scope = &function.scope;

    let mut frame = VirtualFrame::new(scope.num_parameters, scope.num_stack_slots);
    g.comment(format!("[ function {}", function.name));
    frame.enter(g.masm());
    frame.allocate_stack_slots(g.masm());
    g.emitter.set_frame(frame);
    g.masm().record_position(function.start_position);

    if scope.num_heap_slots > 0 {
        g.comment("[ allocate local context");
        let (masm, frame) = g.parts()?;
        let function_slot = frame.function();
        masm.ldr(Reg::R0, function_slot);
        g.emit_push(Reg::R0)?;
        g.call_runtime(RuntimeFunction::NewContext)?;
        let (masm, frame) = g.parts()?;
        let context = frame.context();
        masm.str(Reg::CP, context);
        g.comment("]");
    }

    // Copy parameters that live in the context into their slots.
    for (index, parameter) in scope.parameters.iter().enumerate() {
        if let Slot::Context { index: slot, depth } = parameter.slot {
            if depth != 0 {
                return Err(Error::Internal(format!(
                    "parameter {} allocated in an outer context",
                    parameter.name
                )));
            }
            let (masm, frame) = g.parts()?;
            masm.ldr(Reg::R1, frame.parameter_at(index));
            let operand = reference::slot_operand(g, parameter.slot, Reg::R2)?;
            g.masm().str(Reg::R1, operand);
            reference::record_context_write(g, slot);
        }
    }

    if let Some(arguments) = &scope.arguments {
        g.comment("[ allocate arguments object");
        let (masm, frame) = g.parts()?;
        masm.ldr(Reg::R0, frame.function());
        g.emit_push(Reg::R0)?;
        g.call_runtime(RuntimeFunction::NewArguments)?;
        g.emit_push(Reg::R0)?;
        let arguments_ref = Reference::new(ReferenceKind::Slot(arguments.clone()));
        reference::set_value(g, &arguments_ref, InitState::NotConstInit)?;
        if let Some(shadow) = &scope.arguments_shadow {
            let shadow_ref = Reference::new(ReferenceKind::Slot(shadow.clone()));
            reference::set_value(g, &shadow_ref, InitState::NotConstInit)?;
        }
        g.drop_elements(1)?;
        g.comment("]");
    }

    if let Some(message) = &scope.illegal_redeclaration {
        tracing::warn!(name = %function.name, %message, "illegal redeclaration");
        g.push_constant(Constant::string(message))?;
        g.call_runtime(RuntimeFunction::ThrowTypeError)?;
    } else {
        statements::declare_variables(g, scope)?;
        if g.options.trace_calls {
            g.call_runtime(RuntimeFunction::TraceEnter)?;
        }
        g.check_stack()?;
        g.visit_statements(&function.body)?;
    }

    let function_return = g.function_return;
    if g.has_valid_frame() || g.emitter.is_linked(function_return) {
        if g.has_valid_frame() {
            g.spill()?;
            g.masm().load_constant(Reg::R0, Constant::Undefined);
        }
        g.emitter.bind(function_return)?;
        g.comment("[ return");
        if g.options.trace_calls {
            g.emit_push(Reg::R0)?;
            g.call_runtime(RuntimeFunction::TraceExit)?;
        }
        let parameter_count = scope.num_parameters;
        let (masm, frame) = g.parts()?;
        masm.record_position(function.end_position);
        masm.record_js_return();
        frame.exit(masm);
        masm.add(Reg::SP, Reg::SP, Operand::Imm(words_to_bytes(parameter_count + 1)));
        masm.bx(Reg::LR);
        g.emitter.take_frame();
        g.comment("]");
    }
    g.comment("]");
    Ok(())
}
