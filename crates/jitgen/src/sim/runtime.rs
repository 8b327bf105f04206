//! Runtime functions called from generated code.
//!
//! Names are resolved through the context chain. Each context is a
//! function context (its `FCONTEXT` slot is itself) or a `with`/catch
//! context in front of one. A function context binds the context-allocated
//! variables of its closure plus the properties of its extension object; a
//! `with` context binds the properties of its object. The global context's
//! extension is the global object.

use std::rc::Rc;

use super::builtins::Key;
use super::heap::{DONT_DELETE, DONT_ENUM, Heap, MAX_FAST_ELEMENT, READ_ONLY};
use super::{ErrorKind, Exec, Simulator, Trap};
use crate::ast::{Slot, VariableMode};
use crate::layout::{
    CONTEXT_CLOSURE_INDEX, CONTEXT_EXTENSION_INDEX, CONTEXT_FCONTEXT_INDEX, CONTEXT_GLOBAL_INDEX,
    CONTEXT_MIN_SLOTS, CONTEXT_PREVIOUS_INDEX, FUNCTION_OFFSET, POINTER_SIZE, SMI_MAX, SMI_MIN,
    smi, untag_smi,
};
use crate::machine::Reg;
use crate::runtime::{CallTarget, RuntimeFunction};
use crate::{Error, Result};

const WORD: u32 = POINTER_SIZE as u32;

/// Where a name lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Slot {
        context: u32,
        index: usize,
        is_const: bool,
    },
    Property {
        holder: u32,
        /// The receiver of functions called through the binding.
        receiver: u32,
    },
}

impl Simulator {
    pub(super) fn dispatch_call(&mut self, target: CallTarget) -> Exec<()> {
        tracing::trace!(%target, "call");
        match target {
            CallTarget::Runtime(function) => self.call_runtime(function),
            CallTarget::Builtin(builtin) => self.call_builtin(builtin),
            CallTarget::Stub(stub) => self.call_stub(stub),
            CallTarget::Ic(ic) => self.call_ic(ic),
        }
    }

    // ── Context chain ──

    /// The context-allocated variable `name` of the closure owning the
    /// function context `context`.
    fn context_variable(&self, context: u32, name: &str) -> Result<Option<(usize, bool)>> {
        let closure = self.heap.context_get(context, CONTEXT_CLOSURE_INDEX)?;
        if !self.heap.is_function(closure)? {
            return Ok(None);
        }
        let Some(literal) = self.function_literal(self.heap.function_id(closure)?) else {
            return Ok(None);
        };
        let scope = &literal.scope;
        let declared = scope
            .declarations
            .iter()
            .map(|declaration| &declaration.variable);
        let found = scope
            .parameters
            .iter()
            .chain(declared)
            .chain(scope.arguments.iter())
            .chain(scope.arguments_shadow.iter())
            .filter(|variable| &*variable.name == name)
            .find_map(|variable| match variable.slot {
                Slot::Context { index, depth: 0 } => {
                    Some((index, variable.mode == VariableMode::Const))
                }
                _ => None,
            });
        Ok(found)
    }

    fn resolve(&mut self, context: u32, name: u32) -> Exec<Option<Binding>> {
        let text = self.heap.string_value(name)?.unwrap_or_else(|| Rc::from(""));
        let key = Key::Name(name);
        let global = self.heap.roots.global_object;
        let mut current = context;
        while self.heap.is_context(current)? {
            let is_function_context =
                self.heap.context_get(current, CONTEXT_FCONTEXT_INDEX)? == current;
            if is_function_context {
                if let Some((index, is_const)) = self.context_variable(current, &text)? {
                    return Ok(Some(Binding::Slot {
                        context: current,
                        index,
                        is_const,
                    }));
                }
            }
            let extension = self.heap.context_get(current, CONTEXT_EXTENSION_INDEX)?;
            if self.heap.is_js_object(extension)? && self.has_property(extension, key)? {
                let receiver = if is_function_context || self.heap.is_context_extension(extension)? {
                    global
                } else {
                    extension
                };
                return Ok(Some(Binding::Property {
                    holder: extension,
                    receiver,
                }));
            }
            current = self.heap.context_get(current, CONTEXT_PREVIOUS_INDEX)?;
        }
        Ok(None)
    }

    fn new_child_context(&mut self, length: usize, closure: u32, previous: u32) -> Result<u32> {
        let context = self.heap.new_context(length)?;
        let global = self.heap.context_get(previous, CONTEXT_GLOBAL_INDEX)?;
        self.heap.context_set(context, CONTEXT_CLOSURE_INDEX, closure)?;
        self.heap.context_set(context, CONTEXT_PREVIOUS_INDEX, previous)?;
        self.heap.context_set(context, CONTEXT_GLOBAL_INDEX, global)?;
        Ok(context)
    }

    /// A `with` or catch context for `object` in front of `cp`.
    fn push_with_context(&mut self, object: u32) -> Result<u32> {
        let current = self.reg(Reg::CP);
        let closure = self.heap.context_get(current, CONTEXT_CLOSURE_INDEX)?;
        let fcontext = self.heap.context_get(current, CONTEXT_FCONTEXT_INDEX)?;
        let context = self.new_child_context(CONTEXT_MIN_SLOTS, closure, current)?;
        self.heap.context_set(context, CONTEXT_FCONTEXT_INDEX, fcontext)?;
        self.heap.context_set(context, CONTEXT_EXTENSION_INDEX, object)?;
        self.set_reg(Reg::CP, context);
        Ok(context)
    }

    /// Declares `name` in the function context of `context`.
    fn declare_context_slot(
        &mut self,
        context: u32,
        name: u32,
        attributes: u32,
        value: u32,
    ) -> Exec<()> {
        let roots = self.heap.roots;
        let no_value = value == smi(0) as u32;
        let fcontext = self.heap.context_get(context, CONTEXT_FCONTEXT_INDEX)?;
        let text = self.heap.string_value(name)?.unwrap_or_else(|| Rc::from(""));
        if let Some((index, _)) = self.context_variable(fcontext, &text)? {
            if !no_value {
                self.heap.context_set(fcontext, index, value)?;
            }
            return Ok(());
        }

        let holder = if fcontext == roots.global_context {
            roots.global_object
        } else {
            let extension = self.heap.context_get(fcontext, CONTEXT_EXTENSION_INDEX)?;
            if self.heap.is_js_object(extension)? {
                extension
            } else {
                let extension = self.heap.new_context_extension()?;
                self.heap.context_set(fcontext, CONTEXT_EXTENSION_INDEX, extension)?;
                extension
            }
        };
        match self.heap.find_own(holder, name)? {
            Some((index, _)) => {
                if !no_value {
                    self.heap.set_own_value(holder, index, value)?;
                }
            }
            None => {
                let initial = if no_value { roots.undefined } else { value };
                self.heap.add_property(holder, name, initial, attributes)?;
            }
        }
        Ok(())
    }

    /// Declares the pairs `[name, value]` on the global object.
    fn declare_globals(&mut self, pairs: u32, is_eval: bool) -> Exec<()> {
        let roots = self.heap.roots;
        let global = roots.global_object;
        let items = self.heap.fixed_items(pairs)?;
        for pair in items.chunks_exact(2) {
            let (name, initial) = (pair[0], pair[1]);
            let is_const = initial == roots.the_hole;
            let value = if self.heap.is_shared(initial)? {
                let context = self.reg(Reg::CP);
                self.new_closure(context, initial)?
            } else {
                initial
            };
            let attributes = match (is_const, is_eval) {
                (true, _) => READ_ONLY | DONT_DELETE,
                (false, false) => DONT_DELETE,
                (false, true) => 0,
            };
            match self.heap.find_own(global, name)? {
                // Redeclaration keeps the current value unless a function
                // replaces it.
                Some((index, _)) => {
                    if self.heap.is_function(value)? {
                        self.heap.set_own_value(global, index, value)?;
                    }
                }
                None => self.heap.add_property(global, name, value, attributes)?,
            }
        }
        Ok(())
    }

    // ── Frames ──

    fn current_function(&self) -> Exec<u32> {
        let fp = self.reg(Reg::FP);
        Ok(self.heap.read(fp.wrapping_add_signed(FUNCTION_OFFSET))?)
    }

    fn parameter_count(&self, function: u32) -> Result<usize> {
        let id = self.heap.function_id(function)?;
        Ok(self
            .function_literal(id)
            .map_or(0, |literal| literal.scope.num_parameters))
    }

    /// An arguments object holding the actual arguments of the current frame.
    fn new_arguments(&mut self, function: u32) -> Exec<u32> {
        let fp = self.reg(Reg::FP);
        let parameters = self.parameter_count(function)?;
        let (last, argc) = self.actual_arguments(fp, parameters)?;
        let mut values = Vec::with_capacity(argc);
        for index in 0..argc {
            let address = last + (argc - 1 - index) as u32 * WORD;
            values.push(self.heap.read(address)?);
        }
        let object = self.heap.new_object(self.heap.roots.object_prototype)?;
        for (index, value) in values.iter().enumerate() {
            self.heap.set_element(object, index as u32, *value)?;
        }
        let length = smi(argc as i32) as u32;
        self.define_own(object, self.names.length, length, DONT_ENUM)?;
        Ok(object)
    }

    // ── Literals ──

    fn boilerplate_value(&mut self, word: u32) -> Result<u32> {
        if !Heap::is_smi(word) {
            let map = self.heap.map_of(word)?;
            if map == self.heap.roots.description_map {
                return self.object_from_description(word);
            }
            if map == self.heap.roots.fixed_array_map {
                return self.array_from_constants(word);
            }
        }
        Ok(word)
    }

    fn object_from_description(&mut self, description: u32) -> Result<u32> {
        let object = self.heap.new_object(self.heap.roots.object_prototype)?;
        let items = self.heap.fixed_items(description)?;
        for pair in items.chunks_exact(2) {
            let value = self.boilerplate_value(pair[1])?;
            let key = match self.heap.number_value(pair[0])? {
                Some(index) if index >= 0.0 && index.fract() == 0.0 => Key::Index(index as u32),
                _ => match self.heap.string_value(pair[0])? {
                    Some(text) => match crate::ast::as_array_index(&text) {
                        Some(index) if index < MAX_FAST_ELEMENT => Key::Index(index),
                        _ => Key::Name(pair[0]),
                    },
                    None => Key::Name(pair[0]),
                },
            };
            match key {
                Key::Index(index) => self.heap.set_element(object, index, value)?,
                Key::Name(name) => self.define_own(object, name, value, 0)?,
            }
        }
        Ok(object)
    }

    fn array_from_constants(&mut self, constants: u32) -> Result<u32> {
        let items = self.heap.fixed_items(constants)?;
        let values = items
            .into_iter()
            .map(|item| self.boilerplate_value(item))
            .collect::<Result<Vec<_>>>()?;
        self.heap.new_array(&values)
    }

    fn store_literal(&mut self, literals: u32, index: u32, value: u32) -> Result<()> {
        let slot = untag_smi(index) as usize;
        if slot >= self.heap.fixed_len(literals)? {
            return Err(Error::Simulator(format!("literal index {slot} out of range")));
        }
        self.heap.fixed_set(literals, slot, value)
    }

    /// Copies an object literal with its nested object literals.
    fn deep_copy(&mut self, object: u32) -> Result<u32> {
        let copy = self.heap.copy_object(object)?;
        for (index, _) in self.heap.own_properties(copy)?.iter().enumerate() {
            let value = self.heap.own_value(copy, index)?;
            if self.heap.is_js_object(value)? && !self.heap.is_function(value)? {
                let nested = self.deep_copy(value)?;
                self.heap.set_own_value(copy, index, nested)?;
            }
        }
        for index in self.heap.element_indices(copy)? {
            if let Some(value) = self.heap.element(copy, index)? {
                if self.heap.is_js_object(value)? && !self.heap.is_function(value)? {
                    let nested = self.deep_copy(value)?;
                    self.heap.set_element(copy, index, nested)?;
                }
            }
        }
        Ok(copy)
    }

    // ── For-in ──

    /// The object's map when its enum cache describes every enumerable
    /// key, otherwise a fixed array of the keys.
    fn property_names(&mut self, object: u32) -> Result<u32> {
        let map = self.heap.map_of(object)?;
        if self.has_simple_keys(object)? {
            let cache = self.heap.enum_cache(map)?;
            if Heap::is_smi(cache) {
                let keys = self.own_enumerable_keys(object)?;
                let cache = self.heap.fixed_array_from(&keys)?;
                self.heap.set_enum_cache(map, cache)?;
            }
            return Ok(map);
        }

        let mut keys: Vec<u32> = Vec::new();
        let mut shadowed: Vec<u32> = Vec::new();
        let mut current = object;
        while self.heap.is_js_object(current)? {
            for key in self.own_enumerable_keys(current)? {
                if !keys.contains(&key) && !shadowed.contains(&key) {
                    keys.push(key);
                }
            }
            for (name, _) in self.heap.own_properties(current)? {
                shadowed.push(name);
            }
            current = self.heap.prototype_of(current)?;
        }
        self.heap.fixed_array_from(&keys)
    }

    fn has_simple_keys(&self, object: u32) -> Result<bool> {
        let map = self.heap.map_of(object)?;
        if self.heap.is_dictionary_map(map)? || !self.heap.element_indices(object)?.is_empty() {
            return Ok(false);
        }
        let mut current = self.heap.prototype_of(object)?;
        while self.heap.is_js_object(current)? {
            if !self.heap.element_indices(current)?.is_empty() {
                return Ok(false);
            }
            let enumerable = self
                .heap
                .own_properties(current)?
                .iter()
                .any(|(_, attributes)| attributes & DONT_ENUM == 0);
            if enumerable {
                return Ok(false);
            }
            current = self.heap.prototype_of(current)?;
        }
        Ok(true)
    }

    // ── Dispatch ──

    fn call_runtime(&mut self, function: RuntimeFunction) -> Exec<()> {
        let arguments = self.pop_arguments(function.argument_count())?;
        let argument = |index: usize| arguments.get(index).copied().unwrap_or_default();
        let roots = self.heap.roots;
        let result = match function {
            RuntimeFunction::DeclareGlobals => {
                let is_eval = untag_smi(argument(2)) != 0;
                self.declare_globals(argument(0), is_eval)?;
                roots.undefined
            }
            RuntimeFunction::DeclareContextSlot => {
                let attributes = untag_smi(argument(2)) as u32;
                self.declare_context_slot(argument(0), argument(1), attributes, argument(3))?;
                roots.undefined
            }
            RuntimeFunction::NewContext => {
                let function = argument(0);
                let id = self.heap.function_id(function)?;
                let slots = self
                    .function_literal(id)
                    .map_or(CONTEXT_MIN_SLOTS, |literal| {
                        literal.scope.num_heap_slots.max(CONTEXT_MIN_SLOTS)
                    });
                let previous = self.heap.function_context(function)?;
                let context = self.new_child_context(slots, function, previous)?;
                self.heap.context_set(context, CONTEXT_FCONTEXT_INDEX, context)?;
                self.set_reg(Reg::CP, context);
                context
            }
            RuntimeFunction::PushContext => {
                let object = self.to_object(argument(0))?;
                self.push_with_context(object)?
            }
            RuntimeFunction::PushCatchContext => self.push_with_context(argument(0))?,
            RuntimeFunction::Throw | RuntimeFunction::ReThrow => {
                return Err(Trap::Throw(argument(0)));
            }
            RuntimeFunction::TraceEnter => {
                let function = self.current_function()?;
                let name = self.function_name(function)?;
                self.trace.push(format!("enter {name}"));
                roots.undefined
            }
            RuntimeFunction::TraceExit => {
                let function = self.current_function()?;
                let name = self.function_name(function)?;
                let value = self.describe(argument(0))?;
                self.trace.push(format!("exit {name} {value}"));
                argument(0)
            }
            RuntimeFunction::DebugBreak => {
                tracing::debug!(pc = format_args!("{:#x}", self.cpu.pc), "debugger statement");
                roots.undefined
            }
            RuntimeFunction::NewClosure => self.new_closure(argument(0), argument(1))?,
            RuntimeFunction::MaterializeRegExpLiteral => {
                let regexp = self.heap.new_regexp(argument(2), argument(3))?;
                self.store_literal(argument(0), argument(1), regexp)?;
                regexp
            }
            RuntimeFunction::CreateObjectLiteralBoilerplate => {
                let object = self.object_from_description(argument(2))?;
                self.store_literal(argument(0), argument(1), object)?;
                object
            }
            RuntimeFunction::CreateArrayLiteralBoilerplate => {
                let array = self.array_from_constants(argument(2))?;
                self.store_literal(argument(0), argument(1), array)?;
                array
            }
            RuntimeFunction::CloneLiteralBoilerplate => self.deep_copy(argument(0))?,
            RuntimeFunction::CloneShallowLiteralBoilerplate => {
                self.heap.copy_object(argument(0))?
            }
            RuntimeFunction::LoadContextSlot | RuntimeFunction::LoadContextSlotNoReferenceError => {
                let name = argument(1);
                let (value, receiver) = match self.resolve(argument(0), name)? {
                    Some(Binding::Slot { context, index, .. }) => {
                        (self.heap.context_get(context, index)?, roots.global_object)
                    }
                    Some(Binding::Property { holder, receiver }) => {
                        (self.get_property(holder, Key::Name(name))?, receiver)
                    }
                    None if function == RuntimeFunction::LoadContextSlot => {
                        let text = self.heap.string_value(name)?.unwrap_or_else(|| Rc::from(""));
                        return Err(self.throw_error(
                            ErrorKind::ReferenceError,
                            &format!("{text} is not defined"),
                        ));
                    }
                    None => (roots.undefined, roots.global_object),
                };
                let value = if value == roots.the_hole {
                    roots.undefined
                } else {
                    value
                };
                self.set_reg(Reg::R1, receiver);
                value
            }
            RuntimeFunction::StoreContextSlot => {
                let (value, name) = (argument(0), argument(2));
                match self.resolve(argument(1), name)? {
                    Some(Binding::Slot {
                        context,
                        index,
                        is_const,
                    }) => {
                        if !is_const {
                            self.heap.context_set(context, index, value)?;
                        }
                    }
                    Some(Binding::Property { holder, .. }) => {
                        self.set_property(holder, Key::Name(name), value)?;
                    }
                    None => self.set_property(roots.global_object, Key::Name(name), value)?,
                }
                value
            }
            RuntimeFunction::InitializeConstContextSlot => {
                let (value, name) = (argument(0), argument(2));
                match self.resolve(argument(1), name)? {
                    Some(Binding::Slot { context, index, .. }) => {
                        if self.heap.context_get(context, index)? == roots.the_hole {
                            self.heap.context_set(context, index, value)?;
                        }
                    }
                    Some(Binding::Property { holder, .. }) => {
                        self.set_property(holder, Key::Name(name), value)?;
                    }
                    None => self.set_property(roots.global_object, Key::Name(name), value)?,
                }
                value
            }
            RuntimeFunction::LookupContext => match self.resolve(argument(0), argument(1))? {
                Some(Binding::Property { holder, .. }) => holder,
                Some(Binding::Slot { .. }) => roots.the_hole,
                None => roots.global_object,
            },
            RuntimeFunction::ResolvePossiblyDirectEval => {
                self.resolve_possibly_direct_eval(argument(0), argument(1))?
            }
            RuntimeFunction::GetPropertyNamesFast => self.property_names(argument(0))?,
            RuntimeFunction::NumberToSmi => {
                let value = argument(0);
                match self.heap.number_value(value)? {
                    Some(number)
                        if number.fract() == 0.0
                            && number >= f64::from(SMI_MIN)
                            && number <= f64::from(SMI_MAX) =>
                    {
                        smi(number as i32) as u32
                    }
                    _ => value,
                }
            }
            RuntimeFunction::NumberAdd | RuntimeFunction::NumberSub => {
                let x = self.to_number(argument(0))?;
                let y = self.to_number(argument(1))?;
                let value = if function == RuntimeFunction::NumberAdd {
                    x + y
                } else {
                    x - y
                };
                self.heap.number(value)?
            }
            RuntimeFunction::Typeof => {
                let text = self.typeof_string(argument(0))?;
                self.heap.intern(text)?
            }
            RuntimeFunction::StackGuard => {
                self.stack_guard()?;
                roots.undefined
            }
            RuntimeFunction::CreateCatchExtensionObject => {
                let extension = self.heap.new_context_extension()?;
                let key = self.to_string_word(argument(0))?;
                self.heap.add_property(extension, key, argument(1), DONT_DELETE)?;
                extension
            }
            RuntimeFunction::ThrowReferenceError => {
                return Err(self.throw_error(
                    ErrorKind::ReferenceError,
                    "Invalid left-hand side in assignment",
                ));
            }
            RuntimeFunction::ThrowTypeError => {
                let message = self.to_string_value(argument(0))?;
                return Err(self.throw_error(ErrorKind::TypeError, &message));
            }
            RuntimeFunction::SetProperty => {
                let key = self.to_key(argument(1))?;
                self.set_property(argument(0), key, argument(2))?;
                argument(2)
            }
            RuntimeFunction::DefineAccessor => {
                let (object, is_setter, function) =
                    (argument(0), untag_smi(argument(2)) != 0, argument(3));
                let key = self.to_key(argument(1))?;
                let existing = self.get_own(object, key)?;
                let pair = match existing {
                    Some(current) if self.heap.is_accessor_pair(current)? => current,
                    _ => {
                        let pair = self.heap.new_accessor_pair()?;
                        match key {
                            Key::Index(index) => self.heap.set_element(object, index, pair)?,
                            Key::Name(name) => self.define_own(object, name, pair, 0)?,
                        }
                        pair
                    }
                };
                self.heap.set_accessor(pair, is_setter, function)?;
                object
            }
            RuntimeFunction::NewArguments => self.new_arguments(argument(0))?,
            RuntimeFunction::ToBool => {
                let value = self.to_boolean(argument(0))?;
                self.heap.boolean(value)
            }
        };
        self.set_reg(Reg::R0, result);
        Ok(())
    }

    /// `[function, receiver]` for a call that may be a direct `eval`.
    fn resolve_possibly_direct_eval(&mut self, function: u32, source: u32) -> Exec<u32> {
        let fp = self.reg(Reg::FP);
        let caller = self.current_function()?;
        let parameters = self.parameter_count(caller)?;
        let receiver = self.heap.read(fp + 2 * WORD + parameters as u32 * WORD)?;
        if function != self.eval_function {
            let undefined = self.heap.roots.undefined;
            return Ok(self.heap.fixed_array_from(&[function, undefined])?);
        }
        let Some(text) = self.heap.string_value(source)? else {
            return Ok(self.heap.fixed_array_from(&[function, receiver])?);
        };
        let program = self.parse_eval(&text)?;
        let context = self.reg(Reg::CP);
        tracing::debug!(length = text.len(), "direct eval");
        let closure = self.closure_for_program(&program, context)?;
        Ok(self.heap.fixed_array_from(&[closure, receiver])?)
    }
}
