//! Function entry and exit, nested calls from the runtime and the native
//! functions of the global object.
//!
//! A call with as many arguments as the callee has parameters enters the
//! callee directly. Otherwise an arguments adaptor frame sits between
//! caller and callee:
//!
//! ```text
//!   receiver, arg 0 .. arg (argc - 1)     pushed by the caller
//!   return address, smi argc              adaptor
//!   receiver, param 0 .. param (n - 1)    adapted copy seen by the callee
//! ```
//!
//! The callee returns to [`ADAPTOR_RETURN`], which drops the adaptor and the
//! caller's arguments. Construct calls use the same shape with the new
//! object pushed after the argument count.

use std::rc::Rc;

use super::builtins::Key;
use super::heap::{DONT_DELETE, DONT_ENUM, READ_ONLY};
use super::{
    ADAPTOR_RETURN, CONSTRUCT_RETURN, ErrorKind, Exec, Installed, MAX_CODE_OBJECTS,
    MAX_NESTED_CALLS, SharedFunction, SharedKind, Simulator, Trap, Value,
};
use crate::ast::{FunctionLiteral, ScopeKind};
use crate::layout::{POINTER_SIZE, RETURN_SENTINEL, smi, untag_smi};
use crate::machine::{Constant, Reg};
use crate::{Error, Result};

/// Functions implemented by the simulator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Native {
    Print,
    Eval,
    Object,
    Array,
    String,
    Number,
    Error(ErrorKind),
    ObjectToString,
    HasOwnProperty,
    ArrayPush,
    ArrayJoin,
    ErrorToString,
    FunctionCall,
}

impl Native {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Eval => "eval",
            Self::Object => "Object",
            Self::Array => "Array",
            Self::String => "String",
            Self::Number => "Number",
            Self::Error(kind) => kind.name(),
            Self::ObjectToString | Self::ErrorToString => "toString",
            Self::HasOwnProperty => "hasOwnProperty",
            Self::ArrayPush => "push",
            Self::ArrayJoin => "join",
            Self::FunctionCall => "call",
        }
    }
}

const WORD: u32 = POINTER_SIZE as u32;

impl Simulator {
    // ── Function table ──

    fn register_function(&mut self, kind: SharedKind) -> usize {
        self.functions.push(SharedFunction { kind, code: None });
        self.functions.len() - 1
    }

    /// Function table index of a literal; one entry per literal.
    pub(super) fn literal_id(&mut self, literal: &Rc<FunctionLiteral>) -> usize {
        let key = Rc::as_ptr(literal) as usize;
        if let Some(id) = self.function_ids.get(&key) {
            return *id;
        }
        let id = self.register_function(SharedKind::Script(Rc::clone(literal)));
        self.function_ids.insert(key, id);
        id
    }

    pub(super) fn function_literal(&self, id: usize) -> Option<Rc<FunctionLiteral>> {
        match self.functions.get(id).map(|entry| &entry.kind) {
            Some(SharedKind::Script(literal)) => Some(Rc::clone(literal)),
            _ => None,
        }
    }

    fn native_of(&self, id: usize) -> Option<Native> {
        match self.functions.get(id).map(|entry| &entry.kind) {
            Some(SharedKind::Native(native)) => Some(*native),
            _ => None,
        }
    }

    pub(super) fn function_name(&self, function: u32) -> Result<String> {
        let id = self.heap.function_id(function)?;
        Ok(match self.functions.get(id).map(|entry| &entry.kind) {
            Some(SharedKind::Script(literal)) => literal.name.clone(),
            Some(SharedKind::Native(native)) => native.name().to_string(),
            None => String::new(),
        })
    }

    fn new_native_function(&mut self, native: Native) -> Result<u32> {
        let id = self.register_function(SharedKind::Native(native));
        let shared = self.heap.new_shared(id)?;
        let context = self.heap.roots.global_context;
        self.heap.new_function(shared, context, 0)
    }

    // ── Compilation ──

    /// Compiles and installs the function's code on first use.
    fn ensure_compiled(&mut self, id: usize) -> Exec<usize> {
        if let Some(code) = self.functions.get(id).and_then(|entry| entry.code) {
            return Ok(code);
        }
        let literal = self
            .function_literal(id)
            .ok_or_else(|| Error::Internal(format!("function {id} has no literal")))?;
        let options = self
            .compile_options
            .clone()
            .with_eval(literal.scope.is_eval());
        let code = crate::compile(&literal, &options)?;
        if code.len() >= 1 << 16 || self.codes.len() >= MAX_CODE_OBJECTS {
            return Err(Error::Simulator(format!(
                "no code space left for {}",
                literal.name
            ))
            .into());
        }
        let constants = code
            .constants
            .iter()
            .map(|constant| self.materialize(constant))
            .collect::<Result<Vec<_>>>()?;
        let code_id = self.codes.len();
        tracing::debug!(
            function = %literal.name,
            code_id,
            instructions = code.len(),
            "installed code"
        );
        self.codes.push(Installed {
            code: Rc::new(code),
            constants,
        });
        if let Some(entry) = self.functions.get_mut(id) {
            entry.code = Some(code_id);
        }
        Ok(code_id)
    }

    /// The heap value of a constant pool entry.
    fn materialize(&mut self, constant: &Constant) -> Result<u32> {
        let roots = self.heap.roots;
        Ok(match constant {
            Constant::Smi(value) => smi(*value) as u32,
            Constant::Number(value) => self.heap.heap_number(*value)?,
            Constant::String(value) => self.heap.intern(value)?,
            Constant::Undefined => roots.undefined,
            Constant::Null => roots.null,
            Constant::True => roots.true_value,
            Constant::False => roots.false_value,
            Constant::TheHole => roots.the_hole,
            Constant::HeapNumberMap => roots.heap_number_map,
            Constant::MetaMap => roots.meta_map,
            Constant::Function(literal) => {
                let id = self.literal_id(literal);
                self.heap.new_shared(id)?
            }
            Constant::Array(items) => {
                let words = self.materialize_all(items)?;
                self.heap.fixed_array_from(&words)?
            }
            Constant::ObjectDescription(items) => {
                let words = self.materialize_all(items)?;
                self.heap.description_from(&words)?
            }
        })
    }

    fn materialize_all(&mut self, items: &[Constant]) -> Result<Vec<u32>> {
        items.iter().map(|item| self.materialize(item)).collect()
    }

    /// A closure of the boilerplate `shared` in `context`.
    pub(super) fn new_closure(&mut self, context: u32, shared: u32) -> Result<u32> {
        let id = self.heap.shared_id(shared)?;
        let literal = self.function_literal(id);
        let literal_count = literal
            .as_ref()
            .map_or(0, |literal| literal.materialized_literal_count);
        let function = self.heap.new_function(shared, context, literal_count)?;
        if literal.is_some() {
            let prototype = self.heap.new_object(self.heap.roots.object_prototype)?;
            self.define_own(prototype, self.names.constructor, function, DONT_ENUM)?;
            self.define_own(function, self.names.prototype, prototype, DONT_ENUM | DONT_DELETE)?;
        }
        Ok(function)
    }

    pub(super) fn closure_for_program(
        &mut self,
        program: &Rc<FunctionLiteral>,
        context: u32,
    ) -> Result<u32> {
        let id = self.literal_id(program);
        let shared = self.heap.new_shared(id)?;
        self.new_closure(context, shared)
    }

    // ── Entry and exit ──

    /// Enters `function` with the receiver and `argc` arguments on the stack.
    /// The function returns to `return_address` with the receiver and the
    /// arguments popped.
    pub(super) fn invoke(&mut self, function: u32, argc: usize, return_address: u32) -> Exec<()> {
        if !self.heap.is_function(function)? {
            let text = self.describe_briefly(function)?;
            return Err(self.throw_error(ErrorKind::TypeError, &format!("{text} is not a function")));
        }
        let receiver = self.peek(argc)?;
        if self.heap.is_undefined_or_null(receiver) {
            self.poke(argc, self.heap.roots.global_object)?;
        }
        let id = self.heap.function_id(function)?;
        if let Some(native) = self.native_of(id) {
            let receiver = self.peek(argc)?;
            let arguments = self.pop_arguments(argc)?;
            self.drop_words(1);
            let result = self.call_native(native, receiver, &arguments, false)?;
            self.set_reg(Reg::R0, result);
            self.cpu.pc = return_address;
            return Ok(());
        }

        let code = self.ensure_compiled(id)?;
        let parameters = self
            .function_literal(id)
            .map_or(0, |literal| literal.scope.num_parameters);
        let mut link = return_address;
        if argc != parameters {
            self.push_adapted_arguments(argc, parameters, return_address, None)?;
            link = ADAPTOR_RETURN;
        }
        self.enter_code(function, code, link)
    }

    fn enter_code(&mut self, function: u32, code: usize, link: u32) -> Exec<()> {
        let context = self.heap.function_context(function)?;
        self.set_reg(Reg::LR, link);
        self.set_reg(Reg::R1, function);
        self.set_reg(Reg::CP, context);
        self.cpu.pc = Self::code_address(code, 0);
        Ok(())
    }

    /// Pushes the adaptor header and a copy of the receiver and the first
    /// `parameters` arguments, padded with undefined.
    fn push_adapted_arguments(
        &mut self,
        argc: usize,
        parameters: usize,
        return_address: u32,
        new_object: Option<u32>,
    ) -> Exec<()> {
        let receiver = self.peek(argc)?;
        let arguments = (0..argc)
            .map(|index| self.peek(argc - 1 - index))
            .collect::<Exec<Vec<_>>>()?;
        self.push(return_address)?;
        self.push(smi(argc as i32) as u32)?;
        if let Some(object) = new_object {
            self.push(object)?;
        }
        self.push(receiver)?;
        let undefined = self.heap.roots.undefined;
        for index in 0..parameters {
            self.push(arguments.get(index).copied().unwrap_or(undefined))?;
        }
        Ok(())
    }

    pub(super) fn leave_adaptor_frame(&mut self) -> Exec<()> {
        let argc = untag_smi(self.pop()?) as usize;
        let return_address = self.pop()?;
        self.drop_words(argc + 1);
        self.cpu.pc = return_address;
        Ok(())
    }

    /// `new function(args)` with the receiver and `argc` arguments on the
    /// stack.
    pub(super) fn construct(&mut self, function: u32, argc: usize, return_address: u32) -> Exec<()> {
        if !self.heap.is_function(function)? {
            let text = self.describe_briefly(function)?;
            return Err(self.throw_error(ErrorKind::TypeError, &format!("{text} is not a constructor")));
        }
        let id = self.heap.function_id(function)?;
        if let Some(native) = self.native_of(id) {
            let arguments = self.pop_arguments(argc)?;
            self.drop_words(1);
            let undefined = self.heap.roots.undefined;
            let result = self.call_native(native, undefined, &arguments, true)?;
            self.set_reg(Reg::R0, result);
            self.cpu.pc = return_address;
            return Ok(());
        }

        let prototype = self.get_property(function, Key::Name(self.names.prototype))?;
        let prototype = if self.heap.is_js_object(prototype)? {
            prototype
        } else {
            self.heap.roots.object_prototype
        };
        let object = self.heap.new_object(prototype)?;
        self.poke(argc, object)?;

        let code = self.ensure_compiled(id)?;
        let parameters = self
            .function_literal(id)
            .map_or(0, |literal| literal.scope.num_parameters);
        self.push_adapted_arguments(argc, parameters, return_address, Some(object))?;
        self.enter_code(function, code, CONSTRUCT_RETURN)
    }

    /// The constructor's result if it is an object, the new object otherwise.
    pub(super) fn leave_construct_frame(&mut self) -> Exec<()> {
        let object = self.pop()?;
        let argc = untag_smi(self.pop()?) as usize;
        let return_address = self.pop()?;
        self.drop_words(argc + 1);
        if !self.heap.is_js_object(self.reg(Reg::R0))? {
            self.set_reg(Reg::R0, object);
        }
        self.cpu.pc = return_address;
        Ok(())
    }

    /// Address of the argument area seen by the frame at `fp`: the last
    /// actual argument and the actual count.
    pub(super) fn actual_arguments(&self, fp: u32, parameters: usize) -> Exec<(u32, usize)> {
        let return_address = self.heap.read(fp + WORD)?;
        let header = fp + 2 * WORD + (parameters as u32 + 1) * WORD;
        Ok(match return_address {
            ADAPTOR_RETURN => {
                let argc = untag_smi(self.heap.read(header)?) as usize;
                (header + 2 * WORD, argc)
            }
            CONSTRUCT_RETURN => {
                let argc = untag_smi(self.heap.read(header + WORD)?) as usize;
                (header + 3 * WORD, argc)
            }
            _ => (fp + 2 * WORD, parameters),
        })
    }

    /// Calls a function from the runtime and runs it to completion.
    pub(super) fn call_js(&mut self, function: u32, receiver: u32, arguments: &[u32]) -> Exec<u32> {
        if self.nesting >= MAX_NESTED_CALLS {
            return Err(self.throw_error(ErrorKind::RangeError, "Maximum call stack size exceeded"));
        }
        let saved = self.cpu.clone();
        let floor = self.heap.memory().handler();
        self.nesting += 1;
        let result = self.run_call(function, receiver, arguments, floor);
        self.nesting -= 1;
        let value = self.reg(Reg::R0);
        self.cpu = saved;
        if result.is_err() {
            self.heap.memory_mut().set_handler(floor);
        }
        result.map(|()| value)
    }

    fn run_call(&mut self, function: u32, receiver: u32, arguments: &[u32], floor: u32) -> Exec<()> {
        self.push(receiver)?;
        for argument in arguments {
            self.push(*argument)?;
        }
        self.invoke(function, arguments.len(), RETURN_SENTINEL)?;
        self.execute(floor)
    }

    pub(super) fn run_program(&mut self, program: &Rc<FunctionLiteral>) -> Exec<u32> {
        tracing::info!(
            program = %program.name,
            source = %self.compile_options.source_name,
            "run program"
        );
        let context = self.heap.roots.global_context;
        let closure = self.closure_for_program(program, context)?;
        let global = self.heap.roots.global_object;
        self.call_js(closure, global, &[])
    }

    pub(super) fn call_global(&mut self, name: &str, arguments: &[Value]) -> Exec<u32> {
        let function = self.read_global(name)?;
        if !self.heap.is_function(function)? {
            return Err(Error::Simulator(format!("global {name} is not a function")).into());
        }
        let words = arguments
            .iter()
            .map(|argument| self.import(argument))
            .collect::<Result<Vec<_>>>()?;
        let global = self.heap.roots.global_object;
        self.call_js(function, global, &words)
    }

    pub(super) fn read_global(&mut self, name: &str) -> Exec<u32> {
        let name = self.heap.intern(name)?;
        let global = self.heap.roots.global_object;
        self.get_property(global, Key::Name(name))
    }

    fn import(&mut self, value: &Value) -> Result<u32> {
        let roots = self.heap.roots;
        match value {
            Value::Undefined => Ok(roots.undefined),
            Value::Null => Ok(roots.null),
            Value::Bool(value) => Ok(self.heap.boolean(*value)),
            Value::Number(value) => self.heap.number(*value),
            Value::String(value) => self.heap.intern(value),
            Value::Object(_) | Value::Function(_) => Err(Error::Simulator(
                "objects cannot be passed into the simulator".to_string(),
            )),
        }
    }

    // ── Globals ──

    /// Sets or adds an own data property without running setters.
    pub(super) fn define_own(
        &mut self,
        object: u32,
        name: u32,
        value: u32,
        attributes: u32,
    ) -> Result<()> {
        match self.heap.find_own(object, name)? {
            Some((index, _)) => self.heap.set_own_value(object, index, value),
            None => self.heap.add_property(object, name, value, attributes),
        }
    }

    fn define_named(&mut self, object: u32, name: &str, value: u32, attributes: u32) -> Result<()> {
        let name = self.heap.intern(name)?;
        self.define_own(object, name, value, attributes)
    }

    fn define_method(&mut self, object: u32, name: &str, native: Native) -> Result<u32> {
        let function = self.new_native_function(native)?;
        self.define_named(object, name, function, DONT_ENUM)?;
        Ok(function)
    }

    fn define_constructor(&mut self, name: &str, native: Native, prototype: u32) -> Result<u32> {
        let global = self.heap.roots.global_object;
        let constructor = self.define_method(global, name, native)?;
        let fixed = DONT_ENUM | DONT_DELETE | READ_ONLY;
        self.define_own(constructor, self.names.prototype, prototype, fixed)?;
        self.define_own(prototype, self.names.constructor, constructor, DONT_ENUM)?;
        Ok(constructor)
    }

    pub(super) fn install_globals(&mut self) -> Result<()> {
        self.names = super::builtins::Names::new(&mut self.heap)?;
        let roots = self.heap.roots;
        let global = roots.global_object;

        self.define_method(global, "print", Native::Print)?;
        self.eval_function = self.define_method(global, "eval", Native::Eval)?;

        self.define_constructor("Object", Native::Object, roots.object_prototype)?;
        self.define_constructor("Array", Native::Array, roots.array_prototype)?;
        for (name, native) in [("String", Native::String), ("Number", Native::Number)] {
            let prototype = self.heap.new_object(roots.object_prototype)?;
            self.define_constructor(name, native, prototype)?;
        }

        self.define_method(roots.object_prototype, "toString", Native::ObjectToString)?;
        self.define_method(roots.object_prototype, "hasOwnProperty", Native::HasOwnProperty)?;
        self.define_method(roots.array_prototype, "push", Native::ArrayPush)?;
        self.define_method(roots.array_prototype, "join", Native::ArrayJoin)?;
        self.define_method(roots.array_prototype, "toString", Native::ArrayJoin)?;
        self.define_method(roots.function_prototype, "call", Native::FunctionCall)?;

        self.error_prototypes.clear();
        for kind in ErrorKind::ALL {
            let parent = self
                .error_prototypes
                .first()
                .copied()
                .unwrap_or(roots.object_prototype);
            let prototype = self.heap.new_object(parent)?;
            let name = self.heap.intern(kind.name())?;
            self.define_own(prototype, self.names.name, name, DONT_ENUM)?;
            let empty = self.heap.intern("")?;
            self.define_own(prototype, self.names.message, empty, DONT_ENUM)?;
            if kind == ErrorKind::Error {
                self.define_method(prototype, "toString", Native::ErrorToString)?;
            }
            self.define_constructor(kind.name(), Native::Error(kind), prototype)?;
            self.error_prototypes.push(prototype);
        }

        let fixed = DONT_ENUM | DONT_DELETE | READ_ONLY;
        self.define_named(global, "undefined", roots.undefined, fixed)?;
        let nan = self.heap.heap_number(f64::NAN)?;
        self.define_named(global, "NaN", nan, fixed)?;
        let infinity = self.heap.heap_number(f64::INFINITY)?;
        self.define_named(global, "Infinity", infinity, fixed)?;
        Ok(())
    }

    // ── Natives ──

    fn call_native(
        &mut self,
        native: Native,
        receiver: u32,
        arguments: &[u32],
        construct: bool,
    ) -> Exec<u32> {
        let roots = self.heap.roots;
        let argument = |index: usize| arguments.get(index).copied().unwrap_or(roots.undefined);
        tracing::trace!(native = native.name(), argc = arguments.len(), "native call");
        match native {
            Native::Print => {
                let mut parts = Vec::with_capacity(arguments.len());
                for value in arguments {
                    parts.push(self.to_string_value(*value)?.to_string());
                }
                let line = parts.join(" ");
                tracing::debug!(target: "jitgen::print", "{line}");
                self.output.push(line);
                Ok(roots.undefined)
            }
            Native::Eval => self.indirect_eval(argument(0)),
            Native::Object => {
                let value = argument(0);
                if self.heap.is_undefined_or_null(value) {
                    Ok(self.heap.new_object(roots.object_prototype)?)
                } else {
                    self.to_object(value)
                }
            }
            Native::Array => {
                if let [length] = arguments {
                    if let Some(value) = self.heap.number_value(*length)? {
                        return self.array_of_length(value);
                    }
                }
                Ok(self.heap.new_array(arguments)?)
            }
            Native::String => {
                let string = if arguments.is_empty() {
                    self.heap.intern("")?
                } else {
                    self.to_string_word(argument(0))?
                };
                if construct {
                    Ok(self.heap.new_value_object(string)?)
                } else {
                    Ok(string)
                }
            }
            Native::Number => {
                let value = if arguments.is_empty() {
                    0.0
                } else {
                    self.to_number(argument(0))?
                };
                let number = self.heap.number(value)?;
                if construct {
                    Ok(self.heap.new_value_object(number)?)
                } else {
                    Ok(number)
                }
            }
            Native::Error(kind) => {
                let message = argument(0);
                let message = if message == roots.undefined {
                    None
                } else {
                    Some(self.to_string_word(message)?)
                };
                Ok(self.new_error(kind, message)?)
            }
            Native::ObjectToString => {
                let class = self.class_name(receiver)?;
                Ok(self.heap.intern(&format!("[object {class}]"))?)
            }
            Native::HasOwnProperty => {
                let object = self.to_object(receiver)?;
                let key = self.to_key(argument(0))?;
                let found = self.get_own(object, key)?.is_some();
                Ok(self.heap.boolean(found))
            }
            Native::ArrayPush => {
                if !self.heap.is_array(receiver)? {
                    return Err(self.throw_error(ErrorKind::TypeError, "push called on non-array"));
                }
                for value in arguments {
                    let length = self.heap.array_length(receiver)?;
                    self.set_property(receiver, Key::Index(length), *value)?;
                }
                let length = self.heap.array_length(receiver)?;
                Ok(self.heap.number(f64::from(length))?)
            }
            Native::ArrayJoin => self.join(receiver, argument(0)),
            Native::ErrorToString => {
                let name = self.get_property(receiver, Key::Name(self.names.name))?;
                let name = if name == roots.undefined {
                    Rc::from("Error")
                } else {
                    self.to_string_value(name)?
                };
                let message = self.get_property(receiver, Key::Name(self.names.message))?;
                let message = if message == roots.undefined {
                    Rc::from("")
                } else {
                    self.to_string_value(message)?
                };
                let text = if message.is_empty() {
                    name.to_string()
                } else if name.is_empty() {
                    message.to_string()
                } else {
                    format!("{name}: {message}")
                };
                Ok(self.heap.intern(&text)?)
            }
            Native::FunctionCall => {
                if !self.heap.is_function(receiver)? {
                    return Err(self.throw_error(ErrorKind::TypeError, "call on a non-function"));
                }
                let rest = arguments.get(1..).unwrap_or_default();
                self.call_js(receiver, argument(0), rest)
            }
        }
    }

    fn array_of_length(&mut self, value: f64) -> Exec<u32> {
        let length = value as u32;
        if f64::from(length) != value {
            return Err(self.throw_error(ErrorKind::RangeError, "Invalid array length"));
        }
        let array = self.heap.new_array(&[])?;
        self.heap.set_array_length(array, length)?;
        Ok(array)
    }

    fn join(&mut self, receiver: u32, separator: u32) -> Exec<u32> {
        let separator = if separator == self.heap.roots.undefined {
            Rc::from(",")
        } else {
            self.to_string_value(separator)?
        };
        let length = if self.heap.is_array(receiver)? {
            self.heap.array_length(receiver)?
        } else {
            0
        };
        let mut parts = Vec::with_capacity(length as usize);
        for index in 0..length {
            let value = self.get_property(receiver, Key::Index(index))?;
            if self.heap.is_undefined_or_null(value) {
                parts.push(String::new());
            } else {
                parts.push(self.to_string_value(value)?.to_string());
            }
        }
        Ok(self.heap.intern(&parts.join(&*separator))?)
    }

    /// An error object of the given kind.
    pub(super) fn new_error(&mut self, kind: ErrorKind, message: Option<u32>) -> Result<u32> {
        let index = ErrorKind::ALL
            .iter()
            .position(|candidate| *candidate == kind)
            .unwrap_or(0);
        let prototype = self
            .error_prototypes
            .get(index)
            .copied()
            .unwrap_or(self.heap.roots.object_prototype);
        let error = self.heap.new_object(prototype)?;
        if let Some(message) = message {
            self.define_own(error, self.names.message, message, DONT_ENUM)?;
        }
        Ok(error)
    }

    /// A trap throwing a new error object.
    pub(super) fn throw_error(&mut self, kind: ErrorKind, message: &str) -> Trap {
        tracing::debug!(kind = kind.name(), message, "throw");
        let error = self
            .heap
            .intern(message)
            .and_then(|message| self.new_error(kind, Some(message)));
        match error {
            Ok(error) => Trap::Throw(error),
            Err(fault) => Trap::Fault(fault),
        }
    }

    fn indirect_eval(&mut self, source: u32) -> Exec<u32> {
        let Some(text) = self.heap.string_value(source)? else {
            return Ok(source);
        };
        let program = self.parse_eval(&text)?;
        let context = self.heap.roots.global_context;
        let closure = self.closure_for_program(&program, context)?;
        let global = self.heap.roots.global_object;
        self.call_js(closure, global, &[])
    }

    #[cfg(feature = "frontend")]
    pub(super) fn parse_eval(&mut self, source: &str) -> Exec<Rc<FunctionLiteral>> {
        match crate::frontend::parse_program(source, ScopeKind::Eval) {
            Ok(program) => Ok(Rc::new(program)),
            Err(error @ (Error::Parse { .. } | Error::Resolve(_))) => {
                Err(self.throw_error(ErrorKind::SyntaxError, &error.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    #[cfg(not(feature = "frontend"))]
    pub(super) fn parse_eval(&mut self, _source: &str) -> Exec<Rc<FunctionLiteral>> {
        let _ = ScopeKind::Eval;
        Err(self.throw_error(ErrorKind::EvalError, "eval needs the frontend"))
    }
}
