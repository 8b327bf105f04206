//! Language semantics behind the builtins, code stubs and inline caches:
//! conversions, property access and the operators.

use std::cmp::Ordering;
use std::rc::Rc;

use super::convert::{number_to_string, string_to_number, to_int32, to_uint32};
use super::heap::{DONT_DELETE, DONT_ENUM, Heap, MAX_FAST_ELEMENT, READ_ONLY};
use super::{ErrorKind, Exec, Simulator, Value};
use crate::ast::{BinaryOp, as_array_index};
use crate::layout::{smi, untag_smi};
use crate::machine::Reg;
use crate::runtime::{Builtin, CodeStub, IcKind};
use crate::{Error, Result};

/// Interned names the simulator looks up itself.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Names {
    pub prototype: u32,
    pub constructor: u32,
    pub name: u32,
    pub message: u32,
    pub length: u32,
    pub value_of: u32,
    pub to_string: u32,
}

impl Names {
    pub(super) fn new(heap: &mut Heap) -> Result<Self> {
        Ok(Self {
            prototype: heap.intern("prototype")?,
            constructor: heap.intern("constructor")?,
            name: heap.intern("name")?,
            message: heap.intern("message")?,
            length: heap.intern("length")?,
            value_of: heap.intern("valueOf")?,
            to_string: heap.intern("toString")?,
        })
    }
}

/// A property key: an element index or an interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Key {
    Index(u32),
    Name(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hint {
    Number,
    String,
}

/// Nesting bound for describing arrays that contain themselves.
const MAX_DESCRIBE_DEPTH: usize = 8;

impl Simulator {
    // ── Conversions ──

    pub(super) fn to_key(&mut self, word: u32) -> Exec<Key> {
        if let Some(value) = self.heap.number_value(word)? {
            let index = value as u32;
            if f64::from(index) == value && index < MAX_FAST_ELEMENT {
                return Ok(Key::Index(index));
            }
        }
        let text = self.to_string_value(word)?;
        match as_array_index(&text) {
            Some(index) if index < MAX_FAST_ELEMENT => Ok(Key::Index(index)),
            _ => Ok(Key::Name(self.heap.intern(&text)?)),
        }
    }

    fn key_text(&self, key: Key) -> Result<String> {
        match key {
            Key::Index(index) => Ok(index.to_string()),
            Key::Name(name) => Ok(self
                .heap
                .string_value(name)?
                .map(|text| text.to_string())
                .unwrap_or_default()),
        }
    }

    pub(super) fn to_boolean(&self, word: u32) -> Result<bool> {
        let roots = self.heap.roots;
        if Heap::is_smi(word) {
            return Ok(untag_smi(word) != 0);
        }
        if word == roots.true_value {
            return Ok(true);
        }
        if [roots.false_value, roots.undefined, roots.null, roots.the_hole].contains(&word) {
            return Ok(false);
        }
        if let Some(value) = self.heap.number_value(word)? {
            return Ok(value != 0.0 && !value.is_nan());
        }
        if let Some(text) = self.heap.string_value(word)? {
            return Ok(!text.is_empty());
        }
        Ok(true)
    }

    pub(super) fn to_number(&mut self, word: u32) -> Exec<f64> {
        if let Some(value) = self.heap.number_value(word)? {
            return Ok(value);
        }
        let roots = self.heap.roots;
        if word == roots.undefined || word == roots.the_hole {
            return Ok(f64::NAN);
        }
        if word == roots.null || word == roots.false_value {
            return Ok(0.0);
        }
        if word == roots.true_value {
            return Ok(1.0);
        }
        if let Some(text) = self.heap.string_value(word)? {
            return Ok(string_to_number(&text));
        }
        let primitive = self.to_primitive(word, Hint::Number)?;
        self.to_number(primitive)
    }

    fn to_primitive(&mut self, word: u32, hint: Hint) -> Exec<u32> {
        if !self.heap.is_js_object(word)? {
            return Ok(word);
        }
        let order = match hint {
            Hint::Number => [self.names.value_of, self.names.to_string],
            Hint::String => [self.names.to_string, self.names.value_of],
        };
        for name in order {
            let method = self.get_property(word, Key::Name(name))?;
            if self.heap.is_function(method)? {
                let result = self.call_js(method, word, &[])?;
                if !self.heap.is_js_object(result)? {
                    return Ok(result);
                }
            }
        }
        Err(self.throw_error(ErrorKind::TypeError, "Cannot convert object to primitive value"))
    }

    pub(super) fn to_string_value(&mut self, word: u32) -> Exec<Rc<str>> {
        if let Some(text) = self.heap.string_value(word)? {
            return Ok(text);
        }
        if let Some(value) = self.heap.number_value(word)? {
            return Ok(Rc::from(number_to_string(value)));
        }
        let roots = self.heap.roots;
        let text = if word == roots.undefined || word == roots.the_hole {
            "undefined"
        } else if word == roots.null {
            "null"
        } else if word == roots.true_value {
            "true"
        } else if word == roots.false_value {
            "false"
        } else {
            let primitive = self.to_primitive(word, Hint::String)?;
            return self.to_string_value(primitive);
        };
        Ok(Rc::from(text))
    }

    pub(super) fn to_string_word(&mut self, word: u32) -> Exec<u32> {
        if self.heap.is_string(word)? {
            return Ok(word);
        }
        let text = self.to_string_value(word)?;
        Ok(self.heap.intern(&text)?)
    }

    pub(super) fn to_object(&mut self, word: u32) -> Exec<u32> {
        if self.heap.is_js_object(word)? {
            return Ok(word);
        }
        if self.heap.is_undefined_or_null(word) || word == self.heap.roots.the_hole {
            let text = self.describe_briefly(word)?;
            return Err(self.throw_error(
                ErrorKind::TypeError,
                &format!("Cannot convert {text} to object"),
            ));
        }
        Ok(self.heap.new_value_object(word)?)
    }

    pub(super) fn typeof_string(&self, word: u32) -> Result<&'static str> {
        let roots = self.heap.roots;
        Ok(if self.heap.is_number(word)? {
            "number"
        } else if self.heap.is_string(word)? {
            "string"
        } else if word == roots.undefined || word == roots.the_hole {
            "undefined"
        } else if word == roots.true_value || word == roots.false_value {
            "boolean"
        } else if self.heap.is_function(word)? {
            "function"
        } else {
            "object"
        })
    }

    pub(super) fn class_name(&self, word: u32) -> Result<&'static str> {
        let roots = self.heap.roots;
        Ok(if word == roots.undefined {
            "Undefined"
        } else if word == roots.null {
            "Null"
        } else if self.heap.is_array(word)? {
            "Array"
        } else if self.heap.is_function(word)? {
            "Function"
        } else if self.heap.is_number(word)? {
            "Number"
        } else if self.heap.is_string(word)? {
            "String"
        } else if word == roots.true_value || word == roots.false_value {
            "Boolean"
        } else {
            "Object"
        })
    }

    // ── Properties ──

    /// Own property value or accessor pair, without running anything.
    pub(super) fn get_own(&self, object: u32, key: Key) -> Result<Option<u32>> {
        match key {
            Key::Index(index) => self.heap.element(object, index),
            Key::Name(name) => match self.heap.find_own(object, name)? {
                Some((index, _)) => self.heap.own_value(object, index).map(Some),
                None => Ok(None),
            },
        }
    }

    /// The first object on the prototype chain holding `key`, and its value.
    fn lookup(&self, object: u32, key: Key) -> Result<Option<(u32, u32)>> {
        let mut current = object;
        while self.heap.is_js_object(current)? {
            if let Some(value) = self.get_own(current, key)? {
                return Ok(Some((current, value)));
            }
            current = self.heap.prototype_of(current)?;
        }
        Ok(None)
    }

    pub(super) fn has_property(&self, object: u32, key: Key) -> Result<bool> {
        if key == Key::Name(self.names.length) && self.heap.is_array(object)? {
            return Ok(true);
        }
        Ok(self.lookup(object, key)?.is_some())
    }

    pub(super) fn get_property(&mut self, receiver: u32, key: Key) -> Exec<u32> {
        let roots = self.heap.roots;
        if self.heap.is_undefined_or_null(receiver) || receiver == roots.the_hole {
            let text = self.key_text(key)?;
            let base = self.describe_briefly(receiver)?;
            return Err(self.throw_error(
                ErrorKind::TypeError,
                &format!("Cannot read property '{text}' of {base}"),
            ));
        }
        let mut holder = receiver;
        if !self.heap.is_js_object(receiver)? {
            if let Some(text) = self.heap.string_value(receiver)? {
                match key {
                    Key::Name(name) if name == self.names.length => {
                        return Ok(smi(text.chars().count() as i32) as u32);
                    }
                    Key::Index(index) => {
                        if let Some(ch) = text.chars().nth(index as usize) {
                            return Ok(self.heap.intern(ch.encode_utf8(&mut [0; 4]))?);
                        }
                        return Ok(roots.undefined);
                    }
                    Key::Name(_) => {}
                }
            }
            holder = roots.object_prototype;
        } else if key == Key::Name(self.names.length) && self.heap.is_array(receiver)? {
            let length = self.heap.array_length(receiver)?;
            return Ok(self.heap.number(f64::from(length))?);
        }

        let Some((_, value)) = self.lookup(holder, key)? else {
            return Ok(roots.undefined);
        };
        if value == roots.the_hole {
            return Ok(roots.undefined);
        }
        if self.heap.is_accessor_pair(value)? {
            let getter = self.heap.accessor(value, false)?;
            if self.heap.is_function(getter)? {
                return self.call_js(getter, receiver, &[]);
            }
            return Ok(roots.undefined);
        }
        Ok(value)
    }

    /// `receiver[key] = value`. Read-only properties keep their value unless
    /// they still hold the hole of an uninitialized constant.
    pub(super) fn set_property(&mut self, receiver: u32, key: Key, value: u32) -> Exec<()> {
        let roots = self.heap.roots;
        if self.heap.is_undefined_or_null(receiver) {
            let text = self.key_text(key)?;
            let base = self.describe_briefly(receiver)?;
            return Err(self.throw_error(
                ErrorKind::TypeError,
                &format!("Cannot set property '{text}' of {base}"),
            ));
        }
        if !self.heap.is_js_object(receiver)? {
            return Ok(());
        }
        if key == Key::Name(self.names.length) && self.heap.is_array(receiver)? {
            let requested = self.to_number(value)?;
            let length = to_uint32(requested);
            if f64::from(length) != requested {
                return Err(self.throw_error(ErrorKind::RangeError, "Invalid array length"));
            }
            return Ok(self.heap.set_array_length(receiver, length)?);
        }

        match key {
            Key::Index(index) => {
                if let Some(current) = self.heap.element(receiver, index)? {
                    if self.heap.is_accessor_pair(current)? {
                        return self.call_setter(current, receiver, value);
                    }
                }
            }
            Key::Name(name) => {
                if let Some((index, attributes)) = self.heap.find_own(receiver, name)? {
                    let current = self.heap.own_value(receiver, index)?;
                    if self.heap.is_accessor_pair(current)? {
                        return self.call_setter(current, receiver, value);
                    }
                    if attributes & READ_ONLY == 0 || current == roots.the_hole {
                        self.heap.set_own_value(receiver, index, value)?;
                    }
                    return Ok(());
                }
            }
        }
        // Setters on the prototype chain intercept new properties.
        let prototype = self.heap.prototype_of(receiver)?;
        if let Some((_, inherited)) = self.lookup(prototype, key)? {
            if self.heap.is_accessor_pair(inherited)? {
                return self.call_setter(inherited, receiver, value);
            }
        }
        match key {
            Key::Index(index) => self.heap.set_element(receiver, index, value)?,
            Key::Name(name) => self.heap.add_property(receiver, name, value, 0)?,
        }
        Ok(())
    }

    fn call_setter(&mut self, pair: u32, receiver: u32, value: u32) -> Exec<()> {
        let setter = self.heap.accessor(pair, true)?;
        if self.heap.is_function(setter)? {
            self.call_js(setter, receiver, &[value])?;
        }
        Ok(())
    }

    pub(super) fn delete_property(&mut self, object: u32, key: Key) -> Result<bool> {
        if !self.heap.is_js_object(object)? {
            return Ok(true);
        }
        match key {
            Key::Name(name) if name == self.names.length && self.heap.is_array(object)? => Ok(false),
            Key::Index(index) => {
                self.heap.delete_element(object, index)?;
                Ok(true)
            }
            Key::Name(name) => match self.heap.find_own(object, name)? {
                Some((_, attributes)) if attributes & DONT_DELETE != 0 => Ok(false),
                Some((index, _)) => {
                    self.heap.delete_own(object, index)?;
                    Ok(true)
                }
                None => Ok(true),
            },
        }
    }

    /// Enumerable own keys as strings: element indices first, then names in
    /// insertion order.
    pub(super) fn own_enumerable_keys(&mut self, object: u32) -> Result<Vec<u32>> {
        let mut keys = Vec::new();
        for index in self.heap.element_indices(object)? {
            keys.push(self.heap.intern(&index.to_string())?);
        }
        for (name, attributes) in self.heap.own_properties(object)? {
            if attributes & DONT_ENUM == 0 {
                keys.push(name);
            }
        }
        Ok(keys)
    }

    // ── Operators ──

    fn normalize_hole(&self, word: u32) -> u32 {
        if word == self.heap.roots.the_hole {
            self.heap.roots.undefined
        } else {
            word
        }
    }

    pub(super) fn strict_equals(&self, x: u32, y: u32) -> Result<bool> {
        let (x, y) = (self.normalize_hole(x), self.normalize_hole(y));
        if let (Some(a), Some(b)) = (self.heap.number_value(x)?, self.heap.number_value(y)?) {
            return Ok(a == b);
        }
        Ok(x == y)
    }

    pub(super) fn loose_equals(&mut self, x: u32, y: u32) -> Exec<bool> {
        let roots = self.heap.roots;
        let (x, y) = (self.normalize_hole(x), self.normalize_hole(y));
        let (x_number, y_number) = (self.heap.is_number(x)?, self.heap.is_number(y)?);
        if x_number && y_number {
            return Ok(self.strict_equals(x, y)?);
        }
        if x == y {
            return Ok(true);
        }
        let (x_absent, y_absent) = (
            self.heap.is_undefined_or_null(x),
            self.heap.is_undefined_or_null(y),
        );
        if x_absent || y_absent {
            return Ok(x_absent && y_absent);
        }
        let is_bool = |word: u32| word == roots.true_value || word == roots.false_value;
        if is_bool(x) {
            let value = self.to_number(x)?;
            let x = self.heap.number(value)?;
            return self.loose_equals(x, y);
        }
        if is_bool(y) {
            let value = self.to_number(y)?;
            let y = self.heap.number(value)?;
            return self.loose_equals(x, y);
        }
        let (x_string, y_string) = (self.heap.is_string(x)?, self.heap.is_string(y)?);
        if (x_number && y_string) || (x_string && y_number) {
            return Ok(self.to_number(x)? == self.to_number(y)?);
        }
        let (x_object, y_object) = (self.heap.is_js_object(x)?, self.heap.is_js_object(y)?);
        if x_object && (y_number || y_string) {
            let x = self.to_primitive(x, Hint::Number)?;
            return self.loose_equals(x, y);
        }
        if y_object && (x_number || x_string) {
            let y = self.to_primitive(y, Hint::Number)?;
            return self.loose_equals(x, y);
        }
        Ok(false)
    }

    /// Relational comparison; `None` when either side is NaN.
    pub(super) fn compare(&mut self, x: u32, y: u32) -> Exec<Option<Ordering>> {
        let x = self.to_primitive(x, Hint::Number)?;
        let y = self.to_primitive(y, Hint::Number)?;
        if let (Some(a), Some(b)) = (self.heap.string_value(x)?, self.heap.string_value(y)?) {
            return Ok(Some(a.cmp(&b)));
        }
        let a = self.to_number(x)?;
        let b = self.to_number(y)?;
        Ok(a.partial_cmp(&b))
    }

    /// `left op right` with full conversions.
    pub(super) fn binary_op(&mut self, op: BinaryOp, left: u32, right: u32) -> Exec<u32> {
        let value = match op {
            BinaryOp::Add => {
                let left = self.to_primitive(left, Hint::Number)?;
                let right = self.to_primitive(right, Hint::Number)?;
                if self.heap.is_string(left)? || self.heap.is_string(right)? {
                    let mut text = self.to_string_value(left)?.to_string();
                    text.push_str(&self.to_string_value(right)?);
                    return Ok(self.heap.intern(&text)?);
                }
                self.to_number(left)? + self.to_number(right)?
            }
            BinaryOp::Sub => self.to_number(left)? - self.to_number(right)?,
            BinaryOp::Mul => self.to_number(left)? * self.to_number(right)?,
            BinaryOp::Div => self.to_number(left)? / self.to_number(right)?,
            BinaryOp::Mod => self.to_number(left)? % self.to_number(right)?,
            BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::BitAnd | BinaryOp::Shl | BinaryOp::Sar => {
                let a = to_int32(self.to_number(left)?);
                let b = to_int32(self.to_number(right)?);
                let shift = (b as u32) & 0x1F;
                f64::from(match op {
                    BinaryOp::BitOr => a | b,
                    BinaryOp::BitXor => a ^ b,
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::Shl => a.wrapping_shl(shift),
                    _ => a >> shift,
                })
            }
            BinaryOp::Shr => {
                let a = to_uint32(self.to_number(left)?);
                let shift = to_uint32(self.to_number(right)?) & 0x1F;
                f64::from(a >> shift)
            }
            BinaryOp::Comma | BinaryOp::Or | BinaryOp::And => {
                return Err(Error::Internal(format!(
                    "{} has no generic implementation",
                    op.as_str()
                ))
                .into());
            }
        };
        Ok(self.heap.number(value)?)
    }

    pub(super) fn instance_of(&mut self, object: u32, function: u32) -> Exec<bool> {
        if !self.heap.is_function(function)? {
            return Err(self.throw_error(
                ErrorKind::TypeError,
                "Expecting a function in instanceof check",
            ));
        }
        if !self.heap.is_js_object(object)? {
            return Ok(false);
        }
        let prototype = self.get_property(function, Key::Name(self.names.prototype))?;
        if !self.heap.is_js_object(prototype)? {
            return Err(self.throw_error(
                ErrorKind::TypeError,
                "Function has non-object prototype in instanceof check",
            ));
        }
        let mut current = self.heap.prototype_of(object)?;
        while self.heap.is_js_object(current)? {
            if current == prototype {
                return Ok(true);
            }
            current = self.heap.prototype_of(current)?;
        }
        Ok(false)
    }

    // ── Builtins, stubs and inline caches ──

    pub(super) fn call_builtin(&mut self, builtin: Builtin) -> Exec<()> {
        if builtin == Builtin::JsConstructCall {
            let argc = self.reg(Reg::R0) as usize;
            let function = self.reg(Reg::R1);
            return self.construct(function, argc, self.cpu.pc);
        }
        let arguments = self.pop_arguments(builtin.argument_count())?;
        let argument = |index: usize| arguments.get(index).copied().unwrap_or_default();
        let roots = self.heap.roots;
        let result = match builtin {
            Builtin::Equals => smi(i32::from(!self.loose_equals(argument(0), argument(1))?)) as u32,
            Builtin::StrictEquals => {
                smi(i32::from(!self.strict_equals(argument(0), argument(1))?)) as u32
            }
            Builtin::Compare => match self.compare(argument(0), argument(1))? {
                Some(Ordering::Less) => smi(-1) as u32,
                Some(Ordering::Equal) => smi(0) as u32,
                Some(Ordering::Greater) => smi(1) as u32,
                None => argument(2),
            },
            Builtin::UnaryMinus => {
                let value = self.to_number(argument(0))?;
                self.heap.number(-value)?
            }
            Builtin::BitNot => {
                let value = to_int32(self.to_number(argument(0))?);
                self.heap.number(f64::from(!value))?
            }
            Builtin::ToNumber => {
                if self.heap.is_number(argument(0))? {
                    argument(0)
                } else {
                    let value = self.to_number(argument(0))?;
                    self.heap.number(value)?
                }
            }
            Builtin::ToObject => self.to_object(argument(0))?,
            Builtin::FilterKey => {
                let key = self.to_key(argument(1))?;
                if self.has_property(argument(0), key)? {
                    argument(1)
                } else {
                    roots.null
                }
            }
            Builtin::In => {
                let object = argument(1);
                if !self.heap.is_js_object(object)? {
                    return Err(self.throw_error(
                        ErrorKind::TypeError,
                        "Cannot use 'in' operator on a non-object",
                    ));
                }
                let key = self.to_key(argument(0))?;
                self.heap.boolean(self.has_property(object, key)?)
            }
            Builtin::InstanceOf => {
                smi(i32::from(!self.instance_of(argument(0), argument(1))?)) as u32
            }
            Builtin::Delete => {
                let object = argument(0);
                if object == roots.the_hole {
                    roots.false_value
                } else if self.heap.is_undefined_or_null(object) {
                    let base = self.describe_briefly(object)?;
                    return Err(self.throw_error(
                        ErrorKind::TypeError,
                        &format!("Cannot delete property of {base}"),
                    ));
                } else {
                    let key = self.to_key(argument(1))?;
                    let deleted = self.delete_property(object, key)?;
                    self.heap.boolean(deleted)
                }
            }
            Builtin::JsConstructCall => roots.undefined,
        };
        self.set_reg(Reg::R0, result);
        Ok(())
    }

    pub(super) fn call_stub(&mut self, stub: CodeStub) -> Exec<()> {
        match stub {
            CodeStub::GenericBinaryOp(op) => {
                let result = self.binary_op(op, self.reg(Reg::R1), self.reg(Reg::R0))?;
                self.set_reg(Reg::R0, result);
            }
            CodeStub::UnarySub => {
                let value = self.to_number(self.reg(Reg::R0))?;
                let result = self.heap.number(-value)?;
                self.set_reg(Reg::R0, result);
            }
            CodeStub::CallFunction { argc } => {
                let argc = usize::from(argc);
                let function = self.peek(argc + 1)?;
                return self.invoke(function, argc, self.cpu.pc);
            }
            CodeStub::StackCheck => self.stack_guard()?,
        }
        Ok(())
    }

    pub(super) fn stack_guard(&mut self) -> Exec<()> {
        if self.sp() < self.heap.memory().stack_limit() {
            tracing::debug!(sp = format_args!("{:#x}", self.sp()), "stack overflow");
            return Err(self.throw_error(ErrorKind::RangeError, "Maximum call stack size exceeded"));
        }
        Ok(())
    }

    fn reference_error(&mut self, name: u32) -> super::Trap {
        let text = match self.heap.string_value(name) {
            Ok(Some(text)) => text.to_string(),
            _ => String::new(),
        };
        self.throw_error(ErrorKind::ReferenceError, &format!("{text} is not defined"))
    }

    pub(super) fn call_ic(&mut self, ic: IcKind) -> Exec<()> {
        match ic {
            IcKind::Load { contextual } => {
                let name = self.reg(Reg::R2);
                let receiver = self.peek(0)?;
                let key = self.to_key(name)?;
                if contextual && !self.has_property(receiver, key)? {
                    return Err(self.reference_error(name));
                }
                let value = self.get_property(receiver, key)?;
                self.set_reg(Reg::R0, value);
            }
            IcKind::KeyedLoad => {
                let key = self.peek(0)?;
                let receiver = self.peek(1)?;
                let key = self.to_key(key)?;
                let value = self.get_property(receiver, key)?;
                self.set_reg(Reg::R0, value);
            }
            IcKind::Store => {
                let value = self.reg(Reg::R0);
                let key = self.to_key(self.reg(Reg::R2))?;
                let receiver = self.peek(0)?;
                self.set_property(receiver, key, value)?;
                self.set_reg(Reg::R0, value);
            }
            IcKind::KeyedStore => {
                let value = self.reg(Reg::R0);
                let key = self.peek(0)?;
                let receiver = self.peek(1)?;
                let key = self.to_key(key)?;
                self.set_property(receiver, key, value)?;
                self.set_reg(Reg::R0, value);
            }
            IcKind::Call { argc, contextual } => {
                let argc = usize::from(argc);
                let name = self.peek(argc + 1)?;
                let receiver = self.peek(argc)?;
                let key = self.to_key(name)?;
                if contextual && !self.has_property(receiver, key)? {
                    return Err(self.reference_error(name));
                }
                let function = self.get_property(receiver, key)?;
                if !self.heap.is_function(function)? {
                    let text = self.key_text(key)?;
                    return Err(self.throw_error(
                        ErrorKind::TypeError,
                        &format!("{text} is not a function"),
                    ));
                }
                self.poke(argc + 1, function)?;
                return self.invoke(function, argc, self.cpu.pc);
            }
        }
        Ok(())
    }

    // ── Values leaving the simulator ──

    pub(super) fn describe(&self, word: u32) -> Result<Value> {
        self.describe_at_depth(word, 0)
    }

    fn describe_at_depth(&self, word: u32, depth: usize) -> Result<Value> {
        let roots = self.heap.roots;
        if word == roots.undefined || word == roots.the_hole {
            return Ok(Value::Undefined);
        }
        if word == roots.null {
            return Ok(Value::Null);
        }
        if word == roots.true_value || word == roots.false_value {
            return Ok(Value::Bool(word == roots.true_value));
        }
        if let Some(value) = self.heap.number_value(word)? {
            return Ok(Value::Number(value));
        }
        if let Some(text) = self.heap.string_value(word)? {
            return Ok(Value::String(text.to_string()));
        }
        if self.heap.is_function(word)? {
            return Ok(Value::Function(self.function_name(word)?));
        }
        if self.heap.is_array(word)? {
            if depth >= MAX_DESCRIBE_DEPTH {
                return Ok(Value::Object(String::new()));
            }
            let mut parts = Vec::new();
            for index in 0..self.heap.array_length(word)? {
                let part = match self.heap.element(word, index)? {
                    Some(element) if !self.heap.is_undefined_or_null(element) => {
                        self.describe_at_depth(element, depth + 1)?.to_string()
                    }
                    _ => String::new(),
                };
                parts.push(part);
            }
            return Ok(Value::Object(parts.join(",")));
        }
        if self.heap.is_js_object(word)? {
            if let Some(text) = self.error_text(word)? {
                return Ok(Value::Object(text));
            }
            return Ok(Value::Object(format!("[object {}]", self.class_name(word)?)));
        }
        Err(Error::Simulator(format!("{word:#x} is not a language value")))
    }

    /// Data property found on the prototype chain, without running getters.
    fn raw_lookup(&self, object: u32, name: u32) -> Result<Option<u32>> {
        match self.lookup(object, Key::Name(name))? {
            Some((_, value)) if !self.heap.is_accessor_pair(value)? => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// `Name: message` for objects inheriting from an error prototype.
    fn error_text(&self, object: u32) -> Result<Option<String>> {
        let mut current = self.heap.prototype_of(object)?;
        let mut is_error = false;
        while self.heap.is_js_object(current)? {
            if self.error_prototypes.contains(&current) {
                is_error = true;
                break;
            }
            current = self.heap.prototype_of(current)?;
        }
        if !is_error {
            return Ok(None);
        }
        let text_of = |word: Option<u32>| -> Result<String> {
            Ok(match word {
                Some(word) => self.heap.string_value(word)?.map(|t| t.to_string()).unwrap_or_default(),
                None => String::new(),
            })
        };
        let name = text_of(self.raw_lookup(object, self.names.name)?)?;
        let message = text_of(self.raw_lookup(object, self.names.message)?)?;
        Ok(Some(if message.is_empty() {
            name
        } else {
            format!("{name}: {message}")
        }))
    }

    pub(super) fn describe_exception(&self, word: u32) -> String {
        match self.describe(word) {
            Ok(value) => value.to_string(),
            Err(error) => error.to_string(),
        }
    }

    /// Short text for error messages.
    pub(super) fn describe_briefly(&self, word: u32) -> Result<String> {
        Ok(match self.describe(word)? {
            Value::String(text) => format!("\"{text}\""),
            Value::Function(name) => format!("function {name}"),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompileOptions;
    use crate::sim::SimulatorOptions;

    fn simulator() -> Simulator {
        Simulator::new(
            SimulatorOptions::default().with_heap_words(1 << 16),
            CompileOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_keys() {
        let mut sim = simulator();
        let seven = sim.heap.intern("7").unwrap();
        assert_eq!(sim.to_key(seven).ok(), Some(Key::Index(7)));
        assert_eq!(sim.to_key(smi(3) as u32).ok(), Some(Key::Index(3)));
        let name = sim.heap.intern("07").unwrap();
        assert_eq!(sim.to_key(name).ok(), Some(Key::Name(name)));
    }

    #[test]
    fn test_equality() {
        let mut sim = simulator();
        let roots = sim.heap.roots;
        let one = smi(1) as u32;
        let text = sim.heap.intern("1").unwrap();
        let boxed = sim.heap.heap_number(1.0).unwrap();
        assert!(sim.loose_equals(one, text).ok().unwrap());
        assert!(!sim.strict_equals(one, text).unwrap());
        assert!(sim.strict_equals(one, boxed).unwrap());
        assert!(sim.loose_equals(roots.null, roots.undefined).ok().unwrap());
        assert!(!sim.loose_equals(roots.null, smi(0) as u32).ok().unwrap());
        assert!(sim.loose_equals(roots.true_value, one).ok().unwrap());
        let nan = sim.heap.heap_number(f64::NAN).unwrap();
        assert!(!sim.strict_equals(nan, nan).unwrap());
    }

    #[test]
    fn test_binary_ops() {
        let mut sim = simulator();
        let minus_one = smi(-1) as u32;
        let result = sim.binary_op(BinaryOp::Shr, minus_one, smi(0) as u32).ok().unwrap();
        assert_eq!(sim.heap.number_value(result).unwrap(), Some(4_294_967_295.0));
        let result = sim.binary_op(BinaryOp::Shl, smi(1) as u32, smi(33) as u32).ok().unwrap();
        assert_eq!(sim.heap.number_value(result).unwrap(), Some(2.0));
        let a = sim.heap.intern("a").unwrap();
        let result = sim.binary_op(BinaryOp::Add, a, smi(1) as u32).ok().unwrap();
        assert_eq!(sim.heap.string_value(result).unwrap().as_deref(), Some("a1"));
    }

    #[test]
    fn test_read_only_properties_accept_their_first_value() {
        let mut sim = simulator();
        let object = sim.heap.new_object(sim.heap.roots.object_prototype).unwrap();
        let name = sim.heap.intern("x").unwrap();
        let hole = sim.heap.roots.the_hole;
        sim.heap.add_property(object, name, hole, READ_ONLY).unwrap();
        sim.set_property(object, Key::Name(name), smi(3) as u32).ok().unwrap();
        sim.set_property(object, Key::Name(name), smi(5) as u32).ok().unwrap();
        assert_eq!(sim.get_own(object, Key::Name(name)).unwrap(), Some(smi(3) as u32));
    }

    #[test]
    fn test_typeof() {
        let mut sim = simulator();
        let roots = sim.heap.roots;
        let text = sim.heap.intern("s").unwrap();
        assert_eq!(sim.typeof_string(smi(1) as u32).unwrap(), "number");
        assert_eq!(sim.typeof_string(text).unwrap(), "string");
        assert_eq!(sim.typeof_string(roots.null).unwrap(), "object");
        assert_eq!(sim.typeof_string(roots.the_hole).unwrap(), "undefined");
        assert_eq!(sim.typeof_string(roots.false_value).unwrap(), "boolean");
    }
}
