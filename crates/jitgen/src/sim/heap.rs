//! Heap object model.
//!
//! Objects are bump-allocated and never collected. Every object starts
//! with its map. Named properties keep their names and attributes in the
//! map's descriptor array and their values in the object's properties
//! array, in the same order. Maps without the dictionary bit are shared
//! between objects of the same shape and found again through transitions.

use std::collections::HashMap;
use std::rc::Rc;

use super::memory::Memory;
use crate::layout::{
    CONTEXT_CLOSURE_INDEX, CONTEXT_EXTENSION_INDEX, CONTEXT_FCONTEXT_INDEX, CONTEXT_GLOBAL_INDEX,
    CONTEXT_MIN_SLOTS, CONTEXT_PREVIOUS_INDEX, FIXED_ARRAY_HEADER_SIZE, FIXED_ARRAY_LENGTH_OFFSET,
    FIXED_ARRAY_TYPE, HEAP_NUMBER_SIZE, HEAP_NUMBER_TYPE, HEAP_NUMBER_VALUE_OFFSET,
    HEAP_OBJECT_TAG, JS_ARRAY_LENGTH_OFFSET, JS_ARRAY_SIZE, JS_ARRAY_TYPE,
    JS_FUNCTION_CONTEXT_OFFSET, JS_FUNCTION_LITERALS_OFFSET, JS_FUNCTION_SHARED_OFFSET,
    JS_FUNCTION_SIZE, JS_FUNCTION_TYPE, JS_GLOBAL_OBJECT_TYPE, JS_OBJECT_ELEMENTS_OFFSET,
    JS_OBJECT_PROPERTIES_OFFSET, JS_OBJECT_SIZE, JS_OBJECT_TYPE, JS_REGEXP_FLAGS_OFFSET,
    JS_REGEXP_TYPE, JS_VALUE_SIZE, JS_VALUE_TYPE, JS_VALUE_VALUE_OFFSET, MAP_BIT_FIELD_OFFSET,
    MAP_DESCRIPTORS_OFFSET, MAP_ENUM_CACHE_OFFSET, MAP_INSTANCE_TYPE_OFFSET, MAP_IS_DICTIONARY,
    MAP_OFFSET, MAP_PROTOTYPE_OFFSET, MAP_SIZE, MAP_TYPE, ODDBALL_KIND_OFFSET, ODDBALL_SIZE,
    ODDBALL_TYPE, POINTER_SIZE, SMI_MAX, SMI_MIN, STRING_ID_OFFSET, STRING_LENGTH_OFFSET,
    STRING_SIZE, STRING_TYPE, field, has_smi_tag, smi, untag_smi,
};
use crate::{Error, Result};

/// Getter / setter pair stored as the value of an accessor property.
pub const ACCESSOR_PAIR_TYPE: u32 = 0x86;
const ACCESSOR_GETTER_OFFSET: i32 = 4;
const ACCESSOR_SETTER_OFFSET: i32 = 8;
const ACCESSOR_PAIR_SIZE: i32 = 12;

/// Function boilerplate: an index into the simulator's function table.
pub const SHARED_INFO_TYPE: u32 = 0x87;
const SHARED_ID_OFFSET: i32 = 4;
const SHARED_INFO_SIZE: i32 = 8;

/// Map bit: the object is a scope object of a context, and functions
/// found on it are called with the global receiver.
pub const MAP_IS_CONTEXT_EXTENSION: u32 = 1 << 7;

pub const READ_ONLY: u32 = 1;
pub const DONT_ENUM: u32 = 2;
pub const DONT_DELETE: u32 = 4;

const ODDBALL_UNDEFINED: i32 = 0;
const ODDBALL_NULL: i32 = 1;
const ODDBALL_TRUE: i32 = 2;
const ODDBALL_FALSE: i32 = 3;
const ODDBALL_HOLE: i32 = 4;

/// Element indices at or above this bound are stored as named properties.
pub const MAX_FAST_ELEMENT: u32 = 1 << 20;

const WORD: u32 = POINTER_SIZE as u32;

/// Objects the runtime needs to find without a lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct Roots {
    pub meta_map: u32,
    pub heap_number_map: u32,
    pub string_map: u32,
    pub oddball_map: u32,
    pub fixed_array_map: u32,
    pub context_map: u32,
    pub shared_map: u32,
    pub accessor_map: u32,
    pub description_map: u32,
    pub undefined: u32,
    pub null: u32,
    pub true_value: u32,
    pub false_value: u32,
    pub the_hole: u32,
    pub empty_fixed_array: u32,
    pub object_prototype: u32,
    pub function_prototype: u32,
    pub array_prototype: u32,
    pub global_object: u32,
    pub global_context: u32,
}

#[derive(Debug)]
pub struct Heap {
    memory: Memory,
    top: u32,
    strings: Vec<Rc<str>>,
    interned: HashMap<Rc<str>, u32>,
    /// `(map, name, attributes)` to the map with that property added.
    transitions: HashMap<(u32, u32, u32), u32>,
    /// `(prototype, instance type, bit field)` to the initial map.
    initial_maps: HashMap<(u32, u32, u32), u32>,
    pub roots: Roots,
}

impl Heap {
    pub fn new(memory: Memory) -> Result<Self> {
        let top = memory.heap_base();
        let mut heap = Self {
            memory,
            top,
            strings: Vec::new(),
            interned: HashMap::new(),
            transitions: HashMap::new(),
            initial_maps: HashMap::new(),
            roots: Roots::default(),
        };
        heap.bootstrap()?;
        Ok(heap)
    }

    fn bootstrap(&mut self) -> Result<()> {
        // The meta map is its own map. Prototypes and descriptors are
        // patched once null and the empty fixed array exist.
        let meta_map = self.allocate(MAP_SIZE, 0)?;
        self.set_field(meta_map, MAP_OFFSET, meta_map)?;
        self.init_map(meta_map, MAP_TYPE, 0, 0)?;
        self.roots.meta_map = meta_map;

        let fixed_array_map = self.new_map(FIXED_ARRAY_TYPE, 0, 0)?;
        self.roots.fixed_array_map = fixed_array_map;
        let empty = self.allocate(FIXED_ARRAY_HEADER_SIZE, fixed_array_map)?;
        self.set_field(empty, FIXED_ARRAY_LENGTH_OFFSET, 0)?;
        self.roots.empty_fixed_array = empty;
        for map in [meta_map, fixed_array_map] {
            self.set_field(map, MAP_DESCRIPTORS_OFFSET, empty)?;
        }

        let oddball_map = self.new_map(ODDBALL_TYPE, 0, 0)?;
        self.roots.oddball_map = oddball_map;
        self.roots.undefined = self.new_oddball(ODDBALL_UNDEFINED)?;
        self.roots.null = self.new_oddball(ODDBALL_NULL)?;
        self.roots.true_value = self.new_oddball(ODDBALL_TRUE)?;
        self.roots.false_value = self.new_oddball(ODDBALL_FALSE)?;
        self.roots.the_hole = self.new_oddball(ODDBALL_HOLE)?;
        let null = self.roots.null;
        for map in [meta_map, fixed_array_map, oddball_map] {
            self.set_field(map, MAP_PROTOTYPE_OFFSET, null)?;
        }

        self.roots.heap_number_map = self.new_map(HEAP_NUMBER_TYPE, null, 0)?;
        self.roots.string_map = self.new_map(STRING_TYPE, null, 0)?;
        self.roots.context_map = self.new_map(FIXED_ARRAY_TYPE, null, 0)?;
        self.roots.shared_map = self.new_map(SHARED_INFO_TYPE, null, 0)?;
        self.roots.accessor_map = self.new_map(ACCESSOR_PAIR_TYPE, null, 0)?;
        self.roots.description_map = self.new_map(FIXED_ARRAY_TYPE, null, 0)?;

        self.roots.object_prototype = self.new_object(null)?;
        let object_prototype = self.roots.object_prototype;
        self.roots.function_prototype = self.new_object(object_prototype)?;
        self.roots.array_prototype = self.new_object(object_prototype)?;
        self.roots.global_object =
            self.new_object_of_type(JS_GLOBAL_OBJECT_TYPE, object_prototype, JS_OBJECT_SIZE, 0)?;

        let context = self.new_context(CONTEXT_MIN_SLOTS)?;
        self.context_set(context, CONTEXT_CLOSURE_INDEX, smi(0) as u32)?;
        self.context_set(context, CONTEXT_FCONTEXT_INDEX, context)?;
        self.context_set(context, CONTEXT_PREVIOUS_INDEX, self.roots.undefined)?;
        self.context_set(context, CONTEXT_EXTENSION_INDEX, self.roots.global_object)?;
        self.context_set(context, CONTEXT_GLOBAL_INDEX, self.roots.global_object)?;
        self.roots.global_context = context;
        Ok(())
    }

    // ── Raw access ──

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn read(&self, address: u32) -> Result<u32> {
        self.memory.read(address)
    }

    pub fn write(&mut self, address: u32, value: u32) -> Result<()> {
        self.memory.write(address, value)
    }

    pub fn field(&self, object: u32, offset: i32) -> Result<u32> {
        self.memory.read(object.wrapping_add_signed(field(offset)))
    }

    pub fn set_field(&mut self, object: u32, offset: i32, value: u32) -> Result<()> {
        self.memory.write(object.wrapping_add_signed(field(offset)), value)
    }

    /// Bytes allocated so far.
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.top - self.memory.heap_base()
    }

    fn allocate(&mut self, size: i32, map: u32) -> Result<u32> {
        let address = self.top;
        let end = address
            .checked_add(size as u32)
            .filter(|end| *end <= self.memory.heap_end())
            .ok_or_else(|| Error::Simulator("heap exhausted".to_string()))?;
        self.top = end;
        self.memory.write(address, map)?;
        Ok(address + HEAP_OBJECT_TAG)
    }

    // ── Classification ──

    #[must_use]
    pub fn is_smi(word: u32) -> bool {
        has_smi_tag(word)
    }

    /// The instance type of a heap object, `None` for smis.
    pub fn instance_type(&self, word: u32) -> Result<Option<u32>> {
        if Self::is_smi(word) {
            return Ok(None);
        }
        let map = self.field(word, MAP_OFFSET)?;
        self.field(map, MAP_INSTANCE_TYPE_OFFSET).map(Some)
    }

    pub fn map_of(&self, object: u32) -> Result<u32> {
        self.field(object, MAP_OFFSET)
    }

    pub fn is_js_object(&self, word: u32) -> Result<bool> {
        Ok(self
            .instance_type(word)?
            .is_some_and(|t| t >= JS_OBJECT_TYPE && t <= JS_FUNCTION_TYPE))
    }

    pub fn is_function(&self, word: u32) -> Result<bool> {
        Ok(self.instance_type(word)? == Some(JS_FUNCTION_TYPE))
    }

    pub fn is_string(&self, word: u32) -> Result<bool> {
        Ok(self.instance_type(word)? == Some(STRING_TYPE))
    }

    pub fn is_array(&self, word: u32) -> Result<bool> {
        Ok(self.instance_type(word)? == Some(JS_ARRAY_TYPE))
    }

    #[must_use]
    pub fn is_undefined_or_null(&self, word: u32) -> bool {
        word == self.roots.undefined || word == self.roots.null
    }

    #[must_use]
    pub fn boolean(&self, value: bool) -> u32 {
        if value {
            self.roots.true_value
        } else {
            self.roots.false_value
        }
    }

    // ── Maps ──

    fn init_map(&mut self, map: u32, instance_type: u32, prototype: u32, bits: u32) -> Result<()> {
        self.set_field(map, MAP_INSTANCE_TYPE_OFFSET, instance_type)?;
        self.set_field(map, MAP_BIT_FIELD_OFFSET, bits)?;
        self.set_field(map, MAP_PROTOTYPE_OFFSET, prototype)?;
        self.set_field(map, MAP_DESCRIPTORS_OFFSET, self.roots.empty_fixed_array)?;
        self.set_field(map, MAP_ENUM_CACHE_OFFSET, smi(0) as u32)
    }

    fn new_map(&mut self, instance_type: u32, prototype: u32, bits: u32) -> Result<u32> {
        let map = self.allocate(MAP_SIZE, self.roots.meta_map)?;
        self.init_map(map, instance_type, prototype, bits)?;
        Ok(map)
    }

    fn initial_map(&mut self, prototype: u32, instance_type: u32, bits: u32) -> Result<u32> {
        let key = (prototype, instance_type, bits);
        if let Some(map) = self.initial_maps.get(&key) {
            return Ok(*map);
        }
        let map = self.new_map(instance_type, prototype, bits)?;
        self.initial_maps.insert(key, map);
        Ok(map)
    }

    fn copy_map(&mut self, map: u32, descriptors: u32, bits: u32) -> Result<u32> {
        let instance_type = self.field(map, MAP_INSTANCE_TYPE_OFFSET)?;
        let prototype = self.field(map, MAP_PROTOTYPE_OFFSET)?;
        let copy = self.new_map(instance_type, prototype, bits)?;
        self.set_field(copy, MAP_DESCRIPTORS_OFFSET, descriptors)?;
        Ok(copy)
    }

    pub fn map_bits(&self, map: u32) -> Result<u32> {
        self.field(map, MAP_BIT_FIELD_OFFSET)
    }

    pub fn is_dictionary_map(&self, map: u32) -> Result<bool> {
        Ok(self.map_bits(map)? & MAP_IS_DICTIONARY != 0)
    }

    pub fn prototype_of(&self, object: u32) -> Result<u32> {
        let map = self.map_of(object)?;
        self.field(map, MAP_PROTOTYPE_OFFSET)
    }

    pub fn enum_cache(&self, map: u32) -> Result<u32> {
        self.field(map, MAP_ENUM_CACHE_OFFSET)
    }

    pub fn set_enum_cache(&mut self, map: u32, cache: u32) -> Result<()> {
        self.set_field(map, MAP_ENUM_CACHE_OFFSET, cache)
    }

    // ── Fixed arrays ──

    pub fn new_fixed_array(&mut self, length: usize, fill: u32) -> Result<u32> {
        let map = self.roots.fixed_array_map;
        self.new_fixed_array_with_map(length, fill, map)
    }

    fn new_fixed_array_with_map(&mut self, length: usize, fill: u32, map: u32) -> Result<u32> {
        let size = FIXED_ARRAY_HEADER_SIZE + (length as i32) * POINTER_SIZE;
        let array = self.allocate(size, map)?;
        self.set_field(array, FIXED_ARRAY_LENGTH_OFFSET, length as u32)?;
        for index in 0..length {
            self.fixed_set(array, index, fill)?;
        }
        Ok(array)
    }

    /// A fixed array holding `items`.
    pub fn fixed_array_from(&mut self, items: &[u32]) -> Result<u32> {
        let array = self.new_fixed_array(items.len(), smi(0) as u32)?;
        for (index, item) in items.iter().enumerate() {
            self.fixed_set(array, index, *item)?;
        }
        Ok(array)
    }

    pub fn description_from(&mut self, items: &[u32]) -> Result<u32> {
        let map = self.roots.description_map;
        let array = self.new_fixed_array_with_map(items.len(), smi(0) as u32, map)?;
        for (index, item) in items.iter().enumerate() {
            self.fixed_set(array, index, *item)?;
        }
        Ok(array)
    }

    pub fn fixed_len(&self, array: u32) -> Result<usize> {
        Ok(self.field(array, FIXED_ARRAY_LENGTH_OFFSET)? as usize)
    }

    fn element_offset(index: usize) -> i32 {
        FIXED_ARRAY_HEADER_SIZE + (index as i32) * POINTER_SIZE
    }

    pub fn fixed_get(&self, array: u32, index: usize) -> Result<u32> {
        self.field(array, Self::element_offset(index))
    }

    pub fn fixed_set(&mut self, array: u32, index: usize, value: u32) -> Result<()> {
        self.set_field(array, Self::element_offset(index), value)
    }

    pub fn fixed_items(&self, array: u32) -> Result<Vec<u32>> {
        (0..self.fixed_len(array)?)
            .map(|index| self.fixed_get(array, index))
            .collect()
    }

    // ── Oddballs, numbers and strings ──

    fn new_oddball(&mut self, kind: i32) -> Result<u32> {
        let oddball = self.allocate(ODDBALL_SIZE, self.roots.oddball_map)?;
        self.set_field(oddball, ODDBALL_KIND_OFFSET, smi(kind) as u32)?;
        Ok(oddball)
    }

    /// A number as a smi when it is one, otherwise a heap number.
    pub fn number(&mut self, value: f64) -> Result<u32> {
        let is_smi = value.fract() == 0.0
            && value >= f64::from(SMI_MIN)
            && value <= f64::from(SMI_MAX)
            && !(value == 0.0 && value.is_sign_negative());
        if is_smi {
            return Ok(smi(value as i32) as u32);
        }
        self.heap_number(value)
    }

    pub fn heap_number(&mut self, value: f64) -> Result<u32> {
        let number = self.allocate(HEAP_NUMBER_SIZE, self.roots.heap_number_map)?;
        let bits = value.to_bits();
        self.set_field(number, HEAP_NUMBER_VALUE_OFFSET, bits as u32)?;
        self.set_field(number, HEAP_NUMBER_VALUE_OFFSET + POINTER_SIZE, (bits >> 32) as u32)?;
        Ok(number)
    }

    /// The value of a smi or heap number.
    pub fn number_value(&self, word: u32) -> Result<Option<f64>> {
        if Self::is_smi(word) {
            return Ok(Some(f64::from(untag_smi(word))));
        }
        if self.map_of(word)? != self.roots.heap_number_map {
            return Ok(None);
        }
        let low = u64::from(self.field(word, HEAP_NUMBER_VALUE_OFFSET)?);
        let high = u64::from(self.field(word, HEAP_NUMBER_VALUE_OFFSET + POINTER_SIZE)?);
        Ok(Some(f64::from_bits(high << 32 | low)))
    }

    pub fn is_number(&self, word: u32) -> Result<bool> {
        Ok(Self::is_smi(word) || self.map_of(word)? == self.roots.heap_number_map)
    }

    /// The interned string with the given contents.
    pub fn intern(&mut self, text: &str) -> Result<u32> {
        if let Some(string) = self.interned.get(text) {
            return Ok(*string);
        }
        let contents: Rc<str> = Rc::from(text);
        let id = self.strings.len();
        let string = self.allocate(STRING_SIZE, self.roots.string_map)?;
        let length = text.chars().count() as i32;
        self.set_field(string, STRING_LENGTH_OFFSET, smi(length) as u32)?;
        self.set_field(string, STRING_ID_OFFSET, smi(id as i32) as u32)?;
        self.strings.push(Rc::clone(&contents));
        self.interned.insert(contents, string);
        Ok(string)
    }

    /// Contents of a string, `None` for anything else.
    pub fn string_value(&self, word: u32) -> Result<Option<Rc<str>>> {
        if !self.is_string(word)? {
            return Ok(None);
        }
        let id = untag_smi(self.field(word, STRING_ID_OFFSET)?) as usize;
        self.strings
            .get(id)
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::Simulator(format!("dangling string id {id}")))
    }

    // ── JS objects ──

    pub fn new_object(&mut self, prototype: u32) -> Result<u32> {
        self.new_object_of_type(JS_OBJECT_TYPE, prototype, JS_OBJECT_SIZE, 0)
    }

    pub fn new_object_of_type(
        &mut self,
        instance_type: u32,
        prototype: u32,
        size: i32,
        bits: u32,
    ) -> Result<u32> {
        let map = self.initial_map(prototype, instance_type, bits)?;
        let object = self.allocate(size, map)?;
        let empty = self.roots.empty_fixed_array;
        self.set_field(object, JS_OBJECT_PROPERTIES_OFFSET, empty)?;
        self.set_field(object, JS_OBJECT_ELEMENTS_OFFSET, empty)?;
        let undefined = self.roots.undefined;
        let mut offset = JS_OBJECT_SIZE;
        while offset < size {
            self.set_field(object, offset, undefined)?;
            offset += POINTER_SIZE;
        }
        Ok(object)
    }

    pub fn new_array(&mut self, items: &[u32]) -> Result<u32> {
        let prototype = self.roots.array_prototype;
        let array = self.new_object_of_type(JS_ARRAY_TYPE, prototype, JS_ARRAY_SIZE, 0)?;
        if !items.is_empty() {
            let elements = self.fixed_array_from(items)?;
            self.set_field(array, JS_OBJECT_ELEMENTS_OFFSET, elements)?;
        }
        self.set_field(array, JS_ARRAY_LENGTH_OFFSET, smi(items.len() as i32) as u32)?;
        Ok(array)
    }

    /// A wrapper object around a primitive.
    pub fn new_value_object(&mut self, value: u32) -> Result<u32> {
        let prototype = self.roots.object_prototype;
        let wrapper = self.new_object_of_type(JS_VALUE_TYPE, prototype, JS_VALUE_SIZE, 0)?;
        self.set_field(wrapper, JS_VALUE_VALUE_OFFSET, value)?;
        if let Some(text) = self.string_value(value)? {
            // Characters enumerate as elements.
            let mut characters = Vec::new();
            for ch in text.chars() {
                characters.push(self.intern(ch.encode_utf8(&mut [0; 4]))?);
            }
            let elements = self.fixed_array_from(&characters)?;
            self.set_field(wrapper, JS_OBJECT_ELEMENTS_OFFSET, elements)?;
        }
        Ok(wrapper)
    }

    pub fn new_regexp(&mut self, pattern: u32, flags: u32) -> Result<u32> {
        let prototype = self.roots.object_prototype;
        let regexp = self.new_object_of_type(JS_REGEXP_TYPE, prototype, JS_VALUE_SIZE, 0)?;
        self.set_field(regexp, JS_VALUE_VALUE_OFFSET, pattern)?;
        self.set_field(regexp, JS_REGEXP_FLAGS_OFFSET, flags)?;
        Ok(regexp)
    }

    /// An object whose functions are called with the global receiver.
    pub fn new_context_extension(&mut self) -> Result<u32> {
        let null = self.roots.null;
        self.new_object_of_type(JS_OBJECT_TYPE, null, JS_OBJECT_SIZE, MAP_IS_CONTEXT_EXTENSION)
    }

    pub fn is_context_extension(&self, object: u32) -> Result<bool> {
        let map = self.map_of(object)?;
        Ok(self.map_bits(map)? & MAP_IS_CONTEXT_EXTENSION != 0)
    }

    /// Shallow copy of a JS object with fresh properties and elements.
    pub fn copy_object(&mut self, object: u32) -> Result<u32> {
        let instance_type = self.instance_type(object)?.unwrap_or(JS_OBJECT_TYPE);
        let size = match instance_type {
            JS_ARRAY_TYPE => JS_ARRAY_SIZE,
            JS_VALUE_TYPE | JS_REGEXP_TYPE => JS_VALUE_SIZE,
            JS_FUNCTION_TYPE => JS_FUNCTION_SIZE,
            _ => JS_OBJECT_SIZE,
        };
        let map = self.map_of(object)?;
        let copy = self.allocate(size, map)?;
        let mut offset = POINTER_SIZE;
        while offset < size {
            let value = self.field(object, offset)?;
            self.set_field(copy, offset, value)?;
            offset += POINTER_SIZE;
        }
        for offset in [JS_OBJECT_PROPERTIES_OFFSET, JS_OBJECT_ELEMENTS_OFFSET] {
            let array = self.field(object, offset)?;
            let items = self.fixed_items(array)?;
            let fresh = if items.is_empty() {
                self.roots.empty_fixed_array
            } else {
                self.fixed_array_from(&items)?
            };
            self.set_field(copy, offset, fresh)?;
        }
        Ok(copy)
    }

    // ── Named properties ──

    fn descriptors(&self, object: u32) -> Result<u32> {
        let map = self.map_of(object)?;
        self.field(map, MAP_DESCRIPTORS_OFFSET)
    }

    fn descriptor_count(&self, object: u32) -> Result<usize> {
        Ok(self.fixed_len(self.descriptors(object)?)? / 2)
    }

    /// Index and attributes of the own property `name` (an interned string).
    pub fn find_own(&self, object: u32, name: u32) -> Result<Option<(usize, u32)>> {
        let descriptors = self.descriptors(object)?;
        let count = self.fixed_len(descriptors)? / 2;
        for index in 0..count {
            if self.fixed_get(descriptors, 2 * index)? == name {
                let attributes = untag_smi(self.fixed_get(descriptors, 2 * index + 1)?) as u32;
                return Ok(Some((index, attributes)));
            }
        }
        Ok(None)
    }

    pub fn own_value(&self, object: u32, index: usize) -> Result<u32> {
        let properties = self.field(object, JS_OBJECT_PROPERTIES_OFFSET)?;
        self.fixed_get(properties, index)
    }

    pub fn set_own_value(&mut self, object: u32, index: usize, value: u32) -> Result<()> {
        let properties = self.field(object, JS_OBJECT_PROPERTIES_OFFSET)?;
        self.fixed_set(properties, index, value)
    }

    /// Names and attributes of the own named properties, in insertion order.
    pub fn own_properties(&self, object: u32) -> Result<Vec<(u32, u32)>> {
        let descriptors = self.descriptors(object)?;
        let count = self.fixed_len(descriptors)? / 2;
        (0..count)
            .map(|index| {
                let name = self.fixed_get(descriptors, 2 * index)?;
                let attributes = untag_smi(self.fixed_get(descriptors, 2 * index + 1)?) as u32;
                Ok((name, attributes))
            })
            .collect()
    }

    fn transition(&mut self, map: u32, name: u32, attributes: u32) -> Result<u32> {
        let dictionary = self.is_dictionary_map(map)?;
        if !dictionary {
            if let Some(target) = self.transitions.get(&(map, name, attributes)) {
                return Ok(*target);
            }
        }
        let old = self.fixed_items(self.field(map, MAP_DESCRIPTORS_OFFSET)?)?;
        let mut items = old;
        items.push(name);
        items.push(smi(attributes as i32) as u32);
        let descriptors = self.fixed_array_from(&items)?;
        let bits = self.map_bits(map)?;
        let target = self.copy_map(map, descriptors, bits)?;
        if !dictionary {
            self.transitions.insert((map, name, attributes), target);
        }
        Ok(target)
    }

    /// Adds an own property that does not exist yet.
    pub fn add_property(
        &mut self,
        object: u32,
        name: u32,
        value: u32,
        attributes: u32,
    ) -> Result<()> {
        let count = self.descriptor_count(object)?;
        let map = self.map_of(object)?;
        let target = self.transition(map, name, attributes)?;

        let properties = self.field(object, JS_OBJECT_PROPERTIES_OFFSET)?;
        let capacity = self.fixed_len(properties)?;
        if count >= capacity {
            let undefined = self.roots.undefined;
            let grown = self.new_fixed_array((capacity * 2).max(4), undefined)?;
            for index in 0..count {
                let value = self.fixed_get(properties, index)?;
                self.fixed_set(grown, index, value)?;
            }
            self.set_field(object, JS_OBJECT_PROPERTIES_OFFSET, grown)?;
        }
        self.set_own_value(object, count, value)?;
        self.set_field(object, MAP_OFFSET, target)
    }

    /// Removes own property `index`, giving the object a private map.
    pub fn delete_own(&mut self, object: u32, index: usize) -> Result<()> {
        let map = self.map_of(object)?;
        let mut items = self.fixed_items(self.field(map, MAP_DESCRIPTORS_OFFSET)?)?;
        items.drain(2 * index..2 * index + 2);
        let descriptors = self.fixed_array_from(&items)?;
        let bits = self.map_bits(map)? | MAP_IS_DICTIONARY;
        let private = self.copy_map(map, descriptors, bits)?;

        let properties = self.field(object, JS_OBJECT_PROPERTIES_OFFSET)?;
        let count = items.len() / 2;
        for slot in index..count {
            let next = self.fixed_get(properties, slot + 1)?;
            self.fixed_set(properties, slot, next)?;
        }
        self.set_field(object, MAP_OFFSET, private)
    }

    /// Replaces the prototype, giving the object a private map.
    pub fn set_prototype(&mut self, object: u32, prototype: u32) -> Result<()> {
        let map = self.map_of(object)?;
        let descriptors = self.field(map, MAP_DESCRIPTORS_OFFSET)?;
        let bits = self.map_bits(map)? | MAP_IS_DICTIONARY;
        let private = self.copy_map(map, descriptors, bits)?;
        self.set_field(private, MAP_PROTOTYPE_OFFSET, prototype)?;
        self.set_field(object, MAP_OFFSET, private)
    }

    // ── Elements ──

    fn elements(&self, object: u32) -> Result<u32> {
        self.field(object, JS_OBJECT_ELEMENTS_OFFSET)
    }

    /// Element `index`, `None` for holes and indices past the end.
    pub fn element(&self, object: u32, index: u32) -> Result<Option<u32>> {
        let elements = self.elements(object)?;
        let index = index as usize;
        if index >= self.fixed_len(elements)? {
            return Ok(None);
        }
        let value = self.fixed_get(elements, index)?;
        Ok((value != self.roots.the_hole).then_some(value))
    }

    pub fn set_element(&mut self, object: u32, index: u32, value: u32) -> Result<()> {
        let elements = self.elements(object)?;
        let capacity = self.fixed_len(elements)?;
        let slot = index as usize;
        if slot >= capacity {
            let hole = self.roots.the_hole;
            let grown = self.new_fixed_array((slot + 1).max(capacity * 2), hole)?;
            for position in 0..capacity {
                let item = self.fixed_get(elements, position)?;
                self.fixed_set(grown, position, item)?;
            }
            self.set_field(object, JS_OBJECT_ELEMENTS_OFFSET, grown)?;
            self.fixed_set(grown, slot, value)?;
        } else {
            self.fixed_set(elements, slot, value)?;
        }
        if self.is_array(object)? && index >= self.array_length(object)? {
            self.set_field(object, JS_ARRAY_LENGTH_OFFSET, smi(index as i32 + 1) as u32)?;
        }
        Ok(())
    }

    pub fn delete_element(&mut self, object: u32, index: u32) -> Result<()> {
        let elements = self.elements(object)?;
        if (index as usize) < self.fixed_len(elements)? {
            let hole = self.roots.the_hole;
            self.fixed_set(elements, index as usize, hole)?;
        }
        Ok(())
    }

    /// Indices of the elements that are not holes, ascending.
    pub fn element_indices(&self, object: u32) -> Result<Vec<u32>> {
        let elements = self.elements(object)?;
        let mut indices = Vec::new();
        for index in 0..self.fixed_len(elements)? {
            if self.fixed_get(elements, index)? != self.roots.the_hole {
                indices.push(index as u32);
            }
        }
        Ok(indices)
    }

    pub fn array_length(&self, array: u32) -> Result<u32> {
        Ok(untag_smi(self.field(array, JS_ARRAY_LENGTH_OFFSET)?) as u32)
    }

    /// Sets an array's length, turning the elements past it into holes.
    pub fn set_array_length(&mut self, array: u32, length: u32) -> Result<()> {
        let elements = self.elements(array)?;
        let hole = self.roots.the_hole;
        for index in (length as usize)..self.fixed_len(elements)? {
            self.fixed_set(elements, index, hole)?;
        }
        self.set_field(array, JS_ARRAY_LENGTH_OFFSET, smi(length as i32) as u32)
    }

    // ── Functions ──

    pub fn new_shared(&mut self, id: usize) -> Result<u32> {
        let shared = self.allocate(SHARED_INFO_SIZE, self.roots.shared_map)?;
        self.set_field(shared, SHARED_ID_OFFSET, smi(id as i32) as u32)?;
        Ok(shared)
    }

    pub fn is_shared(&self, word: u32) -> Result<bool> {
        Ok(self.instance_type(word)? == Some(SHARED_INFO_TYPE))
    }

    pub fn shared_id(&self, shared: u32) -> Result<usize> {
        Ok(untag_smi(self.field(shared, SHARED_ID_OFFSET)?) as usize)
    }

    pub fn new_function(&mut self, shared: u32, context: u32, literal_count: usize) -> Result<u32> {
        let prototype = self.roots.function_prototype;
        let function =
            self.new_object_of_type(JS_FUNCTION_TYPE, prototype, JS_FUNCTION_SIZE, 0)?;
        let undefined = self.roots.undefined;
        let literals = self.new_fixed_array(literal_count, undefined)?;
        self.set_field(function, JS_FUNCTION_SHARED_OFFSET, shared)?;
        self.set_field(function, JS_FUNCTION_CONTEXT_OFFSET, context)?;
        self.set_field(function, JS_FUNCTION_LITERALS_OFFSET, literals)?;
        Ok(function)
    }

    /// Function table index of a JS function.
    pub fn function_id(&self, function: u32) -> Result<usize> {
        let shared = self.field(function, JS_FUNCTION_SHARED_OFFSET)?;
        self.shared_id(shared)
    }

    pub fn function_context(&self, function: u32) -> Result<u32> {
        self.field(function, JS_FUNCTION_CONTEXT_OFFSET)
    }

    pub fn new_accessor_pair(&mut self) -> Result<u32> {
        let pair = self.allocate(ACCESSOR_PAIR_SIZE, self.roots.accessor_map)?;
        let undefined = self.roots.undefined;
        self.set_field(pair, ACCESSOR_GETTER_OFFSET, undefined)?;
        self.set_field(pair, ACCESSOR_SETTER_OFFSET, undefined)?;
        Ok(pair)
    }

    pub fn is_accessor_pair(&self, word: u32) -> Result<bool> {
        Ok(self.instance_type(word)? == Some(ACCESSOR_PAIR_TYPE))
    }

    pub fn accessor(&self, pair: u32, setter: bool) -> Result<u32> {
        let offset = if setter {
            ACCESSOR_SETTER_OFFSET
        } else {
            ACCESSOR_GETTER_OFFSET
        };
        self.field(pair, offset)
    }

    pub fn set_accessor(&mut self, pair: u32, setter: bool, function: u32) -> Result<()> {
        let offset = if setter {
            ACCESSOR_SETTER_OFFSET
        } else {
            ACCESSOR_GETTER_OFFSET
        };
        self.set_field(pair, offset, function)
    }

    // ── Contexts ──

    pub fn new_context(&mut self, length: usize) -> Result<u32> {
        let undefined = self.roots.undefined;
        let map = self.roots.context_map;
        self.new_fixed_array_with_map(length, undefined, map)
    }

    pub fn context_get(&self, context: u32, index: usize) -> Result<u32> {
        self.fixed_get(context, index)
    }

    pub fn context_set(&mut self, context: u32, index: usize, value: u32) -> Result<()> {
        self.fixed_set(context, index, value)
    }

    pub fn is_context(&self, word: u32) -> Result<bool> {
        Ok(!Self::is_smi(word) && self.map_of(word)? == self.roots.context_map)
    }

    /// Words of the object, for tests and diagnostics.
    pub fn words_at(&self, address: u32, count: usize) -> Result<Vec<u32>> {
        (0..count as u32)
            .map(|index| self.read(address + index * WORD))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(Memory::new(64, 1 << 16)).unwrap()
    }

    #[test]
    fn test_bootstrap_roots() {
        let heap = heap();
        let roots = heap.roots;
        assert_eq!(heap.map_of(roots.meta_map).unwrap(), roots.meta_map);
        assert_eq!(heap.instance_type(roots.null).unwrap(), Some(ODDBALL_TYPE));
        assert_eq!(heap.prototype_of(roots.undefined).unwrap(), roots.null);
        assert_eq!(
            heap.instance_type(roots.global_object).unwrap(),
            Some(JS_GLOBAL_OBJECT_TYPE)
        );
        let global = heap
            .context_get(roots.global_context, CONTEXT_GLOBAL_INDEX)
            .unwrap();
        assert_eq!(global, roots.global_object);
    }

    #[test]
    fn test_numbers() {
        let mut heap = heap();
        assert_eq!(heap.number(21.0).unwrap(), 42);
        let big = heap.number(f64::from(1 << 30)).unwrap();
        assert!(!Heap::is_smi(big));
        assert_eq!(heap.number_value(big).unwrap(), Some(1_073_741_824.0));
        let negative_zero = heap.number(-0.0).unwrap();
        assert!(heap.number_value(negative_zero).unwrap().unwrap().is_sign_negative());
    }

    #[test]
    fn test_strings_are_interned() {
        let mut heap = heap();
        let a = heap.intern("abc").unwrap();
        let b = heap.intern("abc").unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.string_value(a).unwrap().as_deref(), Some("abc"));
        assert_eq!(heap.string_value(42).unwrap(), None);
    }

    #[test]
    fn test_objects_with_same_shape_share_maps() {
        let mut heap = heap();
        let proto = heap.roots.object_prototype;
        let x = heap.intern("x").unwrap();
        let first = heap.new_object(proto).unwrap();
        let second = heap.new_object(proto).unwrap();
        heap.add_property(first, x, smi(1) as u32, 0).unwrap();
        heap.add_property(second, x, smi(2) as u32, 0).unwrap();
        assert_eq!(heap.map_of(first).unwrap(), heap.map_of(second).unwrap());
        let (index, _) = heap.find_own(second, x).unwrap().unwrap();
        assert_eq!(heap.own_value(second, index).unwrap(), smi(2) as u32);
    }

    #[test]
    fn test_delete_gives_private_map() {
        let mut heap = heap();
        let proto = heap.roots.object_prototype;
        let object = heap.new_object(proto).unwrap();
        let names: Vec<u32> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|n| heap.intern(n).unwrap())
            .collect();
        for (value, name) in names.iter().enumerate() {
            heap.add_property(object, *name, smi(value as i32) as u32, 0).unwrap();
        }
        let shared = heap.map_of(object).unwrap();
        heap.delete_own(object, 1).unwrap();
        let map = heap.map_of(object).unwrap();
        assert_ne!(map, shared);
        assert!(heap.is_dictionary_map(map).unwrap());
        assert_eq!(heap.find_own(object, names[1]).unwrap(), None);
        let (index, _) = heap.find_own(object, names[4]).unwrap().unwrap();
        assert_eq!(heap.own_value(object, index).unwrap(), smi(4) as u32);
    }

    #[test]
    fn test_elements_grow_and_update_length() {
        let mut heap = heap();
        let array = heap.new_array(&[]).unwrap();
        heap.set_element(array, 3, smi(9) as u32).unwrap();
        assert_eq!(heap.array_length(array).unwrap(), 4);
        assert_eq!(heap.element(array, 1).unwrap(), None);
        assert_eq!(heap.element(array, 3).unwrap(), Some(smi(9) as u32));
        assert_eq!(heap.element_indices(array).unwrap(), vec![3]);
        heap.set_array_length(array, 2).unwrap();
        assert_eq!(heap.element(array, 3).unwrap(), None);
    }

    #[test]
    fn test_heap_exhaustion_is_reported() {
        let mut heap = Heap::new(Memory::new(16, 512)).unwrap();
        let result = (0..1000).try_for_each(|_| heap.new_fixed_array(16, 0).map(drop));
        assert!(matches!(result, Err(Error::Simulator(_))));
    }
}
