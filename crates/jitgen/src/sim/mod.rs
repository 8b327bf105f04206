//! A simulator that executes generated code.
//!
//! The simulator provides everything emitted code expects from its
//! surroundings: a word-addressed memory with a stack and a heap, the
//! external reference cells, and implementations of the runtime functions,
//! builtins, code stubs and inline caches the code calls. Functions are
//! compiled lazily the first time they are called.
//!
//! ```
//! use jitgen::CompileOptions;
//! use jitgen::sim::{Simulator, SimulatorOptions, Value};
//!
//! let mut sim = Simulator::new(SimulatorOptions::default(), CompileOptions::default()).unwrap();
//! let result = sim.eval("function f(x) { return x + 1; } f(41)").unwrap();
//! assert_eq!(result, Value::Number(42.0));
//! ```

mod builtins;
mod calls;
pub mod convert;
mod cpu;
pub mod heap;
pub mod memory;
mod runtime;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::ast::FunctionLiteral;
use crate::machine::Code;
use crate::{CompileOptions, Error, Result};
use heap::Heap;
use memory::{Memory, STACK_BOTTOM};

pub use calls::Native;

/// Address of instruction 0 of code object 0. Code object `id` occupies
/// `CODE_BASE + (id << 16)` onwards.
pub const CODE_BASE: u32 = 0x8000_0000;
const CODE_ID_SHIFT: u32 = 16;
const MAX_CODE_OBJECTS: usize = 0x7FF0;

/// Pseudo return address that unwinds an arguments adaptor frame.
pub const ADAPTOR_RETURN: u32 = 0xFFFF_FFE0;
/// Pseudo return address that finishes a construct call.
pub const CONSTRUCT_RETURN: u32 = 0xFFFF_FFD0;

/// Words kept free below the stack limit for runtime calls.
const STACK_LIMIT_MARGIN_WORDS: u32 = 1024;
/// Nesting bound for calls from the runtime back into JS code.
const MAX_NESTED_CALLS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorOptions {
    /// Instructions executed before the simulator gives up.
    pub step_limit: u64,
    /// Stack size in words.
    pub stack_words: usize,
    /// Heap size in words. The heap is never collected.
    pub heap_words: usize,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            step_limit: 10_000_000,
            stack_words: 1 << 16,
            heap_words: 1 << 20,
        }
    }
}

impl SimulatorOptions {
    #[must_use]
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    #[must_use]
    pub fn with_stack_words(mut self, words: usize) -> Self {
        self.stack_words = words;
        self
    }

    #[must_use]
    pub fn with_heap_words(mut self, words: usize) -> Self {
        self.heap_words = words;
        self
    }
}

/// A value as seen from outside the simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// An object, by its display string.
    Object(String),
    /// A function, by its name.
    Function(String),
}

impl Value {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Number(value) => f.write_str(&convert::number_to_string(*value)),
            Self::String(value) | Self::Object(value) => f.write_str(value),
            Self::Function(name) => write!(f, "function {name}() {{ [code] }}"),
        }
    }
}

/// Why execution stopped early.
#[derive(Debug)]
pub(crate) enum Trap {
    /// A JS exception carrying the thrown value.
    Throw(u32),
    Fault(Error),
}

impl From<Error> for Trap {
    fn from(error: Error) -> Self {
        Self::Fault(error)
    }
}

pub(crate) type Exec<T> = std::result::Result<T, Trap>;

/// Built-in error constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    ReferenceError,
    RangeError,
    SyntaxError,
    EvalError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        Self::Error,
        Self::TypeError,
        Self::ReferenceError,
        Self::RangeError,
        Self::SyntaxError,
        Self::EvalError,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::ReferenceError => "ReferenceError",
            Self::RangeError => "RangeError",
            Self::SyntaxError => "SyntaxError",
            Self::EvalError => "EvalError",
        }
    }
}

/// Code installed at a code address, with its materialized constant pool.
#[derive(Debug)]
struct Installed {
    code: Rc<Code>,
    constants: Vec<u32>,
}

/// An entry of the function table. Function boilerplates and closures
/// refer to entries by index.
#[derive(Debug)]
struct SharedFunction {
    kind: SharedKind,
    /// Installed code, once compiled.
    code: Option<usize>,
}

#[derive(Debug)]
enum SharedKind {
    Script(Rc<FunctionLiteral>),
    Native(Native),
}

/// Processor state.
#[derive(Debug, Clone, Default)]
struct Registers {
    regs: [u32; 15],
    pc: u32,
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

pub struct Simulator {
    options: SimulatorOptions,
    compile_options: CompileOptions,
    heap: Heap,
    cpu: Registers,
    codes: Vec<Installed>,
    functions: Vec<SharedFunction>,
    /// Function table index of each compiled literal, keyed by address.
    function_ids: HashMap<usize, usize>,
    /// Error prototypes, indexed like `ErrorKind::ALL`.
    error_prototypes: Vec<u32>,
    /// The global `eval` function.
    eval_function: u32,
    names: builtins::Names,
    steps: u64,
    nesting: usize,
    output: Vec<String>,
    trace: Vec<String>,
    remembered_set: BTreeSet<u32>,
}

impl fmt::Debug for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator")
            .field("options", &self.options)
            .field("codes", &self.codes.len())
            .field("functions", &self.functions.len())
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl Simulator {
    pub fn new(options: SimulatorOptions, compile_options: CompileOptions) -> Result<Self> {
        let memory = Memory::new(options.stack_words, options.heap_words);
        let heap = Heap::new(memory)?;
        let mut sim = Self {
            options,
            compile_options,
            heap,
            cpu: Registers::default(),
            codes: Vec::new(),
            functions: Vec::new(),
            function_ids: HashMap::new(),
            error_prototypes: Vec::new(),
            eval_function: 0,
            names: builtins::Names::default(),
            steps: 0,
            nesting: 0,
            output: Vec::new(),
            trace: Vec::new(),
            remembered_set: BTreeSet::new(),
        };
        sim.reset_stack();
        sim.install_globals()?;
        Ok(sim)
    }

    fn reset_stack(&mut self) {
        let top = self.heap.memory().stack_top();
        let limit = STACK_BOTTOM + STACK_LIMIT_MARGIN_WORDS * 4;
        let memory = self.heap.memory_mut();
        memory.set_handler(0);
        memory.set_stack_limit(limit.min(top));
        self.cpu = Registers::default();
        self.cpu.regs[crate::machine::Reg::SP.index()] = top;
        self.nesting = 0;
    }

    /// Runs a resolved program in the global context and returns its
    /// completion value.
    pub fn run(&mut self, program: &FunctionLiteral) -> Result<Value> {
        let program = Rc::new(program.clone());
        let result = self.run_program(&program);
        self.finish(result)
    }

    /// Parses, resolves and runs a script.
    #[cfg(feature = "frontend")]
    pub fn eval(&mut self, source: &str) -> Result<Value> {
        let program = crate::frontend::parse_program(source, crate::ast::ScopeKind::Global)?;
        self.run(&program)
    }

    /// Calls the global function `name`.
    pub fn call(&mut self, name: &str, arguments: &[Value]) -> Result<Value> {
        let result = self.call_global(name, arguments);
        self.finish(result)
    }

    /// Reads a property of the global object.
    pub fn global(&mut self, name: &str) -> Result<Value> {
        let result = self.read_global(name);
        self.finish(result)
    }

    fn finish(&mut self, result: Exec<u32>) -> Result<Value> {
        match result {
            Ok(word) => self.describe(word).map_err(|error| {
                self.reset_stack();
                error
            }),
            Err(Trap::Throw(value)) => {
                let message = self.describe_exception(value);
                self.reset_stack();
                tracing::debug!(%message, "uncaught exception");
                Err(Error::Thrown(message))
            }
            Err(Trap::Fault(error)) => {
                self.reset_stack();
                Err(error)
            }
        }
    }

    /// Lines written by `print`.
    #[must_use]
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Entries recorded by traced function entry and exit.
    #[must_use]
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    /// Addresses of the slots reported by write barriers.
    #[must_use]
    pub fn remembered_set(&self) -> &BTreeSet<u32> {
        &self.remembered_set
    }

    /// Code objects in installation order.
    pub fn compiled_codes(&self) -> impl Iterator<Item = &Code> {
        self.codes.iter().map(|installed| installed.code.as_ref())
    }

    /// Instructions executed so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn code_address(id: usize, index: usize) -> u32 {
        CODE_BASE + ((id as u32) << CODE_ID_SHIFT) + index as u32
    }

    fn decode_address(address: u32) -> Option<(usize, usize)> {
        if address < CODE_BASE || address >= ADAPTOR_RETURN.min(CONSTRUCT_RETURN) {
            return None;
        }
        let offset = address - CODE_BASE;
        Some((
            (offset >> CODE_ID_SHIFT) as usize,
            (offset & ((1 << CODE_ID_SHIFT) - 1)) as usize,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_addresses_roundtrip() {
        let address = Simulator::code_address(3, 17);
        assert_eq!(Simulator::decode_address(address), Some((3, 17)));
        assert_eq!(Simulator::decode_address(0x2000), None);
        assert_eq!(Simulator::decode_address(ADAPTOR_RETURN), None);
        assert_eq!(Simulator::decode_address(CONSTRUCT_RETURN), None);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Number(1.5).to_string(), "1.5");
        assert_eq!(Value::from("x").to_string(), "x");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Bool(true).to_string(), "true");
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: SimulatorOptions = serde_json::from_str(r#"{"step_limit": 5}"#).unwrap();
        assert_eq!(options.step_limit, 5);
        assert_eq!(options.stack_words, SimulatorOptions::default().stack_words);
    }
}
