//! Contracts of the collaborators invoked by emitted code.
//!
//! Calling conventions:
//!
//! - Runtime functions and builtins take their arguments on the stack, pushed
//!   left to right. The callee pops them and returns its result in `r0`.
//!   [`RuntimeFunction::LoadContextSlot`] and its no-reference-error variant
//!   additionally return the receiver in `r1`.
//! - Code stubs and inline caches use the register conventions documented on
//!   each variant. Every call clobbers `r0..r7` and `ip`; `cp` is preserved by
//!   everything except calls into JS functions.

use serde::Serialize;

use crate::ast::BinaryOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum RuntimeFunction {
    /// `(pairs, context, is_eval)`: declare global variables and functions.
    DeclareGlobals,
    /// `(context, name, attributes, value)`; value 0 means "no initial value".
    DeclareContextSlot,
    /// `(function)`: allocate a function context and make it current (`cp`).
    NewContext,
    /// `(object)`: enter a `with` context; sets `cp`.
    PushContext,
    /// `(extension)`: enter a catch context; sets `cp`.
    PushCatchContext,
    Throw,
    ReThrow,
    TraceEnter,
    /// `(value)`: returns its argument.
    TraceExit,
    DebugBreak,
    /// `(context, boilerplate)`.
    NewClosure,
    /// `(literals, index, pattern, flags)`.
    MaterializeRegExpLiteral,
    /// `(literals, index, constant_properties)`.
    CreateObjectLiteralBoilerplate,
    /// `(literals, index, constant_elements)`.
    CreateArrayLiteralBoilerplate,
    CloneLiteralBoilerplate,
    CloneShallowLiteralBoilerplate,
    /// `(context, name)`: returns value in `r0` and receiver in `r1`.
    LoadContextSlot,
    LoadContextSlotNoReferenceError,
    /// `(value, context, name)`.
    StoreContextSlot,
    /// `(value, context, name)`.
    InitializeConstContextSlot,
    /// `(context, name)`: the object holding `name`.
    LookupContext,
    /// `(function, first_argument)`: a fixed array `[function, receiver]`.
    ResolvePossiblyDirectEval,
    /// `(object)`: the object's map when its enum cache is usable, otherwise a
    /// fixed array of names.
    GetPropertyNamesFast,
    NumberToSmi,
    NumberAdd,
    NumberSub,
    Typeof,
    StackGuard,
    /// `(key, value)`: an object with one property.
    CreateCatchExtensionObject,
    /// `(name)`.
    ThrowReferenceError,
    /// `(message)`.
    ThrowTypeError,
    /// `(object, key, value)`.
    SetProperty,
    /// `(object, key, 0 getter / 1 setter, function)`.
    DefineAccessor,
    /// `(function)`: arguments object of the current invocation.
    NewArguments,
    ToBool,
}

impl RuntimeFunction {
    /// Number of stack arguments the function pops.
    #[must_use]
    pub fn argument_count(self) -> usize {
        match self {
            Self::TraceEnter | Self::DebugBreak | Self::StackGuard => 0,
            Self::NewContext
            | Self::PushContext
            | Self::PushCatchContext
            | Self::Throw
            | Self::ReThrow
            | Self::TraceExit
            | Self::CloneLiteralBoilerplate
            | Self::CloneShallowLiteralBoilerplate
            | Self::GetPropertyNamesFast
            | Self::NumberToSmi
            | Self::Typeof
            | Self::ThrowReferenceError
            | Self::ThrowTypeError
            | Self::NewArguments
            | Self::ToBool => 1,
            Self::NewClosure
            | Self::LoadContextSlot
            | Self::LoadContextSlotNoReferenceError
            | Self::LookupContext
            | Self::ResolvePossiblyDirectEval
            | Self::NumberAdd
            | Self::NumberSub
            | Self::CreateCatchExtensionObject => 2,
            Self::DeclareGlobals
            | Self::CreateObjectLiteralBoilerplate
            | Self::CreateArrayLiteralBoilerplate
            | Self::StoreContextSlot
            | Self::InitializeConstContextSlot
            | Self::SetProperty => 3,
            Self::DeclareContextSlot | Self::MaterializeRegExpLiteral | Self::DefineAccessor => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Builtin {
    /// `(x, y)`: smi 0 when loosely equal.
    Equals,
    /// `(x, y)`: smi 0 when strictly equal.
    StrictEquals,
    /// `(x, y, ncr)`: smi -1, 0 or 1; `ncr` when either side is NaN.
    Compare,
    UnaryMinus,
    BitNot,
    ToNumber,
    ToObject,
    /// `(object, key)`: `key`, or null if it is no longer a property.
    FilterKey,
    /// `(key, object)`: a boolean.
    In,
    /// `(object, function)`: smi 0 when `object` is an instance.
    InstanceOf,
    /// `(object, key)`.
    Delete,
    /// Stack `[function, receiver, args...]`, `r0` = argc, `r1` = function.
    /// Pops the receiver and the arguments.
    JsConstructCall,
}

impl Builtin {
    /// Number of stack arguments the builtin pops (excluding the construct call,
    /// whose count travels in `r0`).
    #[must_use]
    pub fn argument_count(self) -> usize {
        match self {
            Self::UnaryMinus | Self::BitNot | Self::ToNumber | Self::ToObject => 1,
            Self::Compare => 3,
            Self::JsConstructCall => 0,
            Self::Equals
            | Self::StrictEquals
            | Self::FilterKey
            | Self::In
            | Self::InstanceOf
            | Self::Delete => 2,
        }
    }
}

/// Result a relational comparison reports when an operand is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaNCompareResult {
    Less = -1,
    Greater = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CodeStub {
    /// `r1` op `r0` with full language semantics; result in `r0`.
    GenericBinaryOp(BinaryOp),
    /// `-r0`; result in `r0`.
    UnarySub,
    /// Stack `[function, receiver, args...]`. Pops receiver and arguments and
    /// calls `function` with them; result in `r0`.
    CallFunction { argc: u16 },
    /// Calls the stack guard runtime.
    StackCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IcKind {
    /// `r2` = name, `[sp]` = receiver (not popped); result in `r0`.
    /// A contextual load throws a reference error for a missing property.
    Load { contextual: bool },
    /// `[sp]` = key, `[sp + 4]` = receiver (not popped); result in `r0`.
    KeyedLoad,
    /// `r0` = value, `r2` = name, `[sp]` = receiver (not popped).
    Store,
    /// `r0` = value, `[sp]` = key, `[sp + 4]` = receiver (not popped).
    KeyedStore,
    /// Stack `[name, receiver, args...]`. Looks the name up on the receiver,
    /// overwrites the name slot with the function and pops receiver and
    /// arguments; result in `r0`.
    Call { argc: u16, contextual: bool },
}

/// Anything a `call` instruction can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallTarget {
    Runtime(RuntimeFunction),
    Builtin(Builtin),
    Stub(CodeStub),
    Ic(IcKind),
}

impl std::fmt::Display for CallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runtime(function) => write!(f, "Runtime::{function:?}"),
            Self::Builtin(builtin) => write!(f, "Builtins::{builtin:?}"),
            Self::Stub(CodeStub::GenericBinaryOp(op)) => {
                write!(f, "GenericBinaryOpStub({})", op.as_str())
            }
            Self::Stub(CodeStub::CallFunction { argc }) => write!(f, "CallFunctionStub({argc})"),
            Self::Stub(stub) => write!(f, "{stub:?}Stub"),
            Self::Ic(IcKind::Call { argc, .. }) => write!(f, "CallIC({argc})"),
            Self::Ic(ic) => write!(f, "{ic:?}IC"),
        }
    }
}

/// Property attributes passed to `DeclareContextSlot`.
pub const ATTRIBUTES_NONE: i32 = 0;
pub const ATTRIBUTES_READ_ONLY: i32 = 1;
