use std::fmt;
use std::rc::Rc;

use serde::{Serialize, Serializer};

use super::Instruction;
use crate::ast::FunctionLiteral;

/// A value embedded in a code object's constant pool.
///
/// Constants are symbolic: the runtime materializes each one into a heap
/// value when the code object is installed.
#[derive(Debug, Clone)]
pub enum Constant {
    Smi(i32),
    Number(f64),
    String(Rc<str>),
    Undefined,
    Null,
    True,
    False,
    TheHole,
    HeapNumberMap,
    MetaMap,
    /// Boilerplate of a nested function.
    Function(Rc<FunctionLiteral>),
    /// A fixed array of constants.
    Array(Rc<[Constant]>),
    /// A literal object boilerplate description (`key, value` pairs).
    ObjectDescription(Rc<[Constant]>),
}

impl Constant {
    #[must_use]
    pub fn string(value: &str) -> Self {
        Self::String(Rc::from(value))
    }

    #[must_use]
    pub fn as_smi(&self) -> Option<i32> {
        match self {
            Self::Smi(value) => Some(*value),
            _ => None,
        }
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Smi(a), Self::Smi(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Array(a), Self::Array(b))
            | (Self::ObjectDescription(a), Self::ObjectDescription(b)) => a == b,
            (Self::Undefined, Self::Undefined)
            | (Self::Null, Self::Null)
            | (Self::True, Self::True)
            | (Self::False, Self::False)
            | (Self::TheHole, Self::TheHole)
            | (Self::HeapNumberMap, Self::HeapNumberMap)
            | (Self::MetaMap, Self::MetaMap) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smi(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value:?}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::True => f.write_str("true"),
            Self::False => f.write_str("false"),
            Self::TheHole => f.write_str("<the hole>"),
            Self::HeapNumberMap => f.write_str("<heap number map>"),
            Self::MetaMap => f.write_str("<meta map>"),
            Self::Function(literal) => write!(f, "<function {}>", literal.name),
            Self::Array(items) => write!(f, "<fixed array[{}]>", items.len()),
            Self::ObjectDescription(items) => {
                write!(f, "<object boilerplate[{}]>", items.len() / 2)
            }
        }
    }
}

impl Serialize for Constant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Kinds of relocation information recorded for a code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelocMode {
    CodeTarget,
    /// Call target whose name must resolve (global load or call).
    CodeTargetContext,
    RuntimeEntry,
    EmbeddedObject,
    /// Expression source position.
    Position,
    StatementPosition,
    ConstructCall,
    JsReturn,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelocInfo {
    /// Instruction index the entry refers to.
    pub pc: usize,
    pub mode: RelocMode,
    /// Source position, constant index, or 0.
    pub data: u32,
}

/// Metadata attached to the function the code belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionMetadata {
    pub name: String,
    pub parameter_count: usize,
    pub literal_count: usize,
    pub expected_property_count: usize,
    pub start_position: u32,
    pub end_position: u32,
    pub is_expression: bool,
}

/// A finished machine-code object.
#[derive(Debug, Clone, Serialize)]
pub struct Code {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub relocations: Vec<RelocInfo>,
    pub comments: Vec<(usize, String)>,
    pub metadata: FunctionMetadata,
}

impl Code {
    /// Binary encoding of the instruction stream.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.instructions.iter().flat_map(Instruction::encode).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Relocation entries of the given mode.
    pub fn relocations_of(&self, mode: RelocMode) -> impl Iterator<Item = &RelocInfo> {
        self.relocations.iter().filter(move |r| r.mode == mode)
    }

    /// Human-readable listing with absolute branch targets, constants and comments.
    #[must_use]
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "; function {} ({} params, {} literals)",
            self.metadata.name, self.metadata.parameter_count, self.metadata.literal_count
        );
        let mut comments = self.comments.iter().peekable();
        for (pc, instr) in self.instructions.iter().enumerate() {
            while let Some((at, text)) = comments.peek() {
                if *at > pc {
                    break;
                }
                let _ = writeln!(out, "      ;; {text}");
                comments.next();
            }
            let _ = write!(out, "{pc:5}: ");
            match instr {
                Instruction::Branch { cond, offset } => {
                    let _ = write!(out, "b{} {}", cond.suffix(), target_of(pc, *offset));
                }
                Instruction::BranchLink { offset } => {
                    let _ = write!(out, "bl {}", target_of(pc, *offset));
                }
                Instruction::LoadConstant { dst, index } => {
                    let shown = self
                        .constants
                        .get(*index as usize)
                        .map_or_else(|| "?".to_string(), ToString::to_string);
                    let _ = write!(out, "ldr {dst}, ={shown}");
                }
                other => {
                    let _ = write!(out, "{other}");
                }
            }
            out.push('\n');
        }
        out
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn target_of(pc: usize, offset: i32) -> usize {
    (pc as i64 + i64::from(offset)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_equality_is_bitwise_for_numbers() {
        assert_eq!(Constant::Number(f64::NAN), Constant::Number(f64::NAN));
        assert_ne!(Constant::Number(0.0), Constant::Number(-0.0));
        assert_ne!(Constant::Smi(1), Constant::Number(1.0));
        assert_eq!(Constant::string("a"), Constant::string("a"));
    }

    #[test]
    fn test_constant_display() {
        assert_eq!(Constant::Smi(7).to_string(), "7");
        assert_eq!(Constant::string("x").to_string(), "\"x\"");
        assert_eq!(Constant::TheHole.to_string(), "<the hole>");
    }
}
