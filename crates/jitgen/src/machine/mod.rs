//! The target machine: a 32-bit register machine with condition flags.

mod assembler;
mod code;
mod instruction;
mod opcode;
mod operand;

pub use assembler::{Label, MacroAssembler, words_to_bytes};
pub use code::{Code, Constant, FunctionMetadata, RelocInfo, RelocMode};
pub use instruction::{AluOp, Instruction};
pub use opcode::Opcode;
pub use operand::{Condition, MemOperand, Operand, Reg, Shift};
