use std::fmt;

use serde::Serialize;

use super::{Condition, MemOperand, Opcode, Operand, Reg};
use crate::runtime::{CallTarget, CodeStub, IcKind};

/// Two-operand data-processing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AluOp {
    Add,
    Sub,
    /// Reverse subtract: `dst = rhs - lhs`.
    Rsb,
    And,
    Orr,
    Eor,
    /// Bit clear: `dst = lhs & !rhs`.
    Bic,
}

impl AluOp {
    #[must_use]
    pub const fn opcode(self) -> Opcode {
        match self {
            Self::Add => Opcode::Add,
            Self::Sub => Opcode::Sub,
            Self::Rsb => Opcode::Rsb,
            Self::And => Opcode::And,
            Self::Orr => Opcode::Orr,
            Self::Eor => Opcode::Eor,
            Self::Bic => Opcode::Bic,
        }
    }

    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Rsb => "rsb",
            Self::And => "and",
            Self::Orr => "orr",
            Self::Eor => "eor",
            Self::Bic => "bic",
        }
    }

    /// Arithmetic operations update C and V; logical ones only N and Z.
    #[must_use]
    pub const fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Rsb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Instruction {
    Stop,
    Mov {
        dst: Reg,
        src: Operand,
    },
    Mvn {
        dst: Reg,
        src: Operand,
    },
    Alu {
        op: AluOp,
        set_flags: bool,
        dst: Reg,
        lhs: Reg,
        rhs: Operand,
    },
    Cmp {
        lhs: Reg,
        rhs: Operand,
    },
    Tst {
        lhs: Reg,
        rhs: Operand,
    },
    Ldr {
        dst: Reg,
        mem: MemOperand,
    },
    Str {
        src: Reg,
        mem: MemOperand,
    },
    /// Load entry `index` of the code object's constant pool.
    LoadConstant {
        dst: Reg,
        index: u32,
    },
    Push {
        src: Reg,
    },
    Pop {
        dst: Reg,
    },
    /// Branch to `pc + offset` (in instructions) when `cond` holds.
    Branch {
        cond: Condition,
        offset: i32,
    },
    /// Branch to `pc + offset`, setting `lr` to `pc + 1`.
    BranchLink {
        offset: i32,
    },
    /// Branch to the address in `reg`.
    BranchReg {
        reg: Reg,
    },
    /// Dispatch on the smi in `index`: continue at `pc + 1 + index`.
    /// A table of unconditional branches follows.
    JumpTable {
        index: Reg,
    },
    Call {
        target: CallTarget,
    },
    /// Record a pointer store into `object` at byte offset `offset` for the
    /// collector. Clobbers `offset` and `scratch`.
    RecordWrite {
        object: Reg,
        offset: Reg,
        scratch: Reg,
    },
}

impl Instruction {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Stop => Opcode::Stop,
            Self::Mov { .. } => Opcode::Mov,
            Self::Mvn { .. } => Opcode::Mvn,
            Self::Alu { op, .. } => op.opcode(),
            Self::Cmp { .. } => Opcode::Cmp,
            Self::Tst { .. } => Opcode::Tst,
            Self::Ldr { .. } => Opcode::Ldr,
            Self::Str { .. } => Opcode::Str,
            Self::LoadConstant { .. } => Opcode::LoadConstant,
            Self::Push { .. } => Opcode::Push,
            Self::Pop { .. } => Opcode::Pop,
            Self::Branch { .. } => Opcode::Branch,
            Self::BranchLink { .. } => Opcode::BranchLink,
            Self::BranchReg { .. } => Opcode::BranchReg,
            Self::JumpTable { .. } => Opcode::JumpTable,
            Self::Call { .. } => Opcode::Call,
            Self::RecordWrite { .. } => Opcode::RecordWrite,
        }
    }

    /// Whether control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            Self::Stop
                | Self::Branch {
                    cond: Condition::Al,
                    ..
                }
                | Self::BranchReg { .. }
                | Self::JumpTable { .. }
        )
    }

    /// Whether the instruction writes the condition flags.
    #[must_use]
    pub fn sets_flags(&self) -> bool {
        match self {
            Self::Alu { set_flags, .. } => *set_flags,
            Self::Cmp { .. } | Self::Tst { .. } | Self::Call { .. } => true,
            _ => false,
        }
    }

    /// Branch displacement, for instructions that carry one.
    #[must_use]
    pub fn branch_offset(&self) -> Option<i32> {
        match self {
            Self::Branch { offset, .. } | Self::BranchLink { offset } => Some(*offset),
            _ => None,
        }
    }

    pub fn set_branch_offset(&mut self, new_offset: i32) {
        match self {
            Self::Branch { offset, .. } | Self::BranchLink { offset } => *offset = new_offset,
            _ => {}
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.opcode() as u8];
        match self {
            Self::Stop => {}
            Self::Mov { dst, src } | Self::Mvn { dst, src } => {
                bytes.push(dst.code());
                encode_operand(&mut bytes, *src);
            }
            Self::Alu {
                set_flags,
                dst,
                lhs,
                rhs,
                ..
            } => {
                bytes.push(u8::from(*set_flags));
                bytes.push(dst.code());
                bytes.push(lhs.code());
                encode_operand(&mut bytes, *rhs);
            }
            Self::Cmp { lhs, rhs } | Self::Tst { lhs, rhs } => {
                bytes.push(lhs.code());
                encode_operand(&mut bytes, *rhs);
            }
            Self::Ldr { dst: reg, mem } | Self::Str { src: reg, mem } => {
                bytes.push(reg.code());
                encode_mem(&mut bytes, *mem);
            }
            Self::LoadConstant { dst, index } => {
                bytes.push(dst.code());
                bytes.extend_from_slice(&index.to_le_bytes());
            }
            Self::Push { src: reg } | Self::Pop { dst: reg } | Self::BranchReg { reg } => {
                bytes.push(reg.code());
            }
            Self::JumpTable { index } => bytes.push(index.code()),
            Self::Branch { cond, offset } => {
                bytes.push(*cond as u8);
                bytes.extend_from_slice(&offset.to_le_bytes());
            }
            Self::BranchLink { offset } => bytes.extend_from_slice(&offset.to_le_bytes()),
            Self::Call { target } => encode_call_target(&mut bytes, *target),
            Self::RecordWrite {
                object,
                offset,
                scratch,
            } => {
                bytes.extend_from_slice(&[object.code(), offset.code(), scratch.code()]);
            }
        }
        bytes
    }
}

fn encode_operand(bytes: &mut Vec<u8>, operand: Operand) {
    match operand {
        Operand::Imm(value) => {
            bytes.push(0);
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Operand::Reg(reg) => bytes.extend_from_slice(&[1, reg.code()]),
        Operand::Shifted { reg, shift, amount } => {
            bytes.extend_from_slice(&[2, reg.code(), shift as u8, amount]);
        }
    }
}

fn encode_mem(bytes: &mut Vec<u8>, mem: MemOperand) {
    match mem {
        MemOperand::Offset { base, offset } => {
            bytes.extend_from_slice(&[0, base.code()]);
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        MemOperand::Indexed { base, index, shift } => {
            bytes.extend_from_slice(&[1, base.code(), index.code(), shift]);
        }
    }
}

fn encode_call_target(bytes: &mut Vec<u8>, target: CallTarget) {
    match target {
        CallTarget::Runtime(function) => bytes.extend_from_slice(&[0, function as u8]),
        CallTarget::Builtin(builtin) => bytes.extend_from_slice(&[1, builtin as u8]),
        CallTarget::Stub(stub) => {
            bytes.push(2);
            match stub {
                CodeStub::GenericBinaryOp(op) => bytes.extend_from_slice(&[0, op as u8]),
                CodeStub::UnarySub => bytes.push(1),
                CodeStub::CallFunction { argc } => {
                    bytes.push(2);
                    bytes.extend_from_slice(&argc.to_le_bytes());
                }
                CodeStub::StackCheck => bytes.push(3),
            }
        }
        CallTarget::Ic(ic) => {
            bytes.push(3);
            match ic {
                IcKind::Load { contextual } => bytes.extend_from_slice(&[0, u8::from(contextual)]),
                IcKind::KeyedLoad => bytes.push(1),
                IcKind::Store => bytes.push(2),
                IcKind::KeyedStore => bytes.push(3),
                IcKind::Call { argc, contextual } => {
                    bytes.push(4);
                    bytes.extend_from_slice(&argc.to_le_bytes());
                    bytes.push(u8::from(contextual));
                }
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("stop"),
            Self::Mov { dst, src } => write!(f, "mov {dst}, {src}"),
            Self::Mvn { dst, src } => write!(f, "mvn {dst}, {src}"),
            Self::Alu {
                op,
                set_flags,
                dst,
                lhs,
                rhs,
            } => {
                let s = if *set_flags { "s" } else { "" };
                write!(f, "{}{s} {dst}, {lhs}, {rhs}", op.mnemonic())
            }
            Self::Cmp { lhs, rhs } => write!(f, "cmp {lhs}, {rhs}"),
            Self::Tst { lhs, rhs } => write!(f, "tst {lhs}, {rhs}"),
            Self::Ldr { dst, mem } => write!(f, "ldr {dst}, {mem}"),
            Self::Str { src, mem } => write!(f, "str {src}, {mem}"),
            Self::LoadConstant { dst, index } => write!(f, "ldr {dst}, =const[{index}]"),
            Self::Push { src } => write!(f, "push {src}"),
            Self::Pop { dst } => write!(f, "pop {dst}"),
            Self::Branch { cond, offset } => write!(f, "b{} {offset:+}", cond.suffix()),
            Self::BranchLink { offset } => write!(f, "bl {offset:+}"),
            Self::BranchReg { reg } => write!(f, "bx {reg}"),
            Self::JumpTable { index } => write!(f, "jt {index}"),
            Self::Call { target } => write!(f, "call {target}"),
            Self::RecordWrite {
                object,
                offset,
                scratch,
            } => write!(f, "recordwrite {object}, {offset}, {scratch}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeFunction;

    #[test]
    fn test_encode_starts_with_opcode() {
        let instructions = [
            Instruction::Stop,
            Instruction::Mov {
                dst: Reg::R0,
                src: Operand::Imm(-2),
            },
            Instruction::Alu {
                op: AluOp::Add,
                set_flags: true,
                dst: Reg::R1,
                lhs: Reg::R1,
                rhs: Operand::smi(1),
            },
            Instruction::Call {
                target: CallTarget::Runtime(RuntimeFunction::Throw),
            },
        ];
        for instr in &instructions {
            assert_eq!(instr.encode()[0], instr.opcode() as u8);
        }
    }

    #[test]
    fn test_encode_immediate_little_endian() {
        let bytes = Instruction::Mov {
            dst: Reg::R2,
            src: Operand::Imm(0x0102_0304),
        }
        .encode();
        assert_eq!(bytes, vec![Opcode::Mov as u8, 2, 0, 4, 3, 2, 1]);
    }

    #[test]
    fn test_display_forms() {
        let add = Instruction::Alu {
            op: AluOp::Add,
            set_flags: true,
            dst: Reg::R0,
            lhs: Reg::R0,
            rhs: Operand::smi(1),
        };
        assert_eq!(add.to_string(), "adds r0, r0, #2");
        let branch = Instruction::Branch {
            cond: Condition::Vs,
            offset: -3,
        };
        assert_eq!(branch.to_string(), "bvs -3");
        let load = Instruction::Ldr {
            dst: Reg::R1,
            mem: MemOperand::new(Reg::FP, -12),
        };
        assert_eq!(load.to_string(), "ldr r1, [fp, #-12]");
    }

    #[test]
    fn test_terminators() {
        assert!(
            Instruction::Branch {
                cond: Condition::Al,
                offset: 1
            }
            .is_terminating()
        );
        assert!(
            !Instruction::Branch {
                cond: Condition::Eq,
                offset: 1
            }
            .is_terminating()
        );
        assert!(Instruction::BranchReg { reg: Reg::LR }.is_terminating());
    }
}
