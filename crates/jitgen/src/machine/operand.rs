use std::fmt;

use serde::Serialize;

/// A machine register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Reg(pub u8);

impl Reg {
    pub const R0: Reg = Reg(0);
    pub const R1: Reg = Reg(1);
    pub const R2: Reg = Reg(2);
    pub const R3: Reg = Reg(3);
    pub const R4: Reg = Reg(4);
    pub const R5: Reg = Reg(5);
    pub const R6: Reg = Reg(6);
    pub const R7: Reg = Reg(7);
    /// Current context.
    pub const CP: Reg = Reg(8);
    pub const R9: Reg = Reg(9);
    pub const R10: Reg = Reg(10);
    /// Frame pointer.
    pub const FP: Reg = Reg(11);
    /// Scratch register; never allocated, clobbered by macro sequences.
    pub const IP: Reg = Reg(12);
    /// Stack pointer; the stack grows down.
    pub const SP: Reg = Reg(13);
    /// Link register.
    pub const LR: Reg = Reg(14);

    /// Number of architectural registers.
    pub const COUNT: usize = 15;

    /// Number of registers handed out by the register allocator (`r0..r7`).
    pub const NUM_ALLOCATABLE: usize = 8;

    #[must_use]
    pub const fn code(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn is_allocatable(self) -> bool {
        (self.0 as usize) < Self::NUM_ALLOCATABLE
    }

    /// The `i`-th allocatable register.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn allocatable(i: usize) -> Reg {
        Reg(i as u8)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CP => f.write_str("cp"),
            Self::FP => f.write_str("fp"),
            Self::IP => f.write_str("ip"),
            Self::SP => f.write_str("sp"),
            Self::LR => f.write_str("lr"),
            Reg(n) => write!(f, "r{n}"),
        }
    }
}

/// Condition evaluated against the N, Z, C and V flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Condition {
    Eq = 0,
    Ne = 1,
    /// Unsigned higher or same (carry set).
    Hs = 2,
    /// Unsigned lower (carry clear).
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Condition {
    /// The condition that holds exactly when `self` does not.
    ///
    /// `al` has no negation and maps to itself.
    #[must_use]
    pub const fn negate(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Hs => Self::Lo,
            Self::Lo => Self::Hs,
            Self::Mi => Self::Pl,
            Self::Pl => Self::Mi,
            Self::Vs => Self::Vc,
            Self::Vc => Self::Vs,
            Self::Hi => Self::Ls,
            Self::Ls => Self::Hi,
            Self::Ge => Self::Lt,
            Self::Lt => Self::Ge,
            Self::Gt => Self::Le,
            Self::Le => Self::Gt,
            Self::Al => Self::Al,
        }
    }

    /// The condition to use when the comparison operands are swapped.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Gt => Self::Lt,
            Self::Le => Self::Ge,
            Self::Ge => Self::Le,
            Self::Lo => Self::Hi,
            Self::Hi => Self::Lo,
            Self::Ls => Self::Hs,
            Self::Hs => Self::Ls,
            other => other,
        }
    }

    /// Evaluates the condition.
    #[must_use]
    pub const fn holds(self, n: bool, z: bool, c: bool, v: bool) -> bool {
        match self {
            Self::Eq => z,
            Self::Ne => !z,
            Self::Hs => c,
            Self::Lo => !c,
            Self::Mi => n,
            Self::Pl => !n,
            Self::Vs => v,
            Self::Vc => !v,
            Self::Hi => c && !z,
            Self::Ls => !c || z,
            Self::Ge => n == v,
            Self::Lt => n != v,
            Self::Gt => !z && n == v,
            Self::Le => z || n != v,
            Self::Al => true,
        }
    }

    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Hs => "hs",
            Self::Lo => "lo",
            Self::Mi => "mi",
            Self::Pl => "pl",
            Self::Vs => "vs",
            Self::Vc => "vc",
            Self::Hi => "hi",
            Self::Ls => "ls",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Al => "",
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Eq,
            1 => Self::Ne,
            2 => Self::Hs,
            3 => Self::Lo,
            4 => Self::Mi,
            5 => Self::Pl,
            6 => Self::Vs,
            7 => Self::Vc,
            8 => Self::Hi,
            9 => Self::Ls,
            10 => Self::Ge,
            11 => Self::Lt,
            12 => Self::Gt,
            13 => Self::Le,
            14 => Self::Al,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Shift {
    Lsl = 0,
    Lsr = 1,
    Asr = 2,
}

impl Shift {
    /// Applies the shift with ARM semantics for amounts of 32 and above.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub const fn apply(self, value: u32, amount: u32) -> u32 {
        match self {
            Self::Lsl => {
                if amount >= 32 {
                    0
                } else {
                    value << amount
                }
            }
            Self::Lsr => {
                if amount >= 32 {
                    0
                } else {
                    value >> amount
                }
            }
            Self::Asr => {
                let amount = if amount >= 32 { 31 } else { amount };
                ((value as i32) >> amount) as u32
            }
        }
    }

    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Lsl => "lsl",
            Self::Lsr => "lsr",
            Self::Asr => "asr",
        }
    }
}

/// Flexible second operand of data-processing instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operand {
    Imm(i32),
    Reg(Reg),
    /// `reg` shifted by a constant amount.
    Shifted { reg: Reg, shift: Shift, amount: u8 },
}

impl Operand {
    #[must_use]
    pub const fn imm(value: i32) -> Self {
        Self::Imm(value)
    }

    /// A tagged small integer immediate.
    #[must_use]
    pub const fn smi(value: i32) -> Self {
        Self::Imm(crate::layout::smi(value))
    }
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Self::Reg(reg)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imm(value) => write!(f, "#{value}"),
            Self::Reg(reg) => write!(f, "{reg}"),
            Self::Shifted { reg, shift, amount } => {
                write!(f, "{reg}, {} #{amount}", shift.mnemonic())
            }
        }
    }
}

/// Memory addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemOperand {
    /// `[base, #offset]`
    Offset { base: Reg, offset: i32 },
    /// `[base, index, lsl #shift]`
    Indexed { base: Reg, index: Reg, shift: u8 },
}

impl MemOperand {
    #[must_use]
    pub const fn new(base: Reg, offset: i32) -> Self {
        Self::Offset { base, offset }
    }

    /// Field `offset` of the tagged heap object in `object`.
    #[must_use]
    pub const fn field(object: Reg, offset: i32) -> Self {
        Self::Offset {
            base: object,
            offset: crate::layout::field(offset),
        }
    }

    /// Slot `index` of the context in `context`.
    #[must_use]
    pub const fn context(context: Reg, index: usize) -> Self {
        Self::Offset {
            base: context,
            offset: crate::layout::context_slot(index),
        }
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset { base, offset: 0 } => write!(f, "[{base}]"),
            Self::Offset { base, offset } => write!(f, "[{base}, #{offset}]"),
            Self::Indexed {
                base,
                index,
                shift: 0,
            } => write!(f, "[{base}, {index}]"),
            Self::Indexed { base, index, shift } => write!(f, "[{base}, {index}, lsl #{shift}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negate_is_involution() {
        for code in 0..14 {
            let cond = Condition::from_code(code).unwrap();
            assert_eq!(cond.negate().negate(), cond);
            assert_ne!(cond.negate(), cond);
        }
    }

    #[test]
    fn test_reverse_swaps_order() {
        assert_eq!(Condition::Gt.reverse(), Condition::Lt);
        assert_eq!(Condition::Le.reverse(), Condition::Ge);
        assert_eq!(Condition::Eq.reverse(), Condition::Eq);
    }

    #[test]
    fn test_shift_semantics() {
        assert_eq!(Shift::Lsl.apply(1, 31), 0x8000_0000);
        assert_eq!(Shift::Lsl.apply(1, 32), 0);
        assert_eq!(Shift::Lsr.apply(0x8000_0000, 31), 1);
        assert_eq!(Shift::Asr.apply(0x8000_0000, 31), 0xFFFF_FFFF);
        assert_eq!(Shift::Asr.apply(0x8000_0000, 40), 0xFFFF_FFFF);
    }

    #[test]
    fn test_register_names() {
        assert_eq!(Reg::R3.to_string(), "r3");
        assert_eq!(Reg::CP.to_string(), "cp");
        assert_eq!(Reg::SP.to_string(), "sp");
        assert!(Reg::R7.is_allocatable());
        assert!(!Reg::CP.is_allocatable());
    }
}
