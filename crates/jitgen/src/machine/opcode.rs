#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Stop = 0,
    Mov = 1,
    Mvn = 2,
    // Data processing (flag bit in the following byte)
    Add = 10,
    Sub = 11,
    Rsb = 12,
    And = 13,
    Orr = 14,
    Eor = 15,
    Bic = 16,
    // Comparison (always sets flags)
    Cmp = 20,
    Tst = 21,
    // Memory
    Ldr = 30,
    Str = 31,
    LoadConstant = 32,
    Push = 33,
    Pop = 34,
    // Control flow
    Branch = 40,
    BranchLink = 41,
    BranchReg = 42,
    JumpTable = 43,
    Call = 50,
    RecordWrite = 51,
}

impl Opcode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Stop,
            1 => Self::Mov,
            2 => Self::Mvn,
            10 => Self::Add,
            11 => Self::Sub,
            12 => Self::Rsb,
            13 => Self::And,
            14 => Self::Orr,
            15 => Self::Eor,
            16 => Self::Bic,
            20 => Self::Cmp,
            21 => Self::Tst,
            30 => Self::Ldr,
            31 => Self::Str,
            32 => Self::LoadConstant,
            33 => Self::Push,
            34 => Self::Pop,
            40 => Self::Branch,
            41 => Self::BranchLink,
            42 => Self::BranchReg,
            43 => Self::JumpTable,
            50 => Self::Call,
            51 => Self::RecordWrite,
            _ => return None,
        })
    }

    #[must_use]
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Self::Branch | Self::BranchLink | Self::BranchReg | Self::JumpTable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=u8::MAX {
            if let Some(opcode) = Opcode::from_u8(byte) {
                assert_eq!(opcode as u8, byte);
            }
        }
        assert_eq!(Opcode::from_u8(3), None);
    }
}
