use super::{
    AluOp, Code, Condition, Constant, FunctionMetadata, Instruction, MemOperand, Operand, Reg,
    RelocInfo, RelocMode,
};
use crate::runtime::{Builtin, CallTarget, IcKind};
use crate::{Error, Result};

/// A position in the instruction stream that branches can refer to before it
/// is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Emits instructions, manages the constant pool and resolves label fixups.
#[derive(Debug, Default)]
pub struct MacroAssembler {
    instructions: Vec<Instruction>,
    constants: Vec<Constant>,
    relocations: Vec<RelocInfo>,
    comments: Vec<(usize, String)>,
    labels: Vec<Option<usize>>,
    /// (instruction index, target label)
    fixups: Vec<(usize, Label)>,
}

impl MacroAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next instruction to be emitted.
    #[must_use]
    pub fn pc_offset(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    // ── Labels ──

    pub fn new_label(&mut self) -> Label {
        let id = self.labels.len();
        self.labels.push(None);
        Label(id)
    }

    pub fn bind(&mut self, label: Label) -> Result<()> {
        let pc = self.pc_offset();
        match self.labels.get_mut(label.0) {
            Some(slot @ None) => {
                *slot = Some(pc);
                Ok(())
            }
            Some(Some(_)) => Err(Error::Internal(format!("label {} bound twice", label.0))),
            None => Err(Error::Internal(format!("unknown label {}", label.0))),
        }
    }

    #[must_use]
    pub fn is_bound(&self, label: Label) -> bool {
        self.labels.get(label.0).is_some_and(Option::is_some)
    }

    #[must_use]
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    // ── Raw emission ──

    pub fn emit(&mut self, instr: Instruction) {
        self.instructions.push(instr);
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.comments.push((self.pc_offset(), text.into()));
    }

    pub fn record_position(&mut self, position: u32) {
        self.record(RelocMode::Position, position);
    }

    pub fn record_statement_position(&mut self, position: u32) {
        self.record(RelocMode::StatementPosition, position);
    }

    pub fn record_js_return(&mut self) {
        self.record(RelocMode::JsReturn, 0);
    }

    fn record(&mut self, mode: RelocMode, data: u32) {
        self.relocations.push(RelocInfo {
            pc: self.pc_offset(),
            mode,
            data,
        });
    }

    // ── Data processing ──

    pub fn mov(&mut self, dst: Reg, src: impl Into<Operand>) {
        self.emit(Instruction::Mov {
            dst,
            src: src.into(),
        });
    }

    pub fn mvn(&mut self, dst: Reg, src: impl Into<Operand>) {
        self.emit(Instruction::Mvn {
            dst,
            src: src.into(),
        });
    }

    pub fn alu(&mut self, op: AluOp, set_flags: bool, dst: Reg, lhs: Reg, rhs: impl Into<Operand>) {
        self.emit(Instruction::Alu {
            op,
            set_flags,
            dst,
            lhs,
            rhs: rhs.into(),
        });
    }

    pub fn add(&mut self, dst: Reg, lhs: Reg, rhs: impl Into<Operand>) {
        self.alu(AluOp::Add, false, dst, lhs, rhs);
    }

    pub fn sub(&mut self, dst: Reg, lhs: Reg, rhs: impl Into<Operand>) {
        self.alu(AluOp::Sub, false, dst, lhs, rhs);
    }

    pub fn and(&mut self, dst: Reg, lhs: Reg, rhs: impl Into<Operand>) {
        self.alu(AluOp::And, false, dst, lhs, rhs);
    }

    pub fn orr(&mut self, dst: Reg, lhs: Reg, rhs: impl Into<Operand>) {
        self.alu(AluOp::Orr, false, dst, lhs, rhs);
    }

    pub fn cmp(&mut self, lhs: Reg, rhs: impl Into<Operand>) {
        self.emit(Instruction::Cmp {
            lhs,
            rhs: rhs.into(),
        });
    }

    pub fn tst(&mut self, lhs: Reg, rhs: impl Into<Operand>) {
        self.emit(Instruction::Tst {
            lhs,
            rhs: rhs.into(),
        });
    }

    // ── Memory ──

    pub fn ldr(&mut self, dst: Reg, mem: MemOperand) {
        self.emit(Instruction::Ldr { dst, mem });
    }

    pub fn str(&mut self, src: Reg, mem: MemOperand) {
        self.emit(Instruction::Str { src, mem });
    }

    pub fn push(&mut self, src: Reg) {
        self.emit(Instruction::Push { src });
    }

    pub fn pop(&mut self, dst: Reg) {
        self.emit(Instruction::Pop { dst });
    }

    /// Releases `count` stack words without loading them.
    pub fn drop_words(&mut self, count: usize) {
        if count > 0 {
            self.add(Reg::SP, Reg::SP, Operand::Imm(words_to_bytes(count)));
        }
    }

    /// Interns `constant` in the constant pool.
    pub fn constant_index(&mut self, constant: Constant) -> u32 {
        let index = match self.constants.iter().position(|c| *c == constant) {
            Some(index) => index,
            None => {
                self.constants.push(constant);
                self.constants.len() - 1
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        index
    }

    /// Materializes `constant` in `dst`. Small integers become an immediate
    /// move; everything else is loaded from the constant pool.
    pub fn load_constant(&mut self, dst: Reg, constant: Constant) {
        if let Some(value) = constant.as_smi() {
            self.mov(dst, Operand::smi(value));
        } else {
            let index = self.constant_index(constant);
            self.record(RelocMode::EmbeddedObject, index);
            self.emit(Instruction::LoadConstant { dst, index });
        }
    }

    /// Compares `reg` against `constant`, clobbering `ip` for non-smis.
    pub fn cmp_constant(&mut self, reg: Reg, constant: Constant) {
        if let Some(value) = constant.as_smi() {
            self.cmp(reg, Operand::smi(value));
        } else {
            self.load_constant(Reg::IP, constant);
            self.cmp(reg, Reg::IP);
        }
    }

    // ── Control flow ──

    pub fn b(&mut self, cond: Condition, label: Label) {
        self.fixups.push((self.pc_offset(), label));
        self.emit(Instruction::Branch { cond, offset: 0 });
    }

    pub fn jmp(&mut self, label: Label) {
        self.b(Condition::Al, label);
    }

    pub fn bl(&mut self, label: Label) {
        self.fixups.push((self.pc_offset(), label));
        self.emit(Instruction::BranchLink { offset: 0 });
    }

    pub fn bx(&mut self, reg: Reg) {
        self.emit(Instruction::BranchReg { reg });
    }

    /// Dispatches on the smi in `index` through a table of branches to `targets`.
    pub fn jump_table(&mut self, index: Reg, targets: &[Label]) {
        self.emit(Instruction::JumpTable { index });
        for &target in targets {
            self.jmp(target);
        }
    }

    pub fn call(&mut self, target: CallTarget) {
        let mode = match target {
            CallTarget::Runtime(_) => RelocMode::RuntimeEntry,
            CallTarget::Builtin(Builtin::JsConstructCall) => RelocMode::ConstructCall,
            CallTarget::Ic(
                IcKind::Load { contextual: true } | IcKind::Call {
                    contextual: true, ..
                },
            ) => RelocMode::CodeTargetContext,
            CallTarget::Builtin(_) | CallTarget::Stub(_) | CallTarget::Ic(_) => {
                RelocMode::CodeTarget
            }
        };
        self.record(mode, 0);
        self.emit(Instruction::Call { target });
    }

    /// Records a pointer store at byte `offset` (a register) of `object`.
    pub fn record_write(&mut self, object: Reg, offset: Reg, scratch: Reg) {
        self.emit(Instruction::RecordWrite {
            object,
            offset,
            scratch,
        });
    }

    pub fn stop(&mut self) {
        self.emit(Instruction::Stop);
    }

    // ── Finalization ──

    fn resolve_fixups(&mut self) -> Result<()> {
        for &(instr_idx, label) in &self.fixups {
            let target = self
                .labels
                .get(label.0)
                .copied()
                .flatten()
                .ok_or_else(|| Error::Internal(format!("unbound label {}", label.0)))?;

            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let relative = target as i32 - instr_idx as i32;

            let instr = self
                .instructions
                .get_mut(instr_idx)
                .ok_or_else(|| Error::Internal("fixup past end of code".to_string()))?;
            if instr.branch_offset().is_none() {
                return Err(Error::Internal(
                    "cannot fixup non-branch instruction".to_string(),
                ));
            }
            instr.set_branch_offset(relative);
        }
        Ok(())
    }

    /// Resolves all branches and produces the code object.
    pub fn finalize(mut self, metadata: FunctionMetadata) -> Result<Code> {
        self.resolve_fixups()?;
        Ok(Code {
            instructions: self.instructions,
            constants: self.constants,
            relocations: self.relocations,
            comments: self.comments,
            metadata,
        })
    }
}

/// Byte size of `count` stack words as an immediate.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn words_to_bytes(count: usize) -> i32 {
    count as i32 * crate::layout::POINTER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeFunction;

    fn metadata() -> FunctionMetadata {
        FunctionMetadata {
            name: "test".to_string(),
            parameter_count: 0,
            literal_count: 0,
            expected_property_count: 0,
            start_position: 0,
            end_position: 0,
            is_expression: false,
        }
    }

    #[test]
    fn test_forward_and_backward_branches_resolve() {
        let mut masm = MacroAssembler::new();
        let top = masm.new_label();
        let done = masm.new_label();
        masm.bind(top).unwrap();
        masm.cmp(Reg::R0, Operand::smi(0));
        masm.b(Condition::Eq, done);
        masm.sub(Reg::R0, Reg::R0, Operand::smi(1));
        masm.jmp(top);
        masm.bind(done).unwrap();
        masm.stop();

        let code = masm.finalize(metadata()).unwrap();
        assert_eq!(code.instructions[1].branch_offset(), Some(3));
        assert_eq!(code.instructions[3].branch_offset(), Some(-3));
    }

    #[test]
    fn test_unbound_label_is_error() {
        let mut masm = MacroAssembler::new();
        let label = masm.new_label();
        masm.jmp(label);
        assert!(matches!(
            masm.finalize(metadata()),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_double_bind_is_error() {
        let mut masm = MacroAssembler::new();
        let label = masm.new_label();
        masm.bind(label).unwrap();
        assert!(masm.bind(label).is_err());
    }

    #[test]
    fn test_constants_are_interned() {
        let mut masm = MacroAssembler::new();
        masm.load_constant(Reg::R0, Constant::string("x"));
        masm.load_constant(Reg::R1, Constant::string("x"));
        masm.load_constant(Reg::R2, Constant::Smi(3));
        assert_eq!(masm.constants().len(), 1);
        assert_eq!(
            masm.instructions()[2],
            Instruction::Mov {
                dst: Reg::R2,
                src: Operand::Imm(6)
            }
        );
    }

    #[test]
    fn test_call_records_relocation() {
        let mut masm = MacroAssembler::new();
        masm.call(CallTarget::Runtime(RuntimeFunction::Throw));
        masm.call(CallTarget::Ic(IcKind::Load { contextual: true }));
        let code = masm.finalize(metadata()).unwrap();
        assert_eq!(code.relocations_of(RelocMode::RuntimeEntry).count(), 1);
        assert_eq!(code.relocations_of(RelocMode::CodeTargetContext).count(), 1);
    }
}
