//! The virtual frame: a compile-time model of the JS frame and the expression
//! stack on top of it.
//!
//! Elements `0..=stack_pointer` are physically on the machine stack. Elements
//! above the stack pointer are virtual: their values live in registers or are
//! known constants and have not been pushed yet. Receiver, parameters, the
//! frame header and locals are always in memory.
//!
//! ```text
//!   index            element
//!   0                receiver
//!   1 ..= p          parameters
//!   p + 1            return address
//!   p + 2            caller fp          <- fp
//!   p + 3            context
//!   p + 4            function
//!   p + 5 + i        local i
//!   p + 5 + l ..     expression stack
//! ```

use std::fmt;

use super::register_allocator::{RegisterFile, RegisterGuard};
use crate::layout::{FRAME_HEADER_ELEMENTS, HANDLER_ADDRESS, HANDLER_SIZE_IN_WORDS};
use crate::machine::{Constant, MacroAssembler, MemOperand, Operand, Reg, words_to_bytes};
use crate::runtime::CallTarget;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum FrameElement {
    /// In its stack slot.
    Memory,
    /// In a register, not yet pushed.
    Register(Reg),
    /// A known value, not yet materialized.
    Constant(Constant),
}

impl FrameElement {
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }

    #[must_use]
    pub fn register(&self) -> Option<Reg> {
        match self {
            Self::Register(reg) => Some(*reg),
            _ => None,
        }
    }
}

pub struct VirtualFrame {
    elements: Vec<FrameElement>,
    /// Index of the topmost element on the machine stack.
    stack_pointer: usize,
    parameter_count: usize,
    local_count: usize,
    /// `Some` while this frame is the generator's current frame and its
    /// register elements are counted.
    registers: Option<RegisterFile>,
}

impl VirtualFrame {
    /// The frame as seen on function entry: receiver and parameters pushed by
    /// the caller.
    #[must_use]
    pub fn new(parameter_count: usize, local_count: usize) -> Self {
        Self {
            elements: vec![FrameElement::Memory; parameter_count + 1],
            stack_pointer: parameter_count,
            parameter_count,
            local_count,
            registers: None,
        }
    }

    // ── Accounting ──

    /// Starts counting this frame's register elements in `registers`.
    pub fn attach(&mut self, registers: &RegisterFile) {
        self.detach();
        for element in &self.elements {
            if let FrameElement::Register(reg) = element {
                registers.use_register(*reg);
            }
        }
        self.registers = Some(registers.clone());
    }

    /// Releases this frame's register references.
    pub fn detach(&mut self) {
        if let Some(registers) = self.registers.take() {
            for element in &self.elements {
                if let FrameElement::Register(reg) = element {
                    registers.unuse_register(*reg);
                }
            }
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.registers.is_some()
    }

    fn register_file(&self) -> Result<RegisterFile> {
        self.registers
            .clone()
            .ok_or_else(|| Error::Internal("register allocation on a detached frame".to_string()))
    }

    fn use_reg(&self, reg: Reg) {
        if let Some(registers) = &self.registers {
            registers.use_register(reg);
        }
    }

    fn unuse_reg(&self, reg: Reg) {
        if let Some(registers) = &self.registers {
            registers.unuse_register(reg);
        }
    }

    // ── Shape ──

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn elements(&self) -> &[FrameElement] {
        &self.elements
    }

    #[must_use]
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    #[must_use]
    pub fn local_count(&self) -> usize {
        self.local_count
    }

    /// Element count of the frame with no expression stack.
    #[must_use]
    pub fn expression_base(&self) -> usize {
        self.parameter_count + 1 + FRAME_HEADER_ELEMENTS + self.local_count
    }

    /// Height of the expression stack.
    #[must_use]
    pub fn height(&self) -> usize {
        self.elements.len().saturating_sub(self.expression_base())
    }

    #[must_use]
    pub fn is_spilled(&self) -> bool {
        self.stack_pointer + 1 == self.elements.len()
    }

    /// Same elements in the same places.
    #[must_use]
    pub fn equals(&self, other: &VirtualFrame) -> bool {
        self.stack_pointer == other.stack_pointer && self.elements == other.elements
    }

    /// Number of elements referencing `reg`.
    #[must_use]
    pub fn register_references(&self, reg: Reg) -> usize {
        self.elements
            .iter()
            .filter(|element| element.register() == Some(reg))
            .count()
    }

    // ── Operands ──

    fn fp_relative(&self, index: usize) -> MemOperand {
        let words = (self.parameter_count + 2) as i32 - index as i32;
        MemOperand::new(Reg::FP, words * crate::layout::POINTER_SIZE)
    }

    #[must_use]
    pub fn receiver(&self) -> MemOperand {
        self.fp_relative(0)
    }

    #[must_use]
    pub fn parameter_at(&self, index: usize) -> MemOperand {
        self.fp_relative(1 + index)
    }

    #[must_use]
    pub fn context(&self) -> MemOperand {
        self.fp_relative(self.parameter_count + 3)
    }

    #[must_use]
    pub fn function(&self) -> MemOperand {
        self.fp_relative(self.parameter_count + 4)
    }

    #[must_use]
    pub fn local_at(&self, index: usize) -> MemOperand {
        self.fp_relative(self.parameter_count + 5 + index)
    }

    /// Stack slot of the element `depth` positions below the top. The element
    /// must be in memory.
    pub fn element_at(&self, depth: usize) -> Result<MemOperand> {
        let index = self
            .elements
            .len()
            .checked_sub(depth + 1)
            .ok_or_else(|| Error::Internal(format!("frame has no element at depth {depth}")))?;
        if index > self.stack_pointer {
            return Err(Error::Internal(format!(
                "element at depth {depth} is not in memory"
            )));
        }
        Ok(MemOperand::new(
            Reg::SP,
            words_to_bytes(self.stack_pointer - index),
        ))
    }

    pub fn top(&self) -> Result<MemOperand> {
        self.element_at(0)
    }

    // ── Function entry and exit ──

    /// Pushes the return address, the caller's fp, the context and the
    /// function (passed in `r1`), and establishes fp.
    pub fn enter(&mut self, masm: &mut MacroAssembler) {
        masm.push(Reg::LR);
        masm.push(Reg::FP);
        masm.mov(Reg::FP, Reg::SP);
        masm.push(Reg::CP);
        masm.push(Reg::R1);
        self.push_memory(FRAME_HEADER_ELEMENTS);
    }

    /// Allocates the locals, initialized to undefined.
    pub fn allocate_stack_slots(&mut self, masm: &mut MacroAssembler) {
        if self.local_count > 0 {
            masm.load_constant(Reg::IP, Constant::Undefined);
            for _ in 0..self.local_count {
                masm.push(Reg::IP);
            }
            self.push_memory(self.local_count);
        }
    }

    /// Tears the frame down, restoring the caller's fp and the return address.
    /// The receiver and arguments are left for the caller of this method.
    pub fn exit(&self, masm: &mut MacroAssembler) {
        masm.mov(Reg::SP, Reg::FP);
        masm.pop(Reg::FP);
        masm.pop(Reg::LR);
    }

    pub fn prepare_for_return(&mut self, masm: &mut MacroAssembler) -> Result<()> {
        self.spill_all(masm)
    }

    /// Links a new stack handler in front of the handler chain. `lr` holds the
    /// address execution resumes at when an exception reaches the handler.
    pub fn push_try_handler(&mut self, masm: &mut MacroAssembler, state: i32) -> Result<()> {
        self.spill_all(masm)?;
        let handler_cell = Operand::Imm(HANDLER_ADDRESS as i32);
        masm.push(Reg::LR);
        masm.push(Reg::FP);
        masm.mov(Reg::IP, Operand::smi(state));
        masm.push(Reg::IP);
        masm.mov(Reg::IP, handler_cell);
        masm.ldr(Reg::IP, MemOperand::new(Reg::IP, 0));
        masm.push(Reg::IP);
        masm.mov(Reg::IP, handler_cell);
        masm.str(Reg::SP, MemOperand::new(Reg::IP, 0));
        self.push_memory(HANDLER_SIZE_IN_WORDS);
        Ok(())
    }

    fn push_memory(&mut self, count: usize) {
        debug_assert!(self.is_spilled());
        for _ in 0..count {
            self.elements.push(FrameElement::Memory);
        }
        self.stack_pointer += count;
    }

    // ── Pushing and popping ──

    pub fn push_constant(&mut self, constant: Constant) {
        self.elements.push(FrameElement::Constant(constant));
    }

    pub fn push_register(&mut self, reg: Reg) {
        self.use_reg(reg);
        self.elements.push(FrameElement::Register(reg));
    }

    /// Pushes `reg` onto the machine stack.
    pub fn emit_push(&mut self, masm: &mut MacroAssembler, reg: Reg) -> Result<()> {
        self.spill_all(masm)?;
        masm.push(reg);
        self.push_memory(1);
        Ok(())
    }

    /// Removes the top element into `reg`.
    pub fn emit_pop(&mut self, masm: &mut MacroAssembler, reg: Reg) -> Result<()> {
        let len = self.elements.len();
        if len == 0 {
            return Err(Error::Internal("pop from an empty frame".to_string()));
        }
        let clobbers_other = self.elements[..len - 1]
            .iter()
            .any(|element| element.register() == Some(reg));
        if clobbers_other {
            self.spill_all(masm)?;
        }
        match self.elements.pop() {
            Some(FrameElement::Memory) => {
                masm.pop(reg);
                self.stack_pointer = self.stack_pointer.checked_sub(1).ok_or_else(|| {
                    Error::Internal("pop below the bottom of the frame".to_string())
                })?;
            }
            Some(FrameElement::Register(src)) => {
                if src != reg {
                    masm.mov(reg, src);
                }
                self.unuse_reg(src);
            }
            Some(FrameElement::Constant(constant)) => masm.load_constant(reg, constant),
            None => {}
        }
        Ok(())
    }

    /// Allocates a register, spilling the frame when none is free.
    pub fn allocate(&mut self, masm: &mut MacroAssembler) -> Result<RegisterGuard> {
        let registers = self.register_file()?;
        if let Some(guard) = registers.allocate_any() {
            return Ok(guard);
        }
        self.spill_all(masm)?;
        registers.allocate_any().ok_or(Error::NoFreeRegister)
    }

    /// Removes the top element and returns it in a register.
    pub fn pop(&mut self, masm: &mut MacroAssembler) -> Result<RegisterGuard> {
        let registers = self.register_file()?;
        if let Some(FrameElement::Register(reg)) = self.elements.last() {
            let reg = *reg;
            self.elements.pop();
            return Ok(registers.adopt(reg));
        }
        let guard = self.allocate(masm)?;
        match self.elements.pop() {
            Some(FrameElement::Constant(constant)) => masm.load_constant(guard.reg(), constant),
            Some(FrameElement::Memory) => {
                masm.pop(guard.reg());
                self.stack_pointer = self.stack_pointer.checked_sub(1).ok_or_else(|| {
                    Error::Internal("pop below the bottom of the frame".to_string())
                })?;
            }
            Some(FrameElement::Register(_)) | None => {
                return Err(Error::Internal("pop from an empty frame".to_string()));
            }
        }
        Ok(guard)
    }

    /// Like [`pop`](Self::pop), but the returned register is referenced by
    /// nothing else and may be overwritten.
    pub fn pop_exclusive(&mut self, masm: &mut MacroAssembler) -> Result<RegisterGuard> {
        let guard = self.pop(masm)?;
        let registers = self.register_file()?;
        if registers.count(guard.reg()) == 1 {
            return Ok(guard);
        }
        let fresh = self.allocate(masm)?;
        masm.mov(fresh.reg(), guard.reg());
        Ok(fresh)
    }

    /// Pushes a copy of the top element.
    pub fn dup(&mut self, masm: &mut MacroAssembler) -> Result<()> {
        match self.elements.last().cloned() {
            Some(FrameElement::Register(reg)) => self.push_register(reg),
            Some(FrameElement::Constant(constant)) => self.push_constant(constant),
            Some(FrameElement::Memory) => {
                let guard = self.allocate(masm)?;
                masm.ldr(guard.reg(), self.top()?);
                self.push_register(guard.reg());
            }
            None => return Err(Error::Internal("dup of an empty frame".to_string())),
        }
        Ok(())
    }

    /// Discards the top `count` elements.
    pub fn drop(&mut self, masm: &mut MacroAssembler, count: usize) -> Result<()> {
        let physical = self.remove(count)?;
        masm.drop_words(physical);
        Ok(())
    }

    /// Discards the top `count` elements without emitting code, for elements
    /// the machine stack has already lost (popped by a callee, or cut off by
    /// reloading sp).
    pub fn forget(&mut self, count: usize) -> Result<()> {
        self.remove(count).map(|_| ())
    }

    /// Removes elements and returns how many of them were in memory.
    fn remove(&mut self, count: usize) -> Result<usize> {
        let new_len = self.elements.len().checked_sub(count).ok_or_else(|| {
            Error::Internal(format!(
                "drop of {count} elements from a frame of {}",
                self.elements.len()
            ))
        })?;
        if new_len == 0 {
            return Err(Error::Internal("drop of the receiver".to_string()));
        }
        let physical = (self.stack_pointer + 1).saturating_sub(new_len);
        let registers = self.registers.clone();
        for element in self.elements.drain(new_len..) {
            if let (FrameElement::Register(reg), Some(registers)) = (element, &registers) {
                registers.unuse_register(reg);
            }
        }
        self.stack_pointer -= physical;
        Ok(physical)
    }

    // ── Spilling ──

    /// Writes every virtual element to its stack slot.
    pub fn spill_all(&mut self, masm: &mut MacroAssembler) -> Result<()> {
        let top = self.elements.len() - 1;
        if top > self.stack_pointer {
            self.spill_through(masm, top)?;
        }
        Ok(())
    }

    /// Pushes the virtual elements up to and including `last`.
    fn spill_through(&mut self, masm: &mut MacroAssembler, last: usize) -> Result<()> {
        for index in self.stack_pointer + 1..=last {
            match std::mem::replace(&mut self.elements[index], FrameElement::Memory) {
                FrameElement::Register(reg) => {
                    masm.push(reg);
                    self.unuse_reg(reg);
                }
                FrameElement::Constant(constant) => {
                    masm.load_constant(Reg::IP, constant);
                    masm.push(Reg::IP);
                }
                FrameElement::Memory => {
                    return Err(Error::Internal(format!(
                        "memory element {index} above the stack pointer"
                    )));
                }
            }
        }
        self.stack_pointer = last;
        Ok(())
    }

    // ── Merging ──

    /// Rewrites the virtual part so that every element is a register and no
    /// register appears twice, which is the shape merge targets need.
    /// Elements that cannot get a register are spilled. Never sets flags.
    pub fn make_mergable(&mut self, masm: &mut MacroAssembler) -> Result<()> {
        let registers = self.register_file()?;
        let mut seen: Vec<Reg> = Vec::new();
        let mut index = self.stack_pointer + 1;
        while index < self.elements.len() {
            match self.elements[index].clone() {
                FrameElement::Constant(constant) => {
                    if let Some(guard) = registers.allocate_any() {
                        masm.load_constant(guard.reg(), constant);
                        registers.use_register(guard.reg());
                        self.elements[index] = FrameElement::Register(guard.reg());
                        seen.push(guard.reg());
                    } else {
                        self.spill_through(masm, index)?;
                        seen.clear();
                    }
                }
                FrameElement::Register(reg) if seen.contains(&reg) => {
                    if let Some(guard) = registers.allocate_any() {
                        masm.mov(guard.reg(), reg);
                        registers.unuse_register(reg);
                        registers.use_register(guard.reg());
                        self.elements[index] = FrameElement::Register(guard.reg());
                        seen.push(guard.reg());
                    } else {
                        self.spill_through(masm, index)?;
                        seen.clear();
                    }
                }
                FrameElement::Register(reg) => seen.push(reg),
                FrameElement::Memory => {
                    return Err(Error::Internal(format!(
                        "memory element {index} above the stack pointer"
                    )));
                }
            }
            index += 1;
        }
        Ok(())
    }

    /// Emits code that turns this frame into `target`, which must have the
    /// same number of elements and be mergable. Never sets flags.
    pub fn merge_to(&mut self, masm: &mut MacroAssembler, target: &VirtualFrame) -> Result<()> {
        if self.elements.len() != target.elements.len() {
            return Err(Error::Internal(format!(
                "merge of a frame with {} elements into one with {}",
                self.elements.len(),
                target.elements.len()
            )));
        }
        if self.equals(target) {
            return Ok(());
        }
        if target.stack_pointer > self.stack_pointer {
            self.spill_through(masm, target.stack_pointer)?;
        }

        let mut moves = Vec::new();
        let mut destinations = Vec::new();
        for index in target.stack_pointer + 1..target.elements.len() {
            let FrameElement::Register(dst) = target.elements[index] else {
                return Err(Error::Internal(format!(
                    "merge target element {index} is not a register"
                )));
            };
            if destinations.contains(&dst) {
                return Err(Error::Internal(format!(
                    "merge target uses {dst} twice"
                )));
            }
            destinations.push(dst);
            if let FrameElement::Register(src) = self.elements[index]
                && src != dst
            {
                moves.push((dst, src));
            }
        }
        resolve_moves(masm, moves);

        for index in target.stack_pointer + 1..target.elements.len() {
            let FrameElement::Register(dst) = target.elements[index] else {
                continue;
            };
            match &self.elements[index] {
                FrameElement::Memory => {
                    let depth = self.stack_pointer - index;
                    masm.ldr(dst, MemOperand::new(Reg::SP, words_to_bytes(depth)));
                }
                FrameElement::Constant(constant) => masm.load_constant(dst, constant.clone()),
                FrameElement::Register(_) => {}
            }
        }
        masm.drop_words(self.stack_pointer - target.stack_pointer);

        if let Some(registers) = &self.registers {
            for element in &self.elements {
                if let FrameElement::Register(reg) = element {
                    registers.unuse_register(*reg);
                }
            }
            for element in &target.elements {
                if let FrameElement::Register(reg) = element {
                    registers.use_register(*reg);
                }
            }
        }
        self.elements.clone_from(&target.elements);
        self.stack_pointer = target.stack_pointer;
        Ok(())
    }

    // ── Calls ──

    /// Calls `target` with `popped` stack arguments. The result is in `r0`.
    pub fn call(
        &mut self,
        masm: &mut MacroAssembler,
        target: CallTarget,
        popped: usize,
    ) -> Result<()> {
        self.spill_all(masm)?;
        if let Some(registers) = &self.registers
            && !registers.all_free()
        {
            return Err(Error::Internal(format!(
                "registers {:?} live across call to {target}",
                registers.used_registers()
            )));
        }
        masm.call(target);
        self.forget(popped)
    }
}

/// Emits the moves `dst <- src` as if they happened in parallel. Destinations
/// are distinct; a source may feed several destinations. Cycles go through
/// `ip`.
fn resolve_moves(masm: &mut MacroAssembler, mut moves: Vec<(Reg, Reg)>) {
    while !moves.is_empty() {
        let ready = moves
            .iter()
            .position(|&(dst, _)| !moves.iter().any(|&(_, src)| src == dst));
        if let Some(position) = ready {
            let (dst, src) = moves.remove(position);
            masm.mov(dst, src);
        } else {
            // Every destination is still needed as a source: a cycle.
            let (dst, _) = moves[0];
            masm.mov(Reg::IP, dst);
            for pending in &mut moves {
                if pending.1 == dst {
                    pending.1 = Reg::IP;
                }
            }
        }
    }
}

impl Clone for VirtualFrame {
    /// A detached snapshot.
    fn clone(&self) -> Self {
        Self {
            elements: self.elements.clone(),
            stack_pointer: self.stack_pointer,
            parameter_count: self.parameter_count,
            local_count: self.local_count,
            registers: None,
        }
    }
}

impl Drop for VirtualFrame {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for VirtualFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFrame")
            .field("elements", &self.elements)
            .field("stack_pointer", &self.stack_pointer)
            .field("attached", &self.registers.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Instruction;

    fn entered(registers: &RegisterFile, params: usize, locals: usize) -> (VirtualFrame, MacroAssembler) {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(params, locals);
        frame.attach(registers);
        frame.enter(&mut masm);
        frame.allocate_stack_slots(&mut masm);
        (frame, masm)
    }

    fn count_pushes(masm: &MacroAssembler) -> usize {
        masm.instructions()
            .iter()
            .filter(|i| matches!(i, Instruction::Push { .. }))
            .count()
    }

    #[test]
    fn test_layout_offsets() {
        let frame = VirtualFrame::new(2, 1);
        assert_eq!(frame.receiver(), MemOperand::new(Reg::FP, 16));
        assert_eq!(frame.parameter_at(0), MemOperand::new(Reg::FP, 12));
        assert_eq!(frame.parameter_at(1), MemOperand::new(Reg::FP, 8));
        assert_eq!(frame.context(), MemOperand::new(Reg::FP, -4));
        assert_eq!(frame.function(), MemOperand::new(Reg::FP, -8));
        assert_eq!(frame.local_at(0), MemOperand::new(Reg::FP, -12));
        assert_eq!(frame.expression_base(), 8);
    }

    #[test]
    fn test_enter_and_locals_are_in_memory() {
        let registers = RegisterFile::new();
        let (frame, masm) = entered(&registers, 1, 2);
        assert_eq!(frame.element_count(), frame.expression_base());
        assert_eq!(frame.height(), 0);
        assert!(frame.is_spilled());
        assert_eq!(count_pushes(&masm), 6);
    }

    #[test]
    fn test_constants_and_registers_are_lazy() {
        let registers = RegisterFile::new();
        let (mut frame, mut masm) = entered(&registers, 0, 0);
        let before = masm.pc_offset();
        frame.push_constant(Constant::Smi(1));
        frame.push_register(Reg::R4);
        assert_eq!(masm.pc_offset(), before);
        assert_eq!(frame.height(), 2);
        assert_eq!(registers.count(Reg::R4), 1);

        frame.spill_all(&mut masm).unwrap();
        assert!(frame.is_spilled());
        assert_eq!(registers.count(Reg::R4), 0);
        assert_eq!(masm.pc_offset(), before + 3);
    }

    #[test]
    fn test_pop_adopts_register_reference() {
        let registers = RegisterFile::new();
        let (mut frame, mut masm) = entered(&registers, 0, 0);
        frame.push_register(Reg::R3);
        let guard = frame.pop(&mut masm).unwrap();
        assert_eq!(guard.reg(), Reg::R3);
        assert_eq!(registers.count(Reg::R3), 1);
        drop(guard);
        assert!(registers.all_free());
    }

    #[test]
    fn test_pop_exclusive_copies_shared_register() {
        let registers = RegisterFile::new();
        let (mut frame, mut masm) = entered(&registers, 0, 0);
        frame.push_register(Reg::R0);
        frame.dup(&mut masm).unwrap();
        let guard = frame.pop_exclusive(&mut masm).unwrap();
        assert_ne!(guard.reg(), Reg::R0);
        assert_eq!(registers.count(Reg::R0), 1);
    }

    #[test]
    fn test_drop_counts_only_physical_elements() {
        let registers = RegisterFile::new();
        let (mut frame, mut masm) = entered(&registers, 0, 0);
        frame.emit_push(&mut masm, Reg::R0).unwrap();
        frame.emit_push(&mut masm, Reg::R1).unwrap();
        frame.push_register(Reg::R2);
        let before = masm.pc_offset();
        frame.drop(&mut masm, 3).unwrap();
        assert_eq!(
            masm.instructions()[before],
            Instruction::Alu {
                op: crate::machine::AluOp::Add,
                set_flags: false,
                dst: Reg::SP,
                lhs: Reg::SP,
                rhs: Operand::Imm(8),
            }
        );
        assert_eq!(frame.height(), 0);
        assert!(registers.all_free());
    }

    #[test]
    fn test_make_mergable_removes_constants_and_duplicates() {
        let registers = RegisterFile::new();
        let (mut frame, mut masm) = entered(&registers, 0, 0);
        frame.push_constant(Constant::Smi(5));
        frame.push_register(Reg::R0);
        frame.push_register(Reg::R0);
        frame.make_mergable(&mut masm).unwrap();
        let regs: Vec<Reg> = frame.elements()[frame.stack_pointer() + 1..]
            .iter()
            .map(|e| e.register().unwrap())
            .collect();
        assert_eq!(regs.len(), 3);
        assert_ne!(regs[0], regs[1]);
        assert_ne!(regs[1], regs[2]);
        assert_ne!(regs[0], regs[2]);
    }

    #[test]
    fn test_merge_swaps_registers_through_ip() {
        let registers = RegisterFile::new();
        let (mut frame, mut masm) = entered(&registers, 0, 0);
        frame.push_register(Reg::R0);
        frame.push_register(Reg::R1);
        let mut target = frame.clone();
        target.elements.truncate(target.elements.len() - 2);
        target.elements.push(FrameElement::Register(Reg::R1));
        target.elements.push(FrameElement::Register(Reg::R0));

        let before = masm.pc_offset();
        frame.merge_to(&mut masm, &target).unwrap();
        let emitted = &masm.instructions()[before..];
        assert_eq!(emitted.len(), 3);
        assert!(emitted.contains(&Instruction::Mov {
            dst: Reg::IP,
            src: Operand::Reg(Reg::R1)
        }) || emitted.contains(&Instruction::Mov {
            dst: Reg::IP,
            src: Operand::Reg(Reg::R0)
        }));
        assert!(frame.equals(&target));
        assert_eq!(registers.count(Reg::R0), 1);
        assert_eq!(registers.count(Reg::R1), 1);
    }

    #[test]
    fn test_merge_loads_memory_into_registers_and_pops() {
        let registers = RegisterFile::new();
        let (mut frame, mut masm) = entered(&registers, 0, 0);
        frame.emit_push(&mut masm, Reg::R0).unwrap();
        let mut target = frame.clone();
        target.elements.pop();
        target.elements.push(FrameElement::Register(Reg::R5));
        target.stack_pointer -= 1;

        let before = masm.pc_offset();
        frame.merge_to(&mut masm, &target).unwrap();
        assert_eq!(
            masm.instructions()[before],
            Instruction::Ldr {
                dst: Reg::R5,
                mem: MemOperand::new(Reg::SP, 0)
            }
        );
        assert_eq!(masm.pc_offset(), before + 2);
        assert_eq!(registers.count(Reg::R5), 1);
    }

    #[test]
    fn test_call_rejects_live_registers() {
        let registers = RegisterFile::new();
        let (mut frame, mut masm) = entered(&registers, 0, 0);
        let _held = registers.allocate(Reg::R6).unwrap();
        let result = frame.call(
            &mut masm,
            CallTarget::Runtime(crate::runtime::RuntimeFunction::DebugBreak),
            0,
        );
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn test_detached_clone_does_not_count() {
        let registers = RegisterFile::new();
        let (mut frame, _masm) = entered(&registers, 0, 0);
        frame.push_register(Reg::R2);
        let snapshot = frame.clone();
        assert!(!snapshot.is_attached());
        assert_eq!(registers.count(Reg::R2), 1);
        drop(frame);
        assert!(registers.all_free());
        drop(snapshot);
        assert!(registers.all_free());
    }
}
