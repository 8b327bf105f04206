//! Jump targets: labels that carry the frame expected on arrival.
//!
//! The generator's current frame lives in [`Emitter`] together with the
//! assembler and the register file, because every control transfer has to
//! touch all three. Targets are owned by the emitter and named by
//! [`TargetId`] so that they can be shared between the statement walker,
//! the exit table and deferred code.

use tracing::trace;

use super::register_allocator::RegisterFile;
use super::virtual_frame::VirtualFrame;
use crate::machine::{Condition, Label, MacroAssembler};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Every predecessor is emitted before the target is bound.
    ForwardOnly,
    /// Loop headers and deferred-code exits: may be reached after binding.
    Bidirectional,
}

#[derive(Debug)]
pub struct JumpTarget {
    label: Label,
    direction: Direction,
    /// Frame every predecessor merges into; detached.
    entry_frame: Option<VirtualFrame>,
    /// Expression stack height on arrival. Predecessors above it drop the
    /// excess elements before merging.
    expected_height: Option<usize>,
    predecessors: usize,
    bound: bool,
}

impl JumpTarget {
    fn new(label: Label, direction: Direction) -> Self {
        Self {
            label,
            direction,
            entry_frame: None,
            expected_height: None,
            predecessors: 0,
            bound: false,
        }
    }

    #[must_use]
    pub fn label(&self) -> Label {
        self.label
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn entry_frame(&self) -> Option<&VirtualFrame> {
        self.entry_frame.as_ref()
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.predecessors > 0 && !self.bound
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    #[must_use]
    pub fn predecessors(&self) -> usize {
        self.predecessors
    }
}

/// The assembler, the register file, the current frame and all jump targets.
#[derive(Debug, Default)]
pub struct Emitter {
    pub masm: MacroAssembler,
    pub registers: RegisterFile,
    frame: Option<VirtualFrame>,
    targets: Vec<JumpTarget>,
}

impl Emitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Frame ──

    #[must_use]
    pub fn has_valid_frame(&self) -> bool {
        self.frame.is_some()
    }

    pub fn frame(&mut self) -> Result<&mut VirtualFrame> {
        self.frame
            .as_mut()
            .ok_or_else(|| Error::Internal("no valid frame".to_string()))
    }

    #[must_use]
    pub fn frame_ref(&self) -> Option<&VirtualFrame> {
        self.frame.as_ref()
    }

    /// The assembler and the current frame, borrowed together.
    pub fn parts(&mut self) -> Result<(&mut MacroAssembler, &mut VirtualFrame)> {
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| Error::Internal("no valid frame".to_string()))?;
        Ok((&mut self.masm, frame))
    }

    /// Makes `frame` current, counting its registers.
    pub fn set_frame(&mut self, mut frame: VirtualFrame) {
        frame.attach(&self.registers);
        self.frame = Some(frame);
    }

    /// Removes the current frame, releasing its registers.
    pub fn take_frame(&mut self) -> Option<VirtualFrame> {
        let mut frame = self.frame.take()?;
        frame.detach();
        Some(frame)
    }

    /// Writes every virtual element of the current frame to memory. Code that
    /// uses fixed registers starts with this.
    pub fn spill(&mut self) -> Result<()> {
        let (masm, frame) = self.parts()?;
        frame.spill_all(masm)
    }

    // ── Targets ──

    pub fn new_target(&mut self, direction: Direction) -> TargetId {
        let label = self.masm.new_label();
        self.targets.push(JumpTarget::new(label, direction));
        TargetId(self.targets.len() - 1)
    }

    pub fn forward_target(&mut self) -> TargetId {
        self.new_target(Direction::ForwardOnly)
    }

    #[must_use]
    pub fn target(&self, id: TargetId) -> &JumpTarget {
        &self.targets[id.0]
    }

    pub fn set_expected_height(&mut self, id: TargetId, height: usize) {
        self.targets[id.0].expected_height = Some(height);
    }

    #[must_use]
    pub fn is_linked(&self, id: TargetId) -> bool {
        self.targets[id.0].is_linked()
    }

    #[must_use]
    pub fn is_bound(&self, id: TargetId) -> bool {
        self.targets[id.0].is_bound()
    }

    /// Forgets every predecessor of an unbound target. Branches already
    /// emitted to it are left dangling, so this is only valid for targets
    /// that were never jumped to or whose branches are dead.
    pub fn unuse(&mut self, id: TargetId) -> Result<()> {
        let target = &mut self.targets[id.0];
        if target.bound {
            return Err(Error::Internal("unuse of a bound target".to_string()));
        }
        target.entry_frame = None;
        target.predecessors = 0;
        Ok(())
    }

    /// Drops elements above the target's expected height.
    fn adjust_height(&mut self, id: TargetId, frame: &mut VirtualFrame) -> Result<()> {
        if let Some(expected) = self.targets[id.0].expected_height {
            let height = frame.height();
            if height < expected {
                return Err(Error::Internal(format!(
                    "frame height {height} below expected height {expected}"
                )));
            }
            frame.drop(&mut self.masm, height - expected)?;
        }
        Ok(())
    }

    /// Merges `frame` into the target's entry frame, or makes it the entry
    /// frame of a target reached for the first time.
    fn merge_into(&mut self, id: TargetId, frame: &mut VirtualFrame) -> Result<()> {
        self.adjust_height(id, frame)?;
        let target = &mut self.targets[id.0];
        match &target.entry_frame {
            Some(entry) => {
                trace!(target = id.0, height = frame.height(), "merge into jump target");
                frame.merge_to(&mut self.masm, entry)?;
            }
            None => {
                frame.make_mergable(&mut self.masm)?;
                target.entry_frame = Some(frame.clone());
            }
        }
        Ok(())
    }

    /// Unconditional branch to the target. The current frame becomes invalid.
    pub fn jump(&mut self, id: TargetId) -> Result<()> {
        let mut frame = self
            .frame
            .take()
            .ok_or_else(|| Error::Internal("jump without a valid frame".to_string()))?;
        self.merge_into(id, &mut frame)?;
        let target = &mut self.targets[id.0];
        target.predecessors += 1;
        let label = target.label;
        self.masm.jmp(label);
        frame.detach();
        Ok(())
    }

    /// Branch to the target when `cond` holds; the current frame stays valid
    /// on the fall-through path. When reaching the target needs code, the
    /// merge is emitted on a path that skips around it.
    pub fn branch(&mut self, id: TargetId, cond: Condition) -> Result<()> {
        if cond == Condition::Al {
            return self.jump(id);
        }
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| Error::Internal("branch without a valid frame".to_string()))?;
        let target = &self.targets[id.0];
        let height_matches = target
            .expected_height
            .is_none_or(|expected| expected == frame.height());
        let direct = height_matches
            && match &target.entry_frame {
                Some(entry) => frame.equals(entry),
                None => is_mergable(frame),
            };

        if direct {
            let target = &mut self.targets[id.0];
            if target.entry_frame.is_none() {
                target.entry_frame = Some(frame.clone());
            }
            target.predecessors += 1;
            let label = target.label;
            self.masm.b(cond, label);
            return Ok(());
        }

        let skip = self.masm.new_label();
        self.masm.b(cond.negate(), skip);
        let saved = frame.clone();
        self.jump(id)?;
        self.masm.bind(skip)?;
        self.set_frame(saved);
        Ok(())
    }

    /// Branch-and-link to the target. The target's code runs with the current
    /// frame and the return address in `lr`; the current frame stays valid.
    pub fn call(&mut self, id: TargetId) -> Result<()> {
        self.spill()?;
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| Error::Internal("call without a valid frame".to_string()))?;
        let snapshot = frame.clone();
        let target = &mut self.targets[id.0];
        match &target.entry_frame {
            Some(entry) if !entry.equals(&snapshot) => {
                return Err(Error::Internal(
                    "call into a target with a different frame".to_string(),
                ));
            }
            Some(_) => {}
            None => target.entry_frame = Some(snapshot),
        }
        target.predecessors += 1;
        let label = target.label;
        self.masm.bl(label);
        Ok(())
    }

    /// Binds the target at the current position. A fall-through frame is
    /// merged into the entry frame; without one, the entry frame becomes
    /// current.
    pub fn bind(&mut self, id: TargetId) -> Result<()> {
        if self.targets[id.0].bound {
            return Err(Error::Internal(format!("jump target {} bound twice", id.0)));
        }
        match self.frame.take() {
            Some(mut frame) => {
                if self.targets[id.0].entry_frame.is_some()
                    || self.targets[id.0].direction == Direction::Bidirectional
                {
                    self.merge_into(id, &mut frame)?;
                } else {
                    self.adjust_height(id, &mut frame)?;
                    self.targets[id.0].entry_frame = Some(frame.clone());
                }
                self.frame = Some(frame);
            }
            None => {
                let entry = self.targets[id.0]
                    .entry_frame
                    .clone()
                    .ok_or_else(|| Error::Internal("bind of unreached target".to_string()))?;
                trace!(target = id.0, "adopt entry frame at bind");
                self.set_frame(entry);
            }
        }
        let target = &mut self.targets[id.0];
        target.bound = true;
        let label = target.label;
        self.masm.bind(label)
    }

    /// Binds the target only if it can be reached.
    pub fn bind_if_reached(&mut self, id: TargetId) -> Result<()> {
        if self.has_valid_frame() || self.is_linked(id) {
            self.bind(id)?;
        }
        Ok(())
    }

    /// Finishes code generation, releasing the frame.
    pub fn finish(mut self) -> (MacroAssembler, RegisterFile) {
        self.take_frame();
        (self.masm, self.registers)
    }
}

/// No constants and no register used twice in the virtual part.
fn is_mergable(frame: &VirtualFrame) -> bool {
    let virtual_part = &frame.elements()[frame.stack_pointer() + 1..];
    virtual_part.iter().enumerate().all(|(i, element)| {
        element
            .register()
            .is_some_and(|reg| virtual_part[..i].iter().all(|e| e.register() != Some(reg)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Constant, Instruction, Reg};

    fn emitter_with_frame() -> Emitter {
        let mut emitter = Emitter::new();
        let mut frame = VirtualFrame::new(0, 0);
        frame.enter(&mut emitter.masm);
        emitter.set_frame(frame);
        emitter
    }

    #[test]
    fn test_jump_invalidates_and_bind_adopts_entry_frame() {
        let mut emitter = emitter_with_frame();
        let exit = emitter.forward_target();
        emitter.frame().unwrap().push_register(Reg::R2);
        emitter.jump(exit).unwrap();
        assert!(!emitter.has_valid_frame());
        assert!(emitter.registers.all_free());
        assert!(emitter.is_linked(exit));

        emitter.bind(exit).unwrap();
        let frame = emitter.frame().unwrap();
        assert_eq!(frame.height(), 1);
        assert_eq!(emitter.registers.count(Reg::R2), 1);
        assert!(emitter.is_bound(exit));
    }

    #[test]
    fn test_different_predecessor_frames_merge_to_same_entry() {
        let mut emitter = emitter_with_frame();
        let join = emitter.forward_target();

        let snapshot = emitter.frame_ref().unwrap().clone();
        emitter.frame().unwrap().push_register(Reg::R1);
        emitter.jump(join).unwrap();

        emitter.set_frame(snapshot);
        emitter.frame().unwrap().push_constant(Constant::Smi(7));
        emitter.bind(join).unwrap();

        let frame = emitter.frame_ref().unwrap();
        let expected = emitter.target(join).entry_frame().unwrap();
        assert!(frame.equals(expected));
        assert_eq!(frame.elements().last().unwrap().register(), Some(Reg::R1));
        assert!(emitter.masm.instructions().contains(&Instruction::Mov {
            dst: Reg::R1,
            src: crate::machine::Operand::smi(7)
        }));
    }

    #[test]
    fn test_branch_with_matching_frame_is_direct() {
        let mut emitter = emitter_with_frame();
        let target = emitter.forward_target();
        let before = emitter.masm.pc_offset();
        emitter.branch(target, Condition::Eq).unwrap();
        assert_eq!(emitter.masm.pc_offset(), before + 1);
        assert!(emitter.has_valid_frame());
    }

    #[test]
    fn test_branch_needing_merge_skips_around() {
        let mut emitter = emitter_with_frame();
        let target = emitter.forward_target();
        emitter.frame().unwrap().push_constant(Constant::Smi(1));
        emitter.branch(target, Condition::Lt).unwrap();
        let code = emitter.masm.instructions();
        let first_branch = code
            .iter()
            .position(|i| matches!(i, Instruction::Branch { .. }))
            .unwrap();
        assert!(matches!(
            code[first_branch],
            Instruction::Branch {
                cond: Condition::Ge,
                ..
            }
        ));
        // The fall-through frame still holds the constant.
        let frame = emitter.frame_ref().unwrap();
        assert!(matches!(
            frame.elements().last(),
            Some(super::super::virtual_frame::FrameElement::Constant(_))
        ));
    }

    #[test]
    fn test_expected_height_drops_excess() {
        let mut emitter = emitter_with_frame();
        let target = emitter.forward_target();
        emitter.set_expected_height(target, 0);
        {
            let (masm, frame) = emitter.parts().unwrap();
            frame.emit_push(masm, Reg::R0).unwrap();
            frame.emit_push(masm, Reg::R0).unwrap();
        }
        emitter.jump(target).unwrap();
        emitter.bind(target).unwrap();
        assert_eq!(emitter.frame_ref().unwrap().height(), 0);
    }

    #[test]
    fn test_bind_errors() {
        let mut emitter = emitter_with_frame();
        let unreached = emitter.forward_target();
        emitter.take_frame();
        assert!(matches!(emitter.bind(unreached), Err(Error::Internal(_))));

        let mut emitter = emitter_with_frame();
        let twice = emitter.forward_target();
        emitter.bind(twice).unwrap();
        assert!(matches!(emitter.bind(twice), Err(Error::Internal(_))));
    }

    #[test]
    fn test_bidirectional_back_edge() {
        let mut emitter = emitter_with_frame();
        let header = emitter.new_target(Direction::Bidirectional);
        emitter.bind(header).unwrap();
        emitter.jump(header).unwrap();
        assert!(!emitter.has_valid_frame());
        let (masm, _) = emitter.finish();
        assert!(masm.instructions().iter().any(Instruction::is_terminating));
    }
}
