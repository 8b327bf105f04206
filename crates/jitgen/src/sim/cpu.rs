//! Instruction execution.

use super::{ADAPTOR_RETURN, CONSTRUCT_RETURN, Exec, Simulator, Trap};
use crate::Error;
use crate::layout::{
    CONTEXT_OFFSET, HANDLER_FP_OFFSET, HANDLER_NEXT_OFFSET, HANDLER_PC_OFFSET,
    HANDLER_SIZE_IN_WORDS, HANDLER_STATE_OFFSET, POINTER_SIZE, RETURN_SENTINEL, untag_smi,
};
use crate::machine::{AluOp, Instruction, MemOperand, Operand, Reg};

/// Value left in registers clobbered by a write barrier.
const ZAP_VALUE: u32 = 0xDEAD_BEEF;

const WORD: u32 = POINTER_SIZE as u32;

fn add_with_flags(a: u32, b: u32) -> (u32, bool, bool) {
    let (result, carry) = a.overflowing_add(b);
    let overflow = ((a ^ result) & (b ^ result)) >> 31 == 1;
    (result, carry, overflow)
}

/// `a - b`; carry means no borrow.
fn sub_with_flags(a: u32, b: u32) -> (u32, bool, bool) {
    let result = a.wrapping_sub(b);
    let overflow = ((a ^ b) & (a ^ result)) >> 31 == 1;
    (result, a >= b, overflow)
}

impl Simulator {
    pub(super) fn reg(&self, reg: Reg) -> u32 {
        self.cpu.regs[reg.index()]
    }

    pub(super) fn set_reg(&mut self, reg: Reg, value: u32) {
        self.cpu.regs[reg.index()] = value;
    }

    pub(super) fn sp(&self) -> u32 {
        self.reg(Reg::SP)
    }

    pub(super) fn push(&mut self, value: u32) -> Exec<()> {
        let sp = self.sp().wrapping_sub(WORD);
        self.heap.write(sp, value)?;
        self.set_reg(Reg::SP, sp);
        Ok(())
    }

    pub(super) fn pop(&mut self) -> Exec<u32> {
        let sp = self.sp();
        let value = self.heap.read(sp)?;
        self.set_reg(Reg::SP, sp.wrapping_add(WORD));
        Ok(value)
    }

    /// The stack element `depth` words above the top.
    pub(super) fn peek(&self, depth: usize) -> Exec<u32> {
        Ok(self.heap.read(self.sp().wrapping_add(depth as u32 * WORD))?)
    }

    pub(super) fn poke(&mut self, depth: usize, value: u32) -> Exec<()> {
        let address = self.sp().wrapping_add(depth as u32 * WORD);
        Ok(self.heap.write(address, value)?)
    }

    pub(super) fn drop_words(&mut self, count: usize) {
        let sp = self.sp().wrapping_add(count as u32 * WORD);
        self.set_reg(Reg::SP, sp);
    }

    /// Pops `count` arguments pushed left to right.
    pub(super) fn pop_arguments(&mut self, count: usize) -> Exec<Vec<u32>> {
        let arguments = (0..count)
            .map(|index| self.peek(count - 1 - index))
            .collect::<Exec<Vec<_>>>()?;
        self.drop_words(count);
        Ok(arguments)
    }

    fn operand(&self, operand: Operand) -> u32 {
        match operand {
            Operand::Imm(value) => value as u32,
            Operand::Reg(reg) => self.reg(reg),
            Operand::Shifted { reg, shift, amount } => {
                shift.apply(self.reg(reg), u32::from(amount))
            }
        }
    }

    fn address(&self, mem: MemOperand) -> u32 {
        match mem {
            MemOperand::Offset { base, offset } => self.reg(base).wrapping_add_signed(offset),
            MemOperand::Indexed { base, index, shift } => self
                .reg(base)
                .wrapping_add(self.reg(index).wrapping_shl(u32::from(shift))),
        }
    }

    fn set_nz(&mut self, result: u32) {
        self.cpu.n = result >> 31 == 1;
        self.cpu.z = result == 0;
    }

    /// Runs until control returns to [`RETURN_SENTINEL`]. Exceptions are
    /// delivered to handlers above `handler_floor` and propagated otherwise.
    pub(super) fn execute(&mut self, handler_floor: u32) -> Exec<()> {
        loop {
            let outcome = match self.cpu.pc {
                RETURN_SENTINEL => return Ok(()),
                ADAPTOR_RETURN => self.leave_adaptor_frame(),
                CONSTRUCT_RETURN => self.leave_construct_frame(),
                _ => self.step(),
            };
            match outcome {
                Ok(()) => {}
                Err(Trap::Throw(exception)) if self.heap.memory().handler() != handler_floor => {
                    self.unwind(exception)?;
                }
                Err(trap) => return Err(trap),
            }
        }
    }

    /// Resumes at the innermost handler with the exception in `r0`.
    fn unwind(&mut self, exception: u32) -> Exec<()> {
        let handler = self.heap.memory().handler();
        let read = |offset: i32| self.heap.read(handler.wrapping_add_signed(offset));
        let next = read(HANDLER_NEXT_OFFSET)?;
        let state = read(HANDLER_STATE_OFFSET)?;
        let fp = read(HANDLER_FP_OFFSET)?;
        let pc = read(HANDLER_PC_OFFSET)?;
        tracing::trace!(handler = format_args!("{handler:#x}"), state, "unwind");

        self.heap.memory_mut().set_handler(next);
        self.set_reg(Reg::SP, handler + HANDLER_SIZE_IN_WORDS as u32 * WORD);
        self.set_reg(Reg::FP, fp);
        let context = self.heap.read(fp.wrapping_add_signed(CONTEXT_OFFSET))?;
        self.set_reg(Reg::CP, context);
        self.set_reg(Reg::R0, exception);
        self.cpu.pc = pc;
        Ok(())
    }

    fn step(&mut self) -> Exec<()> {
        self.steps += 1;
        if self.steps > self.options.step_limit {
            return Err(Error::Simulator(format!(
                "step limit of {} exceeded",
                self.options.step_limit
            ))
            .into());
        }
        let pc = self.cpu.pc;
        let instruction = Self::decode_address(pc)
            .and_then(|(id, index)| self.codes.get(id)?.code.instructions.get(index))
            .cloned()
            .ok_or_else(|| Error::Simulator(format!("jump to {pc:#x} outside of code")))?;
        let next = pc.wrapping_add(1);

        match instruction {
            Instruction::Stop => {
                return Err(Error::Simulator(format!("stop reached at {pc:#x}")).into());
            }
            Instruction::Mov { dst, src } => {
                let value = self.operand(src);
                self.set_reg(dst, value);
            }
            Instruction::Mvn { dst, src } => {
                let value = !self.operand(src);
                self.set_reg(dst, value);
            }
            Instruction::Alu {
                op,
                set_flags,
                dst,
                lhs,
                rhs,
            } => {
                let a = self.reg(lhs);
                let b = self.operand(rhs);
                let (result, carry, overflow) = match op {
                    AluOp::Add => add_with_flags(a, b),
                    AluOp::Sub => sub_with_flags(a, b),
                    AluOp::Rsb => sub_with_flags(b, a),
                    AluOp::And => (a & b, self.cpu.c, self.cpu.v),
                    AluOp::Orr => (a | b, self.cpu.c, self.cpu.v),
                    AluOp::Eor => (a ^ b, self.cpu.c, self.cpu.v),
                    AluOp::Bic => (a & !b, self.cpu.c, self.cpu.v),
                };
                if set_flags {
                    self.set_nz(result);
                    if op.is_arithmetic() {
                        self.cpu.c = carry;
                        self.cpu.v = overflow;
                    }
                }
                self.set_reg(dst, result);
            }
            Instruction::Cmp { lhs, rhs } => {
                let (result, carry, overflow) = sub_with_flags(self.reg(lhs), self.operand(rhs));
                self.set_nz(result);
                self.cpu.c = carry;
                self.cpu.v = overflow;
            }
            Instruction::Tst { lhs, rhs } => {
                let result = self.reg(lhs) & self.operand(rhs);
                self.set_nz(result);
            }
            Instruction::Ldr { dst, mem } => {
                let value = self.heap.read(self.address(mem))?;
                self.set_reg(dst, value);
            }
            Instruction::Str { src, mem } => {
                let address = self.address(mem);
                let value = self.reg(src);
                self.heap.write(address, value)?;
            }
            Instruction::LoadConstant { dst, index } => {
                let value = Self::decode_address(pc)
                    .and_then(|(id, _)| self.codes.get(id)?.constants.get(index as usize))
                    .copied()
                    .ok_or_else(|| {
                        Error::Simulator(format!("constant {index} missing at {pc:#x}"))
                    })?;
                self.set_reg(dst, value);
            }
            Instruction::Push { src } => {
                let value = self.reg(src);
                self.push(value)?;
            }
            Instruction::Pop { dst } => {
                let value = self.pop()?;
                self.set_reg(dst, value);
            }
            Instruction::Branch { cond, offset } => {
                let cpu = &self.cpu;
                if cond.holds(cpu.n, cpu.z, cpu.c, cpu.v) {
                    self.cpu.pc = pc.wrapping_add_signed(offset);
                    return Ok(());
                }
            }
            Instruction::BranchLink { offset } => {
                self.set_reg(Reg::LR, next);
                self.cpu.pc = pc.wrapping_add_signed(offset);
                return Ok(());
            }
            Instruction::BranchReg { reg } => {
                self.cpu.pc = self.reg(reg);
                return Ok(());
            }
            Instruction::JumpTable { index } => {
                let entry = untag_smi(self.reg(index));
                self.cpu.pc = next.wrapping_add_signed(entry);
                return Ok(());
            }
            Instruction::Call { target } => {
                // Calls into JS code return to the next instruction.
                self.cpu.pc = next;
                return self.dispatch_call(target);
            }
            Instruction::RecordWrite {
                object,
                offset,
                scratch,
            } => {
                let slot = self
                    .reg(object)
                    .wrapping_sub(1)
                    .wrapping_add(self.reg(offset));
                self.remembered_set.insert(slot);
                self.set_reg(offset, ZAP_VALUE);
                self.set_reg(scratch, ZAP_VALUE);
            }
        }
        self.cpu.pc = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_flags() {
        assert_eq!(add_with_flags(1, 2), (3, false, false));
        assert_eq!(add_with_flags(0x7FFF_FFFF, 1), (0x8000_0000, false, true));
        assert_eq!(add_with_flags(0xFFFF_FFFF, 1), (0, true, false));
    }

    #[test]
    fn test_sub_flags() {
        assert_eq!(sub_with_flags(3, 1), (2, true, false));
        assert_eq!(sub_with_flags(1, 3), (0xFFFF_FFFE, false, false));
        assert_eq!(sub_with_flags(0x8000_0000, 1), (0x7FFF_FFFF, true, true));
    }
}
