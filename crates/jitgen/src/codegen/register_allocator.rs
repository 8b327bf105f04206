//! Reference-counted allocation of the registers the generator owns.
//!
//! A register is free when nothing refers to it. Frame elements and
//! [`RegisterGuard`]s each hold one reference; a register referenced by three
//! frame elements and one guard has count 4.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::machine::Reg;

type Counts = Rc<[Cell<usize>; Reg::NUM_ALLOCATABLE]>;

/// Per-register reference counts, shared between the generator, the current
/// frame and every live guard.
#[derive(Clone, Default)]
pub struct RegisterFile {
    counts: Counts,
}

impl RegisterFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lowest-numbered free register, or `None` when every register is
    /// referenced. The caller spills the frame and retries.
    #[must_use]
    pub fn allocate_any(&self) -> Option<RegisterGuard> {
        (0..Reg::NUM_ALLOCATABLE)
            .map(Reg::allocatable)
            .find(|&reg| self.count(reg) == 0)
            .map(|reg| self.guard(reg))
    }

    /// `reg` if it is free. A busy register is not an error.
    #[must_use]
    pub fn allocate(&self, reg: Reg) -> Option<RegisterGuard> {
        (reg.is_allocatable() && self.count(reg) == 0).then(|| self.guard(reg))
    }

    /// A new guard on `reg`, whatever its current count.
    #[must_use]
    pub fn guard(&self, reg: Reg) -> RegisterGuard {
        self.use_register(reg);
        RegisterGuard {
            reg,
            counts: Rc::clone(&self.counts),
        }
    }

    /// Wraps a reference already counted elsewhere (a popped frame element)
    /// in a guard without changing the count.
    #[must_use]
    pub fn adopt(&self, reg: Reg) -> RegisterGuard {
        RegisterGuard {
            reg,
            counts: Rc::clone(&self.counts),
        }
    }

    pub fn use_register(&self, reg: Reg) {
        if let Some(cell) = self.counts.get(reg.index()) {
            cell.set(cell.get() + 1);
        }
    }

    pub fn unuse_register(&self, reg: Reg) {
        if let Some(cell) = self.counts.get(reg.index()) {
            debug_assert!(cell.get() > 0, "unuse of free register {reg}");
            cell.set(cell.get().saturating_sub(1));
        }
    }

    #[must_use]
    pub fn count(&self, reg: Reg) -> usize {
        self.counts.get(reg.index()).map_or(0, Cell::get)
    }

    #[must_use]
    pub fn is_used(&self, reg: Reg) -> bool {
        self.count(reg) > 0
    }

    /// Registers with a nonzero count.
    #[must_use]
    pub fn used_registers(&self) -> Vec<Reg> {
        (0..Reg::NUM_ALLOCATABLE)
            .map(Reg::allocatable)
            .filter(|&reg| self.is_used(reg))
            .collect()
    }

    #[must_use]
    pub fn all_free(&self) -> bool {
        self.counts.iter().all(|cell| cell.get() == 0)
    }

    pub fn reset(&self) {
        for cell in self.counts.iter() {
            cell.set(0);
        }
    }
}

impl fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<usize> = self.counts.iter().map(Cell::get).collect();
        f.debug_struct("RegisterFile").field("counts", &counts).finish()
    }
}

/// One reference to an allocated register; dropping it releases the reference.
pub struct RegisterGuard {
    reg: Reg,
    counts: Counts,
}

impl RegisterGuard {
    #[must_use]
    pub fn reg(&self) -> Reg {
        self.reg
    }
}

impl Clone for RegisterGuard {
    fn clone(&self) -> Self {
        if let Some(cell) = self.counts.get(self.reg.index()) {
            cell.set(cell.get() + 1);
        }
        Self {
            reg: self.reg,
            counts: Rc::clone(&self.counts),
        }
    }
}

impl Drop for RegisterGuard {
    fn drop(&mut self) {
        if let Some(cell) = self.counts.get(self.reg.index()) {
            cell.set(cell.get().saturating_sub(1));
        }
    }
}

impl fmt::Debug for RegisterGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegisterGuard({})", self.reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_any_picks_lowest_free() {
        let registers = RegisterFile::new();
        let a = registers.allocate_any().unwrap();
        let b = registers.allocate_any().unwrap();
        assert_eq!(a.reg(), Reg::R0);
        assert_eq!(b.reg(), Reg::R1);
        drop(a);
        assert_eq!(registers.allocate_any().unwrap().reg(), Reg::R0);
    }

    #[test]
    fn test_allocate_busy_register_returns_none() {
        let registers = RegisterFile::new();
        let _held = registers.allocate(Reg::R3).unwrap();
        assert!(registers.allocate(Reg::R3).is_none());
        assert!(registers.allocate(Reg::IP).is_none());
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let registers = RegisterFile::new();
        let held: Vec<_> = (0..Reg::NUM_ALLOCATABLE)
            .map(|_| registers.allocate_any().unwrap())
            .collect();
        assert!(registers.allocate_any().is_none());
        drop(held);
        assert!(registers.all_free());
    }

    #[test]
    fn test_guard_clone_and_adopt_keep_counts_balanced() {
        let registers = RegisterFile::new();
        let guard = registers.allocate(Reg::R2).unwrap();
        let copy = guard.clone();
        assert_eq!(registers.count(Reg::R2), 2);
        drop(guard);
        drop(copy);
        assert!(registers.all_free());

        registers.use_register(Reg::R5);
        let adopted = registers.adopt(Reg::R5);
        assert_eq!(registers.count(Reg::R5), 1);
        drop(adopted);
        assert_eq!(registers.count(Reg::R5), 0);
    }
}
