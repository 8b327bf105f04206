//! Flat word-addressed memory.
//!
//! ```text
//!   0x0000 .. 0x1000   null page (every access faults)
//!   0x1000             handler cell
//!   0x1004             stack limit cell
//!   STACK_BOTTOM ..    stack, growing down from its top
//!   heap base ..       bump-allocated heap
//! ```

use crate::layout::{HANDLER_ADDRESS, POINTER_SIZE, STACK_LIMIT_ADDRESS};
use crate::{Error, Result};

/// First address past the null page.
const NULL_PAGE_END: u32 = 0x1000;
/// Lowest stack address.
pub const STACK_BOTTOM: u32 = 0x2000;

const WORD: u32 = POINTER_SIZE as u32;

#[derive(Debug)]
pub struct Memory {
    words: Vec<u32>,
    stack_top: u32,
    heap_base: u32,
}

impl Memory {
    /// Memory with a stack and a heap of the given sizes in words.
    #[must_use]
    pub fn new(stack_words: usize, heap_words: usize) -> Self {
        let stack_top = STACK_BOTTOM + (stack_words as u32) * WORD;
        let heap_base = stack_top;
        let total = (heap_base / WORD) as usize + heap_words;
        Self {
            words: vec![0; total],
            stack_top,
            heap_base,
        }
    }

    #[must_use]
    pub fn stack_top(&self) -> u32 {
        self.stack_top
    }

    #[must_use]
    pub fn heap_base(&self) -> u32 {
        self.heap_base
    }

    /// One past the last heap address.
    #[must_use]
    pub fn heap_end(&self) -> u32 {
        (self.words.len() as u32) * WORD
    }

    fn index(&self, address: u32) -> Result<usize> {
        if address < NULL_PAGE_END {
            return Err(Error::Simulator(format!(
                "access to null page at {address:#x}"
            )));
        }
        if address % WORD != 0 {
            return Err(Error::Simulator(format!(
                "unaligned access at {address:#x}"
            )));
        }
        let index = (address / WORD) as usize;
        let in_gap = address > STACK_LIMIT_ADDRESS && address < STACK_BOTTOM;
        if in_gap || index >= self.words.len() {
            return Err(Error::Simulator(format!(
                "access outside memory at {address:#x}"
            )));
        }
        Ok(index)
    }

    pub fn read(&self, address: u32) -> Result<u32> {
        let index = self.index(address)?;
        Ok(self.words[index])
    }

    pub fn write(&mut self, address: u32, value: u32) -> Result<()> {
        let index = self.index(address)?;
        self.words[index] = value;
        Ok(())
    }

    #[must_use]
    pub fn handler(&self) -> u32 {
        self.words[(HANDLER_ADDRESS / WORD) as usize]
    }

    pub fn set_handler(&mut self, value: u32) {
        self.words[(HANDLER_ADDRESS / WORD) as usize] = value;
    }

    pub fn set_stack_limit(&mut self, value: u32) {
        self.words[(STACK_LIMIT_ADDRESS / WORD) as usize] = value;
    }

    #[must_use]
    pub fn stack_limit(&self) -> u32 {
        self.words[(STACK_LIMIT_ADDRESS / WORD) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_page_faults() {
        let memory = Memory::new(16, 16);
        assert!(matches!(memory.read(0), Err(Error::Simulator(_))));
        assert!(memory.read(0xffc).is_err());
    }

    #[test]
    fn test_cells_and_regions() {
        let mut memory = Memory::new(16, 16);
        memory.set_handler(0x2010);
        assert_eq!(memory.read(HANDLER_ADDRESS).unwrap(), 0x2010);
        assert!(memory.read(0x1008).is_err());
        assert_eq!(memory.stack_top(), STACK_BOTTOM + 64);
        memory.write(memory.heap_base(), 7).unwrap();
        assert_eq!(memory.read(memory.heap_base()).unwrap(), 7);
        assert!(memory.read(memory.heap_end()).is_err());
        assert!(memory.read(memory.heap_base() + 2).is_err());
    }
}
