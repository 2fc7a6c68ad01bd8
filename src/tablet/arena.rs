//! Memory arena for row decoding.
//!
//! Decoded row operations borrow their keys and values from a shared
//! arena so a multi-row write performs a handful of block allocations
//! instead of one per cell. Blocks are reference-counted `Bytes`
//! buffers; `reset` starts a fresh block while rows still holding
//! slices of old blocks keep them alive.

use bytes::{Bytes, BytesMut};

/// Bump allocator over reference-counted byte blocks.
///
/// Block sizes double from the initial size up to the configured
/// maximum as the arena grows.
#[derive(Debug)]
pub struct RowArena {
    block: BytesMut,
    initial_block_size: usize,
    next_block_size: usize,
    max_block_size: usize,
    memory_usage: usize,
}

impl RowArena {
    /// Create an arena with the given initial and maximum block sizes.
    pub fn new(initial_block_size: usize, max_block_size: usize) -> Self {
        debug_assert!(initial_block_size > 0);
        debug_assert!(max_block_size >= initial_block_size);
        Self {
            block: BytesMut::with_capacity(initial_block_size),
            initial_block_size,
            next_block_size: initial_block_size,
            max_block_size,
            memory_usage: initial_block_size,
        }
    }

    /// Copy `data` into the arena and return an owned slice of it.
    pub fn dup(&mut self, data: &[u8]) -> Bytes {
        if self.block.capacity() - self.block.len() < data.len() {
            self.grow(data.len());
        }
        self.block.extend_from_slice(data);
        self.block.split_to(self.block.len()).freeze()
    }

    /// Discard the current block and start fresh.
    ///
    /// Slices handed out earlier remain valid; they keep their backing
    /// blocks alive through their reference counts.
    pub fn reset(&mut self) {
        self.block = BytesMut::with_capacity(self.initial_block_size);
        self.next_block_size = self.initial_block_size;
        self.memory_usage = self.initial_block_size;
    }

    /// Total bytes of block capacity allocated since the last reset.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    fn grow(&mut self, at_least: usize) {
        self.next_block_size = (self.next_block_size * 2).min(self.max_block_size);
        let size = self.next_block_size.max(at_least);
        self.block = BytesMut::with_capacity(size);
        self.memory_usage += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dup_copies() {
        let mut arena = RowArena::new(64, 1024);
        let a = arena.dup(b"row-a");
        let b = arena.dup(b"row-b");
        assert_eq!(&a[..], b"row-a");
        assert_eq!(&b[..], b"row-b");
    }

    #[test]
    fn test_slices_survive_reset() {
        let mut arena = RowArena::new(64, 1024);
        let a = arena.dup(b"survivor");
        arena.reset();
        let b = arena.dup(b"fresh");
        assert_eq!(&a[..], b"survivor");
        assert_eq!(&b[..], b"fresh");
    }

    #[test]
    fn test_blocks_double_up_to_max() {
        let mut arena = RowArena::new(16, 64);
        let base = arena.memory_usage();
        assert_eq!(base, 16);

        // Overflow the first block: next is 32.
        arena.dup(&[0u8; 20]);
        assert_eq!(arena.memory_usage(), 16 + 32);

        // Overflow again: 64, then the cap holds.
        arena.dup(&[0u8; 40]);
        arena.dup(&[0u8; 60]);
        assert_eq!(arena.memory_usage(), 16 + 32 + 64 + 64);
    }

    #[test]
    fn test_oversized_allocation() {
        let mut arena = RowArena::new(16, 64);
        let big = arena.dup(&[7u8; 500]);
        assert_eq!(big.len(), 500);
    }
}
