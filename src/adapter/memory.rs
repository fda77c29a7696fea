#[cfg(test)]
mod memory_test;

use std::sync::{Arc, Mutex};

/// One allocation inside the registered transmit region.
///
/// Only offsets cross the adapter boundary; the provider resolves them
/// against the base address it registered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemBlock {
    pub offset: usize,
    pub len: usize,
}

/// Fixed-size block allocator over the contiguous transmit buffer.
///
/// Packet headers must live inside the region the provider registered at
/// open time, so every header allocation comes from here and is returned
/// when the packet's send completion arrives.
#[derive(Debug)]
pub struct MemRegion {
    storage: Vec<u8>,
    block_size: usize,
    free: Vec<usize>,
}

pub type SharedRegion = Arc<Mutex<MemRegion>>;

impl MemRegion {
    pub fn new(total_bytes: usize, block_size: usize) -> Self {
        let blocks = total_bytes / block_size;
        // Hand out low offsets first.
        let free = (0..blocks).rev().map(|i| i * block_size).collect();
        MemRegion {
            storage: vec![0u8; blocks * block_size],
            block_size,
            free,
        }
    }

    pub fn shared(total_bytes: usize, block_size: usize) -> SharedRegion {
        Arc::new(Mutex::new(MemRegion::new(total_bytes, block_size)))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    pub fn capacity_blocks(&self) -> usize {
        self.storage.len() / self.block_size
    }

    /// Takes one block; `None` under exhaustion or for an oversized ask.
    pub fn alloc(&mut self, len: usize) -> Option<MemBlock> {
        if len > self.block_size {
            return None;
        }
        let offset = self.free.pop()?;
        Some(MemBlock { offset, len })
    }

    pub fn free(&mut self, block: MemBlock) {
        debug_assert_eq!(block.offset % self.block_size, 0);
        self.free.push(block.offset);
    }

    pub fn write(&mut self, block: &MemBlock, bytes: &[u8]) {
        debug_assert!(bytes.len() <= block.len);
        self.storage[block.offset..block.offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn slice(&self, block: &MemBlock) -> &[u8] {
        &self.storage[block.offset..block.offset + block.len]
    }
}
