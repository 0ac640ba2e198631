use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use crate::error::Result;
use crate::runtime::{Buffer, Runtime};

/// Width of the largest supported dtype.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// First-fit offset planner over a notional contiguous address space.
/// `alloc` and `free` only move offsets around; the real buffer is obtained
/// from the runtime once, when `materialize` is called, and is sized by the
/// peak footprint seen until then.
#[derive(Debug)]
pub struct Allocator {
    runtime: Arc<dyn Runtime>,
    /// Free blocks keyed by base offset, value is the block size. Touching
    /// blocks are always coalesced, so no two entries are adjacent.
    free_blocks: BTreeMap<usize, usize>,
    /// Bytes currently handed out.
    used: usize,
    /// Size the materialized buffer will have.
    peak: usize,
    /// End of the highest placement so far; where the arena grows when no
    /// free block fits.
    frontier: usize,
    alignment: usize,
    buffer: Option<Buffer>,
}

impl Allocator {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            free_blocks: BTreeMap::new(),
            used: 0,
            peak: 0,
            frontier: 0,
            alignment: DEFAULT_ALIGNMENT,
            buffer: None,
        }
    }

    /// Reserve `size` bytes and return the offset of the placement. The
    /// first free block (in ascending base order) that fits is split;
    /// otherwise the arena grows at its frontier. Must not be called once
    /// the buffer has been materialized.
    pub fn alloc(&mut self, size: usize) -> usize {
        assert!(
            self.buffer.is_none(),
            "alloc: arena is already materialized"
        );
        let size = self.aligned_size(size);
        if size == 0 {
            return 0;
        }
        let candidate = self
            .free_blocks
            .iter()
            .find(|(_, &block_size)| block_size >= size)
            .map(|(&base, &block_size)| (base, block_size));
        let offset = match candidate {
            Some((base, block_size)) => {
                self.free_blocks.remove(&base);
                if block_size > size {
                    self.free_blocks.insert(base + size, block_size - size);
                }
                base
            }
            None => {
                let base = self.frontier;
                self.frontier += size;
                self.peak = self.peak.max(self.frontier);
                base
            }
        };
        self.used += size;
        offset
    }

    /// Return a block to the free list, coalescing with the blocks that end
    /// at `addr` and start at `addr + size`. `addr` and `size` must be the
    /// exact pair a prior `alloc` handed out; the aligned size is recomputed
    /// the same way and `used` accounting relies on it.
    pub fn free(&mut self, addr: usize, size: usize) {
        assert!(self.buffer.is_none(), "free: arena is already materialized");
        let size = self.aligned_size(size);
        if size == 0 {
            return;
        }
        let mut base = addr;
        let mut len = size;
        if let Some((&prev_base, &prev_len)) = self.free_blocks.range(..addr).next_back() {
            if prev_base + prev_len == addr {
                self.free_blocks.remove(&prev_base);
                base = prev_base;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free_blocks.get(&(addr + size)) {
            self.free_blocks.remove(&(addr + size));
            len += next_len;
        }
        self.free_blocks.insert(base, len);
        self.used -= size;
    }

    /// Obtain the backing buffer, requesting it from the runtime on the
    /// first call. Later calls return the same buffer.
    pub fn materialize(&mut self) -> Result<Buffer> {
        if let Some(buffer) = &self.buffer {
            return Ok(buffer.clone());
        }
        let buffer = self.runtime.alloc(self.peak)?;
        info!(
            "arena materialized: {} bytes on {}",
            self.peak,
            self.runtime.name()
        );
        self.buffer = Some(buffer.clone());
        Ok(buffer)
    }

    pub fn is_materialized(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Round `size` up to the alignment. Zero stays zero.
    pub fn aligned_size(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        ((size - 1) / self.alignment + 1) * self.alignment
    }

    /// Snapshot of the free list as `(base, size)` pairs in address order.
    pub fn free_blocks(&self) -> Vec<(usize, usize)> {
        self.free_blocks
            .iter()
            .map(|(&base, &size)| (base, size))
            .collect()
    }
}
