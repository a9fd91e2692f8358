//! The shared-memory allocator.
//!
//! ## [`MemoryPool`](struct.MemoryPool.html)
//!
//! A `MemoryPool` carves one fixed range of device RAM into variable-size
//! blocks for commands, images and data chunks. It never grows and never
//! compacts: when no free extent is large enough, [`alloc`](MemoryPool::alloc)
//! returns `None` and the caller runs its recovery path.
//!
//! ## [`Block`](struct.Block.html)
//!
//! A `Block` is the handle to one live allocation. It is neither `Copy` nor
//! `Clone`: there is one owner at a time, and freeing consumes it. Once a
//! block's offset has been published to the device the handle is given up
//! with [`Block::into_offset`], and recovered later from the offset the
//! device returns with [`MemoryPool::reclaim`], which checks that the offset
//! really names a live allocation.
//!
//! All sizes are rounded up to [`GRANULE`] bytes. No header is kept in shared
//! memory, so a pool's bytes are always exactly accounted as live blocks,
//! free extents, and the alignment slack trimmed off its two ends.

use std::collections::BTreeMap;
use std::ops::Range;

use log::{debug, info};

use crate::blocklist::{BlockList, Stats, Validity};
use crate::error::PoolError;

/// Allocation granularity and alignment, in bytes.
pub const GRANULE: usize = 16;

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

fn round_down(value: usize, increment: usize) -> usize {
    increment * (value / increment)
}

/// A live allocation in a [`MemoryPool`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a Block leaks it until the next pool reset"]
pub struct Block {
    offset: usize,
    size: usize,
    epoch: u32,
}

impl Block {
    /// Offset of the block from the start of device RAM.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Usable size of the block; at least what was asked for.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..(self.offset + self.size)
    }

    /// Give up the handle once the device owns the block. The allocation
    /// stays live until [`MemoryPool::reclaim`] turns the offset back into a
    /// handle.
    pub fn into_offset(self) -> usize {
        self.offset
    }
}

/// Statistics on a pool, as reported by [`MemoryPool::dump_stats`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub overhead: usize,
    pub live_blocks: usize,
    pub live_bytes: usize,
    pub free: Stats,
}

pub struct MemoryPool {
    // Usable range, trimmed to GRANULE alignment.
    usable: Range<usize>,
    size: usize,
    blocks: BlockList,
    // offset -> size of every live block
    live: BTreeMap<usize, usize>,
    live_bytes: usize,
    // Bumped by free_all, so older handles are recognisably stale.
    epoch: u32,
}

impl MemoryPool {
    /// Create a pool over `size` bytes of device RAM starting at offset
    /// `base`.
    pub fn new(base: usize, size: usize) -> MemoryPool {
        let start = round_up(base, GRANULE);
        let end = round_down(base + size, GRANULE).max(start);
        let usable = start..end;
        info!(
            "memory pool at {:#x}+{:#x}: {} usable bytes",
            base,
            size,
            usable.len()
        );
        MemoryPool {
            blocks: BlockList::with_range(usable.clone()),
            usable,
            size,
            live: BTreeMap::new(),
            live_bytes: 0,
            epoch: 0,
        }
    }

    /// Calculate the size of the block handed out for a request of `n_bytes`.
    pub fn block_size(n_bytes: usize) -> usize {
        round_up(n_bytes.max(1), GRANULE)
    }

    /// Total bytes the pool was created over.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes that can be handed out when nothing is live.
    pub fn capacity(&self) -> usize {
        self.usable.len()
    }

    /// Bytes lost to alignment at the ends of the pool.
    pub fn overhead(&self) -> usize {
        self.size - self.usable.len()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.usable.contains(&offset)
    }

    /// Allocate at least `n_bytes`. Returns `None` when no free extent is big
    /// enough; this never blocks and never grows the pool.
    pub fn alloc(&mut self, n_bytes: usize) -> Option<Block> {
        let needed = MemoryPool::block_size(n_bytes);
        let range = self.blocks.pop_size(needed)?;
        debug!("alloc({}) -> {:#x}+{}", n_bytes, range.start, needed);

        self.live.insert(range.start, needed);
        self.live_bytes += needed;
        Some(Block {
            offset: range.start,
            size: needed,
            epoch: self.epoch,
        })
    }

    /// Return a block to the pool. Returns the number of bytes freed.
    pub fn free(&mut self, block: Block) -> Result<usize, PoolError> {
        if block.epoch != self.epoch {
            return Err(PoolError::Stale {
                offset: block.offset,
            });
        }

        let size = match self.live.get(&block.offset) {
            Some(&size) if size == block.size => size,
            _ => {
                return Err(PoolError::NotAllocated {
                    offset: block.offset,
                })
            }
        };

        self.blocks.add_block(block.range())?;
        self.live.remove(&block.offset);
        self.live_bytes -= size;
        debug!("free({:#x}) <- {} bytes", block.offset, size);
        Ok(size)
    }

    /// Turn an offset the device handed back into a block handle.
    ///
    /// Fails unless `offset` is the start of a live allocation; this is the
    /// check that catches double frees and made-up identifiers.
    pub fn reclaim(&self, offset: usize) -> Result<Block, PoolError> {
        if !self.contains(offset) {
            return Err(PoolError::OutOfRange { offset });
        }
        match self.live.get(&offset) {
            Some(&size) => Ok(Block {
                offset,
                size,
                epoch: self.epoch,
            }),
            None => Err(PoolError::NotAllocated { offset }),
        }
    }

    /// Reclaim and free in one step.
    pub fn free_offset(&mut self, offset: usize) -> Result<usize, PoolError> {
        let block = self.reclaim(offset)?;
        self.free(block)
    }

    /// Mark the whole pool free. Every outstanding block is invalidated.
    ///
    /// Only safe once the device can no longer reference anything in the
    /// pool, i.e. right after it has been reset.
    pub fn free_all(&mut self) {
        debug!(
            "free_all: dropping {} live blocks ({} bytes)",
            self.live.len(),
            self.live_bytes
        );
        self.blocks.reset(self.usable.clone());
        self.live.clear();
        self.live_bytes = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Get statistics on this pool, and verify validity of the free list
    pub fn stats(&self) -> (Validity, PoolStats) {
        let (validity, free) = self.blocks.stats();
        let stats = PoolStats {
            capacity: self.capacity(),
            overhead: self.overhead(),
            live_blocks: self.live.len(),
            live_bytes: self.live_bytes,
            free,
        };
        (validity, stats)
    }

    /// Log every free and used extent under `label`, and return the totals.
    pub fn dump_stats(&self, label: &str) -> PoolStats {
        let (validity, stats) = self.stats();
        info!("{}", label.trim_end());
        info!(
            "  {} bytes: {} live blocks ({} bytes), {} free extents ({} bytes, largest {}), {} overhead",
            self.size,
            stats.live_blocks,
            stats.live_bytes,
            stats.free.length,
            stats.free.size,
            stats.free.largest,
            stats.overhead,
        );
        for extent in &self.blocks {
            info!("  free {:#x}..{:#x}", extent.start(), extent.as_range().end);
        }
        for (offset, size) in &self.live {
            info!("  used {:#x}..{:#x}", offset, offset + size);
        }
        if !validity.is_valid() {
            log::error!("  free list is corrupt: {:?}", validity);
        }
        stats
    }
}
