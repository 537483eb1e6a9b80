//! Block allocation and raw block writes.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CatalogError, Result};

pub const ALLOC_CONTIGUOUS: u32 = 0x01;
pub const ALLOC_METADATA_ZONE: u32 = 0x02;
pub const ALLOC_FLUSH_JOURNAL: u32 = 0x04;

pub trait BlockAllocator: Send + Sync {
    /// Allocate between `min_blocks` and `max_blocks` blocks near `start_hint`.
    /// Returns `(start_block, block_count)`.
    fn allocate(&self, start_hint: u32, min_blocks: u32, max_blocks: u32, flags: u32)
        -> Result<(u32, u32)>;

    fn deallocate(&self, start_block: u32, block_count: u32) -> Result<()>;

    fn write_blocks(&self, start_block: u32, data: &[u8]) -> Result<()>;

    fn block_size(&self) -> u32;

    fn free_blocks(&self) -> u32;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitmapState {
    pub block_size: u32,
    pub total_blocks: u32,
    /// Leading blocks reserved for metadata allocations.
    pub metadata_zone: u32,
    pub bitmap: Vec<u64>,
    /// Blocks freed since the last journal flush. They stay unavailable
    /// until an allocation asks for the flush; saving the image flushes.
    #[serde(skip)]
    pub pending_free: Vec<u64>,
    pub data: HashMap<u32, Vec<u8>>,
}

/// In-memory allocation bitmap.
pub struct BitmapAllocator {
    state: Mutex<BitmapState>,
}

impl BitmapAllocator {
    pub fn new(block_size: u32, total_blocks: u32) -> Self {
        let words = (total_blocks as usize).div_ceil(64);
        Self {
            state: Mutex::new(BitmapState {
                block_size,
                total_blocks,
                metadata_zone: (total_blocks / 16).max(1),
                bitmap: vec![0; words],
                pending_free: vec![0; words],
                data: HashMap::new(),
            }),
        }
    }

    pub fn from_state(state: BitmapState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> BitmapState {
        self.state.lock().clone()
    }

    /// False for blocks past the end of the volume.
    pub fn is_allocated(&self, block: u32) -> bool {
        let s = self.state.lock();
        block < s.total_blocks && test_bit(&s.bitmap, block)
    }

    /// Freed blocks still waiting for a journal flush.
    pub fn pending_free_blocks(&self) -> u32 {
        let s = self.state.lock();
        s.pending_free.iter().map(|w| w.count_ones()).sum()
    }

    pub fn read_block(&self, block: u32) -> Option<Vec<u8>> {
        self.state.lock().data.get(&block).cloned()
    }
}

fn test_bit(bitmap: &[u64], block: u32) -> bool {
    bitmap
        .get((block / 64) as usize)
        .is_some_and(|word| word & (1u64 << (block % 64)) != 0)
}

fn set_bit(bitmap: &mut Vec<u64>, block: u32, on: bool) {
    let at = (block / 64) as usize;
    if at >= bitmap.len() {
        if !on {
            return;
        }
        bitmap.resize(at + 1, 0);
    }
    let mask = 1u64 << (block % 64);
    if on {
        bitmap[at] |= mask;
    } else {
        bitmap[at] &= !mask;
    }
}

impl BitmapState {
    fn busy(&self, block: u32) -> bool {
        test_bit(&self.bitmap, block) || test_bit(&self.pending_free, block)
    }

    /// First free run of at least `min` blocks in `[from, to)`, capped at `max`.
    fn find_run(&self, from: u32, to: u32, min: u32, max: u32) -> Option<(u32, u32)> {
        let mut block = from;
        while block < to {
            if self.busy(block) {
                block += 1;
                continue;
            }
            let start = block;
            while block < to && block - start < max && !self.busy(block) {
                block += 1;
            }
            if block - start >= min {
                return Some((start, block - start));
            }
        }
        None
    }
}

impl BlockAllocator for BitmapAllocator {
    fn allocate(
        &self,
        start_hint: u32,
        min_blocks: u32,
        max_blocks: u32,
        flags: u32,
    ) -> Result<(u32, u32)> {
        if min_blocks == 0 || max_blocks < min_blocks {
            return Err(CatalogError::InvalidArgument("bad allocation range".into()));
        }
        let mut s = self.state.lock();
        if flags & ALLOC_FLUSH_JOURNAL != 0 {
            let released: u32 = s.pending_free.iter().map(|w| w.count_ones()).sum();
            s.pending_free.iter_mut().for_each(|w| *w = 0);
            debug!("journal flush released {} freed blocks", released);
        }
        let (lo, hi) = if flags & ALLOC_METADATA_ZONE != 0 {
            (0, s.total_blocks)
        } else {
            (s.metadata_zone.min(s.total_blocks), s.total_blocks)
        };
        // Runs are always contiguous.
        let hint = start_hint.clamp(lo, hi);
        let found = s
            .find_run(hint, hi, min_blocks, max_blocks)
            .or_else(|| s.find_run(lo, hint, min_blocks, max_blocks));
        let Some((start, count)) = found else {
            return Err(CatalogError::NoSpace);
        };
        for b in start..start + count {
            set_bit(&mut s.bitmap, b, true);
        }
        debug!("allocated {} blocks at {}", count, start);
        Ok((start, count))
    }

    fn deallocate(&self, start_block: u32, block_count: u32) -> Result<()> {
        let mut s = self.state.lock();
        if start_block.saturating_add(block_count) > s.total_blocks {
            return Err(CatalogError::InvalidArgument("extent past end of volume".into()));
        }
        for b in start_block..start_block + block_count {
            set_bit(&mut s.bitmap, b, false);
            set_bit(&mut s.pending_free, b, true);
            s.data.remove(&b);
        }
        debug!("deallocated {} blocks at {}", block_count, start_block);
        Ok(())
    }

    fn write_blocks(&self, start_block: u32, data: &[u8]) -> Result<()> {
        let mut s = self.state.lock();
        let bs = s.block_size as usize;
        for (i, chunk) in data.chunks(bs).enumerate() {
            let block = start_block + i as u32;
            if block >= s.total_blocks || !test_bit(&s.bitmap, block) {
                return Err(CatalogError::InvalidArgument(format!(
                    "write to unallocated block {}",
                    block
                )));
            }
            let mut buf = chunk.to_vec();
            buf.resize(bs, 0);
            s.data.insert(block, buf);
        }
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.state.lock().block_size
    }

    fn free_blocks(&self) -> u32 {
        let s = self.state.lock();
        (0..s.total_blocks).filter(|&b| !test_bit(&s.bitmap, b)).count() as u32
    }
}
