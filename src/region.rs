//! Memory region under test and its block addressing.
//!
//! The region is exposed to kernels as word-addressable storage. Every
//! access is a relaxed atomic so that concurrent workers never race in the
//! Rust sense; the only cross-worker ordering the tests rely on comes from
//! launch boundaries.

use crate::error::DeviceError;
use std::sync::atomic::{AtomicU32, Ordering};

/// Default block size for memory testing (1 MiB).
pub const BLOCK_SIZE: usize = 1024 * 1024;

/// Smallest block size the test algorithms can operate on.
pub const MIN_BLOCK_SIZE: usize = 4 * 1024;

/// Bytes per 32-bit word.
pub const WORD_BYTES: usize = std::mem::size_of::<u32>();

/// Bytes per 64-bit word.
pub const WIDE_WORD_BYTES: usize = std::mem::size_of::<u64>();

/// A contiguous span of device memory, owned by the test driver for a run.
pub struct DeviceRegion {
    base: u64,
    words: Box<[AtomicU32]>,
}

impl DeviceRegion {
    /// Allocates a zero-filled region of `bytes` bytes.
    ///
    /// `base` is the address reported for byte offset 0. When `None`, the
    /// host address of the backing storage is used.
    pub fn allocate(bytes: usize, base: Option<u64>) -> Result<Self, DeviceError> {
        let count = bytes / WORD_BYTES;
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| DeviceError::BufferAllocation {
                requested_mb: (bytes / (1024 * 1024)) as u64,
            })?;
        words.resize_with(count, || AtomicU32::new(0));
        let words = words.into_boxed_slice();
        let base = base.unwrap_or(words.as_ptr() as u64);
        Ok(Self { base, words })
    }

    /// Address reported for byte offset 0.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Region length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    /// Region length in 32-bit words.
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn load(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    pub fn store(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    /// Reads 64-bit word `index` (little-endian halves).
    pub fn load_wide(&self, index: usize) -> u64 {
        let lo = self.load(index * 2) as u64;
        let hi = self.load(index * 2 + 1) as u64;
        (hi << 32) | lo
    }

    /// Writes 64-bit word `index` (little-endian halves).
    pub fn store_wide(&self, index: usize, value: u64) {
        self.store(index * 2, value as u32);
        self.store(index * 2 + 1, (value >> 32) as u32);
    }

    /// Device address of 32-bit word `index`.
    pub fn word_address(&self, index: usize) -> u64 {
        self.base + (index * WORD_BYTES) as u64
    }

    /// Device address of 64-bit word `index`.
    pub fn wide_address(&self, index: usize) -> u64 {
        self.base + (index * WIDE_WORD_BYTES) as u64
    }

    /// Copies host words into the region starting at `offset`.
    pub fn copy_from_host(&self, offset: usize, data: &[u32]) -> Result<(), DeviceError> {
        let target = self.range(offset, data.len())?;
        for (word, &value) in target.iter().zip(data) {
            word.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Snapshot of `len` words starting at `offset`.
    pub fn copy_to_host(&self, offset: usize, len: usize) -> Result<Vec<u32>, DeviceError> {
        Ok(self
            .range(offset, len)?
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect())
    }

    /// Sets every word of the region to `value`.
    #[cfg(test)]
    pub fn fill(&self, value: u32) {
        for word in self.words.iter() {
            word.store(value, Ordering::Relaxed);
        }
    }

    fn range(&self, offset: usize, len: usize) -> Result<&[AtomicU32], DeviceError> {
        offset
            .checked_add(len)
            .and_then(|end| self.words.get(offset..end))
            .ok_or(DeviceError::OutOfRange {
                offset,
                len,
                region_words: self.words.len(),
            })
    }
}

impl std::fmt::Debug for DeviceRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}

/// One block of the region, in 32-bit word indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub index: usize,
    pub start_word: usize,
    pub end_word: usize,
}

impl BlockRange {
    pub fn len_words(&self) -> usize {
        self.end_word - self.start_word
    }

    /// Word indices covered by this block.
    pub fn words(&self) -> std::ops::Range<usize> {
        self.start_word..self.end_word
    }

    /// Byte offset of the block start within the region.
    pub fn start_byte(&self) -> u64 {
        (self.start_word * WORD_BYTES) as u64
    }

    /// Byte offset one past the block end.
    pub fn end_byte(&self) -> u64 {
        (self.end_word * WORD_BYTES) as u64
    }
}

/// Maps block indices onto the region: block `w` starts at `w * block_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: usize,
    total_blocks: usize,
}

impl BlockLayout {
    pub fn new(block_size: usize, total_blocks: usize) -> Self {
        Self {
            block_size,
            total_blocks,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn region_bytes(&self) -> usize {
        self.block_size * self.total_blocks
    }

    pub fn words_per_block(&self) -> usize {
        self.block_size / WORD_BYTES
    }

    /// Range of block `index`, or `None` when it starts at or past the region end.
    pub fn block(&self, index: usize) -> Option<BlockRange> {
        let start = index.checked_mul(self.block_size)?;
        if start >= self.region_bytes() {
            return None;
        }
        let start_word = start / WORD_BYTES;
        Some(BlockRange {
            index,
            start_word,
            end_word: start_word + self.words_per_block(),
        })
    }
}

/// The lanes of one stress worker: a strided walk over its group's chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressLane {
    /// First 64-bit word of the group's chunk.
    pub chunk_start: usize,
    /// 64-bit words in the chunk.
    pub chunk_words: usize,
    /// Lane index inside the group; also the first word it touches.
    pub lane: usize,
    /// Distance between successive words of this lane.
    pub stride: usize,
}

impl StressLane {
    /// Absolute 64-bit word indices touched by this lane.
    pub fn wide_words(&self) -> impl Iterator<Item = usize> {
        let start = self.chunk_start;
        (self.lane..self.chunk_words)
            .step_by(self.stride)
            .map(move |i| start + i)
    }
}

/// Splits the region evenly across a launch grid for bandwidth stress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    groups: usize,
    group_size: usize,
    chunk_words: usize,
}

impl ChunkLayout {
    /// Each of `groups` groups owns `region_bytes / groups` bytes, floored to 64-bit words.
    pub fn new(region_bytes: usize, groups: usize, group_size: usize) -> Self {
        let chunk_words = if groups == 0 {
            0
        } else {
            region_bytes / groups / WIDE_WORD_BYTES
        };
        Self {
            groups,
            group_size,
            chunk_words,
        }
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// 64-bit words owned by each group.
    pub fn chunk_words(&self) -> usize {
        self.chunk_words
    }

    /// Bytes covered by all chunks together.
    pub fn covered_bytes(&self) -> u64 {
        (self.groups * self.chunk_words * WIDE_WORD_BYTES) as u64
    }

    /// Lane of `worker`, or `None` when the worker lies outside the grid
    /// or its chunk is empty.
    pub fn lane(&self, worker: usize) -> Option<StressLane> {
        if self.group_size == 0 || self.chunk_words == 0 {
            return None;
        }
        let group = worker / self.group_size;
        if group >= self.groups {
            return None;
        }
        Some(StressLane {
            chunk_start: group * self.chunk_words,
            chunk_words: self.chunk_words,
            lane: worker % self.group_size,
            stride: self.group_size,
        })
    }
}
