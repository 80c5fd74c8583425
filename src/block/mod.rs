//! Block layout arithmetic shared by the remote-store backends.
//!
//! Both the SQL block backend and the chunk-store backend map byte-range
//! I/O onto fixed-size records. The mapping lives here exactly once:
//! range bounding, write splitting, partial-block merging and sparse
//! read assembly. Everything in this module is pure and infallible;
//! backing-store failures are the callers' problem.

use std::collections::HashMap;

use crate::vfs::DEFAULT_BLOCK_SIZE;

/// Fixed block size a backend is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u32,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Inclusive block bounds of a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start_block: u64,
    pub end_block: u64,
    /// Offset of the range's first byte within `start_block`.
    pub start_offset: u32,
    /// Offset one past the range's last byte within `end_block`.
    pub end_offset: u32,
}

/// One block-aligned piece of a write payload. Never crosses a block
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSlice<'a> {
    pub block_id: u64,
    pub offset_in_block: u32,
    pub data: &'a [u8],
}

impl WriteSlice<'_> {
    /// A slice that replaces its block wholesale needs no read-merge.
    pub fn is_full_block(&self, layout: BlockLayout) -> bool {
        self.offset_in_block == 0 && self.data.len() == layout.block_size as usize
    }
}

impl BlockLayout {
    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_size as u64
    }

    /// Number of blocks needed to hold `size` bytes.
    pub fn blocks_for(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size as u64)
    }

    /// Block bounds of `[offset, offset + len)`. `len` must be non-zero;
    /// zero-length requests are handled by callers before mapping.
    pub fn range(&self, offset: u64, len: usize) -> BlockRange {
        debug_assert!(len > 0, "range of an empty request");
        let bs = self.block_size as u64;
        let last = offset + len as u64 - 1;
        BlockRange {
            start_block: offset / bs,
            end_block: last / bs,
            start_offset: (offset % bs) as u32,
            end_offset: (last % bs) as u32 + 1,
        }
    }

    /// Greedily split `data` at `offset` into block-aligned slices.
    pub fn split_for_write<'a>(&self, offset: u64, data: &'a [u8]) -> Vec<WriteSlice<'a>> {
        let bs = self.block_size as u64;
        let mut out = Vec::new();
        let mut cursor = 0usize;
        let mut pos = offset;
        while cursor < data.len() {
            let in_block = pos % bs;
            let take = ((bs - in_block) as usize).min(data.len() - cursor);
            out.push(WriteSlice {
                block_id: pos / bs,
                offset_in_block: in_block as u32,
                data: &data[cursor..cursor + take],
            });
            cursor += take;
            pos += take as u64;
        }
        out
    }

    /// Overlay `patch` at `offset_in_block` on top of `existing` (or a zero
    /// block when absent). Output is always one full block; bytes outside
    /// the patch keep their prior value.
    pub fn merge_into_block(
        &self,
        existing: Option<&[u8]>,
        offset_in_block: u32,
        patch: &[u8],
    ) -> Vec<u8> {
        let bs = self.block_size as usize;
        let start = offset_in_block as usize;
        debug_assert!(start + patch.len() <= bs, "patch exceeds block boundary");
        let mut block = vec![0u8; bs];
        if let Some(existing) = existing {
            let keep = existing.len().min(bs);
            block[..keep].copy_from_slice(&existing[..keep]);
        }
        block[start..start + patch.len()].copy_from_slice(patch);
        block
    }

    /// Reassemble `[offset, offset + len)` from per-block records. Blocks
    /// absent from `blocks` read as zero (sparse holes). Output length is
    /// always exactly `len`.
    pub fn assemble<B: AsRef<[u8]>>(
        &self,
        blocks: &HashMap<u64, B>,
        offset: u64,
        len: usize,
    ) -> Vec<u8> {
        let mut out = vec![0u8; len];
        if len == 0 {
            return out;
        }
        let bs = self.block_size as u64;
        let range = self.range(offset, len);
        let mut cursor = 0usize;
        for block_id in range.start_block..=range.end_block {
            let from = if block_id == range.start_block {
                range.start_offset as usize
            } else {
                0
            };
            let to = if block_id == range.end_block {
                range.end_offset as usize
            } else {
                bs as usize
            };
            let take = to - from;
            if let Some(block) = blocks.get(&block_id) {
                let block = block.as_ref();
                let avail_to = to.min(block.len());
                if avail_to > from {
                    out[cursor..cursor + (avail_to - from)]
                        .copy_from_slice(&block[from..avail_to]);
                }
            }
            cursor += take;
        }
        out
    }
}
