//! Tunables of the mapping layer

use crate::error::{VmError, VmResult};

/// Mapped-region slots per process
pub const MAX_REGIONS: usize = 16;

/// Blocks reserved per file-system operation for inode and bitmap updates
const OP_OVERHEAD_BLOCKS: usize = 4;

/// Limits that shape write-back of shared mappings.
///
/// One file write may touch at most `max_op_blocks` blocks of the log, so a
/// write-back is split into chunks small enough to fit a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapConfig {
    /// Blocks a single file-system operation may write
    pub max_op_blocks: usize,
    /// File-system block size in bytes
    pub block_size: usize,
}

impl Default for MmapConfig {
    fn default() -> Self {
        Self {
            max_op_blocks: 10,
            block_size: nos_api::BSIZE,
        }
    }
}

impl MmapConfig {
    pub fn new(max_op_blocks: usize, block_size: usize) -> VmResult<Self> {
        let config = Self {
            max_op_blocks,
            block_size,
        };
        if block_size == 0 || config.writeback_chunk() == 0 {
            return Err(VmError::InvalidRange);
        }
        Ok(config)
    }

    /// Largest byte count written back in one file write
    pub fn writeback_chunk(&self) -> usize {
        (self.max_op_blocks.saturating_sub(OP_OVERHEAD_BLOCKS) / 2) * self.block_size
    }
}
