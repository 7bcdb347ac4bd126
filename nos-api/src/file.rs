//! Open-file abstraction consumed by memory-mapped regions

use alloc::sync::Arc;

use crate::error::Result;

/// An open file as seen by the memory layer.
///
/// Implementations live in the file-system layer. Positioned writes are
/// transactional: one call must fit inside a single log transaction, so
/// callers chunk large write-backs themselves.
pub trait File: Send + Sync {
    /// Whether the file was opened for reading
    fn readable(&self) -> bool;

    /// Whether the file was opened for writing
    fn writable(&self) -> bool;

    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, zero at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `offset` inside one transaction. Returns the number of
    /// bytes written; a short count means the file could not grow further.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;
}

/// Reference-counted open file. Cloning duplicates the reference
/// (`filedup`); dropping the last clone closes the file.
pub type FileHandle = Arc<dyn File>;
