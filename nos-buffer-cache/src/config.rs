//! Buffer cache sizing

use nos_api::{Error, Result};
use static_assertions::const_assert;

/// Default number of buffer slots
pub const NBUF: usize = 30;

/// Default number of shards
pub const NBUCKET: usize = 13;

const_assert!(NBUCKET <= NBUF);

/// Pool size and shard count of a [`BufferCache`](crate::BufferCache)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub nbuf: usize,
    pub nbucket: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            nbuf: NBUF,
            nbucket: NBUCKET,
        }
    }
}

impl CacheConfig {
    /// Every shard must be able to start with at least one slot.
    pub fn new(nbuf: usize, nbucket: usize) -> Result<Self> {
        if nbuf == 0 {
            return Err(Error::InvalidArgument("buffer cache needs at least one buffer"));
        }
        if nbucket == 0 || nbucket > nbuf {
            return Err(Error::InvalidArgument("bucket count must be within 1..=nbuf"));
        }
        Ok(Self { nbuf, nbucket })
    }
}
