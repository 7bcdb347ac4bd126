//! NOS Buffer Cache
//!
//! A fixed pool of block buffers shared by the file system and the mapped
//! file fault path. A given `(dev, blockno)` occupies at most one slot at a
//! time, so every caller sees the same copy of a block.
//!
//! ```text
//! let buf = bcache().read(dev, blockno);   // locked, contents valid
//! ... modify buf ...
//! bcache().write(&buf);                    // synchronous write-through
//! bcache().release(buf);                   // or simply drop it
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]

extern crate alloc;

pub mod cache;
pub mod config;
pub mod hash;
mod lru;

pub use cache::{bcache, init, BufGuard, BufferCache, CacheStats, PinnedBuf};
pub use config::{CacheConfig, NBUCKET, NBUF};
pub use nos_api::BSIZE;
