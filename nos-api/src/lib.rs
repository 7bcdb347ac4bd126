//! NOS API - Shared contracts for the NOS memory subsystems
//!
//! This crate holds the pieces that the virtual-memory layer and the buffer
//! cache both speak:
//!
//! - **Error**: the kernel-wide error type and `Result` alias
//! - **Block**: the synchronous block-device transport the buffer cache drives
//! - **File**: the open-file abstraction that memory-mapped regions hold on to
//! - **Sync**: structural (spin) locks and the blocking `Sleeplock`

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod error;
pub mod file;
pub mod sync;

pub use crate::block::{BlockDevice, BSIZE};
pub use crate::error::{Error, Result};
pub use crate::file::{File, FileHandle};
pub use crate::sync::{Sleeplock, SleeplockGuard};
