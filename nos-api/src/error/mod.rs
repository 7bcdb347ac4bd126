//! Error handling module for NOS memory subsystems

use core::fmt;

/// Common error type used across the memory subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument(&'static str),
    /// Resource not found
    NotFound(&'static str),
    /// Permission denied
    PermissionDenied(&'static str),
    /// Bad user address
    BadAddress(usize),
    /// Out of memory
    OutOfMemory,
    /// No free entry in a fixed-size table
    TableFull(&'static str),
    /// I/O error
    IoError(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            Error::BadAddress(va) => write!(f, "Bad address: {:#x}", va),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::TableFull(msg) => write!(f, "Table full: {}", msg),
            Error::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;
