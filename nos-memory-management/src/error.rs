//! Virtual memory errors

use core::fmt;

use nos_api::Error;

/// Recoverable and request-level failures of the virtual-memory layer.
///
/// Invariant violations (remapping a valid entry, unmapping a non-leaf, ...)
/// are not represented here; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A frame or page-table node could not be allocated
    NoMemory,
    /// No page-table entry exists for the address
    NotMapped(usize),
    /// The user address is unmapped, not user-accessible or not yet backed
    BadAddress(usize),
    /// Length or alignment of a request is unusable
    InvalidRange,
    /// File capabilities do not allow the requested mapping
    PermissionDenied,
    /// Every mapped-region slot of the process is in use
    NoRegionSlot,
    /// Fault outside of any declared mapping
    SegmentationFault(usize),
    /// No terminator within the allowed length of a user string
    NoTerminator,
    /// The backing file failed
    Io(Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::NoMemory => write!(f, "out of physical memory"),
            VmError::NotMapped(va) => write!(f, "no mapping for {:#x}", va),
            VmError::BadAddress(va) => write!(f, "bad user address {:#x}", va),
            VmError::InvalidRange => write!(f, "invalid range"),
            VmError::PermissionDenied => write!(f, "file does not permit mapping"),
            VmError::NoRegionSlot => write!(f, "no free mapped-region slot"),
            VmError::SegmentationFault(va) => write!(f, "segmentation fault at {:#x}", va),
            VmError::NoTerminator => write!(f, "string not terminated"),
            VmError::Io(err) => write!(f, "file I/O failed: {}", err),
        }
    }
}

impl From<Error> for VmError {
    fn from(err: Error) -> Self {
        VmError::Io(err)
    }
}

impl From<VmError> for Error {
    fn from(err: VmError) -> Self {
        match err {
            VmError::NoMemory => Error::OutOfMemory,
            VmError::NotMapped(va) | VmError::BadAddress(va) | VmError::SegmentationFault(va) => {
                Error::BadAddress(va)
            }
            VmError::InvalidRange => Error::InvalidArgument("invalid range"),
            VmError::PermissionDenied => Error::PermissionDenied("file does not permit mapping"),
            VmError::NoRegionSlot => Error::TableFull("mapped regions"),
            VmError::NoTerminator => Error::InvalidArgument("string not terminated"),
            VmError::Io(err) => err,
        }
    }
}

/// Result type of the virtual-memory layer
pub type VmResult<T> = core::result::Result<T, VmError>;
