//! Virtual address layout for Sv39-style three-level translation

use crate::physical::PAGE_SHIFT;

/// Bits of virtual page number consumed per page-table level
pub const VPN_BITS: usize = 9;

/// Number of page-table levels
pub const LEVELS: usize = 3;

/// One beyond the highest usable virtual address. One bit less than the
/// Sv39 maximum, to avoid sign-extending addresses with the high bit set.
pub const MAXVA: usize = 1 << (VPN_BITS * LEVELS + PAGE_SHIFT - 1);

/// A virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Index into the page-table node at `level` (2 = root, 0 = leaf level)
    pub const fn vpn(self, level: usize) -> usize {
        (self.0 >> (PAGE_SHIFT + level * VPN_BITS)) & ((1 << VPN_BITS) - 1)
    }
}
