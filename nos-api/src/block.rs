//! Block device transport

/// Size of one disk block in bytes
pub const BSIZE: usize = 1024;

/// Synchronous block device.
///
/// Each call moves exactly one `BSIZE` block and returns once the transfer
/// has completed; there is no asynchronous completion visible to callers.
pub trait BlockDevice: Send + Sync {
    /// Read block `blockno` of device `dev` into `buf`
    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]);

    /// Write `buf` to block `blockno` of device `dev`
    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]);
}
