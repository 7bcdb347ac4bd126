//! Kernel <-> user data transfer through a page table.
//!
//! Every user page touched must be valid, user-accessible and backed by a
//! frame; anything else fails with [`VmError::BadAddress`]. Kernel-only
//! mappings are therefore never reachable through a user-supplied address.

use crate::error::{VmError, VmResult};
use crate::page_table::PageTable;
use crate::physical::{page_round_down, PhysAddr, PAGE_SIZE};

/// Resolve the frame backing `va` and the number of bytes left in its page
fn resolve(pt: &PageTable, va: usize) -> VmResult<(PhysAddr, usize)> {
    let va0 = page_round_down(va);
    let pa0 = pt.translate_user(va0).ok_or(VmError::BadAddress(va))?;
    let offset = va - va0;
    Ok((pa0.add(offset), PAGE_SIZE - offset))
}

/// Copy `src` to user address `dst_va`
pub fn copy_out(pt: &PageTable, dst_va: usize, src: &[u8]) -> VmResult<()> {
    let mem = pt.memory();
    let mut va = dst_va;
    let mut src = src;
    while !src.is_empty() {
        let (pa, room) = resolve(pt, va)?;
        let n = room.min(src.len());
        mem.write(pa, &src[..n]);
        src = &src[n..];
        va += n;
    }
    Ok(())
}

/// Fill `dst` from user address `src_va`
pub fn copy_in(pt: &PageTable, dst: &mut [u8], src_va: usize) -> VmResult<()> {
    let mem = pt.memory();
    let mut va = src_va;
    let mut done = 0;
    while done < dst.len() {
        let (pa, room) = resolve(pt, va)?;
        let n = room.min(dst.len() - done);
        mem.read(pa, &mut dst[done..done + n]);
        done += n;
        va += n;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user address `src_va` into `dst`,
/// scanning at most `max` bytes (and never more than `dst` holds).
///
/// Returns the string length without the terminator. The terminator is
/// written to `dst` only on success.
pub fn copy_in_str(pt: &PageTable, dst: &mut [u8], src_va: usize, max: usize) -> VmResult<usize> {
    let mem = pt.memory();
    let max = max.min(dst.len());
    let mut va = src_va;
    let mut len = 0;
    while len < max {
        let (pa, room) = resolve(pt, va)?;
        let n = room.min(max - len);
        let mut chunk = [0u8; PAGE_SIZE];
        mem.read(pa, &mut chunk[..n]);
        if let Some(nul) = chunk[..n].iter().position(|&b| b == 0) {
            dst[len..len + nul].copy_from_slice(&chunk[..nul]);
            dst[len + nul] = 0;
            return Ok(len + nul);
        }
        dst[len..len + n].copy_from_slice(&chunk[..n]);
        len += n;
        va += n;
    }
    Err(VmError::NoTerminator)
}
