//! Shard selection

const MIX: u32 = 0x7f7f_7f7f;

/// Shard holding block `blockno` of device `dev`
pub fn bucket(dev: u32, blockno: u32, nbucket: usize) -> usize {
    let mut key = (dev << 16) | blockno;
    key = (key ^ MIX) ^ ((key >> 20) ^ MIX) ^ (key << 12);
    key ^= MIX;
    key = key.wrapping_add(!MIX);
    (key % nbucket as u32) as usize
}
