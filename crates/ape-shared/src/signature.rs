//! Parameter signature keys
//!
//! The key is only a cache hint. Agents always re-check the real tags of a
//! cached entry before using it, so a collision costs a rebuild, never a
//! wrong call.

use crate::value::TypeTag;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64 over `(position, tag)` pairs
pub fn signature_key(tags: &[TypeTag]) -> u64 {
    let mut hash = FNV_OFFSET;
    for (position, tag) in tags.iter().enumerate() {
        for byte in (position as u32)
            .to_le_bytes()
            .into_iter()
            .chain((*tag as u32).to_le_bytes())
        {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}
