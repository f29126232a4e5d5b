//! Hash helpers shared by the key scheduler, ratchets and proofs.

use blake2::{Blake2b, Digest, digest::consts::U32};

/// BLAKE2b with a 256-bit output.
pub(crate) type Blake2b256 = Blake2b<U32>;

/// Output size of [`blake2b_256`].
pub const HASH_LEN: usize = 32;

/// BLAKE2b-256 over the concatenation of `parts`.
pub fn blake2b_256(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();

    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// Append `value` as an unsigned LEB128 varint.
///
/// Byte-compatible with Go's `binary.PutUvarint`.
pub(crate) fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}
