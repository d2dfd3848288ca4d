//! The chunk fingerprint: a 128-bit MurmurHash3-class hash, not a
//! cryptographic primitive. Widening a truncated cryptographic hash is
//! explicitly disallowed by the design notes — the collision-resistance
//! properties this store relies on come from the width, not from any
//! cryptographic guarantee.

use std::io::Cursor;

/// Compute the content hash used to name a chunk on disk, as a lowercase
/// 32-character hex string.
///
/// `murmur3_x64_128` packs its two 64-bit lanes into one `u128` as
/// `(h2 << 64) | h1`; the reference `mmh3`/original backy fingerprint is
/// the little-endian bytes of `h1` followed by the little-endian bytes of
/// `h2`, not a big-endian print of the packed integer — so the lanes are
/// split back out and each is byte-swapped before hex-encoding.
pub fn chunk_hash(data: &[u8]) -> String {
    let mut cursor = Cursor::new(data);
    let digest = murmur3::murmur3_x64_128(&mut cursor, 0)
        .expect("murmur3 hashing an in-memory buffer cannot fail");
    let h1 = digest as u64;
    let h2 = (digest >> 64) as u64;
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&h1.to_le_bytes());
    bytes[8..16].copy_from_slice(&h2.to_le_bytes());
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_32_hex_chars() {
        let h = chunk_hash(b"hello world");
        assert_eq!(h.len(), 32);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(chunk_hash(b"abc"), chunk_hash(b"abc"));
    }

    #[test]
    fn hash_differs_for_different_content() {
        assert_ne!(chunk_hash(b"abc"), chunk_hash(b"abd"));
    }

    #[test]
    fn identical_chunks_hash_identically() {
        let block_a = vec![0x20u8; 4 * 1024 * 1024];
        let block_b = vec![0x20u8; 4 * 1024 * 1024];
        assert_eq!(chunk_hash(&block_a), chunk_hash(&block_b));
    }

    #[test]
    fn known_dedup_block_hash() {
        // A 4 MiB block of 0x20 bytes is the deduplication fixture used
        // throughout the chunked file engine's tests.
        let block = vec![0x20u8; 4 * 1024 * 1024];
        assert_eq!(chunk_hash(&block), "c01b5d75bfe6a1fa5bca6e492c5ab09a");
    }
}
