//! 32-bit FNV-1a hashing, used for key-to-bucket mapping, replica ordering,
//! and the sampled value fingerprint stored in hint records.

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x01000193;

/// Hashes a byte string with 32-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Fingerprints a value. Values up to 1 KB hash in full; larger values hash
/// only the first and last 512 bytes. All arithmetic wraps at 32 bits. Hint
/// records store the low 16 bits of this hash.
pub fn content_hash(bytes: &[u8]) -> u32 {
    let mut hash = (bytes.len() as u32).wrapping_mul(97);
    if bytes.len() <= 1024 {
        hash = hash.wrapping_add(fnv1a(bytes));
    } else {
        hash = hash.wrapping_add(fnv1a(&bytes[..512]));
        hash = hash.wrapping_mul(97);
        hash = hash.wrapping_add(fnv1a(&bytes[bytes.len() - 512..]));
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    /// Standard FNV-1a test vectors.
    #[test_case(b"" => 0x811c9dc5; "empty")]
    #[test_case(b"a" => 0xe40c292c; "single byte")]
    #[test_case(b"foobar" => 0xbf9cf968; "foobar")]
    fn fnv1a_vectors(bytes: &[u8]) -> u32 {
        fnv1a(bytes)
    }

    #[test]
    fn content_hash_deterministic() {
        let small = vec![7u8; 1024];
        let large = vec![7u8; 4096];
        assert_eq!(content_hash(&small), content_hash(&small));
        assert_eq!(content_hash(&large), content_hash(&large));
        assert_ne!(content_hash(&small), content_hash(&large));
    }

    /// Only the first and last 512 bytes of a large value contribute, so
    /// mutating the middle must not change the hash.
    #[test]
    fn content_hash_samples_ends() {
        let mut value = vec![1u8; 4096];
        let hash = content_hash(&value);
        value[2048] = 99;
        assert_eq!(content_hash(&value), hash);
        value[0] = 99;
        assert_ne!(content_hash(&value), hash);
    }

    #[test]
    fn content_hash_small_uses_all_bytes() {
        let mut value = vec![1u8; 100];
        let hash = content_hash(&value);
        value[50] = 99;
        assert_ne!(content_hash(&value), hash);
    }
}
