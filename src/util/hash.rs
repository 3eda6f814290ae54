//! Stable hashing for package and object identities.

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a 哈希算法
///
/// Non-cryptographic and stable across runs and platforms, which is what
/// on-disk identifiers need.
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    fnv1a_extend(FNV_OFFSET, data)
}

/// Continue an FNV-1a hash over more bytes.
pub fn fnv1a_extend(
    mut hash: u64,
    data: &[u8],
) -> u64 {
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Case-insensitive FNV-1a over a path or name.
pub fn fnv1a_hash_lower(text: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for ch in text.chars().flat_map(char::to_lowercase) {
        let mut buf = [0u8; 4];
        hash = fnv1a_extend(hash, ch.encode_utf8(&mut buf).as_bytes());
    }
    hash
}
