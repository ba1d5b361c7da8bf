use sha2::{Digest, Sha256};

/// 256-bit content digest as 64 chars of lowercase hex.
///
/// One algorithm for both chunk identity and whole-file identity. Callers
/// hash raw bytes only; paths and line numbers never enter the digest, so
/// identical bodies in two files collapse to the same hash and the chunk
/// table disambiguates on the `(content_hash, path)` pair.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Shorthand for hashing UTF-8 text.
pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}
