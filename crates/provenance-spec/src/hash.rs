//! Dual cryptographic hashing.
//!
//! Every digest in this workspace is the concatenation of two independent
//! 256-bit hash functions over identical input bytes, never one alone. A
//! reimplementation in any language must produce byte-identical digests for
//! identical input, or Merkle roots silently stop comparing across systems.

use sha2::{Digest, Sha256};
use std::fmt;

/// Bytes hashed to produce the canonical empty-input sentinel.
pub const EMPTY_SENTINEL: &[u8] = b"empty";

/// Names of the two hash functions composited into every digest, in slot order.
pub const HASH_ALGORITHMS: [&str; 2] = ["SHA256", "BLAKE3"];

const HEX_LUT: &[u8; 16] = b"0123456789abcdef";

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX_LUT[(b >> 4) as usize] as char);
        out.push(HEX_LUT[(b & 0x0f) as usize] as char);
    }
    out
}

/// A `H1:H2` composite digest: SHA-256 then BLAKE3, each 64 lowercase hex
/// characters, joined by a single `:`. Comparison is byte-exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CompositeDigest(String);

impl CompositeDigest {
    /// Wrap an already-formatted `H1:H2` string, e.g. one read back from the
    /// receipt stream, without recomputing it.
    pub fn from_raw(s: impl Into<String>) -> Self {
        CompositeDigest(s.into())
    }

    /// The full `H1:H2` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into the SHA-256 and BLAKE3 halves.
    pub fn halves(&self) -> Option<(&str, &str)> {
        self.0.split_once(':')
    }
}

impl fmt::Display for CompositeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CompositeDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute the `H1:H2` composite digest over `bytes`.
///
/// `H1` is SHA-256, `H2` is BLAKE3. Both halves are always computed unless
/// the `single_hash` feature is enabled, in which case SHA-256 is recorded
/// into both slots. That substitution is a compile-time choice: it can never
/// vary at runtime, and roots built with it enabled are not comparable to
/// roots built without it.
pub fn composite_digest(bytes: &[u8]) -> CompositeDigest {
    let sha = to_hex(&Sha256::digest(bytes));
    #[cfg(feature = "single_hash")]
    let second = sha.clone();
    #[cfg(not(feature = "single_hash"))]
    let second = blake3::hash(bytes).to_hex().to_string();
    CompositeDigest(format!("{sha}:{second}"))
}

/// The canonical empty-input sentinel digest: `composite_digest(b"empty")`.
/// Used as the Merkle root of an empty leaf set.
pub fn empty_sentinel_digest() -> CompositeDigest {
    composite_digest(EMPTY_SENTINEL)
}

/// Concatenate two digest *strings* (not their raw bytes) and hash the
/// result. This is the Merkle engine's parent-combination primitive:
/// `H(left_str ++ right_str)`.
pub fn combine_digests(left: &CompositeDigest, right: &CompositeDigest) -> CompositeDigest {
    let mut buf = String::with_capacity(left.as_str().len() + right.as_str().len());
    buf.push_str(left.as_str());
    buf.push_str(right.as_str());
    composite_digest(buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sentinel_has_two_64_char_halves() {
        let digest = empty_sentinel_digest();
        let (h1, h2) = digest.halves().expect("digest must split on ':'");
        assert_eq!(h1.len(), 64);
        assert_eq!(h2.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(h2.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(composite_digest(b"hello"), composite_digest(b"hello"));
        assert_ne!(composite_digest(b"hello"), composite_digest(b"world"));
    }

    #[test]
    fn combine_hashes_digest_strings_not_raw_bytes() {
        let left = composite_digest(b"left");
        let right = composite_digest(b"right");
        let combined = combine_digests(&left, &right);
        let mut expected_input = left.as_str().to_string();
        expected_input.push_str(right.as_str());
        assert_eq!(combined, composite_digest(expected_input.as_bytes()));
    }
}
