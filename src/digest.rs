//! Content digest used for value-level deduplication during spill.
//!
//! The engine does not need a cryptographically strong hash, only one with a
//! fixed width and a vanishingly small collision rate for dedup purposes. MD5
//! fits (matches the original tool's `hashlib.md5` choice) and is cheap.

use md5::{Digest, Md5};

/// Byte width of [`digest`]'s output.
pub const DIGEST_LEN: usize = 16;

/// A 128-bit content digest, used as a dedup key within a single stage.
pub type ContentDigest = [u8; DIGEST_LEN];

/// Computes the content digest of a serialized value's bytes.
pub fn digest(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
