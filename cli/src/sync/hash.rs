//! Content hashing for device file entries.
//!
//! Every acknowledged file in the mirror carries a SHA256 fingerprint of the
//! bytes the device accepted, so unchanged content can be recognised without
//! comparing buffers.

use sha2::{Digest, Sha256};

/// Compute the hex SHA256 of a byte buffer.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Check if content differs from the last acknowledged hash.
///
/// Returns `true` when there is no stored hash or the hashes differ.
#[must_use]
pub fn has_changed(current_hash: &str, stored_hash: Option<&str>) -> bool {
    stored_hash.is_none_or(|h| h != current_hash)
}
