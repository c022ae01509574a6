//! Deterministic identifiers for idempotent writes and sends.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// SHA-256 hex digest of the parts joined with `:`.
pub fn digest_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(":").as_bytes());
    hex::encode(hasher.finalize())
}

/// A UUID derived from the parts; equal inputs always give the same id.
pub fn deterministic_id(parts: &[&str]) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(":").as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}
