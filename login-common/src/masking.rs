//! One-way masking of PII fields.
//!
//! Masked values are persisted and correlated across years of historical rows, so the digest
//! must stay byte-for-byte stable: SHA-256 over the UTF-8 bytes, rendered as lowercase hex.
use sha2::{Digest, Sha256};

/// Length in characters of every value returned by `mask`.
pub const MASKED_VALUE_LENGTH: usize = 64;

/// Mask a PII value. The same input always produces the same 64 character digest.
pub fn mask(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
