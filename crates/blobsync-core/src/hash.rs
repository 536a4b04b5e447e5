//! Content hashing for dedup
//!
//! Hashes are computed over the encoded blob bytes, never over the decoded
//! state, so two processes agree on a hash without sharing a decoder.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// BLAKE3 digest of a state blob
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a blob
    pub fn of(blob: &[u8]) -> Self {
        Self(*blake3::hash(blob).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short display form (first 8 hex chars)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}
