//! Entity and process identifiers
//!
//! - [`EntityId`]: one per synchronized subject, stable across processes
//! - [`OriginId`]: one per process start, stable for its lifetime

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

/// Stable unique identifier for a synchronized entity
///
/// Serialized as the hyphenated UUID string in human-readable formats and as
/// the 16 raw bytes in binary ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Wrap an existing UUID
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a random entity ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Get the raw 16 bytes (used as the storage key)
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Create from a 16 byte slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdError> {
        Uuid::from_slice(slice)
            .map(Self)
            .map_err(|_| IdError::InvalidLength {
                expected: 16,
                actual: slice.len(),
            })
    }

    /// Short display form (first 8 hex chars)
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EntityId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IdError::InvalidFormat(format!("{s}: {e}")))
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of the publishing process on the replication bus
///
/// Generated once per process start. Carries no ownership semantics; it only
/// lets a subscriber recognise its own publications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    /// Generate a fresh random origin
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use a fixed origin string (tests, simulation)
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::EmptyOrigin);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
