//! # Blobsync Core
//!
//! Core types, clock abstraction and errors shared by the blobsync stack.
//!
//! ## Key Types
//!
//! - [`EntityId`]: Stable identifier of a synchronized subject
//! - [`OriginId`]: Random per-process identifier used to suppress self-echo
//! - [`ContentHash`]: BLAKE3 digest of a state blob, used for dedup
//! - [`StateRecord`]: Latest blob and its timestamp for one entity
//!
//! ## Key Traits
//!
//! - [`Clock`]: Wall-clock abstraction so grace windows and autosave
//!   intervals can be driven deterministically in tests

pub mod clock;
pub mod error;
pub mod hash;
pub mod identity;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::IdError;
pub use hash::ContentHash;
pub use identity::{EntityId, OriginId};
pub use record::StateRecord;
