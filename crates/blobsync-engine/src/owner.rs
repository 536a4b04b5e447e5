//! Boundary between the engine and the state it synchronizes
//!
//! The engine never inspects state. A [`StateCodec`] turns it into the opaque
//! blob that is stored and broadcast; a [`StateOwner`] holds the live copy;
//! an [`EntityHost`] says whether an entity's owner is available right now.

use std::collections::HashMap;
use std::marker::PhantomData;

use blobsync_core::EntityId;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{SyncError, SyncResult};

/// Holder of one entity's live state
pub trait StateOwner {
    type State;

    /// Current state, for encoding
    fn snapshot(&self) -> Self::State;

    /// Replace the whole state; nothing of the previous state survives
    fn replace(&mut self, state: Self::State);

    /// Remove entries whose keys match `pattern`, returning how many went
    fn prune_matching(&mut self, _pattern: &Regex) -> usize {
        0
    }
}

/// Converts owner state to and from blobs
pub trait StateCodec: Send + Sync {
    type State;

    fn encode(&self, state: &Self::State) -> SyncResult<Vec<u8>>;

    /// Decode a full blob; any error leaves the caller's state untouched
    fn decode(&self, blob: &[u8]) -> SyncResult<Self::State>;
}

/// Resolves entity ids to owners
pub trait EntityHost {
    type Owner: StateOwner;

    /// Owner for `entity_id`, or `None` when it is not available yet
    fn owner(&self, entity_id: &EntityId) -> Option<&Self::Owner>;

    fn owner_mut(&mut self, entity_id: &EntityId) -> Option<&mut Self::Owner>;
}

impl<O: StateOwner> EntityHost for HashMap<EntityId, O> {
    type Owner = O;

    fn owner(&self, entity_id: &EntityId) -> Option<&O> {
        self.get(entity_id)
    }

    fn owner_mut(&mut self, entity_id: &EntityId) -> Option<&mut O> {
        self.get_mut(entity_id)
    }
}

/// postcard codec for any serde type
pub struct PostcardCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> PostcardCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for PostcardCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PostcardCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PostcardCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PostcardCodec")
    }
}

impl<T: Serialize + DeserializeOwned> StateCodec for PostcardCodec<T> {
    type State = T;

    fn encode(&self, state: &T) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(state).map_err(|e| SyncError::Encode(e.to_string()))
    }

    fn decode(&self, blob: &[u8]) -> SyncResult<T> {
        postcard::from_bytes(blob).map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Bag(BTreeMap<String, u32>);

    impl StateOwner for Bag {
        type State = BTreeMap<String, u32>;

        fn snapshot(&self) -> Self::State {
            self.0.clone()
        }

        fn replace(&mut self, state: Self::State) {
            self.0 = state;
        }
    }

    #[test]
    fn test_postcard_codec() {
        let codec = PostcardCodec::<BTreeMap<String, u32>>::new();
        let state = BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 2)]);

        let blob = codec.encode(&state).unwrap();
        assert_eq!(codec.decode(&blob).unwrap(), state);
        assert!(matches!(
            codec.decode(&[0xff, 0xff, 0xff]),
            Err(SyncError::Decode(_))
        ));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let codec = PostcardCodec::<BTreeMap<String, u32>>::new();
        let a = BTreeMap::from([("x".to_string(), 1), ("y".to_string(), 2)]);
        let b = BTreeMap::from([("y".to_string(), 2), ("x".to_string(), 1)]);
        assert_eq!(codec.encode(&a).unwrap(), codec.encode(&b).unwrap());
    }

    #[test]
    fn test_map_host() {
        let id = EntityId::generate();
        let mut host: HashMap<EntityId, Bag> = HashMap::new();
        assert!(host.owner(&id).is_none());

        host.insert(id, Bag::default());
        host.owner_mut(&id)
            .unwrap()
            .replace(BTreeMap::from([("k".to_string(), 7)]));
        assert_eq!(host.owner(&id).unwrap().snapshot()["k"], 7);
        assert_eq!(
            host.owner_mut(&id).unwrap().prune_matching(&Regex::new("k").unwrap()),
            0
        );
    }
}
