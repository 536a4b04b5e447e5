//! Wire format for replication messages
//!
//! JSON object with four camelCase fields. The blob is the exact byte string
//! stored in the state store, carried as standard base64:
//!
//! ```json
//! {"entityId":"7c9e6679-7425-40de-944b-e07fc1f90ae7","blob":"AQID","updatedAt":1700000000000,"originId":"b1e4..."}
//! ```

use blobsync_core::{EntityId, OriginId, StateRecord};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// A state change broadcast on the bus
///
/// Never persisted; loss is acceptable because the store stays authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub entity_id: EntityId,
    #[serde(with = "base64_blob")]
    pub blob: Vec<u8>,
    pub updated_at: i64,
    pub origin_id: OriginId,
}

impl SyncMessage {
    pub fn new(entity_id: EntityId, blob: Vec<u8>, updated_at: i64, origin_id: OriginId) -> Self {
        Self {
            entity_id,
            blob,
            updated_at,
            origin_id,
        }
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> BusResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| BusError::EncodeFailed(e.to_string()))
    }

    /// Decode from the JSON wire form
    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        serde_json::from_slice(bytes).map_err(Into::into)
    }

    /// Drop the origin tag, keeping the state
    pub fn into_record(self) -> StateRecord {
        StateRecord::new(self.entity_id, self.blob, self.updated_at)
    }
}

mod base64_blob {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(blob: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(blob))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SyncMessage {
        SyncMessage::new(
            "7c9e6679-7425-40de-944b-e07fc1f90ae7".parse().unwrap(),
            vec![1, 2, 3],
            1_700_000_000_000,
            OriginId::new("server-a").unwrap(),
        )
    }

    #[test]
    fn test_wire_layout() {
        let encoded = sample().encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(json["entityId"], "7c9e6679-7425-40de-944b-e07fc1f90ae7");
        assert_eq!(json["blob"], "AQID");
        assert_eq!(json["updatedAt"], 1_700_000_000_000_i64);
        assert_eq!(json["originId"], "server-a");
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_decode_foreign_payload() {
        let raw = br#"{"originId":"other","updatedAt":5,"blob":"aGk=","entityId":"7c9e6679-7425-40de-944b-e07fc1f90ae7"}"#;
        let msg = SyncMessage::decode(raw).unwrap();
        assert_eq!(msg.blob, b"hi");
        assert_eq!(msg.updated_at, 5);
        assert_eq!(msg.origin_id.as_str(), "other");
    }

    #[test]
    fn test_malformed_payloads_fail() {
        assert!(SyncMessage::decode(b"not json").is_err());
        // Bad base64
        let raw = br#"{"entityId":"7c9e6679-7425-40de-944b-e07fc1f90ae7","blob":"@@","updatedAt":1,"originId":"x"}"#;
        assert!(matches!(
            SyncMessage::decode(raw),
            Err(BusError::DecodeFailed(_))
        ));
        // Missing origin
        let raw = br#"{"entityId":"7c9e6679-7425-40de-944b-e07fc1f90ae7","blob":"","updatedAt":1}"#;
        assert!(SyncMessage::decode(raw).is_err());
    }

    #[test]
    fn test_into_record() {
        let msg = sample();
        let record = msg.clone().into_record();
        assert_eq!(record.entity_id, msg.entity_id);
        assert_eq!(record.blob, msg.blob);
        assert_eq!(record.updated_at, msg.updated_at);
    }
}
