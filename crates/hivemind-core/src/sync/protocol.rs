//! Peer wire protocol
//!
//! Messages are JSON objects tagged by `type` with the payload under `data`:
//!
//! ```text
//! {"type":"AUTH_CHALLENGE","data":{"nonce":"<base64>"}}
//! {"type":"AUTH_RESPONSE","data":{"signature":"<base64>","publicKey":"<base64>"}}
//! {"type":"SYNC_REQUEST","data":null}
//! {"type":"SYNC_RESPONSE","data":[{"path":..,"content":..,"lastModified":..}]}
//! {"type":"NOTE_UPDATE","data":{"path":..,"content":..,"lastModified":..}}
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Peer A                          Peer B
//!   |                               |
//!   |--- AuthChallenge {nA} ------->|
//!   |<-- AuthChallenge {nB} --------|
//!   |--- AuthResponse {sig(nB)} --->|  B trusts A
//!   |<-- AuthResponse {sig(nA)} ----|  A trusts B
//!   |                               |
//!   |--- SyncRequest -------------->|
//!   |<-- SyncResponse [snapshots] --|
//!   |                               |
//!   |--- NoteUpdate {snapshot} ---->|  on local edit
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::DocumentSnapshot;

/// Random challenge length in bytes
pub const NONCE_SIZE: usize = 32;

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMessage {
    /// Random nonce the far side must sign
    AuthChallenge {
        /// Base64 nonce
        nonce: String,
    },

    /// Proof of key possession
    AuthResponse {
        /// Base64 Ed25519 signature over the decoded nonce
        signature: String,
        /// Base64 Ed25519 public key of the responder
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    /// Ask the peer for every shared document
    SyncRequest,

    /// Every shared document of the responder
    SyncResponse(Vec<DocumentSnapshot>),

    /// A single changed document
    NoteUpdate(DocumentSnapshot),
}

/// Tags understood by this version of the protocol
const KNOWN_TAGS: &[&str] = &[
    "AUTH_CHALLENGE",
    "AUTH_RESPONSE",
    "SYNC_REQUEST",
    "SYNC_RESPONSE",
    "NOTE_UPDATE",
];

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A message of a known type
    Message(ProtocolMessage),
    /// A well-formed frame with a tag this version does not know
    Unknown(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
}

impl ProtocolMessage {
    /// Build a challenge carrying `nonce`
    pub fn challenge(nonce: &[u8]) -> Self {
        ProtocolMessage::AuthChallenge {
            nonce: STANDARD.encode(nonce),
        }
    }

    /// Build a response carrying a signature and public key
    pub fn response(signature: &[u8], public_key: String) -> Self {
        ProtocolMessage::AuthResponse {
            signature: STANDARD.encode(signature),
            public_key,
        }
    }

    /// Encode to a JSON frame
    pub fn encode(&self) -> SyncResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a JSON frame, separating unknown tags from malformed frames
    pub fn decode(frame: &[u8]) -> SyncResult<Inbound> {
        let raw: RawFrame = serde_json::from_slice(frame)?;
        if !KNOWN_TAGS.contains(&raw.kind.as_str()) {
            return Ok(Inbound::Unknown(raw.kind));
        }
        let message = serde_json::from_slice(frame)?;
        Ok(Inbound::Message(message))
    }

    /// Tag name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::AuthChallenge { .. } => "AUTH_CHALLENGE",
            ProtocolMessage::AuthResponse { .. } => "AUTH_RESPONSE",
            ProtocolMessage::SyncRequest => "SYNC_REQUEST",
            ProtocolMessage::SyncResponse(_) => "SYNC_RESPONSE",
            ProtocolMessage::NoteUpdate(_) => "NOTE_UPDATE",
        }
    }
}

/// Decode a base64 field of a handshake message
pub fn decode_base64(value: &str) -> SyncResult<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| SyncError::Serialization(format!("Invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> DocumentSnapshot {
        DocumentSnapshot {
            path: "notes/x.md".to_string(),
            content: "aa:bb:cc".to_string(),
            last_modified: 500,
        }
    }

    #[test]
    fn test_wire_shape() {
        let json: serde_json::Value =
            serde_json::from_slice(&ProtocolMessage::NoteUpdate(snapshot()).encode().unwrap())
                .unwrap();
        assert_eq!(json["type"], "NOTE_UPDATE");
        assert_eq!(json["data"]["path"], "notes/x.md");
        assert_eq!(json["data"]["lastModified"], 500);

        let json: serde_json::Value = serde_json::from_slice(
            &ProtocolMessage::response(&[1, 2, 3], "a2V5".to_string())
                .encode()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(json["type"], "AUTH_RESPONSE");
        assert_eq!(json["data"]["signature"], "AQID");
        assert_eq!(json["data"]["publicKey"], "a2V5");
    }

    #[test]
    fn test_decode_each_kind() {
        for message in [
            ProtocolMessage::challenge(&[9u8; NONCE_SIZE]),
            ProtocolMessage::response(&[1u8; 64], "a2V5".to_string()),
            ProtocolMessage::SyncRequest,
            ProtocolMessage::SyncResponse(vec![snapshot(), snapshot()]),
            ProtocolMessage::NoteUpdate(snapshot()),
        ] {
            let frame = message.encode().unwrap();
            assert_eq!(
                ProtocolMessage::decode(&frame).unwrap(),
                Inbound::Message(message)
            );
        }
    }

    #[test]
    fn test_sync_request_accepts_null_data() {
        let decoded = ProtocolMessage::decode(br#"{"type":"SYNC_REQUEST","data":null}"#).unwrap();
        assert_eq!(decoded, Inbound::Message(ProtocolMessage::SyncRequest));

        let decoded = ProtocolMessage::decode(br#"{"type":"SYNC_REQUEST"}"#).unwrap();
        assert_eq!(decoded, Inbound::Message(ProtocolMessage::SyncRequest));
    }

    #[test]
    fn test_unknown_tag() {
        let decoded = ProtocolMessage::decode(br#"{"type":"PING","data":{"x":1}}"#).unwrap();
        assert_eq!(decoded, Inbound::Unknown("PING".to_string()));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(ProtocolMessage::decode(b"not json").is_err());
        assert!(ProtocolMessage::decode(br#"{"data":{}}"#).is_err());
        assert!(ProtocolMessage::decode(br#"{"type":"NOTE_UPDATE","data":{"path":1}}"#).is_err());
    }
}
