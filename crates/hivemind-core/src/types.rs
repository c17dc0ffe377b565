//! Core types for Hive Mind

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`]
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Opaque transport-level address of a peer
///
/// For the iroh transport this is the endpoint ID; the in-memory transport
/// uses arbitrary names. The core never interprets the contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a transport address
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw address
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines (first 8 chars)
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A peer address together with its signing key, as learned in a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Transport-level address
    pub peer_id: PeerId,
    /// Ed25519 public key, base64
    pub public_key: String,
}

/// Encrypted, timestamped copy of one document
///
/// `content` is always a [`CipherBox`](crate::crypto::CipherBox) envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    /// Unique key of the document within the shared space
    pub path: String,
    /// `<ivHex>:<cipherTextHex>[:<tagHex>]`
    pub content: String,
    /// Modification time of the plaintext at the sender
    pub last_modified: Timestamp,
}

/// Local counterpart of an incoming snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDocument {
    /// Store modification time
    pub mtime: Timestamp,
    /// Plaintext body
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_short() {
        let id = PeerId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");

        let tiny = PeerId::new("abc");
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let snapshot = DocumentSnapshot {
            path: "notes/x.md".to_string(),
            content: "00:11".to_string(),
            last_modified: 1700000000000,
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["path"], "notes/x.md");
        assert_eq!(json["content"], "00:11");
        assert_eq!(json["lastModified"], 1700000000000i64);
    }
}
