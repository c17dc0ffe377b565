//! Error types for Hive Mind

use thiserror::Error;

use crate::types::PeerId;

/// Main error type for Hive Mind operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration value missing or malformed
    #[error("Config error: {0}")]
    Config(String),

    /// Cryptographic operation failed (key setup, encryption)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed envelope)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Identity-related error (key files, key encoding)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Peer failed the challenge/response handshake
    #[error("Authentication failed for peer {peer}: {reason}")]
    Authentication {
        /// Transport-level ID of the peer
        peer: PeerId,
        /// Why the handshake failed
        reason: AuthFailure,
    },

    /// No authenticated connection to the peer
    #[error("Not connected to peer: {0}")]
    NotConnected(PeerId),

    /// Transport link failed (dial error, closed link, full send buffer)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Error reported by the document store
    #[error("Storage error: {0}")]
    Storage(String),

    /// Document does not exist in the store
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Document path escapes the shared space or is empty
    #[error("Invalid document path: {0}")]
    InvalidPath(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reason a peer handshake ended in `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Signature did not verify against the presented key
    BadSignature,
    /// Signature was valid but the key is not in the trusted list
    UntrustedKey,
    /// No response arrived before the handshake deadline
    Timeout,
    /// Response could not be decoded
    Malformed,
    /// A non-handshake message arrived before authentication completed
    UnexpectedMessage,
    /// The link closed during the handshake
    LinkClosed,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            AuthFailure::BadSignature => "bad signature",
            AuthFailure::UntrustedKey => "key not trusted",
            AuthFailure::Timeout => "timed out",
            AuthFailure::Malformed => "malformed response",
            AuthFailure::UnexpectedMessage => "unexpected message before authentication",
            AuthFailure::LinkClosed => "link closed",
        };
        f.write_str(reason)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::DocumentNotFound("notes/x.md".to_string());
        assert_eq!(format!("{}", err), "Document not found: notes/x.md");
    }

    #[test]
    fn test_authentication_display() {
        let err = SyncError::Authentication {
            peer: PeerId::new("peer-b"),
            reason: AuthFailure::UntrustedKey,
        };
        assert_eq!(
            err.to_string(),
            "Authentication failed for peer peer-b: key not trusted"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }
}
