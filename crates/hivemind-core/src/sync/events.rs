//! Sync event types and connection state tracking
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionState: per-link handshake progress                   │
//! │  ├── Connecting: link requested, not yet open                   │
//! │  ├── AwaitingResponse: challenge sent, waiting for signature    │
//! │  ├── Authenticated: peer proved a trusted key                   │
//! │  └── Closed: link gone or handshake failed                      │
//! │                                                                 │
//! │  SyncEvent: notifications about sync activity                   │
//! │  ├── PeerAuthenticated / AuthenticationFailed / PeerDisconnected│
//! │  ├── DocumentApplied: a reconciled snapshot was written         │
//! │  └── SnapshotRejected: a snapshot could not be reconciled       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::error::AuthFailure;
use crate::reconcile::ActionKind;
use crate::types::PeerId;

/// Handshake state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Dial in progress
    Connecting,
    /// Challenge sent, waiting for the peer's signature
    AwaitingResponse,
    /// Peer proved possession of a trusted key
    Authenticated,
    /// No live link
    #[default]
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::AwaitingResponse => write!(f, "Awaiting response"),
            ConnectionState::Authenticated => write!(f, "Authenticated"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Events emitted by the connection manager and the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A peer completed the handshake and was registered
    PeerAuthenticated {
        /// Transport-level ID
        peer: PeerId,
        /// Base64 public key the peer proved
        public_key: String,
    },
    /// A handshake ended in `Closed`
    AuthenticationFailed {
        /// Transport-level ID
        peer: PeerId,
        /// Why it failed
        reason: AuthFailure,
    },
    /// An authenticated peer was deregistered
    PeerDisconnected {
        /// Transport-level ID
        peer: PeerId,
    },
    /// An incoming snapshot was reconciled and applied
    DocumentApplied {
        /// Document path
        path: String,
        /// What reconciliation decided
        action: ActionKind,
    },
    /// An incoming snapshot could not be reconciled
    SnapshotRejected {
        /// Document path
        path: String,
        /// Error description
        message: String,
    },
}
