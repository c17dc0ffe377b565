//! Peer-to-peer synchronization layer
//!
//! ## Overview
//!
//! Peers hold direct links to each other. Every link is authenticated with
//! an Ed25519 challenge/response before any document crosses it, and every
//! document body is encrypted with the shared mesh key.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Transport (MemoryTransport | IrohTransport)                    │
//! │  └── hands out Links: ordered byte-frame channels per peer      │
//! │                                                                 │
//! │  ConnectionManager                                              │
//! │  ├── runs the handshake on every link                           │
//! │  ├── registry of authenticated peers                            │
//! │  └── forwards sync messages to the coordinator inbox            │
//! │                                                                 │
//! │  SyncCoordinator                                                │
//! │  ├── pushes local changes (NoteUpdate)                          │
//! │  ├── answers and issues SyncRequests                            │
//! │  └── reconciles incoming snapshots into the store               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! - **AuthChallenge / AuthResponse**: mutual proof of key possession
//! - **SyncRequest**: ask for every shared document
//! - **SyncResponse**: all shared documents of the responder
//! - **NoteUpdate**: one changed document

mod connection;
mod coordinator;
mod events;
mod iroh_transport;
mod protocol;
mod transport;

pub use connection::{BroadcastReport, ConnectionManager, InboundMessage, DEFAULT_AUTH_TIMEOUT};
pub use coordinator::{ApplySummary, SyncCoordinator};
pub use events::{ConnectionState, SyncEvent};
pub use iroh_transport::{
    format_peer_addr, load_or_generate_secret_key, parse_peer_addr, IrohTransport, SYNC_ALPN,
};
pub use protocol::{Inbound, ProtocolMessage, NONCE_SIZE};
pub use transport::{
    Direction, Link, MemoryNetwork, MemoryTransport, Transport, LINK_BUFFER, MAX_FRAME_LENGTH,
};
