//! Hive Mind Core Library
//!
//! Encrypted peer-to-peer document sync between mutually trusted peers.
//!
//! ## Overview
//!
//! A small mesh of peers keeps a shared set of text documents consistent
//! without a server. Every link is authenticated by an Ed25519
//! challenge/response against a trusted-key allowlist, every document body
//! travels inside an AES-256-CBC envelope, and conflicting edits are settled
//! by modification time with a line merge when the local copy is newer.
//!
//! ## Core Principles
//!
//! - **No server**: peers talk directly over iroh QUIC links
//! - **Trust by key**: only peers whose public key is listed can sync
//! - **Opaque in transit**: snapshots carry ciphertext only
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use hivemind_core::{FsStore, HiveConfig, IrohTransport, Keypair, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HiveConfig::load("hivemind.json".as_ref())?;
//!     let keypair = Keypair::load_or_generate("identity.key".as_ref())?;
//!     let transport = IrohTransport::bind(secret_key).await?;
//!     let store = Arc::new(FsStore::open("vault")?);
//!
//!     let engine = SyncEngine::new(config, keypair, transport, store)?;
//!     engine.start()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod reconcile;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::{generate_encryption_key, generate_peer_id, HiveConfig};
pub use crypto::CipherBox;
pub use engine::SyncEngine;
pub use error::{AuthFailure, SyncError, SyncResult};
pub use identity::{Keypair, TrustStore};
pub use reconcile::{merge_lines, Action, ActionKind, Reconciler};
pub use storage::{ChangeWatcher, DocumentStore, FsStore, MemoryStore};
pub use sync::{
    BroadcastReport, ConnectionManager, ConnectionState, IrohTransport, MemoryNetwork,
    MemoryTransport, ProtocolMessage, SyncCoordinator, SyncEvent, Transport,
};
pub use types::*;
