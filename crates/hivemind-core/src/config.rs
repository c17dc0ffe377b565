//! Node configuration
//!
//! Stored as a camelCase JSON file:
//!
//! ```json
//! {
//!   "peerId": "9f3c...",
//!   "sharedFolders": ["projects"],
//!   "sharedNotes": ["inbox.md"],
//!   "trustedPeers": ["<base64 ed25519 key>"],
//!   "encryptionKey": "<64 hex chars>",
//!   "peers": ["<endpoint id>", "<endpoint id>@203.0.113.7:4433"],
//!   "authTimeoutSecs": 10
//! }
//! ```
//!
//! Every field is optional on load and falls back to its default.

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::CipherBox;
use crate::error::{SyncError, SyncResult};
use crate::identity::PUBLIC_KEY_SIZE;
use crate::types::PeerId;

/// Settings for one Hive Mind node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HiveConfig {
    /// Our transport address; must equal the transport's local ID
    pub peer_id: String,
    /// Folder prefixes whose documents are shared
    pub shared_folders: Vec<String>,
    /// Base64 Ed25519 keys allowed to connect
    pub trusted_peers: Vec<String>,
    /// Hex AES-256 key shared by the whole mesh
    pub encryption_key: String,
    /// Individually shared document paths
    pub shared_notes: Vec<String>,
    /// Peers to dial and keep connected: a transport ID, optionally
    /// followed by `@` and comma-separated addresses
    pub peers: Vec<String>,
    pub auth_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
    pub poll_interval_secs: u64,
    /// Accept envelopes without an authentication tag
    pub allow_legacy_envelopes: bool,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            shared_folders: Vec::new(),
            trusted_peers: Vec::new(),
            encryption_key: String::new(),
            shared_notes: Vec::new(),
            peers: Vec::new(),
            auth_timeout_secs: 10,
            reconnect_interval_secs: 30,
            poll_interval_secs: 2,
            allow_legacy_envelopes: false,
        }
    }
}

impl HiveConfig {
    /// Fresh config with a random peer ID and encryption key
    pub fn generate() -> Self {
        Self {
            peer_id: generate_peer_id(),
            encryption_key: generate_encryption_key(),
            ..Self::default()
        }
    }

    /// Read a config file
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: HiveConfig = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), peer_id = %config.peer_id, "Loaded config");
        Ok(config)
    }

    /// Write the config file, creating parent directories
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "Saved config");
        Ok(())
    }

    /// Check that the config can run a node
    pub fn validate(&self) -> SyncResult<()> {
        if self.peer_id.trim().is_empty() {
            return Err(SyncError::Config("peerId must not be empty".into()));
        }
        CipherBox::from_hex(&self.encryption_key)?;

        for key in &self.trusted_peers {
            let valid = STANDARD
                .decode(key.trim())
                .map(|bytes| bytes.len() == PUBLIC_KEY_SIZE)
                .unwrap_or(false);
            if !valid {
                return Err(SyncError::Config(format!(
                    "Trusted peer key is not a base64 Ed25519 key: {}",
                    key
                )));
            }
        }

        for (name, value) in [
            ("authTimeoutSecs", self.auth_timeout_secs),
            ("reconnectIntervalSecs", self.reconnect_interval_secs),
            ("pollIntervalSecs", self.poll_interval_secs),
        ] {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Whether `path` is shared: listed in `sharedNotes` or below a shared folder
    pub fn is_shared(&self, path: &str) -> bool {
        if self.shared_notes.iter().any(|note| note == path) {
            return true;
        }
        self.shared_folders.iter().any(|folder| {
            let folder = folder.trim_matches('/');
            folder.is_empty()
                || path
                    .strip_prefix(folder)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Cipher built from `encryptionKey`
    pub fn cipher(&self) -> SyncResult<CipherBox> {
        Ok(CipherBox::from_hex(&self.encryption_key)?.allow_legacy(self.allow_legacy_envelopes))
    }

    /// Transport IDs of `peers`, without any address hints
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .map(|p| {
                let p = p.trim();
                PeerId::new(p.split_once('@').map_or(p, |(id, _)| id))
            })
            .collect()
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Random AES-256 key as 64 hex chars
pub fn generate_encryption_key() -> String {
    hex::encode(CipherBox::generate_key())
}

/// Random node name as 32 hex chars
pub fn generate_peer_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
