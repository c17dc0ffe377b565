//! Trusted-peer allowlist and signature checks

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use tracing::{info, warn};

use super::keypair::{verify_signature, Keypair, SIGNATURE_SIZE};

/// Holds the local key pair and the set of trusted public keys.
///
/// Keys are stored in canonical base64 (decode then re-encode), so two
/// spellings of the same key compare equal. Entries that do not decode to a
/// 32-byte key are dropped with a warning.
pub struct TrustStore {
    keypair: Keypair,
    trusted: RwLock<HashSet<String>>,
}

impl TrustStore {
    /// Create a trust store from a key pair and the configured allowlist
    pub fn new<I, S>(keypair: Keypair, trusted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keypair,
            trusted: RwLock::new(canonical_set(trusted)),
        }
    }

    /// Trust store with a fresh in-memory key pair
    pub fn generate<I, S>(trusted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(Keypair::generate(), trusted)
    }

    /// Sign a message with the local key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.keypair.sign(message)
    }

    /// Local public key, base64
    pub fn public_key_base64(&self) -> String {
        self.keypair.public_key_base64()
    }

    /// Verify a detached signature; pure, never panics
    pub fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        verify_signature(message, signature, public_key)
    }

    /// Whether the base64 public key is in the allowlist
    pub fn is_trusted(&self, public_key: &str) -> bool {
        match canonicalize(public_key) {
            Some(key) => self.trusted.read().contains(&key),
            None => false,
        }
    }

    /// Replace the allowlist
    pub fn reload<I, S>(&self, trusted: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = canonical_set(trusted);
        info!(count = keys.len(), "Reloaded trusted peer list");
        *self.trusted.write() = keys;
    }

    /// Sorted copy of the allowlist
    pub fn trusted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.trusted.read().iter().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("keypair", &self.keypair)
            .field("trusted", &self.trusted.read().len())
            .finish()
    }
}

fn canonicalize(key: &str) -> Option<String> {
    let bytes = STANDARD.decode(key.trim()).ok()?;
    (bytes.len() == 32).then(|| STANDARD.encode(bytes))
}

fn canonical_set<I, S>(keys: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .filter_map(|key| {
            let key = key.as_ref();
            let canonical = canonicalize(key);
            if canonical.is_none() {
                warn!(key, "Ignoring malformed trusted peer key");
            }
            canonical
        })
        .collect()
}
