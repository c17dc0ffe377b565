//! Ed25519 signing key pair for peer authentication
//!
//! The key pair can be kept in memory only (a fresh identity per run) or
//! persisted as a hex-encoded seed so the public key listed in other peers'
//! trust lists stays valid across restarts.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use tracing::info;

use crate::error::{SyncError, SyncResult};

/// Ed25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Local signing identity
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        // Seed from rand directly; ed25519-dalek's rand_core is a different major version
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Build a deterministic key pair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Load the key pair stored at `path`, or generate and store a new one
    pub fn load_or_generate(path: &Path) -> SyncResult<Self> {
        if path.exists() {
            let keypair = Self::load(path)?;
            info!(path = %path.display(), "Loaded identity key");
            Ok(keypair)
        } else {
            let keypair = Self::generate();
            keypair.save(path)?;
            info!(path = %path.display(), "Generated new identity key");
            Ok(keypair)
        }
    }

    /// Read a hex-encoded seed from `path`
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let bytes = hex::decode(text.trim())
            .map_err(|e| SyncError::Identity(format!("Key file is not valid hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SyncError::Identity(format!("Key seed must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_seed(&seed))
    }

    /// Write the seed to `path` as hex, creating parent directories
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        write_private_file(path, hex::encode(self.signing.to_bytes()).as_bytes())
    }

    /// Raw public key bytes
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Public key in the base64 form used on the wire and in trust lists
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key())
    }

    /// Detached signature over `message`
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature
///
/// Returns false for a public key or signature of the wrong length, a key that
/// is not a valid curve point, or a signature that does not match.
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_SIZE]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

/// Write secret material readable by the owner only.
///
/// On unix the file is created with mode 0600, so the contents are never
/// visible with wider permissions; an existing file is narrowed to 0600.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> SyncResult<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        if path.exists() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
