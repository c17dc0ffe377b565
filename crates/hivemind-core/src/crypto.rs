//! Encryption envelope for document bodies
//!
//! Document bodies travel between peers as AES-256-CBC ciphertext with a
//! fresh random IV per call. An HMAC-SHA256 tag over `iv || ciphertext`
//! (MAC key derived from the cipher key with HKDF) makes tampering fail
//! deterministically instead of decrypting to garbage.
//!
//! # Wire Format
//!
//! ```text
//! <ivHex>:<cipherTextHex>:<tagHex>     authenticated (always produced)
//! <ivHex>:<cipherTextHex>              legacy, accepted only when enabled
//! ```

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{SyncError, SyncResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Cipher key size (AES-256)
pub const KEY_SIZE: usize = 32;

/// IV size (one AES block)
pub const IV_SIZE: usize = 16;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// HMAC-SHA256 tag size
pub const TAG_SIZE: usize = 32;

const MAC_KEY_INFO: &[u8] = b"hivemind-envelope-mac-v1";

/// Symmetric envelope shared by every peer in the mesh.
///
/// # Example
///
/// ```
/// use hivemind_core::crypto::CipherBox;
///
/// let key = CipherBox::generate_key();
/// let cipher = CipherBox::new(&key);
///
/// let envelope = cipher.encrypt("hello");
/// assert_eq!(cipher.decrypt(&envelope).unwrap(), "hello");
/// ```
#[derive(Clone)]
pub struct CipherBox {
    key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
    allow_legacy: bool,
}

impl CipherBox {
    /// Create a cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        let mut mac_key = [0u8; KEY_SIZE];
        // 32 bytes is far below the HKDF-SHA256 output limit
        let _ = Hkdf::<Sha256>::new(None, key).expand(MAC_KEY_INFO, &mut mac_key);

        Self {
            key: *key,
            mac_key,
            allow_legacy: false,
        }
    }

    /// Create a cipher from a hex-encoded key (64 hex chars)
    pub fn from_hex(hex_key: &str) -> SyncResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SyncError::Config(format!("Encryption key is not valid hex: {}", e)))?;
        let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            SyncError::Config(format!(
                "Encryption key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key))
    }

    /// Accept untagged `<iv>:<ct>` envelopes on decrypt
    pub fn allow_legacy(mut self, allow: bool) -> Self {
        self.allow_legacy = allow;
        self
    }

    /// Generate a new random 32-byte key
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt a document body into an authenticated envelope
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_SIZE];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        let tag = self.tag(&iv, &ciphertext).finalize().into_bytes();

        format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(&ciphertext),
            hex::encode(tag)
        )
    }

    /// Encrypt without a tag, producing `<ivHex>:<cipherTextHex>`
    ///
    /// Only for talking to peers that predate authenticated envelopes.
    pub fn encrypt_legacy(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_SIZE];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
    }

    /// Decrypt an envelope back into the document body
    pub fn decrypt(&self, envelope: &str) -> SyncResult<String> {
        let (iv_hex, rest) = envelope
            .split_once(':')
            .ok_or_else(|| SyncError::DecryptionFailed("Envelope has no IV separator".into()))?;
        let (ct_hex, tag_hex) = match rest.split_once(':') {
            Some((ct, tag)) => (ct, Some(tag)),
            None => (rest, None),
        };

        let iv: [u8; IV_SIZE] = hex::decode(iv_hex)
            .map_err(|e| SyncError::DecryptionFailed(format!("IV is not valid hex: {}", e)))?
            .as_slice()
            .try_into()
            .map_err(|_| SyncError::DecryptionFailed(format!("IV must be {} bytes", IV_SIZE)))?;

        let ciphertext = hex::decode(ct_hex).map_err(|e| {
            SyncError::DecryptionFailed(format!("Ciphertext is not valid hex: {}", e))
        })?;
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(SyncError::DecryptionFailed(format!(
                "Ciphertext length {} is not a positive multiple of {}",
                ciphertext.len(),
                BLOCK_SIZE
            )));
        }

        match tag_hex {
            Some(tag_hex) => {
                let tag = hex::decode(tag_hex).map_err(|e| {
                    SyncError::DecryptionFailed(format!("Tag is not valid hex: {}", e))
                })?;
                self.tag(&iv, &ciphertext)
                    .verify_slice(&tag)
                    .map_err(|_| SyncError::DecryptionFailed("Authentication tag mismatch".into()))?;
            }
            None if self.allow_legacy => {}
            None => {
                return Err(SyncError::DecryptionFailed(
                    "Envelope carries no authentication tag".into(),
                ))
            }
        }

        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| SyncError::DecryptionFailed("Bad padding (wrong key?)".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| SyncError::DecryptionFailed("Plaintext is not valid UTF-8".into()))
    }

    fn tag(&self, iv: &[u8], ciphertext: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts keys of any length");
        mac.update(iv);
        mac.update(ciphertext);
        mac
    }
}

impl std::fmt::Debug for CipherBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherBox")
            .field("allow_legacy", &self.allow_legacy)
            .finish_non_exhaustive()
    }
}
