//! Identity and trust for Hive Mind peers
//!
//! Each peer holds an Ed25519 signing key. Peers prove possession of their
//! key by signing a random challenge; the verifier then checks the key
//! against its [`TrustStore`] allowlist.
//!
//! ## Example
//!
//! ```rust
//! use hivemind_core::identity::{Keypair, TrustStore};
//!
//! let alice = Keypair::generate();
//! let bob = TrustStore::generate([alice.public_key_base64()]);
//!
//! let nonce = b"random challenge";
//! let signature = alice.sign(nonce);
//!
//! assert!(bob.verify(nonce, &signature, &alice.public_key()));
//! assert!(bob.is_trusted(&alice.public_key_base64()));
//! ```

mod keypair;
mod trust;

pub use keypair::{verify_signature, Keypair, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub(crate) use keypair::write_private_file;
pub use trust::TrustStore;
