//! Client identity
//!
//! The session only needs two things from an identity: a stable client id
//! for the connection URL, and a way to sign the server's challenge bytes.
//! `Ed25519Identity` is the stock implementation.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::SessionError;

/// Key material the handshake signs with.
pub trait Identity: Send + Sync + 'static {
    /// Identifier sent as the `client_id` query parameter.
    fn client_id(&self) -> String;

    /// Sign raw challenge bytes.
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Ed25519 key pair identity.
#[derive(Clone)]
pub struct Ed25519Identity {
    key: SigningKey,
}

impl Ed25519Identity {
    /// Fresh random key pair.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic key pair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl std::fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("client_id", &self.client_id())
            .finish()
    }
}

impl Identity for Ed25519Identity {
    fn client_id(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.key.verifying_key().as_bytes())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

/// Standard padded base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Inverse of [`encode_base64`].
pub fn decode_base64(text: &str) -> Result<Vec<u8>, SessionError> {
    STANDARD
        .decode(text)
        .map_err(|_| SessionError::BadChallengeRequest)
}
