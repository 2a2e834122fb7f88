//! Encryption of TOTP secrets and backup codes at rest.
//!
//! The credential store never persists shared secrets in the clear; it runs
//! them through an injected [`SecretCodec`] at the storage boundary. The
//! ciphertext is bound to the owning user id as associated data, so a row
//! copied onto another user's record fails to decrypt.

use crate::error::{MfaError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

/// Encrypts and decrypts secret material keyed to its owning user.
pub trait SecretCodec: Send + Sync {
    /// Encrypt `plaintext` for the given user, returning an opaque string.
    fn encrypt(&self, user_id: &str, plaintext: &str) -> Result<String>;

    /// Decrypt a string previously produced by [`encrypt`](Self::encrypt)
    /// for the same user.
    fn decrypt(&self, user_id: &str, ciphertext: &str) -> Result<String>;
}

/// ChaCha20-Poly1305 codec.
///
/// Output layout is `base64(nonce || ciphertext)` with a fresh random
/// 12-byte nonce per encryption. The user id is fed in as AEAD associated
/// data rather than mixed into the key, so a single key serves all users
/// while still tying each ciphertext to its owner.
pub struct ChaChaSecretCodec {
    cipher: ChaCha20Poly1305,
}

impl ChaChaSecretCodec {
    /// Nonce size in bytes.
    const NONCE_LEN: usize = 12;

    /// Create a codec from a 32-byte key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Create a codec from a base64-encoded 32-byte key, as typically
    /// loaded from an environment variable.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| MfaError::internal(format!("secret key is not valid base64: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MfaError::internal("secret key must be exactly 32 bytes"))?;
        Ok(Self::new(&key))
    }
}

impl SecretCodec for ChaChaSecretCodec {
    fn encrypt(&self, user_id: &str, plaintext: &str) -> Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: user_id.as_bytes(),
                },
            )
            .map_err(|_| MfaError::internal("secret encryption failed"))?;

        let mut out = Vec::with_capacity(Self::NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    fn decrypt(&self, user_id: &str, ciphertext: &str) -> Result<String> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|_| MfaError::internal("stored secret is not valid base64"))?;
        if raw.len() <= Self::NONCE_LEN {
            return Err(MfaError::internal("stored secret is truncated"));
        }
        let (nonce, body) = raw.split_at(Self::NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: user_id.as_bytes(),
                },
            )
            .map_err(|_| MfaError::internal("secret decryption failed"))?;
        String::from_utf8(plaintext)
            .map_err(|_| MfaError::internal("decrypted secret is not valid UTF-8"))
    }
}

/// Identity codec that stores secrets verbatim. Tests only.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainCodec;

impl SecretCodec for PlainCodec {
    fn encrypt(&self, _user_id: &str, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, _user_id: &str, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}
