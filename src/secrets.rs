//! Sealed credential storage.
//!
//! Device and data target credentials are stored encrypted. Everything that
//! needs the plaintext goes through a [`SecretStore`].

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("secret key must be 32 bytes of base64, got {0}")]
    InvalidKey(String),
    #[error("sealed value is malformed")]
    Malformed,
    #[error("unable to decrypt sealed value")]
    Decrypt,
    #[error("unable to encrypt value")]
    Encrypt,
}

/// Symmetric seal/reveal of credential fields.
pub trait SecretStore: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<String, SecretError>;

    /// Returns `Ok(None)` for an empty input instead of failing.
    fn reveal(&self, sealed: &str) -> Result<Option<String>, SecretError>;

    /// Convenience for optional columns.
    fn reveal_opt(&self, sealed: Option<&str>) -> Result<Option<String>, SecretError> {
        match sealed {
            Some(s) => self.reveal(s),
            None => Ok(None),
        }
    }
}

/// AES-256-GCM; sealed values are `base64(nonce || ciphertext)`.
pub struct AesGcmSecretStore {
    cipher: Aes256Gcm,
}

impl AesGcmSecretStore {
    /// Build from a base64 encoded 32-byte key.
    pub fn from_base64_key(key: &str) -> Result<Self, SecretError> {
        let bytes = BASE64
            .decode(key.trim())
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(SecretError::InvalidKey(format!("{} bytes", bytes.len())));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Fresh random key, base64 encoded.
    pub fn generate_key() -> String {
        BASE64.encode(Aes256Gcm::generate_key(&mut OsRng))
    }
}

impl SecretStore for AesGcmSecretStore {
    fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn reveal(&self, sealed: &str) -> Result<Option<String>, SecretError> {
        if sealed.is_empty() {
            return Ok(None);
        }

        let bytes = BASE64.decode(sealed).map_err(|_| SecretError::Malformed)?;
        if bytes.len() <= NONCE_LEN {
            return Err(SecretError::Malformed);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Decrypt)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| SecretError::Malformed)
    }
}
