//! Encryption of secret widget parameters.
//!
//! Values are stored as base64(nonce || ciphertext) under AES-256-GCM. The
//! key is derived from a configured passphrase with HMAC-SHA256, so it is
//! stable across restarts.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = hmac::Hmac<Sha256>;

const KEY_CONTEXT: &[u8] = b"suricate-secrets-v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("base64 decode failed: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("encrypted value too short")]
    TooShort,

    #[error("invalid key material")]
    Key,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("decrypted value is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Cipher for secret widget parameters.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn from_passphrase(passphrase: &str) -> Result<Self, SecretError> {
        let key = derive_key(passphrase)?;
        Ok(Self {
            cipher: Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_slice())),
        })
    }

    /// Encrypt a plaintext value. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a base64(nonce || ciphertext) value.
    pub fn decrypt(&self, encoded: &str) -> Result<String, SecretError> {
        let combined = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;

        if combined.len() <= NONCE_LEN {
            return Err(SecretError::TooShort);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SecretError::Decrypt)?;

        Ok(String::from_utf8(plaintext)?)
    }
}

fn derive_key(passphrase: &str) -> Result<Zeroizing<[u8; 32]>, SecretError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(KEY_CONTEXT).map_err(|_| SecretError::Key)?;
    mac.update(passphrase.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}
