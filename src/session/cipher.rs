use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

const KEY_DERIVATION_LABEL: &[u8] = b"relayhub/v1";
const NONCE_SIZE_BYTES: usize = 12;

#[derive(Debug)]
pub enum CipherError {
    Entropy(rand::Error),
    Encrypt,
    Decrypt,
    Encoding(base64::DecodeError),
    Truncated { size: usize },
    Json(serde_json::Error),
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entropy(source) => write!(f, "failed to draw nonce from OS entropy: {source}"),
            Self::Encrypt => write!(f, "payload encryption failed"),
            Self::Decrypt => write!(f, "payload decryption failed: wrong key or tampered ciphertext"),
            Self::Encoding(source) => write!(f, "ciphertext is not valid base64: {source}"),
            Self::Truncated { size } => {
                write!(f, "ciphertext of {size} bytes is shorter than the nonce")
            }
            Self::Json(source) => write!(f, "decrypted payload is not valid JSON: {source}"),
        }
    }
}

impl std::error::Error for CipherError {}

/// Authenticated encryption for payloads crossing the queue and the store.
///
/// Ciphertext text form is base64 of `nonce || sealed`, so a record can be
/// stored inside a JSON document without further escaping.
#[derive(Clone)]
pub struct PayloadCipher {
    aead: ChaCha20Poly1305,
}

impl PayloadCipher {
    pub(crate) fn derive(secret: &[u8], scope: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DERIVATION_LABEL);
        hasher.update(secret);
        hasher.update(scope.as_bytes());
        let key = hasher.finalize();

        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let mut nonce = [0_u8; NONCE_SIZE_BYTES];
        OsRng.try_fill_bytes(&mut nonce).map_err(CipherError::Entropy)?;

        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut framed = Vec::with_capacity(NONCE_SIZE_BYTES + sealed.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&sealed);
        Ok(STANDARD.encode(framed))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CipherError> {
        let framed = STANDARD.decode(ciphertext).map_err(CipherError::Encoding)?;
        if framed.len() < NONCE_SIZE_BYTES {
            return Err(CipherError::Truncated { size: framed.len() });
        }

        let (nonce, sealed) = framed.split_at(NONCE_SIZE_BYTES);
        self.aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Decrypt)
    }

    pub fn encrypt_json(&self, value: &Value) -> Result<String, CipherError> {
        let plaintext = serde_json::to_vec(value).map_err(CipherError::Json)?;
        self.encrypt(&plaintext)
    }

    pub fn decrypt_json(&self, ciphertext: &str) -> Result<Value, CipherError> {
        let plaintext = self.decrypt(ciphertext)?;
        serde_json::from_slice(&plaintext).map_err(CipherError::Json)
    }
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PayloadCipher(<redacted>)")
    }
}
