mod cipher;

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

pub use cipher::{CipherError, PayloadCipher};

pub const SESSION_ID_LENGTH: usize = 16;
pub const SECRET_SIZE_BYTES: usize = 64;
const KEYSPACE_ROOT: &str = "relayhub";
const SESSION_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug)]
pub enum SessionError {
    EntropyUnavailable(rand::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntropyUnavailable(source) => {
                write!(f, "cannot generate session secret, OS entropy unavailable: {source}")
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Identity and secret of one running instance.
///
/// Generated once at boot and shared as `Arc<SessionContext>`; every queue and
/// store namespace and every payload key derives from it. The secret never
/// leaves this value except as derived cipher keys.
pub struct SessionContext {
    session_id: String,
    secret: [u8; SECRET_SIZE_BYTES],
    payload_cipher: PayloadCipher,
}

impl SessionContext {
    pub fn generate() -> Result<Self, SessionError> {
        let mut id_bytes = [0_u8; SESSION_ID_LENGTH];
        OsRng
            .try_fill_bytes(&mut id_bytes)
            .map_err(SessionError::EntropyUnavailable)?;
        let mut secret = [0_u8; SECRET_SIZE_BYTES];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(SessionError::EntropyUnavailable)?;

        let session_id = id_bytes
            .iter()
            .map(|byte| SESSION_ID_ALPHABET[*byte as usize % SESSION_ID_ALPHABET.len()] as char)
            .collect::<String>();

        Ok(Self::from_parts(session_id, secret))
    }

    fn from_parts(session_id: String, secret: [u8; SECRET_SIZE_BYTES]) -> Self {
        let payload_cipher = PayloadCipher::derive(&secret, "");
        Self {
            session_id,
            secret,
            payload_cipher,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Prefix shared by every key this session writes.
    pub fn keyspace_prefix(&self) -> String {
        format!("{KEYSPACE_ROOT}:{}:", self.session_id)
    }

    pub fn queue_namespace(&self) -> String {
        format!("{KEYSPACE_ROOT}:{}:queue", self.session_id)
    }

    pub fn store_namespace(&self) -> String {
        format!("{KEYSPACE_ROOT}:{}:store", self.session_id)
    }

    /// Session-wide cipher for job payloads and results.
    pub fn payload_cipher(&self) -> &PayloadCipher {
        &self.payload_cipher
    }

    /// Cipher bound to a single connection, used for its credential records.
    pub fn connection_cipher(&self, connection_id: u64) -> PayloadCipher {
        PayloadCipher::derive(&self.secret, &format!(":conn:{connection_id}"))
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_session(label: &str) -> SessionContext {
    let mut secret = [0_u8; SECRET_SIZE_BYTES];
    for (idx, byte) in label.bytes().cycle().take(SECRET_SIZE_BYTES).enumerate() {
        secret[idx] = byte.wrapping_add(idx as u8);
    }
    SessionContext::from_parts(format!("test{label}"), secret)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{test_session, SessionContext, SESSION_ID_LENGTH};

    #[test]
    fn generated_sessions_are_unique_alphanumeric_tokens() {
        let first = SessionContext::generate().expect("entropy should be available");
        let second = SessionContext::generate().expect("entropy should be available");

        assert_eq!(first.session_id().len(), SESSION_ID_LENGTH);
        assert!(first.session_id().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first.session_id(), second.session_id());
    }

    #[test]
    fn namespaces_are_prefixed_with_session_id() {
        let session = test_session("ns");
        assert_eq!(session.keyspace_prefix(), "relayhub:testns:");
        assert_eq!(session.queue_namespace(), "relayhub:testns:queue");
        assert_eq!(session.store_namespace(), "relayhub:testns:store");
        assert!(session.queue_namespace().starts_with(&session.keyspace_prefix()));
    }

    #[test]
    fn session_cipher_does_not_open_other_sessions_payloads() {
        let first = SessionContext::generate().expect("entropy should be available");
        let second = SessionContext::generate().expect("entropy should be available");

        let sealed = first
            .payload_cipher()
            .encrypt_json(&json!({"platform":"irc"}))
            .expect("encrypt should pass");

        assert_eq!(
            first.payload_cipher().decrypt_json(&sealed).expect("same session decrypts"),
            json!({"platform":"irc"})
        );
        assert!(second.payload_cipher().decrypt_json(&sealed).is_err());
    }

    #[test]
    fn connection_ciphers_are_isolated_from_each_other_and_the_session() {
        let session = test_session("conn");
        let sealed = session
            .connection_cipher(1)
            .encrypt(b"credentials")
            .expect("encrypt should pass");

        assert_eq!(
            session.connection_cipher(1).decrypt(&sealed).expect("same connection decrypts"),
            b"credentials".to_vec()
        );
        assert!(session.connection_cipher(2).decrypt(&sealed).is_err());
        assert!(session.payload_cipher().decrypt(&sealed).is_err());
    }

    #[test]
    fn debug_output_redacts_secret() {
        let session = test_session("dbg");
        let rendered = format!("{session:?}");
        assert!(rendered.contains("testdbg"));
        assert!(rendered.contains("<redacted>"));
    }
}
