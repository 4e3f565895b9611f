use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{CipherError, PayloadCipher, SessionContext};
use crate::storage::{StorageError, StorageFacade};

#[derive(Debug)]
pub enum CredentialStoreError {
    Cipher(CipherError),
    Storage(StorageError),
    Serialize(serde_json::Error),
    CorruptRecord {
        record_key: String,
        source: serde_json::Error,
    },
}

impl fmt::Display for CredentialStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cipher(source) => write!(f, "credential encryption failed: {source}"),
            Self::Storage(source) => write!(f, "credential store unavailable: {source}"),
            Self::Serialize(source) => write!(f, "failed to serialize credential record: {source}"),
            Self::CorruptRecord { record_key, source } => {
                write!(f, "credential record '{record_key}' is unreadable: {source}")
            }
        }
    }
}

impl std::error::Error for CredentialStoreError {}

impl From<CipherError> for CredentialStoreError {
    fn from(value: CipherError) -> Self {
        Self::Cipher(value)
    }
}

impl From<StorageError> for CredentialStoreError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub platform: String,
    pub actor_id: String,
    pub encrypted_payload: String,
}

/// Credentials handle of a single connection.
///
/// Records are keyed by `<connection_id>:<platform>:<actor>` inside the session
/// store namespace and sealed with the connection cipher, so another
/// connection can neither address nor open them.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<StorageFacade>,
    namespace: String,
    connection_id: u64,
    cipher: PayloadCipher,
}

impl CredentialStore {
    pub fn for_connection(
        session: &SessionContext,
        storage: Arc<StorageFacade>,
        connection_id: u64,
    ) -> Self {
        Self {
            storage,
            namespace: session.store_namespace(),
            connection_id,
            cipher: session.connection_cipher(connection_id),
        }
    }

    pub fn save(&self, platform: &str, actor_id: &str, record: &Value) -> Result<(), CredentialStoreError> {
        let sealed = CredentialRecord {
            platform: platform.to_owned(),
            actor_id: actor_id.to_owned(),
            encrypted_payload: self.cipher.encrypt_json(record)?,
        };
        let raw = serde_json::to_value(&sealed).map_err(CredentialStoreError::Serialize)?;
        self.storage
            .put_credential_record(&self.namespace, &self.record_key(platform, actor_id), &raw)?;
        Ok(())
    }

    pub fn load(&self, platform: &str, actor_id: &str) -> Result<Option<Value>, CredentialStoreError> {
        let record_key = self.record_key(platform, actor_id);
        let Some(raw) = self.storage.get_credential_record(&self.namespace, &record_key)? else {
            return Ok(None);
        };
        let sealed: CredentialRecord = serde_json::from_value(raw)
            .map_err(|source| CredentialStoreError::CorruptRecord { record_key, source })?;
        Ok(Some(self.cipher.decrypt_json(&sealed.encrypted_payload)?))
    }

    fn record_key(&self, platform: &str, actor_id: &str) -> String {
        format!("{}:{platform}:{actor_id}", self.connection_id)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("namespace", &self.namespace)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}
