
use uuid::Uuid;

use super::StorageError;

/// Key/value persistence behind the job queue bridge and the credential store.
///
/// Every operation takes the namespace it works in, so one backend instance can
/// hold the keyspaces of a whole session and purge them together.
pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;
    fn next_sequence(&self) -> Result<u64, StorageError>;
    fn enqueue_job_record(
        &self,
        namespace: &str,
        platform: &str,
        sequence: u64,
        job_uuid: Uuid,
        record: &serde_json::Value,
    ) -> Result<(), StorageError>;
    fn claim_waiting_job(&self, namespace: &str, platform: &str) -> Result<Option<Uuid>, StorageError>;
    fn upsert_job_record(
        &self,
        namespace: &str,
        job_uuid: Uuid,
        record: &serde_json::Value,
    ) -> Result<(), StorageError>;
    fn get_job_record(
        &self,
        namespace: &str,
        job_uuid: Uuid,
    ) -> Result<Option<serde_json::Value>, StorageError>;
    fn remove_job_record(&self, namespace: &str, job_uuid: Uuid) -> Result<bool, StorageError>;
    fn put_job_outcome(
        &self,
        namespace: &str,
        job_uuid: Uuid,
        outcome: &serde_json::Value,
    ) -> Result<(), StorageError>;
    fn take_job_outcome(
        &self,
        namespace: &str,
        job_uuid: Uuid,
    ) -> Result<Option<serde_json::Value>, StorageError>;
    fn list_job_outcome_uuids(&self, namespace: &str) -> Result<Vec<Uuid>, StorageError>;
    fn put_credential_record(
        &self,
        namespace: &str,
        record_key: &str,
        record: &serde_json::Value,
    ) -> Result<(), StorageError>;
    fn get_credential_record(
        &self,
        namespace: &str,
        record_key: &str,
    ) -> Result<Option<serde_json::Value>, StorageError>;
    fn purge_prefix(&self, prefix: &str) -> Result<usize, StorageError>;
}
