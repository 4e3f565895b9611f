use std::path::Path;

use uuid::Uuid;

use super::{SledMode, StorageBackend, StorageError};

pub struct SledStorage {
    db: sled::Db,
}

const KEYSPACE_VERSION: &str = "v1";

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }
        if let Some(mode) = mode {
            config = config.mode(mode.into_sled());
        }

        let db = config.open()?;
        Ok(Self { db })
    }

    fn read_json(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        self.db
            .get(key.as_bytes())?
            .map(|raw| decode_json(key, raw.as_ref()))
            .transpose()
    }

    fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(value).map_err(StorageError::SerializeRecord)?;
        self.db.insert(key.as_bytes(), raw)?;
        Ok(())
    }
}

fn job_key(namespace: &str, job_uuid: Uuid) -> String {
    format!("{namespace}:{KEYSPACE_VERSION}:job:{job_uuid}")
}

fn waiting_prefix(namespace: &str, platform: &str) -> String {
    format!("{namespace}:{KEYSPACE_VERSION}:wait:{platform}:")
}

// Zero padded so lexicographic key order matches enqueue order.
fn waiting_key(namespace: &str, platform: &str, sequence: u64) -> String {
    format!("{}{sequence:020}", waiting_prefix(namespace, platform))
}

fn outcome_prefix(namespace: &str) -> String {
    format!("{namespace}:{KEYSPACE_VERSION}:done:")
}

fn outcome_key(namespace: &str, job_uuid: Uuid) -> String {
    format!("{}{job_uuid}", outcome_prefix(namespace))
}

fn credential_key(namespace: &str, record_key: &str) -> String {
    format!("{namespace}:{KEYSPACE_VERSION}:cred:{record_key}")
}

fn decode_json(key: &str, raw: &[u8]) -> Result<serde_json::Value, StorageError> {
    serde_json::from_slice(raw).map_err(|source| StorageError::DeserializeRecord {
        key: key.to_owned(),
        source,
    })
}

fn uuid_from_bytes(key: &str, raw: &[u8]) -> Result<Uuid, StorageError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| Uuid::parse_str(text).ok())
        .ok_or_else(|| StorageError::CorruptIndexEntry {
            key: key.to_owned(),
        })
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn next_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.db.generate_id()?)
    }

    fn enqueue_job_record(
        &self,
        namespace: &str,
        platform: &str,
        sequence: u64,
        job_uuid: Uuid,
        record: &serde_json::Value,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(record).map_err(StorageError::SerializeRecord)?;
        let mut batch = sled::Batch::default();
        batch.insert(job_key(namespace, job_uuid).as_bytes(), raw);
        batch.insert(
            waiting_key(namespace, platform, sequence).as_bytes(),
            job_uuid.to_string().as_bytes(),
        );
        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn claim_waiting_job(&self, namespace: &str, platform: &str) -> Result<Option<Uuid>, StorageError> {
        let prefix = waiting_prefix(namespace, platform);
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            // Losing the swap means another worker claimed this entry first.
            let swapped = self
                .db
                .compare_and_swap(&key, Some(&value), None::<sled::IVec>)?;
            if swapped.is_ok() {
                let key_text = String::from_utf8_lossy(key.as_ref()).into_owned();
                return uuid_from_bytes(&key_text, value.as_ref()).map(Some);
            }
        }
        Ok(None)
    }

    fn upsert_job_record(
        &self,
        namespace: &str,
        job_uuid: Uuid,
        record: &serde_json::Value,
    ) -> Result<(), StorageError> {
        self.write_json(&job_key(namespace, job_uuid), record)
    }

    fn get_job_record(
        &self,
        namespace: &str,
        job_uuid: Uuid,
    ) -> Result<Option<serde_json::Value>, StorageError> {
        self.read_json(&job_key(namespace, job_uuid))
    }

    fn remove_job_record(&self, namespace: &str, job_uuid: Uuid) -> Result<bool, StorageError> {
        let key = job_key(namespace, job_uuid);
        let Some(record) = self.read_json(&key)? else {
            return Ok(false);
        };

        let mut batch = sled::Batch::default();
        batch.remove(key.as_bytes());
        batch.remove(outcome_key(namespace, job_uuid).as_bytes());
        let platform = record.get("platform").and_then(serde_json::Value::as_str);
        let sequence = record.get("sequence").and_then(serde_json::Value::as_u64);
        if let (Some(platform), Some(sequence)) = (platform, sequence) {
            batch.remove(waiting_key(namespace, platform, sequence).as_bytes());
        }
        self.db.apply_batch(batch)?;
        Ok(true)
    }

    fn put_job_outcome(
        &self,
        namespace: &str,
        job_uuid: Uuid,
        outcome: &serde_json::Value,
    ) -> Result<(), StorageError> {
        self.write_json(&outcome_key(namespace, job_uuid), outcome)
    }

    fn take_job_outcome(
        &self,
        namespace: &str,
        job_uuid: Uuid,
    ) -> Result<Option<serde_json::Value>, StorageError> {
        let key = outcome_key(namespace, job_uuid);
        self.db
            .remove(key.as_bytes())?
            .map(|raw| decode_json(&key, raw.as_ref()))
            .transpose()
    }

    fn list_job_outcome_uuids(&self, namespace: &str) -> Result<Vec<Uuid>, StorageError> {
        let prefix = outcome_prefix(namespace);
        let mut uuids = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let key_text = String::from_utf8_lossy(key.as_ref()).into_owned();
            uuids.push(uuid_from_bytes(&key_text, &key[prefix.len()..])?);
        }
        Ok(uuids)
    }

    fn put_credential_record(
        &self,
        namespace: &str,
        record_key: &str,
        record: &serde_json::Value,
    ) -> Result<(), StorageError> {
        self.write_json(&credential_key(namespace, record_key), record)
    }

    fn get_credential_record(
        &self,
        namespace: &str,
        record_key: &str,
    ) -> Result<Option<serde_json::Value>, StorageError> {
        self.read_json(&credential_key(namespace, record_key))
    }

    fn purge_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut batch = sled::Batch::default();
        let mut removed = 0_usize;
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            batch.remove(key);
            removed += 1;
        }
        self.db.apply_batch(batch)?;
        Ok(removed)
    }
}
