use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};

use super::{
    expand_home_path, SledMode, SledStorage, StorageBackend, StorageEngine,
    StorageError,
};

pub struct StorageFacade {
    engine: StorageEngine,
    data_path: PathBuf,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let storage = &app_config.storage;
        let engine: StorageEngine = storage
            .engine
            .parse()
            .map_err(|engine| StorageError::UnsupportedEngine { engine })?;
        let mode = storage
            .sled
            .mode
            .as_deref()
            .map(|raw| raw.parse::<SledMode>())
            .transpose()
            .map_err(|mode| StorageError::InvalidSledMode { mode })?;
        let data_path = expand_home_path(&storage.path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Opening storage",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": storage.path,
                "resolved_path": data_path.display().to_string(),
                "sled": {
                    "cache_capacity": storage.sled.cache_capacity,
                    "mode": storage.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend: Box<dyn StorageBackend> = match engine {
            StorageEngine::Sled => Box::new(SledStorage::open(
                &data_path,
                storage.sled.cache_capacity,
                mode,
            )?),
        };

        logger.debug(Some("storage::init"), "Storage opened");

        Ok(Self {
            engine,
            data_path,
            backend,
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    pub fn next_sequence(&self) -> Result<u64, StorageError> {
        self.backend.next_sequence()
    }

    pub fn enqueue_job_record(
        &self,
        namespace: &str,
        platform: &str,
        sequence: u64,
        job_uuid: Uuid,
        record: &serde_json::Value,
    ) -> Result<(), StorageError> {
        self.backend
            .enqueue_job_record(namespace, platform, sequence, job_uuid, record)
    }

    pub fn claim_waiting_job(&self, namespace: &str, platform: &str) -> Result<Option<Uuid>, StorageError> {
        self.backend.claim_waiting_job(namespace, platform)
    }

    pub fn upsert_job_record(
        &self,
        namespace: &str,
        job_uuid: Uuid,
        record: &serde_json::Value,
    ) -> Result<(), StorageError> {
        self.backend.upsert_job_record(namespace, job_uuid, record)
    }

    pub fn get_job_record(
        &self,
        namespace: &str,
        job_uuid: Uuid,
    ) -> Result<Option<serde_json::Value>, StorageError> {
        self.backend.get_job_record(namespace, job_uuid)
    }

    pub fn remove_job_record(&self, namespace: &str, job_uuid: Uuid) -> Result<bool, StorageError> {
        self.backend.remove_job_record(namespace, job_uuid)
    }

    pub fn put_job_outcome(
        &self,
        namespace: &str,
        job_uuid: Uuid,
        outcome: &serde_json::Value,
    ) -> Result<(), StorageError> {
        self.backend.put_job_outcome(namespace, job_uuid, outcome)
    }

    pub fn take_job_outcome(
        &self,
        namespace: &str,
        job_uuid: Uuid,
    ) -> Result<Option<serde_json::Value>, StorageError> {
        self.backend.take_job_outcome(namespace, job_uuid)
    }

    pub fn list_job_outcome_uuids(&self, namespace: &str) -> Result<Vec<Uuid>, StorageError> {
        self.backend.list_job_outcome_uuids(namespace)
    }

    pub fn put_credential_record(
        &self,
        namespace: &str,
        record_key: &str,
        record: &serde_json::Value,
    ) -> Result<(), StorageError> {
        self.backend.put_credential_record(namespace, record_key, record)
    }

    pub fn get_credential_record(
        &self,
        namespace: &str,
        record_key: &str,
    ) -> Result<Option<serde_json::Value>, StorageError> {
        self.backend.get_credential_record(namespace, record_key)
    }

    /// Removes every key starting with `prefix`, returning how many were dropped.
    pub fn purge_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        self.backend.purge_prefix(prefix)
    }
}
