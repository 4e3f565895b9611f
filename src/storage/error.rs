use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    SerializeRecord(serde_json::Error),
    DeserializeRecord {
        key: String,
        source: serde_json::Error,
    },
    CorruptIndexEntry {
        key: String,
    },
    Sled(sled::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{engine}'; currently only 'sled' is supported"
            ),
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid storage.sled.mode '{mode}'; allowed values: low_space, high_throughput"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::SerializeRecord(source) => {
                write!(f, "failed to serialize record for storage: {source}")
            }
            Self::DeserializeRecord { key, source } => {
                write!(f, "failed to deserialize record '{key}' from storage: {source}")
            }
            Self::CorruptIndexEntry { key } => {
                write!(f, "queue index entry '{key}' does not reference a job id")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sled::Error> for StorageError {
    fn from(value: sled::Error) -> Self {
        Self::Sled(value)
    }
}
