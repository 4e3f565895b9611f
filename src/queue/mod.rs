use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::logging::{LogLevel, Logger};
use crate::storage::{StorageError, StorageFacade};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// One unit of work bound to a platform and to the connection that asked for it.
///
/// `owner_connection_id` is fixed at creation and is the only routing key used
/// when the outcome is delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub platform: String,
    pub owner_connection_id: u64,
    pub title: String,
    pub encrypted_payload: String,
    pub status: JobStatus,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewJob {
    pub title: String,
    pub owner_connection_id: u64,
    pub encrypted_payload: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Completed { encrypted_result: String },
    Failed { error: String },
}

#[derive(Debug)]
pub enum QueueError {
    Storage(StorageError),
    SerializeRecord(serde_json::Error),
    CorruptRecord {
        job_id: Uuid,
        source: serde_json::Error,
    },
    JobNotFound {
        job_id: Uuid,
    },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(source) => write!(f, "job queue storage failure: {source}"),
            Self::SerializeRecord(source) => write!(f, "failed to serialize job record: {source}"),
            Self::CorruptRecord { job_id, source } => {
                write!(f, "job record '{job_id}' is unreadable: {source}")
            }
            Self::JobNotFound { job_id } => write!(f, "job '{job_id}' not found"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<StorageError> for QueueError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemovalPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RemovalPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.removal_max_attempts.max(1),
            interval: Duration::from_millis(config.removal_retry_interval_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed { attempts: u32 },
    AlreadyGone { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

/// Receives the ids of jobs whose outcome was just recorded.
pub struct OutcomeFeed {
    receiver: Receiver<Uuid>,
}

impl OutcomeFeed {
    pub fn next(&mut self, timeout: Duration) -> Option<Uuid> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

/// In-process fan-out of finished job ids. Channels are unbounded, so a
/// finishing worker never waits on a slow subscriber.
#[derive(Default)]
struct OutcomeNotifier {
    subscribers: Mutex<Vec<Sender<Uuid>>>,
}

impl OutcomeNotifier {
    fn subscribe(&self) -> Receiver<Uuid> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    fn notify(&self, job_id: Uuid) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|sender| sender.send(job_id).is_ok());
    }
}

/// Persistent per-platform FIFO queue living inside one session namespace.
#[derive(Clone)]
pub struct JobQueue {
    storage: Arc<StorageFacade>,
    namespace: String,
    notifier: Arc<OutcomeNotifier>,
}

impl JobQueue {
    pub fn new(storage: Arc<StorageFacade>, namespace: impl Into<String>) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            notifier: Arc::new(OutcomeNotifier::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn enqueue(&self, platform: &str, new_job: NewJob) -> Result<Uuid, QueueError> {
        let sequence = self.storage.next_sequence()?;
        let job = Job {
            id: Uuid::new_v4(),
            platform: platform.to_owned(),
            owner_connection_id: new_job.owner_connection_id,
            title: new_job.title,
            encrypted_payload: new_job.encrypted_payload,
            status: JobStatus::Waiting,
            sequence,
            created_at: Utc::now(),
        };
        let record = serde_json::to_value(&job).map_err(QueueError::SerializeRecord)?;
        self.storage
            .enqueue_job_record(&self.namespace, platform, sequence, job.id, &record)?;
        Ok(job.id)
    }

    /// Claims the oldest waiting job of `platform`; each job is handed out at most once.
    pub fn claim_next(&self, platform: &str) -> Result<Option<Job>, QueueError> {
        loop {
            let Some(job_id) = self.storage.claim_waiting_job(&self.namespace, platform)? else {
                return Ok(None);
            };
            // A stale index entry whose record was already removed is skipped.
            let Some(mut job) = self.get(job_id)? else {
                continue;
            };
            job.status = JobStatus::Active;
            self.write(&job)?;
            return Ok(Some(job));
        }
    }

    pub fn complete(&self, job_id: Uuid, encrypted_result: String) -> Result<(), QueueError> {
        self.finish(job_id, JobStatus::Completed, JobOutcome::Completed { encrypted_result })
    }

    pub fn fail(&self, job_id: Uuid, error: impl Into<String>) -> Result<(), QueueError> {
        self.finish(job_id, JobStatus::Failed, JobOutcome::Failed { error: error.into() })
    }

    fn finish(&self, job_id: Uuid, status: JobStatus, outcome: JobOutcome) -> Result<(), QueueError> {
        let Some(mut job) = self.get(job_id)? else {
            return Err(QueueError::JobNotFound { job_id });
        };
        job.status = status;
        self.write(&job)?;
        let record = serde_json::to_value(&outcome).map_err(QueueError::SerializeRecord)?;
        self.storage.put_job_outcome(&self.namespace, job_id, &record)?;
        self.notifier.notify(job_id);
        Ok(())
    }

    /// Announces outcomes finished through this queue or any of its clones.
    /// Outcomes recorded before the call are only found by [`JobQueue::pending_outcomes`].
    pub fn subscribe_outcomes(&self) -> OutcomeFeed {
        OutcomeFeed {
            receiver: self.notifier.subscribe(),
        }
    }

    pub fn pending_outcomes(&self) -> Result<Vec<Uuid>, QueueError> {
        Ok(self.storage.list_job_outcome_uuids(&self.namespace)?)
    }

    /// Removes and returns the outcome; a second call for the same job yields `None`.
    pub fn take_outcome(&self, job_id: Uuid) -> Result<Option<JobOutcome>, QueueError> {
        self.storage
            .take_job_outcome(&self.namespace, job_id)?
            .map(|raw| {
                serde_json::from_value(raw).map_err(|source| QueueError::CorruptRecord { job_id, source })
            })
            .transpose()
    }

    pub fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        self.storage
            .get_job_record(&self.namespace, job_id)?
            .map(|raw| {
                serde_json::from_value(raw).map_err(|source| QueueError::CorruptRecord { job_id, source })
            })
            .transpose()
    }

    pub fn remove(&self, job_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.storage.remove_job_record(&self.namespace, job_id)?)
    }

    pub fn remove_with_retry(
        &self,
        job_id: Uuid,
        policy: RemovalPolicy,
        logger: &Logger,
    ) -> RemovalOutcome {
        retry_removal(job_id, policy, logger, || self.remove(job_id))
    }

    fn write(&self, job: &Job) -> Result<(), QueueError> {
        let record = serde_json::to_value(job).map_err(QueueError::SerializeRecord)?;
        self.storage.upsert_job_record(&self.namespace, job.id, &record)?;
        Ok(())
    }
}

fn retry_removal(
    job_id: Uuid,
    policy: RemovalPolicy,
    logger: &Logger,
    mut attempt_removal: impl FnMut() -> Result<bool, QueueError>,
) -> RemovalOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match attempt_removal() {
            Ok(true) => return RemovalOutcome::Removed { attempts: attempt },
            Ok(false) => return RemovalOutcome::AlreadyGone { attempts: attempt },
            Err(error) => {
                last_error = error.to_string();
                logger.warn(
                    Some("queue::remove"),
                    &format!("failed to remove job {job_id} (attempt {attempt}/{max_attempts}): {last_error}"),
                );
                if attempt < max_attempts {
                    thread::sleep(policy.interval);
                }
            }
        }
    }

    logger.log(
        LogLevel::Error,
        Some("queue::remove"),
        "giving up on job removal",
        Some(json!({
            "job_id": job_id.to_string(),
            "attempts": max_attempts,
            "error": last_error,
        })),
    );
    RemovalOutcome::Exhausted {
        attempts: max_attempts,
        last_error,
    }
}
