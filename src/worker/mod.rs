use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::config::QueueConfig;
use crate::credentials::CredentialStore;
use crate::logging::{LogLevel, Logger};
use crate::platforms::{JobContext, PlatformHandler};
use crate::queue::{Job, JobQueue, QueueError};
use crate::session::SessionContext;
use crate::storage::StorageFacade;

pub const UNDECRYPTABLE_PAYLOAD_ERROR: &str = "unable to decrypt job payload";
const STOP_CHECK_SLICE: Duration = Duration::from_millis(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl WorkerConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms.max(1)),
            error_backoff: Duration::from_millis(config.worker_error_backoff_ms.max(1)),
        }
    }
}

#[derive(Debug)]
pub enum WorkerError {
    AlreadyRunning { platform: String },
    Spawn { platform: String, source: std::io::Error },
    JoinFailed { platform: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning { platform } => write!(f, "worker for '{platform}' is already running"),
            Self::Spawn { platform, source } => {
                write!(f, "failed to spawn worker thread for '{platform}': {source}")
            }
            Self::JoinFailed { platform } => write!(f, "worker thread for '{platform}' panicked"),
        }
    }
}

impl std::error::Error for WorkerError {}

/// What one worker needs to execute jobs; cheap to clone into its thread.
#[derive(Clone)]
struct WorkerRuntime {
    platform: String,
    queue: JobQueue,
    session: Arc<SessionContext>,
    storage: Arc<StorageFacade>,
    handler: Arc<dyn PlatformHandler>,
    logger: Logger,
}

impl WorkerRuntime {
    /// Claims and finishes at most one job; `Ok(false)` means the queue was empty.
    fn run_once(&self) -> Result<bool, QueueError> {
        let Some(job) = self.queue.claim_next(&self.platform)? else {
            return Ok(false);
        };

        self.logger.log(
            LogLevel::Debug,
            Some("worker::job"),
            "claimed job",
            Some(json!({
                "platform": self.platform,
                "job_id": job.id.to_string(),
                "title": job.title,
            })),
        );

        match self.execute(&job) {
            Ok(encrypted_result) => self.queue.complete(job.id, encrypted_result)?,
            Err(reason) => {
                self.logger.log(
                    LogLevel::Info,
                    Some("worker::job"),
                    "job failed",
                    Some(json!({
                        "platform": self.platform,
                        "job_id": job.id.to_string(),
                        "error": reason,
                    })),
                );
                self.queue.fail(job.id, reason)?;
            }
        }
        Ok(true)
    }

    fn execute(&self, job: &Job) -> Result<String, String> {
        let cipher = self.session.payload_cipher();
        let message = cipher
            .decrypt_json(&job.encrypted_payload)
            .map_err(|_| UNDECRYPTABLE_PAYLOAD_ERROR.to_owned())?;
        let credentials =
            CredentialStore::for_connection(&self.session, Arc::clone(&self.storage), job.owner_connection_id);
        let context = JobContext::new(job, &message, &credentials);

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(&context)))
            .map_err(|panic_payload| {
                format!("platform handler panicked: {}", panic_message(panic_payload.as_ref()))
            })??;

        cipher
            .encrypt_json(&result)
            .map_err(|error| format!("unable to encrypt job result: {error}"))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn sleep_unless_stopped(stop_signal: &AtomicBool, duration: Duration) {
    let mut remaining = duration;
    while !remaining.is_zero() && !stop_signal.load(Ordering::SeqCst) {
        let slice = remaining.min(STOP_CHECK_SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
}

/// Long-lived consumer of one platform's jobs.
pub struct Worker {
    runtime: WorkerRuntime,
    config: WorkerConfig,
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        platform: impl Into<String>,
        queue: JobQueue,
        session: Arc<SessionContext>,
        storage: Arc<StorageFacade>,
        handler: Arc<dyn PlatformHandler>,
        logger: Logger,
        config: WorkerConfig,
    ) -> Self {
        Self {
            runtime: WorkerRuntime {
                platform: platform.into(),
                queue,
                session,
                storage,
                handler,
                logger,
            },
            config,
            stop_signal: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn platform(&self) -> &str {
        &self.runtime.platform
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.thread.is_some() {
            return Err(WorkerError::AlreadyRunning {
                platform: self.runtime.platform.clone(),
            });
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let runtime = self.runtime.clone();
        let config = self.config;

        let handle = thread::Builder::new()
            .name(format!("worker-{}", runtime.platform))
            .spawn(move || {
                runtime.logger.info(
                    Some("worker::loop"),
                    &format!("worker for '{}' started", runtime.platform),
                );
                while !stop_signal.load(Ordering::SeqCst) {
                    match runtime.run_once() {
                        Ok(true) => {}
                        Ok(false) => sleep_unless_stopped(&stop_signal, config.poll_interval),
                        Err(error) => {
                            runtime.logger.error(
                                Some("worker::loop"),
                                &format!("queue error on '{}', backing off: {error}", runtime.platform),
                            );
                            sleep_unless_stopped(&stop_signal, config.error_backoff);
                        }
                    }
                }
                runtime.logger.info(
                    Some("worker::loop"),
                    &format!("worker for '{}' stopped", runtime.platform),
                );
            })
            .map_err(|source| WorkerError::Spawn {
                platform: self.runtime.platform.clone(),
                source,
            })?;

        self.thread = Some(handle);
        Ok(())
    }

    /// Signals the loop and waits for the job in progress, if any, to finish.
    pub fn stop(&mut self) -> Result<(), WorkerError> {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            return handle.join().map_err(|_| WorkerError::JoinFailed {
                platform: self.runtime.platform.clone(),
            });
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
