mod activity;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

pub use activity::ActivityObjectRegistry;

use crate::config::AppConfig;
use crate::connections::{ConnectionRegistry, DeliveryError, OutboundEvent};
use crate::credentials::CredentialStore;
use crate::logging::{LogLevel, Logger};
use crate::platforms::{PlatformHandler, PlatformRegistry, UnavailablePlatform};
use crate::queue::{Job, JobOutcome, JobQueue, NewJob, QueueError, RemovalOutcome, RemovalPolicy};
use crate::session::SessionContext;
use crate::storage::StorageFacade;
use crate::validation::{
    failure_document, Admission, ClientEvent, CredentialsEvent, EventType, MessageEvent,
    ValidationGateway,
};
use crate::wire::envelope::{WireEnvelope, SERVER_PUSH_REQUEST_ID};
use crate::worker::{Worker, WorkerConfig, WorkerError};

pub const UNDECRYPTABLE_RESULT_ERROR: &str = "unable to decrypt job result";
const LISTENER_TICK: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub removal_policy: RemovalPolicy,
    pub worker: WorkerConfig,
    pub report_store_errors: bool,
}

impl DispatcherSettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            removal_policy: RemovalPolicy::from_config(&config.queue),
            worker: WorkerConfig::from_queue_config(&config.queue),
            report_store_errors: config.credentials.report_store_errors,
        }
    }
}

#[derive(Debug)]
pub enum DispatchError {
    AlreadyStarted,
    ListenerSpawn(std::io::Error),
    ListenerJoinFailed,
    DeliverySpawn(std::io::Error),
    DeliveryJoinFailed,
    Worker(WorkerError),
    Queue(QueueError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "dispatcher is already started"),
            Self::ListenerSpawn(source) => write!(f, "failed to spawn outcome listener: {source}"),
            Self::ListenerJoinFailed => write!(f, "outcome listener thread panicked"),
            Self::DeliverySpawn(source) => write!(f, "failed to spawn outcome delivery thread: {source}"),
            Self::DeliveryJoinFailed => write!(f, "outcome delivery thread panicked"),
            Self::Worker(source) => write!(f, "worker failure: {source}"),
            Self::Queue(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<WorkerError> for DispatchError {
    fn from(value: WorkerError) -> Self {
        Self::Worker(value)
    }
}

impl From<QueueError> for DispatchError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

/// Result of handling one job outcome notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutcomeDelivery {
    Delivered { connection_id: u64 },
    Dropped { connection_id: Option<u64>, reason: String },
    AlreadyHandled,
}

/// Outcome already removed from the queue, waiting to be written to its owner.
struct PendingDelivery {
    job_id: Uuid,
    connection_id: u64,
    event: OutboundEvent,
}

enum RoutedOutcome {
    Ready(PendingDelivery),
    Settled(OutcomeDelivery),
}

struct ConnectionState {
    credentials: CredentialStore,
    connected_at: DateTime<Utc>,
}

struct DispatcherCore {
    session: Arc<SessionContext>,
    storage: Arc<StorageFacade>,
    queue: JobQueue,
    platforms: PlatformRegistry,
    registry: Arc<dyn ConnectionRegistry>,
    gateway: ValidationGateway,
    connections: Mutex<HashMap<u64, ConnectionState>>,
    activity_objects: ActivityObjectRegistry,
    title_counter: AtomicU64,
    settings: DispatcherSettings,
    logger: Logger,
}

/// Binds client connections to the job queue and routes outcomes back.
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
    handlers: HashMap<String, Arc<dyn PlatformHandler>>,
    listener_stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    workers: Vec<Worker>,
}

impl Dispatcher {
    pub fn new(
        session: Arc<SessionContext>,
        storage: Arc<StorageFacade>,
        platforms: PlatformRegistry,
        registry: Arc<dyn ConnectionRegistry>,
        gateway: ValidationGateway,
        settings: DispatcherSettings,
        logger: Logger,
    ) -> Self {
        let queue = JobQueue::new(Arc::clone(&storage), session.queue_namespace());

        Self {
            core: Arc::new(DispatcherCore {
                session,
                storage,
                queue,
                platforms,
                registry,
                gateway,
                connections: Mutex::new(HashMap::new()),
                activity_objects: ActivityObjectRegistry::default(),
                title_counter: AtomicU64::new(0),
                settings,
                logger,
            }),
            handlers: HashMap::new(),
            listener_stop: Arc::new(AtomicBool::new(false)),
            listener: None,
            delivery: None,
            workers: Vec::new(),
        }
    }

    /// Installs the handler its workers run; platforms left without one fail every job.
    /// Returns `false` for platforms this instance does not serve.
    pub fn register_handler(&mut self, handler: Arc<dyn PlatformHandler>) -> bool {
        let platform = handler.platform().to_owned();
        if !self.core.platforms.is_worker_platform(&platform) {
            return false;
        }
        self.handlers.insert(platform, handler);
        true
    }

    #[cfg(test)]
    pub fn queue(&self) -> &JobQueue {
        &self.core.queue
    }

    #[cfg(test)]
    pub fn activity_objects(&self) -> &ActivityObjectRegistry {
        &self.core.activity_objects
    }

    pub fn connection_count(&self) -> usize {
        self.core.lock_connections().len()
    }

    pub fn on_connected(&self, connection_id: u64) {
        let state = ConnectionState {
            credentials: CredentialStore::for_connection(
                &self.core.session,
                Arc::clone(&self.core.storage),
                connection_id,
            ),
            connected_at: Utc::now(),
        };
        self.core.lock_connections().insert(connection_id, state);
        self.core.logger.debug(
            Some("dispatcher::connection"),
            &format!("connection {connection_id} registered"),
        );
    }

    /// In-flight jobs of the connection keep running; their outcomes are dropped.
    pub fn on_disconnected(&self, connection_id: u64) {
        let removed = self.core.lock_connections().remove(&connection_id);
        if let Some(state) = removed {
            let connected_for_ms = (Utc::now() - state.connected_at).num_milliseconds();
            self.core.logger.log(
                LogLevel::Debug,
                Some("dispatcher::connection"),
                "connection deregistered",
                Some(json!({
                    "connection_id": connection_id,
                    "connected_for_ms": connected_for_ms,
                })),
            );
        }
    }

    pub fn on_event(
        &self,
        connection_id: u64,
        request_id: &str,
        event_type: EventType,
        payload: Value,
    ) -> Admission {
        let core = &self.core;
        core.gateway.guard(event_type).admit(
            connection_id,
            request_id,
            payload,
            core.registry.as_ref(),
            |event| match event {
                ClientEvent::Message(message) => core.handle_message(connection_id, request_id, message),
                ClientEvent::Credentials(credentials) => {
                    core.handle_credentials(connection_id, request_id, credentials)
                }
                ClientEvent::ActivityObject(object) => {
                    let replaced = core.activity_objects.put(&object.id, object.document).is_some();
                    core.logger.log(
                        LogLevel::Debug,
                        Some("dispatcher::activity"),
                        "activity object registered",
                        Some(json!({
                            "id": object.id,
                            "replaced": replaced,
                            "registered": core.activity_objects.len(),
                        })),
                    );
                }
            },
        )
    }

    /// Routes one decoded client envelope through the validation gateway.
    pub fn on_envelope(&self, connection_id: u64, envelope: &WireEnvelope) -> Admission {
        if let Err(error) = envelope.validate_client_to_server() {
            return self
                .core
                .reject_envelope(connection_id, SERVER_PUSH_REQUEST_ID, error.to_string());
        }

        let request_id = envelope.request_id.as_str();
        let Some(event_type) = EventType::from_wire_code(envelope.message_type) else {
            return self.core.reject_envelope(
                connection_id,
                request_id,
                format!("unsupported event type {}", envelope.message_type),
            );
        };

        match envelope.payload_json() {
            Ok(payload) => self.on_event(connection_id, request_id, event_type, payload),
            Err(error) => self
                .core
                .reject_envelope(connection_id, request_id, error.to_string()),
        }
    }

    /// Reports a frame that could not be parsed as an envelope.
    pub fn on_invalid_frame(&self, connection_id: u64, reason: &str) -> Admission {
        self.core
            .reject_envelope(connection_id, SERVER_PUSH_REQUEST_ID, reason.to_owned())
    }

    /// Routes one outcome and delivers it on the calling thread.
    #[cfg(test)]
    pub fn handle_outcome(&self, job_id: Uuid) -> Result<OutcomeDelivery, DispatchError> {
        Ok(match self.core.route_outcome(job_id)? {
            RoutedOutcome::Ready(pending) => self.core.deliver(pending),
            RoutedOutcome::Settled(delivery) => delivery,
        })
    }

    pub fn start(&mut self) -> Result<(), DispatchError> {
        if self.listener.is_some() {
            return Err(DispatchError::AlreadyStarted);
        }

        self.listener_stop.store(false, Ordering::SeqCst);
        let (deliveries, pending) = mpsc::channel();
        let core = Arc::clone(&self.core);
        let delivery = thread::Builder::new()
            .name("outcome-delivery".to_owned())
            .spawn(move || core.deliver_until_closed(pending))
            .map_err(DispatchError::DeliverySpawn)?;
        self.delivery = Some(delivery);

        let core = Arc::clone(&self.core);
        let stop = Arc::clone(&self.listener_stop);
        let listener = thread::Builder::new()
            .name("outcome-listener".to_owned())
            .spawn(move || core.listen_for_outcomes(&stop, &deliveries))
            .map_err(DispatchError::ListenerSpawn)?;
        self.listener = Some(listener);

        for platform in self.core.platforms.worker_platforms() {
            let handler = self
                .handlers
                .get(platform)
                .cloned()
                .unwrap_or_else(|| Arc::new(UnavailablePlatform::new(platform)));
            let mut worker = Worker::new(
                platform,
                self.core.queue.clone(),
                Arc::clone(&self.core.session),
                Arc::clone(&self.core.storage),
                handler,
                self.core.logger.clone(),
                self.core.settings.worker,
            );
            worker.start()?;
            self.workers.push(worker);
        }

        self.core.logger.log(
            LogLevel::Info,
            Some("dispatcher::start"),
            "dispatcher started",
            Some(json!({
                "queue_namespace": self.core.queue.namespace(),
                "workers": self.core.platforms.worker_platforms(),
            })),
        );
        Ok(())
    }

    /// Stops the outcome listener, the delivery thread and every worker,
    /// returning once all have joined. Outcomes already routed are delivered first.
    pub fn shutdown(&mut self) -> Result<(), DispatchError> {
        self.listener_stop.store(true, Ordering::SeqCst);
        let mut first_error = None;

        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                first_error = Some(DispatchError::ListenerJoinFailed);
            }
        }
        // The listener owned the only sender, so the delivery thread drains and exits.
        if let Some(delivery) = self.delivery.take() {
            if delivery.join().is_err() {
                first_error.get_or_insert(DispatchError::DeliveryJoinFailed);
            }
        }
        for mut worker in self.workers.drain(..) {
            if let Err(error) = worker.stop() {
                self.core.logger.error(Some("dispatcher::shutdown"), &error.to_string());
                first_error.get_or_insert(DispatchError::Worker(error));
            }
        }

        self.core.logger.info(Some("dispatcher::shutdown"), "dispatcher stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.listener_stop.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        if let Some(delivery) = self.delivery.take() {
            let _ = delivery.join();
        }
    }
}

impl DispatcherCore {
    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnectionState>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_title(&self, connection_id: u64, message: &MessageEvent) -> String {
        match &message.id {
            Some(id) => format!("{connection_id}-{id}"),
            None => {
                let counter = self.title_counter.fetch_add(1, Ordering::SeqCst) + 1;
                format!("{connection_id}-{counter}")
            }
        }
    }

    fn reply_failure(&self, connection_id: u64, request_id: &str, document: Value, error: &str) {
        let event = OutboundEvent::failure_reply(request_id, failure_document(document, error));
        if let Err(delivery_error) = self.registry.send(connection_id, event) {
            self.logger.warn(
                Some("dispatcher::reply"),
                &format!("failure reply not delivered: {delivery_error}"),
            );
        }
    }

    fn reject_envelope(&self, connection_id: u64, request_id: &str, reason: String) -> Admission {
        self.logger.log(
            LogLevel::Warn,
            Some("dispatcher::envelope"),
            "rejected client envelope",
            Some(json!({"connection_id": connection_id, "request_id": request_id, "reason": reason})),
        );
        let event = OutboundEvent::failure_reply(request_id, json!({ "error": reason }));
        if let Err(delivery_error) = self.registry.send(connection_id, event) {
            self.logger.warn(
                Some("dispatcher::reply"),
                &format!("failure reply not delivered: {delivery_error}"),
            );
        }
        Admission::Rejected { reason }
    }

    fn handle_message(&self, connection_id: u64, request_id: &str, message: MessageEvent) {
        if !self.platforms.is_worker_platform(&message.platform) {
            let error = format!("platform '{}' is not served by this instance", message.platform);
            self.reply_failure(connection_id, request_id, message.document, &error);
            return;
        }

        let encrypted_payload = match self.session.payload_cipher().encrypt_json(&message.document) {
            Ok(sealed) => sealed,
            Err(error) => {
                self.logger.error(Some("dispatcher::message"), &error.to_string());
                self.reply_failure(connection_id, request_id, message.document, "unable to queue message");
                return;
            }
        };

        let title = self.next_title(connection_id, &message);
        let new_job = NewJob {
            title: title.clone(),
            owner_connection_id: connection_id,
            encrypted_payload,
        };
        match self.queue.enqueue(&message.platform, new_job) {
            Ok(job_id) => self.logger.log(
                LogLevel::Debug,
                Some("dispatcher::message"),
                "queued job",
                Some(json!({
                    "connection_id": connection_id,
                    "platform": message.platform,
                    "verb": message.verb,
                    "job_id": job_id.to_string(),
                    "title": title,
                })),
            ),
            Err(error) => {
                self.logger.error(
                    Some("dispatcher::message"),
                    &format!("enqueue failed for connection {connection_id}: {error}"),
                );
                self.reply_failure(connection_id, request_id, message.document, "unable to queue message");
            }
        }
    }

    fn handle_credentials(&self, connection_id: u64, request_id: &str, credentials: CredentialsEvent) {
        let store = self
            .lock_connections()
            .get(&connection_id)
            .map(|state| state.credentials.clone());
        let Some(store) = store else {
            self.logger.warn(
                Some("dispatcher::credentials"),
                &format!("credentials from unregistered connection {connection_id} ignored"),
            );
            return;
        };

        let actor = credentials.actor.address();
        if let Err(error) = store.save(&credentials.platform, actor, &credentials.document) {
            self.logger.log(
                LogLevel::Error,
                Some("dispatcher::credentials"),
                "credential store write failed",
                Some(json!({
                    "connection_id": connection_id,
                    "platform": credentials.platform,
                    "error": error.to_string(),
                })),
            );
            if self.settings.report_store_errors {
                self.reply_failure(connection_id, request_id, credentials.document, &error.to_string());
            }
            return;
        }

        self.logger.debug(
            Some("dispatcher::credentials"),
            &format!("stored credentials of connection {connection_id} for '{}'", credentials.platform),
        );
    }

    /// Takes the outcome, builds the owner's event and removes the job.
    /// The job record is removed whether or not the owner is still connected.
    fn route_outcome(&self, job_id: Uuid) -> Result<RoutedOutcome, DispatchError> {
        let Some(outcome) = self.queue.take_outcome(job_id)? else {
            return Ok(RoutedOutcome::Settled(OutcomeDelivery::AlreadyHandled));
        };

        let routed = match self.queue.get(job_id) {
            Ok(Some(job)) => self.prepare(&job, outcome),
            Ok(None) => RoutedOutcome::Settled(OutcomeDelivery::Dropped {
                connection_id: None,
                reason: "job record missing".to_owned(),
            }),
            Err(error) => RoutedOutcome::Settled(OutcomeDelivery::Dropped {
                connection_id: None,
                reason: error.to_string(),
            }),
        };

        let removal = self
            .queue
            .remove_with_retry(job_id, self.settings.removal_policy, &self.logger);
        if let RemovalOutcome::Exhausted { attempts, .. } = removal {
            self.logger.warn(
                Some("dispatcher::outcome"),
                &format!("job {job_id} left in queue after {attempts} removal attempts"),
            );
        }

        if let RoutedOutcome::Settled(delivery) = &routed {
            self.log_dropped(job_id, delivery);
        }
        Ok(routed)
    }

    fn prepare(&self, job: &Job, outcome: JobOutcome) -> RoutedOutcome {
        let owner = job.owner_connection_id;
        if !self.registry.is_live(owner) {
            return RoutedOutcome::Settled(OutcomeDelivery::Dropped {
                connection_id: Some(owner),
                reason: "connection is gone".to_owned(),
            });
        }

        let cipher = self.session.payload_cipher();
        let event = match outcome {
            JobOutcome::Completed { encrypted_result } => match cipher.decrypt_json(&encrypted_result) {
                Ok(result) => OutboundEvent::message_push(result),
                Err(error) => {
                    self.logger.warn(
                        Some("dispatcher::outcome"),
                        &format!("result of job {} not decryptable: {error}", job.id),
                    );
                    OutboundEvent::failure_push(failure_document(
                        self.original_message(job),
                        UNDECRYPTABLE_RESULT_ERROR,
                    ))
                }
            },
            JobOutcome::Failed { error } => {
                OutboundEvent::failure_push(failure_document(self.original_message(job), &error))
            }
        };

        RoutedOutcome::Ready(PendingDelivery {
            job_id: job.id,
            connection_id: owner,
            event,
        })
    }

    fn deliver(&self, pending: PendingDelivery) -> OutcomeDelivery {
        let PendingDelivery {
            job_id,
            connection_id,
            event,
        } = pending;

        let delivery = match self.registry.send(connection_id, event) {
            Ok(()) => {
                self.logger.verbose(
                    Some("dispatcher::outcome"),
                    &format!("outcome of job {job_id} delivered to connection {connection_id}"),
                );
                OutcomeDelivery::Delivered { connection_id }
            }
            Err(DeliveryError::NotConnected { .. }) => OutcomeDelivery::Dropped {
                connection_id: Some(connection_id),
                reason: "connection is gone".to_owned(),
            },
            Err(error) => OutcomeDelivery::Dropped {
                connection_id: Some(connection_id),
                reason: error.to_string(),
            },
        };
        self.log_dropped(job_id, &delivery);
        delivery
    }

    fn log_dropped(&self, job_id: Uuid, delivery: &OutcomeDelivery) {
        if let OutcomeDelivery::Dropped { connection_id, reason } = delivery {
            self.logger.log(
                LogLevel::Info,
                Some("dispatcher::outcome"),
                "outcome dropped",
                Some(json!({
                    "job_id": job_id.to_string(),
                    "connection_id": connection_id,
                    "reason": reason,
                })),
            );
        }
    }

    /// Original message of a job, or an empty document when it cannot be opened.
    fn original_message(&self, job: &Job) -> Value {
        match self.session.payload_cipher().decrypt_json(&job.encrypted_payload) {
            Ok(message) => message,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("dispatcher::outcome"),
                    "original message of job not decryptable; failure carries no original fields",
                    Some(json!({
                        "job_id": job.id.to_string(),
                        "error": error.to_string(),
                    })),
                );
                json!({})
            }
        }
    }

    fn route_and_forward(&self, job_id: Uuid, deliveries: &Sender<PendingDelivery>) {
        match self.route_outcome(job_id) {
            Ok(RoutedOutcome::Ready(pending)) => {
                if let Err(mpsc::SendError(pending)) = deliveries.send(pending) {
                    self.deliver(pending);
                }
            }
            Ok(RoutedOutcome::Settled(_)) => {}
            Err(error) => self.logger.error(
                Some("dispatcher::outcome"),
                &format!("outcome of job {job_id} not handled: {error}"),
            ),
        }
    }

    fn sweep_pending(&self, deliveries: &Sender<PendingDelivery>) {
        match self.queue.pending_outcomes() {
            Ok(job_ids) => job_ids
                .into_iter()
                .for_each(|job_id| self.route_and_forward(job_id, deliveries)),
            Err(error) => self.logger.error(
                Some("dispatcher::outcome"),
                &format!("pending outcome sweep failed: {error}"),
            ),
        }
    }

    /// Routing never writes to sockets, so a slow client only delays its own deliveries.
    fn listen_for_outcomes(&self, stop: &AtomicBool, deliveries: &Sender<PendingDelivery>) {
        let mut feed = self.queue.subscribe_outcomes();
        self.sweep_pending(deliveries);

        while !stop.load(Ordering::SeqCst) {
            match feed.next(LISTENER_TICK) {
                Some(job_id) => self.route_and_forward(job_id, deliveries),
                None => self.sweep_pending(deliveries),
            }
        }
    }

    fn deliver_until_closed(&self, pending: Receiver<PendingDelivery>) {
        for delivery in pending {
            self.deliver(delivery);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::connections::tests::RecordingRegistry;
    use crate::connections::OutboundEvent;
    use crate::credentials::CredentialStore;
    use crate::logging::tests::{capturing_logger, quiet_logger, MemorySink};
    use crate::platforms::{builtin_handler, EchoHandler, JobContext, PlatformHandler, PlatformRegistry};
    use crate::queue::{NewJob, RemovalPolicy};
    use crate::session::{test_session, SessionContext};
    use crate::storage::tests::{temp_storage, TempStorage};
    use crate::validation::{Admission, EventType, SchemaValidator, ValidationGateway};
    use crate::wire::envelope::{WireEnvelope, MESSAGE_EVENT_TYPE};
    use crate::worker::WorkerConfig;

    use super::{Dispatcher, DispatcherSettings, OutcomeDelivery, UNDECRYPTABLE_RESULT_ERROR};

    struct Harness {
        dispatcher: Dispatcher,
        registry: Arc<RecordingRegistry>,
        session: Arc<SessionContext>,
        log: Arc<MemorySink>,
        temp: TempStorage,
    }

    fn harness(label: &str, platforms: &[&str]) -> Harness {
        let temp = temp_storage(label);
        let session = Arc::new(test_session(label));
        let registry = Arc::new(RecordingRegistry::with_live(&[1, 2]));
        let platforms = PlatformRegistry::from_config(
            &platforms.iter().map(|name| (*name).to_owned()).collect::<Vec<_>>(),
        )
        .expect("platforms should be valid");
        let settings = DispatcherSettings {
            removal_policy: RemovalPolicy {
                max_attempts: 2,
                interval: Duration::from_millis(1),
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(5),
                error_backoff: Duration::from_millis(5),
            },
            report_store_errors: true,
        };
        let workers = platforms
            .worker_platforms()
            .into_iter()
            .map(builtin_handler)
            .collect::<Vec<_>>();
        let (logger, log) = capturing_logger();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&session),
            temp.facade.clone(),
            platforms,
            registry.clone(),
            ValidationGateway::new(Arc::new(SchemaValidator), quiet_logger()),
            settings,
            logger,
        );
        for handler in workers {
            assert!(dispatcher.register_handler(handler));
        }
        dispatcher.on_connected(1);
        dispatcher.on_connected(2);
        Harness {
            dispatcher,
            registry,
            session,
            log,
            temp,
        }
    }

    fn stored_key_count(harness: &Harness) -> usize {
        harness
            .temp
            .facade
            .purge_prefix(&harness.session.queue_namespace())
            .expect("purge should work")
    }

    #[test]
    fn valid_message_enqueues_one_job_owned_by_sender() {
        let harness = harness("dispatch-enqueue", &["dispatcher", "irc"]);
        let message = json!({"platform": "irc", "verb": "send", "id": "m1", "object": {"text": "hi"}});

        let admission = harness
            .dispatcher
            .on_event(2, "r1", EventType::Message, message.clone());
        assert_eq!(admission, Admission::Admitted);

        let queue = harness.dispatcher.queue();
        let job = queue
            .claim_next("irc")
            .expect("claim should work")
            .expect("one job expected");
        assert!(queue.claim_next("irc").expect("claim should work").is_none());
        assert_eq!(job.owner_connection_id, 2);
        assert_eq!(job.title, "2-m1");
        assert_eq!(
            harness
                .session
                .payload_cipher()
                .decrypt_json(&job.encrypted_payload)
                .expect("payload should decrypt"),
            message
        );
        assert!(harness.registry.sent().is_empty());
    }

    #[test]
    fn envelopes_are_routed_or_answered_with_a_failure_echoing_the_request_id() {
        let harness = harness("dispatch-envelope", &["dispatcher", "irc"]);

        let routed = WireEnvelope::from_json(
            MESSAGE_EVENT_TYPE,
            "r-ok",
            &json!({"platform": "irc", "verb": "send"}),
        );
        assert_eq!(harness.dispatcher.on_envelope(1, &routed), Admission::Admitted);
        assert!(harness
            .dispatcher
            .queue()
            .claim_next("irc")
            .expect("claim")
            .is_some());

        let unknown = WireEnvelope::from_json(42, "r-unknown", &json!({}));
        assert!(matches!(
            harness.dispatcher.on_envelope(1, &unknown),
            Admission::Rejected { .. }
        ));
        let anonymous = WireEnvelope::from_json(MESSAGE_EVENT_TYPE, "", &json!({}));
        assert!(matches!(
            harness.dispatcher.on_envelope(1, &anonymous),
            Admission::Rejected { .. }
        ));

        let sent = harness.registry.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            (
                1,
                OutboundEvent::failure_reply("r-unknown", json!({"error": "unsupported event type 42"}))
            )
        );
        assert_eq!(
            sent[1],
            (
                1,
                OutboundEvent::failure_reply("0", json!({"error": "request id must be non-empty"}))
            )
        );
    }

    #[test]
    fn titles_without_id_use_an_incrementing_counter() {
        let harness = harness("dispatch-titles", &["dispatcher", "irc"]);
        for _ in 0..2 {
            harness.dispatcher.on_event(
                1,
                "r",
                EventType::Message,
                json!({"platform": "irc", "verb": "send"}),
            );
        }

        let queue = harness.dispatcher.queue();
        let first = queue.claim_next("irc").expect("claim").expect("job");
        let second = queue.claim_next("irc").expect("claim").expect("job");
        assert_eq!(first.title, "1-1");
        assert_eq!(second.title, "1-2");
    }

    #[test]
    fn malformed_or_unserved_message_creates_no_job() {
        let harness = harness("dispatch-reject", &["dispatcher", "irc"]);

        let admission = harness.dispatcher.on_event(
            1,
            "bad-1",
            EventType::Message,
            json!({"platform": "irc"}),
        );
        assert!(matches!(admission, Admission::Rejected { .. }));

        harness.dispatcher.on_event(
            1,
            "bad-2",
            EventType::Message,
            json!({"platform": "xmpp", "verb": "send"}),
        );

        let sent = harness.registry.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            (
                1,
                OutboundEvent::failure_reply(
                    "bad-1",
                    json!({"platform": "irc", "error": "'verb' is required"})
                )
            )
        );
        assert_eq!(
            sent[1].1.payload()["error"],
            json!("platform 'xmpp' is not served by this instance")
        );
        assert_eq!(stored_key_count(&harness), 0);
    }

    #[test]
    fn failed_job_reaches_live_owner_with_original_fields() {
        let harness = harness("dispatch-failed", &["dispatcher", "irc"]);
        harness.dispatcher.on_event(
            1,
            "r",
            EventType::Message,
            json!({"platform": "irc", "verb": "join", "target": "#rust"}),
        );
        let queue = harness.dispatcher.queue();
        let job = queue.claim_next("irc").expect("claim").expect("job");
        queue.fail(job.id, "connection refused").expect("fail should work");

        assert_eq!(
            harness.dispatcher.handle_outcome(job.id).expect("outcome handled"),
            OutcomeDelivery::Delivered { connection_id: 1 }
        );
        assert_eq!(
            harness.registry.sent(),
            vec![(
                1,
                OutboundEvent::failure_push(json!({
                    "platform": "irc",
                    "verb": "join",
                    "target": "#rust",
                    "error": "connection refused"
                }))
            )]
        );
        assert!(queue.get(job.id).expect("get").is_none());
        assert_eq!(
            harness.dispatcher.handle_outcome(job.id).expect("second call"),
            OutcomeDelivery::AlreadyHandled
        );
        assert_eq!(harness.registry.sent().len(), 1);
    }

    #[test]
    fn completed_job_sends_decrypted_result_then_removes_job() {
        let harness = harness("dispatch-completed", &["dispatcher", "irc"]);
        harness.dispatcher.on_event(
            2,
            "r",
            EventType::Message,
            json!({"platform": "irc", "verb": "send"}),
        );
        let queue = harness.dispatcher.queue();
        let job = queue.claim_next("irc").expect("claim").expect("job");
        let sealed = harness
            .session
            .payload_cipher()
            .encrypt_json(&json!({"verb": "send", "object": {"delivered": true}}))
            .expect("encrypt should work");
        queue.complete(job.id, sealed).expect("complete should work");

        harness.dispatcher.handle_outcome(job.id).expect("outcome handled");
        assert_eq!(
            harness.registry.sent(),
            vec![(
                2,
                OutboundEvent::message_push(json!({"verb": "send", "object": {"delivered": true}}))
            )]
        );
        assert!(queue.get(job.id).expect("get").is_none());
    }

    #[test]
    fn undecryptable_result_becomes_failure() {
        let harness = harness("dispatch-garbled", &["dispatcher", "irc"]);
        harness.dispatcher.on_event(
            1,
            "r",
            EventType::Message,
            json!({"platform": "irc", "verb": "send"}),
        );
        let queue = harness.dispatcher.queue();
        let job = queue.claim_next("irc").expect("claim").expect("job");
        queue.complete(job.id, "garbage".to_owned()).expect("complete should work");

        harness.dispatcher.handle_outcome(job.id).expect("outcome handled");
        let sent = harness.registry.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.is_failure());
        assert_eq!(sent[0].1.payload()["error"], json!(UNDECRYPTABLE_RESULT_ERROR));
        assert_eq!(sent[0].1.payload()["verb"], json!("send"));
    }

    #[test]
    fn unreadable_original_message_is_logged_and_failure_still_sent() {
        let harness = harness("dispatch-lost-original", &["dispatcher", "irc"]);
        let queue = harness.dispatcher.queue();
        let job_id = queue
            .enqueue(
                "irc",
                NewJob {
                    title: "1-x".to_owned(),
                    owner_connection_id: 1,
                    encrypted_payload: "not-a-sealed-payload".to_owned(),
                },
            )
            .expect("enqueue should work");
        let job = queue.claim_next("irc").expect("claim").expect("job");
        assert_eq!(job.id, job_id);
        queue.fail(job_id, "refused").expect("fail should work");

        harness.dispatcher.handle_outcome(job_id).expect("outcome handled");
        assert_eq!(
            harness.registry.sent(),
            vec![(1, OutboundEvent::failure_push(json!({"error": "refused"})))]
        );
        let warnings = harness
            .log
            .lines()
            .into_iter()
            .filter(|line| line.contains("original message of job not decryptable"))
            .collect::<Vec<_>>();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains(&job_id.to_string()));
    }

    #[test]
    fn outcome_for_departed_connection_is_dropped_and_job_removed() {
        let harness = harness("dispatch-gone", &["dispatcher", "irc"]);
        harness.dispatcher.on_event(
            2,
            "r",
            EventType::Message,
            json!({"platform": "irc", "verb": "send"}),
        );
        harness.dispatcher.on_disconnected(2);
        harness.registry.disconnect(2);

        let queue = harness.dispatcher.queue();
        let job = queue.claim_next("irc").expect("claim").expect("job");
        queue.fail(job.id, "timeout").expect("fail should work");

        assert!(matches!(
            harness.dispatcher.handle_outcome(job.id).expect("outcome handled"),
            OutcomeDelivery::Dropped {
                connection_id: Some(2),
                ..
            }
        ));
        assert!(harness.registry.sent().is_empty());
        assert!(queue.get(job.id).expect("get").is_none());
        assert_eq!(harness.dispatcher.connection_count(), 1);
    }

    #[test]
    fn credentials_are_stored_for_the_sending_connection_only() {
        let harness = harness("dispatch-credentials", &["dispatcher", "irc"]);
        let document = json!({"platform": "irc", "actor": {"address": "bob"}, "object": {"password": "pw"}});
        harness
            .dispatcher
            .on_event(1, "c1", EventType::Credentials, document.clone());

        let own = CredentialStore::for_connection(&harness.session, harness.temp.facade.clone(), 1);
        let other = CredentialStore::for_connection(&harness.session, harness.temp.facade.clone(), 2);
        assert_eq!(own.load("irc", "bob").expect("load should work"), Some(document));
        assert!(other.load("irc", "bob").expect("load should work").is_none());
        assert!(harness.registry.sent().is_empty());
    }

    #[test]
    fn activity_objects_are_registered_by_id() {
        let harness = harness("dispatch-activity", &["dispatcher", "irc"]);
        harness.dispatcher.on_event(
            1,
            "a1",
            EventType::ActivityObject,
            json!({"id": "#rust", "name": "Rust channel"}),
        );
        assert_eq!(
            harness.dispatcher.activity_objects().get("#rust"),
            Some(json!({"id": "#rust", "name": "Rust channel"}))
        );
    }

    #[test]
    fn started_dispatcher_routes_echo_result_back_and_shuts_down() {
        let mut harness = harness("dispatch-e2e", &["dispatcher", "echo", "irc"]);
        harness.dispatcher.start().expect("dispatcher should start");
        assert!(harness.dispatcher.start().is_err());

        harness.dispatcher.on_event(
            1,
            "e1",
            EventType::Message,
            json!({"platform": "echo", "verb": "send", "object": {"text": "ping"}}),
        );
        harness.dispatcher.on_event(
            2,
            "e2",
            EventType::Message,
            json!({"platform": "irc", "verb": "send"}),
        );

        let sent = harness.registry.wait_for_sent(2, Duration::from_secs(10));
        harness.dispatcher.shutdown().expect("shutdown should join threads");

        assert_eq!(sent.len(), 2);
        let to_first = sent.iter().find(|(id, _)| *id == 1).expect("reply to connection 1");
        assert!(!to_first.1.is_failure());
        assert_eq!(to_first.1.payload()["object"]["text"], json!("ping"));
        assert_eq!(to_first.1.payload()["object"]["echo"], json!(true));

        let to_second = sent.iter().find(|(id, _)| *id == 2).expect("reply to connection 2");
        assert!(to_second.1.is_failure());
        assert_eq!(
            to_second.1.payload()["error"],
            json!("no handler available for platform 'irc'")
        );
        assert_eq!(stored_key_count(&harness), 0);
    }

    #[test]
    fn outcome_bursts_beyond_feed_capacity_reach_a_slow_reader() {
        let mut harness = harness("dispatch-burst", &["dispatcher", "echo"]);
        harness.registry.stall_next_send(Duration::from_millis(1500));
        harness.dispatcher.start().expect("dispatcher should start");

        let total = 1100;
        for index in 0..total {
            harness.dispatcher.on_event(
                1,
                "b",
                EventType::Message,
                json!({"platform": "echo", "verb": "send", "id": index.to_string()}),
            );
        }

        let sent = harness.registry.wait_for_sent(total, Duration::from_secs(60));
        harness.dispatcher.shutdown().expect("shutdown should join threads");

        assert_eq!(sent.len(), total);
        assert!(sent.iter().all(|(id, event)| *id == 1 && !event.is_failure()));
        assert_eq!(stored_key_count(&harness), 0);
    }

    #[test]
    fn unregistered_worker_platform_fails_every_job() {
        let temp = temp_storage("dispatch-unregistered");
        let session = Arc::new(test_session("dispatch-unregistered"));
        let registry = Arc::new(RecordingRegistry::with_live(&[1]));
        let platforms = PlatformRegistry::from_config(&["dispatcher".to_owned(), "echo".to_owned()])
            .expect("platforms should be valid");
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&session),
            temp.facade.clone(),
            platforms,
            registry.clone(),
            ValidationGateway::new(Arc::new(SchemaValidator), quiet_logger()),
            DispatcherSettings {
                removal_policy: RemovalPolicy {
                    max_attempts: 1,
                    interval: Duration::from_millis(1),
                },
                worker: WorkerConfig {
                    poll_interval: Duration::from_millis(5),
                    error_backoff: Duration::from_millis(5),
                },
                report_store_errors: false,
            },
            quiet_logger(),
        );
        dispatcher.on_connected(1);
        dispatcher.start().expect("dispatcher should start");
        dispatcher.on_event(1, "u1", EventType::Message, json!({"platform": "echo", "verb": "send"}));

        let sent = registry.wait_for_sent(1, Duration::from_secs(10));
        dispatcher.shutdown().expect("shutdown should join threads");

        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1.payload()["error"],
            json!("no handler available for platform 'echo'")
        );
    }

    struct CredentialEcho;

    impl PlatformHandler for CredentialEcho {
        fn platform(&self) -> &str {
            "irc"
        }

        fn handle(&self, context: &JobContext<'_>) -> Result<Value, String> {
            let actor = context.actor_address().ok_or("actor required")?;
            let stored = context
                .credentials(actor)
                .map_err(|error| error.to_string())?
                .ok_or("no credentials")?;
            Ok(json!({"nick": actor, "password": stored["object"]["password"]}))
        }
    }

    #[test]
    fn registered_handler_replaces_builtin_and_reads_owner_credentials() {
        let mut harness = harness("dispatch-handler", &["dispatcher", "irc"]);
        assert!(harness.dispatcher.register_handler(Arc::new(CredentialEcho)));
        assert!(!harness.dispatcher.register_handler(Arc::new(EchoHandler)));

        harness.dispatcher.on_event(
            1,
            "c1",
            EventType::Credentials,
            json!({"platform": "irc", "actor": "alice", "object": {"password": "s3cret"}}),
        );
        harness.dispatcher.start().expect("dispatcher should start");
        harness.dispatcher.on_event(
            1,
            "m1",
            EventType::Message,
            json!({"platform": "irc", "verb": "join", "actor": {"address": "alice"}}),
        );

        let sent = harness.registry.wait_for_sent(1, Duration::from_secs(10));
        harness.dispatcher.shutdown().expect("shutdown should join threads");

        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            (1, OutboundEvent::message_push(json!({"nick": "alice", "password": "s3cret"})))
        );
    }
}
