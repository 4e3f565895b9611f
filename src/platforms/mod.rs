use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::DISPATCHER_ROLE;
use crate::credentials::{CredentialStore, CredentialStoreError};
use crate::queue::Job;

pub const ECHO_PLATFORM: &str = "echo";

#[derive(Debug, PartialEq, Eq)]
pub enum PlatformRegistryError {
    Empty,
    InvalidIdentifier { name: String },
    Duplicate { name: String },
}

impl fmt::Display for PlatformRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "host.platforms must list at least one entry"),
            Self::InvalidIdentifier { name } => write!(
                f,
                "platform identifier '{name}' is invalid; use lowercase letters, digits, '-' or '_'"
            ),
            Self::Duplicate { name } => write!(f, "platform '{name}' is listed more than once"),
        }
    }
}

impl std::error::Error for PlatformRegistryError {}

/// Ordered platforms served by this instance. `dispatcher` is a role, not a platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformRegistry {
    entries: Vec<String>,
}

impl PlatformRegistry {
    pub fn from_config(entries: &[String]) -> Result<Self, PlatformRegistryError> {
        if entries.is_empty() {
            return Err(PlatformRegistryError::Empty);
        }

        let mut seen = HashSet::new();
        for name in entries {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
            if !valid {
                return Err(PlatformRegistryError::InvalidIdentifier { name: name.clone() });
            }
            if !seen.insert(name.as_str()) {
                return Err(PlatformRegistryError::Duplicate { name: name.clone() });
            }
        }

        Ok(Self {
            entries: entries.to_vec(),
        })
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn has_dispatcher(&self) -> bool {
        self.entries.iter().any(|name| name == DISPATCHER_ROLE)
    }

    pub fn worker_platforms(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|name| *name != DISPATCHER_ROLE)
            .collect()
    }

    pub fn is_worker_platform(&self, name: &str) -> bool {
        name != DISPATCHER_ROLE && self.entries.iter().any(|entry| entry == name)
    }
}

/// Everything a handler may look at while executing one job.
pub struct JobContext<'a> {
    pub job: &'a Job,
    pub message: &'a Value,
    credentials: &'a CredentialStore,
}

impl<'a> JobContext<'a> {
    pub fn new(job: &'a Job, message: &'a Value, credentials: &'a CredentialStore) -> Self {
        Self {
            job,
            message,
            credentials,
        }
    }

    /// Credentials the owning connection stored for `actor_id` on this job's platform.
    pub fn credentials(&self, actor_id: &str) -> Result<Option<Value>, CredentialStoreError> {
        self.credentials.load(&self.job.platform, actor_id)
    }

    pub fn actor_address(&self) -> Option<&str> {
        match self.message.get("actor")? {
            Value::String(address) => Some(address),
            Value::Object(actor) => actor.get("address").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Platform-specific job execution. The returned value is sent back to the
/// client as-is; an `Err` becomes the job failure reason.
pub trait PlatformHandler: Send + Sync {
    fn platform(&self) -> &str;
    fn handle(&self, context: &JobContext<'_>) -> Result<Value, String>;
}

#[derive(Debug, Default)]
pub struct EchoHandler;

impl PlatformHandler for EchoHandler {
    fn platform(&self) -> &str {
        ECHO_PLATFORM
    }

    fn handle(&self, context: &JobContext<'_>) -> Result<Value, String> {
        let authenticated = match context.actor_address() {
            Some(actor) => context
                .credentials(actor)
                .map_err(|error| error.to_string())?
                .is_some(),
            None => false,
        };

        let mut reply = context.message.clone();
        let Some(document) = reply.as_object_mut() else {
            return Err("message is not an object".to_owned());
        };
        let object = document
            .entry("object")
            .or_insert_with(|| Value::Object(Map::new()));
        if !object.is_object() {
            *object = Value::Object(Map::new());
        }
        if let Some(object) = object.as_object_mut() {
            object.insert("echo".to_owned(), Value::Bool(true));
            object.insert("authenticated".to_owned(), Value::Bool(authenticated));
        }
        Ok(reply)
    }
}

/// Stands in for a configured platform that has no bundled handler.
#[derive(Debug)]
pub struct UnavailablePlatform {
    name: String,
}

impl UnavailablePlatform {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PlatformHandler for UnavailablePlatform {
    fn platform(&self) -> &str {
        &self.name
    }

    fn handle(&self, _context: &JobContext<'_>) -> Result<Value, String> {
        Err(format!("no handler available for platform '{}'", self.name))
    }
}

pub fn builtin_handler(platform: &str) -> Arc<dyn PlatformHandler> {
    match platform {
        ECHO_PLATFORM => Arc::new(EchoHandler),
        other => Arc::new(UnavailablePlatform::new(other)),
    }
}
