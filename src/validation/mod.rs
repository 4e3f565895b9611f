use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::connections::{ConnectionRegistry, OutboundEvent};
use crate::logging::{LogLevel, Logger};
use crate::wire::envelope::{
    ACTIVITY_OBJECT_EVENT_TYPE, CREDENTIALS_EVENT_TYPE, MESSAGE_EVENT_TYPE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Credentials,
    Message,
    ActivityObject,
}

impl EventType {
    pub fn from_wire_code(code: i64) -> Option<Self> {
        match code {
            CREDENTIALS_EVENT_TYPE => Some(Self::Credentials),
            MESSAGE_EVENT_TYPE => Some(Self::Message),
            ACTIVITY_OBJECT_EVENT_TYPE => Some(Self::ActivityObject),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn wire_code(self) -> i64 {
        match self {
            Self::Credentials => CREDENTIALS_EVENT_TYPE,
            Self::Message => MESSAGE_EVENT_TYPE,
            Self::ActivityObject => ACTIVITY_OBJECT_EVENT_TYPE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credentials => "credentials",
            Self::Message => "message",
            Self::ActivityObject => "activity-object",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ActorRef {
    Address(String),
    Object { address: String },
}

impl ActorRef {
    pub fn address(&self) -> &str {
        match self {
            Self::Address(address) | Self::Object { address } => address,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Text(String),
    Number(i64),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CredentialsEvent {
    pub platform: String,
    pub actor: ActorRef,
    pub document: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageEvent {
    pub platform: String,
    pub verb: String,
    pub id: Option<MessageId>,
    pub document: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActivityObjectEvent {
    pub id: String,
    pub document: Value,
}

/// Inbound client event after validation. `document` keeps the full payload.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Credentials(CredentialsEvent),
    Message(MessageEvent),
    ActivityObject(ActivityObjectEvent),
}

#[derive(Deserialize)]
struct CredentialsHeader {
    platform: String,
    actor: ActorRef,
}

#[derive(Deserialize)]
struct MessageHeader {
    platform: String,
    verb: String,
    #[serde(default)]
    id: Option<MessageId>,
}

#[derive(Deserialize)]
struct ActivityObjectHeader {
    id: String,
}

impl ClientEvent {
    pub fn from_payload(event_type: EventType, document: Value) -> Result<Self, String> {
        let describe = |error: serde_json::Error| format!("{event_type} payload rejected: {error}");
        Ok(match event_type {
            EventType::Credentials => {
                let header: CredentialsHeader =
                    serde_json::from_value(document.clone()).map_err(describe)?;
                Self::Credentials(CredentialsEvent {
                    platform: header.platform,
                    actor: header.actor,
                    document,
                })
            }
            EventType::Message => {
                let header: MessageHeader =
                    serde_json::from_value(document.clone()).map_err(describe)?;
                Self::Message(MessageEvent {
                    platform: header.platform,
                    verb: header.verb,
                    id: header.id,
                    document,
                })
            }
            EventType::ActivityObject => {
                let header: ActivityObjectHeader =
                    serde_json::from_value(document.clone()).map_err(describe)?;
                Self::ActivityObject(ActivityObjectEvent {
                    id: header.id,
                    document,
                })
            }
        })
    }
}

/// Pass/fail contract for inbound payloads; the error is shown to the client.
pub trait Validator: Send + Sync {
    fn validate(&self, event_type: EventType, payload: &Value) -> Result<(), String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, event_type: EventType, payload: &Value) -> Result<(), String> {
        let Some(object) = payload.as_object() else {
            return Err(format!("{event_type} payload must be an object"));
        };

        match event_type {
            EventType::Credentials => {
                require_text(object, "platform")?;
                require_actor(object, "actor", true)?;
                optional_object(object, "object")
            }
            EventType::Message => {
                require_text(object, "platform")?;
                require_text(object, "verb")?;
                require_actor(object, "actor", false)?;
                optional_object(object, "object")?;
                match object.get("id") {
                    None | Some(Value::String(_)) => Ok(()),
                    Some(Value::Number(number)) if number.is_i64() => Ok(()),
                    Some(_) => Err("'id' must be a string or an integer".to_owned()),
                }
            }
            EventType::ActivityObject => require_text(object, "id"),
        }
    }
}

fn require_text(object: &Map<String, Value>, field: &str) -> Result<(), String> {
    match object.get(field) {
        Some(Value::String(text)) if !text.is_empty() => Ok(()),
        Some(Value::String(_)) => Err(format!("'{field}' must not be empty")),
        Some(_) => Err(format!("'{field}' must be a string")),
        None => Err(format!("'{field}' is required")),
    }
}

fn require_actor(object: &Map<String, Value>, field: &str, required: bool) -> Result<(), String> {
    match object.get(field) {
        None if !required => Ok(()),
        None => Err(format!("'{field}' is required")),
        Some(Value::String(text)) if !text.is_empty() => Ok(()),
        Some(Value::Object(actor)) => require_text(actor, "address")
            .map_err(|reason| format!("'{field}.address' invalid: {reason}")),
        Some(_) => Err(format!(
            "'{field}' must be a non-empty string or an object with an address"
        )),
    }
}

fn optional_object(object: &Map<String, Value>, field: &str) -> Result<(), String> {
    match object.get(field) {
        None | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(format!("'{field}' must be an object")),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { reason: String },
}

/// Runs every inbound event through the validator before any handler sees it.
#[derive(Clone)]
pub struct ValidationGateway {
    validator: Arc<dyn Validator>,
    logger: Logger,
}

impl ValidationGateway {
    pub fn new(validator: Arc<dyn Validator>, logger: Logger) -> Self {
        Self { validator, logger }
    }

    pub fn guard(&self, event_type: EventType) -> EventGuard<'_> {
        EventGuard {
            gateway: self,
            event_type,
        }
    }
}

pub struct EventGuard<'a> {
    gateway: &'a ValidationGateway,
    event_type: EventType,
}

impl EventGuard<'_> {
    /// Invokes `handler` only for a valid payload; otherwise answers the
    /// connection with a `failure` event echoing the payload and `error`.
    pub fn admit(
        &self,
        connection_id: u64,
        request_id: &str,
        payload: Value,
        registry: &dyn ConnectionRegistry,
        handler: impl FnOnce(ClientEvent),
    ) -> Admission {
        let verdict = self
            .gateway
            .validator
            .validate(self.event_type, &payload)
            .and_then(|()| ClientEvent::from_payload(self.event_type, payload.clone()));

        match verdict {
            Ok(event) => {
                handler(event);
                Admission::Admitted
            }
            Err(reason) => {
                self.gateway.logger.log(
                    LogLevel::Debug,
                    Some("validation::guard"),
                    "rejected inbound event",
                    Some(json!({
                        "connection_id": connection_id,
                        "event_type": self.event_type.as_str(),
                        "error": reason,
                    })),
                );
                let reply = failure_document(payload, &reason);
                if let Err(error) =
                    registry.send(connection_id, OutboundEvent::failure_reply(request_id, reply))
                {
                    self.gateway.logger.warn(
                        Some("validation::guard"),
                        &format!("could not deliver validation failure: {error}"),
                    );
                }
                Admission::Rejected { reason }
            }
        }
    }
}

/// The payload itself when it is an object, otherwise `{}`, with `error` set.
pub fn failure_document(payload: Value, error: &str) -> Value {
    let mut document = match payload {
        Value::Object(object) => object,
        _ => Map::new(),
    };
    document.insert("error".to_owned(), Value::String(error.to_owned()));
    Value::Object(document)
}
