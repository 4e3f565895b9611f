use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::wire::codec::MessageEnvelope;
use crate::wire::convert::{json_to_msgpack, msgpack_to_json, ConvertError};

pub const PROTOCOL_VERSION: i64 = 1;
pub const SERVER_PUSH_REQUEST_ID: &str = "0";

pub const CREDENTIALS_EVENT_TYPE: i64 = 1;
pub const MESSAGE_EVENT_TYPE: i64 = 2;
pub const ACTIVITY_OBJECT_EVENT_TYPE: i64 = 3;
pub const MESSAGE_REPLY_TYPE: i64 = 101;
pub const FAILURE_REPLY_TYPE: i64 = 102;

pub type PayloadMap = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct WireEnvelope {
    pub version: i64,
    pub message_type: i64,
    pub request_id: String,
    pub payload: PayloadMap,
}

#[derive(Debug, PartialEq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    InvalidProtocolVersion { expected: i64, actual: i64 },
    IntegerOutOfRange { field: &'static str },
    PayloadMapKeyMustBeUtf8String,
    PayloadNotConvertible(ConvertError),
    RequestIdRequired,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::InvalidProtocolVersion { expected, actual } => {
                write!(f, "invalid protocol version {actual}, expected {expected}")
            }
            Self::IntegerOutOfRange { field } => {
                write!(f, "integer field '{field}' must fit signed int64")
            }
            Self::PayloadMapKeyMustBeUtf8String => {
                write!(f, "payload map keys must be UTF-8 strings")
            }
            Self::PayloadNotConvertible(source) => write!(f, "payload has no JSON form: {source}"),
            Self::RequestIdRequired => write!(f, "request id must be non-empty"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl WireEnvelope {
    pub fn new(message_type: i64, request_id: impl Into<String>, payload: PayloadMap) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            request_id: request_id.into(),
            payload,
        }
    }

    /// Builds an envelope whose payload is a JSON object; non-object documents land under `data`.
    pub fn from_json(message_type: i64, request_id: impl Into<String>, document: &serde_json::Value) -> Self {
        let payload = match json_to_msgpack(document) {
            Value::Map(entries) => entries
                .into_iter()
                .filter_map(|(key, value)| key.as_str().map(|key| (key.to_owned(), value)))
                .collect(),
            other => PayloadMap::from([("data".to_owned(), other)]),
        };
        Self::new(message_type, request_id, payload)
    }

    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        let version = parse_i64(raw.get("v"), "v")?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::InvalidProtocolVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        Ok(Self {
            version,
            message_type: parse_i64(raw.get("t"), "t")?,
            request_id: parse_string(raw.get("rid"), "rid")?,
            payload: parse_payload_map(raw.get("p"))?,
        })
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert("v".to_owned(), Value::Integer(self.version.into()));
        raw.insert("t".to_owned(), Value::Integer(self.message_type.into()));
        raw.insert("rid".to_owned(), Value::String(self.request_id.into()));

        let payload_map = self
            .payload
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect::<Vec<_>>();
        raw.insert("p".to_owned(), Value::Map(payload_map));
        raw
    }

    pub fn validate_client_to_server(&self) -> Result<(), EnvelopeError> {
        if self.request_id.is_empty() {
            return Err(EnvelopeError::RequestIdRequired);
        }
        Ok(())
    }

    pub fn payload_json(&self) -> Result<serde_json::Value, EnvelopeError> {
        let entries = self
            .payload
            .iter()
            .map(|(key, value)| (Value::String(key.as_str().into()), value.clone()))
            .collect();
        msgpack_to_json(&Value::Map(entries)).map_err(EnvelopeError::PayloadNotConvertible)
    }
}

fn parse_i64(value: Option<&Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::Integer(integer) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "int",
        });
    };

    if let Some(v) = integer.as_i64() {
        return Ok(v);
    }
    match integer.as_u64() {
        Some(v) if v <= i64::MAX as u64 => Ok(v as i64),
        _ => Err(EnvelopeError::IntegerOutOfRange { field }),
    }
}

fn parse_string(value: Option<&Value>, field: &'static str) -> Result<String, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    match value {
        Value::String(text) => text.as_str().map(str::to_owned).ok_or(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        }),
        _ => Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        }),
    }
}

fn parse_payload_map(value: Option<&Value>) -> Result<PayloadMap, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field: "p" })?;
    let Value::Map(entries) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field: "p",
            expected: "map",
        });
    };

    let mut payload = PayloadMap::new();
    for (key, value) in entries {
        let Some(text) = key.as_str() else {
            return Err(EnvelopeError::PayloadMapKeyMustBeUtf8String);
        };
        payload.insert(text.to_owned(), value.clone());
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use rmpv::Value;
    use serde_json::json;

    use super::{
        EnvelopeError, PayloadMap, WireEnvelope, FAILURE_REPLY_TYPE, MESSAGE_EVENT_TYPE,
        PROTOCOL_VERSION, SERVER_PUSH_REQUEST_ID,
    };

    fn valid_raw() -> crate::wire::codec::MessageEnvelope {
        let mut raw = crate::wire::codec::MessageEnvelope::new();
        raw.insert("v".to_owned(), Value::Integer(PROTOCOL_VERSION.into()));
        raw.insert("t".to_owned(), Value::Integer(MESSAGE_EVENT_TYPE.into()));
        raw.insert("rid".to_owned(), Value::String("abc-123".into()));
        raw.insert(
            "p".to_owned(),
            Value::Map(vec![(Value::String("platform".into()), Value::String("irc".into()))]),
        );
        raw
    }

    #[test]
    fn parses_valid_envelope_and_ignores_unknown_fields() {
        let mut raw = valid_raw();
        raw.insert("unknown".to_owned(), Value::String("ignored".into()));

        let envelope = WireEnvelope::from_raw(&raw).expect("envelope should parse");
        assert_eq!(envelope.message_type, MESSAGE_EVENT_TYPE);
        assert_eq!(envelope.request_id, "abc-123");
        assert_eq!(
            envelope.payload_json().expect("payload converts"),
            json!({"platform": "irc"})
        );
    }

    #[test]
    fn rejects_wrong_version_missing_rid_and_non_map_payload() {
        let mut raw = valid_raw();
        raw.insert("v".to_owned(), Value::Integer(2.into()));
        assert!(matches!(
            WireEnvelope::from_raw(&raw),
            Err(EnvelopeError::InvalidProtocolVersion { expected: 1, actual: 2 })
        ));

        let mut raw = valid_raw();
        raw.remove("rid");
        assert_eq!(
            WireEnvelope::from_raw(&raw),
            Err(EnvelopeError::MissingField { field: "rid" })
        );

        let mut raw = valid_raw();
        raw.insert("p".to_owned(), Value::Array(vec![]));
        assert!(matches!(
            WireEnvelope::from_raw(&raw),
            Err(EnvelopeError::InvalidFieldType { field: "p", .. })
        ));
    }

    #[test]
    fn client_to_server_requires_non_empty_rid() {
        let envelope = WireEnvelope::new(MESSAGE_EVENT_TYPE, "", PayloadMap::new());
        assert_eq!(
            envelope.validate_client_to_server(),
            Err(EnvelopeError::RequestIdRequired)
        );
    }

    #[test]
    fn json_reply_round_trips_through_raw_form() {
        let reply = WireEnvelope::from_json(
            FAILURE_REPLY_TYPE,
            SERVER_PUSH_REQUEST_ID,
            &json!({"platform": "irc", "error": "connection refused"}),
        );
        let decoded = WireEnvelope::from_raw(&reply.clone().into_raw()).expect("decode should work");

        assert_eq!(decoded, reply);
        assert_eq!(decoded.request_id, "0");
        assert_eq!(
            decoded.payload_json().expect("payload converts"),
            json!({"platform": "irc", "error": "connection refused"})
        );
    }

    #[test]
    fn non_object_json_is_wrapped() {
        let reply = WireEnvelope::from_json(FAILURE_REPLY_TYPE, "r", &json!("plain"));
        assert_eq!(reply.payload.get("data"), Some(&Value::String("plain".into())));
    }
}
