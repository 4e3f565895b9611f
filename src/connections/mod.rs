use std::fmt;

use serde_json::Value;

use crate::wire::codec::CodecError;
use crate::wire::envelope::{
    WireEnvelope, FAILURE_REPLY_TYPE, MESSAGE_REPLY_TYPE, SERVER_PUSH_REQUEST_ID,
};

/// Event sent from the gateway to one client connection.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundEvent {
    Message { request_id: String, payload: Value },
    Failure { request_id: String, payload: Value },
}

impl OutboundEvent {
    pub fn message_push(payload: Value) -> Self {
        Self::Message {
            request_id: SERVER_PUSH_REQUEST_ID.to_owned(),
            payload,
        }
    }

    pub fn failure_push(payload: Value) -> Self {
        Self::Failure {
            request_id: SERVER_PUSH_REQUEST_ID.to_owned(),
            payload,
        }
    }

    pub fn failure_reply(request_id: impl Into<String>, payload: Value) -> Self {
        Self::Failure {
            request_id: request_id.into(),
            payload,
        }
    }

    #[cfg(test)]
    pub fn payload(&self) -> &Value {
        match self {
            Self::Message { payload, .. } | Self::Failure { payload, .. } => payload,
        }
    }

    #[cfg(test)]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn into_envelope(self) -> WireEnvelope {
        match self {
            Self::Message {
                request_id,
                payload,
            } => WireEnvelope::from_json(MESSAGE_REPLY_TYPE, request_id, &payload),
            Self::Failure {
                request_id,
                payload,
            } => WireEnvelope::from_json(FAILURE_REPLY_TYPE, request_id, &payload),
        }
    }
}

#[derive(Debug)]
pub enum DeliveryError {
    NotConnected { connection_id: u64 },
    Encode(CodecError),
    Io {
        connection_id: u64,
        source: std::io::Error,
    },
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected { connection_id } => {
                write!(f, "connection {connection_id} is no longer connected")
            }
            Self::Encode(source) => write!(f, "failed to encode outbound event: {source}"),
            Self::Io {
                connection_id,
                source,
            } => write!(f, "failed to write to connection {connection_id}: {source}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Liveness and delivery for client connections; the transport is the only
/// authority on whether a connection is still there.
pub trait ConnectionRegistry: Send + Sync {
    fn is_live(&self, connection_id: u64) -> bool;
    fn send(&self, connection_id: u64, event: OutboundEvent) -> Result<(), DeliveryError>;
}
