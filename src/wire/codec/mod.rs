use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use rmpv::{Integer, Value};

pub const DEFAULT_MAX_ENVELOPE_SIZE_BYTES: usize = 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

pub type MessageEnvelope = BTreeMap<String, Value>;

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeMap,
    MapKeyMustBeUtf8String,
    ExtensionTypeNotAllowed,
    IntegerOutOfRange,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::ProtocolZeroLength => write!(f, "protocol error: frame length cannot be zero"),
            Self::ProtocolLengthTooLarge { length, limit } => {
                write!(f, "protocol error: frame length {length} exceeds max {limit}")
            }
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeMap => write!(f, "message envelope must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::ExtensionTypeNotAllowed => write!(f, "MessagePack extension values are not allowed"),
            Self::IntegerOutOfRange => write!(f, "integer value must fit in signed int64"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Length-prefixed MessagePack framing with a configurable envelope limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireCodec {
    max_envelope_size_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENVELOPE_SIZE_BYTES)
    }
}

impl WireCodec {
    pub fn new(max_envelope_size_bytes: usize) -> Self {
        Self {
            max_envelope_size_bytes,
        }
    }

    pub fn encode_frame(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(envelope)?;
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn encode_payload(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let mut map_pairs = Vec::with_capacity(envelope.len());
        for (key, value) in envelope {
            validate_value(value)?;
            map_pairs.push((Value::String(key.as_str().into()), value.clone()));
        }

        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &Value::Map(map_pairs))
            .map_err(CodecError::MessagePackEncode)?;

        if encoded.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_envelope_size_bytes,
            });
        }
        Ok(encoded)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if payload.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        let mut cursor = Cursor::new(payload);
        let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != payload.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        parse_envelope(value)
    }

    fn declared_length(&self, header: &[u8]) -> Result<usize, CodecError> {
        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if declared == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared > self.max_envelope_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared,
                limit: self.max_envelope_size_bytes,
            });
        }
        Ok(declared)
    }
}

/// Accumulates bytes read from a stream and yields complete envelopes.
#[derive(Debug)]
pub struct FrameBuffer {
    codec: WireCodec,
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(codec: WireCodec) -> Self {
        Self {
            codec,
            pending: Vec::new(),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns the next complete envelope, or `None` while a frame is still partial.
    ///
    /// A header error poisons the stream: the caller is expected to drop the
    /// connection since frame boundaries can no longer be trusted.
    pub fn next_envelope(&mut self) -> Result<Option<MessageEnvelope>, CodecError> {
        if self.pending.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared = self.codec.declared_length(&self.pending)?;
        let frame_len = FRAME_HEADER_SIZE_BYTES + declared;
        if self.pending.len() < frame_len {
            return Ok(None);
        }

        let frame = self.pending.drain(..frame_len).collect::<Vec<_>>();
        self.codec
            .decode_payload(&frame[FRAME_HEADER_SIZE_BYTES..])
            .map(Some)
    }
}

fn parse_envelope(value: Value) -> Result<MessageEnvelope, CodecError> {
    let Value::Map(entries) = value else {
        return Err(CodecError::EnvelopeMustBeMap);
    };

    let mut envelope = MessageEnvelope::new();
    for (key, value) in entries {
        let key = parse_key(&key)?;
        validate_value(&value)?;
        envelope.insert(key, value);
    }
    Ok(envelope)
}

fn parse_key(key: &Value) -> Result<String, CodecError> {
    match key {
        Value::String(text) => text
            .as_str()
            .map(str::to_owned)
            .ok_or(CodecError::MapKeyMustBeUtf8String),
        _ => Err(CodecError::MapKeyMustBeUtf8String),
    }
}

// Floats are accepted: activity payloads routinely carry them.
fn validate_value(value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Nil
        | Value::Boolean(_)
        | Value::String(_)
        | Value::Binary(_)
        | Value::F32(_)
        | Value::F64(_) => Ok(()),
        Value::Integer(number) => validate_integer(number),
        Value::Array(values) => values.iter().try_for_each(validate_value),
        Value::Map(entries) => entries.iter().try_for_each(|(key, value)| {
            parse_key(key)?;
            validate_value(value)
        }),
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn validate_integer(number: &Integer) -> Result<(), CodecError> {
    if number.as_i64().is_some() {
        return Ok(());
    }
    match number.as_u64() {
        Some(value) if value <= i64::MAX as u64 => Ok(()),
        _ => Err(CodecError::IntegerOutOfRange),
    }
}

#[cfg(test)]
mod tests {
    use rmpv::Value;

    use super::{CodecError, FrameBuffer, MessageEnvelope, WireCodec};

    fn sample_envelope() -> MessageEnvelope {
        let mut envelope = MessageEnvelope::new();
        envelope.insert("t".to_owned(), Value::Integer(2.into()));
        envelope.insert("rid".to_owned(), Value::String("r-1".into()));
        envelope.insert("ratio".to_owned(), Value::F64(0.5));
        envelope.insert(
            "items".to_owned(),
            Value::Array(vec![Value::Nil, Value::String("x".into())]),
        );
        envelope
    }

    #[test]
    fn frame_encode_decode_keeps_fields_including_floats() {
        let codec = WireCodec::default();
        let frame = codec.encode_frame(&sample_envelope()).expect("frame should encode");
        assert_eq!(
            u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize,
            frame.len() - 4
        );

        let decoded = codec.decode_payload(&frame[4..]).expect("payload should decode");
        assert_eq!(decoded, sample_envelope());
    }

    #[test]
    fn rejects_extension_values_and_oversized_integers() {
        let codec = WireCodec::default();
        let mut envelope = MessageEnvelope::new();
        envelope.insert("ext".to_owned(), Value::Ext(1, vec![1, 2, 3]));
        assert!(matches!(
            codec.encode_frame(&envelope),
            Err(CodecError::ExtensionTypeNotAllowed)
        ));

        let mut envelope = MessageEnvelope::new();
        envelope.insert("big".to_owned(), Value::Integer((i64::MAX as u64 + 1).into()));
        assert!(matches!(
            codec.encode_frame(&envelope),
            Err(CodecError::IntegerOutOfRange)
        ));
    }

    #[test]
    fn enforces_configured_size_limit_both_ways() {
        let codec = WireCodec::new(16);
        let mut envelope = MessageEnvelope::new();
        envelope.insert("blob".to_owned(), Value::Binary(vec![0x41; 64]));
        assert!(matches!(
            codec.encode_frame(&envelope),
            Err(CodecError::PayloadTooLarge { limit: 16, .. })
        ));

        let mut buffer = FrameBuffer::new(codec);
        buffer.extend(&17_u32.to_be_bytes());
        assert!(matches!(
            buffer.next_envelope(),
            Err(CodecError::ProtocolLengthTooLarge { length: 17, limit: 16 })
        ));
        let mut buffer = FrameBuffer::new(codec);
        buffer.extend(&[0, 0, 0, 0]);
        assert!(matches!(
            buffer.next_envelope(),
            Err(CodecError::ProtocolZeroLength)
        ));
        assert!(matches!(
            codec.decode_payload(&[0xc0; 17]),
            Err(CodecError::PayloadTooLarge { size: 17, limit: 16 })
        ));
    }

    #[test]
    fn rejects_non_string_keys_and_trailing_data() {
        let codec = WireCodec::default();
        let value = Value::Map(vec![(Value::Integer(1.into()), Value::String("x".into()))]);
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &value).expect("test payload should encode");
        assert!(matches!(
            codec.decode_payload(&payload),
            Err(CodecError::MapKeyMustBeUtf8String)
        ));

        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::Map(vec![])).expect("map should encode");
        rmpv::encode::write_value(&mut payload, &Value::Nil).expect("nil should encode");
        assert!(matches!(
            codec.decode_payload(&payload),
            Err(CodecError::TrailingDataInPayload)
        ));
    }

    #[test]
    fn frame_buffer_reassembles_split_and_coalesced_frames() {
        let codec = WireCodec::default();
        let frame = codec.encode_frame(&sample_envelope()).expect("frame should encode");
        let mut buffer = FrameBuffer::new(codec);

        buffer.extend(&frame[..3]);
        assert!(buffer.next_envelope().expect("partial header is fine").is_none());
        buffer.extend(&frame[3..frame.len() - 1]);
        assert!(buffer.next_envelope().expect("partial body is fine").is_none());

        buffer.extend(&frame[frame.len() - 1..]);
        buffer.extend(&frame);
        assert_eq!(
            buffer.next_envelope().expect("decode should work"),
            Some(sample_envelope())
        );
        assert_eq!(
            buffer.next_envelope().expect("decode should work"),
            Some(sample_envelope())
        );
        assert!(buffer.next_envelope().expect("empty buffer").is_none());
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn frame_buffer_rejects_oversized_header_before_body_arrives() {
        let mut buffer = FrameBuffer::new(WireCodec::new(8));
        buffer.extend(&100_u32.to_be_bytes());
        assert!(matches!(
            buffer.next_envelope(),
            Err(CodecError::ProtocolLengthTooLarge { length: 100, .. })
        ));
    }
}
