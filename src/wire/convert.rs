use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rmpv::Value as PackValue;
use serde_json::{Map, Number, Value as JsonValue};

#[derive(Debug, PartialEq)]
pub enum ConvertError {
    NonFiniteFloat,
    NonUtf8String,
    NonStringMapKey,
    ExtensionValue,
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFiniteFloat => write!(f, "NaN and infinite floats have no JSON form"),
            Self::NonUtf8String => write!(f, "string value is not valid UTF-8"),
            Self::NonStringMapKey => write!(f, "map keys must be UTF-8 strings"),
            Self::ExtensionValue => write!(f, "MessagePack extension values have no JSON form"),
        }
    }
}

impl std::error::Error for ConvertError {}

/// Binary values become base64 strings since JSON has no byte type.
pub fn msgpack_to_json(value: &PackValue) -> Result<JsonValue, ConvertError> {
    Ok(match value {
        PackValue::Nil => JsonValue::Null,
        PackValue::Boolean(flag) => JsonValue::Bool(*flag),
        PackValue::Integer(number) => match (number.as_i64(), number.as_u64()) {
            (Some(signed), _) => JsonValue::from(signed),
            (None, Some(unsigned)) => JsonValue::from(unsigned),
            (None, None) => JsonValue::Null,
        },
        PackValue::F32(float) => float_to_json(f64::from(*float))?,
        PackValue::F64(float) => float_to_json(*float)?,
        PackValue::String(text) => JsonValue::String(
            text.as_str()
                .ok_or(ConvertError::NonUtf8String)?
                .to_owned(),
        ),
        PackValue::Binary(bytes) => JsonValue::String(STANDARD.encode(bytes)),
        PackValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(msgpack_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        PackValue::Map(entries) => {
            let mut object = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let PackValue::String(key) = key else {
                    return Err(ConvertError::NonStringMapKey);
                };
                let key = key.as_str().ok_or(ConvertError::NonStringMapKey)?;
                object.insert(key.to_owned(), msgpack_to_json(value)?);
            }
            JsonValue::Object(object)
        }
        PackValue::Ext(_, _) => return Err(ConvertError::ExtensionValue),
    })
}

fn float_to_json(float: f64) -> Result<JsonValue, ConvertError> {
    Number::from_f64(float)
        .map(JsonValue::Number)
        .ok_or(ConvertError::NonFiniteFloat)
}

pub fn json_to_msgpack(value: &JsonValue) -> PackValue {
    match value {
        JsonValue::Null => PackValue::Nil,
        JsonValue::Bool(flag) => PackValue::Boolean(*flag),
        JsonValue::Number(number) => {
            if let Some(signed) = number.as_i64() {
                PackValue::from(signed)
            } else if let Some(unsigned) = number.as_u64() {
                PackValue::from(unsigned)
            } else {
                PackValue::F64(number.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(text) => PackValue::String(text.as_str().into()),
        JsonValue::Array(items) => PackValue::Array(items.iter().map(json_to_msgpack).collect()),
        JsonValue::Object(object) => PackValue::Map(
            object
                .iter()
                .map(|(key, value)| (PackValue::String(key.as_str().into()), json_to_msgpack(value)))
                .collect(),
        ),
    }
}
