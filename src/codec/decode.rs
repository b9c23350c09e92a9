#![forbid(unsafe_code)]

use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;
use thiserror::Error;

/// Reserved key carrying the delivery topic inside structured content.
pub const TOPIC_KEY: &str = "topic";

/// Decoded message body handed to actions.
///
/// Structured payloads keep their JSON shape. Scalars (numbers, booleans,
/// `null`) pass through as JSON scalars, and text that is not JSON at all
/// (plain log lines, bare timestamps) is carried as a string value.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedContent(JsonValue);

impl DecodedContent {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn is_structured(&self) -> bool {
        self.0.is_object()
    }

    pub fn as_object(&self) -> Option<&JsonMap<String, JsonValue>> {
        self.0.as_object()
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        self.0
    }

    /// Topic stored in the content, if any.
    pub fn topic(&self) -> Option<&str> {
        self.0.get(TOPIC_KEY).and_then(JsonValue::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }
}

impl fmt::Display for DecodedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<JsonValue> for DecodedContent {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8 at byte {valid_up_to} ({len} bytes total)")]
    InvalidUtf8 { valid_up_to: usize, len: usize },
}

/// Decodes a raw payload.
///
/// Strict JSON is attempted first; text that does not parse is returned
/// unchanged as a string. Only bytes that are not UTF-8 fail.
///
/// `NaN`, `Infinity` and `-Infinity` are not JSON and a JSON value cannot
/// hold them, so such payloads (bare or nested) arrive as text.
pub fn decode(payload: &[u8]) -> Result<DecodedContent, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|err| DecodeError::InvalidUtf8 {
        valid_up_to: err.valid_up_to(),
        len: payload.len(),
    })?;

    match serde_json::from_str::<JsonValue>(text) {
        Ok(value) => Ok(DecodedContent(value)),
        Err(_) => Ok(DecodedContent(JsonValue::String(text.to_string()))),
    }
}

/// Records the delivery topic on structured content.
///
/// Content that passed schema validation keeps any `topic` it already
/// carries; unvalidated content always receives the delivery topic.
/// Scalars and strings are left untouched.
pub fn attach_topic(content: &mut DecodedContent, topic: &str, validated: bool) {
    let Some(map) = content.0.as_object_mut() else {
        return;
    };

    if validated {
        map.entry(TOPIC_KEY.to_string())
            .or_insert_with(|| JsonValue::String(topic.to_string()));
    } else {
        map.insert(TOPIC_KEY.to_string(), JsonValue::String(topic.to_string()));
    }
}
