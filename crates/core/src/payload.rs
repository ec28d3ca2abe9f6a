//! Opaque job payloads.
//!
//! The engine passes payloads to handlers verbatim. Only handlers decode them
//! into their own typed structures.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

/// Structured job input, stored as a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPayload(JsonValue);

impl JobPayload {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    /// An empty object payload.
    pub fn empty() -> Self {
        Self(JsonValue::Object(Default::default()))
    }

    /// Serialize a typed payload.
    pub fn from_serializable<T: Serialize>(value: &T) -> DomainResult<Self> {
        serde_json::to_value(value)
            .map(Self)
            .map_err(|e| DomainError::validation(format!("payload serialization failed: {e}")))
    }

    /// Decode the payload into the handler's own input type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        self.0
    }
}

impl Default for JobPayload {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<JsonValue> for JobPayload {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}
