//! CloudEvents-shaped envelope carried by every publish.
//!
//! The broker never inspects `data`; it only requires the identifying
//! attributes and fills in defaults for the optional ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Subject used when a publisher leaves it out.
pub const DEFAULT_SUBJECT: &str = "*";

/// Content type forced onto every accepted event.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Spec version assumed when a publisher leaves it out.
pub const DEFAULT_SPEC_VERSION: &str = "1.0";

/// A CloudEvent as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Event identifier, unique per `source`.
    pub id: String,
    /// Producer of the event.
    pub source: String,
    /// Event type, e.g. `com.example.weather.updated`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Subject within the source.
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "datacontenttype", default = "default_content_type")]
    pub data_content_type: String,
    /// RFC 3339 timestamp as supplied by the producer.
    #[serde(default)]
    pub time: String,
    #[serde(rename = "specversion", default = "default_spec_version")]
    pub spec_version: String,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

fn default_subject() -> String {
    DEFAULT_SUBJECT.to_string()
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

fn default_spec_version() -> String {
    DEFAULT_SPEC_VERSION.to_string()
}

impl CloudEvent {
    /// Create an event with the required attributes and default optionals.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            subject: default_subject(),
            data: Value::Null,
            data_content_type: default_content_type(),
            time: String::new(),
            spec_version: default_spec_version(),
            meta: Value::Null,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set the subject.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the timestamp.
    #[must_use]
    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = time.into();
        self
    }

    /// Key used to recognise the same event arriving twice.
    #[must_use]
    pub fn dedupe_key(&self) -> String {
        format!("{}/{}", self.source, self.id)
    }

    /// Check required attributes and normalise the optional ones.
    ///
    /// An empty subject becomes `"*"` and the content type is always
    /// `application/json`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Invalid` if `id`, `source` or `type` is empty.
    pub fn normalize(&mut self) -> Result<(), ProtocolError> {
        if self.id.is_empty() {
            return Err(ProtocolError::Invalid("event id is required".into()));
        }
        if self.source.is_empty() {
            return Err(ProtocolError::Invalid("event source is required".into()));
        }
        if self.event_type.is_empty() {
            return Err(ProtocolError::Invalid("event type is required".into()));
        }
        if self.subject.is_empty() {
            self.subject = default_subject();
        }
        if self.spec_version.is_empty() {
            self.spec_version = default_spec_version();
        }
        self.data_content_type = default_content_type();
        Ok(())
    }
}
