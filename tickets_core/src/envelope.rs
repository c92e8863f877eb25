//! This module defines the `Envelope` that wraps every message moving through the outbox and the
//! broker, together with its `EnvelopeBuilder` and the well-known metadata keys.

use crate::message::MessageData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata carried next to the payload.
pub type Metadata = HashMap<String, String>;

/// Metadata key holding the event or command name.
pub const NAME_KEY: &str = "name";
/// Metadata key holding the correlation id.
pub const CORRELATION_ID_KEY: &str = "correlation_id";
/// Metadata key holding the W3C `traceparent`.
pub const TRACEPARENT_KEY: &str = "traceparent";
/// Metadata key holding the W3C `tracestate`.
pub const TRACESTATE_KEY: &str = "tracestate";

/// A message as it travels through the outbox and the broker.
///
/// The `id` is assigned once and survives every redelivery, which is what downstream
/// consumers key their idempotency on. An envelope is never mutated after `build()`; derived
/// messages go through [`Envelope::into_builder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    published_at: DateTime<Utc>,
    payload: Vec<u8>,
    metadata: Metadata,
}

impl Envelope {
    /// Creates a new `EnvelopeBuilder`.
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new()
    }

    /// Encodes a typed message and names it after its variant.
    pub fn from_message<M: MessageData>(message: &M) -> Result<EnvelopeBuilder, serde_json::Error> {
        Ok(EnvelopeBuilder::new()
            .payload(message.encode()?)
            .metadata(NAME_KEY, message.message_name()))
    }

    /// Converts `self` into a builder, keeping every field.
    pub fn into_builder(self) -> EnvelopeBuilder {
        EnvelopeBuilder {
            id: Some(self.id),
            published_at: Some(self.published_at),
            payload: Some(self.payload),
            metadata: self.metadata,
        }
    }

    /// The message id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the message was first published.
    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// The raw payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// All metadata entries.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// A single metadata entry. Empty values count as absent.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// The event or command name, if the publisher set one.
    pub fn event_name(&self) -> Option<&str> {
        self.metadata_value(NAME_KEY)
    }

    /// The correlation id, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata_value(CORRELATION_ID_KEY)
    }

    /// Fills in metadata entries that are absent or empty, consuming `self`.
    pub(crate) fn with_default_metadata(mut self, defaults: Metadata) -> Self {
        for (key, value) in defaults {
            if value.is_empty() {
                continue;
            }
            let entry = self.metadata.entry(key).or_default();
            if entry.is_empty() {
                *entry = value;
            }
        }
        self
    }

    /// The payload as lossy UTF-8, used when logging payloads that failed to decode.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Builder for `Envelope`
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    id: Option<Uuid>,
    published_at: Option<DateTime<Utc>>,
    payload: Option<Vec<u8>>,
    metadata: Metadata,
}

impl EnvelopeBuilder {
    /// Creates a new `EnvelopeBuilder` with no fields set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the message id. A fresh v4 id is generated otherwise.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the publication time. Defaults to now.
    pub fn published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    /// Sets the raw payload.
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets a metadata entry, replacing any previous value.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets a metadata entry only when the key is absent or empty.
    pub fn metadata_if_absent(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let entry = self.metadata.entry(key.into()).or_default();
        if entry.is_empty() {
            *entry = value.into();
        }
        self
    }

    /// Merges a whole map, keeping the values already set on the builder.
    pub fn merge_metadata(mut self, metadata: Metadata) -> Self {
        for (key, value) in metadata {
            self.metadata.entry(key).or_insert(value);
        }
        self
    }

    /// Builds the envelope.
    pub fn build(self) -> Result<Envelope, EnvelopeBuilderError> {
        Ok(Envelope {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            published_at: self.published_at.unwrap_or_else(Utc::now),
            payload: self.payload.ok_or(EnvelopeBuilderError::PayloadMissing)?,
            metadata: self.metadata,
        })
    }
}

/// Errors when building an envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeBuilderError {
    /// The payload was never set
    #[error("Payload is required")]
    PayloadMissing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_payload() {
        let result = Envelope::builder().metadata(NAME_KEY, "BookingMade_v1").build();
        assert!(matches!(result, Err(EnvelopeBuilderError::PayloadMissing)));
    }

    #[test]
    fn build_assigns_id_and_timestamp() {
        let before = Utc::now();
        let envelope = Envelope::builder().payload("{}").build().unwrap();
        assert!(!envelope.id().is_nil());
        assert!(envelope.published_at() >= before);
    }

    #[test]
    fn into_builder_keeps_identity() {
        let envelope = Envelope::builder()
            .payload("{}")
            .metadata(CORRELATION_ID_KEY, "abc")
            .build()
            .unwrap();
        let copy = envelope.clone().into_builder().build().unwrap();
        assert_eq!(copy, envelope);
    }

    #[test]
    fn empty_metadata_counts_as_absent() {
        let envelope = Envelope::builder()
            .payload("{}")
            .metadata(NAME_KEY, "")
            .build()
            .unwrap();
        assert_eq!(envelope.event_name(), None);
    }

    #[test]
    fn metadata_if_absent_does_not_overwrite() {
        let envelope = Envelope::builder()
            .payload("{}")
            .metadata(CORRELATION_ID_KEY, "first")
            .metadata_if_absent(CORRELATION_ID_KEY, "second")
            .metadata_if_absent(TRACEPARENT_KEY, "00-abc")
            .build()
            .unwrap();
        assert_eq!(envelope.correlation_id(), Some("first"));
        assert_eq!(envelope.metadata_value(TRACEPARENT_KEY), Some("00-abc"));
    }
}
