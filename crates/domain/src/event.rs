//! Domain event — an immutable, typed record of something that happened.
//!
//! Events are built once through [`DomainEvent::create`] (or the
//! [`DomainEvent::new`] shorthand) and never mutated afterwards: fields are
//! private, there are no setters, and every "change" is a derivation that
//! returns a new value.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ValidationError, ValidationIssue};
use crate::id::new_event_id;
use crate::time::{Timestamp, now};

/// Source recorded when the producer does not name itself.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Schema version recorded when the producer does not specify one.
pub const DEFAULT_VERSION: u32 = 1;

/// Routing and tracing metadata attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
    version: u32,
}

impl EventMetadata {
    pub(crate) fn from_parts(
        source: String,
        correlation_id: Option<String>,
        causation_id: Option<String>,
        version: u32,
    ) -> Self {
        Self {
            source,
            correlation_id,
            causation_id,
            version,
        }
    }

    /// Name of the component that produced the event.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    #[must_use]
    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    /// Payload schema version, always `>= 1`.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Metadata supplied by a producer. Missing fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataInput {
    pub source: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub version: Option<u32>,
}

/// Everything a producer may specify when creating an event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDomainEvent<P> {
    pub event_type: String,
    pub payload: P,
    pub id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub metadata: MetadataInput,
}

impl<P> NewDomainEvent<P> {
    /// Start a draft with only the required fields.
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            id: None,
            timestamp: None,
            metadata: MetadataInput::default(),
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.metadata.causation_id = Some(causation_id.into());
        self
    }

    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.metadata.version = Some(version);
        self
    }
}

/// An immutable domain event carrying an opaque payload.
///
/// The payload defaults to [`serde_json::Value`]; buses treat it as opaque and
/// only ever look at `type` and the metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent<P = Value> {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    timestamp: Timestamp,
    payload: P,
    metadata: EventMetadata,
}

impl<P> DomainEvent<P> {
    /// Create an event from a draft, filling every missing default.
    ///
    /// A supplied `version` of `0` is raised to [`DEFAULT_VERSION`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the type is empty, or if a supplied
    /// id or source is empty.
    pub fn create(draft: NewDomainEvent<P>) -> Result<Self, ValidationError> {
        let mut issues = Vec::new();
        if draft.event_type.is_empty() {
            issues.push(ValidationIssue::Empty("type"));
        }
        if draft.id.as_deref().is_some_and(str::is_empty) {
            issues.push(ValidationIssue::Empty("id"));
        }
        if draft.metadata.source.as_deref().is_some_and(str::is_empty) {
            issues.push(ValidationIssue::Empty("metadata.source"));
        }
        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }

        let metadata = EventMetadata {
            source: draft
                .metadata
                .source
                .unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
            correlation_id: draft.metadata.correlation_id,
            causation_id: draft.metadata.causation_id,
            version: draft.metadata.version.unwrap_or(DEFAULT_VERSION).max(1),
        };

        Ok(Self::from_parts(
            draft.id.unwrap_or_else(new_event_id),
            draft.event_type,
            draft.timestamp.unwrap_or_else(now),
            draft.payload,
            metadata,
        ))
    }

    /// Shorthand for [`create`](Self::create) with every default.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `event_type` is empty.
    pub fn new(event_type: impl Into<String>, payload: P) -> Result<Self, ValidationError> {
        Self::create(NewDomainEvent::new(event_type, payload))
    }

    pub(crate) fn from_parts(
        id: String,
        event_type: String,
        timestamp: Timestamp,
        payload: P,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            id,
            event_type,
            timestamp,
            payload,
            metadata,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Dot-delimited event type, also used as the routing key.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[must_use]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    /// Correlation id carried in the metadata, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.correlation_id()
    }

    /// A copy of this event tagged with the given correlation id.
    #[must_use]
    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self
    where
        P: Clone,
    {
        let mut derived = self.clone();
        derived.metadata.correlation_id = Some(correlation_id.into());
        derived
    }

    /// A copy of this event tagged with the given causation id.
    #[must_use]
    pub fn with_causation_id(&self, causation_id: impl Into<String>) -> Self
    where
        P: Clone,
    {
        let mut derived = self.clone();
        derived.metadata.causation_id = Some(causation_id.into());
        derived
    }

    /// Create a follow-up event caused by this one.
    ///
    /// The new event inherits the correlation id (or this event's id when
    /// there is none), records this event's id as its causation id, and
    /// keeps the source.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `event_type` is empty.
    pub fn caused<Q>(
        &self,
        event_type: impl Into<String>,
        payload: Q,
    ) -> Result<DomainEvent<Q>, ValidationError> {
        let correlation = self
            .metadata
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());
        DomainEvent::create(
            NewDomainEvent::new(event_type, payload)
                .source(self.metadata.source.clone())
                .correlation_id(correlation)
                .causation_id(self.id.clone()),
        )
    }

    /// Consume the event, returning its payload.
    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<P: Serialize> DomainEvent<P> {
    /// Erase the payload type into JSON, as the buses carry it.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error if the payload cannot be represented
    /// as JSON.
    pub fn into_json(self) -> Result<DomainEvent<Value>, serde_json::Error> {
        let payload = serde_json::to_value(&self.payload)?;
        Ok(DomainEvent {
            id: self.id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            payload,
            metadata: self.metadata,
        })
    }
}

impl DomainEvent<Value> {
    /// Decode the opaque payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error if the payload does not fit `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
