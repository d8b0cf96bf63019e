//! Boundary validation for event envelopes arriving from outside the process
//! (broker deliveries, external API payloads).
//!
//! Validation never panics and never short-circuits: every violated rule is
//! collected so the caller can log or report them together.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{ValidationError, ValidationIssue};
use crate::event::{DomainEvent, EventMetadata};
use crate::time::Timestamp;

/// Validate an untrusted JSON envelope and build a [`DomainEvent`] from it.
///
/// Rules: `id`, `type` and `timestamp` are non-empty strings, `timestamp` is
/// an ISO 8601 date-time with an offset (RFC 3339, or with a `+hhmm`
/// offset), `metadata.source` is a non-empty string, `metadata.version` is an
/// integer `>= 1`, and the optional `correlationId` / `causationId` are strings
/// when present. A missing `payload` is read as `null`.
///
/// # Errors
///
/// Returns a [`ValidationError`] listing every rule the envelope violates.
pub fn validate_domain_event(input: &Value) -> Result<DomainEvent, ValidationError> {
    let Some(object) = input.as_object() else {
        return Err(ValidationError::single(ValidationIssue::NotAnObject));
    };

    let mut issues = Vec::new();

    let id = required_string(object, "id", "id", &mut issues);
    let event_type = required_string(object, "type", "type", &mut issues);
    let timestamp = required_string(object, "timestamp", "timestamp", &mut issues)
        .and_then(|raw| match parse_timestamp(raw) {
            Some(ts) => Some(ts),
            None => {
                issues.push(ValidationIssue::InvalidTimestamp(raw.to_string()));
                None
            }
        });
    let metadata = match object.get("metadata") {
        None | Some(Value::Null) => {
            issues.push(ValidationIssue::Missing("metadata"));
            None
        }
        Some(Value::Object(metadata)) => validate_metadata(metadata, &mut issues),
        Some(_) => {
            issues.push(ValidationIssue::WrongType("metadata"));
            None
        }
    };

    match (id, event_type, timestamp, metadata) {
        (Some(id), Some(event_type), Some(timestamp), Some(metadata)) if issues.is_empty() => {
            let payload = object.get("payload").cloned().unwrap_or(Value::Null);
            Ok(DomainEvent::from_parts(
                id.to_string(),
                event_type.to_string(),
                timestamp,
                payload,
                metadata,
            ))
        }
        _ => Err(ValidationError { issues }),
    }
}

/// Parse raw bytes (e.g. a broker message body) and validate the envelope.
///
/// # Errors
///
/// Returns [`ValidationIssue::NotAnObject`] when the bytes are not JSON,
/// otherwise whatever [`validate_domain_event`] reports.
pub fn validate_domain_event_bytes(body: &[u8]) -> Result<DomainEvent, ValidationError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => validate_domain_event(&value),
        Err(_) => Err(ValidationError::single(ValidationIssue::NotAnObject)),
    }
}

fn validate_metadata(
    metadata: &Map<String, Value>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<EventMetadata> {
    let source = required_string(metadata, "source", "metadata.source", issues);
    let correlation_id = optional_string(metadata, "correlationId", "metadata.correlationId", issues);
    let causation_id = optional_string(metadata, "causationId", "metadata.causationId", issues);

    let version = match metadata.get("version") {
        None | Some(Value::Null) => {
            issues.push(ValidationIssue::Missing("metadata.version"));
            None
        }
        Some(value) => match value.as_u64().and_then(|v| u32::try_from(v).ok()) {
            Some(v) if v >= 1 => Some(v),
            _ => {
                issues.push(ValidationIssue::InvalidVersion);
                None
            }
        },
    };

    Some(EventMetadata::from_parts(
        source?.to_string(),
        correlation_id.map(str::to_string),
        causation_id.map(str::to_string),
        version?,
    ))
}

fn required_string<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    field: &'static str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<&'a str> {
    match object.get(key) {
        None | Some(Value::Null) => {
            issues.push(ValidationIssue::Missing(field));
            None
        }
        Some(Value::String(s)) if s.is_empty() => {
            issues.push(ValidationIssue::Empty(field));
            None
        }
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            issues.push(ValidationIssue::WrongType(field));
            None
        }
    }
}

fn optional_string<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    field: &'static str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<&'a str> {
    match object.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            issues.push(ValidationIssue::WrongType(field));
            None
        }
    }
}

/// Extended-format ISO 8601 date-times whose offset has no colon, which
/// RFC 3339 does not allow.
const COMPACT_OFFSET_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, COMPACT_OFFSET_FORMAT))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_envelope() -> Value {
        json!({
            "id": "evt-1",
            "type": "order.placed",
            "timestamp": "2024-05-01T12:00:00.000Z",
            "payload": {"orderId": "o-1"},
            "metadata": {"source": "orders", "version": 1, "correlationId": "c-1"}
        })
    }

    #[test]
    fn should_accept_well_formed_envelope() {
        let event = validate_domain_event(&valid_envelope()).unwrap();
        assert_eq!(event.id(), "evt-1");
        assert_eq!(event.event_type(), "order.placed");
        assert_eq!(event.payload()["orderId"], "o-1");
        assert_eq!(event.metadata().source(), "orders");
        assert_eq!(event.correlation_id(), Some("c-1"));
    }

    #[test]
    fn should_accept_what_the_factory_serializes() {
        let event = DomainEvent::new("product.created", json!({"sku": "x"})).unwrap();
        let value = serde_json::to_value(&event).unwrap();
        let parsed = validate_domain_event(&value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn should_reject_non_object() {
        let err = validate_domain_event(&json!([1, 2])).unwrap_err();
        assert_eq!(err.issues, vec![ValidationIssue::NotAnObject]);
    }

    #[test]
    fn should_collect_every_violation() {
        let err = validate_domain_event(&json!({
            "id": "",
            "timestamp": "yesterday",
            "metadata": {"source": "", "version": 0}
        }))
        .unwrap_err();

        assert!(err.contains(&ValidationIssue::Empty("id")));
        assert!(err.contains(&ValidationIssue::Missing("type")));
        assert!(err.contains(&ValidationIssue::InvalidTimestamp("yesterday".to_string())));
        assert!(err.contains(&ValidationIssue::Empty("metadata.source")));
        assert!(err.contains(&ValidationIssue::InvalidVersion));
    }

    #[test]
    fn should_reject_missing_metadata() {
        let mut envelope = valid_envelope();
        envelope.as_object_mut().unwrap().remove("metadata");
        let err = validate_domain_event(&envelope).unwrap_err();
        assert_eq!(err.issues, vec![ValidationIssue::Missing("metadata")]);
    }

    #[test]
    fn should_reject_fractional_version() {
        let mut envelope = valid_envelope();
        envelope["metadata"]["version"] = json!(1.5);
        let err = validate_domain_event(&envelope).unwrap_err();
        assert!(err.contains(&ValidationIssue::InvalidVersion));
    }

    #[test]
    fn should_reject_non_string_correlation_id() {
        let mut envelope = valid_envelope();
        envelope["metadata"]["correlationId"] = json!(42);
        let err = validate_domain_event(&envelope).unwrap_err();
        assert!(err.contains(&ValidationIssue::WrongType("metadata.correlationId")));
    }

    #[test]
    fn should_accept_offsets_without_colon() {
        let mut envelope = valid_envelope();
        envelope["timestamp"] = json!("2024-05-01T14:00:00+0200");
        let event = validate_domain_event(&envelope).unwrap();
        assert_eq!(
            event.timestamp(),
            "2024-05-01T12:00:00Z".parse::<Timestamp>().unwrap()
        );

        envelope["timestamp"] = json!("2024-05-01T12:00:00.250+0000");
        assert!(validate_domain_event(&envelope).is_ok());
    }

    #[test]
    fn should_reject_timestamp_without_offset() {
        let mut envelope = valid_envelope();
        envelope["timestamp"] = json!("2024-05-01T12:00:00");
        let err = validate_domain_event(&envelope).unwrap_err();
        assert!(err.contains(&ValidationIssue::InvalidTimestamp(
            "2024-05-01T12:00:00".to_string()
        )));
    }

    #[test]
    fn should_read_missing_payload_as_null() {
        let mut envelope = valid_envelope();
        envelope.as_object_mut().unwrap().remove("payload");
        let event = validate_domain_event(&envelope).unwrap();
        assert!(event.payload().is_null());
    }

    #[test]
    fn should_reject_bytes_that_are_not_json() {
        let err = validate_domain_event_bytes(b"{not json").unwrap_err();
        assert_eq!(err.issues, vec![ValidationIssue::NotAnObject]);
    }
}
