use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON Schema (Draft 2020-12) every inbound audit event body must satisfy.
pub const AUDIT_EVENT_SCHEMA: &str = r#"{
    "$schema": "https://json-schema.org/draft/2020-12/schema",
    "type": "object",
    "properties": {
        "event_id": {"type": "string", "minLength": 1, "maxLength": 64},
        "kind": {"type": "string", "pattern": "^[a-z][a-z0-9_.]*$"},
        "actor": {"type": "string", "minLength": 1},
        "occurred_at": {"type": "string", "format": "date-time"},
        "attributes": {"type": "object"}
    },
    "required": ["event_id", "kind", "actor", "occurred_at"],
    "additionalProperties": false
}"#;

/// Something a user or system did, as published on the audit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub kind: String,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Input for storing one audit event together with its delivery metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreAuditEventInput {
    pub event: AuditEvent,
    /// Value of the `environment` binding of the batch that delivered it
    pub environment: String,
    pub message_id: String,
    pub delivery_attempts: u32,
}

/// Input for recording when an actor was last seen.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchActorInput {
    pub actor: String,
    pub environment: String,
    pub seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::queue::{JsonSchemaDecoder, MessageDecoder};

    fn decoder() -> JsonSchemaDecoder<AuditEvent> {
        JsonSchemaDecoder::new(AUDIT_EVENT_SCHEMA).unwrap()
    }

    #[test]
    fn test_decode_valid_event() {
        let body = br#"{
            "event_id": "ev-1",
            "kind": "user.login",
            "actor": "alice",
            "occurred_at": "2024-05-01T12:00:00Z",
            "attributes": {"ip": "10.0.0.1"}
        }"#;

        let event = decoder().decode(body).unwrap();
        assert_eq!(event.event_id, "ev-1");
        assert_eq!(event.kind, "user.login");
        assert_eq!(event.attributes["ip"], "10.0.0.1");
    }

    #[test]
    fn test_attributes_default_to_empty() {
        let body = br#"{"event_id":"ev-2","kind":"user.logout","actor":"bob","occurred_at":"2024-05-01T12:00:00Z"}"#;
        let event = decoder().decode(body).unwrap();
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn test_schema_rejects_bad_kind_and_missing_actor() {
        let body = br#"{"event_id":"ev-3","kind":"User Login","occurred_at":"2024-05-01T12:00:00Z"}"#;
        let err = decoder().decode(body).unwrap_err();

        assert!(err.diagnostic.contains("actor"));
        assert!(err.diagnostic.contains("/kind"));
    }

    #[test]
    fn test_schema_rejects_unknown_fields() {
        let body = br#"{"event_id":"ev-4","kind":"a","actor":"c","occurred_at":"2024-05-01T12:00:00Z","extra":1}"#;
        assert!(decoder().decode(body).is_err());
    }
}
