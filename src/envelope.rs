//! The JSON structure published to the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wire envelope for one outbox record, serialized as UTF-8 JSON with
/// camelCase keys and RFC3339 timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Value,
    pub changed_fields: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub metadata: EnvelopeMetadata,
}

/// Relay-side context attached to every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub worker_id: String,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn envelope_serializes_with_camel_case_keys() {
        let envelope = EventEnvelope {
            id: Uuid::nil(),
            aggregate_id: "1".to_string(),
            aggregate_type: "User".to_string(),
            event_type: "USER_INSERT".to_string(),
            payload: serde_json::json!({"id": 1, "email": "a@x"}),
            changed_fields: None,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            metadata: EnvelopeMetadata {
                worker_id: "worker-1".to_string(),
                version: 2,
            },
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["aggregateId"], "1");
        assert_eq!(value["aggregateType"], "User");
        assert_eq!(value["eventType"], "USER_INSERT");
        assert_eq!(value["changedFields"], Value::Null);
        assert_eq!(value["createdAt"], "2025-03-01T12:00:00Z");
        assert_eq!(value["metadata"]["workerId"], "worker-1");
        assert_eq!(value["metadata"]["version"], 2);
    }

    #[test]
    fn envelope_roundtrips() {
        let envelope = EventEnvelope {
            id: Uuid::new_v4(),
            aggregate_id: "7".to_string(),
            aggregate_type: "Order".to_string(),
            event_type: "ORDER_UPDATE".to_string(),
            payload: serde_json::json!({"id": 7, "total": 12.5}),
            changed_fields: Some(serde_json::json!({
                "total": {"oldValue": 10.0, "newValue": 12.5}
            })),
            created_at: Utc::now(),
            metadata: EnvelopeMetadata {
                worker_id: "worker-2".to_string(),
                version: 0,
            },
        };

        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, envelope.id);
        assert_eq!(back.changed_fields, envelope.changed_fields);
    }
}
