//! The persistent outbox record and its lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::{EnvelopeMetadata, EventEnvelope};

/// Lifecycle state of an [`OutboxRecord`].
///
/// Stored as a `VARCHAR` column; round-trips through [`OutboxStatus::as_str`]
/// and [`FromStr`]. `Sent` and `DeadLetter` are terminal: once reached, the
/// record is immutable except for deletion by the pruner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Awaiting publication (also the state a failed record returns to while
    /// it still has retry budget).
    Pending,
    /// Successfully acknowledged by the bus.
    Sent,
    /// A publish attempt failed. Transitional only: the relay immediately
    /// resets failing records to `Pending` so the poll query sees them again.
    Failed,
    /// Retry budget exhausted; retained for operator intervention.
    DeadLetter,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    /// True for states that permit no further status transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::DeadLetter)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENT" => Ok(OutboxStatus::Sent),
            "FAILED" => Ok(OutboxStatus::Failed),
            "DEAD_LETTER" => Ok(OutboxStatus::DeadLetter),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// One row of `outbox_messages`: a domain event captured transactionally with
/// the business write that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Primary key, assigned at creation
    pub id: Uuid,

    /// Identifier of the source aggregate; partition key on the bus
    pub aggregate_id: String,

    /// Logical aggregate type name (e.g. "User")
    pub aggregate_type: String,

    /// Event name (e.g. "USER_INSERT")
    pub event_type: String,

    /// Projection of the aggregate at commit time
    pub payload: Value,

    /// On updates with diff tracking enabled: mutated field name →
    /// `{oldValue, newValue}`
    pub changed_fields: Option<Value>,

    /// Lifecycle state; initially `Pending`
    pub status: OutboxStatus,

    /// Creation instant; the canonical relay ordering key
    pub created_at: DateTime<Utc>,

    /// Set on the terminal transition (`Sent` or `DeadLetter`)
    pub processed_at: Option<DateTime<Utc>>,

    /// Completed publish attempts that failed
    pub retry_count: i32,

    /// Failure budget before dead-lettering
    pub max_retries: i32,

    /// Last failure description; cleared on success
    pub error_message: Option<String>,

    /// Worker currently leasing this record
    pub worker_id: Option<String>,

    /// Optimistic-concurrency counter, bumped on every mutating write
    pub version: i64,
}

impl OutboxRecord {
    /// Create a fresh `Pending` record. `changed_fields` is `Some` only for
    /// updates captured with diff tracking enabled.
    pub fn new(
        aggregate_id: String,
        aggregate_type: String,
        event_type: String,
        payload: Value,
        changed_fields: Option<Value>,
        max_retries: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type,
            event_type,
            payload,
            changed_fields,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            worker_id: None,
            version: 0,
        }
    }

    /// Build the wire envelope for this record, stamped with the identity of
    /// the worker publishing it.
    pub fn envelope(&self, worker_id: &str) -> EventEnvelope {
        EventEnvelope {
            id: self.id,
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            changed_fields: self.changed_fields.clone(),
            created_at: self.created_at,
            metadata: EnvelopeMetadata {
                worker_id: worker_id.to_string(),
                version: self.version,
            },
        }
    }

    /// Whether one more failed attempt would exhaust the retry budget.
    pub fn retries_exhausted_after_next_failure(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
            OutboxStatus::DeadLetter,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("BOGUS".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(OutboxStatus::Sent.is_terminal());
        assert!(OutboxStatus::DeadLetter.is_terminal());
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(!OutboxStatus::Failed.is_terminal());
    }

    #[test]
    fn new_record_starts_pending_and_unleased() {
        let record = OutboxRecord::new(
            "42".to_string(),
            "User".to_string(),
            "USER_INSERT".to_string(),
            serde_json::json!({"id": 42}),
            None,
            3,
        );

        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.version, 0);
        assert!(record.processed_at.is_none());
        assert!(record.worker_id.is_none());
        assert!(record.error_message.is_none());
    }
}
