//! Event capture inside the host's write path.
//!
//! The host persistence layer calls [`OutboxInterceptor::on_insert`] /
//! [`OutboxInterceptor::on_update`] with the aggregate (and, for updates, the
//! pre-write shadow copy) while the business transaction is still open. For a
//! tracked aggregate exactly one `PENDING` record is enlisted in that
//! transaction; for an untracked one the hook is a no-op. Any failure to build
//! the record propagates to the caller so the business write rolls back with
//! it; a write never commits without its outbox record.
//!
//! The outbox record type itself is not an aggregate, so persisting it cannot
//! re-enter the interceptor.

use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::{Postgres, Transaction};
use tracing::Instrument;

use crate::error::{OutboxError, OutboxResult};
use crate::metrics::OutboxMetrics;
use crate::record::OutboxRecord;
use crate::registry::{AggregateMetadata, AggregateRegistry, Operation, OutboxAggregate};
use crate::store::PgOutboxStore;

/// Accessor keys probed, in order, when an aggregate does not implement
/// `outbox_id` and its identifier must be read off the serialized form.
const ID_KEYS: [&str; 3] = ["id", "entityId", "primaryKey"];

/// Capture interceptor for the host's pre-insert / pre-update hooks.
pub struct OutboxInterceptor {
    registry: Arc<AggregateRegistry>,
    store: Arc<PgOutboxStore>,
    metrics: Option<OutboxMetrics>,
}

impl OutboxInterceptor {
    pub fn new(registry: Arc<AggregateRegistry>, store: Arc<PgOutboxStore>) -> Self {
        Self {
            registry,
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Pre-insert hook. Returns the enlisted record, or `None` when `A` is
    /// not tracked.
    pub async fn on_insert<A: OutboxAggregate + 'static>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        aggregate: &A,
    ) -> OutboxResult<Option<OutboxRecord>> {
        let Some(meta) = self.registry.lookup::<A>() else {
            return Ok(None);
        };

        let span = tracing::info_span!(
            "outbox.create_message",
            entity_type = %meta.aggregate_type,
            operation = "insert",
        );
        self.enlist(tx, &meta, build_insert_record(&meta, aggregate))
            .instrument(span)
            .await
    }

    /// Pre-update hook. `old` is the shadow copy captured when the aggregate
    /// was loaded; `new` is the state about to be written.
    pub async fn on_update<A: OutboxAggregate + 'static>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        old: &A,
        new: &A,
    ) -> OutboxResult<Option<OutboxRecord>> {
        let Some(meta) = self.registry.lookup::<A>() else {
            return Ok(None);
        };

        let span = tracing::info_span!(
            "outbox.create_message",
            entity_type = %meta.aggregate_type,
            operation = "update",
        );
        self.enlist(tx, &meta, build_update_record(&meta, old, new))
            .instrument(span)
            .await
    }

    async fn enlist(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        meta: &AggregateMetadata,
        built: OutboxResult<OutboxRecord>,
    ) -> OutboxResult<Option<OutboxRecord>> {
        let record = match built {
            Ok(record) => record,
            Err(e) => {
                if let (Some(metrics), OutboxError::Creation(_)) = (&self.metrics, &e) {
                    metrics
                        .creation_failures
                        .with_label_values(&[&meta.aggregate_type])
                        .inc();
                }
                return Err(e);
            }
        };

        self.store.insert(tx, &record).await?;

        if let Some(metrics) = &self.metrics {
            metrics
                .created
                .with_label_values(&[&record.aggregate_type, &record.event_type])
                .inc();
        }

        Ok(Some(record))
    }
}

/// Build the record for a captured insert.
fn build_insert_record<A: OutboxAggregate>(
    meta: &AggregateMetadata,
    aggregate: &A,
) -> OutboxResult<OutboxRecord> {
    Ok(OutboxRecord::new(
        extract_aggregate_id(aggregate)?,
        meta.aggregate_type.clone(),
        meta.event_type_for(Operation::Insert),
        projected_payload(aggregate)?,
        None,
        meta.max_retries,
    ))
}

/// Build the record for a captured update. The payload reflects the new
/// state; the diff (when enabled) compares old against new field by field.
fn build_update_record<A: OutboxAggregate>(
    meta: &AggregateMetadata,
    old: &A,
    new: &A,
) -> OutboxResult<OutboxRecord> {
    let changed_fields = if meta.include_changed_fields {
        let old_state = serialize_state(old)?;
        let new_state = serialize_state(new)?;
        Some(diff_fields(&old_state, &new_state))
    } else {
        None
    };

    Ok(OutboxRecord::new(
        extract_aggregate_id(new)?,
        meta.aggregate_type.clone(),
        meta.event_type_for(Operation::Update),
        projected_payload(new)?,
        changed_fields,
        meta.max_retries,
    ))
}

/// Resolve the aggregate identifier: the explicit accessor when implemented,
/// otherwise the conventional keys of the serialized form.
fn extract_aggregate_id<A: OutboxAggregate>(aggregate: &A) -> OutboxResult<String> {
    if let Some(id) = aggregate.outbox_id() {
        if id.is_empty() {
            return Err(OutboxError::Creation(
                "aggregate returned an empty identifier".to_string(),
            ));
        }
        return Ok(id);
    }

    let state = serialize_state(aggregate)?;
    let Value::Object(fields) = &state else {
        return Err(OutboxError::Creation(
            "aggregate does not serialize to an object and provides no outbox_id".to_string(),
        ));
    };

    for key in ID_KEYS {
        match fields.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Ok(s.clone()),
            Some(Value::Number(n)) => return Ok(n.to_string()),
            Some(Value::Null) | None => continue,
            Some(other) => {
                return Err(OutboxError::Creation(format!(
                    "aggregate identifier field '{key}' has no usable scalar value: {other}"
                )))
            }
        }
    }

    Err(OutboxError::Creation(format!(
        "unable to extract aggregate identifier (tried keys {ID_KEYS:?})"
    )))
}

/// The payload published for this aggregate: its projection when provided,
/// the serialized aggregate otherwise.
fn projected_payload<A: OutboxAggregate>(aggregate: &A) -> OutboxResult<Value> {
    match aggregate.outbox_payload() {
        Some(projection) => Ok(projection),
        None => serialize_state(aggregate),
    }
}

fn serialize_state<A: OutboxAggregate>(aggregate: &A) -> OutboxResult<Value> {
    serde_json::to_value(aggregate)
        .map_err(|e| OutboxError::Creation(format!("aggregate serialization failed: {e}")))
}

/// Pairwise field comparison of two serialized states. Keys present in either
/// state are compared by value equality; a differing key contributes an
/// `{"oldValue": …, "newValue": …}` entry. Missing sides appear as `null`.
fn diff_fields(old_state: &Value, new_state: &Value) -> Value {
    let empty = Map::new();
    let old_fields = old_state.as_object().unwrap_or(&empty);
    let new_fields = new_state.as_object().unwrap_or(&empty);

    let mut diff = Map::new();
    for (name, old_value) in old_fields {
        let new_value = new_fields.get(name).unwrap_or(&Value::Null);
        if old_value != new_value {
            diff.insert(
                name.clone(),
                serde_json::json!({ "oldValue": old_value, "newValue": new_value }),
            );
        }
    }
    for (name, new_value) in new_fields {
        if !old_fields.contains_key(name) && *new_value != Value::Null {
            diff.insert(
                name.clone(),
                serde_json::json!({ "oldValue": Value::Null, "newValue": new_value }),
            );
        }
    }

    Value::Object(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OutboxStatus;
    use crate::registry::TrackedAggregate;
    use serde::Serialize;

    #[derive(Serialize, Clone)]
    struct User {
        id: i64,
        email: String,
        first_name: String,
        last_name: String,
    }

    impl OutboxAggregate for User {}

    #[derive(Serialize)]
    struct Invoice {
        number: String,
        total: f64,
    }

    impl OutboxAggregate for Invoice {
        fn outbox_id(&self) -> Option<String> {
            Some(self.number.clone())
        }

        fn outbox_payload(&self) -> Option<Value> {
            Some(serde_json::json!({ "invoice": self.number, "total": self.total }))
        }
    }

    #[derive(Serialize)]
    struct Anonymous {
        label: String,
    }

    impl OutboxAggregate for Anonymous {}

    fn user() -> User {
        User {
            id: 1,
            email: "a@x".to_string(),
            first_name: "J".to_string(),
            last_name: "D".to_string(),
        }
    }

    fn user_meta() -> AggregateMetadata {
        let registry = AggregateRegistry::new();
        let meta = registry.track::<User>(TrackedAggregate::new());
        (*meta).clone()
    }

    #[test]
    fn insert_record_serializes_full_aggregate() {
        let record = build_insert_record(&user_meta(), &user()).unwrap();

        assert_eq!(record.aggregate_id, "1");
        assert_eq!(record.aggregate_type, "User");
        assert_eq!(record.event_type, "USER_INSERT");
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.payload["email"], "a@x");
        assert!(record.changed_fields.is_none());
    }

    #[test]
    fn projection_overrides_full_serialization() {
        let registry = AggregateRegistry::new();
        let meta = registry.track::<Invoice>(TrackedAggregate::new());
        let invoice = Invoice {
            number: "INV-9".to_string(),
            total: 40.0,
        };

        let record = build_insert_record(&meta, &invoice).unwrap();
        assert_eq!(record.aggregate_id, "INV-9");
        assert_eq!(
            record.payload,
            serde_json::json!({ "invoice": "INV-9", "total": 40.0 })
        );
    }

    #[test]
    fn update_diff_contains_exactly_the_mutated_fields() {
        let old = user();
        let mut new = old.clone();
        new.first_name = "Jane".to_string();

        let record = build_update_record(&user_meta(), &old, &new).unwrap();

        assert_eq!(record.event_type, "USER_UPDATE");
        assert_eq!(
            record.changed_fields,
            Some(serde_json::json!({
                "first_name": { "oldValue": "J", "newValue": "Jane" }
            }))
        );
        // The payload reflects the new state.
        assert_eq!(record.payload["first_name"], "Jane");
    }

    #[test]
    fn unchanged_update_still_produces_a_record_with_empty_diff() {
        let old = user();
        let new = user();

        let record = build_update_record(&user_meta(), &old, &new).unwrap();
        assert_eq!(record.changed_fields, Some(serde_json::json!({})));
    }

    #[test]
    fn diff_tracking_can_be_disabled() {
        let registry = AggregateRegistry::new();
        let meta = registry.track::<User>(TrackedAggregate::new().include_changed_fields(false));
        let old = user();
        let mut new = old.clone();
        new.email = "b@x".to_string();

        let record = build_update_record(&meta, &old, &new).unwrap();
        assert!(record.changed_fields.is_none());
    }

    #[test]
    fn id_extraction_falls_back_to_conventional_keys() {
        #[derive(Serialize)]
        struct WithEntityId {
            #[serde(rename = "entityId")]
            entity_id: String,
        }
        impl OutboxAggregate for WithEntityId {}

        let id = extract_aggregate_id(&WithEntityId {
            entity_id: "e-17".to_string(),
        })
        .unwrap();
        assert_eq!(id, "e-17");

        #[derive(Serialize)]
        struct WithPrimaryKey {
            #[serde(rename = "primaryKey")]
            primary_key: u32,
        }
        impl OutboxAggregate for WithPrimaryKey {}

        let id = extract_aggregate_id(&WithPrimaryKey { primary_key: 99 }).unwrap();
        assert_eq!(id, "99");
    }

    #[test]
    fn missing_identifier_is_a_creation_error() {
        let result = extract_aggregate_id(&Anonymous {
            label: "no id here".to_string(),
        });

        assert!(matches!(result, Err(OutboxError::Creation(_))));
    }

    #[test]
    fn diff_reports_added_and_removed_fields() {
        let old = serde_json::json!({ "a": 1, "b": "x" });
        let new = serde_json::json!({ "a": 1, "c": true });

        let diff = diff_fields(&old, &new);
        assert_eq!(
            diff,
            serde_json::json!({
                "b": { "oldValue": "x", "newValue": null },
                "c": { "oldValue": null, "newValue": true }
            })
        );
    }
}
