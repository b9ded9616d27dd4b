//! Registry of outbox-tracked aggregate types.
//!
//! Aggregates opt in explicitly: implement [`OutboxAggregate`] and register
//! the type once with [`AggregateRegistry::track`]. The registry stores one
//! [`AggregateMetadata`] per tracked type, keyed by `TypeId`, so hot-path
//! lookups from the capture interceptor are lock-free O(1) map reads.

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

/// Default retry budget stamped onto records of aggregates that don't
/// override it.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// The write operation that triggered a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
}

impl Operation {
    /// Suffix used when deriving a default event type name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
        }
    }
}

/// Capability an aggregate provides to participate in outbox capture.
///
/// Both methods have defaults, so the minimal implementation is empty:
///
/// ```
/// use outbox_relay::OutboxAggregate;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct User {
///     id: i64,
///     email: String,
/// }
///
/// impl OutboxAggregate for User {}
/// ```
///
/// With the defaults, the aggregate identifier is probed from the serialized
/// form (`id`, `entityId`, `primaryKey` keys, in that order) and the payload
/// is the whole serialized aggregate.
pub trait OutboxAggregate: Serialize {
    /// Identifier of this aggregate, when the type can hand it over directly.
    /// `None` falls back to probing the serialized representation.
    fn outbox_id(&self) -> Option<String> {
        None
    }

    /// Custom payload projection published in place of the full aggregate.
    /// `None` means serialize the aggregate itself.
    fn outbox_payload(&self) -> Option<Value> {
        None
    }
}

/// Per-type capture configuration, resolved once at registration.
#[derive(Debug, Clone)]
pub struct AggregateMetadata {
    /// Logical type name; defaults to the Rust type name
    pub aggregate_type: String,
    /// Explicit event type; `None` derives `<TYPE>_<OPERATION>`
    pub event_type: Option<String>,
    /// Whether updates carry a field-level diff
    pub include_changed_fields: bool,
    /// Retry budget for records of this aggregate
    pub max_retries: i32,
}

impl AggregateMetadata {
    /// Event type for one captured operation: the explicit override, or
    /// `UPPERCASE(aggregate_type)_<OPERATION>`.
    pub fn event_type_for(&self, operation: Operation) -> String {
        match &self.event_type {
            Some(explicit) => explicit.clone(),
            None => format!(
                "{}_{}",
                self.aggregate_type.to_uppercase(),
                operation.suffix()
            ),
        }
    }
}

/// Builder for the tracking configuration of one aggregate type.
#[derive(Debug, Clone)]
pub struct TrackedAggregate {
    aggregate_type: Option<String>,
    event_type: Option<String>,
    include_changed_fields: bool,
    max_retries: i32,
}

impl TrackedAggregate {
    pub fn new() -> Self {
        Self {
            aggregate_type: None,
            event_type: None,
            include_changed_fields: true,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the logical aggregate type name.
    pub fn aggregate_type(mut self, name: impl Into<String>) -> Self {
        self.aggregate_type = Some(name.into());
        self
    }

    /// Override the event type for every operation on this aggregate.
    pub fn event_type(mut self, name: impl Into<String>) -> Self {
        self.event_type = Some(name.into());
        self
    }

    /// Enable or disable field-level diffs on updates (enabled by default).
    pub fn include_changed_fields(mut self, include: bool) -> Self {
        self.include_changed_fields = include;
        self
    }

    /// Retry budget before records of this aggregate dead-letter.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for TrackedAggregate {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent map of tracked aggregate types.
///
/// Reads dominate; writes happen once per type at startup. Registration is
/// put-if-absent: a second `track` call for the same type keeps the first
/// configuration.
#[derive(Default)]
pub struct AggregateRegistry {
    entries: DashMap<TypeId, Arc<AggregateMetadata>>,
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register `A` as outbox-tracked. Returns the resolved metadata.
    pub fn track<A: OutboxAggregate + 'static>(
        &self,
        config: TrackedAggregate,
    ) -> Arc<AggregateMetadata> {
        let entry = self
            .entries
            .entry(TypeId::of::<A>())
            .or_insert_with(|| {
                let aggregate_type = config
                    .aggregate_type
                    .unwrap_or_else(|| short_type_name::<A>().to_string());
                Arc::new(AggregateMetadata {
                    aggregate_type,
                    event_type: config.event_type,
                    include_changed_fields: config.include_changed_fields,
                    max_retries: config.max_retries,
                })
            });
        Arc::clone(entry.value())
    }

    /// Metadata for `A`, or `None` when the type is untracked.
    pub fn lookup<A: OutboxAggregate + 'static>(&self) -> Option<Arc<AggregateMetadata>> {
        self.entries
            .get(&TypeId::of::<A>())
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_tracked<A: OutboxAggregate + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<A>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Last path segment of the full Rust type name ("app::model::User" → "User").
fn short_type_name<A: 'static>() -> &'static str {
    let full = std::any::type_name::<A>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct User {
        id: i64,
    }

    impl OutboxAggregate for User {}

    #[derive(Serialize)]
    struct Order {
        id: i64,
    }

    impl OutboxAggregate for Order {}

    #[test]
    fn derives_type_and_event_names() {
        let registry = AggregateRegistry::new();
        let meta = registry.track::<User>(TrackedAggregate::new());

        assert_eq!(meta.aggregate_type, "User");
        assert_eq!(meta.event_type_for(Operation::Insert), "USER_INSERT");
        assert_eq!(meta.event_type_for(Operation::Update), "USER_UPDATE");
        assert_eq!(meta.max_retries, DEFAULT_MAX_RETRIES);
        assert!(meta.include_changed_fields);
    }

    #[test]
    fn honors_overrides() {
        let registry = AggregateRegistry::new();
        let meta = registry.track::<Order>(
            TrackedAggregate::new()
                .aggregate_type("PurchaseOrder")
                .event_type("order.changed")
                .include_changed_fields(false)
                .max_retries(7),
        );

        assert_eq!(meta.aggregate_type, "PurchaseOrder");
        assert_eq!(meta.event_type_for(Operation::Insert), "order.changed");
        assert_eq!(meta.event_type_for(Operation::Update), "order.changed");
        assert!(!meta.include_changed_fields);
        assert_eq!(meta.max_retries, 7);
    }

    #[test]
    fn registration_is_put_if_absent() {
        let registry = AggregateRegistry::new();
        registry.track::<User>(TrackedAggregate::new().max_retries(5));
        let second = registry.track::<User>(TrackedAggregate::new().max_retries(9));

        // First registration wins.
        assert_eq!(second.max_retries, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn untracked_types_resolve_to_none() {
        let registry = AggregateRegistry::new();
        registry.track::<User>(TrackedAggregate::new());

        assert!(registry.lookup::<User>().is_some());
        assert!(registry.lookup::<Order>().is_none());
        assert!(!registry.is_tracked::<Order>());
    }
}
