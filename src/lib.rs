//! # Transactional Outbox Capture & Relay
//!
//! This library implements the transactional outbox pattern: application
//! writes and their domain events commit atomically to PostgreSQL, then a
//! background relay forwards the events to Kafka with at-least-once delivery.
//!
//! ## How it works
//!
//! 1. Aggregates opt in by implementing [`OutboxAggregate`] and registering
//!    with an [`AggregateRegistry`].
//! 2. The host's persistence layer calls the [`OutboxInterceptor`] hooks
//!    inside the business transaction; the interceptor enlists one outbox
//!    record per write (with a field-level diff on updates). Commit makes the
//!    business rows and the outbox record durable together.
//! 3. [`OutboxRelay`] polls for `PENDING` records, claims each with an
//!    optimistic version guard, publishes its envelope to
//!    `<topic_prefix>.<lowercase(aggregate_type)>` keyed by aggregate id, and
//!    marks it `SENT`.
//! 4. Failed publishes return to `PENDING` with `retry_count` incremented;
//!    once the per-aggregate retry budget is exhausted the record moves to
//!    `DEAD_LETTER` and its envelope is mirrored (best effort) to the
//!    dead-letter topic. A cron-scheduled pruner deletes old `SENT` records.
//!
//! Multiple relay workers can share one outbox table: the version guard on
//! every mutating statement is the only coordination they need, so the schema
//! works on engines without `SKIP LOCKED`.
//!
//! This guarantees **at-least-once delivery** and prevents event loss even if:
//! - The service crashes after database commit but before the Kafka publish
//! - Kafka is temporarily unavailable
//! - Network partitions occur
//!
//! Consumers must tolerate redelivery, and, under concurrent retries, a
//! failed record for a key occasionally arriving after a newer record for the
//! same key.
//!
//! ## Usage Example
//!
//! ### 1. Capture events in the write path
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use outbox_relay::{
//!     AggregateRegistry, OutboxAggregate, OutboxInterceptor, PgOutboxStore, TrackedAggregate,
//! };
//! use serde::Serialize;
//! use sqlx::PgPool;
//!
//! #[derive(Serialize)]
//! struct User {
//!     id: i64,
//!     email: String,
//! }
//!
//! impl OutboxAggregate for User {}
//!
//! async fn create_user(
//!     pool: &PgPool,
//!     interceptor: &OutboxInterceptor,
//!     user: User,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     // 1. The business write
//!     sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
//!         .bind(user.id)
//!         .bind(&user.email)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     // 2. The outbox record, enlisted in the same transaction
//!     interceptor.on_insert(&mut tx, &user).await?;
//!
//!     // 3. Both commit atomically
//!     tx.commit().await?;
//!     Ok(())
//! }
//!
//! fn wiring(pool: PgPool) -> OutboxInterceptor {
//!     let registry = Arc::new(AggregateRegistry::new());
//!     registry.track::<User>(TrackedAggregate::new());
//!     OutboxInterceptor::new(registry, Arc::new(PgOutboxStore::new(pool)))
//! }
//! ```
//!
//! ### 2. Run the relay
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use outbox_relay::{
//!     KafkaEventPublisher, OutboxMetrics, OutboxRelay, PgOutboxStore, RelayConfig,
//! };
//! use sqlx::PgPool;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect("postgresql://localhost/app").await?;
//!     let store = Arc::new(PgOutboxStore::new(pool));
//!     let publisher = Arc::new(KafkaEventPublisher::from_brokers(
//!         "localhost:9092",
//!         "outbox-relay",
//!     )?);
//!
//!     let relay = Arc::new(
//!         OutboxRelay::new(store, publisher, RelayConfig::from_env())?
//!             .with_metrics(OutboxMetrics::new("app")),
//!     );
//!     let handle = relay.spawn();
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await; // drains the in-flight record
//!     Ok(())
//! }
//! ```

mod error;

pub mod capture;
pub mod config;
pub mod envelope;
pub mod metrics;
pub mod publisher;
pub mod record;
pub mod registry;
pub mod relay;
pub mod store;

pub use capture::OutboxInterceptor;
pub use config::RelayConfig;
pub use envelope::{EnvelopeMetadata, EventEnvelope};
pub use error::{OutboxError, OutboxResult};
pub use metrics::OutboxMetrics;
pub use publisher::{topic_name, EventPublisher, KafkaEventPublisher};
pub use record::{OutboxRecord, OutboxStatus};
pub use registry::{
    AggregateMetadata, AggregateRegistry, Operation, OutboxAggregate, TrackedAggregate,
    DEFAULT_MAX_RETRIES,
};
pub use relay::{OutboxRelay, RelayHandle};
pub use store::{OutboxStore, PgOutboxStore};
