//! Publishing envelopes to the message bus.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::debug;

use crate::envelope::EventEnvelope;
use crate::error::{OutboxError, OutboxResult};

/// Delivery acknowledgement deadline per publish attempt. Exceeding it is a
/// publish failure like any other.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Bus contract the relay depends on: publish one keyed value to a topic and
/// await the broker's acknowledgement.
///
/// Implementations should be idempotent producers; the relay guarantees
/// at-least-once, so redelivery after a crash is expected.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> OutboxResult<()>;
}

/// Topic an envelope for `aggregate_type` is routed to:
/// `<prefix>.<lowercase(aggregate_type)>`.
pub fn topic_name(prefix: &str, aggregate_type: &str) -> String {
    format!("{}.{}", prefix, aggregate_type.to_lowercase())
}

/// Kafka implementation of [`EventPublisher`].
///
/// Serializes the envelope as UTF-8 JSON and attaches the identifying fields
/// as headers so consumers can route without parsing the body.
pub struct KafkaEventPublisher {
    producer: FutureProducer,
}

impl KafkaEventPublisher {
    /// Wrap an existing producer. The producer MUST be configured with
    /// `enable.idempotence=true` and `acks=all`.
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }

    /// Create a producer with the idempotence settings this crate requires.
    pub fn from_brokers(brokers: &str, client_id: &str) -> OutboxResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .create()
            .map_err(|e| OutboxError::Config(format!("failed to create Kafka producer: {e}")))?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> OutboxResult<()> {
        let body = serde_json::to_string(envelope)?;

        let record_id = envelope.id.to_string();
        let created_at = envelope.created_at.to_rfc3339();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_id",
                value: Some(record_id.as_bytes()),
            })
            .insert(Header {
                key: "event_type",
                value: Some(envelope.event_type.as_bytes()),
            })
            .insert(Header {
                key: "aggregate_type",
                value: Some(envelope.aggregate_type.as_bytes()),
            })
            .insert(Header {
                key: "aggregate_id",
                value: Some(envelope.aggregate_id.as_bytes()),
            })
            .insert(Header {
                key: "created_at",
                value: Some(created_at.as_bytes()),
            });

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&body)
            .headers(headers);

        self.producer
            .send(record, DELIVERY_TIMEOUT)
            .await
            .map_err(|(err, _)| OutboxError::Publish(format!("Kafka publish failed: {err}")))?;

        debug!(
            record_id = %envelope.id,
            event_type = %envelope.event_type,
            topic = %topic,
            key = %key,
            "Envelope published"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_mapping_lowercases_the_aggregate_type() {
        assert_eq!(topic_name("outbox.events", "User"), "outbox.events.user");
        assert_eq!(
            topic_name("outbox.events", "PurchaseOrder"),
            "outbox.events.purchaseorder"
        );
        assert_eq!(topic_name("orders", "ORDER"), "orders.order");
    }
}
