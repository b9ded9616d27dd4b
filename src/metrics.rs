//! Prometheus instrumentation for the capture and relay paths.
//!
//! The metric surface is a capability: every consumer holds an
//! `Option<OutboxMetrics>` and behaves identically without one.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
};
use tracing::warn;

/// Counter, gauge, and timer handles, registered into the default registry.
#[derive(Clone)]
pub struct OutboxMetrics {
    /// `outbox_messages_created_total{entity_type, event_type}`
    pub created: IntCounterVec,
    /// `outbox_messages_processed_total{entity_type, status}`
    pub processed: IntCounterVec,
    /// `outbox_creation_failures_total{entity_type}`
    pub creation_failures: IntCounterVec,
    /// `outbox_relay_polling_total`
    pub polling: IntCounter,
    /// `outbox_messages_pending`
    pub pending: IntGauge,
    /// `outbox_messages_failed` (pending records with at least one failed attempt)
    pub failed: IntGauge,
    /// `outbox_messages_dead_letter`
    pub dead_letter: IntGauge,
    /// `outbox_processing_time_seconds{entity_type}` (per-record publish latency)
    pub processing_time: HistogramVec,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let created = IntCounterVec::new(
            Opts::new(
                "outbox_messages_created_total",
                "Outbox records created by the capture interceptor",
            )
            .const_label("service", service.to_string()),
            &["entity_type", "event_type"],
        )
        .expect("valid metric opts for outbox_messages_created_total");

        let processed = IntCounterVec::new(
            Opts::new(
                "outbox_messages_processed_total",
                "Outbox records the relay moved to a new status",
            )
            .const_label("service", service.to_string()),
            &["entity_type", "status"],
        )
        .expect("valid metric opts for outbox_messages_processed_total");

        let creation_failures = IntCounterVec::new(
            Opts::new(
                "outbox_creation_failures_total",
                "Failed attempts to build an outbox record (host transaction rolled back)",
            )
            .const_label("service", service.to_string()),
            &["entity_type"],
        )
        .expect("valid metric opts for outbox_creation_failures_total");

        let polling = IntCounter::with_opts(
            Opts::new(
                "outbox_relay_polling_total",
                "Relay poll cycles executed",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_relay_polling_total");

        let pending = IntGauge::with_opts(
            Opts::new(
                "outbox_messages_pending",
                "Outbox records currently awaiting publication",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_messages_pending");

        let failed = IntGauge::with_opts(
            Opts::new(
                "outbox_messages_failed",
                "Pending outbox records that have failed at least one publish attempt",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_messages_failed");

        let dead_letter = IntGauge::with_opts(
            Opts::new(
                "outbox_messages_dead_letter",
                "Outbox records that exhausted their retry budget",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_messages_dead_letter");

        let processing_time = HistogramVec::new(
            HistogramOpts::new(
                "outbox_processing_time_seconds",
                "Per-record publish latency in seconds",
            )
            .const_label("service", service.to_string()),
            &["entity_type"],
        )
        .expect("valid metric opts for outbox_processing_time_seconds");

        for metric in [
            Box::new(created.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(processed.clone()),
            Box::new(creation_failures.clone()),
            Box::new(polling.clone()),
            Box::new(pending.clone()),
            Box::new(failed.clone()),
            Box::new(dead_letter.clone()),
            Box::new(processing_time.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            created,
            processed,
            creation_failures,
            polling,
            pending,
            failed,
            dead_letter,
            processing_time,
        }
    }
}
