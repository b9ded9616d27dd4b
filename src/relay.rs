//! The relay engine: polls the outbox, publishes leased records to the bus,
//! and prunes delivered records on a cron schedule.
//!
//! Multiple relay processes may run against one outbox table. There is no
//! in-memory mutual exclusion; the version guard on every store mutation is
//! the sole coordination primitive. A worker that loses a guarded update
//! drops the record and moves on; the winner owns it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::RelayConfig;
use crate::error::OutboxResult;
use crate::metrics::OutboxMetrics;
use crate::publisher::{topic_name, EventPublisher};
use crate::record::{OutboxRecord, OutboxStatus};
use crate::store::OutboxStore;

/// What happened to one record during a poll pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessOutcome {
    /// Published and marked `SENT`
    Sent,
    /// Publish failed; record returned to `PENDING` with budget remaining
    Failed,
    /// Publish failed and the retry budget is exhausted
    DeadLettered,
    /// Another worker won a guarded update; record dropped without retrying
    Skipped,
}

/// Polling relay over one outbox table.
///
/// Generic over the store and publisher so tests can substitute in-memory
/// implementations; production wiring is `PgOutboxStore` +
/// `KafkaEventPublisher`.
pub struct OutboxRelay<S: OutboxStore, P: EventPublisher> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: RelayConfig,
    metrics: Option<OutboxMetrics>,
}

impl<S: OutboxStore, P: EventPublisher> OutboxRelay<S, P> {
    /// Create a relay. Fails fast on an invalid cleanup cron expression.
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: RelayConfig) -> OutboxResult<Self> {
        config.cleanup_schedule()?;
        Ok(Self {
            store,
            publisher,
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run the poll loop until `shutdown` flips to `true` (or its sender is
    /// dropped). The record being processed when shutdown arrives is drained:
    /// its publish and status write complete before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> OutboxResult<()> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            polling_interval_ms = %self.config.polling_interval.as_millis(),
            "Outbox relay starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let span = tracing::info_span!(
                "outbox.relay.process",
                worker_id = %self.config.worker_id,
            );
            match self.poll_batch(Some(&shutdown)).instrument(span).await {
                Ok(0) => debug!("No pending records"),
                Ok(count) => info!(processed = count, "Processed outbox records"),
                Err(e) => error!(error = ?e, "Relay poll pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(worker_id = %self.config.worker_id, "Outbox relay stopped");
        Ok(())
    }

    /// Run the pruner until shutdown: on every cron fire, delete `SENT`
    /// records older than the retention window. Dead-lettered records are
    /// never pruned; they wait for an operator.
    pub async fn run_pruner(&self, mut shutdown: watch::Receiver<bool>) -> OutboxResult<()> {
        let schedule = self.config.cleanup_schedule()?;

        info!(
            cron = %self.config.cleanup_cron,
            retention_days = self.config.retention_days,
            "Outbox pruner starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(cron = %self.config.cleanup_cron, "Cron schedule has no upcoming fire time");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(next_fire = %next, "Pruner sleeping until next cron fire");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.prune_once().await {
                        Ok(deleted) => info!(deleted, "Pruned sent outbox records"),
                        Err(e) => error!(error = ?e, "Outbox prune failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Outbox pruner stopped");
        Ok(())
    }

    /// One poll pass: lease pending records and process them in `created_at`
    /// order. Returns how many records reached a new status.
    pub async fn poll_once(&self) -> OutboxResult<usize> {
        self.poll_batch(None).await
    }

    /// One prune pass. Returns rows deleted.
    pub async fn prune_once(&self) -> OutboxResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        self.store.delete_sent_before(cutoff).await
    }

    async fn poll_batch(&self, shutdown: Option<&watch::Receiver<bool>>) -> OutboxResult<usize> {
        if let Some(metrics) = &self.metrics {
            metrics.polling.inc();
        }

        let batch = self
            .store
            .lease_pending(&self.config.worker_id, self.config.batch_size)
            .await?;

        if batch.is_empty() {
            self.refresh_gauges().await;
            return Ok(0);
        }

        let mut processed = 0;
        for mut record in batch {
            // Drain semantics: finish the in-flight record, never start the
            // next one once shutdown is requested.
            if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                break;
            }

            let span = tracing::info_span!(
                "outbox.relay.process_message",
                record_id = %record.id,
                entity_type = %record.aggregate_type,
                event_type = %record.event_type,
                worker_id = %self.config.worker_id,
            );
            match self.process_record(&mut record).instrument(span).await {
                Ok(ProcessOutcome::Skipped) => {}
                Ok(_) => processed += 1,
                Err(e) => {
                    // Per-record store errors must not abort the pass.
                    error!(
                        record_id = %record.id,
                        error = ?e,
                        "Failed to process outbox record"
                    );
                }
            }
        }

        self.refresh_gauges().await;
        Ok(processed)
    }

    async fn process_record(&self, record: &mut OutboxRecord) -> OutboxResult<ProcessOutcome> {
        if !self.store.claim(record, &self.config.worker_id).await? {
            return Ok(ProcessOutcome::Skipped);
        }

        let envelope = record.envelope(&self.config.worker_id);
        let topic = topic_name(&self.config.topic_prefix, &record.aggregate_type);

        let started = Instant::now();
        let publish_result = self
            .publisher
            .publish(&topic, &record.aggregate_id, &envelope)
            .await;
        let elapsed = started.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics
                .processing_time
                .with_label_values(&[&record.aggregate_type])
                .observe(elapsed.as_secs_f64());
        }

        match publish_result {
            Ok(()) => {
                if !self.store.mark_sent(record).await? {
                    // Another worker already moved the record; delivery still
                    // happened, which at-least-once permits.
                    return Ok(ProcessOutcome::Skipped);
                }
                self.count_processed(record, OutboxStatus::Sent);
                debug!(record_id = %record.id, topic = %topic, "Record sent");
                Ok(ProcessOutcome::Sent)
            }
            Err(publish_err) => {
                warn!(
                    record_id = %record.id,
                    event_type = %record.event_type,
                    retry_count = record.retry_count,
                    error = %publish_err,
                    "Publish attempt failed"
                );

                if !self.store.mark_failed(record, &publish_err.to_string()).await? {
                    return Ok(ProcessOutcome::Skipped);
                }

                if record.status == OutboxStatus::DeadLetter {
                    self.count_processed(record, OutboxStatus::DeadLetter);
                    self.mirror_to_dead_letter(record).await;
                    Ok(ProcessOutcome::DeadLettered)
                } else {
                    self.count_processed(record, OutboxStatus::Failed);
                    Ok(ProcessOutcome::Failed)
                }
            }
        }
    }

    /// Best-effort copy of an exhausted record onto the dead-letter topic,
    /// keyed by record id. A failure here is logged, never raised; the row
    /// itself is already in `DEAD_LETTER` and safe.
    async fn mirror_to_dead_letter(&self, record: &OutboxRecord) {
        let envelope = record.envelope(&self.config.worker_id);
        let key = record.id.to_string();

        if let Err(e) = self
            .publisher
            .publish(&self.config.dead_letter_topic, &key, &envelope)
            .await
        {
            error!(
                record_id = %record.id,
                topic = %self.config.dead_letter_topic,
                error = %e,
                "Failed to mirror record to dead-letter topic"
            );
        } else {
            info!(
                record_id = %record.id,
                topic = %self.config.dead_letter_topic,
                "Record mirrored to dead-letter topic"
            );
        }
    }

    fn count_processed(&self, record: &OutboxRecord, status: OutboxStatus) {
        if let Some(metrics) = &self.metrics {
            metrics
                .processed
                .with_label_values(&[&record.aggregate_type, status.as_str()])
                .inc();
        }
    }

    async fn refresh_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        match self.store.count_by_status(OutboxStatus::Pending).await {
            Ok(pending) => metrics.pending.set(pending),
            Err(e) => debug!(error = ?e, "Failed to refresh pending gauge"),
        }
        match self.store.count_retrying().await {
            Ok(failed) => metrics.failed.set(failed),
            Err(e) => debug!(error = ?e, "Failed to refresh failed gauge"),
        }
        match self.store.count_by_status(OutboxStatus::DeadLetter).await {
            Ok(dead) => metrics.dead_letter.set(dead),
            Err(e) => debug!(error = ?e, "Failed to refresh dead-letter gauge"),
        }
    }
}

impl<S: OutboxStore + 'static, P: EventPublisher + 'static> OutboxRelay<S, P> {
    /// Spawn the poll and prune loops as background tasks. Honors
    /// `config.enabled`: when false, nothing runs and the handle is inert.
    pub fn spawn(self: Arc<Self>) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if self.config.enabled {
            let relay = Arc::clone(&self);
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = relay.run(rx).await {
                    error!(error = ?e, "Outbox relay exited with error");
                }
            }));

            let relay = self;
            tasks.push(tokio::spawn(async move {
                if let Err(e) = relay.run_pruner(shutdown_rx).await {
                    error!(error = ?e, "Outbox pruner exited with error");
                }
            }));
        } else {
            info!("Outbox relay disabled by configuration");
        }

        RelayHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle over a spawned relay. Dropping it without calling
/// [`RelayHandle::shutdown`] also stops the loops (the watch sender goes
/// away), but without waiting for the drain.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Request cooperative shutdown and wait for both loops to drain and
    /// exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
