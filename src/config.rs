//! Relay configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};

/// Tunables for the relay engine. `Default` carries the documented defaults;
/// [`RelayConfig::from_env`] overlays `OUTBOX_RELAY_*` environment variables,
/// ignoring unparseable values.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Master switch; when false the relay does not run
    pub enabled: bool,
    /// Max records leased per poll pass
    pub batch_size: i64,
    /// Delay between poll passes
    pub polling_interval: Duration,
    /// Stable identity of this worker; two workers must never share one
    pub worker_id: String,
    /// Envelope topic prefix (`<prefix>.<lowercase(aggregate_type)>`)
    pub topic_prefix: String,
    /// Topic receiving envelopes of dead-lettered records, keyed by record id
    pub dead_letter_topic: String,
    /// Prune schedule, cron expression (seconds field included)
    pub cleanup_cron: String,
    /// Age threshold for pruning `SENT` records
    pub retention_days: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            polling_interval: Duration::from_millis(5000),
            worker_id: Uuid::new_v4().to_string(),
            topic_prefix: "outbox.events".to_string(),
            dead_letter_topic: "outbox.dead-letter".to_string(),
            // Daily at 02:00
            cleanup_cron: "0 0 2 * * *".to_string(),
            retention_days: 30,
        }
    }
}

impl RelayConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// `OUTBOX_RELAY_ENABLED`, `OUTBOX_RELAY_BATCH_SIZE`,
    /// `OUTBOX_RELAY_POLLING_INTERVAL_MS`, `OUTBOX_RELAY_WORKER_ID`,
    /// `OUTBOX_RELAY_KAFKA_TOPIC_PREFIX`,
    /// `OUTBOX_RELAY_KAFKA_DEAD_LETTER_TOPIC`, `OUTBOX_RELAY_CLEANUP_CRON`,
    /// `OUTBOX_RELAY_CLEANUP_RETENTION_DAYS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = env::var("OUTBOX_RELAY_ENABLED")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(defaults.enabled);

        let batch_size = env::var("OUTBOX_RELAY_BATCH_SIZE")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.batch_size);

        let polling_interval = env::var("OUTBOX_RELAY_POLLING_INTERVAL_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.polling_interval);

        let worker_id = env::var("OUTBOX_RELAY_WORKER_ID")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.worker_id);

        let topic_prefix = env::var("OUTBOX_RELAY_KAFKA_TOPIC_PREFIX")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.topic_prefix);

        let dead_letter_topic = env::var("OUTBOX_RELAY_KAFKA_DEAD_LETTER_TOPIC")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.dead_letter_topic);

        let cleanup_cron = env::var("OUTBOX_RELAY_CLEANUP_CRON")
            .ok()
            .filter(|v| Schedule::from_str(v).is_ok())
            .unwrap_or(defaults.cleanup_cron);

        let retention_days = env::var("OUTBOX_RELAY_CLEANUP_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v >= 0)
            .unwrap_or(defaults.retention_days);

        Self {
            enabled,
            batch_size,
            polling_interval,
            worker_id,
            topic_prefix,
            dead_letter_topic,
            cleanup_cron,
            retention_days,
        }
    }

    /// Parsed prune schedule.
    pub fn cleanup_schedule(&self) -> OutboxResult<Schedule> {
        Schedule::from_str(&self.cleanup_cron)
            .map_err(|e| OutboxError::Config(format!("invalid cleanup cron expression: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = RelayConfig::default();

        assert!(config.enabled);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.polling_interval, Duration::from_millis(5000));
        assert_eq!(config.topic_prefix, "outbox.events");
        assert_eq!(config.dead_letter_topic, "outbox.dead-letter");
        assert_eq!(config.retention_days, 30);
        assert!(config.cleanup_schedule().is_ok());
        assert!(!config.worker_id.is_empty());
    }

    #[test]
    fn default_worker_ids_are_unique() {
        assert_ne!(
            RelayConfig::default().worker_id,
            RelayConfig::default().worker_id
        );
    }
}
