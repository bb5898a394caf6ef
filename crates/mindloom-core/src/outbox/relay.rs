//! Background relay: outbox → event bus.
//!
//! Polls for eligible PENDING rows, publishes each to the bus, and writes
//! terminal status back with compare-and-set. Safe to run in multiple
//! instances: a lost CAS means another relay already published the row, and
//! the duplicate publication is absorbed by idempotent consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::events::EventBus;
use crate::shutdown::ShutdownToken;

use super::store::{OutboxError, OutboxRow, OutboxStore};

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Max rows drained per poll.
    pub batch_size: i64,
    /// Pause between polls when the outbox is empty.
    pub poll_interval: Duration,
    /// Attempts before a row goes FAILED.
    pub max_retries: i32,
    /// Base of the exponential backoff window, in seconds.
    pub backoff_base: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_retries: 5,
            backoff_base: 2.0,
        }
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Rows published to the bus.
    pub events_published: u64,
    /// Rows moved to FAILED.
    pub events_failed: u64,
    /// Retries scheduled.
    pub total_retries: u64,
    /// Rows lost to another relay instance's CAS.
    pub races_lost: u64,
}

/// Background worker draining the outbox to the event bus.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<EventBus>,
    config: RelayConfig,
    published: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    races_lost: AtomicU64,
}

impl OutboxRelay {
    /// Create a relay over `store` and `bus`.
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<EventBus>, config: RelayConfig) -> Self {
        Self {
            store,
            bus,
            config,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            races_lost: AtomicU64::new(0),
        }
    }

    /// Counters snapshot.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            events_published: self.published.load(Ordering::Relaxed),
            events_failed: self.failed.load(Ordering::Relaxed),
            total_retries: self.retries.load(Ordering::Relaxed),
            races_lost: self.races_lost.load(Ordering::Relaxed),
        }
    }

    /// Poll until shutdown.
    pub async fn run(&self, mut token: ShutdownToken) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "outbox relay started"
        );

        while !token.is_shutdown() {
            match self.drain_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = token.cancelled() => break,
                    }
                }
                Ok(n) => {
                    tracing::debug!(batch = n, "outbox batch processed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "outbox relay poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = token.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }

    /// Drain one batch. Returns how many rows were processed. Exposed for
    /// tests and for services that drive polling themselves.
    pub async fn drain_once(&self) -> Result<usize, OutboxError> {
        let rows = self
            .store
            .fetch_eligible(
                self.config.max_retries,
                self.config.backoff_base,
                self.config.batch_size,
            )
            .await?;

        let count = rows.len();
        for row in rows {
            self.relay_row(row).await?;
        }
        Ok(count)
    }

    async fn relay_row(&self, row: OutboxRow) -> Result<(), OutboxError> {
        let publish_result = self
            .bus
            .publish(&row.event_type, row.payload.clone(), row.trace_id.clone())
            .await;

        match publish_result {
            Ok(event_id) => {
                if self.store.mark_published(row.id, row.retry_count).await? {
                    self.published.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        outbox_id = row.id,
                        event_type = %row.event_type,
                        event_id = %event_id,
                        retries = row.retry_count,
                        "outbox event published"
                    );
                } else {
                    // Another relay instance already finished this row; the
                    // duplicate publication is acceptable, losing one is not.
                    self.races_lost.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                let error = e.to_string();
                if row.retry_count + 1 >= self.config.max_retries {
                    if self.store.mark_failed(row.id, &error, row.retry_count).await? {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            outbox_id = row.id,
                            event_type = %row.event_type,
                            retries = row.retry_count + 1,
                            error = %error,
                            "outbox event moved to DLQ"
                        );
                    }
                } else if self
                    .store
                    .increment_retry(row.id, &error, row.retry_count)
                    .await?
                {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        outbox_id = row.id,
                        event_type = %row.event_type,
                        retry = row.retry_count + 1,
                        max = self.config.max_retries,
                        error = %error,
                        "outbox event retry scheduled"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::events::{BusError, BusTransport, MemoryTransport, StreamEntry};
    use crate::outbox::store::{MemoryOutboxStore, OutboxStatus};

    /// Transport that refuses appends, for DLQ paths.
    struct DownTransport;

    #[async_trait]
    impl BusTransport for DownTransport {
        async fn append(&self, _stream: &str, _body: &str) -> Result<String, BusError> {
            Err(BusError::TransportUnavailable("connection refused".into()))
        }
        async fn ensure_group(&self, _stream: &str, _group: &str) -> Result<(), BusError> {
            Ok(())
        }
        async fn read_group(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _count: usize,
        ) -> Result<Vec<StreamEntry>, BusError> {
            Ok(Vec::new())
        }
        async fn ack(&self, _stream: &str, _group: &str, _entry_id: &str) -> Result<(), BusError> {
            Ok(())
        }
        async fn claim_stale(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _min_idle: Duration,
            _count: usize,
        ) -> Result<Vec<StreamEntry>, BusError> {
            Ok(Vec::new())
        }
        async fn stream_len(&self, _stream: &str) -> Result<u64, BusError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn pending_row_is_published() {
        let store = Arc::new(MemoryOutboxStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let bus = Arc::new(EventBus::new(transport.clone()));
        let relay = OutboxRelay::new(store.clone(), bus, RelayConfig::default());

        let id = store
            .insert("user.answer.submitted", json!({"user_id": 42}), Some("t1"))
            .await
            .unwrap();

        relay.drain_once().await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Published);
        assert!(row.published_at.is_some());
        assert_eq!(transport.stream_len("events:high").await.unwrap(), 1);
        assert_eq!(relay.stats().events_published, 1);
    }

    #[tokio::test]
    async fn unreachable_bus_exhausts_into_failed() {
        let store = Arc::new(MemoryOutboxStore::new());
        let bus = Arc::new(EventBus::new(Arc::new(DownTransport)));
        let config = RelayConfig {
            max_retries: 3,
            backoff_base: 2.0,
            ..Default::default()
        };
        let relay = OutboxRelay::new(store.clone(), bus, config);

        let id = store
            .insert("session.created", json!({"session_id": 2}), None)
            .await
            .unwrap();

        // Attempt 1 and 2 increment; crossing the backoff window between
        // polls by aging the row.
        relay.drain_once().await.unwrap();
        store.age_row(id, Duration::from_secs(10));
        relay.drain_once().await.unwrap();
        store.age_row(id, Duration::from_secs(10));
        relay.drain_once().await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.retry_count, 3);
        let last_error = row.last_error.unwrap();
        assert!(last_error.contains("connection refused"));
        assert!(last_error.len() <= 500);
        assert_eq!(relay.stats().events_failed, 1);
    }

    #[tokio::test]
    async fn failed_rows_are_not_reprocessed() {
        let store = Arc::new(MemoryOutboxStore::new());
        let bus = Arc::new(EventBus::new(Arc::new(DownTransport)));
        let config = RelayConfig {
            max_retries: 1,
            ..Default::default()
        };
        let relay = OutboxRelay::new(store.clone(), bus, config);

        store.insert("session.created", json!({}), None).await.unwrap();
        relay.drain_once().await.unwrap();
        assert_eq!(relay.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryOutboxStore::new());
        let bus = Arc::new(EventBus::new(Arc::new(MemoryTransport::new())));
        let relay = Arc::new(OutboxRelay::new(store, bus, RelayConfig::default()));

        let shutdown = crate::shutdown::GracefulShutdown::new();
        let token = shutdown.token();
        let relay_clone = relay.clone();
        let handle = tokio::spawn(async move { relay_clone.run(token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay did not stop")
            .unwrap();
    }
}
