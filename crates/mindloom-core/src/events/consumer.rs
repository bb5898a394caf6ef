//! Consumer groups with explicit ACK, reclaim and dead-lettering.
//!
//! A consumer is identified by `(group, consumer_name)`. Handlers must be
//! idempotent keyed by `event_id`: entries left un-ACKed are re-delivered
//! to another consumer in the group once their pending age crosses the
//! reclaim threshold, and an entry can therefore be seen more than once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::bus::EventBus;
use super::envelope::{decode_envelope, EventEnvelope, EventPriority, CURRENT_SCHEMA_VERSION};
use super::transport::StreamEntry;
use crate::shutdown::ShutdownToken;

/// What a handler wants done with a delivered envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Done; acknowledge the entry.
    Ack,
    /// Not acknowledged; the entry will be reclaimed and re-delivered.
    Retry,
    /// Give up; move the envelope to the DLQ with this reason.
    Fail(String),
}

/// An event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one envelope. Must be idempotent keyed by
    /// [`EventEnvelope::event_id`].
    async fn handle(&self, envelope: &EventEnvelope) -> HandlerOutcome;
}

/// A closure-backed handler, for services that don't need a named type.
pub struct FnHandler<F>(F);

/// Wrap a closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerOutcome> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, envelope: &EventEnvelope) -> HandlerOutcome {
        (self.0)(envelope.clone()).await
    }
}

/// Configuration for an [`EventConsumer`].
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Consumer group, one per logical service.
    pub group: String,
    /// Consumer name within the group, numbered by replica.
    pub consumer_name: String,
    /// Event types this consumer handles. Others are ACKed and skipped.
    pub event_types: Vec<String>,
    /// Priority lanes to poll, highest first.
    pub lanes: Vec<EventPriority>,
    /// Max entries pulled per lane per iteration.
    pub batch_size: usize,
    /// Sleep between iterations when no work arrived.
    pub idle_sleep: Duration,
    /// Pending entries older than this are reclaimed for re-delivery.
    pub reclaim_threshold: Duration,
    /// Entries delivered more than this many times go to the DLQ.
    pub max_redeliveries: u32,
    /// Schema versions understood per event type. Types not listed accept
    /// only [`CURRENT_SCHEMA_VERSION`].
    pub supported_versions: HashMap<String, Vec<u32>>,
}

impl ConsumerConfig {
    /// Config for `group` handling `event_types` on all lanes.
    pub fn new(group: impl Into<String>, event_types: Vec<String>) -> Self {
        let group = group.into();
        Self {
            consumer_name: format!("{group}_1"),
            group,
            event_types,
            lanes: EventPriority::ALL.to_vec(),
            batch_size: 32,
            idle_sleep: Duration::from_millis(200),
            reclaim_threshold: Duration::from_secs(60),
            max_redeliveries: 3,
            supported_versions: HashMap::new(),
        }
    }

    /// Name this replica within the group.
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    /// Restrict the polled lanes.
    pub fn with_lanes(mut self, lanes: Vec<EventPriority>) -> Self {
        self.lanes = lanes;
        self
    }

    /// Set the reclaim threshold.
    pub fn with_reclaim_threshold(mut self, threshold: Duration) -> Self {
        self.reclaim_threshold = threshold;
        self
    }

    /// Set the redelivery cap.
    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    /// Declare the schema versions understood for an event type.
    pub fn with_supported_versions(mut self, event_type: impl Into<String>, versions: Vec<u32>) -> Self {
        self.supported_versions.insert(event_type.into(), versions);
        self
    }

    fn version_supported(&self, event_type: &str, version: u32) -> bool {
        match self.supported_versions.get(event_type) {
            Some(versions) => versions.contains(&version),
            None => version == CURRENT_SCHEMA_VERSION,
        }
    }
}

/// Per-consumer counters.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    /// Envelopes handed to the handler.
    pub processed: u64,
    /// Entries acknowledged.
    pub acked: u64,
    /// Entries left for re-delivery.
    pub retried: u64,
    /// Envelopes moved to the DLQ.
    pub dead_lettered: u64,
    /// Entries reclaimed from other consumers.
    pub reclaimed: u64,
}

/// A consumer-group worker polling one or more priority lanes.
pub struct EventConsumer {
    bus: Arc<EventBus>,
    config: ConsumerConfig,
    handler: Arc<dyn EventHandler>,
    processed: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    reclaimed: AtomicU64,
}

impl EventConsumer {
    /// Create a consumer. Call [`EventConsumer::run`] to start polling.
    pub fn new(bus: Arc<EventBus>, config: ConsumerConfig, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            bus,
            config,
            handler,
            processed: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// The consumer group name.
    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// Counters snapshot.
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Poll until shutdown. Stops pulling new entries as soon as the token
    /// fires; in-flight handlers finish their current envelope.
    pub async fn run(&self, mut token: ShutdownToken) {
        for lane in &self.config.lanes {
            let stream = self.bus.stream_for(*lane);
            if let Err(e) = self
                .bus
                .transport()
                .ensure_group(&stream, &self.config.group)
                .await
            {
                tracing::error!(group = %self.config.group, stream = %stream, error = %e, "failed to create consumer group");
            }
        }

        tracing::info!(
            group = %self.config.group,
            consumer = %self.config.consumer_name,
            event_types = ?self.config.event_types,
            "consumer started"
        );

        while !token.is_shutdown() {
            match self.poll_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_sleep) => {}
                        _ = token.cancelled() => break,
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(group = %self.config.group, error = %e, "consumer poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = token.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!(group = %self.config.group, "consumer stopped");
    }

    /// One polling pass over all lanes. Returns how many entries were seen.
    /// Exposed for tests and for services that drive polling themselves.
    pub async fn poll_once(&self) -> Result<usize, super::transport::BusError> {
        let mut seen = 0usize;

        for lane in &self.config.lanes {
            let stream = self.bus.stream_for(*lane);
            let transport = self.bus.transport();

            let fresh = transport
                .read_group(
                    &stream,
                    &self.config.group,
                    &self.config.consumer_name,
                    self.config.batch_size,
                )
                .await?;
            for entry in fresh {
                seen += 1;
                self.process_entry(&stream, entry).await?;
            }

            let stale = transport
                .claim_stale(
                    &stream,
                    &self.config.group,
                    &self.config.consumer_name,
                    self.config.reclaim_threshold,
                    self.config.batch_size,
                )
                .await?;
            for entry in stale {
                seen += 1;
                self.reclaimed.fetch_add(1, Ordering::Relaxed);
                if entry.delivery_count > self.config.max_redeliveries {
                    self.dead_letter(&stream, &entry, "max_redeliveries_exceeded")
                        .await?;
                } else {
                    self.process_entry(&stream, entry).await?;
                }
            }
        }
        Ok(seen)
    }

    async fn process_entry(
        &self,
        stream: &str,
        entry: StreamEntry,
    ) -> Result<(), super::transport::BusError> {
        let envelope = match decode_envelope(&entry.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(stream, entry_id = %entry.id, error = %e, "undecodable envelope");
                return self.dead_letter(stream, &entry, "invalid_envelope").await;
            }
        };

        // Not ours: ack so the group's pending list stays clean.
        if !self.config.event_types.is_empty()
            && !self.config.event_types.contains(&envelope.event_type)
        {
            return self.ack_entry(stream, &entry).await;
        }

        if !self
            .config
            .version_supported(&envelope.event_type, envelope.schema_version)
        {
            tracing::warn!(
                event_type = %envelope.event_type,
                schema_version = envelope.schema_version,
                "unsupported schema version"
            );
            return self.dead_letter(stream, &entry, "schema_mismatch").await;
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        match self.handler.handle(&envelope).await {
            HandlerOutcome::Ack => self.ack_entry(stream, &entry).await,
            HandlerOutcome::Retry => {
                self.retried.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    "handler requested retry, leaving entry pending"
                );
                Ok(())
            }
            HandlerOutcome::Fail(reason) => {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    reason = %reason,
                    "handler failed envelope"
                );
                self.dead_letter(stream, &entry, &reason).await
            }
        }
    }

    async fn ack_entry(
        &self,
        stream: &str,
        entry: &StreamEntry,
    ) -> Result<(), super::transport::BusError> {
        self.bus
            .transport()
            .ack(stream, &self.config.group, &entry.id)
            .await?;
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn dead_letter(
        &self,
        stream: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<(), super::transport::BusError> {
        self.bus.send_to_dlq(stream, &entry.body, reason).await?;
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.ack_entry(stream, entry).await
    }
}
