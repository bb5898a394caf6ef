//! The event bus: priority-lane publish over a stream transport.
//!
//! The bus is a library, not a queue: publish either lands the envelope in
//! the target stream or returns an error, fail-fast. Delivery guarantees
//! live on the consumer side (explicit ACK, reclaim, DLQ).

use std::sync::Arc;

use super::catalog::default_priority;
use super::envelope::{encode_envelope, CodecError, EventEnvelope, EventPriority};
use super::transport::{BusError, BusTransport};

/// Stream name of the dead-letter queue.
pub const DLQ_STREAM: &str = "events:dlq";

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Prefix of the physical stream names.
    pub stream_prefix: String,
    /// Serialized payloads above this many bytes are zlib-compressed.
    pub compression_threshold: usize,
    /// Hard cap on the (possibly compressed) payload size.
    pub max_payload_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "events".to_string(),
            compression_threshold: 8 * 1024,
            max_payload_bytes: 512 * 1024,
        }
    }
}

/// Event bus over a [`BusTransport`].
pub struct EventBus {
    transport: Arc<dyn BusTransport>,
    config: BusConfig,
}

impl EventBus {
    /// Create a bus with default configuration.
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self::with_config(transport, BusConfig::default())
    }

    /// Create a bus with explicit configuration.
    pub fn with_config(transport: Arc<dyn BusTransport>, config: BusConfig) -> Self {
        Self { transport, config }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn BusTransport> {
        &self.transport
    }

    /// The bus configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Physical stream name for a priority lane.
    pub fn stream_for(&self, priority: EventPriority) -> String {
        format!("{}:{}", self.config.stream_prefix, priority.as_str())
    }

    /// Publish an event with the catalog's default priority for its type.
    ///
    /// Returns the envelope's event id on success.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        trace_id: Option<String>,
    ) -> Result<String, BusError> {
        self.publish_with_priority(event_type, payload, default_priority(event_type), trace_id)
            .await
    }

    /// Publish an event to an explicit priority lane.
    pub async fn publish_with_priority(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        priority: EventPriority,
        trace_id: Option<String>,
    ) -> Result<String, BusError> {
        let envelope = EventEnvelope::new(event_type, payload, priority, trace_id);
        self.publish_envelope(&envelope).await
    }

    /// Publish a prebuilt envelope.
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<String, BusError> {
        let wire = encode_envelope(
            envelope,
            self.config.compression_threshold,
            self.config.max_payload_bytes,
        )
        .map_err(|e| match e {
            CodecError::PayloadTooLarge { size, limit } => BusError::PayloadTooLarge { size, limit },
            CodecError::InvalidEnvelope(msg) => BusError::InvalidEnvelope(msg),
        })?;

        let stream = self.stream_for(envelope.priority);
        let entry_id = self.transport.append(&stream, &wire).await?;

        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            stream = %stream,
            entry_id = %entry_id,
            trace_id = envelope.trace_id.as_deref().unwrap_or(""),
            "event published"
        );
        Ok(envelope.event_id.clone())
    }

    /// Move an envelope to the DLQ with a failure reason.
    pub async fn send_to_dlq(
        &self,
        original_stream: &str,
        wire_body: &str,
        reason: &str,
    ) -> Result<(), BusError> {
        let record = serde_json::json!({
            "original_stream": original_stream,
            "reason": reason,
            "failed_at": chrono::Utc::now(),
            "envelope": wire_body,
        });
        self.transport
            .append(DLQ_STREAM, &record.to_string())
            .await?;
        tracing::warn!(stream = original_stream, reason, "envelope moved to DLQ");
        Ok(())
    }

    /// Depth of the DLQ stream.
    pub async fn dlq_len(&self) -> Result<u64, BusError> {
        self.transport.stream_len(DLQ_STREAM).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::transport::MemoryTransport;

    fn bus() -> (Arc<MemoryTransport>, EventBus) {
        let transport = Arc::new(MemoryTransport::new());
        let bus = EventBus::new(transport.clone());
        (transport, bus)
    }

    #[tokio::test]
    async fn publish_lands_in_priority_stream() {
        let (transport, bus) = bus();

        bus.publish_with_priority(
            "user.answer.submitted",
            json!({"user_id": 42}),
            EventPriority::High,
            None,
        )
        .await
        .unwrap();

        assert_eq!(transport.stream_len("events:high").await.unwrap(), 1);
        assert_eq!(transport.stream_len("events:normal").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn publish_uses_catalog_default_priority() {
        let (transport, bus) = bus();

        bus.publish("insight.generated", json!({"user_id": 1}), None)
            .await
            .unwrap();

        assert_eq!(transport.stream_len("events:low").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let config = BusConfig {
            compression_threshold: 8,
            max_payload_bytes: 16,
            ..Default::default()
        };
        let bus = EventBus::with_config(transport, config);

        let blob: String = (0..512u32).map(|i| format!("{i:x}")).collect();
        let err = bus
            .publish("session.created", json!({ "blob": blob }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn dlq_records_reason() {
        let (transport, bus) = bus();
        bus.send_to_dlq("events:high", "{}", "schema_mismatch")
            .await
            .unwrap();

        assert_eq!(bus.dlq_len().await.unwrap(), 1);
        assert_eq!(transport.stream_len(DLQ_STREAM).await.unwrap(), 1);
    }
}
