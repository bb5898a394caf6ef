//! Canonical event envelope and wire codec.
//!
//! In memory an envelope always carries a structured payload. On the wire
//! the payload is JSON unless its serialized size crosses the compression
//! threshold, in which case it travels as a base64-wrapped zlib blob tagged
//! `compression = "zlib"`. Consumers decompress transparently; the in-memory
//! envelope never exposes the compressed form.

use std::io::{Read, Write};

use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression as ZlibLevel;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version stamped on envelopes produced by this crate.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Upper bound on a decompressed payload, guards against zlib bombs.
const MAX_DECOMPRESSED_BYTES: usize = 10 * 1024 * 1024;

/// Priority lane an envelope is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Process immediately.
    Critical,
    /// Important event.
    High,
    /// Ordinary event.
    Normal,
    /// Background noise.
    Low,
}

impl EventPriority {
    /// All lanes, highest first. Consumers poll in this order.
    pub const ALL: [EventPriority; 4] = [
        EventPriority::Critical,
        EventPriority::High,
        EventPriority::Normal,
        EventPriority::Low,
    ];

    /// Lane suffix used in stream names.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Critical => "critical",
            EventPriority::High => "high",
            EventPriority::Normal => "normal",
            EventPriority::Low => "low",
        }
    }
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Opaque unique id; consumers key idempotence on it.
    pub event_id: String,
    /// Dotted event type, e.g. `user.answer.submitted`.
    pub event_type: String,
    /// Schema version of the payload.
    pub schema_version: u32,
    /// Priority lane.
    pub priority: EventPriority,
    /// Distributed-tracing id, if the producer had one.
    pub trace_id: Option<String>,
    /// Production timestamp (UTC).
    pub produced_at: DateTime<Utc>,
    /// Structured payload, always decompressed in memory.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build an envelope with a fresh event id and the current schema
    /// version.
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        priority: EventPriority,
        trace_id: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            schema_version: CURRENT_SCHEMA_VERSION,
            priority,
            trace_id,
            produced_at: Utc::now(),
            payload,
        }
    }
}

/// Wire-level compression tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum Compression {
    #[default]
    None,
    Zlib,
}

/// The bit-level stable wire form.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    event_id: String,
    event_type: String,
    schema_version: u32,
    priority: EventPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    produced_at: DateTime<Utc>,
    #[serde(default)]
    compression: Compression,
    payload: serde_json::Value,
}

/// Errors from encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The envelope or payload could not be (de)serialized.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    /// The payload exceeds the size limit even after compression.
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge {
        /// Compressed size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Encode an envelope to its wire form.
///
/// Payloads whose JSON exceeds `compression_threshold` bytes are stored
/// zlib-compressed. Returns [`CodecError::PayloadTooLarge`] when even the
/// compressed form exceeds `max_payload_bytes`.
pub fn encode_envelope(
    envelope: &EventEnvelope,
    compression_threshold: usize,
    max_payload_bytes: usize,
) -> Result<String, CodecError> {
    let payload_json = serde_json::to_vec(&envelope.payload)
        .map_err(|e| CodecError::InvalidEnvelope(e.to_string()))?;

    let (compression, payload) = if payload_json.len() > compression_threshold {
        let mut encoder = ZlibEncoder::new(Vec::new(), ZlibLevel::default());
        encoder
            .write_all(&payload_json)
            .and_then(|_| encoder.finish())
            .map(|compressed| {
                let encoded = base64::engine::general_purpose::STANDARD.encode(compressed);
                (Compression::Zlib, serde_json::Value::String(encoded))
            })
            .map_err(|e| CodecError::InvalidEnvelope(e.to_string()))?
    } else {
        (Compression::None, envelope.payload.clone())
    };

    if let serde_json::Value::String(ref blob) = payload {
        if compression == Compression::Zlib && blob.len() > max_payload_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: blob.len(),
                limit: max_payload_bytes,
            });
        }
    }
    if compression == Compression::None && payload_json.len() > max_payload_bytes {
        return Err(CodecError::PayloadTooLarge {
            size: payload_json.len(),
            limit: max_payload_bytes,
        });
    }

    let wire = WireEnvelope {
        event_id: envelope.event_id.clone(),
        event_type: envelope.event_type.clone(),
        schema_version: envelope.schema_version,
        priority: envelope.priority,
        trace_id: envelope.trace_id.clone(),
        produced_at: envelope.produced_at,
        compression,
        payload,
    };

    serde_json::to_string(&wire).map_err(|e| CodecError::InvalidEnvelope(e.to_string()))
}

/// Decode a wire-form envelope, transparently decompressing the payload.
pub fn decode_envelope(wire: &str) -> Result<EventEnvelope, CodecError> {
    let wire: WireEnvelope =
        serde_json::from_str(wire).map_err(|e| CodecError::InvalidEnvelope(e.to_string()))?;

    let payload = match wire.compression {
        Compression::None => wire.payload,
        Compression::Zlib => {
            let blob = wire.payload.as_str().ok_or_else(|| {
                CodecError::InvalidEnvelope("zlib payload must be a base64 string".into())
            })?;
            let compressed = base64::engine::general_purpose::STANDARD
                .decode(blob)
                .map_err(|e| CodecError::InvalidEnvelope(format!("bad base64: {e}")))?;

            let mut decoder = ZlibDecoder::new(&compressed[..]).take(MAX_DECOMPRESSED_BYTES as u64);
            let mut buf = Vec::new();
            decoder
                .read_to_end(&mut buf)
                .map_err(|e| CodecError::InvalidEnvelope(format!("zlib: {e}")))?;

            serde_json::from_slice(&buf)
                .map_err(|e| CodecError::InvalidEnvelope(format!("payload json: {e}")))?
        }
    };

    Ok(EventEnvelope {
        event_id: wire.event_id,
        event_type: wire.event_type,
        schema_version: wire.schema_version,
        priority: wire.priority,
        trace_id: wire.trace_id,
        produced_at: wire.produced_at,
        payload,
    })
}
