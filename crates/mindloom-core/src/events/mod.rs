//! Domain event bus over a stream log.
//!
//! Four priority lanes (`events:critical` … `events:low`), consumer groups
//! with explicit ACK, idle-entry reclaim, a dead-letter stream, and a wire
//! codec that zlib-compresses large payloads.
//!
//! ```rust,ignore
//! use mindloom_core::events::{EventBus, MemoryTransport};
//!
//! let bus = EventBus::new(Arc::new(MemoryTransport::new()));
//! bus.publish("user.answer.submitted", payload, Some(trace_id)).await?;
//! ```

pub mod catalog;
mod bus;
mod consumer;
mod envelope;
mod redis_transport;
mod transport;

pub use bus::{BusConfig, EventBus, DLQ_STREAM};
pub use consumer::{
    handler_fn, ConsumerConfig, ConsumerStats, EventConsumer, EventHandler, FnHandler,
    HandlerOutcome,
};
pub use envelope::{
    decode_envelope, encode_envelope, CodecError, EventEnvelope, EventPriority,
    CURRENT_SCHEMA_VERSION,
};
pub use redis_transport::RedisTransport;
pub use transport::{BusError, BusTransport, MemoryTransport, StreamEntry};
