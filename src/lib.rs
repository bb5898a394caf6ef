//! # Mindloom
//!
//! **Event-driven backbone for a conversational psychology product**
//!
//! Mindloom is the messaging and resilience substrate behind a fleet of
//! loosely coupled services: a durable event bus over priority streams, an
//! at-least-once transactional outbox, circuit breakers and jittered
//! retries shared by every service, and a two-phase analysis pipeline
//! feeding a versioned personality profile.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! mindloom = "0.3"
//! ```
//!
//! ## What's Included
//!
//! - **Event Bus** - Priority-lane Redis Streams with consumer groups,
//!   explicit ACK and a dead-letter queue
//! - **Transactional Outbox** - "commit business row + publish event"
//!   made atomic, drained by a background relay with backoff
//! - **Resilience** - Circuit breakers with geometric timeout growth and
//!   retry with exponential backoff and jitter
//! - **Analysis Pipeline** - Instant phase (<500 ms) plus a deep phase
//!   that extracts traits and drives the profile write path
//! - **AI Router** - Complexity- and tier-aware model selection with
//!   circuit-gated fallback chains
//! - **Pipeline Monitor** - Stuck-task, slow-path and failure-rate
//!   detection with grouped, rate-limited alerts and auto-retry
//!
//! ## Example
//!
//! ```rust,ignore
//! use mindloom::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new(Arc::new(MemoryTransport::new()));
//!     bus.publish("user.answer.submitted", payload, None)
//!         .await
//!         .unwrap();
//! }
//! ```

// Re-export everything from mindloom-core
pub use mindloom_core::*;
