//! # Mindloom Core
//!
//! The event-driven backbone of a conversational psychology product: a
//! durable event bus with priority lanes, an at-least-once transactional
//! outbox, shared resilience primitives, and the two-phase analysis
//! pipeline feeding a versioned personality profile.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mindloom_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new(std::sync::Arc::new(MemoryTransport::new()));
//!     let _ = bus;
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

/// AI model routing with circuit-gated fallback chains
pub mod ai;

/// Two-phase analysis pipeline and record storage
pub mod analysis;

/// Coach context: dossier, corrections, check-ins
pub mod coach;

/// Environment-driven configuration
pub mod config;

/// Shared error taxonomy
pub mod error;

/// Domain event bus over a stream log
pub mod events;

/// Health check infrastructure
pub mod health;

/// Pipeline monitoring, alerting and auto-retry
pub mod monitor;

/// Transactional outbox and relay
pub mod outbox;

/// Layered personality profiles and trait evolution
pub mod profile;

/// Resilience primitives (retry, circuit breaker)
pub mod resilience;

/// Base service runtime
pub mod service;

/// Onboarding sessions and question coordination
pub mod sessions;

/// Graceful shutdown utilities
pub mod shutdown;

/// Storage contracts and schema
pub mod storage;

/// The commonly used types, one import away.
pub mod prelude {
    pub use crate::ai::{AiRouter, ModelClient, RouterConfig, RoutingContext, UserTier};
    pub use crate::analysis::{
        AnalysisInput, AnalysisPipeline, AnalysisStore, Lane, LaneStatus, SourceRef,
    };
    pub use crate::coach::{CorrectionDetector, DossierService};
    pub use crate::events::{
        EventBus, EventConsumer, EventEnvelope, EventPriority, HandlerOutcome, MemoryTransport,
        RedisTransport,
    };
    pub use crate::health::{DependencyStatus, HealthReport, OverallStatus};
    pub use crate::monitor::{AlertDispatcher, AutoRetryManager, PipelineMonitor};
    pub use crate::outbox::{OutboxCleaner, OutboxPublisher, OutboxRelay, OutboxStore};
    pub use crate::profile::{PersonalityProfile, ProfileWriter, TraitEvolutionWriter};
    pub use crate::resilience::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, RetryConfig, RetryExecutor,
    };
    pub use crate::service::{Service, ServiceHarness, ServiceState};
    pub use crate::sessions::SessionCoordinator;
    pub use crate::shutdown::GracefulShutdown;
}
