//! AI model routing.
//!
//! Selects a model by task complexity and user tier, then executes the call
//! over a circuit-gated fallback chain with retry-with-jitter on transient
//! transport errors.

mod client;
mod router;

pub use client::{
    Completion, CompletionRequest, HttpModelClient, ModelClient, ModelEndpoint, ModelError,
};
pub use router::{
    AiRouter, ModelHealth, ModelSpec, RoutedCompletion, RouterConfig, RouterError,
    RoutingContext, RoutingDecision, TaskComplexity, UserTier,
};
