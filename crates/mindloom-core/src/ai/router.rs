//! AI request routing.
//!
//! Routes every model call by inferred task complexity and user tier, then
//! executes it over a circuit-gated fallback chain: each candidate has its
//! own breaker, open candidates are skipped, and every attempt is wrapped
//! in retry-with-jitter over transient transport errors.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, RetryConfig,
};

use super::client::{Completion, CompletionRequest, ModelClient, ModelError};

/// Inferred complexity of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskComplexity {
    /// Validation, classification, short inputs.
    Simple,
    /// Chat, mood, coaching.
    Daily,
    /// Psychological analysis, long inputs, onboarding.
    Deep,
}

/// Subscription tier of the requesting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTier {
    /// Free tier; deep and daily work is downgraded.
    Free,
    /// Paid tier.
    Premium,
    /// Paid tier with the same routing as premium.
    Professional,
}

impl UserTier {
    fn is_premium(self) -> bool {
        !matches!(self, UserTier::Free)
    }
}

/// Context hints that can override the inferred complexity.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Onboarding flows always get deep analysis.
    pub is_onboarding: bool,
    /// Deep-assessment questionnaires always get deep analysis.
    pub deep_assessment: bool,
    /// Daily check-ins never need more than the daily tier.
    pub daily_checkin: bool,
}

/// A routing decision.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Chosen model name.
    pub model: String,
    /// Human-readable reasoning for the decision.
    pub reasoning: String,
    /// Estimated cost of the request.
    pub estimated_cost: f64,
    /// Inferred complexity.
    pub complexity: TaskComplexity,
    /// True when a free-tier user was routed below the complexity's model.
    pub downgraded: bool,
}

/// One model known to the router.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Model name used with the client.
    pub name: String,
    /// Estimated cost per request, for budgeting metrics.
    pub cost_per_request: f64,
    /// Ordered fallback candidates, tried after the model itself.
    pub fallbacks: Vec<String>,
}

/// Router configuration: the three-tier model table plus fallback chains.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Model for SIMPLE work and free-tier downgrades.
    pub cheap_small: ModelSpec,
    /// Model for DAILY work.
    pub mid: ModelSpec,
    /// Model for DEEP work.
    pub frontier: ModelSpec,
    /// Retry budget per candidate over transient errors.
    pub retry: RetryConfig,
    /// Breaker defaults for model circuits.
    pub breaker: CircuitBreakerConfig,
    /// Rolling window used for the per-model health rollup.
    pub health_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cheap_small: ModelSpec {
                name: "gpt-4o-mini".into(),
                cost_per_request: 0.002,
                fallbacks: vec![],
            },
            mid: ModelSpec {
                name: "gpt-4o".into(),
                cost_per_request: 0.02,
                fallbacks: vec!["gpt-4o-mini".into()],
            },
            frontier: ModelSpec {
                name: "claude-sonnet".into(),
                cost_per_request: 0.05,
                fallbacks: vec!["gpt-4o".into(), "gpt-4o-mini".into()],
            },
            retry: RetryConfig::new(3)
                .with_base_delay(std::time::Duration::from_millis(500))
                .with_max_delay(std::time::Duration::from_secs(8)),
            breaker: CircuitBreakerConfig::default(),
            health_window: 20,
        }
    }
}

impl RouterConfig {
    fn spec(&self, model: &str) -> Option<&ModelSpec> {
        [&self.cheap_small, &self.mid, &self.frontier]
            .into_iter()
            .find(|spec| spec.name == model)
    }
}

/// Rollup of one model's recent behavior.
#[derive(Debug, Clone)]
pub struct ModelHealth {
    /// Model name.
    pub model: String,
    /// Total calls routed to this model.
    pub calls: u64,
    /// Failed calls.
    pub failures: u64,
    /// Success rate over the rolling window (1.0 when unused).
    pub recent_success_rate: f64,
    /// Mean latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Cost accumulated so far.
    pub total_cost: f64,
}

#[derive(Default)]
struct ModelMetrics {
    calls: u64,
    failures: u64,
    total_latency_ms: u64,
    total_cost: f64,
    input_tokens: u64,
    output_tokens: u64,
    recent: VecDeque<bool>,
}

/// Errors surfaced by the router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Every candidate in the fallback chain had an open circuit.
    #[error("no model available: all candidates have open circuits ({chain:?})")]
    NoModelAvailable {
        /// The chain that was exhausted.
        chain: Vec<String>,
    },
    /// A candidate accepted the call but it failed after retries, and no
    /// later candidate succeeded.
    #[error("model call failed after fallbacks: {0}")]
    CallFailed(#[from] ModelError),
}

/// A routed, completed model call.
#[derive(Debug)]
pub struct RoutedCompletion {
    /// The reply.
    pub completion: Completion,
    /// Which model actually answered (may be a fallback).
    pub model: String,
    /// The decision that started the call.
    pub decision: RoutingDecision,
    /// Wall time of the successful attempt.
    pub latency: std::time::Duration,
}

/// The AI router.
pub struct AiRouter {
    config: RouterConfig,
    client: Arc<dyn ModelClient>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: DashMap<String, Mutex<ModelMetrics>>,
}

const SIMPLE_KEYWORDS: &[&str] = &[
    "validate", "check", "categorize", "tag", "classify", "yes/no", "true/false", "quick",
    "simple",
];

const DEEP_KEYWORDS: &[&str] = &[
    "analyze personality",
    "psychological",
    "deep analysis",
    "personality assessment",
    "psychological profile",
    "complex analysis",
    "strategic",
    "life planning",
];

const DAILY_KEYWORDS: &[&str] = &[
    "chat",
    "daily",
    "mood",
    "feeling",
    "emotional",
    "advice",
    "coaching",
    "journal",
    "reflection",
];

impl AiRouter {
    /// Create a router over `client`, with its own breaker per model.
    pub fn new(
        config: RouterConfig,
        client: Arc<dyn ModelClient>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            config,
            client,
            breakers,
            metrics: DashMap::new(),
        }
    }

    /// Infer task complexity from the text, falling back to length, then
    /// applying context overrides.
    pub fn assess_complexity(
        &self,
        task_description: &str,
        message_content: &str,
        context: &RoutingContext,
    ) -> TaskComplexity {
        // Context overrides win outright.
        if context.is_onboarding || context.deep_assessment {
            return TaskComplexity::Deep;
        }
        if context.daily_checkin {
            return TaskComplexity::Daily;
        }

        let full_text = format!("{task_description} {message_content}").to_lowercase();

        if DEEP_KEYWORDS.iter().any(|k| full_text.contains(k)) {
            return TaskComplexity::Deep;
        }
        if SIMPLE_KEYWORDS.iter().any(|k| full_text.contains(k)) {
            return TaskComplexity::Simple;
        }
        if DAILY_KEYWORDS.iter().any(|k| full_text.contains(k)) {
            return TaskComplexity::Daily;
        }

        match message_content.chars().count() {
            0..=49 => TaskComplexity::Simple,
            50..=300 => TaskComplexity::Daily,
            _ => TaskComplexity::Deep,
        }
    }

    /// Route a request to a model by complexity and tier.
    pub fn route_request(
        &self,
        tier: UserTier,
        task_description: &str,
        message_content: &str,
        context: &RoutingContext,
    ) -> RoutingDecision {
        let complexity = self.assess_complexity(task_description, message_content, context);
        let (spec, downgraded) = self.select_model(complexity, tier);

        let base_reason = match complexity {
            TaskComplexity::Simple => "Simple validation/categorization task",
            TaskComplexity::Daily => "Daily interaction requiring conversational AI",
            TaskComplexity::Deep => "Complex psychological analysis requiring advanced reasoning",
        };
        let tier_suffix = if downgraded {
            " (downgraded for free tier)"
        } else {
            ""
        };

        RoutingDecision {
            model: spec.name.clone(),
            reasoning: format!("{base_reason}{tier_suffix}. Using {}.", spec.name),
            estimated_cost: spec.cost_per_request,
            complexity,
            downgraded,
        }
    }

    fn select_model(&self, complexity: TaskComplexity, tier: UserTier) -> (&ModelSpec, bool) {
        if !tier.is_premium() {
            return match complexity {
                TaskComplexity::Deep => (&self.config.mid, true),
                TaskComplexity::Daily => (&self.config.cheap_small, true),
                TaskComplexity::Simple => (&self.config.cheap_small, false),
            };
        }
        match complexity {
            TaskComplexity::Simple => (&self.config.cheap_small, false),
            TaskComplexity::Daily => (&self.config.mid, false),
            TaskComplexity::Deep => (&self.config.frontier, false),
        }
    }

    /// Route and execute a completion over the fallback chain.
    pub async fn complete(
        &self,
        tier: UserTier,
        task_description: &str,
        request: CompletionRequest,
        context: &RoutingContext,
    ) -> Result<RoutedCompletion, RouterError> {
        let decision = self.route_request(tier, task_description, &request.prompt, context);
        self.complete_with_decision(decision, request).await
    }

    /// Execute a completion for an already-made decision.
    pub async fn complete_with_decision(
        &self,
        decision: RoutingDecision,
        request: CompletionRequest,
    ) -> Result<RoutedCompletion, RouterError> {
        let mut chain = vec![decision.model.clone()];
        if let Some(spec) = self.config.spec(&decision.model) {
            chain.extend(spec.fallbacks.iter().cloned());
        }

        let mut last_error: Option<ModelError> = None;
        let mut any_admitted = false;

        for candidate in &chain {
            match self.try_candidate(candidate, &request).await {
                CandidateOutcome::Success { completion, latency } => {
                    tracing::info!(
                        model = %candidate,
                        requested = %decision.model,
                        latency_ms = latency.as_millis() as u64,
                        "model call succeeded"
                    );
                    return Ok(RoutedCompletion {
                        completion,
                        model: candidate.clone(),
                        decision,
                        latency,
                    });
                }
                CandidateOutcome::CircuitOpen => {
                    tracing::debug!(model = %candidate, "candidate skipped, circuit open");
                }
                CandidateOutcome::Failed(error) => {
                    any_admitted = true;
                    tracing::warn!(model = %candidate, error = %error, "candidate failed, trying next");
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) if any_admitted => Err(RouterError::CallFailed(error)),
            _ => Err(RouterError::NoModelAvailable { chain }),
        }
    }

    async fn try_candidate(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> CandidateOutcome {
        let breaker = self
            .breakers
            .get(&format!("model:{model}"))
            .unwrap_or_else(|| {
                let name = format!("model:{model}");
                self.breakers
                    .register(&name, self.config.breaker.clone())
            });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let start = Instant::now();

            let result = breaker
                .call(|| self.client.complete(model, request))
                .await;

            match result {
                Ok(completion) => {
                    let latency = start.elapsed();
                    self.record_outcome(model, true, latency.as_millis() as u64, &completion);
                    return CandidateOutcome::Success { completion, latency };
                }
                Err(CircuitBreakerError::CircuitOpen(_)) => {
                    return CandidateOutcome::CircuitOpen;
                }
                Err(CircuitBreakerError::Inner(error)) => {
                    self.record_failure(model);
                    if error.is_transient() && attempt < self.config.retry.max_attempts {
                        let delay = self.config.retry.delay_before(attempt + 1);
                        tracing::debug!(
                            model,
                            attempt,
                            next_retry_in = ?delay,
                            error = %error,
                            "transient model failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return CandidateOutcome::Failed(error);
                }
            }
        }
    }

    fn record_outcome(&self, model: &str, success: bool, latency_ms: u64, completion: &Completion) {
        let cost = self
            .config
            .spec(model)
            .map(|s| s.cost_per_request)
            .unwrap_or(0.0);
        let entry = self
            .metrics
            .entry(model.to_string())
            .or_insert_with(|| Mutex::new(ModelMetrics::default()));
        let mut metrics = entry.lock();
        metrics.calls += 1;
        metrics.total_latency_ms += latency_ms;
        metrics.total_cost += cost;
        metrics.input_tokens += completion.input_tokens.unwrap_or(0) as u64;
        metrics.output_tokens += completion.output_tokens.unwrap_or(0) as u64;
        metrics.recent.push_back(success);
        while metrics.recent.len() > self.config.health_window {
            metrics.recent.pop_front();
        }
    }

    fn record_failure(&self, model: &str) {
        let entry = self
            .metrics
            .entry(model.to_string())
            .or_insert_with(|| Mutex::new(ModelMetrics::default()));
        let mut metrics = entry.lock();
        metrics.calls += 1;
        metrics.failures += 1;
        metrics.recent.push_back(false);
        while metrics.recent.len() > self.config.health_window {
            metrics.recent.pop_front();
        }
    }

    /// Count a schema-invalid model output against the model's health.
    ///
    /// The transport call succeeded, so the breaker saw a success; the
    /// emergency-handler path still must not look like a healthy model.
    pub fn record_invalid_output(&self, model: &str) {
        self.record_failure(model);
    }

    /// Per-model health rollup based on the recent success rate.
    pub fn model_health(&self) -> Vec<ModelHealth> {
        self.metrics
            .iter()
            .map(|entry| {
                let metrics = entry.value().lock();
                let recent_success_rate = if metrics.recent.is_empty() {
                    1.0
                } else {
                    metrics.recent.iter().filter(|s| **s).count() as f64
                        / metrics.recent.len() as f64
                };
                let successes = metrics.calls - metrics.failures;
                ModelHealth {
                    model: entry.key().clone(),
                    calls: metrics.calls,
                    failures: metrics.failures,
                    recent_success_rate,
                    avg_latency_ms: if successes > 0 {
                        metrics.total_latency_ms as f64 / successes as f64
                    } else {
                        0.0
                    },
                    total_cost: metrics.total_cost,
                }
            })
            .collect()
    }
}

enum CandidateOutcome {
    Success {
        completion: Completion,
        latency: std::time::Duration,
    },
    CircuitOpen,
    Failed(ModelError),
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Scripted client: per-model queue of outcomes.
    #[derive(Default)]
    struct ScriptedClient {
        outcomes: DashMap<String, Mutex<VecDeque<Result<String, ModelError>>>>,
        calls: DashMap<String, AtomicU32>,
    }

    impl ScriptedClient {
        fn script(&self, model: &str, outcome: Result<String, ModelError>) {
            self.outcomes
                .entry(model.to_string())
                .or_insert_with(|| Mutex::new(VecDeque::new()))
                .lock()
                .push_back(outcome);
        }

        fn calls(&self, model: &str) -> u32 {
            self.calls
                .get(model)
                .map(|c| c.load(Ordering::SeqCst))
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(
            &self,
            model: &str,
            _request: &CompletionRequest,
        ) -> Result<Completion, ModelError> {
            self.calls
                .entry(model.to_string())
                .or_insert_with(|| AtomicU32::new(0))
                .fetch_add(1, Ordering::SeqCst);

            let scripted = self
                .outcomes
                .get(model)
                .and_then(|q| q.lock().pop_front());
            match scripted {
                Some(Ok(text)) => Ok(Completion {
                    text,
                    input_tokens: Some(10),
                    output_tokens: Some(20),
                }),
                Some(Err(e)) => Err(e),
                None => Ok(Completion {
                    text: "default".into(),
                    input_tokens: None,
                    output_tokens: None,
                }),
            }
        }
    }

    fn fast_router(client: Arc<ScriptedClient>) -> AiRouter {
        let mut config = RouterConfig::default();
        config.retry = RetryConfig::new(2)
            .with_base_delay(std::time::Duration::from_millis(1))
            .with_jitter(false);
        config.breaker = CircuitBreakerConfig::new(2)
            .with_timeout(std::time::Duration::from_millis(50));
        AiRouter::new(config, client, Arc::new(CircuitBreakerRegistry::default()))
    }

    fn ctx() -> RoutingContext {
        RoutingContext::default()
    }

    #[test]
    fn deep_markers_route_deep() {
        let router = fast_router(Arc::new(ScriptedClient::default()));
        assert_eq!(
            router.assess_complexity("deep analysis of personality", "", &ctx()),
            TaskComplexity::Deep
        );
        assert_eq!(
            router.assess_complexity("", "I want a psychological profile", &ctx()),
            TaskComplexity::Deep
        );
    }

    #[test]
    fn simple_and_daily_markers() {
        let router = fast_router(Arc::new(ScriptedClient::default()));
        assert_eq!(
            router.assess_complexity("validate this answer", "", &ctx()),
            TaskComplexity::Simple
        );
        assert_eq!(
            router.assess_complexity("coaching chat", "", &ctx()),
            TaskComplexity::Daily
        );
    }

    #[test]
    fn length_defaults() {
        let router = fast_router(Arc::new(ScriptedClient::default()));
        assert_eq!(
            router.assess_complexity("", "hi", &ctx()),
            TaskComplexity::Simple
        );
        let medium = "x".repeat(120);
        assert_eq!(
            router.assess_complexity("", &medium, &ctx()),
            TaskComplexity::Daily
        );
        let long = "x".repeat(400);
        assert_eq!(
            router.assess_complexity("", &long, &ctx()),
            TaskComplexity::Deep
        );
    }

    #[test]
    fn context_overrides() {
        let router = fast_router(Arc::new(ScriptedClient::default()));
        let onboarding = RoutingContext {
            is_onboarding: true,
            ..Default::default()
        };
        assert_eq!(
            router.assess_complexity("", "hi", &onboarding),
            TaskComplexity::Deep
        );

        let checkin = RoutingContext {
            daily_checkin: true,
            ..Default::default()
        };
        assert_eq!(
            router.assess_complexity("", &"x".repeat(400), &checkin),
            TaskComplexity::Daily
        );
    }

    #[test]
    fn tier_table() {
        let router = fast_router(Arc::new(ScriptedClient::default()));

        let d = router.route_request(UserTier::Premium, "deep analysis psychological", "", &ctx());
        assert_eq!(d.model, "claude-sonnet");
        assert!(!d.downgraded);

        let d = router.route_request(UserTier::Free, "deep analysis psychological", "", &ctx());
        assert_eq!(d.model, "gpt-4o");
        assert!(d.downgraded);

        let d = router.route_request(UserTier::Free, "coaching chat", "", &ctx());
        assert_eq!(d.model, "gpt-4o-mini");
        assert!(d.downgraded);

        let d = router.route_request(UserTier::Free, "validate", "", &ctx());
        assert_eq!(d.model, "gpt-4o-mini");
        assert!(!d.downgraded);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = Arc::new(ScriptedClient::default());
        client.script("gpt-4o-mini", Err(ModelError::Transport("reset".into())));
        client.script("gpt-4o-mini", Ok("ok".into()));
        let router = fast_router(client.clone());

        let result = router
            .complete(
                UserTier::Premium,
                "validate",
                CompletionRequest::new("check this"),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.completion.text, "ok");
        assert_eq!(client.calls("gpt-4o-mini"), 2);
    }

    #[tokio::test]
    async fn non_transient_failure_falls_through_to_fallback() {
        let client = Arc::new(ScriptedClient::default());
        client.script(
            "claude-sonnet",
            Err(ModelError::Status {
                code: 401,
                message: "unauthorized".into(),
            }),
        );
        client.script("gpt-4o", Ok("fallback answer".into()));
        let router = fast_router(client.clone());

        let result = router
            .complete(
                UserTier::Premium,
                "deep analysis psychological",
                CompletionRequest::new("analyze me"),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.model, "gpt-4o");
        assert_eq!(client.calls("claude-sonnet"), 1);
    }

    #[tokio::test]
    async fn open_primary_is_skipped() {
        let client = Arc::new(ScriptedClient::default());
        client.script("gpt-4o", Ok("secondary".into()));
        let router = fast_router(client.clone());

        // Trip the frontier breaker.
        let breaker = router.breakers.register(
            "model:claude-sonnet",
            CircuitBreakerConfig::new(1).with_timeout(std::time::Duration::from_secs(60)),
        );
        breaker.record_failure();

        let result = router
            .complete(
                UserTier::Premium,
                "deep analysis psychological",
                CompletionRequest::new("analyze"),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.model, "gpt-4o");
        assert_eq!(client.calls("claude-sonnet"), 0);
    }

    #[tokio::test]
    async fn all_open_is_no_model_available() {
        let client = Arc::new(ScriptedClient::default());
        let router = fast_router(client);

        for model in ["claude-sonnet", "gpt-4o", "gpt-4o-mini"] {
            let breaker = router.breakers.register(
                &format!("model:{model}"),
                CircuitBreakerConfig::new(1).with_timeout(std::time::Duration::from_secs(60)),
            );
            breaker.record_failure();
        }

        let err = router
            .complete(
                UserTier::Premium,
                "deep analysis psychological",
                CompletionRequest::new("analyze"),
                &ctx(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RouterError::NoModelAvailable { .. }));
    }

    #[tokio::test]
    async fn metrics_and_health_rollup() {
        let client = Arc::new(ScriptedClient::default());
        client.script("gpt-4o-mini", Ok("one".into()));
        let router = fast_router(client);

        router
            .complete(
                UserTier::Free,
                "validate",
                CompletionRequest::new("x"),
                &ctx(),
            )
            .await
            .unwrap();

        let health = router.model_health();
        let mini = health.iter().find(|h| h.model == "gpt-4o-mini").unwrap();
        assert_eq!(mini.calls, 1);
        assert_eq!(mini.failures, 0);
        assert_eq!(mini.recent_success_rate, 1.0);
        assert!(mini.total_cost > 0.0);
    }
}
