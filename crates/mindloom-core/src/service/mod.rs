//! Base service runtime.
//!
//! Every service in the fleet is a [`Service`] built around a
//! [`ServiceHarness`]: lifecycle state, event-consumer registration, named
//! circuit breakers, a metrics map, and health checks. The harness owns a
//! per-service shutdown handle so stopping one service quiesces its
//! consumers without touching the rest of the process.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::events::{ConsumerConfig, EventBus, EventConsumer, EventHandler};
use crate::health::{Dependency, HealthReport};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::shutdown::GracefulShutdown;

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not running.
    Stopped,
    /// `start` in progress.
    Starting,
    /// Accepting work.
    Running,
    /// `stop` in progress.
    Stopping,
    /// Startup or shutdown failed; not accepting work.
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Errors from service lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A startup dependency could not be reached. The service transitions
    /// to [`ServiceState::Error`] and does not accept work.
    #[error("service '{service}' failed to start: {reason}")]
    StartupFailed {
        /// Service name.
        service: String,
        /// What went wrong.
        reason: String,
    },
    /// Shutdown did not complete cleanly.
    #[error("service '{service}' failed to stop: {reason}")]
    ShutdownFailed {
        /// Service name.
        service: String,
        /// What went wrong.
        reason: String,
    },
    /// The operation needs a bus but none was configured.
    #[error("service '{0}' has no event bus configured")]
    NoBus(String),
    /// Work running under the service failed.
    #[error("service '{service}' work failed: {reason}")]
    WorkFailed {
        /// Service name.
        service: String,
        /// What went wrong.
        reason: String,
    },
}

/// A unit of the fleet with lifecycle, consumers, breakers and health.
#[async_trait]
pub trait Service: Send + Sync {
    /// The service name, e.g. `analysis_service`.
    fn name(&self) -> &str;

    /// Connect external resources, register consumers and breakers.
    async fn start(&self) -> Result<(), ServiceError>;

    /// Quiesce consumers, drain in-flight work, release resources.
    async fn stop(&self) -> Result<(), ServiceError>;

    /// Probe external dependencies and report live metrics.
    async fn health_check(&self) -> HealthReport;
}

/// Shared machinery a service embeds.
pub struct ServiceHarness {
    name: String,
    bus: Option<Arc<EventBus>>,
    state: Mutex<ServiceState>,
    started_at: Mutex<Option<Instant>>,
    shutdown: GracefulShutdown,
    consumers: Mutex<Vec<(Arc<EventConsumer>, tokio::task::JoinHandle<()>)>>,
    breakers: CircuitBreakerRegistry,
    metrics: DashMap<String, f64>,
    dependencies: Mutex<Vec<Arc<dyn Dependency>>>,
}

impl ServiceHarness {
    /// Create a harness for `name`, optionally wired to a bus.
    pub fn new(name: impl Into<String>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            name: name.into(),
            bus,
            state: Mutex::new(ServiceState::Stopped),
            started_at: Mutex::new(None),
            shutdown: GracefulShutdown::new(),
            consumers: Mutex::new(Vec::new()),
            breakers: CircuitBreakerRegistry::default(),
            metrics: DashMap::new(),
            dependencies: Mutex::new(Vec::new()),
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Transition the lifecycle state.
    pub fn set_state(&self, state: ServiceState) {
        let mut current = self.state.lock();
        let old = *current;
        if old != state {
            tracing::info!(service = %self.name, from = %old, to = %state, "service state changed");
            *current = state;
            if state == ServiceState::Running {
                *self.started_at.lock() = Some(Instant::now());
            }
        }
    }

    /// The bus handle, or [`ServiceError::NoBus`].
    pub fn bus(&self) -> Result<Arc<EventBus>, ServiceError> {
        self.bus
            .clone()
            .ok_or_else(|| ServiceError::NoBus(self.name.clone()))
    }

    /// Publish an event through the service's bus.
    pub async fn publish_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        trace_id: Option<String>,
    ) -> Result<String, ServiceError> {
        let bus = self.bus()?;
        bus.publish(event_type, payload, trace_id)
            .await
            .map_err(|e| ServiceError::WorkFailed {
                service: self.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Register and spawn an event consumer on the service's shutdown scope.
    pub fn add_consumer(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Arc<EventConsumer>, ServiceError> {
        let bus = self.bus()?;
        let consumer = Arc::new(EventConsumer::new(bus, config, handler));
        let token = self.shutdown.token();
        let runner = consumer.clone();
        let handle = tokio::spawn(async move { runner.run(token).await });
        self.consumers.lock().push((consumer.clone(), handle));
        tracing::info!(service = %self.name, group = %consumer.group(), "event consumer added");
        Ok(consumer)
    }

    /// Stop all consumers: no new entries are pulled, in-flight handlers are
    /// awaited up to the grace period.
    pub async fn stop_consumers(&self) {
        self.shutdown.shutdown();
        let consumers: Vec<_> = std::mem::take(&mut *self.consumers.lock());
        for (_, handle) in consumers {
            self.shutdown.drain(handle).await;
        }
        tracing::info!(service = %self.name, "all consumers stopped");
    }

    /// Register a circuit breaker named `{service}:{name}`.
    pub fn register_circuit_breaker(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let full_name = format!("{}:{}", self.name, name);
        self.breakers.register(&full_name, config)
    }

    /// A previously registered breaker.
    pub fn circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&format!("{}:{}", self.name, name))
    }

    /// The breaker registry, for aggregated stats.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Add a health-checkable dependency.
    pub fn add_dependency(&self, dep: Arc<dyn Dependency>) {
        self.dependencies.lock().push(dep);
    }

    /// Add `value` to a metric, creating it at zero.
    pub fn increment_metric(&self, name: &str, value: f64) {
        *self.metrics.entry(name.to_string()).or_insert(0.0) += value;
    }

    /// Set a metric to a value.
    pub fn set_metric(&self, name: &str, value: f64) {
        self.metrics.insert(name.to_string(), value);
    }

    /// Metrics snapshot, including state and uptime.
    pub fn metrics(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for entry in self.metrics.iter() {
            map.insert(
                entry.key().clone(),
                serde_json::json!(*entry.value()),
            );
        }
        map.insert("state".into(), serde_json::json!(self.state().to_string()));
        let uptime = self
            .started_at
            .lock()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        map.insert("uptime_seconds".into(), serde_json::json!(uptime));
        serde_json::Value::Object(map)
    }

    /// Probe every registered dependency and assemble the report.
    pub async fn health_report(&self) -> HealthReport {
        let deps = self.dependencies.lock().clone();
        HealthReport::check_all(&deps, self.metrics()).await
    }
}

/// Start `service`, run `work`, and stop the service on every exit path,
/// including when `work` errors.
pub async fn run_scoped<S, F, T, E>(service: &S, work: F) -> Result<T, ServiceError>
where
    S: Service,
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    start_safe(service).await?;

    let result = work.await;

    if let Err(stop_err) = stop_safe(service).await {
        tracing::error!(service = service.name(), error = %stop_err, "stop failed after scoped run");
    }

    result.map_err(|e| ServiceError::WorkFailed {
        service: service.name().to_string(),
        reason: e.to_string(),
    })
}

/// `start` with state transitions and error capture.
pub async fn start_safe<S: Service + ?Sized>(service: &S) -> Result<(), ServiceError> {
    match service.start().await {
        Ok(()) => {
            tracing::info!(service = service.name(), "service started");
            Ok(())
        }
        Err(e) => {
            tracing::error!(service = service.name(), error = %e, "failed to start service");
            Err(e)
        }
    }
}

/// `stop` with state transitions and error capture.
pub async fn stop_safe<S: Service + ?Sized>(service: &S) -> Result<(), ServiceError> {
    match service.stop().await {
        Ok(()) => {
            tracing::info!(service = service.name(), "service stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!(service = service.name(), error = %e, "failed to stop service");
            Err(e)
        }
    }
}
