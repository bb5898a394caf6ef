//! Health check infrastructure.
//!
//! Each service reports one [`DependencyStatus`] per external dependency
//! (DB, bus transport, model endpoints). The overall status is the worst of
//! the individual ones, with any unhealthy dependency making the whole
//! service unhealthy.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Status of an individual dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStatus {
    /// Functioning normally.
    Healthy,
    /// Functioning with reduced capacity or performance.
    Degraded(String),
    /// Not functioning.
    Unhealthy(String),
}

impl DependencyStatus {
    /// Whether the dependency is healthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, DependencyStatus::Healthy)
    }

    /// Whether the dependency is unhealthy.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, DependencyStatus::Unhealthy(_))
    }

    /// The message, if degraded or unhealthy.
    pub fn message(&self) -> Option<&str> {
        match self {
            DependencyStatus::Healthy => None,
            DependencyStatus::Degraded(msg) | DependencyStatus::Unhealthy(msg) => Some(msg),
        }
    }
}

/// Overall health of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every dependency is healthy.
    Healthy,
    /// Some dependency is degraded or a non-critical one is down.
    Degraded,
    /// At least one dependency is unhealthy.
    Unhealthy,
}

impl OverallStatus {
    /// Stable string form for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Unhealthy => "unhealthy",
        }
    }
}

/// A health-checkable external dependency.
#[async_trait]
pub trait Dependency: Send + Sync {
    /// Dependency name, e.g. "postgres", "bus", "model:frontier".
    fn name(&self) -> &str;

    /// Perform an actual probe (ping, `SELECT 1`, …).
    async fn check(&self) -> DependencyStatus;

    /// Probe timeout; slower checks count as unhealthy.
    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// Result of probing one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyReport {
    /// Dependency name.
    pub name: String,
    /// Probe outcome.
    pub status: DependencyStatus,
    /// Probe duration in milliseconds.
    pub duration_ms: u64,
}

/// Aggregate health report for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst-of aggregate.
    pub status: OverallStatus,
    /// Per-dependency outcomes.
    pub dependencies: Vec<DependencyReport>,
    /// Live service metrics at report time.
    pub metrics: serde_json::Value,
}

impl HealthReport {
    /// Probe all dependencies and aggregate.
    pub async fn check_all(
        dependencies: &[std::sync::Arc<dyn Dependency>],
        metrics: serde_json::Value,
    ) -> Self {
        let mut reports = Vec::with_capacity(dependencies.len());
        let mut any_unhealthy = false;
        let mut any_degraded = false;

        for dep in dependencies {
            let start = Instant::now();
            let status = match tokio::time::timeout(dep.timeout(), dep.check()).await {
                Ok(status) => status,
                Err(_) => DependencyStatus::Unhealthy(format!(
                    "health check timed out after {:?}",
                    dep.timeout()
                )),
            };

            match &status {
                DependencyStatus::Unhealthy(_) => any_unhealthy = true,
                DependencyStatus::Degraded(_) => any_degraded = true,
                DependencyStatus::Healthy => {}
            }

            reports.push(DependencyReport {
                name: dep.name().to_string(),
                status,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let status = if any_unhealthy {
            OverallStatus::Unhealthy
        } else if any_degraded {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        Self {
            status,
            dependencies: reports,
            metrics,
        }
    }

    /// Whether everything is healthy.
    pub fn is_healthy(&self) -> bool {
        self.status == OverallStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct FixedDep {
        name: &'static str,
        status: DependencyStatus,
    }

    #[async_trait]
    impl Dependency for FixedDep {
        fn name(&self) -> &str {
            self.name
        }
        async fn check(&self) -> DependencyStatus {
            self.status.clone()
        }
    }

    fn dep(name: &'static str, status: DependencyStatus) -> Arc<dyn Dependency> {
        Arc::new(FixedDep { name, status })
    }

    #[tokio::test]
    async fn all_healthy_is_healthy() {
        let report = HealthReport::check_all(
            &[
                dep("postgres", DependencyStatus::Healthy),
                dep("bus", DependencyStatus::Healthy),
            ],
            serde_json::json!({}),
        )
        .await;

        assert!(report.is_healthy());
        assert_eq!(report.dependencies.len(), 2);
    }

    #[tokio::test]
    async fn any_unhealthy_wins() {
        let report = HealthReport::check_all(
            &[
                dep("postgres", DependencyStatus::Healthy),
                dep("bus", DependencyStatus::Degraded("slow".into())),
                dep("model", DependencyStatus::Unhealthy("down".into())),
            ],
            serde_json::json!({}),
        )
        .await;

        assert_eq!(report.status, OverallStatus::Unhealthy);
    }

    #[tokio::test]
    async fn degraded_without_unhealthy() {
        let report = HealthReport::check_all(
            &[dep("bus", DependencyStatus::Degraded("slow".into()))],
            serde_json::json!({}),
        )
        .await;

        assert_eq!(report.status, OverallStatus::Degraded);
    }

    struct SlowDep;

    #[async_trait]
    impl Dependency for SlowDep {
        fn name(&self) -> &str {
            "slow"
        }
        async fn check(&self) -> DependencyStatus {
            tokio::time::sleep(Duration::from_secs(60)).await;
            DependencyStatus::Healthy
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    #[tokio::test]
    async fn timed_out_probe_is_unhealthy() {
        let report =
            HealthReport::check_all(&[Arc::new(SlowDep)], serde_json::json!({})).await;
        assert_eq!(report.status, OverallStatus::Unhealthy);
        assert!(report.dependencies[0]
            .status
            .message()
            .unwrap()
            .contains("timed out"));
    }
}
