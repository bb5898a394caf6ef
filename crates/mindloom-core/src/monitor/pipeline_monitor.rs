//! Pipeline detectors: metrics, stuck tasks, slow paths, failure rates,
//! dependency health.
//!
//! The monitor reads the analysis and outbox stores asynchronously; it
//! never sits in the hot path and never holds a transaction across an
//! await point.

use std::sync::Arc;

use crate::analysis::{AnalysisError, AnalysisStore, Lane, PipelineWindowStats};
use crate::config::MonitorConfig;
use crate::health::Dependency;
use crate::outbox::{OutboxStatus, OutboxStore};
use crate::shutdown::ShutdownToken;

use super::alerts::{Alert, AlertDispatcher, AlertSeverity};

/// Queue depths across the pipeline.
#[derive(Debug, Clone, Default)]
pub struct QueueDepths {
    /// Outbox rows awaiting the relay.
    pub outbox_pending: u64,
    /// Records with vectorization pending.
    pub vectorization_pending: u64,
    /// Records with the profile update pending.
    pub dp_update_pending: u64,
}

/// One collector pass.
#[derive(Debug, Clone, Default)]
pub struct MonitorSnapshot {
    /// Window aggregates from the analysis store.
    pub window: PipelineWindowStats,
    /// Current queue depths.
    pub queues: QueueDepths,
}

/// The pipeline monitor.
pub struct PipelineMonitor {
    analysis: Arc<dyn AnalysisStore>,
    outbox: Option<Arc<dyn OutboxStore>>,
    dependencies: Vec<Arc<dyn Dependency>>,
    dispatcher: Arc<AlertDispatcher>,
    config: MonitorConfig,
}

impl PipelineMonitor {
    /// Create a monitor over the analysis store.
    pub fn new(
        analysis: Arc<dyn AnalysisStore>,
        dispatcher: Arc<AlertDispatcher>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            analysis,
            outbox: None,
            dependencies: Vec::new(),
            dispatcher,
            config,
        }
    }

    /// Also watch outbox queue depth.
    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Add a dependency for the health checker.
    pub fn with_dependency(mut self, dep: Arc<dyn Dependency>) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Collect window metrics and queue depths.
    pub async fn collect_metrics(&self) -> Result<MonitorSnapshot, AnalysisError> {
        let window = self.analysis.window_stats(self.config.metrics_window).await?;
        let queues = QueueDepths {
            outbox_pending: match &self.outbox {
                Some(outbox) => outbox
                    .count_by_status(OutboxStatus::Pending)
                    .await
                    .unwrap_or(0),
                None => 0,
            },
            vectorization_pending: self.analysis.lane_pending_count(Lane::Vectorization).await?,
            dp_update_pending: self.analysis.lane_pending_count(Lane::DpUpdate).await?,
        };

        tracing::debug!(
            records = window.records,
            avg_processing_ms = window.avg_processing_ms,
            outbox_pending = queues.outbox_pending,
            "monitor metrics collected"
        );
        Ok(MonitorSnapshot { window, queues })
    }

    /// Raise `stuck_task` for unfinished background work past the
    /// threshold. Returns how many alerts were dispatched.
    pub async fn check_stuck_tasks(&self) -> Result<usize, AnalysisError> {
        let stuck = self
            .analysis
            .stuck_records(self.config.stuck_threshold)
            .await?;
        let mut dispatched = 0;

        for record in stuck {
            let minutes_stuck =
                (chrono::Utc::now() - record.processed_at).num_seconds() as f64 / 60.0;
            let alert = Alert::new(
                "stuck_task",
                AlertSeverity::Critical,
                format!(
                    "analysis {} background work stuck for {:.1} minutes",
                    record.id, minutes_stuck
                ),
                serde_json::json!({
                    "minutes_stuck": minutes_stuck,
                    "vectorization_status": record.vectorization_status.as_str(),
                    "dp_update_status": record.dp_update_status.as_str(),
                }),
            )
            .with_user(record.user_id)
            .with_analysis(record.id);

            if self.dispatcher.dispatch(alert).await {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Raise `slow_processing` for completed background work over the
    /// threshold.
    pub async fn check_slow_processing(&self) -> Result<usize, AnalysisError> {
        let slow = self
            .analysis
            .slow_records(
                self.config.slow_threshold.as_millis() as i64,
                self.config.metrics_window,
            )
            .await?;
        let mut dispatched = 0;

        for record in slow {
            let alert = Alert::new(
                "slow_processing",
                AlertSeverity::Warning,
                format!(
                    "analysis {} background work took {} ms",
                    record.id,
                    record.background_task_duration_ms.unwrap_or(0)
                ),
                serde_json::json!({
                    "duration_ms": record.background_task_duration_ms,
                    "threshold_ms": self.config.slow_threshold.as_millis() as u64,
                }),
            )
            .with_user(record.user_id)
            .with_analysis(record.id);

            if self.dispatcher.dispatch(alert).await {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Raise `high_failure_rate` when any lane's success rate over the
    /// window falls under `1 - failure_threshold`.
    pub async fn check_failure_rates(&self) -> Result<usize, AnalysisError> {
        let stats = self.analysis.window_stats(self.config.metrics_window).await?;
        let floor = 1.0 - self.config.failure_threshold;
        let mut dispatched = 0;

        for (lane, counts) in [
            (Lane::Vectorization, stats.vectorization),
            (Lane::DpUpdate, stats.dp_update),
        ] {
            let rate = counts.success_rate();
            if rate < floor {
                let alert = Alert::new(
                    "high_failure_rate",
                    AlertSeverity::Error,
                    format!(
                        "{} success rate {:.0}% is under the {:.0}% floor",
                        lane.as_str(),
                        rate * 100.0,
                        floor * 100.0
                    ),
                    serde_json::json!({
                        "lane": lane.as_str(),
                        "success_rate": rate,
                        "failed": counts.failed,
                        "success": counts.success,
                    }),
                );
                if self.dispatcher.dispatch(alert).await {
                    dispatched += 1;
                }
            }
        }
        Ok(dispatched)
    }

    /// Raise `service_unhealthy` for non-healthy dependencies.
    pub async fn check_health(&self) -> usize {
        let mut dispatched = 0;
        for dep in &self.dependencies {
            let status =
                match tokio::time::timeout(dep.timeout(), dep.check()).await {
                    Ok(status) => status,
                    Err(_) => crate::health::DependencyStatus::Unhealthy(
                        "health check timed out".into(),
                    ),
                };
            if status.is_healthy() {
                continue;
            }

            let alert = Alert::new(
                "service_unhealthy",
                AlertSeverity::Critical,
                format!(
                    "dependency '{}' is {}",
                    dep.name(),
                    status.message().unwrap_or("unhealthy")
                ),
                serde_json::json!({"dependency": dep.name()}),
            );
            if self.dispatcher.dispatch(alert).await {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Run every detector once.
    pub async fn run_checks_once(&self) -> Result<(), AnalysisError> {
        self.check_stuck_tasks().await?;
        self.check_slow_processing().await?;
        self.check_failure_rates().await?;
        self.check_health().await;
        Ok(())
    }

    /// Loop until shutdown.
    pub async fn run(&self, mut token: ShutdownToken) {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stuck_threshold_secs = self.config.stuck_threshold.as_secs(),
            "pipeline monitor started"
        );

        while !token.is_shutdown() {
            if let Err(e) = self.run_checks_once().await {
                tracing::error!(error = %e, "monitor pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = token.cancelled() => break,
            }
        }

        tracing::info!("pipeline monitor stopped");
    }

    /// The alert dispatcher, for wiring sinks.
    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;

    use super::*;
    use crate::analysis::{
        LaneStatus, MemoryAnalysisStore, NewAnalysisRecord, SourceRef, SpecialSituation,
        TraitScores,
    };
    use crate::health::DependencyStatus;
    use crate::profile::ExtractedLayers;

    fn new_record(user_id: i64) -> NewAnalysisRecord {
        NewAnalysisRecord {
            user_id,
            source_ref: SourceRef::Answer(1),
            analysis_version: "v2".into(),
            emotional_state: "neutral".into(),
            trait_scores: TraitScores::empty(),
            insights: serde_json::json!({}),
            router_hints: serde_json::json!({}),
            quality_score: 0.8,
            confidence_score: 0.7,
            model_used: "gpt-4o".into(),
            processing_time_ms: 900,
            raw_ai_response: None,
            special_situation: SpecialSituation::None,
            profile_content: ExtractedLayers::new(),
            is_milestone: false,
        }
    }

    fn monitor(store: Arc<MemoryAnalysisStore>) -> PipelineMonitor {
        let config = MonitorConfig {
            stuck_threshold: StdDuration::from_secs(300),
            slow_threshold: StdDuration::from_millis(15_000),
            failure_threshold: 0.2,
            ..Default::default()
        };
        PipelineMonitor::new(store, Arc::new(AlertDispatcher::new()), config)
    }

    #[tokio::test]
    async fn stuck_task_raises_critical_once() {
        let store = Arc::new(MemoryAnalysisStore::new());
        let id = store.insert(new_record(42)).await.unwrap();
        store.age_record(id, StdDuration::from_secs(320));

        let monitor = monitor(store);
        assert_eq!(monitor.check_stuck_tasks().await.unwrap(), 1);

        let recent = monitor.dispatcher().recent(10);
        assert_eq!(recent[0].alert_type, "stuck_task");
        assert_eq!(recent[0].severity, AlertSeverity::Critical);
        let minutes = recent[0].details["minutes_stuck"].as_f64().unwrap();
        assert!(minutes >= 5.0 && minutes < 6.5);

        // Still stuck on the next pass: de-duplicated.
        assert_eq!(monitor.check_stuck_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_processing_raises_warning() {
        let store = Arc::new(MemoryAnalysisStore::new());
        let id = store.insert(new_record(42)).await.unwrap();
        store.complete_background(id, 20_000).await.unwrap();

        let monitor = monitor(store);
        assert_eq!(monitor.check_slow_processing().await.unwrap(), 1);
        assert_eq!(
            monitor.dispatcher().recent(1)[0].alert_type,
            "slow_processing"
        );
    }

    #[tokio::test]
    async fn failure_rate_floor_raises_error() {
        let store = Arc::new(MemoryAnalysisStore::new());
        for i in 0..4 {
            let id = store.insert(new_record(i)).await.unwrap();
            let to = if i == 0 {
                LaneStatus::Success
            } else {
                LaneStatus::Failed
            };
            store
                .set_lane_status(id, Lane::Vectorization, LaneStatus::Pending, to, Some("timeout"))
                .await
                .unwrap();
        }

        let monitor = monitor(store);
        // 25% success is far under the 80% floor.
        assert_eq!(monitor.check_failure_rates().await.unwrap(), 1);
        let alert = &monitor.dispatcher().recent(1)[0];
        assert_eq!(alert.alert_type, "high_failure_rate");
        assert_eq!(alert.details["lane"], "vectorization");
    }

    struct DownDep;

    #[async_trait]
    impl Dependency for DownDep {
        fn name(&self) -> &str {
            "postgres"
        }
        async fn check(&self) -> DependencyStatus {
            DependencyStatus::Unhealthy("connection refused".into())
        }
    }

    #[tokio::test]
    async fn unhealthy_dependency_raises_critical() {
        let store = Arc::new(MemoryAnalysisStore::new());
        let monitor = monitor(store).with_dependency(Arc::new(DownDep));

        assert_eq!(monitor.check_health().await, 1);
        assert_eq!(
            monitor.dispatcher().recent(1)[0].alert_type,
            "service_unhealthy"
        );
    }

    #[tokio::test]
    async fn metrics_snapshot_includes_queue_depths() {
        let store = Arc::new(MemoryAnalysisStore::new());
        store.insert(new_record(1)).await.unwrap();

        let monitor = monitor(store);
        let snapshot = monitor.collect_metrics().await.unwrap();
        assert_eq!(snapshot.window.records, 1);
        assert_eq!(snapshot.queues.vectorization_pending, 1);
        assert_eq!(snapshot.queues.dp_update_pending, 1);
    }
}
