//! Automatic recovery of failed background lanes.
//!
//! Selects records with a FAILED lane (and stuck PENDING lanes) whose retry
//! budget is not exhausted and whose lane-specific exponential delay has
//! passed, classifies the stored error, skips non-recoverable ones, and
//! re-invokes the lane's worker. Retry counts and `last_retry_at` are
//! persisted on the record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use crate::analysis::{
    AnalysisError, AnalysisPipeline, AnalysisRecord, AnalysisStore, Lane, LaneStatus,
};
use crate::error::classify_error_text;
use crate::shutdown::ShutdownToken;

/// Auto-retry tuning.
#[derive(Debug, Clone)]
pub struct AutoRetryConfig {
    /// Master switch (`AUTO_RETRY_ENABLED`).
    pub enabled: bool,
    /// Retry budget per record.
    pub max_retries: i32,
    /// Base delay; the actual wait is `base * 2^retry_count`, capped.
    pub base_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Pause between passes.
    pub interval: Duration,
    /// PENDING lanes older than this are treated as stuck and re-run.
    pub stuck_threshold: Duration,
}

impl Default for AutoRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(900),
            interval: Duration::from_secs(120),
            stuck_threshold: Duration::from_secs(300),
        }
    }
}

/// Outcome counters of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPassStats {
    /// Lanes re-invoked.
    pub attempted: usize,
    /// Re-invocations that reached SUCCESS.
    pub succeeded: usize,
    /// Rows skipped because the error is non-recoverable.
    pub skipped_non_recoverable: usize,
    /// Rows skipped because their backoff window has not passed.
    pub waiting: usize,
}

/// The auto-retry manager.
pub struct AutoRetryManager {
    store: Arc<dyn AnalysisStore>,
    pipeline: Arc<AnalysisPipeline>,
    config: AutoRetryConfig,
}

impl AutoRetryManager {
    /// Create a manager re-running lanes through `pipeline`.
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        pipeline: Arc<AnalysisPipeline>,
        config: AutoRetryConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            config,
        }
    }

    /// One pass over both lanes and the stuck PENDING set.
    pub async fn run_once(&self) -> Result<RetryPassStats, AnalysisError> {
        let mut stats = RetryPassStats::default();
        if !self.config.enabled {
            return Ok(stats);
        }

        for lane in [Lane::Vectorization, Lane::DpUpdate] {
            let failed = self
                .store
                .failed_lane_records(lane, self.config.max_retries)
                .await?;
            for record in failed {
                self.retry_failed_lane(&record, lane, &mut stats).await?;
            }
        }

        // Stuck PENDING lanes: the worker died mid-flight; re-run directly.
        let stuck = self
            .store
            .stuck_records(self.config.stuck_threshold)
            .await?;
        for record in stuck {
            if record.retry_count >= self.config.max_retries {
                continue;
            }
            for lane in [Lane::Vectorization, Lane::DpUpdate] {
                if record.lane_status(lane) == LaneStatus::Pending {
                    stats.attempted += 1;
                    self.store.record_retry(record.id).await?;
                    self.rerun_lane(record.id, lane, &mut stats).await;
                }
            }
        }

        if stats.attempted > 0 {
            tracing::info!(
                attempted = stats.attempted,
                succeeded = stats.succeeded,
                skipped = stats.skipped_non_recoverable,
                "auto-retry pass finished"
            );
        }
        Ok(stats)
    }

    async fn retry_failed_lane(
        &self,
        record: &AnalysisRecord,
        lane: Lane,
        stats: &mut RetryPassStats,
    ) -> Result<(), AnalysisError> {
        // Non-recoverable errors never get another attempt.
        if let Some(error) = record.lane_error(lane) {
            if !classify_error_text(error).is_retryable() {
                tracing::info!(
                    analysis_id = record.id,
                    lane = lane.as_str(),
                    error,
                    "skipping non-recoverable lane error"
                );
                stats.skipped_non_recoverable += 1;
                return Ok(());
            }
        }

        // Exponential, capped per-record delay.
        let exponent = record.retry_count.clamp(0, 16) as u32;
        let delay_secs = (self.config.base_delay.as_secs() * (1u64 << exponent))
            .min(self.config.max_delay.as_secs());
        let reference = record
            .last_retry_at
            .or(match lane {
                Lane::Vectorization => record.vectorization_completed_at,
                Lane::DpUpdate => record.dp_update_completed_at,
            })
            .unwrap_or(record.processed_at);
        if Utc::now() - reference < ChronoDuration::seconds(delay_secs as i64) {
            stats.waiting += 1;
            return Ok(());
        }

        // Reset the lane and hand it back to the worker.
        if !self
            .store
            .set_lane_status(record.id, lane, LaneStatus::Failed, LaneStatus::Pending, None)
            .await?
        {
            return Ok(());
        }
        self.store.record_retry(record.id).await?;
        stats.attempted += 1;
        self.rerun_lane(record.id, lane, stats).await;
        Ok(())
    }

    async fn rerun_lane(&self, analysis_id: i64, lane: Lane, stats: &mut RetryPassStats) {
        if let Err(e) = self.pipeline.run_lane(analysis_id, lane).await {
            tracing::warn!(analysis_id, lane = lane.as_str(), error = %e, "auto-retry lane run failed");
            return;
        }

        match self.store.get(analysis_id).await {
            Ok(Some(record)) => {
                if record.lane_status(lane) == LaneStatus::Success {
                    stats.succeeded += 1;
                }
                if record.lanes_terminal() && !record.background_task_completed {
                    let _ = self
                        .store
                        .complete_background(
                            analysis_id,
                            record.background_task_duration_ms.unwrap_or(0),
                        )
                        .await;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(analysis_id, error = %e, "auto-retry status read failed");
            }
        }
    }

    /// Loop until shutdown.
    pub async fn run(&self, mut token: ShutdownToken) {
        if !self.config.enabled {
            tracing::info!("auto-retry disabled");
            return;
        }
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            max_retries = self.config.max_retries,
            "auto-retry manager started"
        );

        while !token.is_shutdown() {
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "auto-retry pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = token.cancelled() => break,
            }
        }

        tracing::info!("auto-retry manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::ai::{
        AiRouter, Completion, CompletionRequest, ModelClient, ModelError, RouterConfig,
    };
    use crate::analysis::{
        MemoryAnalysisStore, NewAnalysisRecord, PipelineConfig, SourceRef, SpecialSituation,
        TraitScores, VectorError, VectorStore,
    };
    use crate::events::{EventBus, MemoryTransport};
    use crate::profile::{ExtractedLayers, MemoryProfileStore, ProfileWriter};
    use crate::resilience::CircuitBreakerRegistry;

    struct NullClient;

    #[async_trait]
    impl ModelClient for NullClient {
        async fn complete(
            &self,
            _model: &str,
            _request: &CompletionRequest,
        ) -> Result<Completion, ModelError> {
            Ok(Completion {
                text: "{}".into(),
                input_tokens: None,
                output_tokens: None,
            })
        }
    }

    /// Vector store that fails until told to recover.
    #[derive(Default)]
    struct FlakyVectors {
        healthy: Mutex<bool>,
    }

    #[async_trait]
    impl VectorStore for FlakyVectors {
        async fn upsert(
            &self,
            _user_id: i64,
            _vector: Vec<f32>,
            _payload: serde_json::Value,
        ) -> Result<(), VectorError> {
            if *self.healthy.lock() {
                Ok(())
            } else {
                Err(VectorError::Unavailable("connection timeout".into()))
            }
        }
        async fn get(
            &self,
            _user_id: i64,
        ) -> Result<Option<crate::analysis::StoredVector>, VectorError> {
            Ok(None)
        }
    }

    struct Fixture {
        store: Arc<MemoryAnalysisStore>,
        vectors: Arc<FlakyVectors>,
        manager: AutoRetryManager,
    }

    fn fixture(config: AutoRetryConfig) -> Fixture {
        let store = Arc::new(MemoryAnalysisStore::new());
        let vectors = Arc::new(FlakyVectors::default());
        let pipeline = Arc::new(AnalysisPipeline::new(
            Arc::new(AiRouter::new(
                RouterConfig::default(),
                Arc::new(NullClient),
                Arc::new(CircuitBreakerRegistry::default()),
            )),
            store.clone(),
            Arc::new(EventBus::new(Arc::new(MemoryTransport::new()))),
            vectors.clone(),
            Arc::new(ProfileWriter::new(Arc::new(MemoryProfileStore::new()))),
            PipelineConfig::default(),
        ));
        let manager = AutoRetryManager::new(store.clone(), pipeline, config);
        Fixture {
            store,
            vectors,
            manager,
        }
    }

    fn record(user_id: i64) -> NewAnalysisRecord {
        NewAnalysisRecord {
            user_id,
            source_ref: SourceRef::Answer(1),
            analysis_version: "v2".into(),
            emotional_state: "neutral".into(),
            trait_scores: TraitScores::empty(),
            insights: serde_json::json!({}),
            router_hints: serde_json::json!({}),
            quality_score: 0.5,
            confidence_score: 0.5,
            model_used: "gpt-4o".into(),
            processing_time_ms: 500,
            raw_ai_response: None,
            special_situation: SpecialSituation::None,
            profile_content: ExtractedLayers::new(),
            is_milestone: false,
        }
    }

    fn immediate_config() -> AutoRetryConfig {
        AutoRetryConfig {
            base_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn recoverable_failure_is_retried_to_success() {
        let fx = fixture(immediate_config());
        let id = fx.store.insert(record(42)).await.unwrap();
        fx.store
            .set_lane_status(
                id,
                Lane::Vectorization,
                LaneStatus::Pending,
                LaneStatus::Failed,
                Some("connection timeout"),
            )
            .await
            .unwrap();
        fx.store
            .set_lane_status(id, Lane::DpUpdate, LaneStatus::Pending, LaneStatus::Success, None)
            .await
            .unwrap();

        *fx.vectors.healthy.lock() = true;
        let stats = fx.manager.run_once().await.unwrap();

        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.succeeded, 1);

        let updated = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(updated.vectorization_status, LaneStatus::Success);
        assert!(updated.vectorization_error.is_none());
        assert_eq!(updated.retry_count, 1);
        assert!(updated.last_retry_at.is_some());
        assert!(updated.background_task_completed);
    }

    #[tokio::test]
    async fn non_recoverable_errors_are_skipped() {
        let fx = fixture(immediate_config());
        let id = fx.store.insert(record(42)).await.unwrap();
        fx.store
            .set_lane_status(
                id,
                Lane::Vectorization,
                LaneStatus::Pending,
                LaneStatus::Failed,
                Some("invalid json in payload"),
            )
            .await
            .unwrap();

        let stats = fx.manager.run_once().await.unwrap();
        assert_eq!(stats.skipped_non_recoverable, 1);
        assert_eq!(stats.attempted, 0);

        let updated = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(updated.vectorization_status, LaneStatus::Failed);
        assert_eq!(updated.retry_count, 0);
    }

    #[tokio::test]
    async fn backoff_window_defers_retries() {
        let fx = fixture(AutoRetryConfig {
            base_delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let id = fx.store.insert(record(42)).await.unwrap();
        fx.store
            .set_lane_status(
                id,
                Lane::Vectorization,
                LaneStatus::Pending,
                LaneStatus::Failed,
                Some("timeout"),
            )
            .await
            .unwrap();
        fx.store.record_retry(id).await.unwrap();

        let stats = fx.manager.run_once().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.attempted, 0);
    }

    #[tokio::test]
    async fn exhausted_budget_is_left_alone() {
        let fx = fixture(AutoRetryConfig {
            max_retries: 1,
            base_delay: Duration::ZERO,
            ..Default::default()
        });
        let id = fx.store.insert(record(42)).await.unwrap();
        fx.store
            .set_lane_status(
                id,
                Lane::Vectorization,
                LaneStatus::Pending,
                LaneStatus::Failed,
                Some("timeout"),
            )
            .await
            .unwrap();
        fx.store.record_retry(id).await.unwrap();

        let stats = fx.manager.run_once().await.unwrap();
        assert_eq!(stats, RetryPassStats::default());
    }

    #[tokio::test]
    async fn disabled_manager_does_nothing() {
        let fx = fixture(AutoRetryConfig {
            enabled: false,
            base_delay: Duration::ZERO,
            ..Default::default()
        });
        let id = fx.store.insert(record(42)).await.unwrap();
        fx.store
            .set_lane_status(
                id,
                Lane::Vectorization,
                LaneStatus::Pending,
                LaneStatus::Failed,
                Some("timeout"),
            )
            .await
            .unwrap();

        let stats = fx.manager.run_once().await.unwrap();
        assert_eq!(stats, RetryPassStats::default());
    }
}
