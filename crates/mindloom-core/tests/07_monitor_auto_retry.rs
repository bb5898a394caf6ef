// tests/07_monitor_auto_retry.rs
//
// The stuck-task scenario end-to-end: a record with unfinished background
// work past the threshold raises a CRITICAL grouped alert, auto-retry
// re-runs the recoverable lane, and the alert stream stops repeating the
// same (type, record) key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mindloom_core::ai::{
    AiRouter, Completion, CompletionRequest, ModelClient, ModelError, RouterConfig,
};
use mindloom_core::analysis::{
    AnalysisPipeline, AnalysisStore, Lane, LaneStatus, MemoryAnalysisStore, NewAnalysisRecord,
    PipelineConfig, SourceRef, SpecialSituation, TraitScores, VectorError, VectorStore,
};
use mindloom_core::config::{AlertConfig, MonitorConfig};
use mindloom_core::events::{EventBus, MemoryTransport};
use mindloom_core::monitor::{
    AlertDispatcher, AutoRetryConfig, AutoRetryManager, GroupingNotifier, MemoryChannel,
    PipelineMonitor,
};
use mindloom_core::profile::{ExtractedLayers, MemoryProfileStore, ProfileWriter};
use mindloom_core::resilience::CircuitBreakerRegistry;
use parking_lot::Mutex;

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
    ) -> Result<Option<mindloom_core::analysis::StoredVector>, VectorError> {
        Ok(None)
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
        processing_time_ms: 400,
        raw_ai_response: None,
        special_situation: SpecialSituation::None,
        profile_content: ExtractedLayers::new(),
        is_milestone: false,
    }
}

struct World {
    store: Arc<MemoryAnalysisStore>,
    vectors: Arc<FlakyVectors>,
    monitor: PipelineMonitor,
    auto_retry: AutoRetryManager,
    channel: Arc<MemoryChannel>,
}

fn world() -> World {
    let store = Arc::new(MemoryAnalysisStore::new());
    let vectors = Arc::new(FlakyVectors::default());

    let dispatcher = Arc::new(AlertDispatcher::new());
    let channel = Arc::new(MemoryChannel::new());
    let notifier = GroupingNotifier::new(
        AlertConfig {
            enabled: true,
            max_per_type: 5,
            window: Duration::from_secs(3600),
            group_window: Duration::from_secs(60),
            admin_ids: vec![1001],
        },
        channel.clone(),
    );
    dispatcher.add_sink(Arc::new(notifier));

    let monitor = PipelineMonitor::new(
        store.clone(),
        dispatcher,
        MonitorConfig {
            stuck_threshold: Duration::from_secs(300),
            ..Default::default()
        },
    );

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
    let auto_retry = AutoRetryManager::new(
        store.clone(),
        pipeline,
        AutoRetryConfig {
            base_delay: Duration::ZERO,
            ..Default::default()
        },
    );

    World {
        store,
        vectors,
        monitor,
        auto_retry,
        channel,
    }
}

#[tokio::test]
async fn stuck_task_alerts_once_then_auto_retry_recovers() {
    let world = world();

    // R1: deep phase done five minutes ago, vectorization lane failed
    // transiently, profile lane finished.
    let id = world.store.insert(record(42)).await.unwrap();
    world
        .store
        .set_lane_status(
            id,
            Lane::Vectorization,
            LaneStatus::Pending,
            LaneStatus::Failed,
            Some("connection timeout"),
        )
        .await
        .unwrap();
    world
        .store
        .set_lane_status(id, Lane::DpUpdate, LaneStatus::Pending, LaneStatus::Success, None)
        .await
        .unwrap();
    world.store.age_record(id, Duration::from_secs(310));

    // The monitor raises one CRITICAL stuck_task with minutes_stuck ≈ 5.
    assert_eq!(world.monitor.check_stuck_tasks().await.unwrap(), 1);
    let alerts = world.monitor.dispatcher().recent(10);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "stuck_task");
    let minutes = alerts[0].details["minutes_stuck"].as_f64().unwrap();
    assert!((5.0..6.5).contains(&minutes));

    // A second pass while still stuck stays quiet for the same key.
    assert_eq!(world.monitor.check_stuck_tasks().await.unwrap(), 0);

    // Auto-retry classifies the timeout as recoverable and re-runs the
    // lane against a recovered vector store.
    *world.vectors.healthy.lock() = true;
    let stats = world.auto_retry.run_once().await.unwrap();
    assert_eq!(stats.attempted, 1);
    assert_eq!(stats.succeeded, 1);

    let recovered = world.store.get(id).await.unwrap().unwrap();
    assert_eq!(recovered.vectorization_status, LaneStatus::Success);
    assert!(recovered.vectorization_error.is_none());
    assert!(recovered.background_task_completed);
    assert_eq!(recovered.retry_count, 1);

    // Recovered: no further stuck alerts for this record.
    assert_eq!(world.monitor.check_stuck_tasks().await.unwrap(), 0);
}

#[tokio::test]
async fn grouped_notification_reaches_the_admin_channel() {
    let world = world();

    for i in 0..5 {
        let id = world.store.insert(record(i)).await.unwrap();
        world.store.age_record(id, Duration::from_secs(600));
    }

    let dispatched = world.monitor.check_stuck_tasks().await.unwrap();
    assert_eq!(dispatched, 5);

    // Five alerts of one type flush as a single grouped message.
    let messages = world.channel.messages();
    assert_eq!(messages.len(), 1);
    let (chat_id, text) = &messages[0];
    assert_eq!(*chat_id, 1001);
    assert!(text.contains("stuck_task x5"));
    assert!(text.contains("+ 2 more"));
}

#[tokio::test]
async fn permanent_errors_stay_failed_and_alert_keeps_severity() {
    let world = world();

    let id = world.store.insert(record(42)).await.unwrap();
    world
        .store
        .set_lane_status(
            id,
            Lane::DpUpdate,
            LaneStatus::Pending,
            LaneStatus::Failed,
            Some("invalid format in profile content"),
        )
        .await
        .unwrap();

    let stats = world.auto_retry.run_once().await.unwrap();
    assert_eq!(stats.skipped_non_recoverable, 1);
    assert_eq!(stats.succeeded, 0);

    let row = world.store.get(id).await.unwrap().unwrap();
    assert_eq!(row.dp_update_status, LaneStatus::Failed);
}
