//! The two-phase analysis pipeline.
//!
//! Phase A (instant) produces a quick emotional tag and a short reflective
//! line on a small model and publishes `analysis.instant.completed`; it is
//! never essential, any failure still proceeds to Phase B. Phase B (deep)
//! produces the authoritative [`AnalysisRecord`], publishes
//! `analysis.completed` and `trait.extracted` per trait, then runs the two
//! background lanes (vectorization, profile merge), each with its own
//! status column.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::ai::{AiRouter, CompletionRequest, RouterError, RoutingContext, UserTier};
use crate::events::{catalog, BusError, EventBus};
use crate::profile::{ExtractedLayers, ProfileWriter};

use super::record::{Lane, LaneStatus, SourceRef, SpecialSituation, TraitScores};
use super::store::{AnalysisError, AnalysisStore, NewAnalysisRecord};
use super::vector::VectorStore;

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Version stamped on produced records.
    pub analysis_version: String,
    /// Output cap for the instant phase.
    pub instant_max_tokens: u32,
    /// Output cap for the deep phase.
    pub deep_max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_version: "v2".into(),
            instant_max_tokens: 150,
            deep_max_tokens: 2048,
        }
    }
}

/// What enters the pipeline: an answer or a context story.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    /// Owning user.
    pub user_id: i64,
    /// What is being analyzed.
    pub source_ref: SourceRef,
    /// The text to analyze.
    pub text: String,
    /// Tracing id carried through the published events.
    pub trace_id: Option<String>,
    /// The user's tier, for routing.
    pub tier: UserTier,
    /// True inside onboarding, forcing deep-complexity routing.
    pub is_onboarding: bool,
}

/// Phase A output.
#[derive(Debug, Clone, Deserialize)]
pub struct InstantResult {
    /// Quick emotional tag, e.g. `neutral`.
    pub quick_emotional: String,
    /// One short reflective line shown to the user immediately.
    pub quick_reflection: String,
}

/// Pipeline outcome for one input.
#[derive(Debug)]
pub struct ProcessSummary {
    /// Id of the inserted analysis record.
    pub analysis_id: i64,
    /// Phase A result, when the instant call succeeded.
    pub instant: Option<InstantResult>,
    /// Whether the deep output fell back to the emergency handler.
    pub emergency: bool,
}

/// Errors from the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The deep phase could not get any model output.
    #[error(transparent)]
    Router(#[from] RouterError),
    /// The analysis store failed.
    #[error(transparent)]
    Storage(#[from] AnalysisError),
    /// A publish failed.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// A lane was asked to run for a record that does not exist.
    #[error("analysis record {0} not found")]
    MissingRecord(i64),
}

/// The deep-phase output schema the model must produce.
#[derive(Debug, Deserialize)]
struct DeepOutput {
    emotional_state: String,
    trait_scores: TraitScores,
    #[serde(default)]
    insights: serde_json::Value,
    #[serde(default)]
    router_hints: serde_json::Value,
    #[serde(default = "default_score")]
    quality_score: f64,
    #[serde(default = "default_score")]
    confidence_score: f64,
    #[serde(default)]
    special_situation: SpecialSituation,
    #[serde(default)]
    profile_content: ExtractedLayers,
}

fn default_score() -> f64 {
    0.5
}

impl DeepOutput {
    /// The invariant a usable record must satisfy.
    fn is_valid(&self) -> bool {
        !self.trait_scores.big_five.is_empty() && !self.trait_scores.version.is_empty()
    }
}

/// The two-phase analysis pipeline.
pub struct AnalysisPipeline {
    router: Arc<AiRouter>,
    store: Arc<dyn AnalysisStore>,
    bus: Arc<EventBus>,
    vectors: Arc<dyn VectorStore>,
    profile_writer: Arc<ProfileWriter>,
    config: PipelineConfig,
}

impl AnalysisPipeline {
    /// Assemble a pipeline from its collaborators.
    pub fn new(
        router: Arc<AiRouter>,
        store: Arc<dyn AnalysisStore>,
        bus: Arc<EventBus>,
        vectors: Arc<dyn VectorStore>,
        profile_writer: Arc<ProfileWriter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            router,
            store,
            bus,
            vectors,
            profile_writer,
            config,
        }
    }

    /// Run both phases and the background lanes for one input.
    pub async fn process(&self, input: &AnalysisInput) -> Result<ProcessSummary, PipelineError> {
        // Phase A: never essential. Any failure is logged and Phase B runs.
        let instant = match self.instant_phase(input).await {
            Ok(instant) => Some(instant),
            Err(e) => {
                tracing::warn!(user_id = input.user_id, error = %e, "instant phase failed, continuing to deep phase");
                None
            }
        };

        let (analysis_id, emergency) = self.deep_phase(input).await?;
        self.run_background(analysis_id).await?;

        Ok(ProcessSummary {
            analysis_id,
            instant,
            emergency,
        })
    }

    /// Phase A: a small, fast model call and the instant event.
    pub async fn instant_phase(
        &self,
        input: &AnalysisInput,
    ) -> Result<InstantResult, PipelineError> {
        let request = CompletionRequest::new(format!(
            "Classify the emotional tone of this message and reply with JSON \
             {{\"quick_emotional\": \"...\", \"quick_reflection\": \"...\"}}:\n{}",
            input.text
        ))
        .with_max_tokens(self.config.instant_max_tokens);

        let routed = self
            .router
            .complete(
                input.tier,
                "quick classify emotional tone",
                request,
                &RoutingContext::default(),
            )
            .await?;

        let instant: InstantResult = serde_json::from_str(routed.completion.text.trim())
            .unwrap_or_else(|_| InstantResult {
                quick_emotional: "neutral".into(),
                quick_reflection: routed.completion.text.trim().to_string(),
            });

        let (answer_field, answer_id) = source_fields(input.source_ref);
        self.bus
            .publish(
                catalog::ANALYSIS_INSTANT_COMPLETED,
                serde_json::json!({
                    "user_id": input.user_id,
                    answer_field: answer_id,
                    "quick_emotional": instant.quick_emotional,
                    "quick_reflection": instant.quick_reflection,
                }),
                input.trace_id.clone(),
            )
            .await?;

        Ok(instant)
    }

    /// Phase B: the authoritative record. Returns `(id, emergency)`.
    pub async fn deep_phase(&self, input: &AnalysisInput) -> Result<(i64, bool), PipelineError> {
        let started = Instant::now();

        let request = CompletionRequest::new(format!(
            "Perform a deep psychological analysis of the following message. \
             Reply with JSON carrying emotional_state, trait_scores \
             (big_five plus version), insights, router_hints, quality_score, \
             confidence_score, special_situation and profile_content:\n{}",
            input.text
        ))
        .with_max_tokens(self.config.deep_max_tokens);

        let context = RoutingContext {
            is_onboarding: input.is_onboarding,
            deep_assessment: true,
            ..Default::default()
        };
        let routed = self
            .router
            .complete(input.tier, "deep psychological analysis", request, &context)
            .await?;
        let processing_time_ms = started.elapsed().as_millis() as i64;
        let raw = routed.completion.text.clone();

        let (output, emergency) = match serde_json::from_str::<DeepOutput>(raw.trim()) {
            Ok(output) if output.is_valid() => (output, false),
            Ok(_) | Err(_) => {
                // The transport succeeded but the output is unusable: fall
                // back to a minimal well-formed record so downstream
                // consumers never crash, and count it against the model.
                self.router.record_invalid_output(&routed.model);
                tracing::warn!(
                    user_id = input.user_id,
                    model = %routed.model,
                    "deep output failed schema validation, using emergency record"
                );
                (emergency_output(), true)
            }
        };

        let record = NewAnalysisRecord {
            user_id: input.user_id,
            source_ref: input.source_ref,
            analysis_version: self.config.analysis_version.clone(),
            emotional_state: output.emotional_state,
            trait_scores: output.trait_scores.clone(),
            insights: if emergency {
                serde_json::json!({"emergency_fallback": true})
            } else {
                output.insights
            },
            router_hints: output.router_hints,
            quality_score: output.quality_score,
            confidence_score: output.confidence_score,
            model_used: routed.model.clone(),
            processing_time_ms,
            raw_ai_response: Some(raw),
            special_situation: output.special_situation,
            profile_content: output.profile_content,
            is_milestone: matches!(
                output.special_situation,
                SpecialSituation::Breakthrough | SpecialSituation::Crisis
            ),
        };
        let trait_scores = record.trait_scores.clone();
        let special = record.special_situation;
        let analysis_id = self.store.insert(record).await?;

        self.bus
            .publish(
                catalog::ANALYSIS_COMPLETED,
                serde_json::json!({
                    "analysis_id": analysis_id,
                    "user_id": input.user_id,
                    "source_ref": input.source_ref,
                    "traits_summary": trait_scores.big_five,
                    "special_situation": special.as_str(),
                }),
                input.trace_id.clone(),
            )
            .await?;

        for (trait_name, value) in trait_scores.all_traits() {
            self.bus
                .publish(
                    catalog::TRAIT_EXTRACTED,
                    serde_json::json!({
                        "user_id": input.user_id,
                        "trait_name": trait_name,
                        "value": value,
                        "analysis_id": analysis_id,
                    }),
                    input.trace_id.clone(),
                )
                .await?;
        }

        Ok((analysis_id, emergency))
    }

    /// Run both background lanes and stamp completion.
    pub async fn run_background(&self, analysis_id: i64) -> Result<(), PipelineError> {
        let started = Instant::now();

        let (vec_result, dp_result) = tokio::join!(
            self.run_lane(analysis_id, Lane::Vectorization),
            self.run_lane(analysis_id, Lane::DpUpdate),
        );
        vec_result?;
        dp_result?;

        let record = self
            .store
            .get(analysis_id)
            .await?
            .ok_or(PipelineError::MissingRecord(analysis_id))?;
        if record.lanes_terminal() && !record.background_task_completed {
            self.store
                .complete_background(analysis_id, started.elapsed().as_millis() as i64)
                .await?;
        }
        Ok(())
    }

    /// Run one lane for a record. Used by the background pass and by the
    /// auto-retry manager after it reset a FAILED lane to PENDING.
    pub async fn run_lane(&self, analysis_id: i64, lane: Lane) -> Result<(), PipelineError> {
        let record = self
            .store
            .get(analysis_id)
            .await?
            .ok_or(PipelineError::MissingRecord(analysis_id))?;

        if record.lane_status(lane) != LaneStatus::Pending {
            return Ok(());
        }

        let outcome = match lane {
            Lane::Vectorization => self.vectorization_job(&record).await,
            Lane::DpUpdate => self.dp_update_job(&record).await,
        };

        match outcome {
            Ok(()) => {
                self.store
                    .set_lane_status(analysis_id, lane, LaneStatus::Pending, LaneStatus::Success, None)
                    .await?;
            }
            Err(error) => {
                tracing::warn!(
                    analysis_id,
                    lane = lane.as_str(),
                    error = %error,
                    "background lane failed"
                );
                self.store
                    .set_lane_status(
                        analysis_id,
                        lane,
                        LaneStatus::Pending,
                        LaneStatus::Failed,
                        Some(&error),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn vectorization_job(
        &self,
        record: &super::record::AnalysisRecord,
    ) -> Result<(), String> {
        let vector = featurize(&record.trait_scores);
        self.vectors
            .upsert(
                record.user_id,
                vector,
                serde_json::json!({
                    "analysis_id": record.id,
                    "emotional_state": record.emotional_state,
                    "analysis_version": record.analysis_version,
                }),
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn dp_update_job(
        &self,
        record: &super::record::AnalysisRecord,
    ) -> Result<(), String> {
        self.profile_writer
            .apply_analysis(record.user_id, &record.profile_content)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

fn source_fields(source: SourceRef) -> (&'static str, i64) {
    match source {
        SourceRef::Answer(id) => ("answer_id", id),
        SourceRef::ContextStory(id) => ("story_id", id),
    }
}

fn emergency_output() -> DeepOutput {
    let mut scores = TraitScores::empty();
    for dimension in [
        "openness",
        "conscientiousness",
        "extraversion",
        "agreeableness",
        "neuroticism",
    ] {
        scores.big_five.insert(dimension.into(), 0.5);
    }
    DeepOutput {
        emotional_state: "neutral".into(),
        trait_scores: scores,
        insights: serde_json::json!({}),
        router_hints: serde_json::json!({}),
        quality_score: 0.0,
        confidence_score: 0.0,
        special_situation: SpecialSituation::None,
        profile_content: ExtractedLayers::new(),
    }
}

/// Deterministic featurization of trait scores into an embedding-shaped
/// vector. The vector-store collaborator only contracts on success or
/// failure, not on layout.
fn featurize(scores: &TraitScores) -> Vec<f32> {
    scores
        .all_traits()
        .into_iter()
        .map(|(_, value)| value as f32)
        .collect()
}
