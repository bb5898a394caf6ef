//! The deep-analysis record.
//!
//! Inserted once by the deep phase and immutable afterwards, except for the
//! two background status lanes (vectorization, profile update) and the
//! retry counters the auto-retry manager maintains.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::ExtractedLayers;

/// Version tag stamped on trait scores produced by this pipeline.
pub const TRAIT_SCORES_VERSION: &str = "v2";

/// What the analysis was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    /// A user answer.
    Answer(i64),
    /// A free-form context story.
    ContextStory(i64),
}

/// Status of one background lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneStatus {
    /// Not attempted yet.
    Pending,
    /// Terminal success.
    Success,
    /// Terminal failure; the auto-retry manager may reset it.
    Failed,
}

impl LaneStatus {
    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LaneStatus::Pending => "pending",
            LaneStatus::Success => "success",
            LaneStatus::Failed => "failed",
        }
    }

    /// Parse the column representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LaneStatus::Pending),
            "success" => Some(LaneStatus::Success),
            "failed" => Some(LaneStatus::Failed),
            _ => None,
        }
    }

    /// Whether the lane reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LaneStatus::Pending)
    }
}

/// The two background lanes of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Embedding computation and vector-store upsert.
    Vectorization,
    /// Profile deep-merge.
    DpUpdate,
}

impl Lane {
    /// Lane name used in logs and alerts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Vectorization => "vectorization",
            Lane::DpUpdate => "dp_update",
        }
    }
}

/// Special-situation tag for downstream routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialSituation {
    /// Nothing unusual.
    #[default]
    None,
    /// Crisis markers; escalate.
    Crisis,
    /// A breakthrough moment.
    Breakthrough,
    /// The user is resisting the process.
    Resistance,
}

impl SpecialSituation {
    /// Tag used in event payloads and the storage column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialSituation::None => "none",
            SpecialSituation::Crisis => "crisis",
            SpecialSituation::Breakthrough => "breakthrough",
            SpecialSituation::Resistance => "resistance",
        }
    }
}

/// Nested trait scores. `big_five` and the version tag are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitScores {
    /// The Big-Five dimensions.
    pub big_five: BTreeMap<String, f64>,
    /// Session-to-session dynamic traits.
    #[serde(default)]
    pub dynamic: BTreeMap<String, f64>,
    /// Adaptive traits (coping, flexibility).
    #[serde(default)]
    pub adaptive: BTreeMap<String, f64>,
    /// Domain-specific traits (career, relationships, …).
    #[serde(default)]
    pub domain_specific: BTreeMap<String, f64>,
    /// Scoring schema version.
    pub version: String,
}

impl TraitScores {
    /// Empty scores at the current version.
    pub fn empty() -> Self {
        Self {
            big_five: BTreeMap::new(),
            dynamic: BTreeMap::new(),
            adaptive: BTreeMap::new(),
            domain_specific: BTreeMap::new(),
            version: TRAIT_SCORES_VERSION.to_string(),
        }
    }

    /// All `(name, value)` pairs across the nests, big-five first.
    pub fn all_traits(&self) -> Vec<(String, f64)> {
        self.big_five
            .iter()
            .chain(self.dynamic.iter())
            .chain(self.adaptive.iter())
            .chain(self.domain_specific.iter())
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// The authoritative deep-analysis record.
#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    /// Record id.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// What was analyzed.
    pub source_ref: SourceRef,
    /// Analyzer version.
    pub analysis_version: String,
    /// Dominant emotional state of the source text.
    pub emotional_state: String,
    /// Nested trait scores.
    pub trait_scores: TraitScores,
    /// Structured insights.
    pub insights: serde_json::Value,
    /// Hints for future routing decisions.
    pub router_hints: serde_json::Value,
    /// Model self-assessed output quality, [0, 1].
    pub quality_score: f64,
    /// Model confidence, [0, 1].
    pub confidence_score: f64,
    /// Which model produced the record.
    pub model_used: String,
    /// Deep-phase wall time.
    pub processing_time_ms: i64,
    /// Raw model output, for reprocessing.
    pub raw_ai_response: Option<String>,
    /// Special-situation tag.
    pub special_situation: SpecialSituation,
    /// Layered profile content to merge (drives the DP lane).
    pub profile_content: ExtractedLayers,
    /// Vectorization lane.
    pub vectorization_status: LaneStatus,
    /// Vectorization lane error.
    pub vectorization_error: Option<String>,
    /// Vectorization completion time.
    pub vectorization_completed_at: Option<DateTime<Utc>>,
    /// Profile-update lane.
    pub dp_update_status: LaneStatus,
    /// Profile-update lane error.
    pub dp_update_error: Option<String>,
    /// Profile-update completion time.
    pub dp_update_completed_at: Option<DateTime<Utc>>,
    /// Auto-retry attempts so far.
    pub retry_count: i32,
    /// Last auto-retry time.
    pub last_retry_at: Option<DateTime<Utc>>,
    /// True once both lanes are terminal.
    pub background_task_completed: bool,
    /// Aggregate duration of the background work.
    pub background_task_duration_ms: Option<i64>,
    /// Marked for milestone records (first analysis, breakthroughs).
    pub is_milestone: bool,
    /// Deep-phase completion time.
    pub processed_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// Status of one lane.
    pub fn lane_status(&self, lane: Lane) -> LaneStatus {
        match lane {
            Lane::Vectorization => self.vectorization_status,
            Lane::DpUpdate => self.dp_update_status,
        }
    }

    /// Persisted error of one lane.
    pub fn lane_error(&self, lane: Lane) -> Option<&str> {
        match lane {
            Lane::Vectorization => self.vectorization_error.as_deref(),
            Lane::DpUpdate => self.dp_update_error.as_deref(),
        }
    }

    /// Whether both lanes are terminal.
    pub fn lanes_terminal(&self) -> bool {
        self.vectorization_status.is_terminal() && self.dp_update_status.is_terminal()
    }
}
