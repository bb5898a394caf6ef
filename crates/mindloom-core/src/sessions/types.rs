//! Session and question-catalog types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// In progress; at most one per user.
    Active,
    /// Superseded by a newer session or timed out.
    Abandoned,
    /// Finished all its blocks.
    Completed,
}

impl SessionStatus {
    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Abandoned => "abandoned",
            SessionStatus::Completed => "completed",
        }
    }
}

/// Question-block kind, gating the onboarding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    /// Must complete before any exploration block.
    Foundation,
    /// The configurable middle; resistance can pivot between these.
    Exploration,
    /// Available only after every exploration block is complete.
    Integration,
}

/// One catalog question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Catalog id, e.g. `q_001`.
    pub id: String,
    /// Prompt text.
    pub text: String,
    /// Topical domain, e.g. `career`.
    pub domain: String,
    /// 1 (surface) to 5 (deep).
    pub depth_level: i32,
    /// `light` or `heavy`; heavy questions count against fatigue.
    pub energy: String,
    /// Owning cluster.
    pub cluster_id: String,
}

impl Question {
    /// Whether the question is emotionally demanding.
    pub fn is_heavy(&self) -> bool {
        self.energy == "heavy"
    }
}

/// A cluster of questions inside a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Catalog id.
    pub id: String,
    /// Block kind this cluster belongs to.
    pub block: BlockKind,
    /// Questions in catalog order.
    pub question_ids: Vec<String>,
}

/// One onboarding session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Session id.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time, when finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Questions shown so far.
    pub questions_asked: i32,
    /// Questions answered so far.
    pub questions_answered: i32,
    /// Heavy questions answered, the fatigue input.
    pub heavy_count: i32,
    /// Domains touched so far.
    pub domains_covered: BTreeSet<String>,
    /// Question currently awaiting an answer.
    pub current_question: Option<String>,
    /// Strategy tag from the last selector decision.
    pub last_strategy: Option<String>,
}

impl Session {
    /// Fatigue signal in [0, 1]: grows with answered volume and heavy
    /// questions.
    pub fn fatigue(&self) -> f64 {
        let volume = self.questions_answered as f64 / 30.0;
        let weight = self.heavy_count as f64 / 8.0;
        (volume + weight).min(1.0)
    }
}
