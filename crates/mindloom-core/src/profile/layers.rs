//! Layered personality profile model.
//!
//! A profile is ten layers of tagged items. Items are identified inside a
//! layer by a category-specific key (goal text, activity name, …) and carry
//! optional attributes (`status`, `priority`, `type`, `impact`). Layers are
//! persisted as JSON columns; the deep-merge rules live in
//! [`crate::profile::merge`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The profile layers, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileLayer {
    /// Who the user is.
    Identity,
    /// What they enjoy.
    Interests,
    /// What they pursue.
    Goals,
    /// What stands in the way.
    Barriers,
    /// People around them.
    Relationships,
    /// What they hold important.
    Values,
    /// Their present situation.
    CurrentState,
    /// What they can do.
    Skills,
    /// What they have lived through.
    Experiences,
    /// Physical and mental wellbeing.
    Health,
}

impl ProfileLayer {
    /// Every layer, in storage order.
    pub const ALL: [ProfileLayer; 10] = [
        ProfileLayer::Identity,
        ProfileLayer::Interests,
        ProfileLayer::Goals,
        ProfileLayer::Barriers,
        ProfileLayer::Relationships,
        ProfileLayer::Values,
        ProfileLayer::CurrentState,
        ProfileLayer::Skills,
        ProfileLayer::Experiences,
        ProfileLayer::Health,
    ];

    /// Column name of this layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileLayer::Identity => "identity",
            ProfileLayer::Interests => "interests",
            ProfileLayer::Goals => "goals",
            ProfileLayer::Barriers => "barriers",
            ProfileLayer::Relationships => "relationships",
            ProfileLayer::Values => "values",
            ProfileLayer::CurrentState => "current_state",
            ProfileLayer::Skills => "skills",
            ProfileLayer::Experiences => "experiences",
            ProfileLayer::Health => "health",
        }
    }
}

/// One tagged item inside a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileItem {
    /// Category-specific key, e.g. the goal text or activity name.
    pub key: String,
    /// `active` / `inactive`; `inactive` in a newer record retires the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Importance; higher keeps an older record's attributes on conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    /// Category refinement, e.g. `long_term` for a goal.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    /// Free-form impact note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    /// Any further attributes the analysis produced.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ProfileItem {
    /// An item with just a key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: None,
            priority: None,
            item_type: None,
            impact: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set the status.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the type refinement.
    pub fn with_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = Some(item_type.into());
        self
    }

    /// Set the impact note.
    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact = Some(impact.into());
        self
    }

    /// Whether the item is retired.
    pub fn is_inactive(&self) -> bool {
        self.status.as_deref() == Some("inactive")
    }
}

/// Layer content: items in insertion order.
pub type LayerItems = Vec<ProfileItem>;

/// The versioned, layered personality profile of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalityProfile {
    /// Owning user.
    pub user_id: i64,
    /// Layer → items.
    pub layers: BTreeMap<ProfileLayer, LayerItems>,
    /// Analysis records merged into this profile so far.
    pub total_answers_analyzed: i64,
    /// Deterministic function of which layers are populated, in [0, 1].
    pub completeness_score: f64,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl PersonalityProfile {
    /// An empty profile for `user_id`.
    pub fn empty(user_id: i64) -> Self {
        Self {
            user_id,
            layers: BTreeMap::new(),
            total_answers_analyzed: 0,
            completeness_score: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Items in one layer.
    pub fn layer(&self, layer: ProfileLayer) -> &[ProfileItem] {
        self.layers.get(&layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Fraction of layers that have at least one item.
    pub fn compute_completeness(&self) -> f64 {
        let populated = ProfileLayer::ALL
            .iter()
            .filter(|layer| !self.layer(**layer).is_empty())
            .count();
        populated as f64 / ProfileLayer::ALL.len() as f64
    }
}
