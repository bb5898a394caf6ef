//! Profile write path.
//!
//! Applies the layered content extracted by a deep analysis to the user's
//! [`PersonalityProfile`] with the deep-merge rules, bumps the analyzed
//! counter, recomputes completeness, and notifies listeners (the dossier
//! cache) that the profile changed.

use std::sync::Arc;

use async_trait::async_trait;

use super::layers::PersonalityProfile;
use super::merge::{merge_into, ExtractedLayers, MergeOutcome};
use super::store::{ProfileError, ProfileStore};

/// Notified after every profile write. The coach context assembler uses
/// this to invalidate its cached dossier.
#[async_trait]
pub trait ProfileWriteListener: Send + Sync {
    /// Called after the profile for `user_id` was saved.
    async fn profile_updated(&self, user_id: i64);
}

/// Applies analysis content to profiles.
pub struct ProfileWriter {
    store: Arc<dyn ProfileStore>,
    listeners: Vec<Arc<dyn ProfileWriteListener>>,
}

impl ProfileWriter {
    /// Create a writer over `store`.
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            store,
            listeners: Vec::new(),
        }
    }

    /// Register a write listener.
    pub fn add_listener(&mut self, listener: Arc<dyn ProfileWriteListener>) {
        self.listeners.push(listener);
    }

    /// Merge `extracted` into the user's profile and persist.
    ///
    /// The caller gates re-application (the analysis pipeline flips
    /// `dp_update_status` with compare-and-set before invoking this), so a
    /// record is counted in `total_answers_analyzed` exactly once.
    pub async fn apply_analysis(
        &self,
        user_id: i64,
        extracted: &ExtractedLayers,
    ) -> Result<MergeOutcome, ProfileError> {
        let mut profile = self
            .store
            .load(user_id)
            .await?
            .unwrap_or_else(|| PersonalityProfile::empty(user_id));

        let outcome = merge_into(&mut profile, extracted);
        for (layer, key) in &outcome.conflicts {
            tracing::warn!(
                user_id,
                layer = layer.as_str(),
                key = %key,
                "profile merge conflict, item skipped"
            );
        }

        profile.total_answers_analyzed += 1;
        profile.completeness_score = profile.compute_completeness();
        profile.updated_at = chrono::Utc::now();
        self.store.save(&profile).await?;

        tracing::info!(
            user_id,
            added = outcome.added,
            updated = outcome.updated,
            retired = outcome.retired,
            total_answers = profile.total_answers_analyzed,
            completeness = profile.completeness_score,
            "profile updated"
        );

        for listener in &self.listeners {
            listener.profile_updated(user_id).await;
        }

        Ok(outcome)
    }

    /// Load the current profile.
    pub async fn load(&self, user_id: i64) -> Result<Option<PersonalityProfile>, ProfileError> {
        self.store.load(user_id).await
    }
}
