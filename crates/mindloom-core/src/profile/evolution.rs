//! Trait evolution: significance detection and pattern tagging.
//!
//! Every `trait.extracted` event appends to the trait history; when the
//! change against the previous value crosses the significance threshold,
//! `trait.evolution.detected` is published with both values, the delta and
//! a pattern tag computed over a rolling window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::events::{catalog, EventBus};

use super::store::{ProfileError, TraitHistoryEntry, TraitHistoryStore};

/// Advisory trend tag over a trait's rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendPattern {
    /// Monotonic growth at or above the threshold over the window.
    Increasing,
    /// Monotonic decline at or above the threshold over the window.
    Decreasing,
    /// Sign of change flips repeatedly.
    Oscillating,
    /// Variance below the floor, or nothing else fits.
    Stable,
}

impl TrendPattern {
    /// Tag name used in event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendPattern::Increasing => "increasing",
            TrendPattern::Decreasing => "decreasing",
            TrendPattern::Oscillating => "oscillating",
            TrendPattern::Stable => "stable",
        }
    }
}

/// Evolution tuning. The per-trait significance map exists because the
/// right delta differs per trait and is deliberately configurable.
#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    /// Default significant-change threshold.
    pub significance_threshold: f64,
    /// Per-trait overrides of the threshold.
    pub per_trait_thresholds: HashMap<String, f64>,
    /// Rolling window length for pattern tagging.
    pub window: usize,
    /// Minimum total movement for a monotonic tag.
    pub monotonic_min_delta: f64,
    /// Sign flips needed for the oscillating tag.
    pub oscillation_min_flips: usize,
    /// Variance below this is stable regardless of shape.
    pub stable_variance_floor: f64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            significance_threshold: 0.15,
            per_trait_thresholds: HashMap::new(),
            window: 10,
            monotonic_min_delta: 0.1,
            oscillation_min_flips: 3,
            stable_variance_floor: 1e-4,
        }
    }
}

impl EvolutionConfig {
    fn threshold_for(&self, trait_name: &str) -> f64 {
        self.per_trait_thresholds
            .get(trait_name)
            .copied()
            .unwrap_or(self.significance_threshold)
    }
}

/// Classify the trend over a window of values (oldest first).
pub fn classify_pattern(values: &[f64], config: &EvolutionConfig) -> TrendPattern {
    if values.len() < 3 {
        return TrendPattern::Stable;
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    if variance < config.stable_variance_floor {
        return TrendPattern::Stable;
    }

    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let total: f64 = values[values.len() - 1] - values[0];

    if diffs.iter().all(|d| *d >= 0.0) && total >= config.monotonic_min_delta {
        return TrendPattern::Increasing;
    }
    if diffs.iter().all(|d| *d <= 0.0) && -total >= config.monotonic_min_delta {
        return TrendPattern::Decreasing;
    }

    let flips = diffs
        .windows(2)
        .filter(|pair| pair[0] * pair[1] < 0.0)
        .count();
    if flips >= config.oscillation_min_flips {
        return TrendPattern::Oscillating;
    }

    TrendPattern::Stable
}

/// A significant trait change.
#[derive(Debug, Clone)]
pub struct EvolutionSignal {
    /// Trait name.
    pub trait_name: String,
    /// Previous value.
    pub old_value: f64,
    /// New value.
    pub new_value: f64,
    /// `new - old`.
    pub delta: f64,
    /// Trend over the rolling window.
    pub pattern: TrendPattern,
}

/// Consumes extracted traits, maintains history, and publishes evolution
/// signals.
pub struct TraitEvolutionWriter {
    history: Arc<dyn TraitHistoryStore>,
    bus: Arc<EventBus>,
    config: EvolutionConfig,
}

impl TraitEvolutionWriter {
    /// Create a writer.
    pub fn new(
        history: Arc<dyn TraitHistoryStore>,
        bus: Arc<EventBus>,
        config: EvolutionConfig,
    ) -> Self {
        Self {
            history,
            bus,
            config,
        }
    }

    /// Record one extracted trait value.
    ///
    /// Appends to the history; when the change against the previous value
    /// crosses the trait's significance threshold, publishes
    /// `trait.evolution.detected` and returns the signal.
    pub async fn record_trait(
        &self,
        user_id: i64,
        trait_name: &str,
        value: f64,
        analysis_id: i64,
    ) -> Result<Option<EvolutionSignal>, ProfileError> {
        let previous = self.history.latest(user_id, trait_name).await?;

        self.history
            .append(&TraitHistoryEntry {
                user_id,
                trait_name: trait_name.to_string(),
                value,
                recorded_at: Utc::now(),
            })
            .await?;

        let Some(previous) = previous else {
            return Ok(None);
        };

        let delta = value - previous.value;
        if delta.abs() < self.config.threshold_for(trait_name) {
            return Ok(None);
        }

        let window = self
            .history
            .window(user_id, trait_name, self.config.window)
            .await?;
        let values: Vec<f64> = window.iter().map(|e| e.value).collect();
        let pattern = classify_pattern(&values, &self.config);

        let signal = EvolutionSignal {
            trait_name: trait_name.to_string(),
            old_value: previous.value,
            new_value: value,
            delta,
            pattern,
        };

        tracing::info!(
            user_id,
            trait_name,
            old = previous.value,
            new = value,
            delta,
            pattern = pattern.as_str(),
            "significant trait change detected"
        );

        let publish = self
            .bus
            .publish(
                catalog::TRAIT_EVOLUTION_DETECTED,
                serde_json::json!({
                    "user_id": user_id,
                    "trait_name": trait_name,
                    "old": previous.value,
                    "new": value,
                    "delta": delta,
                    "pattern_tag": pattern.as_str(),
                    "analysis_id": analysis_id,
                }),
                None,
            )
            .await;
        if let Err(e) = publish {
            // The history append already landed; the signal is advisory.
            tracing::warn!(user_id, trait_name, error = %e, "failed to publish evolution event");
        }

        Ok(Some(signal))
    }
}
