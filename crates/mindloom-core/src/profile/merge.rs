//! Deep-merge rules for layered profile content.
//!
//! Items are identified by `(layer, key)`. On conflict the newer record's
//! attributes win, except when the older item carries a higher priority or
//! a more specific type — then attributes merge field-wise with the old
//! values kept. `status = inactive` in the newer record always retires the
//! item. Merging the same content twice leaves the profile unchanged.

use std::collections::BTreeMap;

use super::layers::{LayerItems, PersonalityProfile, ProfileItem, ProfileLayer};

/// Content extracted from one analysis, keyed by layer.
pub type ExtractedLayers = BTreeMap<ProfileLayer, LayerItems>;

/// Outcome of one merge application.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Items added for the first time.
    pub added: usize,
    /// Existing items whose attributes changed.
    pub updated: usize,
    /// Items retired by an inactive status.
    pub retired: usize,
    /// `(layer, key)` pairs skipped because the merge rules could not
    /// resolve them. Logged; may surface as `insight.generated`.
    pub conflicts: Vec<(ProfileLayer, String)>,
}

impl MergeOutcome {
    /// Whether anything changed.
    pub fn changed(&self) -> bool {
        self.added > 0 || self.updated > 0 || self.retired > 0
    }
}

/// Merge `extracted` into `profile` in place, per the rules above.
///
/// Does not touch `total_answers_analyzed`; the writer increments it once
/// per accepted record so re-applying the same record stays idempotent.
pub fn merge_into(profile: &mut PersonalityProfile, extracted: &ExtractedLayers) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for (layer, new_items) in extracted {
        let existing = profile.layers.entry(*layer).or_default();

        for new_item in new_items {
            if new_item.key.trim().is_empty() {
                // Keyless items cannot be identified; skip and record.
                outcome.conflicts.push((*layer, new_item.key.clone()));
                tracing::warn!(layer = layer.as_str(), "profile item without key skipped");
                continue;
            }

            match existing.iter_mut().find(|item| item.key == new_item.key) {
                None => {
                    existing.push(new_item.clone());
                    outcome.added += 1;
                }
                Some(current) => {
                    let merged = merge_item(current, new_item);
                    match merged {
                        ItemMerge::Unchanged => {}
                        ItemMerge::Updated => outcome.updated += 1,
                        ItemMerge::Retired => outcome.retired += 1,
                    }
                }
            }
        }
    }

    if outcome.changed() {
        profile.completeness_score = profile.compute_completeness();
        profile.updated_at = chrono::Utc::now();
    }

    outcome
}

enum ItemMerge {
    Unchanged,
    Updated,
    Retired,
}

/// Whether the old item's attributes should survive a conflict.
fn old_wins(current: &ProfileItem, incoming: &ProfileItem) -> bool {
    let old_priority = current.priority.unwrap_or(0.0);
    let new_priority = incoming.priority.unwrap_or(0.0);
    if old_priority > new_priority {
        return true;
    }
    // A typed item is more specific than an untyped one.
    current.item_type.is_some() && incoming.item_type.is_none()
}

fn merge_item(current: &mut ProfileItem, incoming: &ProfileItem) -> ItemMerge {
    if current == incoming {
        return ItemMerge::Unchanged;
    }

    // A newer inactive status retires the item regardless of who wins.
    let retiring = incoming.is_inactive() && !current.is_inactive();

    if old_wins(current, incoming) {
        // Field-wise merge: keep old values, fill gaps from the new record.
        let mut changed = false;
        if current.status.is_none() && incoming.status.is_some() {
            current.status = incoming.status.clone();
            changed = true;
        }
        if current.priority.is_none() && incoming.priority.is_some() {
            current.priority = incoming.priority;
            changed = true;
        }
        if current.item_type.is_none() && incoming.item_type.is_some() {
            current.item_type = incoming.item_type.clone();
            changed = true;
        }
        if current.impact.is_none() && incoming.impact.is_some() {
            current.impact = incoming.impact.clone();
            changed = true;
        }
        for (k, v) in &incoming.extra {
            if !current.extra.contains_key(k) {
                current.extra.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        if retiring {
            current.status = Some("inactive".into());
            return ItemMerge::Retired;
        }
        if changed {
            ItemMerge::Updated
        } else {
            ItemMerge::Unchanged
        }
    } else {
        // Newer record wins: overwrite present attributes, keep old ones the
        // new record does not mention.
        let mut changed = false;
        if incoming.status.is_some() && current.status != incoming.status {
            current.status = incoming.status.clone();
            changed = true;
        }
        if incoming.priority.is_some() && current.priority != incoming.priority {
            current.priority = incoming.priority;
            changed = true;
        }
        if incoming.item_type.is_some() && current.item_type != incoming.item_type {
            current.item_type = incoming.item_type.clone();
            changed = true;
        }
        if incoming.impact.is_some() && current.impact != incoming.impact {
            current.impact = incoming.impact.clone();
            changed = true;
        }
        for (k, v) in &incoming.extra {
            if current.extra.get(k) != Some(v) {
                current.extra.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        if retiring {
            return ItemMerge::Retired;
        }
        if changed {
            ItemMerge::Updated
        } else {
            ItemMerge::Unchanged
        }
    }
}
