//! Profile and trait-history storage backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};

use super::layers::{LayerItems, PersonalityProfile, ProfileLayer};

/// Errors from profile storage.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// The underlying store failed.
    #[error("profile storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for ProfileError {
    fn from(e: sqlx::Error) -> Self {
        ProfileError::Storage(e.to_string())
    }
}

/// One append-only trait measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitHistoryEntry {
    /// Owning user.
    pub user_id: i64,
    /// Trait name, e.g. `openness`.
    pub trait_name: String,
    /// Measured value.
    pub value: f64,
    /// Measurement time.
    pub recorded_at: DateTime<Utc>,
}

/// Storage for [`PersonalityProfile`] rows.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Load a user's profile, if any.
    async fn load(&self, user_id: i64) -> Result<Option<PersonalityProfile>, ProfileError>;

    /// Upsert a profile.
    async fn save(&self, profile: &PersonalityProfile) -> Result<(), ProfileError>;
}

/// Append-only storage for trait history.
#[async_trait]
pub trait TraitHistoryStore: Send + Sync {
    /// Append one measurement.
    async fn append(&self, entry: &TraitHistoryEntry) -> Result<(), ProfileError>;

    /// The most recent entry for `(user, trait)`.
    async fn latest(
        &self,
        user_id: i64,
        trait_name: &str,
    ) -> Result<Option<TraitHistoryEntry>, ProfileError>;

    /// The last `limit` entries for `(user, trait)`, oldest first.
    async fn window(
        &self,
        user_id: i64,
        trait_name: &str,
        limit: usize,
    ) -> Result<Vec<TraitHistoryEntry>, ProfileError>;
}

// ---------------------------------------------------------------------------
// In-memory backends
// ---------------------------------------------------------------------------

/// In-process profile store for tests.
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<i64, PersonalityProfile>>,
}

impl MemoryProfileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load(&self, user_id: i64) -> Result<Option<PersonalityProfile>, ProfileError> {
        Ok(self.profiles.lock().get(&user_id).cloned())
    }

    async fn save(&self, profile: &PersonalityProfile) -> Result<(), ProfileError> {
        self.profiles.lock().insert(profile.user_id, profile.clone());
        Ok(())
    }
}

/// In-process trait history for tests.
#[derive(Default)]
pub struct MemoryTraitHistoryStore {
    entries: Mutex<Vec<TraitHistoryEntry>>,
}

impl MemoryTraitHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TraitHistoryStore for MemoryTraitHistoryStore {
    async fn append(&self, entry: &TraitHistoryEntry) -> Result<(), ProfileError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    async fn latest(
        &self,
        user_id: i64,
        trait_name: &str,
    ) -> Result<Option<TraitHistoryEntry>, ProfileError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.user_id == user_id && e.trait_name == trait_name)
            .max_by_key(|e| e.recorded_at)
            .cloned())
    }

    async fn window(
        &self,
        user_id: i64,
        trait_name: &str,
        limit: usize,
    ) -> Result<Vec<TraitHistoryEntry>, ProfileError> {
        let entries = self.entries.lock();
        let mut matching: Vec<TraitHistoryEntry> = entries
            .iter()
            .filter(|e| e.user_id == user_id && e.trait_name == trait_name)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.recorded_at);
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres backends
// ---------------------------------------------------------------------------

/// Postgres profile store over `digital_personality` (one JSON column per
/// layer).
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn load(&self, user_id: i64) -> Result<Option<PersonalityProfile>, ProfileError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, identity, interests, goals, barriers, relationships,
                   "values", current_state, skills, experiences, health,
                   total_answers_analyzed, completeness_score, updated_at
            FROM digital_personality
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let mut layers: BTreeMap<ProfileLayer, LayerItems> = BTreeMap::new();
        for layer in ProfileLayer::ALL {
            let column = match layer {
                ProfileLayer::Values => "values",
                other => other.as_str(),
            };
            let value: Option<serde_json::Value> = row.try_get(column)?;
            if let Some(value) = value {
                let items: LayerItems = serde_json::from_value(value)
                    .map_err(|e| ProfileError::Storage(format!("layer {column}: {e}")))?;
                if !items.is_empty() {
                    layers.insert(layer, items);
                }
            }
        }

        Ok(Some(PersonalityProfile {
            user_id: row.try_get("user_id")?,
            layers,
            total_answers_analyzed: row.try_get("total_answers_analyzed")?,
            completeness_score: row.try_get("completeness_score")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save(&self, profile: &PersonalityProfile) -> Result<(), ProfileError> {
        let layer_json = |layer: ProfileLayer| -> Result<serde_json::Value, ProfileError> {
            serde_json::to_value(profile.layer(layer))
                .map_err(|e| ProfileError::Storage(e.to_string()))
        };

        sqlx::query(
            r#"
            INSERT INTO digital_personality
                (user_id, identity, interests, goals, barriers, relationships,
                 "values", current_state, skills, experiences, health,
                 total_answers_analyzed, completeness_score, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                identity = EXCLUDED.identity,
                interests = EXCLUDED.interests,
                goals = EXCLUDED.goals,
                barriers = EXCLUDED.barriers,
                relationships = EXCLUDED.relationships,
                "values" = EXCLUDED."values",
                current_state = EXCLUDED.current_state,
                skills = EXCLUDED.skills,
                experiences = EXCLUDED.experiences,
                health = EXCLUDED.health,
                total_answers_analyzed = EXCLUDED.total_answers_analyzed,
                completeness_score = EXCLUDED.completeness_score,
                updated_at = NOW()
            "#,
        )
        .bind(profile.user_id)
        .bind(layer_json(ProfileLayer::Identity)?)
        .bind(layer_json(ProfileLayer::Interests)?)
        .bind(layer_json(ProfileLayer::Goals)?)
        .bind(layer_json(ProfileLayer::Barriers)?)
        .bind(layer_json(ProfileLayer::Relationships)?)
        .bind(layer_json(ProfileLayer::Values)?)
        .bind(layer_json(ProfileLayer::CurrentState)?)
        .bind(layer_json(ProfileLayer::Skills)?)
        .bind(layer_json(ProfileLayer::Experiences)?)
        .bind(layer_json(ProfileLayer::Health)?)
        .bind(profile.total_answers_analyzed)
        .bind(profile.completeness_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Postgres trait history over `trait_history`.
pub struct PgTraitHistoryStore {
    pool: PgPool,
}

impl PgTraitHistoryStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<TraitHistoryEntry, ProfileError> {
        Ok(TraitHistoryEntry {
            user_id: row.try_get("user_id")?,
            trait_name: row.try_get("trait_name")?,
            value: row.try_get("value")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[async_trait]
impl TraitHistoryStore for PgTraitHistoryStore {
    async fn append(&self, entry: &TraitHistoryEntry) -> Result<(), ProfileError> {
        sqlx::query(
            r#"
            INSERT INTO trait_history (user_id, trait_name, value, recorded_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.trait_name)
        .bind(entry.value)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(
        &self,
        user_id: i64,
        trait_name: &str,
    ) -> Result<Option<TraitHistoryEntry>, ProfileError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, trait_name, value, recorded_at
            FROM trait_history
            WHERE user_id = $1 AND trait_name = $2
            ORDER BY recorded_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(trait_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn window(
        &self,
        user_id: i64,
        trait_name: &str,
        limit: usize,
    ) -> Result<Vec<TraitHistoryEntry>, ProfileError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, trait_name, value, recorded_at
            FROM trait_history
            WHERE user_id = $1 AND trait_name = $2
            ORDER BY recorded_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(trait_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<TraitHistoryEntry> = rows
            .iter()
            .map(Self::entry_from_row)
            .collect::<Result<_, _>>()?;
        entries.reverse();
        Ok(entries)
    }
}
