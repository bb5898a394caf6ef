//! Analysis record storage backends.
//!
//! Lane-status updates are compare-and-set on the previous status so a
//! worker and the auto-retry manager can race without clobbering each
//! other's terminal writes. The monitor reads this store asynchronously;
//! none of its queries sit in the hot path.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::truncate_error;
use crate::profile::ExtractedLayers;

use super::record::{
    AnalysisRecord, Lane, LaneStatus, SourceRef, SpecialSituation, TraitScores,
};

/// Longest lane error persisted.
const MAX_LANE_ERROR_LEN: usize = 500;

/// Errors from analysis storage.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// The underlying store failed.
    #[error("analysis storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for AnalysisError {
    fn from(e: sqlx::Error) -> Self {
        AnalysisError::Storage(e.to_string())
    }
}

/// Fields of a record at insertion time; lanes start PENDING.
#[derive(Debug, Clone)]
pub struct NewAnalysisRecord {
    /// Owning user.
    pub user_id: i64,
    /// What was analyzed.
    pub source_ref: SourceRef,
    /// Analyzer version.
    pub analysis_version: String,
    /// Dominant emotional state.
    pub emotional_state: String,
    /// Nested trait scores.
    pub trait_scores: TraitScores,
    /// Structured insights.
    pub insights: serde_json::Value,
    /// Routing hints.
    pub router_hints: serde_json::Value,
    /// Output quality, [0, 1].
    pub quality_score: f64,
    /// Model confidence, [0, 1].
    pub confidence_score: f64,
    /// Producing model.
    pub model_used: String,
    /// Deep-phase wall time.
    pub processing_time_ms: i64,
    /// Raw model output.
    pub raw_ai_response: Option<String>,
    /// Special-situation tag.
    pub special_situation: SpecialSituation,
    /// Layered content for the profile merge.
    pub profile_content: ExtractedLayers,
    /// Milestone flag.
    pub is_milestone: bool,
}

/// Per-lane counts over a window.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneCounts {
    /// Lanes still pending.
    pub pending: u64,
    /// Terminal successes.
    pub success: u64,
    /// Terminal failures.
    pub failed: u64,
}

impl LaneCounts {
    /// Success rate over terminal outcomes; 1.0 with no terminal outcomes.
    pub fn success_rate(&self) -> f64 {
        let terminal = self.success + self.failed;
        if terminal == 0 {
            1.0
        } else {
            self.success as f64 / terminal as f64
        }
    }
}

/// Aggregates the metric collector samples each pass.
#[derive(Debug, Clone, Default)]
pub struct PipelineWindowStats {
    /// Records processed in the window.
    pub records: u64,
    /// Mean deep-phase latency.
    pub avg_processing_ms: f64,
    /// Mean background duration over completed records.
    pub avg_background_ms: f64,
    /// Vectorization lane counts.
    pub vectorization: LaneCounts,
    /// Profile-update lane counts.
    pub dp_update: LaneCounts,
}

/// Storage backend for analysis records.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Insert a record with both lanes PENDING. Returns its id.
    async fn insert(&self, record: NewAnalysisRecord) -> Result<i64, AnalysisError>;

    /// Fetch one record.
    async fn get(&self, id: i64) -> Result<Option<AnalysisRecord>, AnalysisError>;

    /// CAS a lane from `from` to `to`, storing a truncated error on
    /// failure statuses. Returns false when the lane was not in `from`.
    async fn set_lane_status(
        &self,
        id: i64,
        lane: Lane,
        from: LaneStatus,
        to: LaneStatus,
        error: Option<&str>,
    ) -> Result<bool, AnalysisError>;

    /// Mark the background work complete with its aggregate duration.
    async fn complete_background(&self, id: i64, duration_ms: i64) -> Result<(), AnalysisError>;

    /// Bump `retry_count` and stamp `last_retry_at`.
    async fn record_retry(&self, id: i64) -> Result<(), AnalysisError>;

    /// Records whose lane is still PENDING.
    async fn lane_pending_count(&self, lane: Lane) -> Result<u64, AnalysisError>;

    /// Records with incomplete background work older than `older_than`.
    async fn stuck_records(&self, older_than: Duration) -> Result<Vec<AnalysisRecord>, AnalysisError>;

    /// Completed records in the window whose background duration exceeded
    /// `threshold_ms`.
    async fn slow_records(
        &self,
        threshold_ms: i64,
        window: Duration,
    ) -> Result<Vec<AnalysisRecord>, AnalysisError>;

    /// Records with a FAILED lane and retry budget left, for auto-retry.
    async fn failed_lane_records(
        &self,
        lane: Lane,
        max_retries: i32,
    ) -> Result<Vec<AnalysisRecord>, AnalysisError>;

    /// Window aggregates for the metric collector.
    async fn window_stats(&self, window: Duration) -> Result<PipelineWindowStats, AnalysisError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-process analysis store for tests.
#[derive(Default)]
pub struct MemoryAnalysisStore {
    records: Mutex<HashMap<i64, AnalysisRecord>>,
    next_id: Mutex<i64>,
}

impl MemoryAnalysisStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind a record's `processed_at` for stuck/slow detector tests.
    pub fn age_record(&self, id: i64, by: Duration) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.processed_at =
                record.processed_at - ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        }
    }
}

#[async_trait]
impl AnalysisStore for MemoryAnalysisStore {
    async fn insert(&self, record: NewAnalysisRecord) -> Result<i64, AnalysisError> {
        let mut next_id = self.next_id.lock();
        *next_id += 1;
        let id = *next_id;

        self.records.lock().insert(
            id,
            AnalysisRecord {
                id,
                user_id: record.user_id,
                source_ref: record.source_ref,
                analysis_version: record.analysis_version,
                emotional_state: record.emotional_state,
                trait_scores: record.trait_scores,
                insights: record.insights,
                router_hints: record.router_hints,
                quality_score: record.quality_score,
                confidence_score: record.confidence_score,
                model_used: record.model_used,
                processing_time_ms: record.processing_time_ms,
                raw_ai_response: record.raw_ai_response,
                special_situation: record.special_situation,
                profile_content: record.profile_content,
                vectorization_status: LaneStatus::Pending,
                vectorization_error: None,
                vectorization_completed_at: None,
                dp_update_status: LaneStatus::Pending,
                dp_update_error: None,
                dp_update_completed_at: None,
                retry_count: 0,
                last_retry_at: None,
                background_task_completed: false,
                background_task_duration_ms: None,
                is_milestone: record.is_milestone,
                processed_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<AnalysisRecord>, AnalysisError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn set_lane_status(
        &self,
        id: i64,
        lane: Lane,
        from: LaneStatus,
        to: LaneStatus,
        error: Option<&str>,
    ) -> Result<bool, AnalysisError> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&id) else {
            return Ok(false);
        };
        let truncated = error.map(|e| truncate_error(e, MAX_LANE_ERROR_LEN));
        let completed_at = to.is_terminal().then(Utc::now);

        match lane {
            Lane::Vectorization => {
                if record.vectorization_status != from {
                    return Ok(false);
                }
                record.vectorization_status = to;
                record.vectorization_error = truncated;
                record.vectorization_completed_at = completed_at;
            }
            Lane::DpUpdate => {
                if record.dp_update_status != from {
                    return Ok(false);
                }
                record.dp_update_status = to;
                record.dp_update_error = truncated;
                record.dp_update_completed_at = completed_at;
            }
        }
        Ok(true)
    }

    async fn complete_background(&self, id: i64, duration_ms: i64) -> Result<(), AnalysisError> {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.background_task_completed = true;
            record.background_task_duration_ms = Some(duration_ms);
        }
        Ok(())
    }

    async fn record_retry(&self, id: i64) -> Result<(), AnalysisError> {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.retry_count += 1;
            record.last_retry_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn lane_pending_count(&self, lane: Lane) -> Result<u64, AnalysisError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.lane_status(lane) == LaneStatus::Pending)
            .count() as u64)
    }

    async fn stuck_records(
        &self,
        older_than: Duration,
    ) -> Result<Vec<AnalysisRecord>, AnalysisError> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(older_than).unwrap_or(ChronoDuration::zero());
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| !r.background_task_completed && r.processed_at < cutoff)
            .cloned()
            .collect())
    }

    async fn slow_records(
        &self,
        threshold_ms: i64,
        window: Duration,
    ) -> Result<Vec<AnalysisRecord>, AnalysisError> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| {
                r.processed_at >= cutoff
                    && r.background_task_duration_ms
                        .map(|d| d > threshold_ms)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn failed_lane_records(
        &self,
        lane: Lane,
        max_retries: i32,
    ) -> Result<Vec<AnalysisRecord>, AnalysisError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.lane_status(lane) == LaneStatus::Failed && r.retry_count < max_retries)
            .cloned()
            .collect())
    }

    async fn window_stats(&self, window: Duration) -> Result<PipelineWindowStats, AnalysisError> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
        let records = self.records.lock();
        let in_window: Vec<&AnalysisRecord> = records
            .values()
            .filter(|r| r.processed_at >= cutoff)
            .collect();

        let mut stats = PipelineWindowStats {
            records: in_window.len() as u64,
            ..Default::default()
        };
        if in_window.is_empty() {
            return Ok(stats);
        }

        stats.avg_processing_ms = in_window
            .iter()
            .map(|r| r.processing_time_ms as f64)
            .sum::<f64>()
            / in_window.len() as f64;

        let completed: Vec<i64> = in_window
            .iter()
            .filter_map(|r| r.background_task_duration_ms)
            .collect();
        if !completed.is_empty() {
            stats.avg_background_ms =
                completed.iter().map(|d| *d as f64).sum::<f64>() / completed.len() as f64;
        }

        for record in &in_window {
            for (lane, counts) in [
                (Lane::Vectorization, &mut stats.vectorization),
                (Lane::DpUpdate, &mut stats.dp_update),
            ] {
                match record.lane_status(lane) {
                    LaneStatus::Pending => counts.pending += 1,
                    LaneStatus::Success => counts.success += 1,
                    LaneStatus::Failed => counts.failed += 1,
                }
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

/// Postgres analysis store over `answer_analysis`.
pub struct PgAnalysisStore {
    pool: PgPool,
}

impl PgAnalysisStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn lane_columns(lane: Lane) -> (&'static str, &'static str, &'static str) {
        match lane {
            Lane::Vectorization => (
                "vectorization_status",
                "vectorization_error",
                "vectorization_completed_at",
            ),
            Lane::DpUpdate => ("dp_update_status", "dp_update_error", "dp_update_completed_at"),
        }
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<AnalysisRecord, AnalysisError> {
        let source_kind: String = row.try_get("source_kind")?;
        let source_id: i64 = row.try_get("source_id")?;
        let source_ref = match source_kind.as_str() {
            "answer" => SourceRef::Answer(source_id),
            "context_story" => SourceRef::ContextStory(source_id),
            other => {
                return Err(AnalysisError::Storage(format!("unknown source kind: {other}")))
            }
        };

        let parse_lane = |value: String| {
            LaneStatus::parse(&value)
                .ok_or_else(|| AnalysisError::Storage(format!("unknown lane status: {value}")))
        };
        let special: String = row.try_get("special_situation")?;
        let special_situation = match special.as_str() {
            "none" => SpecialSituation::None,
            "crisis" => SpecialSituation::Crisis,
            "breakthrough" => SpecialSituation::Breakthrough,
            "resistance" => SpecialSituation::Resistance,
            other => {
                return Err(AnalysisError::Storage(format!(
                    "unknown special situation: {other}"
                )))
            }
        };

        let trait_scores: serde_json::Value = row.try_get("trait_scores")?;
        let profile_content: serde_json::Value = row.try_get("profile_content")?;

        Ok(AnalysisRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            source_ref,
            analysis_version: row.try_get("analysis_version")?,
            emotional_state: row.try_get("emotional_state")?,
            trait_scores: serde_json::from_value(trait_scores)
                .map_err(|e| AnalysisError::Storage(format!("trait_scores: {e}")))?,
            insights: row.try_get("insights")?,
            router_hints: row.try_get("router_hints")?,
            quality_score: row.try_get("quality_score")?,
            confidence_score: row.try_get("confidence_score")?,
            model_used: row.try_get("model_used")?,
            processing_time_ms: row.try_get("processing_time_ms")?,
            raw_ai_response: row.try_get("raw_ai_response")?,
            special_situation,
            profile_content: serde_json::from_value(profile_content)
                .map_err(|e| AnalysisError::Storage(format!("profile_content: {e}")))?,
            vectorization_status: parse_lane(row.try_get("vectorization_status")?)?,
            vectorization_error: row.try_get("vectorization_error")?,
            vectorization_completed_at: row.try_get("vectorization_completed_at")?,
            dp_update_status: parse_lane(row.try_get("dp_update_status")?)?,
            dp_update_error: row.try_get("dp_update_error")?,
            dp_update_completed_at: row.try_get("dp_update_completed_at")?,
            retry_count: row.try_get("retry_count")?,
            last_retry_at: row.try_get("last_retry_at")?,
            background_task_completed: row.try_get("background_task_completed")?,
            background_task_duration_ms: row.try_get("background_task_duration_ms")?,
            is_milestone: row.try_get("is_milestone")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    id, user_id, source_kind, source_id, analysis_version, emotional_state,
    trait_scores, insights, router_hints, quality_score, confidence_score,
    model_used, processing_time_ms, raw_ai_response, special_situation,
    profile_content, vectorization_status, vectorization_error,
    vectorization_completed_at, dp_update_status, dp_update_error,
    dp_update_completed_at, retry_count, last_retry_at,
    background_task_completed, background_task_duration_ms, is_milestone,
    processed_at
"#;

#[async_trait]
impl AnalysisStore for PgAnalysisStore {
    async fn insert(&self, record: NewAnalysisRecord) -> Result<i64, AnalysisError> {
        let (source_kind, source_id) = match record.source_ref {
            SourceRef::Answer(id) => ("answer", id),
            SourceRef::ContextStory(id) => ("context_story", id),
        };

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO answer_analysis
                (user_id, source_kind, source_id, analysis_version, emotional_state,
                 trait_scores, insights, router_hints, quality_score, confidence_score,
                 model_used, processing_time_ms, raw_ai_response, special_situation,
                 profile_content, vectorization_status, dp_update_status, retry_count,
                 background_task_completed, is_milestone, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, 'pending', 'pending', 0, FALSE, $16, NOW())
            RETURNING id
            "#,
        )
        .bind(record.user_id)
        .bind(source_kind)
        .bind(source_id)
        .bind(&record.analysis_version)
        .bind(&record.emotional_state)
        .bind(
            serde_json::to_value(&record.trait_scores)
                .map_err(|e| AnalysisError::Storage(e.to_string()))?,
        )
        .bind(&record.insights)
        .bind(&record.router_hints)
        .bind(record.quality_score)
        .bind(record.confidence_score)
        .bind(&record.model_used)
        .bind(record.processing_time_ms)
        .bind(&record.raw_ai_response)
        .bind(record.special_situation.as_str())
        .bind(
            serde_json::to_value(&record.profile_content)
                .map_err(|e| AnalysisError::Storage(e.to_string()))?,
        )
        .bind(record.is_milestone)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<AnalysisRecord>, AnalysisError> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM answer_analysis WHERE id = $1");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn set_lane_status(
        &self,
        id: i64,
        lane: Lane,
        from: LaneStatus,
        to: LaneStatus,
        error: Option<&str>,
    ) -> Result<bool, AnalysisError> {
        let (status_col, error_col, completed_col) = Self::lane_columns(lane);
        let completed_expr = if to.is_terminal() { "NOW()" } else { "NULL" };
        let query = format!(
            r#"
            UPDATE answer_analysis
            SET {status_col} = $1, {error_col} = $2, {completed_col} = {completed_expr}
            WHERE id = $3 AND {status_col} = $4
            "#
        );
        let result = sqlx::query(&query)
            .bind(to.as_str())
            .bind(error.map(|e| truncate_error(e, MAX_LANE_ERROR_LEN)))
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_background(&self, id: i64, duration_ms: i64) -> Result<(), AnalysisError> {
        sqlx::query(
            r#"
            UPDATE answer_analysis
            SET background_task_completed = TRUE, background_task_duration_ms = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_retry(&self, id: i64) -> Result<(), AnalysisError> {
        sqlx::query(
            r#"
            UPDATE answer_analysis
            SET retry_count = retry_count + 1, last_retry_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lane_pending_count(&self, lane: Lane) -> Result<u64, AnalysisError> {
        let (status_col, _, _) = Self::lane_columns(lane);
        let query =
            format!("SELECT COUNT(*) FROM answer_analysis WHERE {status_col} = 'pending'");
        let count = sqlx::query_scalar::<_, i64>(&query).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn stuck_records(
        &self,
        older_than: Duration,
    ) -> Result<Vec<AnalysisRecord>, AnalysisError> {
        let query = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM answer_analysis
            WHERE background_task_completed = FALSE
              AND processed_at < NOW() - (INTERVAL '1 second' * $1)
            ORDER BY processed_at
            "#
        );
        let rows = sqlx::query(&query)
            .bind(older_than.as_secs() as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn slow_records(
        &self,
        threshold_ms: i64,
        window: Duration,
    ) -> Result<Vec<AnalysisRecord>, AnalysisError> {
        let query = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM answer_analysis
            WHERE processed_at >= NOW() - (INTERVAL '1 second' * $1)
              AND background_task_duration_ms > $2
            ORDER BY background_task_duration_ms DESC
            "#
        );
        let rows = sqlx::query(&query)
            .bind(window.as_secs() as i64)
            .bind(threshold_ms)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn failed_lane_records(
        &self,
        lane: Lane,
        max_retries: i32,
    ) -> Result<Vec<AnalysisRecord>, AnalysisError> {
        let (status_col, _, _) = Self::lane_columns(lane);
        let query = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM answer_analysis
            WHERE {status_col} = 'failed' AND retry_count < $1
            ORDER BY processed_at
            "#
        );
        let rows = sqlx::query(&query)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn window_stats(&self, window: Duration) -> Result<PipelineWindowStats, AnalysisError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS records,
                COALESCE(AVG(processing_time_ms), 0)::float8 AS avg_processing_ms,
                COALESCE(AVG(background_task_duration_ms), 0)::float8 AS avg_background_ms,
                COUNT(*) FILTER (WHERE vectorization_status = 'pending') AS vec_pending,
                COUNT(*) FILTER (WHERE vectorization_status = 'success') AS vec_success,
                COUNT(*) FILTER (WHERE vectorization_status = 'failed') AS vec_failed,
                COUNT(*) FILTER (WHERE dp_update_status = 'pending') AS dp_pending,
                COUNT(*) FILTER (WHERE dp_update_status = 'success') AS dp_success,
                COUNT(*) FILTER (WHERE dp_update_status = 'failed') AS dp_failed
            FROM answer_analysis
            WHERE processed_at >= NOW() - (INTERVAL '1 second' * $1)
            "#,
        )
        .bind(window.as_secs() as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(PipelineWindowStats {
            records: row.try_get::<i64, _>("records")? as u64,
            avg_processing_ms: row.try_get("avg_processing_ms")?,
            avg_background_ms: row.try_get("avg_background_ms")?,
            vectorization: LaneCounts {
                pending: row.try_get::<i64, _>("vec_pending")? as u64,
                success: row.try_get::<i64, _>("vec_success")? as u64,
                failed: row.try_get::<i64, _>("vec_failed")? as u64,
            },
            dp_update: LaneCounts {
                pending: row.try_get::<i64, _>("dp_pending")? as u64,
                success: row.try_get::<i64, _>("dp_success")? as u64,
                failed: row.try_get::<i64, _>("dp_failed")? as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(user_id: i64) -> NewAnalysisRecord {
        NewAnalysisRecord {
            user_id,
            source_ref: SourceRef::Answer(1),
            analysis_version: "v2".into(),
            emotional_state: "neutral".into(),
            trait_scores: TraitScores::empty(),
            insights: serde_json::json!({}),
            router_hints: serde_json::json!({}),
            quality_score: 0.8,
            confidence_score: 0.7,
            model_used: "claude-sonnet".into(),
            processing_time_ms: 1200,
            raw_ai_response: None,
            special_situation: SpecialSituation::None,
            profile_content: ExtractedLayers::new(),
            is_milestone: false,
        }
    }

    #[tokio::test]
    async fn insert_starts_with_pending_lanes() {
        let store = MemoryAnalysisStore::new();
        let id = store.insert(new_record(42)).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.vectorization_status, LaneStatus::Pending);
        assert_eq!(record.dp_update_status, LaneStatus::Pending);
        assert!(!record.background_task_completed);
    }

    #[tokio::test]
    async fn lane_cas_rejects_wrong_from_state() {
        let store = MemoryAnalysisStore::new();
        let id = store.insert(new_record(42)).await.unwrap();

        assert!(store
            .set_lane_status(id, Lane::Vectorization, LaneStatus::Pending, LaneStatus::Success, None)
            .await
            .unwrap());
        // Already terminal; a second worker loses.
        assert!(!store
            .set_lane_status(id, Lane::Vectorization, LaneStatus::Pending, LaneStatus::Failed, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stuck_and_slow_detection() {
        let store = MemoryAnalysisStore::new();
        let stuck_id = store.insert(new_record(1)).await.unwrap();
        let slow_id = store.insert(new_record(2)).await.unwrap();
        store.complete_background(slow_id, 25_000).await.unwrap();

        assert!(store
            .stuck_records(Duration::from_secs(300))
            .await
            .unwrap()
            .is_empty());

        store.age_record(stuck_id, Duration::from_secs(400));
        let stuck = store.stuck_records(Duration::from_secs(300)).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, stuck_id);

        let slow = store
            .slow_records(15_000, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].id, slow_id);
    }

    #[tokio::test]
    async fn window_stats_aggregate_lanes() {
        let store = MemoryAnalysisStore::new();
        let a = store.insert(new_record(1)).await.unwrap();
        let b = store.insert(new_record(2)).await.unwrap();

        store
            .set_lane_status(a, Lane::Vectorization, LaneStatus::Pending, LaneStatus::Success, None)
            .await
            .unwrap();
        store
            .set_lane_status(b, Lane::Vectorization, LaneStatus::Pending, LaneStatus::Failed, Some("timeout"))
            .await
            .unwrap();

        let stats = store.window_stats(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.vectorization.success, 1);
        assert_eq!(stats.vectorization.failed, 1);
        assert_eq!(stats.vectorization.success_rate(), 0.5);
        assert_eq!(stats.dp_update.pending, 2);
        assert_eq!(stats.dp_update.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn retry_bookkeeping() {
        let store = MemoryAnalysisStore::new();
        let id = store.insert(new_record(1)).await.unwrap();

        store
            .set_lane_status(id, Lane::DpUpdate, LaneStatus::Pending, LaneStatus::Failed, Some("timeout"))
            .await
            .unwrap();
        store.record_retry(id).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert!(record.last_retry_at.is_some());

        let retryable = store
            .failed_lane_records(Lane::DpUpdate, 3)
            .await
            .unwrap();
        assert_eq!(retryable.len(), 1);

        let exhausted = store.failed_lane_records(Lane::DpUpdate, 1).await.unwrap();
        assert!(exhausted.is_empty());
    }
}
