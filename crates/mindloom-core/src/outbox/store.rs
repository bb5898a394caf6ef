//! Outbox row model and storage backends.
//!
//! The relay and cleaner work against [`OutboxStore`]; production uses
//! [`PgOutboxStore`] over the `event_outbox` table, tests use
//! [`MemoryOutboxStore`]. Terminal status writes are compare-and-set on
//! `(status, retry_count)` so two relay instances never lose a publication
//! (duplicates are fine, consumers are idempotent).

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::error::truncate_error;

/// Longest error message persisted on a row.
pub const MAX_ERROR_LEN: usize = 500;

/// Status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Awaiting publication.
    Pending,
    /// Published to the bus; terminal success.
    Published,
    /// Exhausted retries; terminal DLQ.
    Failed,
}

impl OutboxStatus {
    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    /// Parse the column representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// One row of the `event_outbox` table.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    /// Monotonic id.
    pub id: i64,
    /// Event type, e.g. `user.answer.submitted`.
    pub event_type: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Lifecycle status.
    pub status: OutboxStatus,
    /// Publication attempts so far. Strictly non-decreasing.
    pub retry_count: i32,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Set when the relay succeeded.
    pub published_at: Option<DateTime<Utc>>,
    /// Last publication error, truncated.
    pub last_error: Option<String>,
    /// Distributed-tracing id.
    pub trace_id: Option<String>,
}

/// Errors from outbox storage.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// The underlying store failed.
    #[error("outbox storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for OutboxError {
    fn from(e: sqlx::Error) -> Self {
        OutboxError::Storage(e.to_string())
    }
}

/// Storage backend for the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a PENDING row. Returns its id.
    ///
    /// Note: this path wraps its own transaction. For same-transaction
    /// publishing use [`crate::outbox::OutboxPublisher`].
    async fn insert(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        trace_id: Option<&str>,
    ) -> Result<i64, OutboxError>;

    /// Rows eligible for the relay: PENDING, under the retry cap, and past
    /// their exponential backoff window. Ordered by `created_at` ascending.
    async fn fetch_eligible(
        &self,
        max_retries: i32,
        backoff_base: f64,
        limit: i64,
    ) -> Result<Vec<OutboxRow>, OutboxError>;

    /// CAS PENDING → PUBLISHED. Returns false when the row no longer has
    /// the expected `(PENDING, retry_count)` state.
    async fn mark_published(&self, id: i64, expected_retry_count: i32)
        -> Result<bool, OutboxError>;

    /// CAS PENDING → FAILED with a truncated error.
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        expected_retry_count: i32,
    ) -> Result<bool, OutboxError>;

    /// Bump `retry_count` and store the truncated error, leaving PENDING.
    async fn increment_retry(
        &self,
        id: i64,
        error: &str,
        expected_retry_count: i32,
    ) -> Result<bool, OutboxError>;

    /// Delete PUBLISHED rows older than `days`. Returns rows removed.
    async fn delete_published_older_than(&self, days: i64) -> Result<u64, OutboxError>;

    /// Delete FAILED rows older than `days`. Returns rows removed.
    async fn delete_failed_older_than(&self, days: i64) -> Result<u64, OutboxError>;

    /// FAILED rows, newest first, for debugging and manual recovery.
    async fn list_failed(&self, limit: i64) -> Result<Vec<OutboxRow>, OutboxError>;

    /// Reset a FAILED row to PENDING with `retry_count = 0`.
    async fn retry_failed(&self, id: i64) -> Result<bool, OutboxError>;

    /// Fetch one row by id.
    async fn get(&self, id: i64) -> Result<Option<OutboxRow>, OutboxError>;

    /// Count rows in a status. Used by the monitor for queue depth.
    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64, OutboxError>;
}

fn backoff_elapsed(row_created: DateTime<Utc>, retry_count: i32, base: f64, now: DateTime<Utc>) -> bool {
    if retry_count == 0 {
        return true;
    }
    let delay_secs = base.powi(retry_count);
    row_created + ChronoDuration::milliseconds((delay_secs * 1000.0) as i64) < now
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-process outbox store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryOutboxStore {
    rows: Mutex<Vec<OutboxRow>>,
    next_id: Mutex<i64>,
}

impl MemoryOutboxStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind a row's `created_at`, so backoff windows can be crossed in
    /// tests without sleeping.
    pub fn age_row(&self, id: i64, by: std::time::Duration) {
        let mut rows = self.rows.lock();
        if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
            row.created_at =
                row.created_at - ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn insert(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        trace_id: Option<&str>,
    ) -> Result<i64, OutboxError> {
        let mut next_id = self.next_id.lock();
        *next_id += 1;
        let id = *next_id;
        self.rows.lock().push(OutboxRow {
            id,
            event_type: event_type.to_string(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            published_at: None,
            last_error: None,
            trace_id: trace_id.map(String::from),
        });
        Ok(id)
    }

    async fn fetch_eligible(
        &self,
        max_retries: i32,
        backoff_base: f64,
        limit: i64,
    ) -> Result<Vec<OutboxRow>, OutboxError> {
        let now = Utc::now();
        let rows = self.rows.lock();
        let mut eligible: Vec<OutboxRow> = rows
            .iter()
            .filter(|r| {
                r.status == OutboxStatus::Pending
                    && r.retry_count < max_retries
                    && backoff_elapsed(r.created_at, r.retry_count, backoff_base, now)
            })
            .cloned()
            .collect();
        eligible.sort_by_key(|r| r.created_at);
        eligible.truncate(limit as usize);
        Ok(eligible)
    }

    async fn mark_published(
        &self,
        id: i64,
        expected_retry_count: i32,
    ) -> Result<bool, OutboxError> {
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| {
            r.id == id
                && r.status == OutboxStatus::Pending
                && r.retry_count == expected_retry_count
        }) {
            Some(row) => {
                row.status = OutboxStatus::Published;
                row.published_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        expected_retry_count: i32,
    ) -> Result<bool, OutboxError> {
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| {
            r.id == id
                && r.status == OutboxStatus::Pending
                && r.retry_count == expected_retry_count
        }) {
            Some(row) => {
                row.status = OutboxStatus::Failed;
                row.retry_count += 1;
                row.last_error = Some(truncate_error(error, MAX_ERROR_LEN));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_retry(
        &self,
        id: i64,
        error: &str,
        expected_retry_count: i32,
    ) -> Result<bool, OutboxError> {
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| {
            r.id == id
                && r.status == OutboxStatus::Pending
                && r.retry_count == expected_retry_count
        }) {
            Some(row) => {
                row.retry_count += 1;
                row.last_error = Some(truncate_error(error, MAX_ERROR_LEN));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_published_older_than(&self, days: i64) -> Result<u64, OutboxError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|r| {
            !(r.status == OutboxStatus::Published
                && r.published_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - rows.len()) as u64)
    }

    async fn delete_failed_older_than(&self, days: i64) -> Result<u64, OutboxError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|r| !(r.status == OutboxStatus::Failed && r.created_at < cutoff));
        Ok((before - rows.len()) as u64)
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<OutboxRow>, OutboxError> {
        let rows = self.rows.lock();
        let mut failed: Vec<OutboxRow> = rows
            .iter()
            .filter(|r| r.status == OutboxStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        failed.truncate(limit as usize);
        Ok(failed)
    }

    async fn retry_failed(&self, id: i64) -> Result<bool, OutboxError> {
        let mut rows = self.rows.lock();
        match rows
            .iter_mut()
            .find(|r| r.id == id && r.status == OutboxStatus::Failed)
        {
            Some(row) => {
                row.status = OutboxStatus::Pending;
                row.retry_count = 0;
                row.last_error = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxRow>, OutboxError> {
        Ok(self.rows.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64, OutboxError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| r.status == status)
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

/// Postgres-backed outbox store over the `event_outbox` table.
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_from_pg(row: &sqlx::postgres::PgRow) -> Result<OutboxRow, OutboxError> {
        let status: String = row.try_get("status")?;
        Ok(OutboxRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: OutboxStatus::parse(&status)
                .ok_or_else(|| OutboxError::Storage(format!("unknown outbox status: {status}")))?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            last_error: row.try_get("last_error")?,
            trace_id: row.try_get("trace_id")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        trace_id: Option<&str>,
    ) -> Result<i64, OutboxError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO event_outbox (event_type, payload, status, retry_count, created_at, trace_id)
            VALUES ($1, $2, 'pending', 0, NOW(), $3)
            RETURNING id
            "#,
        )
        .bind(event_type)
        .bind(&payload)
        .bind(trace_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn fetch_eligible(
        &self,
        max_retries: i32,
        backoff_base: f64,
        limit: i64,
    ) -> Result<Vec<OutboxRow>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, payload, status, retry_count, created_at,
                   published_at, last_error, trace_id
            FROM event_outbox
            WHERE status = 'pending'
              AND retry_count < $1
              AND (
                retry_count = 0
                OR created_at + (INTERVAL '1 second' * POW($2, retry_count)) < NOW()
              )
            ORDER BY created_at
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(max_retries)
        .bind(backoff_base)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_from_pg).collect()
    }

    async fn mark_published(
        &self,
        id: i64,
        expected_retry_count: i32,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'published', published_at = NOW()
            WHERE id = $1 AND status = 'pending' AND retry_count = $2
            "#,
        )
        .bind(id)
        .bind(expected_retry_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        expected_retry_count: i32,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'failed', retry_count = retry_count + 1, last_error = $2
            WHERE id = $1 AND status = 'pending' AND retry_count = $3
            "#,
        )
        .bind(id)
        .bind(truncate_error(error, MAX_ERROR_LEN))
        .bind(expected_retry_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment_retry(
        &self,
        id: i64,
        error: &str,
        expected_retry_count: i32,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET retry_count = retry_count + 1, last_error = $2
            WHERE id = $1 AND status = 'pending' AND retry_count = $3
            "#,
        )
        .bind(id)
        .bind(truncate_error(error, MAX_ERROR_LEN))
        .bind(expected_retry_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_published_older_than(&self, days: i64) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM event_outbox
            WHERE status = 'published'
              AND published_at < NOW() - (INTERVAL '1 day' * $1)
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_failed_older_than(&self, days: i64) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM event_outbox
            WHERE status = 'failed'
              AND created_at < NOW() - (INTERVAL '1 day' * $1)
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<OutboxRow>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, payload, status, retry_count, created_at,
                   published_at, last_error, trace_id
            FROM event_outbox
            WHERE status = 'failed'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_from_pg).collect()
    }

    async fn retry_failed(&self, id: i64) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'pending', retry_count = 0, last_error = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxRow>, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT id, event_type, payload, status, retry_count, created_at,
                   published_at, last_error, trace_id
            FROM event_outbox
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_from_pg).transpose()
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64, OutboxError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM event_outbox WHERE status = $1",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}
