//! Session and answer storage backends.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::types::{Session, SessionStatus};

/// Errors from session storage.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The underlying store failed.
    #[error("session storage error: {0}")]
    Storage(String),
    /// The user has no active session.
    #[error("no active session for user {0}")]
    NoActiveSession(i64),
}

impl From<sqlx::Error> for SessionError {
    fn from(e: sqlx::Error) -> Self {
        SessionError::Storage(e.to_string())
    }
}

/// Storage backend for sessions and answers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a fresh ACTIVE session.
    async fn create_session(&self, user_id: i64) -> Result<Session, SessionError>;

    /// The user's ACTIVE session, if any.
    async fn get_active(&self, user_id: i64) -> Result<Option<Session>, SessionError>;

    /// Persist session fields.
    async fn update(&self, session: &Session) -> Result<(), SessionError>;

    /// Mark every ACTIVE session of the user ABANDONED. Returns how many.
    async fn abandon_active(&self, user_id: i64) -> Result<u64, SessionError>;

    /// Store one answer row. Returns its id.
    async fn record_answer(
        &self,
        session_id: i64,
        user_id: i64,
        question_id: &str,
        answer_text: &str,
    ) -> Result<i64, SessionError>;

    /// Question ids the user has answered across all sessions.
    async fn answered_question_ids(&self, user_id: i64) -> Result<HashSet<String>, SessionError>;

    /// ACTIVE sessions idle past `older_than`, for timeout sweeps.
    async fn stale_active(&self, older_than: Duration) -> Result<Vec<Session>, SessionError>;
}

/// Source of admin-flagged question ids; flagged questions are never
/// offered.
#[async_trait]
pub trait FlaggedQuestions: Send + Sync {
    /// Ids currently flagged for admin review.
    async fn flagged_ids(&self) -> Result<HashSet<String>, SessionError>;
}

// ---------------------------------------------------------------------------
// In-memory backends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct AnswerRow {
    user_id: i64,
    question_id: String,
}

/// In-process session store for tests.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<i64, Session>>,
    answers: Mutex<Vec<AnswerRow>>,
    next_session_id: Mutex<i64>,
    next_answer_id: Mutex<i64>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind a session's `started_at` for timeout tests.
    pub fn age_session(&self, id: i64, by: Duration) {
        if let Some(session) = self.sessions.lock().get_mut(&id) {
            session.started_at =
                session.started_at - ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, user_id: i64) -> Result<Session, SessionError> {
        let mut next_id = self.next_session_id.lock();
        *next_id += 1;
        let session = Session {
            id: *next_id,
            user_id,
            started_at: Utc::now(),
            completed_at: None,
            status: SessionStatus::Active,
            questions_asked: 0,
            questions_answered: 0,
            heavy_count: 0,
            domains_covered: BTreeSet::new(),
            current_question: None,
            last_strategy: None,
        };
        self.sessions.lock().insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_active(&self, user_id: i64) -> Result<Option<Session>, SessionError> {
        Ok(self
            .sessions
            .lock()
            .values()
            .find(|s| s.user_id == user_id && s.status == SessionStatus::Active)
            .cloned())
    }

    async fn update(&self, session: &Session) -> Result<(), SessionError> {
        self.sessions.lock().insert(session.id, session.clone());
        Ok(())
    }

    async fn abandon_active(&self, user_id: i64) -> Result<u64, SessionError> {
        let mut count = 0;
        for session in self.sessions.lock().values_mut() {
            if session.user_id == user_id && session.status == SessionStatus::Active {
                session.status = SessionStatus::Abandoned;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn record_answer(
        &self,
        _session_id: i64,
        user_id: i64,
        question_id: &str,
        _answer_text: &str,
    ) -> Result<i64, SessionError> {
        let mut next_id = self.next_answer_id.lock();
        *next_id += 1;
        self.answers.lock().push(AnswerRow {
            user_id,
            question_id: question_id.to_string(),
        });
        Ok(*next_id)
    }

    async fn answered_question_ids(&self, user_id: i64) -> Result<HashSet<String>, SessionError> {
        Ok(self
            .answers
            .lock()
            .iter()
            .filter(|a| a.user_id == user_id)
            .map(|a| a.question_id.clone())
            .collect())
    }

    async fn stale_active(&self, older_than: Duration) -> Result<Vec<Session>, SessionError> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(older_than).unwrap_or(ChronoDuration::zero());
        Ok(self
            .sessions
            .lock()
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.started_at < cutoff)
            .cloned()
            .collect())
    }
}

/// In-process flagged-question source for tests.
#[derive(Default)]
pub struct MemoryFlaggedQuestions {
    ids: Mutex<HashSet<String>>,
}

impl MemoryFlaggedQuestions {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a question.
    pub fn flag(&self, id: impl Into<String>) {
        self.ids.lock().insert(id.into());
    }
}

#[async_trait]
impl FlaggedQuestions for MemoryFlaggedQuestions {
    async fn flagged_ids(&self) -> Result<HashSet<String>, SessionError> {
        Ok(self.ids.lock().clone())
    }
}

// ---------------------------------------------------------------------------
// Postgres backends
// ---------------------------------------------------------------------------

/// Postgres session store over `onboarding_sessions` and `user_answers`.
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<Session, SessionError> {
        let status: String = row.try_get("status")?;
        let status = match status.as_str() {
            "active" => SessionStatus::Active,
            "abandoned" => SessionStatus::Abandoned,
            "completed" => SessionStatus::Completed,
            other => {
                return Err(SessionError::Storage(format!("unknown session status: {other}")))
            }
        };
        let domains: serde_json::Value = row.try_get("domains_covered")?;
        let domains_covered: BTreeSet<String> =
            serde_json::from_value(domains).unwrap_or_default();

        Ok(Session {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            status,
            questions_asked: row.try_get("questions_asked")?,
            questions_answered: row.try_get("questions_answered")?,
            heavy_count: row.try_get("heavy_count")?,
            domains_covered,
            current_question: row.try_get("current_question")?,
            last_strategy: row.try_get("last_strategy")?,
        })
    }
}

const SESSION_COLUMNS: &str = r#"
    id, user_id, started_at, completed_at, status, questions_asked,
    questions_answered, heavy_count, domains_covered, current_question,
    last_strategy
"#;

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_session(&self, user_id: i64) -> Result<Session, SessionError> {
        let query = format!(
            r#"
            INSERT INTO onboarding_sessions
                (user_id, started_at, status, questions_asked, questions_answered,
                 heavy_count, domains_covered)
            VALUES ($1, NOW(), 'active', 0, 0, 0, '[]'::jsonb)
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query).bind(user_id).fetch_one(&self.pool).await?;
        Self::session_from_row(&row)
    }

    async fn get_active(&self, user_id: i64) -> Result<Option<Session>, SessionError> {
        let query = format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM onboarding_sessions
            WHERE user_id = $1 AND status = 'active'
            ORDER BY started_at DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn update(&self, session: &Session) -> Result<(), SessionError> {
        sqlx::query(
            r#"
            UPDATE onboarding_sessions
            SET completed_at = $2, status = $3, questions_asked = $4,
                questions_answered = $5, heavy_count = $6, domains_covered = $7,
                current_question = $8, last_strategy = $9
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session.completed_at)
        .bind(session.status.as_str())
        .bind(session.questions_asked)
        .bind(session.questions_answered)
        .bind(session.heavy_count)
        .bind(
            serde_json::to_value(&session.domains_covered)
                .map_err(|e| SessionError::Storage(e.to_string()))?,
        )
        .bind(&session.current_question)
        .bind(&session.last_strategy)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn abandon_active(&self, user_id: i64) -> Result<u64, SessionError> {
        let result = sqlx::query(
            r#"
            UPDATE onboarding_sessions
            SET status = 'abandoned'
            WHERE user_id = $1 AND status = 'active'
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_answer(
        &self,
        session_id: i64,
        user_id: i64,
        question_id: &str,
        answer_text: &str,
    ) -> Result<i64, SessionError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO user_answers (session_id, user_id, question_id, answer_text, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING id
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(question_id)
        .bind(answer_text)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn answered_question_ids(&self, user_id: i64) -> Result<HashSet<String>, SessionError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT question_id FROM user_answers WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn stale_active(&self, older_than: Duration) -> Result<Vec<Session>, SessionError> {
        let query = format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM onboarding_sessions
            WHERE status = 'active'
              AND started_at < NOW() - (INTERVAL '1 second' * $1)
            "#
        );
        let rows = sqlx::query(&query)
            .bind(older_than.as_secs() as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::session_from_row).collect()
    }
}

/// Flagged questions backed by `questions_metadata`.
pub struct PgFlaggedQuestions {
    pool: PgPool,
}

impl PgFlaggedQuestions {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlaggedQuestions for PgFlaggedQuestions {
    async fn flagged_ids(&self) -> Result<HashSet<String>, SessionError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT json_id FROM questions_metadata WHERE is_flagged = TRUE",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}
