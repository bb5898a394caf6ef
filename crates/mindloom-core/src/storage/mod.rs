//! Storage contracts: pool construction and the embedded schema.
//!
//! The schema backs the outbox (C5/C6), the analysis record lanes (C9),
//! the profile and trait history (C11), and the monitor's queries (C13).
//! Columns added after the initial deployment are nullable so older rows
//! stay readable.

use sqlx::postgres::{PgPool, PgPoolOptions};

/// The embedded schema DDL.
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from storage setup.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The pool could not be created or the DDL failed.
    #[error("storage setup error: {0}")]
    Setup(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Setup(e.to_string())
    }
}

/// Connect a shared pool to `dsn`.
pub async fn connect_pool(dsn: &str, max_connections: u32) -> Result<PgPool, StorageError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .connect(dsn)
        .await?;
    Ok(pool)
}

/// Apply the embedded schema. Idempotent; every statement is
/// `IF NOT EXISTS`.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StorageError> {
    for chunk in SCHEMA_SQL.split(';') {
        // Drop comment lines so a leading comment does not hide a statement.
        let statement: String = chunk
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("storage schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_carries_every_contract_table() {
        for table in [
            "event_outbox",
            "answer_analysis",
            "trait_history",
            "onboarding_sessions",
            "user_answers",
            "digital_personality",
            "user_context_stories",
            "questions_metadata",
        ] {
            assert!(
                SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn schema_carries_the_contract_indexes() {
        for index in [
            "idx_event_outbox_pending",
            "idx_answer_analysis_vectorization",
            "idx_answer_analysis_dp_update",
            "idx_answer_analysis_processed_at",
            "idx_onboarding_sessions_user_status",
        ] {
            assert!(SCHEMA_SQL.contains(index), "missing index {index}");
        }
    }

    #[test]
    fn statements_split_cleanly() {
        let statements: Vec<&str> = SCHEMA_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        assert!(statements.len() >= 15);
    }
}
