//! Same-transaction event publishing.
//!
//! `publish` inserts the outbox row through the caller's open transaction:
//! if the business write rolls back, no event exists; once it commits, the
//! relay guarantees at-least-once delivery to the bus.

use sqlx::PgExecutor;

use super::store::OutboxError;

/// Publishes events into the `event_outbox` table.
///
/// ```rust,ignore
/// let mut tx = pool.begin().await?;
/// let answer_id = save_answer(&mut *tx, &answer).await?;
/// outbox
///     .publish(
///         &mut *tx,
///         "user.answer.submitted",
///         json!({ "answer_id": answer_id, "user_id": user_id }),
///         Some(&trace_id),
///     )
///     .await?;
/// tx.commit().await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct OutboxPublisher;

impl OutboxPublisher {
    /// Create a publisher.
    pub fn new() -> Self {
        Self
    }

    /// Insert one PENDING row through `executor`. Returns the row id.
    ///
    /// Pass `&mut *tx` to make the insert part of the caller's transaction.
    pub async fn publish<'e, E>(
        &self,
        executor: E,
        event_type: &str,
        payload: serde_json::Value,
        trace_id: Option<&str>,
    ) -> Result<i64, OutboxError>
    where
        E: PgExecutor<'e>,
    {
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
        .fetch_one(executor)
        .await?;

        tracing::debug!(
            event_type,
            outbox_id = id,
            trace_id = trace_id.unwrap_or(""),
            "outbox event saved"
        );
        Ok(id)
    }

    /// Insert several rows through one connection. Returns their ids in
    /// order.
    pub async fn publish_batch(
        &self,
        conn: &mut sqlx::PgConnection,
        events: &[(String, serde_json::Value)],
    ) -> Result<Vec<i64>, OutboxError> {
        let mut ids = Vec::with_capacity(events.len());
        for (event_type, payload) in events {
            let id = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO event_outbox (event_type, payload, status, retry_count, created_at)
                VALUES ($1, $2, 'pending', 0, NOW())
                RETURNING id
                "#,
            )
            .bind(event_type)
            .bind(payload)
            .fetch_one(&mut *conn)
            .await?;
            ids.push(id);
        }

        tracing::debug!(count = events.len(), "outbox batch saved");
        Ok(ids)
    }
}
