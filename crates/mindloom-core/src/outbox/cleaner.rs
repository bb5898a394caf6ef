//! Outbox housekeeping.
//!
//! Deletes terminal rows after their retention window and supports manual
//! recovery of FAILED rows. Meant to run periodically, e.g. once a day.

use std::sync::Arc;

use super::store::{OutboxError, OutboxRow, OutboxStore};

/// Retention defaults.
const PUBLISHED_RETENTION_DAYS: i64 = 7;
const FAILED_RETENTION_DAYS: i64 = 30;

/// Housekeeping utility for the outbox table.
pub struct OutboxCleaner {
    store: Arc<dyn OutboxStore>,
    published_retention_days: i64,
    failed_retention_days: i64,
}

impl OutboxCleaner {
    /// Create a cleaner with default retention (7 days published, 30 days
    /// failed).
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self {
            store,
            published_retention_days: PUBLISHED_RETENTION_DAYS,
            failed_retention_days: FAILED_RETENTION_DAYS,
        }
    }

    /// Override the retention windows.
    pub fn with_retention(mut self, published_days: i64, failed_days: i64) -> Self {
        self.published_retention_days = published_days;
        self.failed_retention_days = failed_days;
        self
    }

    /// Delete PUBLISHED rows past retention. Returns rows removed.
    pub async fn cleanup_published(&self) -> Result<u64, OutboxError> {
        let removed = self
            .store
            .delete_published_older_than(self.published_retention_days)
            .await?;
        tracing::info!(
            removed,
            older_than_days = self.published_retention_days,
            "outbox cleanup: published rows removed"
        );
        Ok(removed)
    }

    /// Delete FAILED rows past retention. Returns rows removed.
    pub async fn cleanup_failed(&self) -> Result<u64, OutboxError> {
        let removed = self
            .store
            .delete_failed_older_than(self.failed_retention_days)
            .await?;
        tracing::info!(
            removed,
            older_than_days = self.failed_retention_days,
            "outbox cleanup: failed rows removed"
        );
        Ok(removed)
    }

    /// FAILED rows for inspection, newest first.
    pub async fn failed_events(&self, limit: i64) -> Result<Vec<OutboxRow>, OutboxError> {
        self.store.list_failed(limit).await
    }

    /// Reset a FAILED row to PENDING with `retry_count = 0` so the relay
    /// picks it up again. Returns false when the row is absent or not
    /// FAILED.
    pub async fn retry_failed_event(&self, id: i64) -> Result<bool, OutboxError> {
        let reset = self.store.retry_failed(id).await?;
        if reset {
            tracing::info!(outbox_id = id, "outbox event retry scheduled");
        } else {
            tracing::warn!(outbox_id = id, "outbox event not found or not failed");
        }
        Ok(reset)
    }
}
