//! Transactional outbox.
//!
//! Makes "commit business row + publish event" atomic without two-phase
//! commit: the event row is inserted in the caller's transaction, and a
//! background relay drains PENDING rows to the event bus with exponential
//! backoff, failing rows into an in-table DLQ after `max_retries`.

mod cleaner;
mod publisher;
mod relay;
mod store;

pub use cleaner::OutboxCleaner;
pub use publisher::OutboxPublisher;
pub use relay::{OutboxRelay, RelayConfig, RelayStats};
pub use store::{
    MemoryOutboxStore, OutboxError, OutboxRow, OutboxStatus, OutboxStore, PgOutboxStore,
    MAX_ERROR_LEN,
};
