//! Bus transport abstraction.
//!
//! The event bus is a library over an append-only stream log with consumer
//! groups. [`BusTransport`] is the seam: production uses Redis Streams,
//! tests use [`MemoryTransport`], which models the same semantics —
//! append order, per-group cursors, pending entries with delivery counts,
//! and idle-based reclaim.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Publisher/consumer failure kinds surfaced by the bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The transport could not be reached or errored.
    #[error("bus transport unavailable: {0}")]
    TransportUnavailable(String),
    /// The payload exceeds the size limit even after compression.
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge {
        /// Observed size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// The envelope could not be encoded or decoded.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// One delivered stream entry.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Transport-assigned entry id (distinct from the envelope's event id).
    pub id: String,
    /// Wire-form envelope.
    pub body: String,
    /// How many times this entry has been delivered to the group.
    pub delivery_count: u32,
}

/// Append-only stream log with consumer groups and explicit ACK.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Append a body to a stream. Returns the transport entry id.
    async fn append(&self, stream: &str, body: &str) -> Result<String, BusError>;

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    /// Read up to `count` new entries for `(group, consumer)`.
    ///
    /// Delivered entries become pending until ACKed. May return fewer than
    /// `count` entries, including none.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), BusError>;

    /// Re-deliver pending entries idle longer than `min_idle` to `consumer`.
    ///
    /// Each claim increments the entry's delivery count.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError>;

    /// Number of entries in a stream.
    async fn stream_len(&self, stream: &str) -> Result<u64, BusError>;
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<(String, String)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

/// In-process transport with Redis Streams semantics, for tests and
/// single-process deployments.
#[derive(Default)]
pub struct MemoryTransport {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl MemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries still pending for a group. Test helper.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn append(&self, stream: &str, body: &str) -> Result<String, BusError> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push((id.clone(), body.to_string()));
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut streams = self.streams.lock();
        let state = match streams.get_mut(stream) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };
        let group_state = state.groups.entry(group.to_string()).or_default();

        let mut delivered = Vec::new();
        while group_state.cursor < state.entries.len() && delivered.len() < count {
            let (id, body) = state.entries[group_state.cursor].clone();
            group_state.cursor += 1;
            group_state.pending.insert(
                id.clone(),
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            delivered.push(StreamEntry {
                id,
                body,
                delivery_count: 1,
            });
        }
        Ok(delivered)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), BusError> {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(entry_id);
            }
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut streams = self.streams.lock();
        let state = match streams.get_mut(stream) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };
        let bodies: HashMap<&str, &str> = state
            .entries
            .iter()
            .map(|(id, body)| (id.as_str(), body.as_str()))
            .collect();

        let group_state = match state.groups.get_mut(group) {
            Some(group_state) => group_state,
            None => return Ok(Vec::new()),
        };

        let mut claimed = Vec::new();
        // Stable claim order: oldest entry ids first.
        let mut stale_ids: Vec<String> = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.delivered_at.elapsed() >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        stale_ids.sort();

        for id in stale_ids.into_iter().take(count) {
            let pending = group_state.pending.get_mut(&id).expect("stale id present");
            pending.consumer = consumer.to_string();
            pending.delivered_at = Instant::now();
            pending.delivery_count += 1;
            if let Some(body) = bodies.get(id.as_str()) {
                claimed.push(StreamEntry {
                    id: id.clone(),
                    body: body.to_string(),
                    delivery_count: pending.delivery_count,
                });
            }
        }
        Ok(claimed)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, BusError> {
        Ok(self
            .streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }
}
