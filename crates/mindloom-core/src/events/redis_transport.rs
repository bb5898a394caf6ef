//! Redis Streams transport.
//!
//! One physical stream per priority lane, consumer groups via
//! XREADGROUP/XACK, stale-entry reclaim via XPENDING + XCLAIM. Entry bodies
//! are a single `envelope` field carrying the wire-form JSON.

use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{aio::ConnectionManager, AsyncCommands, Client};

use super::transport::{BusError, BusTransport, StreamEntry};

/// Field name carrying the envelope inside a stream entry.
const ENVELOPE_FIELD: &str = "envelope";

/// Redis Streams implementation of [`BusTransport`].
#[derive(Clone)]
pub struct RedisTransport {
    conn: ConnectionManager,
}

impl RedisTransport {
    /// Connect to the bus at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = Client::open(redis_url)
            .map_err(|e| BusError::TransportUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BusError::TransportUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn map_err(e: redis::RedisError) -> BusError {
        BusError::TransportUnavailable(e.to_string())
    }

    fn entry_body(map: &std::collections::HashMap<String, redis::Value>) -> Option<String> {
        map.get(ENVELOPE_FIELD)
            .and_then(|v| redis::from_redis_value::<String>(v).ok())
    }
}

#[async_trait]
impl BusTransport for RedisTransport {
    async fn append(&self, stream: &str, body: &str) -> Result<String, BusError> {
        let mut conn = self.conn.clone();
        conn.xadd(stream, "*", &[(ENVELOPE_FIELD, body)])
            .await
            .map_err(Self::map_err)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(()) => Ok(()),
            // The group already existing is the steady state.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Self::map_err(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(100);

        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(Self::map_err)?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                if let Some(body) = Self::entry_body(&id.map) {
                    entries.push(StreamEntry {
                        id: id.id,
                        body,
                        delivery_count: 1,
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, group, &[entry_id])
            .await
            .map_err(Self::map_err)?;
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
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as usize;

        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(Self::map_err)?;

        let mut stale: Vec<(String, u32)> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms as usize >= min_idle_ms)
            .map(|p| (p.id, p.times_delivered as u32))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        stale.sort();

        let ids: Vec<&str> = stale.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await
            .map_err(Self::map_err)?;

        let counts: std::collections::HashMap<&str, u32> = stale
            .iter()
            .map(|(id, times)| (id.as_str(), *times))
            .collect();

        let mut entries = Vec::new();
        for id in claimed.ids {
            if let Some(body) = Self::entry_body(&id.map) {
                // XCLAIM itself counts as a delivery.
                let delivery_count = counts.get(id.id.as_str()).copied().unwrap_or(0) + 1;
                entries.push(StreamEntry {
                    id: id.id,
                    body,
                    delivery_count,
                });
            }
        }
        Ok(entries)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        conn.xlen(stream).await.map_err(Self::map_err)
    }
}
