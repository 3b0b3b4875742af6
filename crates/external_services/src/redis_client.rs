//! Shared Redis client for the liquidation snapshot cache and broadcast channel.
//!
//! The cache is authoritative for the derived blobs: read endpoints never
//! rebuild them from upstream on a miss. Every derived key carries a TTL at
//! least as long as the refresh interval so readers cannot observe a
//! missing-key window in a healthy steady state.
//!
//! # Key structure
//!
//! - `liquidations:all-data` -> composite per-period blob
//! - `liquidations:stats:all` -> per-period statistics
//! - `liquidations:chart:{period}` -> per-period time buckets
//! - `liquidations:recent:{h}h:{limit}` -> cached recent page
//! - `liquidations:sse:last-tid` -> monotonic last-observed event id (no TTL)
//! - `liquidations:sse:broadcast` -> pub/sub channel for new-event batches

use crate::error::Result;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Composite blob holding stats + chart for every period.
pub const KEY_ALL_DATA: &str = "liquidations:all-data";

/// Per-period statistics blob.
pub const KEY_STATS_ALL: &str = "liquidations:stats:all";

/// Monotonic marker: highest `tid` observed by any refresh pass.
pub const KEY_LAST_TID: &str = "liquidations:sse:last-tid";

/// Pub/sub channel carrying new-event batches to every process instance.
pub const BROADCAST_CHANNEL: &str = "liquidations:sse:broadcast";

/// Cache key for one period's chart blob.
pub fn chart_key(period: &str) -> String {
    format!("liquidations:chart:{}", period)
}

/// Cache key for a recent page lookback.
pub fn recent_key(hours: u32, limit: u32) -> String {
    format!("liquidations:recent:{}h:{}", hours, limit)
}

/// Shared Redis client wrapper for cache and pub/sub operations.
#[derive(Clone)]
pub struct CacheClient {
    client: Arc<redis::Client>,
}

impl CacheClient {
    /// Create a new cache client.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Get an async connection.
    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Get and deserialize a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.get_connection().await?;
        let json: Option<String> = conn.get(key).await?;

        match json {
            Some(j) => {
                let value: T = serde_json::from_str(&j)?;
                debug!("cache hit for '{}'", key);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Serialize and store a JSON value with a TTL.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(value)?;

        conn.set_ex::<_, _, ()>(key, &json, ttl.as_secs()).await?;
        debug!("cached '{}' (ttl {}s)", key, ttl.as_secs());

        Ok(())
    }

    /// Read the last-observed event id marker. Unset reads as 0.
    pub async fn get_last_tid(&self) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let tid: Option<u64> = conn.get(KEY_LAST_TID).await?;
        Ok(tid.unwrap_or(0))
    }

    /// Advance the last-observed event id marker. The marker never decreases;
    /// a stale write is discarded and the stored value returned.
    pub async fn set_last_tid_max(&self, tid: u64) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let current: Option<u64> = conn.get(KEY_LAST_TID).await?;
        let current = current.unwrap_or(0);

        if tid <= current {
            return Ok(current);
        }

        conn.set::<_, _, ()>(KEY_LAST_TID, tid).await?;
        debug!("advanced last-tid marker {} -> {}", current, tid);
        Ok(tid)
    }

    /// Publish a payload on a pub/sub channel. Fire-and-forget from the
    /// caller's perspective; subscriber count is ignored.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection for subscribing.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        let pubsub = self.client.get_async_pubsub().await?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(chart_key("4h"), "liquidations:chart:4h");
        assert_eq!(recent_key(2, 100), "liquidations:recent:2h:100");
        assert_eq!(KEY_LAST_TID, "liquidations:sse:last-tid");
        assert_eq!(BROADCAST_CHANNEL, "liquidations:sse:broadcast");
    }
}
